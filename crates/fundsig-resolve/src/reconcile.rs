use std::collections::{BTreeMap, BTreeSet};

use fundsig_core::{
    weighted_confidence, Conflict, ExtractionCandidate, FieldData, FieldMap, FieldMapExt,
    FieldName, FieldValue, FundingPattern, RelevanceBreakdown, ResolutionMethod,
    ResolvedOpportunity, RoutingStatus, SuitabilityFlags, UrgencyLevel,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Resolved confidence ceiling for values nobody could decide on.
pub const MANUAL_REVIEW_CAP: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    pub conflict_margin: f64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            conflict_margin: 0.15,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error("no candidates to reconcile")]
    NoCandidates,
    #[error("candidates belong to different raw items: {expected} and {found}")]
    MixedRawItems { expected: String, found: String },
}

#[derive(Debug, Clone, Copy)]
struct Resolution {
    winner: usize,
    confidence: f64,
    method: Option<ResolutionMethod>,
}

/// Picks one value among possibly disagreeing ones. `method` is `None` when all agree.
fn resolve_values(values: &[FieldValue], margin: f64) -> Resolution {
    let mut clusters: Vec<Vec<usize>> = Vec::new();
    for (idx, value) in values.iter().enumerate() {
        match clusters
            .iter_mut()
            .find(|cluster| values[cluster[0]].value.agrees_with(&value.value))
        {
            Some(cluster) => cluster.push(idx),
            None => clusters.push(vec![idx]),
        }
    }

    // Best member per cluster; ties keep the earliest value.
    let best_of = |cluster: &[usize]| -> usize {
        cluster
            .iter()
            .copied()
            .fold(cluster[0], |best, idx| {
                if values[idx].confidence > values[best].confidence {
                    idx
                } else {
                    best
                }
            })
    };
    // Votes are distinct extractors, so one profile matching twice counts once.
    let voters = |members: &[usize]| -> usize {
        members
            .iter()
            .map(|idx| values[*idx].source_extractor.as_str())
            .collect::<BTreeSet<_>>()
            .len()
    };
    let mut ranked: Vec<(usize, usize)> = clusters
        .iter()
        .map(|cluster| (best_of(cluster), voters(cluster)))
        .collect();
    ranked.sort_by(|(a, _), (b, _)| {
        values[*b]
            .confidence
            .total_cmp(&values[*a].confidence)
            .then(a.cmp(b))
    });

    let (top, _) = ranked[0];
    if ranked.len() == 1 {
        return Resolution {
            winner: top,
            confidence: values[top].confidence,
            method: None,
        };
    }

    let (runner_up, _) = ranked[1];
    if values[top].confidence - values[runner_up].confidence > margin {
        return Resolution {
            winner: top,
            confidence: values[top].confidence,
            method: Some(ResolutionMethod::HigherConfidence),
        };
    }

    let all: Vec<usize> = (0..values.len()).collect();
    if voters(&all) >= 3 {
        let largest = ranked.iter().map(|(_, size)| *size).max().unwrap_or(0);
        let mut at_largest = ranked.iter().filter(|(_, size)| *size == largest);
        if let (Some((winner, _)), None) = (at_largest.next(), at_largest.next()) {
            return Resolution {
                winner: *winner,
                confidence: values[*winner].confidence,
                method: Some(ResolutionMethod::MajorityVote),
            };
        }
    }

    Resolution {
        winner: top,
        confidence: values[top].confidence.min(MANUAL_REVIEW_CAP),
        method: Some(ResolutionMethod::ManualReview),
    }
}

fn conflict_for(name: FieldName, values: &[FieldValue], resolution: Resolution) -> Option<Conflict> {
    let method = resolution.method?;
    debug!(
        field = %name,
        values = values.len(),
        method = ?method,
        resolved_confidence = resolution.confidence,
        "field conflict resolved"
    );
    Some(Conflict {
        field_name: name,
        candidate_values: values.to_vec(),
        resolution_method: method,
        resolved_value: values[resolution.winner].value.clone(),
        resolved_confidence: resolution.confidence,
    })
}

/// Merges every candidate for one raw item into a single `pending` record.
pub fn reconcile(
    candidates: &[ExtractionCandidate],
    config: &ReconcileConfig,
) -> Result<ResolvedOpportunity, ReconcileError> {
    let first = candidates.first().ok_or(ReconcileError::NoCandidates)?;
    if let Some(stray) = candidates.iter().find(|c| c.raw_item_id != first.raw_item_id) {
        return Err(ReconcileError::MixedRawItems {
            expected: first.raw_item_id.clone(),
            found: stray.raw_item_id.clone(),
        });
    }

    let mut fields = FieldMap::new();
    let mut conflicts = Vec::new();

    let mut by_name: BTreeMap<FieldName, Vec<FieldValue>> = BTreeMap::new();
    for candidate in candidates {
        for (name, value) in &candidate.fields {
            if name.is_per_project_amount() || *name == FieldName::FundingAmount {
                continue;
            }
            by_name.entry(*name).or_default().push(value.clone());
        }
    }
    for (name, values) in by_name {
        let resolution = resolve_values(&values, config.conflict_margin);
        let mut resolved = values[resolution.winner].clone();
        resolved.confidence = resolution.confidence;
        fields.insert(name, resolved);
        conflicts.extend(conflict_for(name, &values, resolution));
    }

    // Per-project amounts are compared as whole claims so a range and an exact
    // figure for the same item surface as one conflict.
    let mut claims = Vec::new();
    let mut claim_owners = Vec::new();
    for candidate in candidates {
        let Some((claim, confidence)) = candidate.fields.per_project_claim() else {
            continue;
        };
        let evidence = candidate
            .fields
            .get(&FieldName::ExactAmountPerProject)
            .or_else(|| candidate.fields.get(&FieldName::MinAmountPerProject))
            .and_then(|f| f.evidence.clone());
        claims.push(FieldValue {
            value: FieldData::Claim(claim),
            confidence,
            source_extractor: candidate.extractor_version.clone(),
            evidence,
        });
        claim_owners.push(candidate);
    }
    if !claims.is_empty() {
        let resolution = resolve_values(&claims, config.conflict_margin);
        let owner = claim_owners[resolution.winner];
        for (name, value) in owner.fields.iter().filter(|(n, _)| n.is_per_project_amount()) {
            let mut stored = value.clone();
            stored.confidence = stored.confidence.min(resolution.confidence);
            fields.insert(*name, stored);
        }
        conflicts.extend(conflict_for(FieldName::FundingAmount, &claims, resolution));
    }

    let funding_pattern = pick_pattern(candidates, &fields);
    let evidence_ceiling = candidates
        .iter()
        .map(|c| c.overall_confidence)
        .fold(0.0, f64::max);
    let overall_confidence = weighted_confidence(&fields).min(evidence_ceiling);
    let notes: BTreeSet<String> = candidates.iter().flat_map(|c| c.notes.iter().cloned()).collect();

    Ok(ResolvedOpportunity {
        raw_item_id: first.raw_item_id.clone(),
        content_hash: None,
        funding_pattern,
        fields,
        conflicts,
        overall_confidence,
        evidence_ceiling,
        urgency_level: UrgencyLevel::Unknown,
        suitability_flags: SuitabilityFlags::default(),
        relevance: RelevanceBreakdown::default(),
        status: RoutingStatus::Pending,
        near_duplicate_of: None,
        candidate_ids: candidates.iter().map(|c| c.id).collect(),
        notes: notes.into_iter().collect(),
    })
}

/// Family with the highest aggregate shape confidence among those whose amounts survived.
fn pick_pattern(candidates: &[ExtractionCandidate], fields: &FieldMap) -> FundingPattern {
    let survived = |pattern: FundingPattern| {
        let shape = pattern.shape_fields();
        !shape.is_empty() && shape.iter().all(|name| fields.amount(*name).is_some())
    };
    let mut aggregate: BTreeMap<FundingPattern, f64> = BTreeMap::new();
    for candidate in candidates {
        if survived(candidate.funding_pattern) {
            *aggregate.entry(candidate.funding_pattern).or_default() += candidate.shape_confidence();
        }
    }
    aggregate
        .into_iter()
        .max_by(|(pa, a), (pb, b)| {
            a.total_cmp(b)
                .then(pa.specificity_rank().cmp(&pb.specificity_rank()))
        })
        .map(|(pattern, _)| pattern)
        .unwrap_or(FundingPattern::Unknown)
}
