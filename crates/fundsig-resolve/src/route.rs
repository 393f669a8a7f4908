use chrono::{DateTime, Utc};
use fundsig_core::{
    CandidateScore, ExtractionCandidate, FieldMapExt, FundingPattern, RejectionCategory,
    RejectionRecord, ResolvedOpportunity, RoutingStatus, TransitionError, ID_NAMESPACE,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    pub min_confidence_auto_approve: f64,
    pub min_confidence_reject: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            min_confidence_auto_approve: 0.8,
            min_confidence_reject: 0.6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub status: RoutingStatus,
    pub reason: String,
    pub category: Option<RejectionCategory>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoutingOutcome {
    pub status: RoutingStatus,
    pub reason: String,
    pub rejection: Option<RejectionRecord>,
}

/// Terminal state for a scored record. First matching rule wins.
pub fn decide(resolved: &ResolvedOpportunity, config: &RouterConfig) -> Decision {
    let confidence = resolved.overall_confidence;
    // Capped manual-review confidence must reach a human, not the low-confidence bucket.
    if resolved.fields.has_amount() {
        if let Some(conflict) = resolved
            .review_conflicts()
            .find(|c| c.field_name.is_high_impact())
        {
            return Decision {
                status: RoutingStatus::HumanReview,
                reason: format!("unresolved conflict on {}", conflict.field_name),
                category: None,
            };
        }
    }
    if confidence < config.min_confidence_reject {
        return Decision {
            status: RoutingStatus::RejectionDatabase,
            reason: format!(
                "overall confidence {confidence:.2} below rejection threshold {:.2}",
                config.min_confidence_reject
            ),
            category: Some(RejectionCategory::LowConfidence),
        };
    }
    if resolved.funding_pattern == FundingPattern::Unknown || !resolved.fields.has_amount() {
        return Decision {
            status: RoutingStatus::RejectionDatabase,
            reason: "no funding amount or recognizable funding shape".to_string(),
            category: Some(RejectionCategory::NotFunding),
        };
    }
    if confidence < config.min_confidence_auto_approve {
        return Decision {
            status: RoutingStatus::CommunityReview,
            reason: format!(
                "overall confidence {confidence:.2} below auto-approve threshold {:.2}",
                config.min_confidence_auto_approve
            ),
            category: None,
        };
    }
    if let Some(conflict) = resolved.review_conflicts().next() {
        return Decision {
            status: RoutingStatus::CommunityReview,
            reason: format!("unresolved conflict on {}", conflict.field_name),
            category: None,
        };
    }
    if let Some(original) = &resolved.near_duplicate_of {
        return Decision {
            status: RoutingStatus::CommunityReview,
            reason: format!("suspected near-duplicate of {original}"),
            category: None,
        };
    }
    Decision {
        status: RoutingStatus::AutoApproved,
        reason: format!("overall confidence {confidence:.2} with no open conflicts"),
        category: None,
    }
}

fn learning_value(
    category: RejectionCategory,
    resolved: &ResolvedOpportunity,
    candidates: &[ExtractionCandidate],
    config: &RouterConfig,
) -> f64 {
    match category {
        RejectionCategory::LowConfidence if config.min_confidence_reject > 0.0 => {
            (resolved.overall_confidence / config.min_confidence_reject).clamp(0.0, 1.0)
        }
        RejectionCategory::LowConfidence => 0.0,
        RejectionCategory::NotFunding => {
            let had_signals = candidates
                .iter()
                .any(|c| c.funding_pattern != FundingPattern::Unknown || c.fields.has_amount());
            if had_signals {
                0.6
            } else {
                0.2
            }
        }
    }
}

/// Moves a pending record into its terminal state. Rejections carry everything needed
/// to re-run or learn from the item later.
pub fn route(
    resolved: &mut ResolvedOpportunity,
    candidates: &[ExtractionCandidate],
    source_text: &str,
    config: &RouterConfig,
    now: DateTime<Utc>,
) -> Result<RoutingOutcome, TransitionError> {
    let decision = decide(resolved, config);
    resolved.transition(decision.status)?;
    info!(
        raw_item_id = %resolved.raw_item_id,
        status = %decision.status,
        confidence = resolved.overall_confidence,
        reason = %decision.reason,
        "item routed"
    );

    let rejection = decision.category.map(|category| {
        let key = format!(
            "rejection:{}:{}",
            resolved.raw_item_id,
            resolved.content_hash.as_deref().unwrap_or("")
        );
        RejectionRecord {
            id: Uuid::new_v5(&ID_NAMESPACE, key.as_bytes()),
            raw_item_id: resolved.raw_item_id.clone(),
            content_hash: resolved.content_hash.clone(),
            resolved_opportunity_snapshot: resolved.clone(),
            candidate_scores: candidates.iter().map(CandidateScore::from).collect(),
            candidates: candidates.to_vec(),
            source_text: source_text.to_string(),
            rejection_reason: decision.reason.clone(),
            rejection_category: category,
            human_decision: None,
            learning_value: learning_value(category, resolved, candidates, config),
            created_at: now,
        }
    });

    Ok(RoutingOutcome {
        status: decision.status,
        reason: decision.reason,
        rejection,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::{reconcile, ReconcileConfig};
    use crate::score::{score, ScoringConfig};
    use fundsig_core::{
        Conflict, Deadline, FieldData, FieldMap, FieldName, FieldValue, RelevanceBreakdown,
        ResolutionMethod, SuitabilityFlags, UrgencyLevel,
    };

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-10T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn field(data: FieldData, conf: f64) -> FieldValue {
        FieldValue::new(data, conf, "broad@1/lib-v1")
    }

    fn opportunity(confidence: f64) -> ResolvedOpportunity {
        let mut fields = FieldMap::new();
        fields.insert(FieldName::ExactAmountPerProject, field(FieldData::Amount(5e4), confidence));
        ResolvedOpportunity {
            raw_item_id: "item-1".into(),
            content_hash: Some("abc".into()),
            funding_pattern: FundingPattern::PerProjectExact,
            fields,
            conflicts: vec![],
            overall_confidence: confidence,
            evidence_ceiling: confidence,
            urgency_level: UrgencyLevel::Unknown,
            suitability_flags: SuitabilityFlags::default(),
            relevance: RelevanceBreakdown::default(),
            status: RoutingStatus::Pending,
            near_duplicate_of: None,
            candidate_ids: vec![],
            notes: vec![],
        }
    }

    fn review_conflict(name: FieldName) -> Conflict {
        Conflict {
            field_name: name,
            candidate_values: vec![],
            resolution_method: ResolutionMethod::ManualReview,
            resolved_value: FieldData::Text("x".into()),
            resolved_confidence: 0.5,
        }
    }

    #[test]
    fn low_confidence_is_rejected_with_learning_value() {
        let mut record = opportunity(0.55);
        let outcome = route(&mut record, &[], "text", &RouterConfig::default(), now()).unwrap();
        assert_eq!(outcome.status, RoutingStatus::RejectionDatabase);
        assert_eq!(record.status, RoutingStatus::RejectionDatabase);
        let rejection = outcome.rejection.unwrap();
        assert_eq!(rejection.rejection_category, RejectionCategory::LowConfidence);
        assert!((rejection.learning_value - 0.55 / 0.6).abs() < 1e-9);
        assert_eq!(rejection.resolved_opportunity_snapshot.status, RoutingStatus::RejectionDatabase);
        assert_eq!(rejection.source_text, "text");
    }

    #[test]
    fn missing_amount_is_not_funding() {
        let mut record = opportunity(0.9);
        record.fields.clear();
        record.funding_pattern = FundingPattern::Unknown;
        let outcome = route(&mut record, &[], "", &RouterConfig::default(), now()).unwrap();
        let rejection = outcome.rejection.unwrap();
        assert_eq!(rejection.rejection_category, RejectionCategory::NotFunding);
        assert_eq!(rejection.learning_value, 0.2);
    }

    #[test]
    fn high_impact_conflict_needs_a_human() {
        let mut record = opportunity(0.9);
        record.conflicts.push(review_conflict(FieldName::Deadline));
        assert_eq!(decide(&record, &RouterConfig::default()).status, RoutingStatus::HumanReview);
    }

    #[test]
    fn high_impact_conflict_outranks_low_confidence() {
        let mut record = opportunity(0.45);
        record.conflicts.push(review_conflict(FieldName::FundingAmount));
        let decision = decide(&record, &RouterConfig::default());
        assert_eq!(decision.status, RoutingStatus::HumanReview);
        assert_eq!(decision.category, None);

        record.fields.clear();
        record.funding_pattern = FundingPattern::Unknown;
        assert_eq!(decide(&record, &RouterConfig::default()).status, RoutingStatus::RejectionDatabase);
    }

    #[test]
    fn minor_conflict_or_near_duplicate_blocks_auto_approval() {
        let mut record = opportunity(0.9);
        assert_eq!(decide(&record, &RouterConfig::default()).status, RoutingStatus::AutoApproved);
        record.conflicts.push(review_conflict(FieldName::Geography));
        assert_eq!(decide(&record, &RouterConfig::default()).status, RoutingStatus::CommunityReview);
        record.conflicts.clear();
        record.near_duplicate_of = Some("item-0".into());
        assert_eq!(decide(&record, &RouterConfig::default()).status, RoutingStatus::CommunityReview);
    }

    #[test]
    fn middle_band_goes_to_community() {
        let record = opportunity(0.7);
        assert_eq!(decide(&record, &RouterConfig::default()).status, RoutingStatus::CommunityReview);
    }

    #[test]
    fn routed_records_cannot_be_routed_again() {
        let mut record = opportunity(0.9);
        route(&mut record, &[], "", &RouterConfig::default(), now()).unwrap();
        assert!(route(&mut record, &[], "", &RouterConfig::default(), now()).is_err());
        assert_eq!(record.status, RoutingStatus::AutoApproved);
    }

    #[test]
    fn range_and_exact_disagreement_is_escalated() {
        let mk = |extractor: &str, pattern, amounts: Vec<(FieldName, f64)>, conf: f64| {
            let mut fields = FieldMap::new();
            for (name, amount) in amounts {
                fields.insert(name, FieldValue::new(FieldData::Amount(amount), conf, extractor));
            }
            fields.insert(FieldName::Title, FieldValue::new(FieldData::Text("Regional grants".into()), 0.9, extractor));
            fields.insert(FieldName::Currency, FieldValue::new(FieldData::Currency("USD".into()), 0.9, extractor));
            fields.insert(
                FieldName::Deadline,
                FieldValue::new(
                    FieldData::Deadline(Deadline::Date(chrono::NaiveDate::from_ymd_opt(2026, 6, 15).unwrap())),
                    0.9,
                    extractor,
                ),
            );
            ExtractionCandidate {
                id: ExtractionCandidate::deterministic_id("item-1", extractor, pattern),
                raw_item_id: "item-1".into(),
                extractor_version: extractor.into(),
                funding_pattern: pattern,
                fields,
                overall_confidence: 0.85,
                notes: vec![],
            }
        };
        let candidates = vec![
            mk(
                "broad@1/lib-v1",
                FundingPattern::PerProjectRange,
                vec![(FieldName::MinAmountPerProject, 10_000.0), (FieldName::MaxAmountPerProject, 20_000.0)],
                0.85,
            ),
            mk(
                "strict@1/lib-v1",
                FundingPattern::PerProjectExact,
                vec![(FieldName::ExactAmountPerProject, 15_000.0)],
                0.8,
            ),
        ];
        let resolved = reconcile(&candidates, &ReconcileConfig::default()).unwrap();
        let mut scored = score(resolved, &ScoringConfig::default(), now());
        assert!(scored.overall_confidence >= 0.6);
        let outcome = route(&mut scored, &candidates, "", &RouterConfig::default(), now()).unwrap();
        assert_eq!(outcome.status, RoutingStatus::HumanReview);
        assert!(outcome.rejection.is_none());
        assert!(scored.review_conflicts().any(|c| c.field_name == FieldName::FundingAmount));
    }
}
