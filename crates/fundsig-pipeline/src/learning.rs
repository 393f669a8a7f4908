//! Rule feedback from human validation outcomes.

use std::collections::{BTreeMap, HashMap};

use fundsig_core::{
    ExtractionCandidate, FieldData, FieldMap, FieldName, HumanValidation, PatternLibrary,
    ProcessedRecord, RejectionRecord, ValidationDecision,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LearningConfig {
    pub min_samples: u64,
    pub success_floor: f64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            min_samples: 10,
            success_floor: 0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum LearningUpdateError {
    #[error("validation references unknown record {record_id}")]
    UnknownRecord { record_id: String },
    #[error("needs_edit validation for {record_id} carries no corrected fields")]
    MissingCorrections { record_id: String },
    #[error("correction for {field} on {record_id} is {found}, expected {expected}")]
    WrongFieldKind {
        record_id: String,
        field: FieldName,
        expected: &'static str,
        found: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LearningReport {
    pub library: PatternLibrary,
    pub applied: usize,
    pub skipped: Vec<LearningUpdateError>,
    pub deactivated: Vec<String>,
}

/// What the learning loop needs from a routed item: its candidates and final fields.
struct RecordView<'a> {
    candidates: &'a [ExtractionCandidate],
    resolved_fields: &'a FieldMap,
}

#[derive(Debug, Clone, Default)]
pub struct LearningLoop {
    config: LearningConfig,
}

impl LearningLoop {
    pub fn new(config: LearningConfig) -> Self {
        Self { config }
    }

    /// Validations from the log plus rejections carrying a human decision. Rejection-sourced
    /// entries are addressed by rejection id.
    pub fn collect_validations(
        rejections: &[RejectionRecord],
        validations: &[HumanValidation],
    ) -> Vec<HumanValidation> {
        let mut all = validations.to_vec();
        all.extend(rejections.iter().filter_map(|r| {
            r.human_decision.map(|decision| HumanValidation {
                record_id: r.id.to_string(),
                decision,
                corrected_fields: BTreeMap::new(),
                validated_at: None,
            })
        }));
        all
    }

    /// Applies one batch and returns the next library version. Bad validations are skipped.
    pub fn update(
        &self,
        library: &PatternLibrary,
        rejections: &[RejectionRecord],
        validations: &[HumanValidation],
        processed: &[ProcessedRecord],
    ) -> LearningReport {
        let rejection_ids: Vec<String> = rejections.iter().map(|r| r.id.to_string()).collect();
        let mut views: HashMap<&str, RecordView<'_>> = HashMap::new();
        for record in processed {
            let view = || RecordView {
                candidates: &record.candidates,
                resolved_fields: &record.resolved.fields,
            };
            views.insert(record.resolved.raw_item_id.as_str(), view());
            if let Some(hash) = record.resolved.content_hash.as_deref() {
                views.insert(hash, view());
            }
        }
        for (record, id) in rejections.iter().zip(&rejection_ids) {
            let view = || RecordView {
                candidates: &record.candidates,
                resolved_fields: &record.resolved_opportunity_snapshot.fields,
            };
            views.insert(id.as_str(), view());
            views.entry(record.raw_item_id.as_str()).or_insert_with(view);
        }

        let mut next = library.clone();
        next.version = library.version + 1;
        let mut applied = 0;
        let mut skipped = Vec::new();

        for validation in Self::collect_validations(rejections, validations) {
            let outcomes = match views
                .get(validation.record_id.as_str())
                .ok_or_else(|| LearningUpdateError::UnknownRecord {
                    record_id: validation.record_id.clone(),
                })
                .and_then(|view| rule_outcomes(&validation, view))
            {
                Ok(outcomes) => outcomes,
                Err(err) => {
                    warn!(record_id = %validation.record_id, error = %err, "skipping validation");
                    skipped.push(err);
                    continue;
                }
            };
            for (rule_id, agreed) in outcomes {
                match next.rule_mut(&rule_id) {
                    Some(rule) => rule.record_outcome(agreed),
                    None => warn!(%rule_id, "evidence names a rule missing from the library"),
                }
            }
            applied += 1;
        }

        let mut deactivated = Vec::new();
        for rule in next.rules.iter_mut().filter(|r| r.is_active) {
            if rule.times_applied >= self.config.min_samples
                && rule.success_rate < self.config.success_floor
            {
                rule.is_active = false;
                deactivated.push(rule.id.clone());
            }
        }

        info!(
            version = next.version,
            applied,
            skipped = skipped.len(),
            deactivated = deactivated.len(),
            "learning batch applied"
        );
        LearningReport {
            library: next,
            applied,
            skipped,
            deactivated,
        }
    }
}

/// Per-rule agreement for one validation. A rule counts once even if it fed several fields.
fn rule_outcomes(
    validation: &HumanValidation,
    view: &RecordView<'_>,
) -> Result<BTreeMap<String, bool>, LearningUpdateError> {
    if validation.decision == ValidationDecision::NeedsEdit && validation.corrected_fields.is_empty() {
        return Err(LearningUpdateError::MissingCorrections {
            record_id: validation.record_id.clone(),
        });
    }
    for (field, data) in &validation.corrected_fields {
        let expected = FieldData::expected_kind(*field);
        if data.kind() != expected {
            return Err(LearningUpdateError::WrongFieldKind {
                record_id: validation.record_id.clone(),
                field: *field,
                expected,
                found: data.kind(),
            });
        }
    }

    let mut outcomes: BTreeMap<String, bool> = BTreeMap::new();
    for candidate in view.candidates {
        for (name, value) in &candidate.fields {
            let Some(evidence) = value.evidence.as_ref() else {
                continue;
            };
            let contributed = view
                .resolved_fields
                .get(name)
                .is_some_and(|resolved| resolved.value.agrees_with(&value.value));
            if !contributed {
                continue;
            }
            let agreed = match validation.decision {
                ValidationDecision::Reject => false,
                ValidationDecision::Approve | ValidationDecision::NeedsEdit => validation
                    .corrected_fields
                    .get(name)
                    .map_or(true, |corrected| corrected.agrees_with(&value.value)),
            };
            outcomes
                .entry(evidence.rule_id.clone())
                .and_modify(|all| *all &= agreed)
                .or_insert(agreed);
        }
    }
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use fundsig_core::{
        Evidence, FieldValue, FundingPattern, Matcher, PatternRule, PatternType,
        RelevanceBreakdown, ResolvedOpportunity, RoutingStatus, SuitabilityFlags, UrgencyLevel,
    };

    fn rule(id: &str, pattern_type: PatternType) -> PatternRule {
        PatternRule {
            id: id.into(),
            pattern_type,
            matcher: Matcher::Regex {
                pattern: "x".into(),
            },
            confidence_prior: 0.8,
            times_applied: 0,
            successes: 0,
            success_rate: 0.0,
            is_active: true,
            description: None,
        }
    }

    fn library() -> PatternLibrary {
        PatternLibrary {
            version: 3,
            rules: vec![
                rule("exact.dollars", PatternType::PerProjectExact),
                rule("deadline.month_day", PatternType::Deadline),
            ],
        }
    }

    fn evidenced(data: FieldData, rule_id: &str) -> FieldValue {
        FieldValue::new(data, 0.9, "broad@1/lib-v3").with_evidence(Evidence {
            rule_id: rule_id.into(),
            start: 0,
            end: 5,
            snippet: "x".into(),
        })
    }

    fn processed(raw_item_id: &str) -> ProcessedRecord {
        let mut fields = FieldMap::new();
        fields.insert(
            FieldName::ExactAmountPerProject,
            evidenced(FieldData::Amount(50_000.0), "exact.dollars"),
        );
        fields.insert(
            FieldName::Currency,
            evidenced(FieldData::Currency("USD".into()), "exact.dollars"),
        );
        fields.insert(
            FieldName::Deadline,
            evidenced(
                FieldData::Deadline(fundsig_core::Deadline::Date(
                    chrono::NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
                )),
                "deadline.month_day",
            ),
        );
        let candidate = ExtractionCandidate {
            id: ExtractionCandidate::deterministic_id(
                raw_item_id,
                "broad@1/lib-v3",
                FundingPattern::PerProjectExact,
            ),
            raw_item_id: raw_item_id.into(),
            extractor_version: "broad@1/lib-v3".into(),
            funding_pattern: FundingPattern::PerProjectExact,
            fields: fields.clone(),
            overall_confidence: 0.9,
            notes: vec![],
        };
        ProcessedRecord {
            resolved: ResolvedOpportunity {
                raw_item_id: raw_item_id.into(),
                content_hash: Some(format!("hash-{raw_item_id}")),
                funding_pattern: FundingPattern::PerProjectExact,
                fields,
                conflicts: vec![],
                overall_confidence: 0.9,
                evidence_ceiling: 0.9,
                urgency_level: UrgencyLevel::Low,
                suitability_flags: SuitabilityFlags::default(),
                relevance: RelevanceBreakdown::default(),
                status: RoutingStatus::AutoApproved,
                near_duplicate_of: None,
                candidate_ids: vec![candidate.id],
                notes: vec![],
            },
            candidates: vec![candidate],
            source_text: "Grants of exactly $50,000 each, deadline March 1".into(),
            processed_at: Utc.with_ymd_and_hms(2026, 1, 10, 9, 0, 0).unwrap(),
        }
    }

    fn validation(record_id: &str, decision: ValidationDecision) -> HumanValidation {
        HumanValidation {
            record_id: record_id.into(),
            decision,
            corrected_fields: BTreeMap::new(),
            validated_at: None,
        }
    }

    #[test]
    fn approval_credits_every_contributing_rule_once() {
        let report = LearningLoop::default().update(
            &library(),
            &[],
            &[validation("item-1", ValidationDecision::Approve)],
            &[processed("item-1")],
        );
        assert_eq!(report.library.version, 4);
        assert_eq!(report.applied, 1);
        let exact = report.library.rule("exact.dollars").unwrap();
        assert_eq!((exact.times_applied, exact.successes), (1, 1));
        let deadline = report.library.rule("deadline.month_day").unwrap();
        assert_eq!(deadline.success_rate, 1.0);
    }

    #[test]
    fn correction_only_penalizes_the_corrected_rule() {
        let mut edit = validation("hash-item-1", ValidationDecision::NeedsEdit);
        edit.corrected_fields.insert(
            FieldName::Deadline,
            FieldData::Deadline(fundsig_core::Deadline::Rolling),
        );
        let report = LearningLoop::default().update(&library(), &[], &[edit], &[processed("item-1")]);
        assert_eq!(report.library.rule("exact.dollars").unwrap().successes, 1);
        let deadline = report.library.rule("deadline.month_day").unwrap();
        assert_eq!((deadline.times_applied, deadline.successes), (1, 0));
    }

    #[test]
    fn malformed_validations_are_skipped_and_batch_continues() {
        let mut wrong_kind = validation("item-1", ValidationDecision::NeedsEdit);
        wrong_kind
            .corrected_fields
            .insert(FieldName::Deadline, FieldData::Amount(1.0));
        let report = LearningLoop::default().update(
            &library(),
            &[],
            &[
                validation("missing", ValidationDecision::Approve),
                validation("item-1", ValidationDecision::NeedsEdit),
                wrong_kind,
                validation("item-1", ValidationDecision::Reject),
            ],
            &[processed("item-1")],
        );
        assert_eq!(report.applied, 1);
        assert_eq!(report.skipped.len(), 3);
        assert!(matches!(report.skipped[0], LearningUpdateError::UnknownRecord { .. }));
        assert!(matches!(report.skipped[1], LearningUpdateError::MissingCorrections { .. }));
        assert!(matches!(report.skipped[2], LearningUpdateError::WrongFieldKind { .. }));
        assert_eq!(report.library.rule("exact.dollars").unwrap().successes, 0);
    }

    #[test]
    fn persistent_failures_deactivate_without_deleting() {
        let validations: Vec<_> = (0..10)
            .map(|_| validation("item-1", ValidationDecision::Reject))
            .collect();
        let report =
            LearningLoop::default().update(&library(), &[], &validations, &[processed("item-1")]);
        assert_eq!(report.library.rules.len(), 2);
        assert_eq!(report.deactivated.len(), 2);
        assert!(report.library.rules.iter().all(|r| !r.is_active));
    }

    #[test]
    fn too_few_samples_keep_rules_active() {
        let validations: Vec<_> = (0..9)
            .map(|_| validation("item-1", ValidationDecision::Reject))
            .collect();
        let report =
            LearningLoop::default().update(&library(), &[], &validations, &[processed("item-1")]);
        assert!(report.deactivated.is_empty());
        assert_eq!(report.library.rule("exact.dollars").unwrap().times_applied, 9);
    }

    #[test]
    fn rejection_decisions_feed_the_loop() {
        let record = processed("item-9");
        let rejection = RejectionRecord {
            id: uuid::Uuid::from_u128(7),
            raw_item_id: "item-9".into(),
            content_hash: record.resolved.content_hash.clone(),
            resolved_opportunity_snapshot: record.resolved.clone(),
            candidate_scores: vec![],
            candidates: record.candidates.clone(),
            source_text: record.source_text.clone(),
            rejection_reason: "overall confidence 0.55 below rejection threshold 0.60".into(),
            rejection_category: fundsig_core::RejectionCategory::LowConfidence,
            human_decision: Some(ValidationDecision::Approve),
            learning_value: 0.9,
            created_at: record.processed_at,
        };
        let report = LearningLoop::default().update(&library(), &[rejection], &[], &[]);
        assert_eq!(report.applied, 1);
        assert_eq!(report.library.rule("exact.dollars").unwrap().successes, 1);
    }
}
