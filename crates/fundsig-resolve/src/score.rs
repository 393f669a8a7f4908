use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use fundsig_core::{
    weighted_confidence, AiSubsector, AudienceTag, Deadline, FieldMap, FieldMapExt, FieldName,
    FundingPattern, RelevanceBreakdown, ResolvedOpportunity, SuitabilityFlags, UrgencyLevel,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub urgent_days: i64,
    pub moderate_days: i64,
    /// Regions the operator cares about; `global` accepts any region.
    pub target_regions: BTreeSet<String>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            urgent_days: 7,
            moderate_days: 30,
            target_regions: BTreeSet::from(["global".to_string()]),
        }
    }
}

pub fn urgency_level(deadline: Option<Deadline>, today: NaiveDate, config: &ScoringConfig) -> UrgencyLevel {
    match deadline {
        None => UrgencyLevel::Unknown,
        Some(Deadline::Rolling) => UrgencyLevel::Low,
        Some(Deadline::Date(date)) => {
            let days = (date - today).num_days();
            if days < 0 {
                UrgencyLevel::Expired
            } else if days <= config.urgent_days {
                UrgencyLevel::Urgent
            } else if days <= config.moderate_days {
                UrgencyLevel::Moderate
            } else {
                UrgencyLevel::Low
            }
        }
    }
}

pub fn suitability_flags(fields: &FieldMap) -> SuitabilityFlags {
    let audience = fields.audience();
    SuitabilityFlags {
        suitable_for_startups: audience.contains(&AudienceTag::Startups),
        suitable_for_researchers: audience.contains(&AudienceTag::Researchers),
        suitable_for_smes: audience.contains(&AudienceTag::Smes),
        suitable_for_individuals: audience.contains(&AudienceTag::Individuals),
    }
}

/// Bounded parts: technology 0.3, geography 0.2, funding 0.2, deadline 0.2, process 0.1.
pub fn relevance(fields: &FieldMap, pattern: FundingPattern, config: &ScoringConfig) -> RelevanceBreakdown {
    let subsectors = fields.subsectors();
    let technology = if subsectors.iter().any(|s| *s != AiSubsector::GeneralAi) {
        0.3
    } else if subsectors.contains(&AiSubsector::GeneralAi) {
        0.2
    } else {
        0.0
    };

    let regions = fields.regions();
    let open_target = config.target_regions.contains("global");
    let geography = if regions.is_empty() {
        0.1
    } else if open_target
        || regions.contains("global")
        || !regions.is_disjoint(&config.target_regions)
    {
        0.2
    } else {
        0.0
    };

    let shape_clarity: f64 = match pattern {
        FundingPattern::PerProjectExact => 0.2,
        FundingPattern::PerProjectRange => 0.15,
        FundingPattern::TotalPool => 0.1,
        FundingPattern::Unknown => 0.0,
    };
    let funding_clarity = if shape_clarity > 0.0 && fields.currency().is_none() {
        shape_clarity - 0.05
    } else {
        shape_clarity
    };

    let deadline_clarity = match fields.deadline() {
        Some(Deadline::Date(_)) => 0.2,
        Some(Deadline::Rolling) => 0.1,
        None => 0.0,
    };
    let process_clarity = if fields.flag(FieldName::ApplicationProcess) {
        0.1
    } else {
        0.0
    };

    let total =
        (technology + geography + funding_clarity + deadline_clarity + process_clarity).min(1.0);
    RelevanceBreakdown {
        technology,
        geography,
        funding_clarity,
        deadline_clarity,
        process_clarity,
        total,
    }
}

/// Fills confidence, urgency, suitability and relevance. Overall confidence never
/// exceeds the strongest contributing candidate.
pub fn score(mut resolved: ResolvedOpportunity, config: &ScoringConfig, now: DateTime<Utc>) -> ResolvedOpportunity {
    resolved.overall_confidence = weighted_confidence(&resolved.fields).min(resolved.evidence_ceiling);
    resolved.urgency_level = urgency_level(resolved.fields.deadline(), now.date_naive(), config);
    resolved.suitability_flags = suitability_flags(&resolved.fields);
    resolved.relevance = relevance(&resolved.fields, resolved.funding_pattern, config);
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use fundsig_core::{FieldData, FieldValue, RoutingStatus};

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn field(data: FieldData, conf: f64) -> FieldValue {
        FieldValue::new(data, conf, "broad@1/lib-v1")
    }

    fn resolved(fields: FieldMap, ceiling: f64) -> ResolvedOpportunity {
        ResolvedOpportunity {
            raw_item_id: "item-1".into(),
            content_hash: None,
            funding_pattern: FundingPattern::PerProjectExact,
            fields,
            conflicts: vec![],
            overall_confidence: 0.0,
            evidence_ceiling: ceiling,
            urgency_level: UrgencyLevel::Unknown,
            suitability_flags: SuitabilityFlags::default(),
            relevance: RelevanceBreakdown::default(),
            status: RoutingStatus::Pending,
            near_duplicate_of: None,
            candidate_ids: vec![],
            notes: vec![],
        }
    }

    #[test]
    fn urgency_bands() {
        let cfg = ScoringConfig::default();
        let today = day(2026, 3, 1);
        let at = |d| urgency_level(Some(Deadline::Date(d)), today, &cfg);
        assert_eq!(at(day(2026, 2, 28)), UrgencyLevel::Expired);
        assert_eq!(at(day(2026, 3, 1)), UrgencyLevel::Urgent);
        assert_eq!(at(day(2026, 3, 8)), UrgencyLevel::Urgent);
        assert_eq!(at(day(2026, 3, 9)), UrgencyLevel::Moderate);
        assert_eq!(at(day(2026, 3, 31)), UrgencyLevel::Moderate);
        assert_eq!(at(day(2026, 4, 1)), UrgencyLevel::Low);
        assert_eq!(urgency_level(Some(Deadline::Rolling), today, &cfg), UrgencyLevel::Low);
        assert_eq!(urgency_level(None, today, &cfg), UrgencyLevel::Unknown);
    }

    #[test]
    fn suitability_follows_audience() {
        let mut fields = FieldMap::new();
        fields.insert(
            FieldName::TargetAudience,
            field(
                FieldData::Audience([AudienceTag::Startups, AudienceTag::Smes].into()),
                0.8,
            ),
        );
        let flags = suitability_flags(&fields);
        assert!(flags.suitable_for_startups && flags.suitable_for_smes);
        assert!(!flags.suitable_for_researchers && !flags.suitable_for_individuals);
    }

    #[test]
    fn relevance_parts_are_bounded() {
        let mut fields = FieldMap::new();
        fields.insert(
            FieldName::AiSubsectors,
            field(FieldData::Subsectors([AiSubsector::Healthtech].into()), 0.8),
        );
        fields.insert(
            FieldName::Geography,
            field(FieldData::Regions(["africa".to_string()].into()), 0.8),
        );
        fields.insert(FieldName::Currency, field(FieldData::Currency("USD".into()), 0.9));
        fields.insert(
            FieldName::Deadline,
            field(FieldData::Deadline(Deadline::Date(day(2026, 4, 30))), 0.9),
        );
        fields.insert(FieldName::ApplicationProcess, field(FieldData::Flag(true), 0.7));
        let full = relevance(&fields, FundingPattern::PerProjectExact, &ScoringConfig::default());
        assert!((full.total - 1.0).abs() < 1e-9);

        let europe_only = ScoringConfig {
            target_regions: ["europe".to_string()].into(),
            ..ScoringConfig::default()
        };
        let narrow = relevance(&fields, FundingPattern::TotalPool, &europe_only);
        assert_eq!(narrow.geography, 0.0);
        assert_eq!(narrow.funding_clarity, 0.1);
        assert!(narrow.total < full.total);
    }

    #[test]
    fn overall_is_capped_by_evidence_ceiling() {
        let mut fields = FieldMap::new();
        fields.insert(FieldName::ExactAmountPerProject, field(FieldData::Amount(5e4), 0.95));
        fields.insert(FieldName::Title, field(FieldData::Text("x".into()), 0.9));
        let now = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();
        let scored = score(resolved(fields.clone(), 0.7), &ScoringConfig::default(), now);
        assert_eq!(scored.overall_confidence, 0.7);
        let uncapped = score(resolved(fields, 1.0), &ScoringConfig::default(), now);
        assert!(uncapped.overall_confidence > 0.9);
        assert_eq!(uncapped.urgency_level, UrgencyLevel::Unknown);
    }
}
