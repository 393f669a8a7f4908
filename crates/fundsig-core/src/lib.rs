//! Core domain model and provenance types for the funding signal pipeline.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "fundsig-core";

/// Namespace for deterministic candidate and record ids.
pub const ID_NAMESPACE: Uuid = Uuid::from_u128(0x6f1d_0c3e_55a2_4b7e_9d41_2a8e_7c90_f3b1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Rss,
    WebPage,
    SearchSnippet,
    Manual,
}

/// Unit of ingestion handed to the pipeline by the retrieval layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawItem {
    pub id: String,
    pub url: String,
    pub title: String,
    pub body: String,
    pub source_type: SourceType,
    pub collected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FundingPattern {
    TotalPool,
    PerProjectExact,
    PerProjectRange,
    Unknown,
}

impl FundingPattern {
    /// Tie-break rank; more specific claims rank higher.
    pub fn specificity_rank(self) -> u8 {
        match self {
            Self::PerProjectExact => 3,
            Self::PerProjectRange => 2,
            Self::TotalPool => 1,
            Self::Unknown => 0,
        }
    }

    /// Fields that carry the monetary claim of this shape.
    pub fn shape_fields(self) -> &'static [FieldName] {
        match self {
            Self::TotalPool => &[FieldName::TotalAmount],
            Self::PerProjectExact => &[FieldName::ExactAmountPerProject],
            Self::PerProjectRange => &[
                FieldName::MinAmountPerProject,
                FieldName::MaxAmountPerProject,
            ],
            Self::Unknown => &[],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TotalPool => "total_pool",
            Self::PerProjectExact => "per_project_exact",
            Self::PerProjectRange => "per_project_range",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FundingPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldName {
    Title,
    TotalAmount,
    ProjectCount,
    ProjectCountMin,
    ProjectCountMax,
    ExactAmountPerProject,
    MinAmountPerProject,
    MaxAmountPerProject,
    Currency,
    Deadline,
    TargetAudience,
    GenderFocused,
    YouthFocused,
    CollaborationRequired,
    AiSubsectors,
    Geography,
    ApplicationProcess,
    /// Composite key for per-project amount conflicts; never stored in a field map.
    FundingAmount,
}

impl FieldName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::TotalAmount => "total_amount",
            Self::ProjectCount => "project_count",
            Self::ProjectCountMin => "project_count_min",
            Self::ProjectCountMax => "project_count_max",
            Self::ExactAmountPerProject => "exact_amount_per_project",
            Self::MinAmountPerProject => "min_amount_per_project",
            Self::MaxAmountPerProject => "max_amount_per_project",
            Self::Currency => "currency",
            Self::Deadline => "deadline",
            Self::TargetAudience => "target_audience",
            Self::GenderFocused => "gender_focused",
            Self::YouthFocused => "youth_focused",
            Self::CollaborationRequired => "collaboration_required",
            Self::AiSubsectors => "ai_subsectors",
            Self::Geography => "geography",
            Self::ApplicationProcess => "application_process",
            Self::FundingAmount => "funding_amount",
        }
    }

    pub fn is_amount(self) -> bool {
        matches!(
            self,
            Self::TotalAmount
                | Self::ExactAmountPerProject
                | Self::MinAmountPerProject
                | Self::MaxAmountPerProject
                | Self::FundingAmount
        )
    }

    pub fn is_per_project_amount(self) -> bool {
        matches!(
            self,
            Self::ExactAmountPerProject | Self::MinAmountPerProject | Self::MaxAmountPerProject
        )
    }

    /// Conflicts on these fields block publication until a human looks at them.
    pub fn is_high_impact(self) -> bool {
        self.is_amount() || self == Self::Deadline
    }

    /// Relative importance used by confidence roll-ups. Amounts and deadline dominate.
    pub fn importance_weight(self) -> f64 {
        match self {
            Self::TotalAmount | Self::ExactAmountPerProject => 0.30,
            Self::MinAmountPerProject | Self::MaxAmountPerProject => 0.15,
            Self::Deadline => 0.25,
            Self::Currency | Self::Title => 0.10,
            Self::ProjectCount => 0.05,
            Self::ProjectCountMin | Self::ProjectCountMax => 0.025,
            Self::TargetAudience
            | Self::AiSubsectors
            | Self::Geography
            | Self::ApplicationProcess => 0.05,
            Self::GenderFocused | Self::YouthFocused | Self::CollaborationRequired => 0.02,
            Self::FundingAmount => 0.0,
        }
    }
}

impl fmt::Display for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown tag `{0}`")]
pub struct UnknownTag(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudienceTag {
    Startups,
    Researchers,
    Smes,
    Individuals,
}

impl FromStr for AudienceTag {
    type Err = UnknownTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "startups" => Ok(Self::Startups),
            "researchers" => Ok(Self::Researchers),
            "smes" => Ok(Self::Smes),
            "individuals" => Ok(Self::Individuals),
            other => Err(UnknownTag(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FocusTag {
    Gender,
    Youth,
    Collaboration,
}

impl FocusTag {
    pub fn field_name(self) -> FieldName {
        match self {
            Self::Gender => FieldName::GenderFocused,
            Self::Youth => FieldName::YouthFocused,
            Self::Collaboration => FieldName::CollaborationRequired,
        }
    }
}

impl FromStr for FocusTag {
    type Err = UnknownTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gender" => Ok(Self::Gender),
            "youth" => Ok(Self::Youth),
            "collaboration" => Ok(Self::Collaboration),
            other => Err(UnknownTag(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiSubsector {
    Healthtech,
    Fintech,
    Agritech,
    Edtech,
    Climatetech,
    Nlp,
    ComputerVision,
    Robotics,
    GeneralAi,
}

impl FromStr for AiSubsector {
    type Err = UnknownTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "healthtech" => Ok(Self::Healthtech),
            "fintech" => Ok(Self::Fintech),
            "agritech" => Ok(Self::Agritech),
            "edtech" => Ok(Self::Edtech),
            "climatetech" => Ok(Self::Climatetech),
            "nlp" => Ok(Self::Nlp),
            "computer_vision" => Ok(Self::ComputerVision),
            "robotics" => Ok(Self::Robotics),
            "general_ai" => Ok(Self::GeneralAi),
            other => Err(UnknownTag(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "date", rename_all = "snake_case")]
pub enum Deadline {
    Date(NaiveDate),
    Rolling,
}

/// Whole monetary claim of one candidate, compared as a unit during reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum AmountClaim {
    Pool { total: f64 },
    Exact { amount: f64 },
    Range { min: f64, max: f64 },
}

impl AmountClaim {
    pub fn agrees_with(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Pool { total: a }, Self::Pool { total: b }) => amounts_agree(*a, *b),
            (Self::Exact { amount: a }, Self::Exact { amount: b }) => amounts_agree(*a, *b),
            (Self::Range { min: a0, max: a1 }, Self::Range { min: b0, max: b1 }) => {
                amounts_agree(*a0, *b0) && amounts_agree(*a1, *b1)
            }
            _ => false,
        }
    }

    pub fn pattern(&self) -> FundingPattern {
        match self {
            Self::Pool { .. } => FundingPattern::TotalPool,
            Self::Exact { .. } => FundingPattern::PerProjectExact,
            Self::Range { .. } => FundingPattern::PerProjectRange,
        }
    }
}

/// Numeric agreement within `max(0.01, 1e-6 * |a|)`.
pub fn amounts_agree(a: f64, b: f64) -> bool {
    let tolerance = (a.abs() * 1e-6).max(0.01);
    (a - b).abs() <= tolerance
}

/// Case- and whitespace-insensitive form used for text agreement.
pub fn fold_text(input: &str) -> String {
    input
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldData {
    Text(String),
    Amount(f64),
    Count(u32),
    Currency(String),
    Deadline(Deadline),
    Flag(bool),
    Audience(BTreeSet<AudienceTag>),
    Subsectors(BTreeSet<AiSubsector>),
    Regions(BTreeSet<String>),
    Claim(AmountClaim),
}

impl FieldData {
    /// Agreement after normalization; values of different kinds never agree.
    pub fn agrees_with(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Text(a), Self::Text(b)) => fold_text(a) == fold_text(b),
            (Self::Amount(a), Self::Amount(b)) => amounts_agree(*a, *b),
            (Self::Count(a), Self::Count(b)) => a == b,
            (Self::Currency(a), Self::Currency(b)) => a.eq_ignore_ascii_case(b),
            (Self::Deadline(a), Self::Deadline(b)) => a == b,
            (Self::Flag(a), Self::Flag(b)) => a == b,
            (Self::Audience(a), Self::Audience(b)) => a == b,
            (Self::Subsectors(a), Self::Subsectors(b)) => a == b,
            (Self::Regions(a), Self::Regions(b)) => a == b,
            (Self::Claim(a), Self::Claim(b)) => a.agrees_with(b),
            _ => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Amount(_) => "amount",
            Self::Count(_) => "count",
            Self::Currency(_) => "currency",
            Self::Deadline(_) => "deadline",
            Self::Flag(_) => "flag",
            Self::Audience(_) => "audience",
            Self::Subsectors(_) => "subsectors",
            Self::Regions(_) => "regions",
            Self::Claim(_) => "claim",
        }
    }

    /// Data kind a field name is expected to carry.
    pub fn expected_kind(field: FieldName) -> &'static str {
        match field {
            FieldName::Title => "text",
            FieldName::TotalAmount
            | FieldName::ExactAmountPerProject
            | FieldName::MinAmountPerProject
            | FieldName::MaxAmountPerProject => "amount",
            FieldName::ProjectCount | FieldName::ProjectCountMin | FieldName::ProjectCountMax => {
                "count"
            }
            FieldName::Currency => "currency",
            FieldName::Deadline => "deadline",
            FieldName::TargetAudience => "audience",
            FieldName::GenderFocused
            | FieldName::YouthFocused
            | FieldName::CollaborationRequired
            | FieldName::ApplicationProcess => "flag",
            FieldName::AiSubsectors => "subsectors",
            FieldName::Geography => "regions",
            FieldName::FundingAmount => "claim",
        }
    }
}

/// Provenance pointer from a field value back to the rule and text span that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    pub rule_id: String,
    pub start: usize,
    pub end: usize,
    pub snippet: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    pub value: FieldData,
    pub confidence: f64,
    pub source_extractor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Evidence>,
}

impl FieldValue {
    pub fn new(value: FieldData, confidence: f64, source_extractor: impl Into<String>) -> Self {
        Self {
            value,
            confidence: clamp_unit(confidence),
            source_extractor: source_extractor.into(),
            evidence: None,
        }
    }

    pub fn with_evidence(mut self, evidence: Evidence) -> Self {
        self.evidence = Some(evidence);
        self
    }
}

pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

pub type FieldMap = BTreeMap<FieldName, FieldValue>;

/// Importance-weighted mean of field confidences; 0 for an empty map.
pub fn weighted_confidence(fields: &FieldMap) -> f64 {
    let (sum, weight) = fields
        .iter()
        .map(|(name, field)| (name.importance_weight(), field.confidence))
        .filter(|(w, _)| *w > 0.0)
        .fold((0.0, 0.0), |(sum, total), (w, c)| (sum + w * c, total + w));
    if weight == 0.0 {
        0.0
    } else {
        clamp_unit(sum / weight)
    }
}

/// Typed accessors over a field map.
pub trait FieldMapExt {
    fn amount(&self, name: FieldName) -> Option<f64>;
    fn count(&self, name: FieldName) -> Option<u32>;
    fn flag(&self, name: FieldName) -> bool;
    fn text(&self, name: FieldName) -> Option<&str>;
    fn currency(&self) -> Option<&str>;
    fn deadline(&self) -> Option<Deadline>;
    fn audience(&self) -> BTreeSet<AudienceTag>;
    fn subsectors(&self) -> BTreeSet<AiSubsector>;
    fn regions(&self) -> BTreeSet<String>;
    fn has_amount(&self) -> bool;
    fn amount_claim(&self) -> Option<AmountClaim>;
    fn per_project_claim(&self) -> Option<(AmountClaim, f64)>;
}

impl FieldMapExt for FieldMap {
    fn amount(&self, name: FieldName) -> Option<f64> {
        match self.get(&name).map(|f| &f.value) {
            Some(FieldData::Amount(v)) => Some(*v),
            _ => None,
        }
    }

    fn count(&self, name: FieldName) -> Option<u32> {
        match self.get(&name).map(|f| &f.value) {
            Some(FieldData::Count(v)) => Some(*v),
            _ => None,
        }
    }

    fn flag(&self, name: FieldName) -> bool {
        matches!(self.get(&name).map(|f| &f.value), Some(FieldData::Flag(true)))
    }

    fn text(&self, name: FieldName) -> Option<&str> {
        match self.get(&name).map(|f| &f.value) {
            Some(FieldData::Text(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    fn currency(&self) -> Option<&str> {
        match self.get(&FieldName::Currency).map(|f| &f.value) {
            Some(FieldData::Currency(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    fn deadline(&self) -> Option<Deadline> {
        match self.get(&FieldName::Deadline).map(|f| &f.value) {
            Some(FieldData::Deadline(v)) => Some(*v),
            _ => None,
        }
    }

    fn audience(&self) -> BTreeSet<AudienceTag> {
        match self.get(&FieldName::TargetAudience).map(|f| &f.value) {
            Some(FieldData::Audience(v)) => v.clone(),
            _ => BTreeSet::new(),
        }
    }

    fn subsectors(&self) -> BTreeSet<AiSubsector> {
        match self.get(&FieldName::AiSubsectors).map(|f| &f.value) {
            Some(FieldData::Subsectors(v)) => v.clone(),
            _ => BTreeSet::new(),
        }
    }

    fn regions(&self) -> BTreeSet<String> {
        match self.get(&FieldName::Geography).map(|f| &f.value) {
            Some(FieldData::Regions(v)) => v.clone(),
            _ => BTreeSet::new(),
        }
    }

    fn has_amount(&self) -> bool {
        self.keys().any(|name| name.is_amount())
    }

    fn amount_claim(&self) -> Option<AmountClaim> {
        self.per_project_claim()
            .map(|(claim, _)| claim)
            .or_else(|| {
                self.amount(FieldName::TotalAmount)
                    .map(|total| AmountClaim::Pool { total })
            })
    }

    /// Per-project claim and the confidence of its weakest supporting field.
    fn per_project_claim(&self) -> Option<(AmountClaim, f64)> {
        if let Some(amount) = self.amount(FieldName::ExactAmountPerProject) {
            let confidence = self[&FieldName::ExactAmountPerProject].confidence;
            return Some((AmountClaim::Exact { amount }, confidence));
        }
        let min = self.amount(FieldName::MinAmountPerProject)?;
        let max = self.amount(FieldName::MaxAmountPerProject)?;
        let confidence = self[&FieldName::MinAmountPerProject]
            .confidence
            .min(self[&FieldName::MaxAmountPerProject].confidence);
        Some((AmountClaim::Range { min, max }, confidence))
    }
}

/// One extraction pass's structured guess about a raw item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionCandidate {
    pub id: Uuid,
    pub raw_item_id: String,
    pub extractor_version: String,
    pub funding_pattern: FundingPattern,
    pub fields: FieldMap,
    pub overall_confidence: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl ExtractionCandidate {
    pub fn deterministic_id(
        raw_item_id: &str,
        extractor_version: &str,
        pattern: FundingPattern,
    ) -> Uuid {
        let key = format!("{raw_item_id}:{extractor_version}:{}", pattern.as_str());
        Uuid::new_v5(&ID_NAMESPACE, key.as_bytes())
    }

    /// Strongest confidence among the fields carrying this candidate's funding shape.
    pub fn shape_confidence(&self) -> f64 {
        self.funding_pattern
            .shape_fields()
            .iter()
            .filter_map(|name| self.fields.get(name))
            .map(|f| f.confidence)
            .fold(0.0, f64::max)
    }

    /// Rule ids referenced by this candidate's field evidence.
    pub fn rule_ids(&self) -> BTreeSet<&str> {
        self.fields
            .values()
            .filter_map(|f| f.evidence.as_ref())
            .map(|e| e.rule_id.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMethod {
    HigherConfidence,
    MajorityVote,
    ManualReview,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub field_name: FieldName,
    pub candidate_values: Vec<FieldValue>,
    pub resolution_method: ResolutionMethod,
    pub resolved_value: FieldData,
    pub resolved_confidence: f64,
}

impl Conflict {
    pub fn needs_review(&self) -> bool {
        self.resolution_method == ResolutionMethod::ManualReview
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrgencyLevel {
    Expired,
    Urgent,
    Moderate,
    Low,
    Unknown,
}

impl UrgencyLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::Urgent => "urgent",
            Self::Moderate => "moderate",
            Self::Low => "low",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SuitabilityFlags {
    pub suitable_for_startups: bool,
    pub suitable_for_researchers: bool,
    pub suitable_for_smes: bool,
    pub suitable_for_individuals: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RelevanceBreakdown {
    pub technology: f64,
    pub geography: f64,
    pub funding_clarity: f64,
    pub deadline_clarity: f64,
    pub process_clarity: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStatus {
    Pending,
    AutoApproved,
    CommunityReview,
    HumanReview,
    RejectionDatabase,
}

impl RoutingStatus {
    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::AutoApproved => "auto_approved",
            Self::CommunityReview => "community_review",
            Self::HumanReview => "human_review",
            Self::RejectionDatabase => "rejection_database",
        }
    }
}

impl fmt::Display for RoutingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("record {raw_item_id} is already {from}; re-open it with a new pipeline run")]
    AlreadyTerminal {
        raw_item_id: String,
        from: RoutingStatus,
    },
    #[error("cannot route record {raw_item_id} back to pending")]
    BackToPending { raw_item_id: String },
}

/// Reconciled, scored and routed result for one raw item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedOpportunity {
    pub raw_item_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    pub funding_pattern: FundingPattern,
    pub fields: FieldMap,
    pub conflicts: Vec<Conflict>,
    pub overall_confidence: f64,
    /// Highest overall confidence among contributing candidates.
    pub evidence_ceiling: f64,
    pub urgency_level: UrgencyLevel,
    pub suitability_flags: SuitabilityFlags,
    pub relevance: RelevanceBreakdown,
    pub status: RoutingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub near_duplicate_of: Option<String>,
    pub candidate_ids: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl ResolvedOpportunity {
    pub fn transition(&mut self, to: RoutingStatus) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::AlreadyTerminal {
                raw_item_id: self.raw_item_id.clone(),
                from: self.status,
            });
        }
        if !to.is_terminal() {
            return Err(TransitionError::BackToPending {
                raw_item_id: self.raw_item_id.clone(),
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn review_conflicts(&self) -> impl Iterator<Item = &Conflict> {
        self.conflicts.iter().filter(|c| c.needs_review())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionCategory {
    LowConfidence,
    NotFunding,
}

impl RejectionCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LowConfidence => "low_confidence",
            Self::NotFunding => "not_funding",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationDecision {
    Approve,
    Reject,
    NeedsEdit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateScore {
    pub candidate_id: Uuid,
    pub extractor_version: String,
    pub funding_pattern: FundingPattern,
    pub overall_confidence: f64,
}

impl From<&ExtractionCandidate> for CandidateScore {
    fn from(candidate: &ExtractionCandidate) -> Self {
        Self {
            candidate_id: candidate.id,
            extractor_version: candidate.extractor_version.clone(),
            funding_pattern: candidate.funding_pattern,
            overall_confidence: candidate.overall_confidence,
        }
    }
}

/// Labeled record of a rejected item; append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectionRecord {
    pub id: Uuid,
    pub raw_item_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    pub resolved_opportunity_snapshot: ResolvedOpportunity,
    pub candidate_scores: Vec<CandidateScore>,
    pub candidates: Vec<ExtractionCandidate>,
    pub source_text: String,
    pub rejection_reason: String,
    pub rejection_category: RejectionCategory,
    #[serde(default)]
    pub human_decision: Option<ValidationDecision>,
    pub learning_value: f64,
    pub created_at: DateTime<Utc>,
}

impl RejectionRecord {
    /// A human override asks for the item to run through the pipeline again.
    pub fn should_reprocess(&self) -> bool {
        matches!(
            self.human_decision,
            Some(ValidationDecision::Approve) | Some(ValidationDecision::NeedsEdit)
        )
    }
}

/// Audit snapshot persisted for every routed item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedRecord {
    pub resolved: ResolvedOpportunity,
    pub candidates: Vec<ExtractionCandidate>,
    pub source_text: String,
    pub processed_at: DateTime<Utc>,
}

/// Decision supplied by a human or community reviewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanValidation {
    pub record_id: String,
    pub decision: ValidationDecision,
    #[serde(default)]
    pub corrected_fields: BTreeMap<FieldName, FieldData>,
    #[serde(default)]
    pub validated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    TotalPool,
    PerProjectExact,
    PerProjectRange,
    ProjectCount,
    Deadline,
    Currency,
    Audience,
    Focus,
    AiSubsector,
    Geography,
    ApplicationProcess,
}

impl PatternType {
    pub const FUNDING_FAMILIES: [PatternType; 3] = [
        PatternType::TotalPool,
        PatternType::PerProjectExact,
        PatternType::PerProjectRange,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TotalPool => "total_pool",
            Self::PerProjectExact => "per_project_exact",
            Self::PerProjectRange => "per_project_range",
            Self::ProjectCount => "project_count",
            Self::Deadline => "deadline",
            Self::Currency => "currency",
            Self::Audience => "audience",
            Self::Focus => "focus",
            Self::AiSubsector => "ai_subsector",
            Self::Geography => "geography",
            Self::ApplicationProcess => "application_process",
        }
    }

    pub fn family(self) -> Option<FundingPattern> {
        match self {
            Self::TotalPool => Some(FundingPattern::TotalPool),
            Self::PerProjectExact => Some(FundingPattern::PerProjectExact),
            Self::PerProjectRange => Some(FundingPattern::PerProjectRange),
            _ => None,
        }
    }

    pub fn for_family(pattern: FundingPattern) -> Option<Self> {
        match pattern {
            FundingPattern::TotalPool => Some(Self::TotalPool),
            FundingPattern::PerProjectExact => Some(Self::PerProjectExact),
            FundingPattern::PerProjectRange => Some(Self::PerProjectRange),
            FundingPattern::Unknown => None,
        }
    }

    /// Whether a keyword tag is meaningful for this rule family.
    pub fn accepts_tag(self, tag: &str) -> bool {
        match self {
            Self::Audience => tag.parse::<AudienceTag>().is_ok(),
            Self::Focus => tag.parse::<FocusTag>().is_ok(),
            Self::AiSubsector => tag.parse::<AiSubsector>().is_ok(),
            Self::Deadline => tag == "rolling",
            Self::Geography | Self::ApplicationProcess => !tag.trim().is_empty(),
            Self::Currency => tag.len() == 3 && tag.chars().all(|c| c.is_ascii_uppercase()),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Matcher {
    Regex { pattern: String },
    Keywords { any_of: Vec<String>, tag: String },
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRule {
    pub id: String,
    pub pattern_type: PatternType,
    pub matcher: Matcher,
    pub confidence_prior: f64,
    #[serde(default)]
    pub times_applied: u64,
    #[serde(default)]
    pub successes: u64,
    #[serde(default)]
    pub success_rate: f64,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PatternRule {
    pub fn record_outcome(&mut self, agreed: bool) {
        self.times_applied += 1;
        if agreed {
            self.successes += 1;
        }
        self.success_rate = self.successes as f64 / self.times_applied as f64;
    }
}

/// Versioned, serializable rule set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternLibrary {
    pub version: u64,
    pub rules: Vec<PatternRule>,
}

impl PatternLibrary {
    pub fn rule(&self, id: &str) -> Option<&PatternRule> {
        self.rules.iter().find(|r| r.id == id)
    }

    pub fn rule_mut(&mut self, id: &str) -> Option<&mut PatternRule> {
        self.rules.iter_mut().find(|r| r.id == id)
    }
}
