//! Content normalization + profile-driven funding signal extraction.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use fundsig_core::{
    weighted_confidence, AiSubsector, AudienceTag, Evidence, ExtractionCandidate, FieldData,
    FieldMap, FieldMapExt, FieldName, FieldValue, FocusTag, FundingPattern, PatternType, RawItem,
    SourceType,
};
use fundsig_patterns::{resolve_family_overlaps, CompiledLibrary, Match, MatchValue};
use fundsig_storage::content_hash;
use scraper::Html;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "fundsig-extract";

/// Upper bound on cleaned text handed to the matchers, in bytes.
pub const MAX_TEXT_CHARS: usize = 64 * 1024;

const TITLE_CONFIDENCE: f64 = 0.9;
const NO_AMOUNT_PENALTY: f64 = 0.6;
const NO_DEADLINE_PENALTY: f64 = 0.85;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedText {
    pub raw_item_id: String,
    pub url: String,
    pub title: String,
    pub body: String,
    /// `title + "\n" + body`, the text every rule runs against.
    pub text: String,
    pub content_hash: String,
    pub collected_at: DateTime<Utc>,
    pub source_type: SourceType,
    pub truncated: bool,
}

impl NormalizedText {
    /// Anchor for yearless deadlines.
    pub fn reference_date(&self) -> NaiveDate {
        self.collected_at.date_naive()
    }

    pub fn has_usable_text(&self) -> bool {
        self.text.chars().any(char::is_alphanumeric)
    }
}

pub fn normalize(raw: &RawItem) -> NormalizedText {
    let hash = content_hash(&raw.url, &raw.title, &raw.body);
    if let Some(declared) = raw.content_hash.as_deref() {
        if declared != hash {
            debug!(raw_item_id = %raw.id, declared, computed = %hash, "declared content hash ignored");
        }
    }

    let mut title = clean_text(&raw.title);
    let mut body = clean_text(&raw.body);
    let mut text = if title.is_empty() {
        body.clone()
    } else {
        format!("{title}\n{body}")
    };
    let truncated = truncate_at_boundary(&mut text, MAX_TEXT_CHARS);
    if truncated {
        warn!(raw_item_id = %raw.id, limit = MAX_TEXT_CHARS, "text truncated before matching");
        if title.is_empty() {
            body = text.clone();
        } else if title.len() >= text.len() {
            title = text.clone();
            body.clear();
        } else {
            body = text[title.len() + 1..].to_string();
        }
    }

    NormalizedText {
        raw_item_id: raw.id.clone(),
        url: raw.url.trim().to_string(),
        title,
        body,
        text,
        content_hash: hash,
        collected_at: raw.collected_at,
        source_type: raw.source_type,
        truncated,
    }
}

fn truncate_at_boundary(text: &mut String, limit: usize) -> bool {
    if text.len() <= limit {
        return false;
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    true
}

/// Strips markup, folds typographic punctuation and collapses whitespace.
pub fn clean_text(input: &str) -> String {
    let stripped = if input.contains('<') || input.contains('&') {
        strip_markup(input)
    } else {
        input.to_string()
    };
    let folded: String = stripped.chars().filter_map(fold_char).collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn strip_markup(input: &str) -> String {
    let fragment = Html::parse_fragment(input);
    let mut parts = Vec::new();
    for node in fragment.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .is_some_and(|e| matches!(e.name(), "script" | "style" | "template"))
        });
        if !hidden {
            parts.push(text.to_string());
        }
    }
    parts.join(" ")
}

fn fold_char(ch: char) -> Option<char> {
    match ch {
        '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}' | '\u{00AD}' => None,
        '\u{00A0}' | '\u{2007}' | '\u{202F}' => Some(' '),
        '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' | '\u{2032}' => Some('\''),
        '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' | '\u{2033}' => Some('"'),
        '\u{2010}'..='\u{2015}' | '\u{2212}' | '\u{FE63}' | '\u{FF0D}' => Some('-'),
        other => Some(other),
    }
}

/// Parameterized extraction pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractorProfile {
    pub name: String,
    pub version: u32,
    pub families: Vec<FundingPattern>,
    pub min_match_confidence: f64,
    pub require_currency: bool,
}

impl ExtractorProfile {
    pub fn broad() -> Self {
        Self {
            name: "broad".into(),
            version: 1,
            families: vec![
                FundingPattern::TotalPool,
                FundingPattern::PerProjectExact,
                FundingPattern::PerProjectRange,
            ],
            min_match_confidence: 0.0,
            require_currency: false,
        }
    }

    pub fn strict() -> Self {
        Self {
            name: "strict".into(),
            require_currency: true,
            min_match_confidence: 0.6,
            ..Self::broad()
        }
    }

    pub fn extractor_version(&self, library_version: u64) -> String {
        format!("{}@{}/lib-v{}", self.name, self.version, library_version)
    }

    fn admits(&self, m: &Match) -> bool {
        m.confidence >= self.min_match_confidence
            && (!self.require_currency || m.value.currency().is_some())
    }
}

pub trait SignalExtractor: Send + Sync {
    fn profile(&self) -> &ExtractorProfile;

    /// Never fails: unusable input yields a single sparse `unknown` candidate.
    fn extract(&self, text: &NormalizedText, library: &CompiledLibrary) -> Vec<ExtractionCandidate>;
}

#[derive(Debug, Clone)]
pub struct PatternExtractor {
    profile: ExtractorProfile,
}

impl PatternExtractor {
    pub fn new(profile: ExtractorProfile) -> Self {
        Self { profile }
    }
}

pub const BUILTIN_PROFILES: [&str; 2] = ["broad", "strict"];

pub fn extractor_for_profile(name: &str) -> Option<Box<dyn SignalExtractor>> {
    match name.trim() {
        "broad" => Some(Box::new(PatternExtractor::new(ExtractorProfile::broad()))),
        "strict" => Some(Box::new(PatternExtractor::new(ExtractorProfile::strict()))),
        _ => None,
    }
}

impl SignalExtractor for PatternExtractor {
    fn profile(&self) -> &ExtractorProfile {
        &self.profile
    }

    fn extract(&self, text: &NormalizedText, library: &CompiledLibrary) -> Vec<ExtractionCandidate> {
        let version = self.profile.extractor_version(library.version());
        if !text.has_usable_text() {
            warn!(raw_item_id = %text.raw_item_id, extractor = %version, "no usable text");
            let fields = title_field(text, &version).into_iter().collect();
            return vec![build_candidate(
                text,
                &version,
                FundingPattern::Unknown,
                fields,
                vec!["malformed input: no usable text".to_string()],
            )];
        }

        let reference = text.reference_date();
        let scan = |pattern_type: PatternType| library.match_text(&text.text, pattern_type, reference);

        let mut funding = Vec::new();
        for family in &self.profile.families {
            if let Some(pattern_type) = PatternType::for_family(*family) {
                funding.extend(scan(pattern_type).into_iter().filter(|m| self.profile.admits(m)));
            }
        }
        let funding = resolve_family_overlaps(funding);

        let mut best_by_family: BTreeMap<FundingPattern, &Match> = BTreeMap::new();
        for m in &funding {
            let Some(family) = m.pattern_type.family() else {
                continue;
            };
            best_by_family
                .entry(family)
                .and_modify(|best| {
                    if m.confidence > best.confidence {
                        *best = m;
                    }
                })
                .or_insert(m);
        }

        let shared = shared_fields(text, &version, &scan);
        let currency_fallback = best_match(&scan(PatternType::Currency)).cloned();
        let count_fields = project_count_fields(&scan(PatternType::ProjectCount), &version);

        let mut notes = Vec::new();
        if text.truncated {
            notes.push(format!("text truncated to {MAX_TEXT_CHARS} bytes"));
        }
        if best_by_family.len() > 1 {
            let families: Vec<&str> = best_by_family.keys().map(|f| f.as_str()).collect();
            notes.push(format!("ambiguous funding shape: {}", families.join(", ")));
        }

        if best_by_family.is_empty() {
            let mut fields = shared;
            if let Some(cur) = &currency_fallback {
                insert_match_field(&mut fields, FieldName::Currency, cur, &version);
            }
            let mut notes = notes;
            notes.push("no funding amount recognized".to_string());
            return vec![build_candidate(text, &version, FundingPattern::Unknown, fields, notes)];
        }

        best_by_family
            .into_iter()
            .map(|(family, shape)| {
                let mut fields = shared.clone();
                insert_shape_fields(&mut fields, shape, &version);
                if shape.value.currency().is_some() {
                    insert_match_field(&mut fields, FieldName::Currency, shape, &version);
                } else if let Some(cur) = &currency_fallback {
                    insert_match_field(&mut fields, FieldName::Currency, cur, &version);
                }
                if family == FundingPattern::TotalPool {
                    fields.extend(count_fields.clone());
                }
                build_candidate(text, &version, family, fields, notes.clone())
            })
            .collect()
    }
}

fn build_candidate(
    text: &NormalizedText,
    version: &str,
    pattern: FundingPattern,
    fields: FieldMap,
    notes: Vec<String>,
) -> ExtractionCandidate {
    let mut overall = weighted_confidence(&fields);
    if !fields.has_amount() {
        overall *= NO_AMOUNT_PENALTY;
    }
    if fields.deadline().is_none() {
        overall *= NO_DEADLINE_PENALTY;
    }
    ExtractionCandidate {
        id: ExtractionCandidate::deterministic_id(&text.raw_item_id, version, pattern),
        raw_item_id: text.raw_item_id.clone(),
        extractor_version: version.to_string(),
        funding_pattern: pattern,
        fields,
        overall_confidence: overall,
        notes,
    }
}

fn evidence(m: &Match) -> Evidence {
    Evidence {
        rule_id: m.rule_id.clone(),
        start: m.start,
        end: m.end,
        snippet: m.snippet.clone(),
    }
}

/// Highest confidence wins; ties keep the earliest match.
fn best_match(matches: &[Match]) -> Option<&Match> {
    matches.iter().fold(None, |best: Option<&Match>, m| match best {
        Some(b) if b.confidence >= m.confidence => Some(b),
        _ => Some(m),
    })
}

fn title_field(text: &NormalizedText, version: &str) -> Option<(FieldName, FieldValue)> {
    (!text.title.is_empty()).then(|| {
        (
            FieldName::Title,
            FieldValue::new(FieldData::Text(text.title.clone()), TITLE_CONFIDENCE, version),
        )
    })
}

fn insert_match_field(fields: &mut FieldMap, name: FieldName, m: &Match, version: &str) {
    let data = match (&m.value, name) {
        (value, FieldName::Currency) => match value.currency() {
            Some(code) => FieldData::Currency(code.to_string()),
            None => return,
        },
        (MatchValue::Deadline { deadline, .. }, _) => FieldData::Deadline(*deadline),
        _ => return,
    };
    fields.insert(
        name,
        FieldValue::new(data, m.confidence, version).with_evidence(evidence(m)),
    );
}

fn insert_shape_fields(fields: &mut FieldMap, m: &Match, version: &str) {
    let value = |amount: f64| {
        FieldValue::new(FieldData::Amount(amount), m.confidence, version).with_evidence(evidence(m))
    };
    match &m.value {
        MatchValue::Pool { total, .. } => {
            fields.insert(FieldName::TotalAmount, value(*total));
        }
        MatchValue::Exact { amount, .. } => {
            fields.insert(FieldName::ExactAmountPerProject, value(*amount));
        }
        MatchValue::Range { min, max, .. } => {
            fields.insert(FieldName::MinAmountPerProject, value(*min));
            fields.insert(FieldName::MaxAmountPerProject, value(*max));
        }
        _ => {}
    }
}

fn project_count_fields(matches: &[Match], version: &str) -> FieldMap {
    let mut fields = FieldMap::new();
    let Some(best) = best_match(matches) else {
        return fields;
    };
    let value = |count: u32| {
        FieldValue::new(FieldData::Count(count), best.confidence, version).with_evidence(evidence(best))
    };
    match best.value {
        MatchValue::Count { count } => {
            fields.insert(FieldName::ProjectCount, value(count));
        }
        MatchValue::CountRange { min, max } => {
            fields.insert(FieldName::ProjectCountMin, value(min));
            fields.insert(FieldName::ProjectCountMax, value(max));
        }
        _ => {}
    }
    fields
}

/// Tag set from a keyword family, with the confidence and evidence of its strongest match.
fn tag_set<T: Ord + std::str::FromStr>(matches: &[Match]) -> Option<(BTreeSet<T>, &Match)> {
    let tags: BTreeSet<T> = matches
        .iter()
        .filter_map(|m| match &m.value {
            MatchValue::Tag { tag } => tag.parse().ok(),
            _ => None,
        })
        .collect();
    if tags.is_empty() {
        return None;
    }
    best_match(matches).map(|best| (tags, best))
}

fn shared_fields<F>(text: &NormalizedText, version: &str, scan: &F) -> FieldMap
where
    F: Fn(PatternType) -> Vec<Match>,
{
    let mut fields: FieldMap = title_field(text, version).into_iter().collect();
    let tagged = |data: FieldData, m: &Match| {
        FieldValue::new(data, m.confidence, version).with_evidence(evidence(m))
    };

    if let Some(deadline) = best_match(&scan(PatternType::Deadline)) {
        insert_match_field(&mut fields, FieldName::Deadline, deadline, version);
    }

    let audience = scan(PatternType::Audience);
    if let Some((tags, best)) = tag_set::<AudienceTag>(&audience) {
        fields.insert(FieldName::TargetAudience, tagged(FieldData::Audience(tags), best));
    }

    let focus = scan(PatternType::Focus);
    for m in &focus {
        let MatchValue::Tag { tag } = &m.value else {
            continue;
        };
        let Ok(focus_tag) = tag.parse::<FocusTag>() else {
            continue;
        };
        let name = focus_tag.field_name();
        let stronger = fields.get(&name).map_or(true, |f| m.confidence > f.confidence);
        if stronger {
            fields.insert(name, tagged(FieldData::Flag(true), m));
        }
    }

    let sectors = scan(PatternType::AiSubsector);
    if let Some((tags, best)) = tag_set::<AiSubsector>(&sectors) {
        fields.insert(FieldName::AiSubsectors, tagged(FieldData::Subsectors(tags), best));
    }

    let geography = scan(PatternType::Geography);
    let regions: BTreeSet<String> = geography
        .iter()
        .filter_map(|m| match &m.value {
            MatchValue::Tag { tag } => Some(tag.clone()),
            _ => None,
        })
        .collect();
    if let Some(best) = best_match(&geography) {
        fields.insert(FieldName::Geography, tagged(FieldData::Regions(regions), best));
    }

    if let Some(best) = best_match(&scan(PatternType::ApplicationProcess)) {
        fields.insert(FieldName::ApplicationProcess, tagged(FieldData::Flag(true), best));
    }
    fields
}

/// Reads one raw item stored as JSON.
pub fn load_fixture_item(path: impl AsRef<Path>) -> Result<RawItem> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}
