//! Versioned pattern library: YAML rule files, rule validation, compiled matching and
//! the amount/date/currency parsers the rules rely on.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Datelike, NaiveDate};
use fundsig_core::{Deadline, Matcher, PatternLibrary, PatternRule, PatternType};
use regex::{Captures, Regex};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "fundsig-patterns";

/// Rule set shipped with the binary.
pub const DEFAULT_RULES_YAML: &str = include_str!("../../../rules/patterns.yaml");

#[derive(Debug, Error)]
pub enum PatternLibraryError {
    #[error("reading rule file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing rule file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("duplicate rule id `{0}`")]
    DuplicateRuleId(String),
    #[error("rule `{rule_id}` has confidence prior {prior} outside [0, 1]")]
    InvalidPrior { rule_id: String, prior: f64 },
    #[error("rule `{rule_id}` has an invalid regex: {source}")]
    InvalidRegex {
        rule_id: String,
        #[source]
        source: regex::Error,
    },
    #[error("rule `{rule_id}` emits tag `{tag}`, which {pattern_type:?} rules cannot carry")]
    InvalidTag {
        rule_id: String,
        tag: String,
        pattern_type: PatternType,
    },
    #[error("rule `{rule_id}` has an empty keyword list")]
    EmptyKeywords { rule_id: String },
    #[error("rule `{rule_id}` has keyword `{keyword}` that is blank or not word-bounded")]
    InvalidKeyword { rule_id: String, keyword: String },
    #[error("rule `{rule_id}` is missing capture group `{group}`")]
    MissingCaptureGroup { rule_id: String, group: &'static str },
    #[error("rule `{rule_id}` uses a {matcher} matcher, which {pattern_type:?} rules do not accept")]
    MatcherKindMismatch {
        rule_id: String,
        pattern_type: PatternType,
        matcher: &'static str,
    },
}

pub fn parse_library(yaml: &str) -> Result<PatternLibrary, PatternLibraryError> {
    Ok(serde_yaml::from_str(yaml)?)
}

pub fn default_library() -> Result<PatternLibrary, PatternLibraryError> {
    parse_library(DEFAULT_RULES_YAML)
}

pub fn load_library(path: impl AsRef<Path>) -> Result<PatternLibrary, PatternLibraryError> {
    let path = path.as_ref();
    let yaml = fs::read_to_string(path).map_err(|source| PatternLibraryError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_library(&yaml)
}

/// Typed value pulled out of a single rule match.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchValue {
    Pool {
        total: f64,
        currency: Option<String>,
    },
    Exact {
        amount: f64,
        currency: Option<String>,
    },
    Range {
        min: f64,
        max: f64,
        currency: Option<String>,
    },
    Count {
        count: u32,
    },
    CountRange {
        min: u32,
        max: u32,
    },
    Deadline {
        deadline: Deadline,
        explicit_year: bool,
    },
    Currency {
        code: String,
    },
    Tag {
        tag: String,
    },
}

impl MatchValue {
    /// Currency named inside a monetary match, if any.
    pub fn currency(&self) -> Option<&str> {
        match self {
            Self::Pool { currency, .. }
            | Self::Exact { currency, .. }
            | Self::Range { currency, .. } => currency.as_deref(),
            Self::Currency { code } => Some(code.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Match {
    pub rule_id: String,
    pub pattern_type: PatternType,
    /// Byte offsets into the matched text.
    pub start: usize,
    pub end: usize,
    pub snippet: String,
    pub value: MatchValue,
    pub confidence_prior: f64,
    pub confidence: f64,
}

impl Match {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    pub fn overlaps(&self, other: &Match) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    id: String,
    pattern_type: PatternType,
    confidence_prior: f64,
    is_active: bool,
    regex: Regex,
    tag: Option<String>,
}

/// Immutable, validated snapshot of a [`PatternLibrary`] ready for matching.
#[derive(Debug, Clone)]
pub struct CompiledLibrary {
    library: PatternLibrary,
    rules: Vec<CompiledRule>,
}

impl CompiledLibrary {
    pub fn compile(library: PatternLibrary) -> Result<Self, PatternLibraryError> {
        let mut seen = HashSet::new();
        let mut rules = Vec::with_capacity(library.rules.len());
        for rule in &library.rules {
            if !seen.insert(rule.id.as_str()) {
                return Err(PatternLibraryError::DuplicateRuleId(rule.id.clone()));
            }
            rules.push(compile_rule(rule)?);
        }
        Ok(Self { library, rules })
    }

    pub fn default_rules() -> Result<Self, PatternLibraryError> {
        Self::compile(default_library()?)
    }

    pub fn version(&self) -> u64 {
        self.library.version
    }

    /// Serializable form, including learning counters.
    pub fn snapshot(&self) -> &PatternLibrary {
        &self.library
    }

    pub fn active_rule_count(&self) -> usize {
        self.rules.iter().filter(|r| r.is_active).count()
    }

    /// All matches of active rules of one family, ordered by position then rule id.
    /// `reference` anchors yearless dates.
    pub fn match_text(&self, text: &str, pattern_type: PatternType, reference: NaiveDate) -> Vec<Match> {
        let mut out = Vec::new();
        for rule in self
            .rules
            .iter()
            .filter(|r| r.is_active && r.pattern_type == pattern_type)
        {
            for caps in rule.regex.captures_iter(text) {
                let Some(whole) = caps.get(0) else {
                    continue;
                };
                let Some((value, specificity)) = interpret(rule, &caps, reference) else {
                    continue;
                };
                out.push(Match {
                    rule_id: rule.id.clone(),
                    pattern_type,
                    start: whole.start(),
                    end: whole.end(),
                    snippet: whole.as_str().trim().to_string(),
                    value,
                    confidence_prior: rule.confidence_prior,
                    confidence: (rule.confidence_prior * specificity).clamp(0.0, 1.0),
                });
            }
        }
        out.sort_by(|a, b| {
            a.start
                .cmp(&b.start)
                .then(a.end.cmp(&b.end))
                .then_with(|| a.rule_id.cmp(&b.rule_id))
        });
        out
    }
}

fn compile_rule(rule: &PatternRule) -> Result<CompiledRule, PatternLibraryError> {
    if !(0.0..=1.0).contains(&rule.confidence_prior) {
        return Err(PatternLibraryError::InvalidPrior {
            rule_id: rule.id.clone(),
            prior: rule.confidence_prior,
        });
    }
    let mismatch = |matcher: &'static str| PatternLibraryError::MatcherKindMismatch {
        rule_id: rule.id.clone(),
        pattern_type: rule.pattern_type,
        matcher,
    };
    let (regex, tag) = match &rule.matcher {
        Matcher::Regex { pattern } => {
            if is_keyword_family(rule.pattern_type) {
                return Err(mismatch("regex"));
            }
            let regex = Regex::new(pattern).map_err(|source| PatternLibraryError::InvalidRegex {
                rule_id: rule.id.clone(),
                source,
            })?;
            check_capture_groups(rule, &regex)?;
            (regex, None)
        }
        Matcher::Keywords { any_of, tag } => {
            if !accepts_keywords(rule.pattern_type) {
                return Err(mismatch("keywords"));
            }
            if !rule.pattern_type.accepts_tag(tag) {
                return Err(PatternLibraryError::InvalidTag {
                    rule_id: rule.id.clone(),
                    tag: tag.clone(),
                    pattern_type: rule.pattern_type,
                });
            }
            (keyword_regex(&rule.id, any_of)?, Some(tag.clone()))
        }
    };
    Ok(CompiledRule {
        id: rule.id.clone(),
        pattern_type: rule.pattern_type,
        confidence_prior: rule.confidence_prior,
        is_active: rule.is_active,
        regex,
        tag,
    })
}

fn is_keyword_family(pattern_type: PatternType) -> bool {
    matches!(
        pattern_type,
        PatternType::Audience
            | PatternType::Focus
            | PatternType::AiSubsector
            | PatternType::Geography
            | PatternType::ApplicationProcess
    )
}

fn accepts_keywords(pattern_type: PatternType) -> bool {
    is_keyword_family(pattern_type) || pattern_type == PatternType::Deadline
}

fn check_capture_groups(rule: &PatternRule, regex: &Regex) -> Result<(), PatternLibraryError> {
    let names: HashSet<&str> = regex.capture_names().flatten().collect();
    let required: &[&'static str] = match rule.pattern_type {
        PatternType::TotalPool | PatternType::PerProjectExact => &["amount"],
        PatternType::PerProjectRange => &["min", "max"],
        PatternType::ProjectCount if names.contains("count") => &["count"],
        PatternType::ProjectCount => &["count_min", "count_max"],
        PatternType::Deadline => &["date"],
        PatternType::Currency => &["cur"],
        _ => &[],
    };
    match required.iter().find(|group| !names.contains(**group)) {
        Some(group) => Err(PatternLibraryError::MissingCaptureGroup {
            rule_id: rule.id.clone(),
            group: *group,
        }),
        None => Ok(()),
    }
}

/// Case-insensitive, word-bounded alternation; inner whitespace matches any run of spaces.
fn keyword_regex(rule_id: &str, keywords: &[String]) -> Result<Regex, PatternLibraryError> {
    if keywords.is_empty() {
        return Err(PatternLibraryError::EmptyKeywords {
            rule_id: rule_id.to_string(),
        });
    }
    let mut alternatives = Vec::with_capacity(keywords.len());
    for keyword in keywords {
        let trimmed = keyword.trim();
        let bounded = trimmed.chars().next().is_some_and(char::is_alphanumeric)
            && trimmed.chars().last().is_some_and(char::is_alphanumeric);
        if !bounded {
            return Err(PatternLibraryError::InvalidKeyword {
                rule_id: rule_id.to_string(),
                keyword: keyword.clone(),
            });
        }
        let words: Vec<String> = trimmed.split_whitespace().map(regex::escape).collect();
        alternatives.push(words.join(r"\s+"));
    }
    let pattern = format!(r"(?i)\b(?:{})\b", alternatives.join("|"));
    Regex::new(&pattern).map_err(|source| PatternLibraryError::InvalidRegex {
        rule_id: rule_id.to_string(),
        source,
    })
}

/// Turns one capture into a typed value and its specificity weight. `None` discards it.
fn interpret(rule: &CompiledRule, caps: &Captures<'_>, reference: NaiveDate) -> Option<(MatchValue, f64)> {
    let text = |name: &str| caps.name(name).map(|m| m.as_str());
    match rule.pattern_type {
        PatternType::TotalPool | PatternType::PerProjectExact => {
            let unit = text("unit");
            let amount = parse_amount(text("amount")?, unit)?;
            if amount <= 0.0 {
                return None;
            }
            let currency = text("cur").and_then(resolve_currency);
            let specificity = amount_specificity(currency.is_some(), unit.is_some() || text("qualifier").is_some());
            let value = if rule.pattern_type == PatternType::TotalPool {
                MatchValue::Pool { total: amount, currency }
            } else {
                MatchValue::Exact { amount, currency }
            };
            Some((value, specificity))
        }
        PatternType::PerProjectRange => {
            let min_unit = text("min_unit");
            let max_unit = text("max_unit");
            let raw_min = parse_amount(text("min")?, None)?;
            let raw_max = parse_amount(text("max")?, None)?;
            // "$10-20k": a bare lower bound borrows the upper bound's magnitude.
            let min_unit = min_unit.or(if raw_min < raw_max { max_unit } else { None });
            let min = parse_amount(text("min")?, min_unit)?;
            let max = parse_amount(text("max")?, max_unit)?;
            if min > max {
                warn!(
                    rule_id = %rule.id,
                    min,
                    max,
                    snippet = caps.get(0).map(|m| m.as_str()).unwrap_or_default(),
                    "discarding inverted amount range"
                );
                return None;
            }
            let currency = text("cur").and_then(resolve_currency);
            let qualified = min_unit.is_some() || max_unit.is_some() || text("qualifier").is_some();
            let specificity = amount_specificity(currency.is_some(), qualified);
            Some((MatchValue::Range { min, max, currency }, specificity))
        }
        PatternType::ProjectCount => {
            if let Some(count) = text("count") {
                let count: u32 = count.parse().ok()?;
                return (count > 0).then_some((MatchValue::Count { count }, 0.9));
            }
            let min: u32 = text("count_min")?.parse().ok()?;
            let max: u32 = text("count_max")?.parse().ok()?;
            if min > max {
                warn!(rule_id = %rule.id, min, max, "discarding inverted project count range");
                return None;
            }
            Some((MatchValue::CountRange { min, max }, 0.9))
        }
        PatternType::Deadline => {
            if rule.tag.is_some() {
                return Some((
                    MatchValue::Deadline {
                        deadline: Deadline::Rolling,
                        explicit_year: false,
                    },
                    0.9,
                ));
            }
            let phrase = text("date")?;
            let Some(parsed) = parse_date(phrase, reference) else {
                debug!(rule_id = %rule.id, phrase, "unparseable deadline phrase");
                return None;
            };
            let specificity = if parsed.explicit_year { 1.0 } else { 0.85 };
            Some((
                MatchValue::Deadline {
                    deadline: Deadline::Date(parsed.date),
                    explicit_year: parsed.explicit_year,
                },
                specificity,
            ))
        }
        PatternType::Currency => {
            let code = resolve_currency(text("cur")?)?;
            Some((MatchValue::Currency { code }, 0.9))
        }
        _ => {
            let tag = rule.tag.clone()?;
            Some((MatchValue::Tag { tag }, 0.9))
        }
    }
}

fn amount_specificity(explicit_currency: bool, qualified: bool) -> f64 {
    let mut specificity: f64 = 0.8;
    if explicit_currency {
        specificity += 0.15;
    }
    if qualified {
        specificity += 0.05;
    }
    specificity.min(1.0)
}

/// Parses `"1,250.5"` style numbers with an optional magnitude word.
pub fn parse_amount(number: &str, unit: Option<&str>) -> Option<f64> {
    let cleaned: String = number.chars().filter(|c| *c != ',' && !c.is_whitespace()).collect();
    let base: f64 = cleaned.parse().ok()?;
    let multiplier = match unit.map(|u| u.trim().to_ascii_lowercase()).as_deref() {
        None | Some("") => 1.0,
        Some("k") | Some("thousand") => 1e3,
        Some("m") | Some("mn") | Some("million") => 1e6,
        Some("b") | Some("bn") | Some("billion") => 1e9,
        Some(_) => return None,
    };
    let value = base * multiplier;
    value.is_finite().then_some(value)
}

/// Maps a currency symbol or ISO code to an ISO code.
pub fn resolve_currency(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let code = match raw {
        "$" => "USD",
        "€" => "EUR",
        "£" => "GBP",
        "¥" => "JPY",
        "₹" => "INR",
        other if other.len() == 3 && other.chars().all(|c| c.is_ascii_alphabetic()) => {
            return Some(other.to_ascii_uppercase());
        }
        _ => return None,
    };
    Some(code.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedDate {
    pub date: NaiveDate,
    pub explicit_year: bool,
}

const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

fn month_number(token: &str) -> Option<u32> {
    let prefix: String = token.chars().take(3).collect();
    MONTHS
        .iter()
        .position(|m| *m == prefix)
        .map(|idx| idx as u32 + 1)
}

fn strip_ordinal(token: &str) -> &str {
    ["st", "nd", "rd", "th"]
        .iter()
        .find_map(|suffix| token.strip_suffix(suffix))
        .filter(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(token)
}

/// Parses ISO, `MM/DD/YYYY` (or `DD/MM/YYYY` when the first part exceeds 12), `D.M.YYYY`,
/// `Month D[, YYYY]` and `D [of] Month[ YYYY]`. Yearless dates resolve to the next
/// occurrence on or after `reference`.
pub fn parse_date(phrase: &str, reference: NaiveDate) -> Option<ParsedDate> {
    let phrase = phrase.trim().to_lowercase();
    if let Some(parsed) = parse_numeric_date(&phrase) {
        return Some(ParsedDate {
            date: parsed,
            explicit_year: true,
        });
    }

    let tokens: Vec<&str> = phrase
        .split(|c: char| c.is_whitespace() || c == ',' || c == '.')
        .filter(|t| !t.is_empty() && *t != "of")
        .collect();
    let (month, day, year) = match tokens.as_slice() {
        [first, second, rest @ ..] if month_number(first).is_some() => {
            (month_number(first)?, strip_ordinal(second).parse::<u32>().ok()?, rest.first())
        }
        [first, second, rest @ ..] => {
            (month_number(second)?, strip_ordinal(first).parse::<u32>().ok()?, rest.first())
        }
        _ => return None,
    };

    match year {
        Some(year) => {
            let year: i32 = year.parse().ok()?;
            Some(ParsedDate {
                date: NaiveDate::from_ymd_opt(year, month, day)?,
                explicit_year: true,
            })
        }
        None => (reference.year()..=reference.year() + 4)
            .filter_map(|year| NaiveDate::from_ymd_opt(year, month, day))
            .find(|date| *date >= reference)
            .map(|date| ParsedDate {
                date,
                explicit_year: false,
            }),
    }
}

fn parse_numeric_date(phrase: &str) -> Option<NaiveDate> {
    if let Ok(date) = NaiveDate::parse_from_str(phrase, "%Y-%m-%d") {
        return Some(date);
    }
    let parts = |sep: char| -> Option<(u32, u32, i32)> {
        let mut it = phrase.split(sep);
        let a = it.next()?.parse().ok()?;
        let b = it.next()?.parse().ok()?;
        let y = it.next()?.parse().ok()?;
        it.next().is_none().then_some((a, b, y))
    };
    if let Some((a, b, year)) = parts('/') {
        let (month, day) = if a > 12 { (b, a) } else { (a, b) };
        return NaiveDate::from_ymd_opt(year, month, day);
    }
    if let Some((day, month, year)) = parts('.') {
        return NaiveDate::from_ymd_opt(year, month, day);
    }
    None
}

/// Drops funding-family matches whose span overlaps a longer match of another family.
/// Equal spans keep the more confident match.
pub fn resolve_family_overlaps(matches: Vec<Match>) -> Vec<Match> {
    let mut ordered = matches;
    ordered.sort_by(|a, b| {
        b.len()
            .cmp(&a.len())
            .then(b.confidence.total_cmp(&a.confidence))
            .then(a.start.cmp(&b.start))
            .then_with(|| a.rule_id.cmp(&b.rule_id))
    });
    let mut kept: Vec<Match> = Vec::with_capacity(ordered.len());
    for candidate in ordered {
        let shadowed_by = kept
            .iter()
            .find(|k| k.pattern_type != candidate.pattern_type && k.overlaps(&candidate));
        if let Some(winner) = shadowed_by {
            debug!(
                dropped = %candidate.rule_id,
                kept = %winner.rule_id,
                "overlapping funding evidence resolved to the longer span"
            );
            continue;
        }
        kept.push(candidate);
    }
    kept.sort_by(|a, b| {
        a.start
            .cmp(&b.start)
            .then(a.end.cmp(&b.end))
            .then_with(|| a.rule_id.cmp(&b.rule_id))
    });
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 15).unwrap()
    }

    fn library() -> CompiledLibrary {
        CompiledLibrary::default_rules().unwrap()
    }

    fn tags(lib: &CompiledLibrary, text: &str, pattern_type: PatternType) -> Vec<String> {
        lib.match_text(text, pattern_type, reference())
            .into_iter()
            .filter_map(|m| match m.value {
                MatchValue::Tag { tag } => Some(tag),
                _ => None,
            })
            .collect()
    }

    fn regex_rule(id: &str, pattern_type: PatternType, pattern: &str) -> PatternRule {
        PatternRule {
            id: id.into(),
            pattern_type,
            matcher: Matcher::Regex {
                pattern: pattern.into(),
            },
            confidence_prior: 0.8,
            times_applied: 0,
            successes: 0,
            success_rate: 0.0,
            is_active: true,
            description: None,
        }
    }

    #[test]
    fn default_rules_compile() {
        let lib = library();
        assert_eq!(lib.version(), 1);
        assert!(lib.snapshot().rules.len() >= 30);
        assert_eq!(lib.active_rule_count(), lib.snapshot().rules.len());
    }

    #[test]
    fn pool_announcement_yields_total_count_and_sectors() {
        let lib = library();
        let text = "$5 million fund to support up to 20 AI projects in healthcare";
        let pools = lib.match_text(text, PatternType::TotalPool, reference());
        assert_eq!(pools.len(), 1);
        assert_eq!(
            pools[0].value,
            MatchValue::Pool {
                total: 5_000_000.0,
                currency: Some("USD".into())
            }
        );
        assert!((pools[0].confidence - 0.85).abs() < 1e-9);

        let counts = lib.match_text(text, PatternType::ProjectCount, reference());
        assert_eq!(counts[0].value, MatchValue::Count { count: 20 });

        let sectors = tags(&lib, text, PatternType::AiSubsector);
        assert!(sectors.contains(&"healthtech".to_string()));
        assert!(sectors.contains(&"general_ai".to_string()));
    }

    #[test]
    fn exact_grant_with_yearless_deadline() {
        let lib = library();
        let text = "Grants of exactly $50,000 each for youth-led startups, deadline March 1";
        let exact = lib.match_text(text, PatternType::PerProjectExact, reference());
        let best = exact
            .iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
            .unwrap();
        assert_eq!(best.rule_id, "pe-grants-of-each");
        assert_eq!(
            best.value,
            MatchValue::Exact {
                amount: 50_000.0,
                currency: Some("USD".into())
            }
        );

        let deadlines = lib.match_text(text, PatternType::Deadline, reference());
        assert_eq!(
            deadlines[0].value,
            MatchValue::Deadline {
                deadline: Deadline::Date(NaiveDate::from_ymd_opt(2027, 3, 1).unwrap()),
                explicit_year: false,
            }
        );
        assert_eq!(tags(&lib, text, PatternType::Focus), vec!["youth".to_string()]);
        assert_eq!(tags(&lib, text, PatternType::Audience), vec!["startups".to_string()]);
    }

    #[test]
    fn inverted_range_is_discarded_not_swapped() {
        let lib = library();
        let text = "Awards of $20,000-$10,000 per project";
        assert!(lib
            .match_text(text, PatternType::PerProjectRange, reference())
            .is_empty());
    }

    #[test]
    fn bare_lower_bound_borrows_magnitude() {
        let lib = library();
        let ranges = lib.match_text("Funding: $10-20k per team", PatternType::PerProjectRange, reference());
        assert_eq!(
            ranges[0].value,
            MatchValue::Range {
                min: 10_000.0,
                max: 20_000.0,
                currency: Some("USD".into())
            }
        );
    }

    #[test]
    fn range_span_shadows_overlapping_exact_match() {
        let lib = library();
        let text = "Grants range $10,000-$20,000 per project.";
        let mut all = lib.match_text(text, PatternType::PerProjectRange, reference());
        all.extend(lib.match_text(text, PatternType::PerProjectExact, reference()));
        assert_eq!(all.len(), 2);
        let kept = resolve_family_overlaps(all);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].pattern_type, PatternType::PerProjectRange);
    }

    #[test]
    fn disjoint_spans_from_different_families_are_kept() {
        let lib = library();
        let text = "A $2 million fund. Each winner receives $15,000 per project.";
        let mut all = lib.match_text(text, PatternType::TotalPool, reference());
        all.extend(lib.match_text(text, PatternType::PerProjectExact, reference()));
        assert_eq!(resolve_family_overlaps(all).len(), 2);
    }

    #[test]
    fn parses_amount_magnitudes() {
        assert_eq!(parse_amount("1,250", None), Some(1250.0));
        assert_eq!(parse_amount("2.5", Some("m")), Some(2_500_000.0));
        assert_eq!(parse_amount("3", Some("Bn")), Some(3e9));
        assert_eq!(parse_amount("40", Some("thousand")), Some(40_000.0));
        assert_eq!(parse_amount("x", None), None);
    }

    #[test]
    fn resolves_symbols_and_codes() {
        assert_eq!(resolve_currency("$").as_deref(), Some("USD"));
        assert_eq!(resolve_currency("€").as_deref(), Some("EUR"));
        assert_eq!(resolve_currency("kes").as_deref(), Some("KES"));
        assert_eq!(resolve_currency("#"), None);
    }

    #[test]
    fn parses_date_shapes() {
        let r = reference();
        let ymd = |y, m, d| NaiveDate::from_ymd_opt(y, m, d).unwrap();
        assert_eq!(parse_date("2026-04-30", r).unwrap().date, ymd(2026, 4, 30));
        assert_eq!(parse_date("04/30/2026", r).unwrap().date, ymd(2026, 4, 30));
        assert_eq!(parse_date("30/04/2026", r).unwrap().date, ymd(2026, 4, 30));
        assert_eq!(parse_date("1.6.2026", r).unwrap().date, ymd(2026, 6, 1));
        assert_eq!(parse_date("15th of May 2026", r).unwrap().date, ymd(2026, 5, 15));
        assert_eq!(parse_date("Sept. 3, 2026", r).unwrap().date, ymd(2026, 9, 3));
        let yearless = parse_date("April 2", r).unwrap();
        assert_eq!(yearless.date, ymd(2026, 4, 2));
        assert!(!yearless.explicit_year);
        assert!(parse_date("February 30, 2026", r).is_none());
    }

    #[test]
    fn rolling_keywords_produce_rolling_deadline() {
        let lib = library();
        let found = lib.match_text("Applications reviewed on a rolling basis.", PatternType::Deadline, reference());
        assert_eq!(found.len(), 1);
        assert!(matches!(
            found[0].value,
            MatchValue::Deadline {
                deadline: Deadline::Rolling,
                ..
            }
        ));
    }

    #[test]
    fn inactive_rules_are_skipped() {
        let mut raw = default_library().unwrap();
        raw.rule_mut("tp-fund-size").unwrap().is_active = false;
        let lib = CompiledLibrary::compile(raw).unwrap();
        let text = "$5 million fund to support projects";
        assert!(lib.match_text(text, PatternType::TotalPool, reference()).is_empty());
    }

    #[test]
    fn duplicate_ids_are_fatal() {
        let rule = regex_rule("dup", PatternType::Currency, r"(?P<cur>\$)");
        let lib = PatternLibrary {
            version: 1,
            rules: vec![rule.clone(), rule],
        };
        assert!(matches!(
            CompiledLibrary::compile(lib),
            Err(PatternLibraryError::DuplicateRuleId(id)) if id == "dup"
        ));
    }

    #[test]
    fn invalid_rules_are_fatal() {
        let compile_one = |rule: PatternRule| {
            CompiledLibrary::compile(PatternLibrary {
                version: 1,
                rules: vec![rule],
            })
        };
        assert!(matches!(
            compile_one(regex_rule("bad", PatternType::Currency, "(?P<cur>")),
            Err(PatternLibraryError::InvalidRegex { .. })
        ));
        assert!(matches!(
            compile_one(regex_rule("nogroup", PatternType::TotalPool, r"\d+")),
            Err(PatternLibraryError::MissingCaptureGroup { group: "amount", .. })
        ));
        let mut prior = regex_rule("prior", PatternType::Currency, r"(?P<cur>\$)");
        prior.confidence_prior = 1.5;
        assert!(matches!(compile_one(prior), Err(PatternLibraryError::InvalidPrior { .. })));

        let mut keywords = regex_rule("kw", PatternType::Audience, "");
        keywords.matcher = Matcher::Keywords {
            any_of: vec!["founders".into()],
            tag: "pirates".into(),
        };
        assert!(matches!(compile_one(keywords.clone()), Err(PatternLibraryError::InvalidTag { .. })));
        keywords.matcher = Matcher::Keywords {
            any_of: vec![],
            tag: "startups".into(),
        };
        assert!(matches!(compile_one(keywords), Err(PatternLibraryError::EmptyKeywords { .. })));

        let mut wrong_kind = regex_rule("wk", PatternType::PerProjectExact, "");
        wrong_kind.matcher = Matcher::Keywords {
            any_of: vec!["grant".into()],
            tag: "startups".into(),
        };
        assert!(matches!(
            compile_one(wrong_kind),
            Err(PatternLibraryError::MatcherKindMismatch { .. })
        ));
    }

    #[test]
    fn unparseable_yaml_is_a_parse_error() {
        assert!(matches!(
            parse_library("version: [1"),
            Err(PatternLibraryError::Parse(_))
        ));
    }
}
