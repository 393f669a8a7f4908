//! Pipeline orchestration: admission, extraction fan-out, reconciliation, scoring,
//! routing, persistence, and the out-of-band learning loop.

pub mod learning;
pub mod report;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{ensure, Context, Result};
use chrono::{DateTime, Utc};
use fundsig_core::{
    ExtractionCandidate, FieldMapExt, FieldName, FundingPattern, HumanValidation,
    ProcessedRecord, RawItem, RejectionCategory, RejectionRecord, RoutingStatus,
};
use fundsig_extract::{
    extractor_for_profile, load_fixture_item, normalize, NormalizedText, SignalExtractor,
    BUILTIN_PROFILES,
};
use fundsig_patterns::{default_library, load_library, CompiledLibrary};
use fundsig_resolve::{reconcile, route, score, ReconcileConfig, RouterConfig, ScoringConfig};
use fundsig_storage::{parse_jsonl, sha256_hex, write_atomic, Admission, ContentIndex, RecordStore};
use serde::Serialize;
use strsim::jaro_winkler;
use tokio::fs;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use learning::{LearningConfig, LearningLoop, LearningReport, LearningUpdateError};
pub use report::{report_markdown, write_run_report, ParquetManifest, ParquetManifestFile};

pub const CRATE_NAME: &str = "fundsig-pipeline";

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    /// Rule file; the embedded default set when unset.
    pub rules_path: Option<PathBuf>,
    pub profiles: Vec<String>,
    pub router: RouterConfig,
    pub reconcile: ReconcileConfig,
    pub scoring: ScoringConfig,
    pub learning: LearningConfig,
    pub scheduler_enabled: bool,
    pub learning_cron: String,
    pub near_duplicate_threshold: f64,
    /// Most recent titles kept for near-duplicate comparison.
    pub near_duplicate_window: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            rules_path: None,
            profiles: BUILTIN_PROFILES.iter().map(|p| p.to_string()).collect(),
            router: RouterConfig::default(),
            reconcile: ReconcileConfig::default(),
            scoring: ScoringConfig::default(),
            learning: LearningConfig::default(),
            scheduler_enabled: false,
            learning_cron: "0 0 3 * * *".to_string(),
            near_duplicate_threshold: 0.95,
            near_duplicate_window: 5000,
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|part| part.trim().to_ascii_lowercase())
        .filter(|part| !part.is_empty())
        .collect()
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unparseable values fall back to defaults; `validate` catches out-of-range ones.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let float = |key: &str, fallback: f64| {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(fallback)
        };
        let int = |key: &str, fallback: i64| {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(fallback)
        };

        Self {
            data_dir: lookup("FUNDSIG_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            rules_path: lookup("FUNDSIG_RULES_PATH")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            profiles: lookup("FUNDSIG_PROFILES")
                .map(|v| split_list(&v))
                .unwrap_or(defaults.profiles),
            router: RouterConfig {
                min_confidence_auto_approve: float(
                    "FUNDSIG_MIN_CONFIDENCE_AUTO_APPROVE",
                    defaults.router.min_confidence_auto_approve,
                ),
                min_confidence_reject: float(
                    "FUNDSIG_MIN_CONFIDENCE_REJECT",
                    defaults.router.min_confidence_reject,
                ),
            },
            reconcile: ReconcileConfig {
                conflict_margin: float("FUNDSIG_CONFLICT_MARGIN", defaults.reconcile.conflict_margin),
            },
            scoring: ScoringConfig {
                urgent_days: int("FUNDSIG_URGENT_DAYS", defaults.scoring.urgent_days),
                moderate_days: int("FUNDSIG_MODERATE_DAYS", defaults.scoring.moderate_days),
                target_regions: lookup("FUNDSIG_TARGET_REGIONS")
                    .map(|v| split_list(&v).into_iter().collect())
                    .unwrap_or(defaults.scoring.target_regions),
            },
            learning: LearningConfig {
                min_samples: lookup("FUNDSIG_LEARNING_MIN_SAMPLES")
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(defaults.learning.min_samples),
                success_floor: float(
                    "FUNDSIG_LEARNING_SUCCESS_FLOOR",
                    defaults.learning.success_floor,
                ),
            },
            scheduler_enabled: lookup("FUNDSIG_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            learning_cron: lookup("FUNDSIG_LEARNING_CRON").unwrap_or(defaults.learning_cron),
            near_duplicate_threshold: float(
                "FUNDSIG_NEAR_DUPLICATE_THRESHOLD",
                defaults.near_duplicate_threshold,
            ),
            near_duplicate_window: lookup("FUNDSIG_NEAR_DUPLICATE_WINDOW")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.near_duplicate_window),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, value: f64| -> Result<()> {
            ensure!((0.0..=1.0).contains(&value), "{name} must be within [0, 1], got {value}");
            Ok(())
        };
        unit("min_confidence_auto_approve", self.router.min_confidence_auto_approve)?;
        unit("min_confidence_reject", self.router.min_confidence_reject)?;
        ensure!(
            self.router.min_confidence_reject <= self.router.min_confidence_auto_approve,
            "rejection threshold {} exceeds auto-approve threshold {}",
            self.router.min_confidence_reject,
            self.router.min_confidence_auto_approve
        );
        unit("conflict_margin", self.reconcile.conflict_margin)?;
        unit("learning_success_floor", self.learning.success_floor)?;
        unit("near_duplicate_threshold", self.near_duplicate_threshold)?;
        ensure!(
            self.near_duplicate_threshold > 0.0,
            "near_duplicate_threshold must be positive"
        );
        ensure!(
            self.near_duplicate_window > 0,
            "near_duplicate_window must be at least 1"
        );
        ensure!(
            0 <= self.scoring.urgent_days && self.scoring.urgent_days <= self.scoring.moderate_days,
            "urgent_days ({}) must be between 0 and moderate_days ({})",
            self.scoring.urgent_days,
            self.scoring.moderate_days
        );
        ensure!(self.learning.min_samples > 0, "learning_min_samples must be at least 1");
        ensure!(!self.profiles.is_empty(), "at least one extractor profile is required");
        for profile in &self.profiles {
            ensure!(
                extractor_for_profile(profile).is_some(),
                "unknown extractor profile {profile:?}"
            );
        }
        ensure!(
            !self.scheduler_enabled || !self.learning_cron.trim().is_empty(),
            "FUNDSIG_LEARNING_CRON is empty while the scheduler is enabled"
        );
        Ok(())
    }
}

/// Current compiled library. Readers keep the `Arc` they took; publishing swaps it.
pub struct LibraryHandle {
    current: RwLock<Arc<CompiledLibrary>>,
}

impl LibraryHandle {
    pub fn new(library: CompiledLibrary) -> Self {
        Self {
            current: RwLock::new(Arc::new(library)),
        }
    }

    pub fn snapshot(&self) -> Arc<CompiledLibrary> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn publish(&self, library: CompiledLibrary) -> Arc<CompiledLibrary> {
        let next = Arc::new(library);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&next);
        next
    }
}

/// Title similarity against the most recent items that made it past rejection.
#[derive(Debug, Clone)]
pub struct NearDuplicateDetector {
    threshold: f64,
    window: usize,
    seen: VecDeque<(String, String)>,
}

impl NearDuplicateDetector {
    pub fn new(threshold: f64, window: usize) -> Self {
        Self {
            threshold,
            window: window.max(1),
            seen: VecDeque::new(),
        }
    }

    pub fn normalize_title(input: &str) -> String {
        input
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Most similar earlier item at or above the threshold.
    pub fn find(&self, raw_item_id: &str, title: &str) -> Option<(String, f64)> {
        let key = Self::normalize_title(title);
        if key.is_empty() {
            return None;
        }
        self.seen
            .iter()
            .filter(|(id, _)| id != raw_item_id)
            .map(|(id, seen)| (id, jaro_winkler(&key, seen)))
            .filter(|(_, score)| *score >= self.threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(id, score)| (id.clone(), score))
    }

    /// Oldest titles fall out once the window is full.
    pub fn register(&mut self, raw_item_id: &str, title: &str) {
        let key = Self::normalize_title(title);
        if key.is_empty() || self.seen.iter().any(|(id, _)| id == raw_item_id) {
            return;
        }
        self.seen.push_back((raw_item_id.to_string(), key));
        while self.seen.len() > self.window {
            self.seen.pop_front();
        }
    }

    pub fn forget(&mut self, raw_item_id: &str) {
        self.seen.retain(|(id, _)| id != raw_item_id);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    Routed {
        raw_item_id: String,
        content_hash: String,
        status: RoutingStatus,
        funding_pattern: FundingPattern,
        overall_confidence: f64,
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        rejection_category: Option<RejectionCategory>,
        #[serde(skip_serializing_if = "Option::is_none")]
        near_duplicate_of: Option<String>,
    },
    Duplicate {
        raw_item_id: String,
        content_hash: String,
        existing_item_id: String,
    },
    Failed {
        raw_item_id: String,
        error: String,
    },
}

impl ItemOutcome {
    pub fn raw_item_id(&self) -> &str {
        match self {
            Self::Routed { raw_item_id, .. }
            | Self::Duplicate { raw_item_id, .. }
            | Self::Failed { raw_item_id, .. } => raw_item_id,
        }
    }

    pub fn status(&self) -> Option<RoutingStatus> {
        match self {
            Self::Routed { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub library_version: u64,
    pub status_counts: BTreeMap<String, usize>,
    pub duplicates: usize,
    pub failures: usize,
    /// Input order.
    pub outcomes: Vec<ItemOutcome>,
    #[serde(skip)]
    pub records: Vec<ProcessedRecord>,
    #[serde(skip)]
    pub rejections: Vec<RejectionRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_dir: Option<PathBuf>,
}

impl RunSummary {
    pub fn outcome(&self, raw_item_id: &str) -> Option<&ItemOutcome> {
        self.outcomes.iter().find(|o| o.raw_item_id() == raw_item_id)
    }
}

struct ProcessedItem {
    outcome: ItemOutcome,
    record: Option<ProcessedRecord>,
    rejection: Option<RejectionRecord>,
}

impl ProcessedItem {
    fn failed(raw_item_id: &str, error: String) -> Self {
        Self {
            outcome: ItemOutcome::Failed {
                raw_item_id: raw_item_id.to_string(),
                error,
            },
            record: None,
            rejection: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LearningRun {
    pub report: LearningReport,
    /// Validations seen for the first time in this run, applied or skipped.
    pub consumed: usize,
    pub library_path: Option<PathBuf>,
}

struct Inner {
    config: PipelineConfig,
    store: RecordStore,
    library: LibraryHandle,
    index: Mutex<ContentIndex>,
    near_duplicates: Mutex<NearDuplicateDetector>,
    extractors: Vec<Arc<dyn SignalExtractor>>,
    learning: LearningLoop,
    learn_lock: Mutex<()>,
}

#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl Pipeline {
    /// Validates configuration, loads the newest library and rebuilds the duplicate index.
    pub async fn open(config: PipelineConfig) -> Result<Self> {
        config.validate().context("invalid pipeline configuration")?;
        let store = RecordStore::new(config.data_dir.clone());

        let from_rules = match &config.rules_path {
            Some(path) => load_library(path)
                .with_context(|| format!("loading rule file {}", path.display()))?,
            None => default_library().context("parsing embedded rule set")?,
        };
        let library = match store.load_latest_library().await? {
            Some(stored) if stored.version >= from_rules.version => stored,
            _ => {
                store.save_library(&from_rules).await?;
                from_rules
            }
        };
        let compiled = CompiledLibrary::compile(library).context("compiling pattern library")?;
        info!(
            version = compiled.version(),
            active_rules = compiled.active_rule_count(),
            "pattern library loaded"
        );

        let mut extractors: Vec<Arc<dyn SignalExtractor>> = Vec::new();
        for name in &config.profiles {
            let extractor = extractor_for_profile(name)
                .with_context(|| format!("no extractor registered for profile {name}"))?;
            extractors.push(Arc::from(extractor));
        }

        let index = store.rebuild_index().await.context("rebuilding content index")?;
        let mut near_duplicates =
            NearDuplicateDetector::new(config.near_duplicate_threshold, config.near_duplicate_window);
        let mut records = store.load_records().await?;
        records.sort_by_key(|record| record.processed_at);
        for record in &records {
            if record.resolved.status == RoutingStatus::RejectionDatabase {
                continue;
            }
            if let Some(title) = record.resolved.fields.text(FieldName::Title) {
                near_duplicates.register(&record.resolved.raw_item_id, title);
            }
        }
        info!(known_items = index.len(), "content index rebuilt");

        Ok(Self {
            inner: Arc::new(Inner {
                learning: LearningLoop::new(config.learning),
                config,
                store,
                library: LibraryHandle::new(compiled),
                index: Mutex::new(index),
                near_duplicates: Mutex::new(near_duplicates),
                extractors,
                learn_lock: Mutex::new(()),
            }),
        })
    }

    pub async fn open_from_env() -> Result<Self> {
        Self::open(PipelineConfig::from_env()).await
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &RecordStore {
        &self.inner.store
    }

    pub fn library(&self) -> Arc<CompiledLibrary> {
        self.inner.library.snapshot()
    }

    /// Processes a batch; items already seen by hash or url are skipped as duplicates.
    pub async fn process_batch(&self, items: Vec<RawItem>) -> Result<RunSummary> {
        self.run_items(items, false).await
    }

    /// Processes items even when their content was seen before, replacing earlier records.
    pub async fn reprocess(&self, items: Vec<RawItem>) -> Result<RunSummary> {
        self.run_items(items, true).await
    }

    /// Loads input, processes it, and writes the run report.
    pub async fn run_once(&self, input: &Path, force: bool) -> Result<RunSummary> {
        let items = load_input(input).await?;
        let mut summary = self.run_items(items, force).await?;
        let report_dir = write_run_report(&self.inner.config.data_dir, &summary).await?;
        summary.report_dir = Some(report_dir);
        Ok(summary)
    }

    async fn run_items(&self, items: Vec<RawItem>, force: bool) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let library_version = self.inner.library.snapshot().version();
        let ids: Vec<String> = items.iter().map(|item| item.id.clone()).collect();

        let mut tasks = JoinSet::new();
        for (idx, item) in items.into_iter().enumerate() {
            let inner = Arc::clone(&self.inner);
            let span = info_span!("process_item", %run_id, raw_item_id = %item.id);
            tasks.spawn(async move { (idx, inner.process_item(item, force).await) }.instrument(span));
        }

        let mut slots: Vec<Option<ProcessedItem>> = ids.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, Ok(done))) => slots[idx] = Some(done),
                Ok((idx, Err(err))) => {
                    let error = format!("{err:#}");
                    warn!(raw_item_id = %ids[idx], %error, "item failed");
                    slots[idx] = Some(ProcessedItem::failed(&ids[idx], error));
                }
                Err(err) => error!(error = %err, "item task aborted"),
            }
        }

        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            library_version,
            status_counts: BTreeMap::new(),
            duplicates: 0,
            failures: 0,
            outcomes: Vec::with_capacity(ids.len()),
            records: Vec::new(),
            rejections: Vec::new(),
            report_dir: None,
        };
        for (slot, id) in slots.into_iter().zip(&ids) {
            let done = slot.unwrap_or_else(|| ProcessedItem::failed(id, "task aborted".to_string()));
            match &done.outcome {
                ItemOutcome::Routed { status, .. } => {
                    *summary.status_counts.entry(status.to_string()).or_default() += 1;
                }
                ItemOutcome::Duplicate { .. } => summary.duplicates += 1,
                ItemOutcome::Failed { .. } => summary.failures += 1,
            }
            summary.outcomes.push(done.outcome);
            summary.records.extend(done.record);
            summary.rejections.extend(done.rejection);
        }
        summary.finished_at = Utc::now();
        info!(
            %run_id,
            items = ids.len(),
            duplicates = summary.duplicates,
            failures = summary.failures,
            "run complete"
        );
        Ok(summary)
    }

    /// Applies unseen validations and publishes the next library version when anything changed.
    pub async fn learn(&self) -> Result<LearningRun> {
        let inner = &self.inner;
        let _guard = inner.learn_lock.lock().await;
        let current = inner.library.snapshot();

        let records = inner.store.load_records().await?;
        let rejections = inner.store.load_rejections().await?.items;
        let validations = inner.store.load_validations().await?.items;

        let ledger_path = inner.config.data_dir.join("learning").join("applied.json");
        let mut ledger = load_ledger(&ledger_path).await?;
        let mut fresh = Vec::new();
        let mut fresh_keys = Vec::new();
        let mut occurrences: BTreeMap<String, usize> = BTreeMap::new();
        for validation in LearningLoop::collect_validations(&rejections, &validations) {
            let content = validation_key(&validation)?;
            let seen = occurrences.entry(content.clone()).or_default();
            let key = occurrence_key(&content, *seen);
            *seen += 1;
            if !ledger.contains(&key) {
                fresh_keys.push(key);
                fresh.push(validation);
            }
        }
        // Rejection decisions are already folded into `fresh`.
        let lookups: Vec<RejectionRecord> = rejections
            .into_iter()
            .map(|mut r| {
                r.human_decision = None;
                r
            })
            .collect();

        let report = inner
            .learning
            .update(current.snapshot(), &lookups, &fresh, &records);
        let consumed = fresh_keys.len();
        if report.applied == 0 && report.deactivated.is_empty() {
            info!(skipped = report.skipped.len(), "no rule changes to publish");
            if consumed > 0 {
                ledger.extend(fresh_keys);
                save_ledger(&ledger_path, &ledger).await?;
            }
            return Ok(LearningRun {
                report,
                consumed,
                library_path: None,
            });
        }

        let compiled = CompiledLibrary::compile(report.library.clone())
            .context("compiling learned pattern library")?;
        let library_path = inner.store.save_library(&report.library).await?;
        inner.library.publish(compiled);
        ledger.extend(fresh_keys);
        save_ledger(&ledger_path, &ledger).await?;
        info!(
            version = report.library.version,
            path = %library_path.display(),
            "pattern library published"
        );
        Ok(LearningRun {
            report,
            consumed,
            library_path: Some(library_path),
        })
    }

    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.inner.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.inner.config.learning_cron.as_str();
        let pipeline = self.clone();
        let job = Job::new_async(cron, move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                match pipeline.learn().await {
                    Ok(run) => info!(
                        version = run.report.library.version,
                        applied = run.report.applied,
                        "scheduled learning batch finished"
                    ),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled learning batch failed"),
                }
            })
        })
        .with_context(|| format!("creating learning job for cron {cron}"))?;
        sched.add(job).await.context("adding learning job")?;
        Ok(Some(sched))
    }
}

impl Inner {
    async fn process_item(&self, raw: RawItem, force: bool) -> Result<ProcessedItem> {
        let library = self.library.snapshot();
        let text = Arc::new(normalize(&raw));
        let hash = text.content_hash.clone();

        {
            let mut index = self.index.lock().await;
            if force {
                index.register(&hash, &raw.url, &raw.id);
            } else {
                let existing = match index.admit(&hash, &raw.url, &raw.id) {
                    Admission::New => None,
                    Admission::DuplicateHash { existing_item_id } => {
                        warn!(%existing_item_id, content_hash = %hash, "duplicate content hash");
                        Some(existing_item_id)
                    }
                    Admission::DuplicateUrl { existing_item_id } => {
                        warn!(%existing_item_id, url = %raw.url, "duplicate url");
                        Some(existing_item_id)
                    }
                };
                if let Some(existing_item_id) = existing {
                    return Ok(ProcessedItem {
                        outcome: ItemOutcome::Duplicate {
                            raw_item_id: raw.id,
                            content_hash: hash,
                            existing_item_id,
                        },
                        record: None,
                        rejection: None,
                    });
                }
            }
        }

        let raw_item_id = raw.id.clone();
        let url = raw.url.clone();
        match self.evaluate(raw, text, library).await {
            Ok(done) => Ok(done),
            Err(err) => {
                // Nothing was stored, so the content must stay admissible.
                if !force {
                    self.index.lock().await.release(&hash, &url, &raw_item_id);
                }
                self.near_duplicates.lock().await.forget(&raw_item_id);
                Err(err)
            }
        }
    }

    async fn evaluate(
        &self,
        raw: RawItem,
        text: Arc<NormalizedText>,
        library: Arc<CompiledLibrary>,
    ) -> Result<ProcessedItem> {
        let hash = text.content_hash.clone();
        let mut passes = JoinSet::new();
        for (idx, extractor) in self.extractors.iter().enumerate() {
            let extractor = Arc::clone(extractor);
            let text = Arc::clone(&text);
            let library = Arc::clone(&library);
            passes.spawn_blocking(move || (idx, extractor.extract(&text, &library)));
        }
        let mut by_profile = Vec::with_capacity(self.extractors.len());
        while let Some(joined) = passes.join_next().await {
            by_profile.push(joined.context("extractor pass panicked")?);
        }
        by_profile.sort_by_key(|(idx, _)| *idx);
        let candidates: Vec<ExtractionCandidate> =
            by_profile.into_iter().flat_map(|(_, found)| found).collect();

        let now = Utc::now();
        let mut resolved = reconcile(&candidates, &self.config.reconcile)
            .context("reconciling extraction candidates")?;
        resolved.content_hash = Some(hash.clone());
        let mut resolved = score(resolved, &self.config.scoring, now);

        // Lookup, routing and registration share one lock so concurrent items in a
        // batch see each other's titles.
        let routed = {
            let mut near_duplicates = self.near_duplicates.lock().await;
            let title = resolved.fields.text(FieldName::Title).map(str::to_string);
            if let Some(title) = &title {
                if let Some((original, similarity)) = near_duplicates.find(&raw.id, title) {
                    info!(%original, similarity, "suspected near-duplicate");
                    resolved
                        .notes
                        .push(format!("title similarity {similarity:.2} with {original}"));
                    resolved.near_duplicate_of = Some(original);
                }
            }
            let routed = route(&mut resolved, &candidates, &text.text, &self.config.router, now)
                .context("routing resolved opportunity")?;
            if routed.status != RoutingStatus::RejectionDatabase {
                if let Some(title) = &title {
                    near_duplicates.register(&raw.id, title);
                }
            }
            routed
        };

        self.store.store_raw_item(&raw, &hash).await?;
        let record = ProcessedRecord {
            resolved: resolved.clone(),
            candidates,
            source_text: text.text.clone(),
            processed_at: now,
        };
        self.store.write_record(&record).await?;
        if let Some(rejection) = &routed.rejection {
            self.store.append_rejection(rejection).await?;
        }

        Ok(ProcessedItem {
            outcome: ItemOutcome::Routed {
                raw_item_id: raw.id,
                content_hash: hash,
                status: routed.status,
                funding_pattern: resolved.funding_pattern,
                overall_confidence: resolved.overall_confidence,
                reason: routed.reason,
                rejection_category: routed.rejection.as_ref().map(|r| r.rejection_category),
                near_duplicate_of: resolved.near_duplicate_of,
            },
            record: Some(record),
            rejection: routed.rejection,
        })
    }
}

fn validation_key(validation: &HumanValidation) -> Result<String> {
    let bytes = serde_json::to_vec(validation).context("serializing validation")?;
    Ok(sha256_hex(&bytes))
}

/// Identical entries from separate reviewers stay distinct; the logs are append-only,
/// so the nth copy keeps its key across runs.
fn occurrence_key(content: &str, nth: usize) -> String {
    if nth == 0 {
        content.to_string()
    } else {
        sha256_hex(format!("{content}#{nth}").as_bytes())
    }
}

async fn load_ledger(path: &Path) -> Result<BTreeSet<String>> {
    if !fs::try_exists(path).await.unwrap_or(false) {
        return Ok(BTreeSet::new());
    }
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

async fn save_ledger(path: &Path, ledger: &BTreeSet<String>) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(ledger).context("serializing learning ledger")?;
    write_atomic(path, &bytes).await
}

/// Raw items from a JSON-lines file, a single JSON item, or a directory of `*/item.json`.
pub async fn load_input(path: &Path) -> Result<Vec<RawItem>> {
    let meta = fs::metadata(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    if meta.is_dir() {
        let mut entries = fs::read_dir(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let mut item_paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let candidate = entry.path().join("item.json");
            if fs::try_exists(&candidate).await.unwrap_or(false) {
                item_paths.push(candidate);
            }
        }
        item_paths.sort();
        return tokio::task::spawn_blocking(move || {
            item_paths.iter().map(load_fixture_item).collect::<Result<Vec<_>>>()
        })
        .await
        .context("loading fixture items")?;
    }

    if path.extension().and_then(|e| e.to_str()) == Some("json") {
        let path = path.to_path_buf();
        let item = tokio::task::spawn_blocking(move || load_fixture_item(&path))
            .await
            .context("loading item")??;
        return Ok(vec![item]);
    }

    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let batch = parse_jsonl::<RawItem>(&text);
    for bad in &batch.malformed {
        warn!(path = %path.display(), line = bad.line_no, error = %bad.error, "skipping malformed input line");
    }
    Ok(batch.items)
}
