//! Content hashing, duplicate index and file-backed record store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use fundsig_core::{HumanValidation, PatternLibrary, ProcessedRecord, RawItem, RejectionRecord};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fundsig-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// `sha256(url + title + body)` over the raw bytes, before any cleaning.
pub fn content_hash(url: &str, title: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update(title.as_bytes());
    hasher.update(body.as_bytes());
    hex::encode(hasher.finalize())
}

fn url_key(url: &str) -> String {
    url.trim().trim_end_matches('/').to_ascii_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    New,
    DuplicateHash { existing_item_id: String },
    DuplicateUrl { existing_item_id: String },
}

impl Admission {
    pub fn is_duplicate(&self) -> bool {
        !matches!(self, Self::New)
    }
}

/// Uniqueness index over content hashes and urls.
#[derive(Debug, Clone, Default)]
pub struct ContentIndex {
    by_hash: HashMap<String, String>,
    by_url: HashMap<String, String>,
}

impl ContentIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    pub fn check(&self, hash: &str, url: &str) -> Admission {
        if let Some(existing) = self.by_hash.get(hash) {
            return Admission::DuplicateHash {
                existing_item_id: existing.clone(),
            };
        }
        if url.trim().is_empty() {
            return Admission::New;
        }
        match self.by_url.get(&url_key(url)) {
            Some(existing) => Admission::DuplicateUrl {
                existing_item_id: existing.clone(),
            },
            None => Admission::New,
        }
    }

    pub fn register(&mut self, hash: &str, url: &str, raw_item_id: &str) {
        self.by_hash
            .entry(hash.to_string())
            .or_insert_with(|| raw_item_id.to_string());
        if !url.trim().is_empty() {
            self.by_url
                .entry(url_key(url))
                .or_insert_with(|| raw_item_id.to_string());
        }
    }

    /// Undoes an admission by `raw_item_id`; entries owned by other items stay.
    pub fn release(&mut self, hash: &str, url: &str, raw_item_id: &str) {
        if self.by_hash.get(hash).is_some_and(|owner| owner == raw_item_id) {
            self.by_hash.remove(hash);
        }
        if url.trim().is_empty() {
            return;
        }
        let key = url_key(url);
        if self.by_url.get(&key).is_some_and(|owner| owner == raw_item_id) {
            self.by_url.remove(&key);
        }
    }

    /// Check and register in one step; only a `New` item is registered.
    pub fn admit(&mut self, hash: &str, url: &str, raw_item_id: &str) -> Admission {
        let admission = self.check(hash, url);
        if admission == Admission::New {
            self.register(hash, url, raw_item_id);
        }
        admission
    }
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedLine {
    pub line_no: usize,
    pub error: String,
}

/// Parsed JSON-lines file; bad lines are kept aside instead of failing the read.
#[derive(Debug, Clone)]
pub struct JsonlBatch<T> {
    pub items: Vec<T>,
    pub malformed: Vec<MalformedLine>,
}

impl<T> Default for JsonlBatch<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            malformed: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record for {raw_item_id} has no content hash")]
    MissingContentHash { raw_item_id: String },
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// Write `bytes` to `path` through a temp file and rename, replacing any previous file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// Parse JSON lines, collecting malformed lines instead of failing.
pub fn parse_jsonl<T: DeserializeOwned>(text: &str) -> JsonlBatch<T> {
    let mut batch = JsonlBatch::default();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(line) {
            Ok(item) => batch.items.push(item),
            Err(err) => batch.malformed.push(MalformedLine {
                line_no: idx + 1,
                error: err.to_string(),
            }),
        }
    }
    batch
}

/// Directory layout:
/// `raw/<stamp>/<source>/<hash>.json`, `records/<hash>.json`, `rejections.jsonl`,
/// `validations.jsonl`, `library/patterns-v<N>.json`.
#[derive(Debug)]
pub struct RecordStore {
    root: PathBuf,
    append_lock: Mutex<()>,
}

impl RecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            append_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn records_dir(&self) -> PathBuf {
        self.root.join("records")
    }

    pub fn rejections_path(&self) -> PathBuf {
        self.root.join("rejections.jsonl")
    }

    pub fn validations_path(&self) -> PathBuf {
        self.root.join("validations.jsonl")
    }

    pub fn library_dir(&self) -> PathBuf {
        self.root.join("library")
    }

    pub fn raw_relative_path(
        &self,
        collected_at: DateTime<Utc>,
        source: &str,
        content_hash: &str,
    ) -> PathBuf {
        let stamp = collected_at.format("%Y%m%d").to_string();
        PathBuf::from("raw")
            .join(stamp)
            .join(source)
            .join(format!("{content_hash}.json"))
    }

    /// Store a raw item immutably at a hash-addressed path; existing files are never rewritten.
    pub async fn store_raw_item(
        &self,
        item: &RawItem,
        content_hash: &str,
    ) -> anyhow::Result<StoredArtifact> {
        let source = serde_json::to_value(item.source_type)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        let relative_path = self.raw_relative_path(item.collected_at, &source, content_hash);
        let absolute_path = self.root.join(&relative_path);
        let bytes = serde_json::to_vec_pretty(item).context("serializing raw item")?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking raw path {}", absolute_path.display()))?
        {
            return Ok(StoredArtifact {
                content_hash: content_hash.to_string(),
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        write_atomic(&absolute_path, &bytes).await?;
        Ok(StoredArtifact {
            content_hash: content_hash.to_string(),
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated: false,
        })
    }

    /// Write (or replace) the record keyed by its content hash.
    pub async fn write_record(&self, record: &ProcessedRecord) -> Result<PathBuf, StoreError> {
        let hash = record.resolved.content_hash.as_deref().ok_or_else(|| {
            StoreError::MissingContentHash {
                raw_item_id: record.resolved.raw_item_id.clone(),
            }
        })?;
        let path = self.records_dir().join(format!("{hash}.json"));
        let bytes = serde_json::to_vec_pretty(record)
            .context("serializing processed record")
            .map_err(StoreError::Io)?;
        write_atomic(&path, &bytes).await?;
        debug!(path = %path.display(), "record written");
        Ok(path)
    }

    pub async fn load_records(&self) -> anyhow::Result<Vec<ProcessedRecord>> {
        let dir = self.records_dir();
        if !fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("reading {}", dir.display()))?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut records = Vec::with_capacity(paths.len());
        for path in paths {
            let text = fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            match serde_json::from_str::<ProcessedRecord>(&text) {
                Ok(record) => records.push(record),
                Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable record"),
            }
        }
        Ok(records)
    }

    /// Rebuild the duplicate index from stored records.
    pub async fn rebuild_index(&self) -> anyhow::Result<ContentIndex> {
        let mut index = ContentIndex::new();
        for record in self.load_records().await? {
            if let Some(hash) = record.resolved.content_hash.as_deref() {
                index.register(hash, "", &record.resolved.raw_item_id);
            }
        }
        Ok(index)
    }

    async fn append_line<T: Serialize>(&self, path: &Path, value: &T) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(value).context("serializing jsonl entry")?;
        line.push(b'\n');

        let _guard = self.append_lock.lock().await;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        file.write_all(&line)
            .await
            .with_context(|| format!("appending to {}", path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing {}", path.display()))?;
        Ok(())
    }

    async fn read_jsonl<T: DeserializeOwned>(&self, path: &Path) -> anyhow::Result<JsonlBatch<T>> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Ok(JsonlBatch::default());
        }
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let batch = parse_jsonl(&text);
        for bad in &batch.malformed {
            warn!(path = %path.display(), line = bad.line_no, error = %bad.error, "malformed jsonl line");
        }
        Ok(batch)
    }

    pub async fn append_rejection(&self, record: &RejectionRecord) -> anyhow::Result<()> {
        self.append_line(&self.rejections_path(), record).await
    }

    pub async fn load_rejections(&self) -> anyhow::Result<JsonlBatch<RejectionRecord>> {
        self.read_jsonl(&self.rejections_path()).await
    }

    pub async fn append_validation(&self, validation: &HumanValidation) -> anyhow::Result<()> {
        self.append_line(&self.validations_path(), validation).await
    }

    pub async fn load_validations(&self) -> anyhow::Result<JsonlBatch<HumanValidation>> {
        self.read_jsonl(&self.validations_path()).await
    }

    pub fn library_path(&self, version: u64) -> PathBuf {
        self.library_dir().join(format!("patterns-v{version:04}.json"))
    }

    pub async fn save_library(&self, library: &PatternLibrary) -> anyhow::Result<PathBuf> {
        let path = self.library_path(library.version);
        let bytes = serde_json::to_vec_pretty(library).context("serializing pattern library")?;
        write_atomic(&path, &bytes).await?;
        Ok(path)
    }

    /// Highest stored library version, if any.
    pub async fn load_latest_library(&self) -> anyhow::Result<Option<PatternLibrary>> {
        let dir = self.library_dir();
        if !fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(None);
        }
        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("reading {}", dir.display()))?;
        let mut latest: Option<(u64, PathBuf)> = None;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(version) = name
                .strip_prefix("patterns-v")
                .and_then(|rest| rest.strip_suffix(".json"))
                .and_then(|v| v.parse::<u64>().ok())
            else {
                continue;
            };
            if latest.as_ref().map_or(true, |(best, _)| version > *best) {
                latest = Some((version, entry.path()));
            }
        }
        let Some((_, path)) = latest else {
            return Ok(None);
        };
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let library = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(library))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fundsig_core::{
        FieldMap, FundingPattern, RelevanceBreakdown, ResolvedOpportunity, RoutingStatus,
        SourceType, SuitabilityFlags, UrgencyLevel, ValidationDecision,
    };
    use tempfile::tempdir;

    fn collected_at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc)
    }

    fn record(hash: &str, id: &str, status: RoutingStatus) -> ProcessedRecord {
        ProcessedRecord {
            resolved: ResolvedOpportunity {
                raw_item_id: id.to_string(),
                content_hash: Some(hash.to_string()),
                funding_pattern: FundingPattern::PerProjectExact,
                fields: FieldMap::new(),
                conflicts: vec![],
                overall_confidence: 0.9,
                evidence_ceiling: 0.9,
                urgency_level: UrgencyLevel::Unknown,
                suitability_flags: SuitabilityFlags::default(),
                relevance: RelevanceBreakdown::default(),
                status,
                near_duplicate_of: None,
                candidate_ids: vec![],
                notes: vec![],
            },
            candidates: vec![],
            source_text: "text".into(),
            processed_at: collected_at(),
        }
    }

    #[test]
    fn content_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(
            content_hash("hello", " ", "world"),
            sha256_hex(b"hello world")
        );
    }

    #[test]
    fn index_flags_duplicate_hash_and_url() {
        let mut index = ContentIndex::new();
        assert_eq!(index.admit("h1", "https://a.org/call/", "item-1"), Admission::New);
        assert_eq!(
            index.admit("h1", "https://b.org", "item-2"),
            Admission::DuplicateHash {
                existing_item_id: "item-1".into()
            }
        );
        assert_eq!(
            index.admit("h2", "https://A.org/call", "item-3"),
            Admission::DuplicateUrl {
                existing_item_id: "item-1".into()
            }
        );
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn released_admission_can_be_taken_again() {
        let mut index = ContentIndex::new();
        assert_eq!(index.admit("h1", "https://a.org/call", "item-1"), Admission::New);
        index.release("h1", "https://a.org/call", "item-2");
        assert!(matches!(index.check("h1", ""), Admission::DuplicateHash { .. }));

        index.release("h1", "https://a.org/call", "item-1");
        assert!(index.is_empty());
        assert_eq!(index.admit("h1", "https://a.org/call", "item-1b"), Admission::New);
    }

    #[tokio::test]
    async fn raw_items_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let store = RecordStore::new(dir.path());
        let item = RawItem {
            id: "item-1".into(),
            url: "https://example.org/grants".into(),
            title: "Grants".into(),
            body: "Grants of $5,000 each".into(),
            source_type: SourceType::Rss,
            collected_at: collected_at(),
            content_hash: None,
        };
        let hash = content_hash(&item.url, &item.title, &item.body);

        let first = store.store_raw_item(&item, &hash).await.expect("first store");
        let second = store.store_raw_item(&item, &hash).await.expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
    }

    #[tokio::test]
    async fn records_are_replaced_by_content_hash() {
        let dir = tempdir().expect("tempdir");
        let store = RecordStore::new(dir.path());

        store
            .write_record(&record("abc", "item-1", RoutingStatus::CommunityReview))
            .await
            .expect("write");
        store
            .write_record(&record("abc", "item-1", RoutingStatus::AutoApproved))
            .await
            .expect("rewrite");

        let records = store.load_records().await.expect("load");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].resolved.status, RoutingStatus::AutoApproved);

        let index = store.rebuild_index().await.expect("index");
        assert!(index.check("abc", "").is_duplicate());
    }

    #[tokio::test]
    async fn record_without_hash_is_refused() {
        let dir = tempdir().expect("tempdir");
        let store = RecordStore::new(dir.path());
        let mut rec = record("abc", "item-9", RoutingStatus::HumanReview);
        rec.resolved.content_hash = None;
        let err = store.write_record(&rec).await.unwrap_err();
        assert!(matches!(err, StoreError::MissingContentHash { .. }));
    }

    #[tokio::test]
    async fn validations_keep_malformed_lines_aside() {
        let dir = tempdir().expect("tempdir");
        let store = RecordStore::new(dir.path());
        store
            .append_validation(&HumanValidation {
                record_id: "item-1".into(),
                decision: ValidationDecision::Approve,
                corrected_fields: Default::default(),
                validated_at: None,
            })
            .await
            .expect("append");
        let mut text = std::fs::read_to_string(store.validations_path()).unwrap();
        text.push_str("{not json}\n");
        std::fs::write(store.validations_path(), text).unwrap();

        let batch = store.load_validations().await.expect("load");
        assert_eq!(batch.items.len(), 1);
        assert_eq!(batch.malformed.len(), 1);
        assert_eq!(batch.malformed[0].line_no, 2);
    }

    #[tokio::test]
    async fn latest_library_version_wins() {
        let dir = tempdir().expect("tempdir");
        let store = RecordStore::new(dir.path());
        for version in [1, 3, 2] {
            store
                .save_library(&PatternLibrary {
                    version,
                    rules: vec![],
                })
                .await
                .expect("save");
        }
        let latest = store.load_latest_library().await.expect("load").expect("some");
        assert_eq!(latest.version, 3);
    }
}
