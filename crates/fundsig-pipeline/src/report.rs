//! Run reports: markdown brief, outcome list, parquet snapshots and their manifest.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use fundsig_core::{FieldMapExt, FieldName, ProcessedRecord, RejectionRecord};
use fundsig_storage::{sha256_hex, write_atomic};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::RunSummary;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub fn reports_root(data_dir: &Path) -> PathBuf {
    data_dir.join("reports")
}

/// Writes `reports/<run_id>/` and returns its path.
pub async fn write_run_report(data_dir: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let run_dir = reports_root(data_dir).join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    write_atomic(&run_dir.join("brief.md"), render_brief(summary).as_bytes())
        .await
        .context("writing brief.md")?;

    let outcomes = serde_json::to_vec_pretty(summary).context("serializing run outcomes")?;
    write_atomic(&run_dir.join("outcomes.json"), &outcomes)
        .await
        .context("writing outcomes.json")?;

    export_parquet_snapshots(&run_dir, &summary.records, &summary.rejections).await?;
    Ok(run_dir)
}

fn render_brief(summary: &RunSummary) -> String {
    let mut lines = vec![
        "# Funding Signal Run Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Library version: {}", summary.library_version),
        format!("- Items: {}", summary.outcomes.len()),
        format!("- Duplicates: {}", summary.duplicates),
        format!("- Failures: {}", summary.failures),
        String::new(),
        "## Routing".to_string(),
    ];
    if summary.status_counts.is_empty() {
        lines.push("- nothing routed".to_string());
    }
    for (status, count) in &summary.status_counts {
        lines.push(format!("- {status}: {count}"));
    }

    let mut categories: BTreeMap<&str, usize> = BTreeMap::new();
    for rejection in &summary.rejections {
        *categories.entry(rejection.rejection_category.as_str()).or_default() += 1;
    }
    if !categories.is_empty() {
        lines.push(String::new());
        lines.push("## Rejections".to_string());
        for (category, count) in categories {
            lines.push(format!("- {category}: {count}"));
        }
    }

    let review: Vec<_> = summary
        .records
        .iter()
        .filter(|r| r.resolved.review_conflicts().next().is_some())
        .collect();
    if !review.is_empty() {
        lines.push(String::new());
        lines.push("## Open Conflicts".to_string());
        for record in review {
            let fields = record
                .resolved
                .review_conflicts()
                .map(|c| c.field_name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            lines.push(format!("- `{}`: {fields}", record.resolved.raw_item_id));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

async fn export_parquet_snapshots(
    run_dir: &Path,
    records: &[ProcessedRecord],
    rejections: &[RejectionRecord],
) -> Result<PathBuf> {
    let snapshot_dir = run_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let resolved_path = snapshot_dir.join("resolved_opportunities.parquet");
    let rejections_path = snapshot_dir.join("rejections.parquet");
    write_resolved_parquet(&resolved_path, records)?;
    write_rejections_parquet(&rejections_path, rejections)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("resolved_opportunities", run_dir, &resolved_path)?,
            manifest_entry("rejections", run_dir, &rejections_path)?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    write_atomic(&manifest_path, &bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_resolved_parquet(path: &Path, records: &[ProcessedRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("raw_item_id", DataType::Utf8, false),
        ArrowField::new("content_hash", DataType::Utf8, true),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("funding_pattern", DataType::Utf8, false),
        ArrowField::new("overall_confidence", DataType::Float64, false),
        ArrowField::new("urgency_level", DataType::Utf8, false),
        ArrowField::new("relevance_total", DataType::Float64, false),
        ArrowField::new("open_conflicts", DataType::UInt32, false),
        ArrowField::new("total_amount", DataType::Float64, true),
        ArrowField::new("exact_amount_per_project", DataType::Float64, true),
        ArrowField::new("min_amount_per_project", DataType::Float64, true),
        ArrowField::new("max_amount_per_project", DataType::Float64, true),
        ArrowField::new("currency", DataType::Utf8, true),
        ArrowField::new("near_duplicate_of", DataType::Utf8, true),
    ]));

    let resolved: Vec<_> = records.iter().map(|r| &r.resolved).collect();
    let amount = |name: FieldName| {
        Float64Array::from(resolved.iter().map(|r| r.fields.amount(name)).collect::<Vec<_>>())
    };

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(
                resolved.iter().map(|r| Some(r.raw_item_id.as_str())).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                resolved.iter().map(|r| r.content_hash.as_deref()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                resolved.iter().map(|r| Some(r.status.as_str())).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                resolved.iter().map(|r| Some(r.funding_pattern.as_str())).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                resolved.iter().map(|r| r.overall_confidence).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                resolved.iter().map(|r| Some(r.urgency_level.as_str())).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                resolved.iter().map(|r| r.relevance.total).collect::<Vec<_>>(),
            )),
            Arc::new(UInt32Array::from(
                resolved
                    .iter()
                    .map(|r| r.review_conflicts().count() as u32)
                    .collect::<Vec<_>>(),
            )),
            Arc::new(amount(FieldName::TotalAmount)),
            Arc::new(amount(FieldName::ExactAmountPerProject)),
            Arc::new(amount(FieldName::MinAmountPerProject)),
            Arc::new(amount(FieldName::MaxAmountPerProject)),
            Arc::new(StringArray::from(
                resolved.iter().map(|r| r.fields.currency()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                resolved.iter().map(|r| r.near_duplicate_of.as_deref()).collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building resolved_opportunities record batch")?;
    write_parquet(path, batch)
}

fn write_rejections_parquet(path: &Path, rejections: &[RejectionRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Utf8, false),
        ArrowField::new("raw_item_id", DataType::Utf8, false),
        ArrowField::new("rejection_category", DataType::Utf8, false),
        ArrowField::new("rejection_reason", DataType::Utf8, false),
        ArrowField::new("overall_confidence", DataType::Float64, false),
        ArrowField::new("learning_value", DataType::Float64, false),
        ArrowField::new("created_at", DataType::Utf8, false),
    ]));

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(
                rejections.iter().map(|r| Some(r.id.to_string())).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rejections.iter().map(|r| Some(r.raw_item_id.as_str())).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rejections
                    .iter()
                    .map(|r| Some(r.rejection_category.as_str()))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rejections.iter().map(|r| Some(r.rejection_reason.as_str())).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                rejections
                    .iter()
                    .map(|r| r.resolved_opportunity_snapshot.overall_confidence)
                    .collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                rejections.iter().map(|r| r.learning_value).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rejections.iter().map(|r| Some(r.created_at.to_rfc3339())).collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building rejections record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path
        .strip_prefix(run_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}

/// Markdown index over the most recent `runs` reports, newest first.
pub fn report_markdown(runs: usize, data_dir: &Path) -> Result<String> {
    let root = reports_root(data_dir);
    let mut dirs = std::fs::read_dir(&root)
        .with_context(|| format!("reading {}", root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# Funding Signal Reports".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let outcomes_path = dir.path().join("outcomes.json");
        let manifest_path = dir.path().join("snapshots").join("manifest.json");

        let summary: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&outcomes_path)
                .with_context(|| format!("reading {}", outcomes_path.display()))?,
        )
        .with_context(|| format!("parsing {}", outcomes_path.display()))?;
        let items = summary
            .get("outcomes")
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .unwrap_or(0);

        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!("- items: {items}"));
        if let Some(counts) = summary.get("status_counts").and_then(|v| v.as_object()) {
            for (status, count) in counts {
                lines.push(format!("- {status}: {count}"));
            }
        }
        lines.push(format!("- outcomes: `{}`", outcomes_path.display()));
        if manifest_path.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest_path.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ItemOutcome;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn empty_summary() -> RunSummary {
        let at = Utc.with_ymd_and_hms(2026, 1, 10, 9, 0, 0).unwrap();
        RunSummary {
            run_id: Uuid::from_u128(42),
            started_at: at,
            finished_at: at,
            library_version: 1,
            status_counts: BTreeMap::new(),
            duplicates: 1,
            failures: 0,
            outcomes: vec![ItemOutcome::Duplicate {
                raw_item_id: "b".into(),
                content_hash: "abc".into(),
                existing_item_id: "a".into(),
            }],
            records: vec![],
            rejections: vec![],
            report_dir: None,
        }
    }

    #[tokio::test]
    async fn report_files_are_listed_in_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let summary = empty_summary();
        let run_dir = write_run_report(dir.path(), &summary).await.unwrap();
        assert!(run_dir.join("brief.md").exists());
        assert!(run_dir.join("outcomes.json").exists());

        let manifest: ParquetManifest = serde_json::from_str(
            &std::fs::read_to_string(run_dir.join("snapshots/manifest.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(manifest.files.len(), 2);
        for file in &manifest.files {
            let bytes = std::fs::read(run_dir.join(&file.path)).unwrap();
            assert_eq!(sha256_hex(&bytes), file.sha256);
            assert_eq!(bytes.len() as u64, file.bytes);
        }

        let index = report_markdown(5, dir.path()).unwrap();
        assert!(index.contains(&summary.run_id.to_string()));
        assert!(index.contains("- items: 1"));
    }

    #[test]
    fn brief_lists_duplicates_and_empty_routing() {
        let brief = render_brief(&empty_summary());
        assert!(brief.contains("- Duplicates: 1"));
        assert!(brief.contains("- nothing routed"));
    }
}
