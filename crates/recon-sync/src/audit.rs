//! Run report export: `audit.md`, JSON outcome files, diagnostics and
//! parquet snapshots with a sha256 manifest, one directory per run.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Int64Array, RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::engine::{RunDigest, RunReport};
use crate::tracker::OutcomeEntry;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub files: Vec<SnapshotFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub fn run_dir(reports_root: &Path, run_id: &str) -> PathBuf {
    reports_root.join(run_id)
}

/// Writes every report file for one run and returns the run directory.
pub async fn write_run_report(reports_root: &Path, report: &RunReport) -> Result<PathBuf> {
    let dir = run_dir(reports_root, &report.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    fs::write(dir.join("audit.md"), audit_markdown(report))
        .await
        .context("writing audit.md")?;

    write_json(&dir.join("summary.json"), &report.digest()).await?;
    write_json(
        &dir.join("outcomes.json"),
        &serde_json::json!({
            "summary": report.summary,
            "new": report.outcomes.new,
            "updated": report.outcomes.updated,
            "errors": report.outcomes.errors,
        }),
    )
    .await?;
    write_json(&dir.join("diagnostics.json"), &report.diagnostics).await?;

    let snapshot_dir = dir.join("snapshots");
    let report = report.clone();
    let snapshot_root = dir.clone();
    tokio::task::spawn_blocking(move || export_snapshots(&snapshot_root, &snapshot_dir, &report))
        .await
        .context("joining snapshot export")??;

    Ok(dir)
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing {}", path.display()))?;
    fs::write(path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

fn key_label(entry: &OutcomeEntry) -> String {
    entry
        .key
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn audit_markdown(report: &RunReport) -> String {
    let s = &report.summary;
    let mut lines = vec![
        format!("# Reconciliation Audit: {}", report.feed_id),
        String::new(),
        format!("- Run ID: `{}`", report.run_id),
        format!("- Status: {:?}", report.status),
        format!("- Started: {}", s.started_at),
        format!("- Finished: {}", s.finished_at),
    ];
    if let Some(origin) = &report.origin {
        lines.push(format!("- Source: `{origin}`"));
    }
    if let Some(failure) = &report.failure {
        lines.push(format!("- Failure: {failure}"));
        lines.push("- Nothing from this run was committed.".to_string());
    }

    lines.extend([
        String::new(),
        "## Statistics".to_string(),
        String::new(),
        "| metric | value |".to_string(),
        "|---|---|".to_string(),
        format!("| total processed | {} |", s.total_processed),
        format!("| new | {} |", s.new),
        format!("| updated | {} |", s.updated),
        format!("| unchanged | {} |", s.unchanged),
        format!("| errors | {} |", s.errors),
        format!("| success rate | {}% |", s.success_rate),
        format!("| elapsed | {} ms |", s.elapsed_ms),
        format!("| rows read | {} |", report.diagnostics.rows_read),
        format!("| dropped or duplicate | {} |", report.diagnostics.dropped.len()),
        format!("| dimension rows created | {} |", report.resolver.created),
    ]);

    lines.extend([String::new(), format!("## New ({})", report.outcomes.new.len()), String::new()]);
    for e in &report.outcomes.new {
        lines.push(format!("- row {}: {}", e.row, key_label(e)));
    }

    lines.extend([
        String::new(),
        format!("## Updated ({})", report.outcomes.updated.len()),
        String::new(),
    ]);
    for e in &report.outcomes.updated {
        lines.push(format!(
            "- row {}: {} (changed: {})",
            e.row,
            key_label(e),
            e.changed_fields.join(", ")
        ));
    }

    lines.extend([
        String::new(),
        format!("## Errors ({})", report.outcomes.errors.len()),
        String::new(),
    ]);
    for e in &report.outcomes.errors {
        lines.push(format!(
            "- row {}: {}: {}",
            e.row,
            key_label(e),
            e.error.as_deref().unwrap_or("unknown error")
        ));
    }
    lines.push(String::new());
    lines.join("\n")
}

fn export_snapshots(run_dir: &Path, snapshot_dir: &Path, report: &RunReport) -> Result<()> {
    std::fs::create_dir_all(snapshot_dir)
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let mut files = Vec::new();
    for (name, entries) in [
        ("new", &report.outcomes.new),
        ("updated", &report.outcomes.updated),
        ("errors", &report.outcomes.errors),
    ] {
        let path = snapshot_dir.join(format!("{name}.parquet"));
        write_parquet(&path, outcomes_batch(entries)?)?;
        files.push(manifest_entry(name, run_dir, &path)?);
    }
    let stats_path = snapshot_dir.join("stats.parquet");
    write_parquet(&stats_path, stats_batch(report)?)?;
    files.push(manifest_entry("stats", run_dir, &stats_path)?);

    let manifest = SnapshotManifest {
        schema_version: 1,
        files,
    };
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    let manifest_path = snapshot_dir.join("manifest.json");
    std::fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))
}

fn outcomes_batch(entries: &[OutcomeEntry]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("row", DataType::UInt64, false),
        ArrowField::new("outcome", DataType::Utf8, false),
        ArrowField::new("business_key", DataType::Utf8, false),
        ArrowField::new("fact_id", DataType::Int64, true),
        ArrowField::new("changed_fields", DataType::Utf8, true),
        ArrowField::new("error", DataType::Utf8, true),
    ]));

    let rows = UInt64Array::from(entries.iter().map(|e| e.row as u64).collect::<Vec<_>>());
    let outcomes = StringArray::from(
        entries
            .iter()
            .map(|e| Some(e.outcome.as_str()))
            .collect::<Vec<_>>(),
    );
    let keys = StringArray::from(entries.iter().map(|e| Some(key_label(e))).collect::<Vec<_>>());
    let fact_ids = Int64Array::from(entries.iter().map(|e| e.fact_id).collect::<Vec<_>>());
    let changed = StringArray::from(
        entries
            .iter()
            .map(|e| (!e.changed_fields.is_empty()).then(|| e.changed_fields.join(",")))
            .collect::<Vec<_>>(),
    );
    let errors = StringArray::from(entries.iter().map(|e| e.error.as_deref()).collect::<Vec<_>>());

    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(rows),
            Arc::new(outcomes),
            Arc::new(keys),
            Arc::new(fact_ids),
            Arc::new(changed),
            Arc::new(errors),
        ],
    )
    .context("building outcomes record batch")
}

fn stats_batch(report: &RunReport) -> Result<RecordBatch> {
    let s = &report.summary;
    let metrics = [
        ("total_processed", s.total_processed.to_string()),
        ("new", s.new.to_string()),
        ("updated", s.updated.to_string()),
        ("unchanged", s.unchanged.to_string()),
        ("errors", s.errors.to_string()),
        ("success_rate", s.success_rate.to_string()),
        ("elapsed_ms", s.elapsed_ms.to_string()),
        ("rows_read", report.diagnostics.rows_read.to_string()),
        ("dropped", report.diagnostics.dropped.len().to_string()),
    ];
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("metric", DataType::Utf8, false),
        ArrowField::new("value", DataType::Utf8, false),
    ]));
    let names = StringArray::from(metrics.iter().map(|(k, _)| Some(*k)).collect::<Vec<_>>());
    let values = StringArray::from(
        metrics
            .iter()
            .map(|(_, v)| Some(v.as_str()))
            .collect::<Vec<_>>(),
    );
    RecordBatch::try_new(schema, vec![Arc::new(names), Arc::new(values)])
        .context("building stats record batch")
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

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<SnapshotFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path.strip_prefix(run_dir).unwrap_or(path).display().to_string();
    Ok(SnapshotFile {
        name: name.to_string(),
        path: rel,
        sha256: recon_storage::sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}

/// Run digests found under `reports_root`, newest first.
pub fn load_run_digests(reports_root: &Path, limit: usize) -> Result<Vec<RunDigest>> {
    if !reports_root.exists() {
        return Ok(Vec::new());
    }
    let mut digests = Vec::new();
    for entry in std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
    {
        let entry = entry?;
        let summary_path = entry.path().join("summary.json");
        if !summary_path.is_file() {
            continue;
        }
        let text = std::fs::read_to_string(&summary_path)
            .with_context(|| format!("reading {}", summary_path.display()))?;
        let digest: RunDigest = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", summary_path.display()))?;
        digests.push(digest);
    }
    digests.sort_by(|a, b| b.summary.started_at.cmp(&a.summary.started_at));
    digests.truncate(limit.max(1));
    Ok(digests)
}

/// The `outcomes.json` of one run, or `None` when no such run exists.
pub fn load_run_outcomes(reports_root: &Path, run_id: &str) -> Result<Option<serde_json::Value>> {
    if run_id.is_empty() || run_id.contains(&['/', '\\', '.'][..]) {
        return Ok(None);
    }
    let path = run_dir(reports_root, run_id).join("outcomes.json");
    if !path.is_file() {
        return Ok(None);
    }
    let text =
        std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    let value = serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(value))
}

pub fn report_runs_markdown(reports_root: &Path, runs: usize) -> Result<String> {
    let digests = load_run_digests(reports_root, runs)?;
    let mut lines = vec!["# Reconciliation Runs".to_string(), String::new()];
    if digests.is_empty() {
        lines.push(format!("No runs recorded under `{}`.", reports_root.display()));
    }
    for d in digests {
        let s = &d.summary;
        lines.push(format!("## `{}` {} ({:?})", d.run_id, d.feed_id, d.status));
        lines.push(format!("- started: {}", s.started_at));
        lines.push(format!(
            "- processed {}: new {}, updated {}, unchanged {}, errors {}",
            s.total_processed, s.new, s.updated, s.unchanged, s.errors
        ));
        lines.push(format!("- success rate: {}%", s.success_rate));
        lines.push(format!("- dropped {}, duplicates {}", d.dropped, d.duplicates));
        if let Some(failure) = &d.failure {
            lines.push(format!("- failure: {failure}"));
        }
        lines.push(format!(
            "- audit: `{}`",
            run_dir(reports_root, &d.run_id.to_string()).join("audit.md").display()
        ));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Diagnostics, RunStatus};
    use crate::resolver::ResolverStats;
    use crate::tracker::{OutcomeKind, OutcomeTracker};
    use std::collections::BTreeMap;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn sample_report() -> RunReport {
        let mut tracker = OutcomeTracker::new();
        tracker.record(OutcomeEntry {
            row: 1,
            outcome: OutcomeKind::New,
            key: BTreeMap::from([("file".to_string(), "AB1234".to_string())]),
            fact_id: Some(1),
            changed_fields: Vec::new(),
            error: None,
        });
        tracker.record(OutcomeEntry {
            row: 2,
            outcome: OutcomeKind::Updated,
            key: BTreeMap::from([("file".to_string(), "AB1235".to_string())]),
            fact_id: Some(2),
            changed_fields: vec!["amount".into()],
            error: None,
        });
        tracker.record(OutcomeEntry {
            row: 3,
            outcome: OutcomeKind::Error,
            key: BTreeMap::from([("file".to_string(), "AB1237".to_string())]),
            fact_id: None,
            changed_fields: Vec::new(),
            error: Some(
                "invalid reference: airport `XXX` in field `airport_code` does not exist".into(),
            ),
        });
        let summary = tracker.summary();
        RunReport {
            run_id: Uuid::new_v4(),
            feed_id: "bookings".into(),
            status: RunStatus::Committed,
            summary,
            resolver: ResolverStats::default(),
            outcomes: tracker.into_buckets(),
            diagnostics: Diagnostics::default(),
            failure: None,
            origin: Some("fixtures/bookings/extract.csv".into()),
            raw_artifact: None,
        }
    }

    #[test]
    fn markdown_has_one_section_per_bucket() {
        let md = audit_markdown(&sample_report());
        for heading in ["## Statistics", "## New (1)", "## Updated (1)", "## Errors (1)"] {
            assert!(md.contains(heading), "missing {heading}");
        }
        assert!(md.contains("changed: amount"));
        assert!(md.contains("airport `XXX`"));
    }

    #[tokio::test]
    async fn writes_report_files_and_manifest() {
        let dir = tempdir().unwrap();
        let report = sample_report();
        let run_dir = write_run_report(dir.path(), &report).await.unwrap();

        for file in ["audit.md", "summary.json", "outcomes.json", "diagnostics.json"] {
            assert!(run_dir.join(file).is_file(), "missing {file}");
        }
        let manifest: SnapshotManifest = serde_json::from_str(
            &std::fs::read_to_string(run_dir.join("snapshots/manifest.json")).unwrap(),
        )
        .unwrap();
        let names = manifest.files.iter().map(|f| f.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["new", "updated", "errors", "stats"]);
        for file in &manifest.files {
            let bytes = std::fs::read(run_dir.join(&file.path)).unwrap();
            assert_eq!(recon_storage::sha256_hex(&bytes), file.sha256);
        }

        let digests = load_run_digests(dir.path(), 10).unwrap();
        assert_eq!(digests.len(), 1);
        assert_eq!(digests[0].run_id, report.run_id);

        let outcomes = load_run_outcomes(dir.path(), &report.run_id.to_string()).unwrap().unwrap();
        assert_eq!(outcomes["updated"][0]["changed_fields"][0], "amount");
        assert!(load_run_outcomes(dir.path(), "../etc").unwrap().is_none());

        let md = report_runs_markdown(dir.path(), 5).unwrap();
        assert!(md.contains(&report.run_id.to_string()));
    }

    #[test]
    fn empty_reports_root_lists_nothing() {
        let dir = tempdir().unwrap();
        assert!(load_run_digests(&dir.path().join("missing"), 5).unwrap().is_empty());
        assert!(report_runs_markdown(dir.path(), 5).unwrap().contains("No runs recorded"));
    }
}
