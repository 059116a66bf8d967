//! The reconciliation engine: one batch, one unit of work.
//!
//! Rows are processed strictly in input order. Each row runs inside a
//! savepoint; a row-level failure rolls back to it and is recorded as an
//! ERROR outcome. A fatal failure (store unreachable, cancellation) rolls back
//! the whole unit of work and surfaces as [`RunFailed`], which still carries
//! the outcomes gathered up to that point.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use recon_core::{
    CanonicalRecord, DimensionKind, FactTable, FeedSpec, FeedSpecError, RawRow, ResolvePolicy,
};
use recon_storage::{ReconStore, StoreError, UnitOfWork};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::executor::{execute, Applied};
use crate::fingerprint::split_exact_duplicates;
use crate::matcher::{decide, fact_columns};
use crate::normalize::{carries_information, normalize_row};
use crate::resolver::{DimensionResolver, Resolution, ResolverStats};
use crate::tracker::{OutcomeBuckets, OutcomeEntry, OutcomeKind, OutcomeTracker, RunSummary};

const PROGRESS_EVERY: usize = 100;

/// Per-row failure. Never aborts the run.
#[derive(Debug, Error)]
pub enum RowError {
    #[error("identity not resolvable: required field `{0}` is empty")]
    MissingIdentity(&'static str),
    #[error("invalid reference: {kind} `{key}` in field `{field}` does not exist")]
    InvalidReference {
        field: &'static str,
        kind: DimensionKind,
        key: String,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RowError {
    fn is_fatal(&self) -> bool {
        matches!(self, RowError::Store(err) if err.is_fatal())
    }
}

/// Reason a run stopped before committing.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("run cancelled before row {0}")]
    Cancelled(usize),
}

#[derive(Debug, Error)]
#[error("reconciliation run {} for feed `{}` rolled back: {source}", .report.run_id, .report.feed_id)]
pub struct RunFailed {
    pub report: Box<RunReport>,
    #[source]
    pub source: FatalError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    NoInformation,
    Duplicate,
}

/// A row kept out of reconciliation. Diagnostic only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedRow {
    pub row: usize,
    pub reason: DropReason,
    /// Row this one duplicates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<usize>,
    pub values: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub rows_read: usize,
    pub dropped: Vec<DroppedRow>,
}

impl Diagnostics {
    pub fn count(&self, reason: DropReason) -> usize {
        self.dropped.iter().filter(|d| d.reason == reason).count()
    }
}

#[derive(Debug, Clone)]
pub struct PreparedRow {
    pub row: usize,
    pub record: CanonicalRecord,
}

#[derive(Debug, Clone, Default)]
pub struct PreparedBatch {
    pub rows: Vec<PreparedRow>,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub feed_id: String,
    pub status: RunStatus,
    pub summary: RunSummary,
    pub resolver: ResolverStats,
    pub outcomes: OutcomeBuckets,
    pub diagnostics: Diagnostics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_artifact: Option<String>,
}

/// Header of a run without its outcome buckets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDigest {
    pub run_id: Uuid,
    pub feed_id: String,
    pub status: RunStatus,
    pub summary: RunSummary,
    pub resolver: ResolverStats,
    pub rows_read: usize,
    pub dropped: usize,
    pub duplicates: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_artifact: Option<String>,
}

impl RunReport {
    pub fn digest(&self) -> RunDigest {
        RunDigest {
            run_id: self.run_id,
            feed_id: self.feed_id.clone(),
            status: self.status,
            summary: self.summary.clone(),
            resolver: self.resolver,
            rows_read: self.diagnostics.rows_read,
            dropped: self.diagnostics.count(DropReason::NoInformation),
            duplicates: self.diagnostics.count(DropReason::Duplicate),
            failure: self.failure.clone(),
            origin: self.origin.clone(),
            raw_artifact: self.raw_artifact.clone(),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.summary.started_at
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub run_id: Option<Uuid>,
    /// Checked between rows; once set the run rolls back.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl RunOptions {
    fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|flag| flag.load(Ordering::SeqCst))
    }
}

enum RowFailure {
    Row(RowError),
    Fatal(StoreError),
}

impl From<RowError> for RowFailure {
    fn from(err: RowError) -> Self {
        match err {
            RowError::Store(store) if store.is_fatal() => RowFailure::Fatal(store),
            other => RowFailure::Row(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconciliationEngine {
    spec: FeedSpec,
    table: FactTable,
    /// Reference fields, lookup-only dimensions first so an invalid row is
    /// rejected before it creates anything.
    references: Vec<(&'static str, DimensionKind)>,
}

impl ReconciliationEngine {
    pub fn new(spec: FeedSpec) -> Result<Self, FeedSpecError> {
        spec.validate()?;
        let mut references = spec
            .fields
            .iter()
            .filter_map(|f| f.reference.map(|kind| (f.name, kind)))
            .collect::<Vec<_>>();
        references.sort_by_key(|(_, kind)| kind.policy() != ResolvePolicy::LookupOnly);
        let table = spec.table();
        Ok(Self {
            spec,
            table,
            references,
        })
    }

    pub fn spec(&self) -> &FeedSpec {
        &self.spec
    }

    /// Normalizes the batch, drops rows that carry nothing and exact
    /// duplicates (first occurrence wins). No store access.
    pub fn prepare(&self, rows: &[RawRow]) -> PreparedBatch {
        let field_names = self.spec.fields.iter().map(|f| f.name).collect::<Vec<_>>();
        let mut diagnostics = Diagnostics {
            rows_read: rows.len(),
            dropped: Vec::new(),
        };

        let mut candidates = Vec::with_capacity(rows.len());
        for (index, raw) in rows.iter().enumerate() {
            let record = normalize_row(&self.spec, raw);
            let row = index + 1;
            if carries_information(&self.spec, &record) {
                candidates.push(PreparedRow { row, record });
            } else {
                diagnostics.dropped.push(DroppedRow {
                    row,
                    reason: DropReason::NoInformation,
                    duplicate_of: None,
                    values: record.render(&field_names),
                });
            }
        }

        let positions = candidates.iter().map(|c| c.row).collect::<Vec<_>>();
        let (kept, duplicates) = split_exact_duplicates(&self.spec, candidates, |c| &c.record);
        for (dup, first) in duplicates {
            diagnostics.dropped.push(DroppedRow {
                row: dup.row,
                reason: DropReason::Duplicate,
                duplicate_of: positions.get(first).copied(),
                values: dup.record.render(&field_names),
            });
        }
        diagnostics.dropped.sort_by_key(|d| d.row);

        info!(
            feed_id = self.spec.feed_id,
            rows_read = diagnostics.rows_read,
            kept = kept.len(),
            dropped = diagnostics.count(DropReason::NoInformation),
            duplicates = diagnostics.count(DropReason::Duplicate),
            "prepared batch"
        );
        PreparedBatch {
            rows: kept,
            diagnostics,
        }
    }

    pub async fn run(
        &self,
        store: &dyn ReconStore,
        rows: &[RawRow],
        options: &RunOptions,
    ) -> Result<RunReport, RunFailed> {
        let batch = self.prepare(rows);
        self.reconcile(store, batch, options).await
    }

    pub async fn reconcile(
        &self,
        store: &dyn ReconStore,
        batch: PreparedBatch,
        options: &RunOptions,
    ) -> Result<RunReport, RunFailed> {
        let run_id = options.run_id.unwrap_or_else(Uuid::new_v4);
        let span = info_span!("reconcile_run", %run_id, feed_id = self.spec.feed_id);
        self.reconcile_inner(run_id, store, batch, options).instrument(span).await
    }

    async fn reconcile_inner(
        &self,
        run_id: Uuid,
        store: &dyn ReconStore,
        batch: PreparedBatch,
        options: &RunOptions,
    ) -> Result<RunReport, RunFailed> {
        let mut tracker = OutcomeTracker::new();
        let mut resolver = DimensionResolver::new();

        let mut uow = match store.begin().await {
            Ok(uow) => uow,
            Err(err) => {
                error!(error = %err, "could not open unit of work");
                let stats = resolver.stats();
                return Err(self.failed(run_id, tracker, stats, batch.diagnostics, err.into()));
            }
        };

        let total = batch.rows.len();
        let mut fatal = None;
        for (index, prepared) in batch.rows.iter().enumerate() {
            if options.cancelled() {
                fatal = Some(FatalError::Cancelled(prepared.row));
                break;
            }

            let key = prepared.record.render(&self.spec.business_key);
            match self.process_row(uow.as_mut(), &mut resolver, &prepared.record).await {
                Ok(applied) => {
                    if applied.outcome == OutcomeKind::Unchanged {
                        debug!(row = prepared.row, fact_id = applied.fact_id, "unchanged");
                    }
                    tracker.record(OutcomeEntry {
                        row: prepared.row,
                        outcome: applied.outcome,
                        key,
                        fact_id: Some(applied.fact_id),
                        changed_fields: applied
                            .changed_fields
                            .iter()
                            .map(|f| f.to_string())
                            .collect(),
                        error: None,
                    });
                }
                Err(RowFailure::Row(err)) => {
                    warn!(row = prepared.row, key = ?key, error = %err, "row rejected");
                    tracker.record(OutcomeEntry {
                        row: prepared.row,
                        outcome: OutcomeKind::Error,
                        key,
                        fact_id: None,
                        changed_fields: Vec::new(),
                        error: Some(err.to_string()),
                    });
                }
                Err(RowFailure::Fatal(err)) => {
                    error!(row = prepared.row, error = %err, "fatal store error");
                    fatal = Some(FatalError::Store(err));
                    break;
                }
            }

            if (index + 1) % PROGRESS_EVERY == 0 {
                info!(processed = index + 1, total, "reconciliation progress");
            }
        }

        if let Some(fatal) = fatal {
            if let Err(err) = uow.rollback().await {
                error!(error = %err, "rollback failed");
            }
            return Err(self.failed(run_id, tracker, resolver.stats(), batch.diagnostics, fatal));
        }

        if let Err(err) = uow.commit().await {
            error!(error = %err, "commit failed");
            let stats = resolver.stats();
            return Err(self.failed(run_id, tracker, stats, batch.diagnostics, err.into()));
        }

        let summary = tracker.summary();
        info!(
            total = summary.total_processed,
            new = summary.new,
            updated = summary.updated,
            unchanged = summary.unchanged,
            errors = summary.errors,
            success_rate = %summary.success_rate,
            elapsed_ms = summary.elapsed_ms,
            "run committed"
        );
        Ok(RunReport {
            run_id,
            feed_id: self.spec.feed_id.to_string(),
            status: RunStatus::Committed,
            summary,
            resolver: resolver.stats(),
            outcomes: tracker.into_buckets(),
            diagnostics: batch.diagnostics,
            failure: None,
            origin: None,
            raw_artifact: None,
        })
    }

    fn failed(
        &self,
        run_id: Uuid,
        tracker: OutcomeTracker,
        resolver: ResolverStats,
        diagnostics: Diagnostics,
        source: FatalError,
    ) -> RunFailed {
        let summary = tracker.summary();
        warn!(
            processed = summary.total_processed,
            error = %source,
            "run rolled back; nothing committed"
        );
        RunFailed {
            report: Box::new(RunReport {
                run_id,
                feed_id: self.spec.feed_id.to_string(),
                status: RunStatus::RolledBack,
                summary,
                resolver,
                outcomes: tracker.into_buckets(),
                diagnostics,
                failure: Some(source.to_string()),
                origin: None,
                raw_artifact: None,
            }),
            source,
        }
    }

    async fn process_row(
        &self,
        uow: &mut dyn UnitOfWork,
        resolver: &mut DimensionResolver,
        record: &CanonicalRecord,
    ) -> Result<Applied, RowFailure> {
        // A savepoint that cannot be opened, released or rolled back leaves the
        // row's writes in an unknown state, so any such failure ends the run.
        uow.savepoint().await.map_err(RowFailure::Fatal)?;
        match self.apply_row(uow, resolver, record).await {
            Ok(applied) => {
                uow.release_savepoint().await.map_err(RowFailure::Fatal)?;
                resolver.commit_row();
                Ok(applied)
            }
            Err(err) if err.is_fatal() => Err(err.into()),
            Err(err) => {
                uow.rollback_to_savepoint().await.map_err(RowFailure::Fatal)?;
                resolver.discard_row();
                Err(RowFailure::Row(err))
            }
        }
    }

    async fn apply_row(
        &self,
        uow: &mut dyn UnitOfWork,
        resolver: &mut DimensionResolver,
        record: &CanonicalRecord,
    ) -> Result<Applied, RowError> {
        if let Some(missing) = self
            .spec
            .fields
            .iter()
            .find(|f| f.required && record.get(f.name).is_absent())
        {
            return Err(RowError::MissingIdentity(missing.name));
        }

        let mut references = BTreeMap::new();
        for (field, kind) in &self.references {
            let key = record.get(field);
            let id = match resolver.resolve(uow, *kind, key).await? {
                Resolution::Resolved(id) => Some(id),
                Resolution::NoReference => None,
                Resolution::Unknown => {
                    return Err(RowError::InvalidReference {
                        field: *field,
                        kind: *kind,
                        key: key.to_string(),
                    })
                }
            };
            references.insert(*field, id);
        }

        let columns = fact_columns(&self.spec, record, &references);
        let decision = decide(uow, &self.spec, &self.table, columns).await?;
        Ok(execute(uow, &self.table, decision).await?)
    }
}
