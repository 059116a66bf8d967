//! Incremental reconciliation of external feeds into the store, plus the
//! orchestration around it: feed registry, audit export and scheduling.

pub mod audit;
pub mod config;
pub mod engine;
pub mod executor;
pub mod fingerprint;
pub mod matcher;
pub mod normalize;
pub mod pipeline;
pub mod resolver;
pub mod tracker;

pub use audit::{
    audit_markdown, load_run_digests, load_run_outcomes, report_runs_markdown, write_run_report,
    SnapshotFile, SnapshotManifest,
};
pub use config::{FeedConfig, FeedMode, FeedRegistry, StoreBackend, SyncConfig};
pub use engine::{
    Diagnostics, DropReason, DroppedRow, FatalError, PreparedBatch, ReconciliationEngine, RowError,
    RunDigest, RunFailed, RunOptions, RunReport, RunStatus,
};
pub use pipeline::{FeedRun, SeedSummary, SyncPipeline};
pub use resolver::{DimensionResolver, Resolution, ResolverStats};
pub use tracker::{OutcomeBuckets, OutcomeEntry, OutcomeKind, OutcomeTracker, RunSummary};

pub const CRATE_NAME: &str = "recon-sync";

/// Builds the pipeline from the environment and runs one feed.
pub async fn run_feed_from_env(feed_id: &str) -> anyhow::Result<FeedRun> {
    let config = SyncConfig::from_env()?;
    let pipeline = SyncPipeline::from_config(config).await?;
    pipeline.run_feed(feed_id).await
}
