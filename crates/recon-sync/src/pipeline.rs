//! Run orchestration: registry lookup, fetch, raw payload archive,
//! reconciliation and report export for one feed at a time.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use recon_adapters::{
    load_airport_reference, CsvFileSource, JsonBundleSource, RejectedEntry, RemoteBookingSource,
    RemoteFeedConfig, RowSource,
};
use recon_core::FeedSpec;
use recon_storage::{
    ArtifactStore, HttpClientConfig, HttpFetcher, InsertOutcome, MemoryStore, PgStore, ReconStore,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::audit::write_run_report;
use crate::config::{FeedConfig, FeedMode, FeedRegistry, StoreBackend, SyncConfig};
use crate::engine::{ReconciliationEngine, RunOptions, RunReport, RunStatus};

#[derive(Debug, Clone, Serialize)]
pub struct FeedRun {
    pub report: RunReport,
    pub report_dir: PathBuf,
}

impl FeedRun {
    pub fn committed(&self) -> bool {
        self.report.status == RunStatus::Committed
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SeedSummary {
    pub origin: String,
    pub inserted: usize,
    pub already_present: usize,
    pub rejected: Vec<RejectedEntry>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: Arc<dyn ReconStore>,
    pg: Option<PgStore>,
    artifact_store: ArtifactStore,
    http: HttpFetcher,
    run_lock: Mutex<()>,
    cancel: Arc<AtomicBool>,
}

impl SyncPipeline {
    /// Connects the configured backend.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        match config.store {
            StoreBackend::Postgres => {
                let pg = PgStore::connect(&config.database_url)
                    .await
                    .context("connecting to postgres")?;
                let mut pipeline = Self::with_store(config, Arc::new(pg.clone()))?;
                pipeline.pg = Some(pg);
                Ok(pipeline)
            }
            StoreBackend::Memory => {
                warn!("using the in-memory store; nothing outlives this process");
                Self::with_store(config, Arc::new(MemoryStore::new()))
            }
        }
    }

    pub fn with_store(config: SyncConfig, store: Arc<dyn ReconStore>) -> Result<Self> {
        let artifact_store = ArtifactStore::new(config.artifacts_dir.clone());
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Self {
            config,
            store,
            pg: None,
            artifact_store,
            http,
            run_lock: Mutex::new(()),
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    /// Set to stop the running reconciliation between rows; the run then
    /// rolls back.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub async fn migrate(&self) -> Result<()> {
        match &self.pg {
            Some(pg) => pg.migrate().await,
            None => {
                info!(backend = self.store.backend(), "no migrations for this backend");
                Ok(())
            }
        }
    }

    pub async fn registry(&self) -> Result<FeedRegistry> {
        FeedRegistry::load(&self.config.registry_path()).await
    }

    fn source_for(&self, feed: &FeedConfig) -> Result<Box<dyn RowSource>> {
        let path = || {
            feed.path
                .as_deref()
                .map(|p| self.config.resolve(p))
                .with_context(|| format!("feed `{}` has no path", feed.feed_id))
        };
        let source: Box<dyn RowSource> = match feed.mode {
            FeedMode::Csv => Box::new(CsvFileSource::new(feed.feed_id.clone(), path()?)),
            FeedMode::Json => Box::new(JsonBundleSource::new(feed.spec_id(), path()?)),
            FeedMode::Remote => {
                let url = self
                    .config
                    .feed_url
                    .clone()
                    .context("RECON_FEED_URL is not set")?;
                Box::new(RemoteBookingSource::new(
                    feed.feed_id.clone(),
                    RemoteFeedConfig {
                        url,
                        cookie: self.config.feed_cookie.clone(),
                        page_size: self.config.feed_page_size,
                        window_months: self.config.feed_window_months,
                    },
                    self.http.clone(),
                ))
            }
        };
        Ok(source)
    }

    /// Fetches, reconciles and reports one feed. A rolled-back run is still
    /// `Ok`: its report is written and carries the failure.
    pub async fn run_feed(&self, feed_id: &str) -> Result<FeedRun> {
        let _guard = self.run_lock.lock().await;

        let registry = self.registry().await?;
        let feed = registry
            .get(feed_id)
            .with_context(|| format!("unknown feed `{feed_id}`"))?;
        if !feed.enabled {
            warn!(feed_id, "running a feed that is disabled in the registry");
        }
        let spec = FeedSpec::builtin(feed.spec_id())
            .ok_or_else(|| anyhow!("feed `{feed_id}` names unknown spec `{}`", feed.spec_id()))?;
        let engine = ReconciliationEngine::new(spec)?;

        let source = self.source_for(feed)?;
        info!(feed_id, source = %source.describe(), "fetching feed");
        let batch = source
            .fetch()
            .await
            .with_context(|| format!("fetching {}", source.describe()))?;

        let raw_artifact = match &batch.raw_payload {
            Some(payload) => {
                let stored = self
                    .artifact_store
                    .store_bytes(batch.fetched_at, feed_id, payload.extension, &payload.bytes)
                    .await?;
                info!(
                    path = %stored.relative_path.display(),
                    bytes = stored.byte_size,
                    deduplicated = stored.deduplicated,
                    "archived raw payload"
                );
                Some(stored.relative_path.display().to_string())
            }
            None => None,
        };

        let options = RunOptions {
            run_id: None,
            cancel: Some(self.cancel.clone()),
        };
        let mut report = match engine.run(self.store.as_ref(), &batch.rows, &options).await {
            Ok(report) => report,
            Err(failed) => {
                error!(error = %failed, "reconciliation failed");
                *failed.report
            }
        };
        report.feed_id = feed.feed_id.clone();
        report.origin = Some(batch.origin.clone());
        report.raw_artifact = raw_artifact;

        let report_dir = write_run_report(&self.config.reports_dir, &report).await?;
        info!(report_dir = %report_dir.display(), status = ?report.status, "run report written");
        Ok(FeedRun { report, report_dir })
    }

    /// Loads the airport reference list and inserts the entries not yet
    /// present, in a unit of work of its own.
    pub async fn seed_reference(&self, path: Option<PathBuf>) -> Result<SeedSummary> {
        let _guard = self.run_lock.lock().await;

        let path = path
            .map(|p| self.config.resolve(&p))
            .unwrap_or_else(|| self.config.reference_path.clone());
        let load = load_airport_reference(&path).await?;

        let mut uow = self.store.begin().await?;
        let mut inserted = 0;
        let mut already_present = 0;
        for entry in &load.entries {
            match uow.upsert_airport(entry).await {
                Ok(InsertOutcome::Inserted(_)) => inserted += 1,
                Ok(InsertOutcome::Conflict) => already_present += 1,
                Err(err) => {
                    if let Err(rollback) = uow.rollback().await {
                        error!(error = %rollback, "rollback failed");
                    }
                    return Err(err).with_context(|| format!("seeding airport {}", entry.code));
                }
            }
        }
        uow.commit().await.context("committing reference seed")?;

        info!(inserted, already_present, rejected = load.rejected.len(), "reference data seeded");
        Ok(SeedSummary {
            origin: path.display().to_string(),
            inserted,
            already_present,
            rejected: load.rejected,
        })
    }

    /// Runs every enabled, scheduled feed in registry order. A failing feed
    /// does not stop the others.
    pub async fn run_scheduled(&self) -> Result<Vec<FeedRun>> {
        let registry = self.registry().await?;
        let mut runs = Vec::new();
        for feed in registry.scheduled() {
            match self.run_feed(&feed.feed_id).await {
                Ok(run) => runs.push(run),
                Err(err) => error!(feed_id = %feed.feed_id, error = ?err, "scheduled run failed"),
            }
        }
        Ok(runs)
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                info!("scheduled reconciliation triggered");
                if let Err(err) = pipeline.run_scheduled().await {
                    error!(error = ?err, "scheduled reconciliation failed");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}
