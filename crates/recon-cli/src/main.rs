use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use recon_sync::{report_runs_markdown, SyncConfig, SyncPipeline};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "recon")]
#[command(about = "Booking and balance reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile one feed from feeds.yaml.
    Run { feed_id: String },
    /// Load the airport reference list.
    Seed {
        #[arg(long)]
        path: Option<PathBuf>,
    },
    Migrate,
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run scheduled feeds on SYNC_CRON until interrupted.
    Schedule,
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}

async fn pipeline(config: SyncConfig) -> Result<Arc<SyncPipeline>> {
    Ok(Arc::new(SyncPipeline::from_config(config).await?))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env()?;

    match cli.command {
        Commands::Run { feed_id } => {
            let pipeline = pipeline(config).await?;
            let cancel = pipeline.cancel_flag();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; the run will roll back");
                    cancel.store(true, Ordering::SeqCst);
                }
            });

            let run = pipeline.run_feed(&feed_id).await?;
            let s = &run.report.summary;
            println!(
                "run {} {:?}: processed={} new={} updated={} unchanged={} errors={} success_rate={}% audit={}",
                run.report.run_id,
                run.report.status,
                s.total_processed,
                s.new,
                s.updated,
                s.unchanged,
                s.errors,
                s.success_rate,
                run.report_dir.join("audit.md").display()
            );
            if !run.committed() {
                bail!(
                    "run {} rolled back: {}",
                    run.report.run_id,
                    run.report.failure.as_deref().unwrap_or("unknown failure")
                );
            }
        }
        Commands::Seed { path } => {
            let summary = pipeline(config).await?.seed_reference(path).await?;
            println!(
                "seeded {}: inserted={} already_present={} rejected={}",
                summary.origin,
                summary.inserted,
                summary.already_present,
                summary.rejected.len()
            );
            for rejected in &summary.rejected {
                println!(
                    "  line {}: {} ({})",
                    rejected.line,
                    rejected.code.as_deref().unwrap_or("-"),
                    rejected.reason
                );
            }
        }
        Commands::Migrate => {
            pipeline(config).await?.migrate().await?;
        }
        Commands::Serve { port } => {
            let pipeline = pipeline(config).await?;
            let scheduler = pipeline.maybe_build_scheduler().await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
            }
            recon_web::serve(pipeline, port.unwrap_or_else(recon_web::port_from_env)).await?;
        }
        Commands::Schedule => {
            let pipeline = pipeline(config).await?;
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler is disabled; set RECON_SCHEDULER_ENABLED=1");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().sync_cron, "scheduler running; Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for interrupt")?;
            pipeline.cancel_flag().store(true, Ordering::SeqCst);
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Report { runs } => {
            println!("{}", report_runs_markdown(&config.reports_dir, runs)?);
        }
    }

    Ok(())
}
