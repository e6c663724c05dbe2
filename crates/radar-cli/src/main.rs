use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use radar_notify::NotifyConfig;
use radar_sync::{SyncConfig, SyncService};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "radar-cli")]
#[command(about = "Radar procurement sync and alerting")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sweep the update window and upsert every bid found.
    Sync {
        /// Window length in days, ending today.
        #[arg(long)]
        days: Option<i64>,
    },
    /// Replay the failed-page queue.
    Reprocess,
    /// Promote bids whose proposal window has closed.
    RefreshStatus,
    /// Run the notification worker.
    Notify {
        /// Run a single cycle and exit.
        #[arg(long)]
        once: bool,
    },
    Migrate,
    /// Run sync, reprocess and status refresh on the configured cron schedule.
    Schedule,
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,radar_sync=info,radar_notify=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { days: None }) {
        Commands::Sync { days } => {
            let service = SyncService::connect(SyncConfig::from_env()).await?;
            match service.sync(days).await? {
                Some(summary) => println!(
                    "sync complete: run_id={} categories={} pages={} failed_pages={} records={} upserted={} rejected={} aborted={:?}",
                    summary.run_id,
                    summary.categories_swept,
                    summary.pages_fetched,
                    summary.pages_failed,
                    summary.records_seen,
                    summary.upserted,
                    summary.rejected,
                    summary.categories_aborted
                ),
                None => println!("sync skipped: another run holds the lock"),
            }
        }
        Commands::Reprocess => {
            let service = SyncService::connect(SyncConfig::from_env()).await?;
            match service.reprocess().await? {
                Some(summary) => println!(
                    "reprocess complete: replayed={} still_failing={} dead_lettered={}",
                    summary.replayed, summary.still_failing, summary.dead_lettered
                ),
                None => println!("reprocess skipped: another run holds the lock"),
            }
        }
        Commands::RefreshStatus => {
            let service = SyncService::connect(SyncConfig::from_env()).await?;
            match service.refresh_status().await? {
                Some(promoted) => println!("status refresh complete: promoted={promoted}"),
                None => println!("status refresh skipped: another run holds the lock"),
            }
        }
        Commands::Notify { once } => {
            let config = NotifyConfig::from_env();
            let pool = radar_sync::connect(&config.database_url).await?;
            let engine = radar_notify::build_engine(&config, pool)?;
            if once {
                let report = engine.run_cycle(1).await?;
                println!(
                    "notify cycle complete: zombies={} claimed={} matched={} push_sent={} push_failed={} emails_sent={} emails_failed={} completed={}",
                    report.zombies_recovered,
                    report.claimed,
                    report.matched_pairs,
                    report.push_sent,
                    report.push_failed,
                    report.emails_sent,
                    report.emails_failed,
                    report.completed
                );
            } else {
                engine.run_forever(shutdown_signal()).await?;
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let pool = radar_sync::connect(&config.database_url).await?;
            radar_sync::migrate(&pool).await?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let service = Arc::new(SyncService::connect(SyncConfig::from_env()).await?);
            let Some(mut sched) = service.maybe_build_scheduler().await? else {
                eprintln!("scheduler disabled; set RADAR_SCHEDULER_ENABLED=true to enable it");
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(
                cron_1 = %service.config().sync_cron_1,
                cron_2 = %service.config().sync_cron_2,
                "scheduler running"
            );
            shutdown_signal().await;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
