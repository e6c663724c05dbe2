//! Bid synchronization: the sweep engine, the upsert adapter, failed-page
//! replay, status refresh and the cron scheduler that strings them together.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use radar_adapters::{BidSource, PncpClient, PncpClientConfig};
use radar_storage::{HttpClientConfig, HttpFetcher, LockError, RunLock, StateDir};
use serde::Serialize;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

pub mod config;
pub mod engine;
pub mod reprocess;
pub mod repository;
pub mod upsert;

#[cfg(test)]
mod testing;

pub use config::{SyncConfig, DEFAULT_CATEGORIES};
pub use engine::{PageFetch, PageReport, SweepOptions, SyncEngine, SyncRunSummary, SyncWindow};
pub use reprocess::{FailureReprocessor, ReplayPolicy, ReprocessSummary};
pub use repository::{BidRepository, BidWrite, PgBidRepository, StoredBidState};
pub use upsert::{BidUpserter, UpsertOutcome};

pub const CRATE_NAME: &str = "radar-sync";

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn connect(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .context("connecting to postgres")
}

pub async fn migrate(pool: &PgPool) -> Result<()> {
    MIGRATOR.run(pool).await.context("applying migrations")?;
    Ok(())
}

/// Result of one scheduled tick: sync, then reprocess, then status refresh.
#[derive(Debug, Clone, Serialize)]
pub struct TickSummary {
    pub sync: SyncRunSummary,
    pub reprocess: ReprocessSummary,
    pub promoted: u64,
}

/// Entry point for every job that writes the canonical store. Each public
/// operation holds the run lock for its whole duration and yields `None`
/// when another process already holds it.
pub struct SyncService {
    config: SyncConfig,
    state: StateDir,
    engine: SyncEngine,
    reprocessor: FailureReprocessor,
    repository: Arc<dyn BidRepository>,
}

impl SyncService {
    pub fn new(
        config: SyncConfig,
        source: Arc<dyn BidSource>,
        repository: Arc<dyn BidRepository>,
    ) -> Self {
        let state = StateDir::new(config.state_dir.clone());
        let upserter = BidUpserter::new(source, repository.clone(), state.rejections());
        let engine = SyncEngine::new(upserter, state.failed_pages(), SweepOptions::from(&config));
        let reprocessor = FailureReprocessor::new(
            state.failed_pages(),
            state.dead_letter(),
            ReplayPolicy {
                max_attempts: config.reprocess_max_attempts,
                backoff_base: config.reprocess_backoff_base,
            },
        );
        Self {
            config,
            state,
            engine,
            reprocessor,
            repository,
        }
    }

    /// Wires the PNCP client and the Postgres repository from `config`.
    pub async fn connect(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let source = PncpClient::new(
            http,
            PncpClientConfig {
                source_base_url: config.source_base_url.clone(),
                child_api_base_url: config.child_api_base_url.clone(),
                page_size: config.page_size,
                child_page_pause: config.child_page_pause,
            },
        );
        let pool = connect(&config.database_url).await?;
        Ok(Self::new(
            config,
            Arc::new(source),
            Arc::new(PgBidRepository::new(pool)),
        ))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn try_lock(&self) -> Result<Option<RunLock>> {
        match self.state.acquire_run_lock() {
            Ok(lock) => Ok(Some(lock)),
            Err(LockError::Locked(path)) => {
                warn!(lock = %path.display(), "another run holds the lock; skipping");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn sync(&self, days: Option<i64>) -> Result<Option<SyncRunSummary>> {
        let Some(_lock) = self.try_lock()? else {
            return Ok(None);
        };
        let window = SyncWindow::ending_today(days.unwrap_or(self.config.window_days));
        self.engine.run(window).await.map(Some)
    }

    pub async fn reprocess(&self) -> Result<Option<ReprocessSummary>> {
        let Some(_lock) = self.try_lock()? else {
            return Ok(None);
        };
        self.reprocessor.run(&self.engine).await.map(Some)
    }

    pub async fn refresh_status(&self) -> Result<Option<u64>> {
        let Some(_lock) = self.try_lock()? else {
            return Ok(None);
        };
        self.promote_expired().await.map(Some)
    }

    async fn promote_expired(&self) -> Result<u64> {
        let promoted = self
            .repository
            .promote_expired_receiving(Local::now().naive_local())
            .await?;
        info!(promoted, "status refresh finished");
        Ok(promoted)
    }

    pub async fn scheduled_tick(&self) -> Result<Option<TickSummary>> {
        let Some(_lock) = self.try_lock()? else {
            return Ok(None);
        };
        let sync = self
            .engine
            .run(SyncWindow::ending_today(self.config.window_days))
            .await?;
        let reprocess = self.reprocessor.run(&self.engine).await?;
        let promoted = self.promote_expired().await?;
        Ok(Some(TickSummary {
            sync,
            reprocess,
            promoted,
        }))
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for cron in [&self.config.sync_cron_1, &self.config.sync_cron_2] {
            let service = Arc::clone(self);
            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let service = Arc::clone(&service);
                Box::pin(async move {
                    match service.scheduled_tick().await {
                        Ok(Some(tick)) => info!(
                            run_id = %tick.sync.run_id,
                            upserted = tick.sync.upserted,
                            replayed = tick.reprocess.replayed,
                            promoted = tick.promoted,
                            "scheduled tick finished"
                        ),
                        Ok(None) => {}
                        Err(err) => error!(error = %format!("{err:#}"), "scheduled tick failed"),
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
        }
        Ok(Some(sched))
    }
}
