//! Replays the failed-page queue through the same fetch and upsert path the
//! sweep uses, dead-lettering pages that keep failing.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use radar_adapters::PageQuery;
use radar_storage::{FailedPageRecord, JsonlJournal};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::engine::{PageFetch, SyncEngine};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReprocessSummary {
    pub replayed: usize,
    pub still_failing: usize,
    pub dead_lettered: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct ReplayPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl ReplayPolicy {
    /// `base * 2^(attempts-1)`, saturating.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(1u32 << exp)
    }
}

pub struct FailureReprocessor {
    queue: JsonlJournal<FailedPageRecord>,
    dead_letter: JsonlJournal<FailedPageRecord>,
    policy: ReplayPolicy,
}

impl FailureReprocessor {
    pub fn new(
        queue: JsonlJournal<FailedPageRecord>,
        dead_letter: JsonlJournal<FailedPageRecord>,
        policy: ReplayPolicy,
    ) -> Self {
        Self {
            queue,
            dead_letter,
            policy,
        }
    }

    pub async fn run(&self, engine: &SyncEngine) -> Result<ReprocessSummary> {
        let records = self
            .queue
            .read_all()
            .await
            .context("reading failed-page queue")?;
        let mut summary = ReprocessSummary::default();
        if records.is_empty() {
            info!("failed-page queue is empty");
            return Ok(summary);
        }
        info!(queued = records.len(), "replaying failed pages");

        let mut kept = Vec::with_capacity(records.len());
        let mut pending = records.into_iter();
        let outcome = self
            .replay(engine, &mut pending, &mut kept, &mut summary)
            .await;
        // Whatever was not reached stays queued untouched; dead-lettered
        // records are never written back.
        kept.extend(pending);

        self.queue
            .rewrite(&kept)
            .await
            .context("rewriting failed-page queue")?;
        outcome?;
        info!(
            replayed = summary.replayed,
            still_failing = summary.still_failing,
            dead_lettered = summary.dead_lettered,
            "reprocess finished"
        );
        Ok(summary)
    }

    /// Stops at the first error. A record whose replay errored is pushed back
    /// onto `kept` before returning.
    async fn replay(
        &self,
        engine: &SyncEngine,
        pending: &mut std::vec::IntoIter<FailedPageRecord>,
        kept: &mut Vec<FailedPageRecord>,
        summary: &mut ReprocessSummary,
    ) -> Result<()> {
        for mut record in pending.by_ref() {
            let query = PageQuery {
                window_start: record.window_start,
                window_end: record.window_end,
                category: record.category,
                page: record.page,
            };
            let fetch = match engine.process_page(&query).await {
                Ok(fetch) => fetch,
                Err(err) => {
                    kept.push(record);
                    return Err(err);
                }
            };
            match fetch {
                PageFetch::Fetched(_) => {
                    info!(category = record.category, page = record.page, "failed page replayed");
                    summary.replayed += 1;
                }
                PageFetch::Failed(err) => {
                    record.attempts += 1;
                    record.last_attempt_at = Some(Utc::now());
                    let delay = self.policy.delay_for_attempt(record.attempts);
                    warn!(
                        category = record.category,
                        page = record.page,
                        attempts = record.attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "replay failed"
                    );
                    tokio::time::sleep(delay).await;

                    if record.attempts < self.policy.max_attempts {
                        summary.still_failing += 1;
                        kept.push(record);
                        continue;
                    }
                    error!(
                        category = record.category,
                        page = record.page,
                        attempts = record.attempts,
                        "replay attempts exhausted; moved to dead letter"
                    );
                    if let Err(err) = self.dead_letter.append(&record).await {
                        kept.push(record);
                        return Err(err).context("appending to dead letter");
                    }
                    summary.dead_lettered += 1;
                }
            }
        }
        Ok(())
    }
}
