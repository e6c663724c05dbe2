use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use radar_adapters::{PageQuery, SourceError};
use radar_storage::{FailedPageRecord, JsonlJournal};
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::upsert::{BidUpserter, UpsertOutcome};

/// Inclusive update-date window swept by one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl SyncWindow {
    pub fn last_days(days: i64, today: NaiveDate) -> Self {
        Self {
            start: today - chrono::Duration::days(days.max(0)),
            end: today,
        }
    }

    pub fn ending_today(days: i64) -> Self {
        Self::last_days(days, Local::now().date_naive())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub window: SyncWindow,
    pub categories_swept: usize,
    pub pages_fetched: usize,
    pub pages_failed: usize,
    pub records_seen: usize,
    pub upserted: usize,
    pub rejected: usize,
    pub categories_aborted: Vec<i32>,
}

/// Counts for one successfully fetched page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageReport {
    pub records: usize,
    pub upserted: usize,
    pub rejected: usize,
    pub pages_remaining: u32,
}

#[derive(Debug)]
pub enum PageFetch {
    Fetched(PageReport),
    Failed(SourceError),
}

#[derive(Debug, Clone)]
pub struct SweepOptions {
    pub categories: Vec<i32>,
    pub max_pages_per_category: Option<u32>,
    pub category_error_ceiling: u32,
    pub page_pause: Duration,
}

impl From<&SyncConfig> for SweepOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            categories: config.categories.clone(),
            max_pages_per_category: config.max_pages_per_category,
            category_error_ceiling: config.category_error_ceiling,
            page_pause: config.page_pause,
        }
    }
}

pub struct SyncEngine {
    upserter: BidUpserter,
    failures: JsonlJournal<FailedPageRecord>,
    options: SweepOptions,
}

impl SyncEngine {
    pub fn new(
        upserter: BidUpserter,
        failures: JsonlJournal<FailedPageRecord>,
        options: SweepOptions,
    ) -> Self {
        Self {
            upserter,
            failures,
            options,
        }
    }

    pub async fn run(&self, window: SyncWindow) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);
        self.sweep(run_id, window).instrument(span).await
    }

    async fn sweep(&self, run_id: Uuid, window: SyncWindow) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        info!(
            window_start = %window.start,
            window_end = %window.end,
            categories = self.options.categories.len(),
            "sync run started"
        );

        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            window,
            categories_swept: 0,
            pages_fetched: 0,
            pages_failed: 0,
            records_seen: 0,
            upserted: 0,
            rejected: 0,
            categories_aborted: Vec::new(),
        };

        for &category in &self.options.categories {
            self.sweep_category(category, window, &mut summary).await?;
            summary.categories_swept += 1;
        }

        summary.finished_at = Utc::now();
        info!(
            pages_fetched = summary.pages_fetched,
            pages_failed = summary.pages_failed,
            records = summary.records_seen,
            upserted = summary.upserted,
            rejected = summary.rejected,
            aborted = summary.categories_aborted.len(),
            "sync run finished"
        );
        Ok(summary)
    }

    async fn sweep_category(
        &self,
        category: i32,
        window: SyncWindow,
        summary: &mut SyncRunSummary,
    ) -> Result<()> {
        let mut page = 1u32;
        let mut attempted = 0u32;
        let mut errors = 0u32;
        // Last page announced by the most recent successful response.
        let mut last_page: Option<u32> = None;

        loop {
            if let Some(max) = self.options.max_pages_per_category {
                if attempted >= max {
                    info!(category, max, "page limit reached");
                    break;
                }
            }
            attempted += 1;

            let query = PageQuery {
                window_start: window.start,
                window_end: window.end,
                category,
                page,
            };
            match self.process_page(&query).await? {
                PageFetch::Fetched(report) => {
                    summary.pages_fetched += 1;
                    summary.records_seen += report.records;
                    summary.upserted += report.upserted;
                    summary.rejected += report.rejected;
                    if report.pages_remaining == 0 {
                        break;
                    }
                    last_page = Some(page + report.pages_remaining);
                }
                PageFetch::Failed(err) => {
                    summary.pages_failed += 1;
                    self.failures
                        .append(&FailedPageRecord::new(category, page, window.start, window.end))
                        .await
                        .context("queueing failed page")?;
                    errors += 1;
                    warn!(category, page, errors, error = %err, "page fetch failed; queued for replay");

                    if errors > self.options.category_error_ceiling {
                        error!(category, errors, "error ceiling exceeded; category aborted");
                        summary.categories_aborted.push(category);
                        break;
                    }
                    match last_page {
                        Some(last) if page < last => {}
                        _ => break,
                    }
                }
            }

            page += 1;
            if !self.options.page_pause.is_zero() {
                tokio::time::sleep(self.options.page_pause).await;
            }
        }
        Ok(())
    }

    /// Fetches one page and upserts each record. A fetch failure is returned
    /// as data; only a failing rejection sink is an `Err`.
    pub async fn process_page(&self, query: &PageQuery) -> Result<PageFetch> {
        let page = match self.upserter.source().fetch_page(query).await {
            Ok(page) => page,
            Err(err) => return Ok(PageFetch::Failed(err)),
        };

        let mut report = PageReport {
            records: page.records.len(),
            pages_remaining: page.pages_remaining,
            ..PageReport::default()
        };
        for record in &page.records {
            match self.upserter.upsert(record).await? {
                UpsertOutcome::Rejected(_) => report.rejected += 1,
                UpsertOutcome::Written(_) | UpsertOutcome::Unchanged(_) => report.upserted += 1,
            }
        }
        info!(
            category = query.category,
            page = query.page,
            records = report.records,
            upserted = report.upserted,
            rejected = report.rejected,
            pages_remaining = report.pages_remaining,
            "page processed"
        );
        Ok(PageFetch::Fetched(report))
    }
}
