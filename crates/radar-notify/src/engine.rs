use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use radar_core::BidId;
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};

use crate::buffer::{PushBuffer, PushMessage};
use crate::dispatch::{push_message, EmailGateway, PushGateway};
use crate::email::alert_email;
use crate::profile::{compile_profiles, CompiledProfile};
use crate::store::{AlertProfileStore, ClaimedBid, LeaseStore};

#[derive(Debug, Clone)]
pub struct CycleSettings {
    pub batch_size: i64,
    pub zombie_timeout: Duration,
    pub push_batch_size: usize,
    pub detail_url_base: String,
    pub interval: Duration,
    pub error_backoff: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub zombies_recovered: u64,
    pub claimed: usize,
    pub matched_pairs: usize,
    pub push_sent: usize,
    pub push_failed: usize,
    pub emails_sent: usize,
    pub emails_failed: usize,
    pub completed: usize,
}

pub struct NotificationEngine {
    leases: Arc<dyn LeaseStore>,
    profiles: Arc<dyn AlertProfileStore>,
    push: Option<Arc<dyn PushGateway>>,
    email: Option<Arc<dyn EmailGateway>>,
    settings: CycleSettings,
}

impl NotificationEngine {
    pub fn new(
        leases: Arc<dyn LeaseStore>,
        profiles: Arc<dyn AlertProfileStore>,
        push: Option<Arc<dyn PushGateway>>,
        email: Option<Arc<dyn EmailGateway>>,
        settings: CycleSettings,
    ) -> Self {
        Self {
            leases,
            profiles,
            push,
            email,
            settings,
        }
    }

    pub async fn run_cycle(&self, cycle: u64) -> Result<CycleReport> {
        let mut report = CycleReport {
            cycle,
            ..CycleReport::default()
        };

        // Nothing may be claimed if the profiles cannot be loaded.
        let profiles = compile_profiles(
            self.profiles
                .load_active_profiles()
                .await
                .context("loading active alert profiles")?,
        );

        report.zombies_recovered = self
            .leases
            .recover_zombies(self.settings.zombie_timeout)
            .await?;
        if report.zombies_recovered > 0 {
            warn!(recovered = report.zombies_recovered, "zombie claims reset to pending");
        }

        let claimed = self.leases.claim_pending(self.settings.batch_size).await?;
        report.claimed = claimed.len();
        if claimed.is_empty() {
            return Ok(report);
        }
        info!(claimed = report.claimed, profiles = profiles.len(), "processing claimed bids");

        let mut buffer = PushBuffer::new(self.settings.push_batch_size);
        let mut emailed: HashSet<(String, BidId)> = HashSet::new();

        for bid in &claimed {
            if bid.is_actionable() {
                self.dispatch_bid(bid, &profiles, &mut buffer, &mut emailed, &mut report)
                    .await;
            }
            match self.leases.mark_done(bid).await {
                Ok(true) => report.completed += 1,
                Ok(false) => warn!(
                    bid_id = bid.id,
                    "claim was recovered by another worker; leaving the bid to it"
                ),
                Err(err) => error!(
                    bid_id = bid.id,
                    error = %format!("{err:#}"),
                    "failed to mark bid done; zombie recovery will retry it"
                ),
            }
        }

        info!(
            claimed = report.claimed,
            matched = report.matched_pairs,
            push_sent = report.push_sent,
            push_failed = report.push_failed,
            emails_sent = report.emails_sent,
            emails_failed = report.emails_failed,
            completed = report.completed,
            "cycle finished"
        );
        Ok(report)
    }

    async fn dispatch_bid(
        &self,
        bid: &ClaimedBid,
        profiles: &[CompiledProfile],
        buffer: &mut PushBuffer,
        emailed: &mut HashSet<(String, BidId)>,
        report: &mut CycleReport,
    ) {
        let mut pushed_tokens: HashSet<&str> = HashSet::new();

        for profile in profiles.iter().filter(|p| p.matches(bid)) {
            report.matched_pairs += 1;

            if profile.push_enabled && self.push.is_some() {
                for token in &profile.owner.devices {
                    if !pushed_tokens.insert(token.as_str()) {
                        continue;
                    }
                    if let Some(batch) = buffer.push(push_message(bid, profile.id, token)) {
                        self.flush_push(batch, report).await;
                    }
                }
            }

            if !profile.email_enabled {
                continue;
            }
            let (Some(gateway), Some(to)) = (&self.email, profile.owner.email.as_deref()) else {
                continue;
            };
            if !emailed.insert((to.trim().to_lowercase(), bid.id)) {
                continue;
            }
            let sent = match alert_email(to, bid, profile, &self.settings.detail_url_base) {
                Ok(message) => gateway.send(&message).await,
                Err(err) => Err(err.into()),
            };
            match sent {
                Ok(()) => report.emails_sent += 1,
                Err(err) => {
                    error!(bid_id = bid.id, profile_id = profile.id, error = %err, "email dispatch failed");
                    report.emails_failed += 1;
                }
            }
        }

        if let Some(batch) = buffer.drain() {
            self.flush_push(batch, report).await;
        }
    }

    async fn flush_push(&self, batch: Vec<PushMessage>, report: &mut CycleReport) {
        let Some(gateway) = &self.push else {
            return;
        };
        match gateway.send_batch(&batch).await {
            Ok(outcome) => {
                report.push_sent += outcome.sent;
                report.push_failed += outcome.failed;
            }
            Err(err) => {
                error!(size = batch.len(), error = %err, "push batch failed");
                report.push_failed += batch.len();
            }
        }
    }

    /// Runs cycles until `shutdown` resolves, sleeping the regular interval
    /// after a cycle and the longer back-off after a failed one.
    pub async fn run_forever<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut cycle = 0u64;
        info!("notification worker started");
        loop {
            cycle += 1;
            let pause = match self
                .run_cycle(cycle)
                .instrument(info_span!("notify_cycle", cycle))
                .await
            {
                Ok(_) => self.settings.interval,
                Err(err) => {
                    error!(cycle, error = %format!("{err:#}"), "notification cycle failed");
                    self.settings.error_backoff
                }
            };

            tokio::select! {
                _ = &mut shutdown => {
                    info!("notification worker stopping");
                    return Ok(());
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }
}
