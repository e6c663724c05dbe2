//! In-memory stores and recording gateways for cycle tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use radar_core::{BidId, CanonicalStatus, NotificationLease};
use tokio::sync::RwLock;

use crate::auth::{AccessTokenSource, AuthError, ServiceAccountKey};
use crate::buffer::PushMessage;
use crate::dispatch::{BatchOutcome, DispatchError, EmailGateway, PushGateway};
use crate::email::EmailMessage;
use crate::profile::{AlertProfile, Subscriber};
use crate::store::{AlertProfileStore, ClaimedBid, LeaseStore};

pub fn claimed_bid(id: BidId, description: &str) -> ClaimedBid {
    ClaimedBid {
        id,
        external_id: format!("12345678000190-1-{id:06}/2025"),
        description: Some(description.to_string()),
        entity_name: Some("Prefeitura de Teste".into()),
        estimated_total: None,
        derived_status: Some(CanonicalStatus::ReceivingProposals),
        uf: Some("PR".into()),
        municipality: Some("Curitiba".into()),
        category_id: Some(6),
        claimed_at: Utc::now(),
    }
}

/// Push-enabled profile with no devices, email off and no filters.
pub fn profile(id: i64, include: &[&str], exclude: &[&str]) -> AlertProfile {
    AlertProfile {
        id,
        name: format!("Alerta {id}"),
        owner: Subscriber {
            id: 100 + id,
            display_name: None,
            email: None,
            devices: Vec::new(),
        },
        push_enabled: true,
        email_enabled: false,
        include_terms: include.iter().map(|t| t.to_string()).collect(),
        exclude_terms: exclude.iter().map(|t| t.to_string()).collect(),
        ufs: Vec::new(),
        municipalities: Vec::new(),
        categories: Vec::new(),
    }
}

pub fn service_account_key(token_uri: &str) -> ServiceAccountKey {
    ServiceAccountKey {
        project_id: Some("radar-test".into()),
        client_email: "radar@radar-test.iam.gserviceaccount.com".into(),
        private_key: include_str!("../testdata/service_account_key.pem").into(),
        token_uri: token_uri.into(),
    }
}

/// Hands out one token forever and counts invalidations.
pub struct FixedTokenSource {
    token: String,
    invalidations: AtomicUsize,
}

impl FixedTokenSource {
    pub fn new(token: &str) -> Self {
        Self {
            token: token.into(),
            invalidations: AtomicUsize::new(0),
        }
    }

    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AccessTokenSource for FixedTokenSource {
    async fn access_token(&self) -> Result<String, AuthError> {
        Ok(self.token.clone())
    }

    async fn invalidate(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }
}

struct LeaseRow {
    bid: ClaimedBid,
    lease: NotificationLease,
    claim_started_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct MemoryLeaseStore {
    rows: RwLock<BTreeMap<BidId, LeaseRow>>,
    failing_done: RwLock<HashSet<BidId>>,
    reclaimed: RwLock<HashSet<BidId>>,
}

impl MemoryLeaseStore {
    pub fn with_pending(bids: Vec<ClaimedBid>) -> Self {
        let rows = bids
            .into_iter()
            .map(|bid| {
                (
                    bid.id,
                    LeaseRow {
                        bid,
                        lease: NotificationLease::Pending,
                        claim_started_at: None,
                    },
                )
            })
            .collect();
        Self {
            rows: RwLock::new(rows),
            failing_done: RwLock::default(),
            reclaimed: RwLock::default(),
        }
    }

    pub async fn insert_claimed(&self, mut bid: ClaimedBid, age_secs: i64) {
        let claimed_at = Utc::now() - chrono::Duration::seconds(age_secs);
        bid.claimed_at = claimed_at;
        self.rows.write().await.insert(
            bid.id,
            LeaseRow {
                bid,
                lease: NotificationLease::Claimed,
                claim_started_at: Some(claimed_at),
            },
        );
    }

    /// Before the done update lands, another worker recovers and re-claims
    /// the bid, giving it a fresh claim timestamp.
    pub async fn reclaim_before_done(&self, id: BidId) {
        self.reclaimed.write().await.insert(id);
    }

    pub async fn fail_done_for(&self, id: BidId) {
        self.failing_done.write().await.insert(id);
    }

    pub async fn lease(&self, id: BidId) -> Option<NotificationLease> {
        self.rows.read().await.get(&id).map(|row| row.lease)
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn recover_zombies(&self, timeout: Duration) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::seconds(timeout.as_secs() as i64);
        let mut recovered = 0;
        for row in self.rows.write().await.values_mut() {
            if row.lease == NotificationLease::Claimed
                && row.claim_started_at.is_some_and(|at| at < cutoff)
            {
                row.lease = NotificationLease::Pending;
                row.claim_started_at = None;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn claim_pending(&self, limit: i64) -> Result<Vec<ClaimedBid>> {
        let now = Utc::now();
        let mut claimed = Vec::new();
        for row in self.rows.write().await.values_mut() {
            if claimed.len() as i64 >= limit {
                break;
            }
            if row.lease == NotificationLease::Pending {
                row.lease = NotificationLease::Claimed;
                row.claim_started_at = Some(now);
                row.bid.claimed_at = now;
                claimed.push(row.bid.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_done(&self, bid: &ClaimedBid) -> Result<bool> {
        if self.failing_done.read().await.contains(&bid.id) {
            bail!("simulated failure marking {} done", bid.id);
        }
        let mut rows = self.rows.write().await;
        let Some(row) = rows.get_mut(&bid.id) else {
            return Ok(false);
        };
        if self.reclaimed.read().await.contains(&bid.id) {
            let reclaimed_at = bid.claimed_at + chrono::Duration::seconds(1);
            row.lease = NotificationLease::Claimed;
            row.claim_started_at = Some(reclaimed_at);
            row.bid.claimed_at = reclaimed_at;
        }
        if row.lease != NotificationLease::Claimed || row.claim_started_at != Some(bid.claimed_at) {
            return Ok(false);
        }
        row.lease = NotificationLease::Done;
        row.claim_started_at = None;
        Ok(true)
    }
}

pub struct MemoryProfileStore {
    profiles: Option<Vec<AlertProfile>>,
}

impl MemoryProfileStore {
    pub fn new(profiles: Vec<AlertProfile>) -> Self {
        Self {
            profiles: Some(profiles),
        }
    }

    pub fn failing() -> Self {
        Self { profiles: None }
    }
}

#[async_trait]
impl AlertProfileStore for MemoryProfileStore {
    async fn load_active_profiles(&self) -> Result<Vec<AlertProfile>> {
        match &self.profiles {
            Some(profiles) => Ok(profiles.clone()),
            None => bail!("profile store unavailable"),
        }
    }
}

#[derive(Default)]
pub struct RecordingPushGateway {
    fail: bool,
    batches: RwLock<Vec<Vec<PushMessage>>>,
}

impl RecordingPushGateway {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub async fn messages(&self) -> Vec<PushMessage> {
        self.batches.read().await.iter().flatten().cloned().collect()
    }

    pub async fn batch_sizes(&self) -> Vec<usize> {
        self.batches.read().await.iter().map(Vec::len).collect()
    }
}

#[async_trait]
impl PushGateway for RecordingPushGateway {
    async fn send_batch(&self, batch: &[PushMessage]) -> Result<BatchOutcome, DispatchError> {
        if self.fail {
            return Err(DispatchError::Rejected {
                provider: "recording",
                status: 503,
                body: "unavailable".into(),
            });
        }
        self.batches.write().await.push(batch.to_vec());
        Ok(BatchOutcome {
            sent: batch.len(),
            failed: 0,
        })
    }
}

#[derive(Default)]
pub struct RecordingEmailGateway {
    fail: bool,
    sent: RwLock<Vec<EmailMessage>>,
}

impl RecordingEmailGateway {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub async fn sent(&self) -> Vec<EmailMessage> {
        self.sent.read().await.clone()
    }
}

#[async_trait]
impl EmailGateway for RecordingEmailGateway {
    async fn send(&self, message: &EmailMessage) -> Result<(), DispatchError> {
        if self.fail {
            return Err(DispatchError::Rejected {
                provider: "recording",
                status: 503,
                body: "unavailable".into(),
            });
        }
        self.sent.write().await.push(message.clone());
        Ok(())
    }
}
