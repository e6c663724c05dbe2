//! Lease and profile stores. The lease is a tri-state column on `bids`;
//! claiming is a single conditional update so concurrent workers never
//! share a bid.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use radar_core::{BidId, CanonicalStatus, NotificationLease};
use sqlx::{PgPool, Row};

use crate::profile::{AlertProfile, Subscriber};

/// The slice of a bid the matcher and the message builders need.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedBid {
    pub id: BidId,
    pub external_id: String,
    pub description: Option<String>,
    pub entity_name: Option<String>,
    pub estimated_total: Option<f64>,
    pub derived_status: Option<CanonicalStatus>,
    pub uf: Option<String>,
    pub municipality: Option<String>,
    pub category_id: Option<i32>,
    /// Claim timestamp as stored; completing the lease requires it to match.
    pub claimed_at: DateTime<Utc>,
}

impl ClaimedBid {
    /// Unparseable stored statuses are treated as actionable.
    pub fn is_actionable(&self) -> bool {
        self.derived_status.map_or(true, CanonicalStatus::is_actionable)
    }
}

#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Resets `Claimed` bids whose claim is older than `timeout` back to
    /// `Pending`. Returns how many were recovered.
    async fn recover_zombies(&self, timeout: Duration) -> Result<u64>;

    /// Atomically moves up to `limit` `Pending` bids to `Claimed` and returns
    /// exactly those rows.
    async fn claim_pending(&self, limit: i64) -> Result<Vec<ClaimedBid>>;

    /// Completes the claim this worker holds. Returns `false` when the claim
    /// was recovered and taken by another worker in the meantime.
    async fn mark_done(&self, bid: &ClaimedBid) -> Result<bool>;
}

#[async_trait]
pub trait AlertProfileStore: Send + Sync {
    async fn load_active_profiles(&self) -> Result<Vec<AlertProfile>>;
}

#[derive(Debug, Clone)]
pub struct PgNotificationStore {
    pool: PgPool,
}

impl PgNotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaseStore for PgNotificationStore {
    async fn recover_zombies(&self, timeout: Duration) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE bids
               SET notification_status = $1,
                   claim_started_at = NULL
             WHERE notification_status = $2
               AND claim_started_at < NOW() - ($3::BIGINT * INTERVAL '1 second')
            "#,
        )
        .bind(NotificationLease::Pending.code())
        .bind(NotificationLease::Claimed.code())
        .bind(timeout.as_secs() as i64)
        .execute(&self.pool)
        .await
        .context("recovering zombie claims")?;
        Ok(result.rows_affected())
    }

    async fn claim_pending(&self, limit: i64) -> Result<Vec<ClaimedBid>> {
        let rows = sqlx::query(
            r#"
            UPDATE bids
               SET notification_status = $1,
                   claim_started_at = NOW()
             WHERE id IN (
                   SELECT id
                     FROM bids
                    WHERE notification_status = $2
                    ORDER BY id
                    LIMIT $3
                      FOR UPDATE SKIP LOCKED
             )
            RETURNING id, external_id, description, entity_name, estimated_total,
                      derived_status, uf, municipality, category_id, claim_started_at
            "#,
        )
        .bind(NotificationLease::Claimed.code())
        .bind(NotificationLease::Pending.code())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("claiming pending bids")?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            claimed.push(ClaimedBid {
                id: row.try_get("id")?,
                external_id: row.try_get("external_id")?,
                description: row.try_get("description")?,
                entity_name: row.try_get("entity_name")?,
                estimated_total: row.try_get("estimated_total")?,
                derived_status: row
                    .try_get::<Option<String>, _>("derived_status")?
                    .and_then(|s| s.parse().ok()),
                uf: row.try_get("uf")?,
                municipality: row.try_get("municipality")?,
                category_id: row.try_get("category_id")?,
                claimed_at: row.try_get("claim_started_at")?,
            });
        }
        Ok(claimed)
    }

    async fn mark_done(&self, bid: &ClaimedBid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE bids
               SET notification_status = $1,
                   claim_started_at = NULL
             WHERE id = $2
               AND notification_status = $3
               AND claim_started_at = $4
            "#,
        )
        .bind(NotificationLease::Done.code())
        .bind(bid.id)
        .bind(NotificationLease::Claimed.code())
        .bind(bid.claimed_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("marking bid {} done", bid.id))?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl AlertProfileStore for PgNotificationStore {
    async fn load_active_profiles(&self) -> Result<Vec<AlertProfile>> {
        let rows = sqlx::query(
            r#"
            SELECT p.id, p.name, p.push_enabled, p.email_enabled,
                   s.id AS subscriber_id, s.display_name, s.email
              FROM alert_profiles p
              JOIN subscribers s ON s.id = p.subscriber_id
             WHERE p.active
               AND (p.push_enabled OR p.email_enabled)
               AND s.subscription_status IN ('active', 'trial', 'grace_period')
             ORDER BY p.id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("loading alert profiles")?;

        let mut profiles = Vec::with_capacity(rows.len());
        for row in rows {
            profiles.push(AlertProfile {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                owner: Subscriber {
                    id: row.try_get("subscriber_id")?,
                    display_name: row.try_get("display_name")?,
                    email: row.try_get("email")?,
                    devices: Vec::new(),
                },
                push_enabled: row.try_get("push_enabled")?,
                email_enabled: row.try_get("email_enabled")?,
                include_terms: Vec::new(),
                exclude_terms: Vec::new(),
                ufs: Vec::new(),
                municipalities: Vec::new(),
                categories: Vec::new(),
            });
        }
        if profiles.is_empty() {
            return Ok(profiles);
        }

        let profile_ids: Vec<i64> = profiles.iter().map(|p| p.id).collect();
        let subscriber_ids: Vec<i64> = profiles.iter().map(|p| p.owner.id).collect();
        let index: HashMap<i64, usize> = profiles
            .iter()
            .enumerate()
            .map(|(i, p)| (p.id, i))
            .collect();

        let terms = sqlx::query(
            "SELECT profile_id, kind, term FROM alert_profile_terms WHERE profile_id = ANY($1)",
        )
        .bind(&profile_ids)
        .fetch_all(&self.pool)
        .await
        .context("loading profile terms")?;
        for row in terms {
            let profile_id: i64 = row.try_get("profile_id")?;
            let kind: String = row.try_get("kind")?;
            let term: String = row.try_get("term")?;
            if let Some(&i) = index.get(&profile_id) {
                match kind.as_str() {
                    "include" => profiles[i].include_terms.push(term),
                    "exclude" => profiles[i].exclude_terms.push(term),
                    _ => {}
                }
            }
        }

        let ufs = sqlx::query("SELECT profile_id, uf FROM alert_profile_ufs WHERE profile_id = ANY($1)")
            .bind(&profile_ids)
            .fetch_all(&self.pool)
            .await
            .context("loading profile UF filters")?;
        for row in ufs {
            if let Some(&i) = index.get(&row.try_get::<i64, _>("profile_id")?) {
                profiles[i].ufs.push(row.try_get("uf")?);
            }
        }

        let municipalities = sqlx::query(
            "SELECT profile_id, municipality FROM alert_profile_municipalities WHERE profile_id = ANY($1)",
        )
        .bind(&profile_ids)
        .fetch_all(&self.pool)
        .await
        .context("loading profile municipality filters")?;
        for row in municipalities {
            if let Some(&i) = index.get(&row.try_get::<i64, _>("profile_id")?) {
                profiles[i].municipalities.push(row.try_get("municipality")?);
            }
        }

        let categories = sqlx::query(
            "SELECT profile_id, category_id FROM alert_profile_categories WHERE profile_id = ANY($1)",
        )
        .bind(&profile_ids)
        .fetch_all(&self.pool)
        .await
        .context("loading profile category filters")?;
        for row in categories {
            if let Some(&i) = index.get(&row.try_get::<i64, _>("profile_id")?) {
                profiles[i].categories.push(row.try_get("category_id")?);
            }
        }

        let devices = sqlx::query(
            "SELECT subscriber_id, push_token FROM subscriber_devices WHERE subscriber_id = ANY($1) ORDER BY id",
        )
        .bind(&subscriber_ids)
        .fetch_all(&self.pool)
        .await
        .context("loading subscriber devices")?;
        let mut tokens_by_subscriber: HashMap<i64, Vec<String>> = HashMap::new();
        for row in devices {
            tokens_by_subscriber
                .entry(row.try_get("subscriber_id")?)
                .or_default()
                .push(row.try_get("push_token")?);
        }
        for profile in &mut profiles {
            if let Some(tokens) = tokens_by_subscriber.get(&profile.owner.id) {
                profile.owner.devices = tokens.clone();
            }
        }

        Ok(profiles)
    }
}
