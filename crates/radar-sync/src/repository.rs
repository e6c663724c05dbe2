//! Canonical store seam. Child collections are replaced wholesale inside
//! `write_bid`; callers never issue child SQL.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use radar_core::{Attachment, Bid, BidId, CanonicalStatus, LineItem};
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};

/// What the upsert path needs to know about an already stored bid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredBidState {
    pub id: BidId,
    pub last_update: Option<NaiveDateTime>,
    pub line_item_count: i64,
    pub attachment_count: i64,
    /// A child fetch has replaced the collection at least once.
    pub line_items_synced: bool,
    pub attachments_synced: bool,
    pub derived_status: Option<CanonicalStatus>,
}

impl StoredBidState {
    /// Zero stored line items only means "missing" until a fetch has run.
    pub fn needs_line_items(&self) -> bool {
        self.line_item_count == 0 && !self.line_items_synced
    }

    pub fn needs_attachments(&self) -> bool {
        self.attachment_count == 0 && !self.attachments_synced
    }
}

/// A bid plus whichever child collections were fetched for it. `None` leaves
/// the stored collection untouched.
#[derive(Debug, Clone)]
pub struct BidWrite {
    pub bid: Bid,
    pub line_items: Option<Vec<LineItem>>,
    pub attachments: Option<Vec<Attachment>>,
}

#[async_trait]
pub trait BidRepository: Send + Sync {
    async fn find_bid_state(&self, external_id: &str) -> Result<Option<StoredBidState>>;

    /// Upserts the bid and replaces the fetched child collections in one
    /// transaction. Never touches the notification lease.
    async fn write_bid(&self, write: &BidWrite) -> Result<BidId>;

    /// Moves `receiving_proposals` bids whose close timestamp is before `now`
    /// to `under_judgment`. Returns the number of promoted rows.
    async fn promote_expired_receiving(&self, now: NaiveDateTime) -> Result<u64>;
}

#[derive(Debug, Clone)]
pub struct PgBidRepository {
    pool: PgPool,
}

impl PgBidRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const UPSERT_BID_SQL: &str = r#"
INSERT INTO bids (
    external_id, entity_cnpj, purchase_year, purchase_sequence, purchase_number,
    process_number, category_id, category_name, dispute_mode_name, raw_status_code,
    raw_status_name, derived_status, description, complementary_info, srp,
    estimated_total, awarded_total, proposal_open_at, proposal_close_at, published_on,
    included_on, last_update_at, entity_name, unit_code, unit_name,
    ibge_code, municipality, uf, origin_system_url, portal_url
)
VALUES (
    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
    $11, $12, $13, $14, $15, $16, $17, $18, $19, $20,
    $21, $22, $23, $24, $25, $26, $27, $28, $29, $30
)
ON CONFLICT (external_id) DO UPDATE SET
    entity_cnpj = EXCLUDED.entity_cnpj,
    purchase_year = EXCLUDED.purchase_year,
    purchase_sequence = EXCLUDED.purchase_sequence,
    purchase_number = EXCLUDED.purchase_number,
    process_number = EXCLUDED.process_number,
    category_id = EXCLUDED.category_id,
    category_name = EXCLUDED.category_name,
    dispute_mode_name = EXCLUDED.dispute_mode_name,
    raw_status_code = EXCLUDED.raw_status_code,
    raw_status_name = EXCLUDED.raw_status_name,
    derived_status = EXCLUDED.derived_status,
    description = EXCLUDED.description,
    complementary_info = EXCLUDED.complementary_info,
    srp = EXCLUDED.srp,
    estimated_total = EXCLUDED.estimated_total,
    awarded_total = EXCLUDED.awarded_total,
    proposal_open_at = EXCLUDED.proposal_open_at,
    proposal_close_at = EXCLUDED.proposal_close_at,
    published_on = EXCLUDED.published_on,
    included_on = EXCLUDED.included_on,
    last_update_at = EXCLUDED.last_update_at,
    entity_name = EXCLUDED.entity_name,
    unit_code = EXCLUDED.unit_code,
    unit_name = EXCLUDED.unit_name,
    ibge_code = EXCLUDED.ibge_code,
    municipality = EXCLUDED.municipality,
    uf = EXCLUDED.uf,
    origin_system_url = EXCLUDED.origin_system_url,
    portal_url = EXCLUDED.portal_url,
    updated_at = NOW()
RETURNING id
"#;

async fn replace_line_items(
    tx: &mut Transaction<'_, Postgres>,
    bid_id: BidId,
    items: &[LineItem],
) -> Result<()> {
    sqlx::query("DELETE FROM line_items WHERE bid_id = $1")
        .bind(bid_id)
        .execute(&mut **tx)
        .await
        .context("deleting line items")?;
    sqlx::query("UPDATE bids SET line_items_synced_at = NOW() WHERE id = $1")
        .bind(bid_id)
        .execute(&mut **tx)
        .await
        .context("marking line items synced")?;

    if items.is_empty() {
        return Ok(());
    }

    let mut builder = QueryBuilder::<Postgres>::new(
        "INSERT INTO line_items (bid_id, item_number, description, material_or_service, \
         quantity, unit, unit_estimated_value, total_value, confidential_budget, \
         category_name, judgment_criterion, status_text, has_result, included_on, updated_on) ",
    );
    builder.push_values(items, |mut row, item| {
        row.push_bind(bid_id)
            .push_bind(item.item_number)
            .push_bind(&item.description)
            .push_bind(&item.material_or_service)
            .push_bind(item.quantity)
            .push_bind(&item.unit)
            .push_bind(item.unit_estimated_value)
            .push_bind(item.total_value)
            .push_bind(item.confidential_budget)
            .push_bind(&item.category_name)
            .push_bind(&item.judgment_criterion)
            .push_bind(&item.status_text)
            .push_bind(item.has_result)
            .push_bind(item.included_on)
            .push_bind(item.updated_on);
    });
    builder
        .build()
        .execute(&mut **tx)
        .await
        .context("inserting line items")?;
    Ok(())
}

async fn replace_attachments(
    tx: &mut Transaction<'_, Postgres>,
    bid_id: BidId,
    attachments: &[Attachment],
) -> Result<()> {
    sqlx::query("DELETE FROM attachments WHERE bid_id = $1")
        .bind(bid_id)
        .execute(&mut **tx)
        .await
        .context("deleting attachments")?;
    sqlx::query("UPDATE bids SET attachments_synced_at = NOW() WHERE id = $1")
        .bind(bid_id)
        .execute(&mut **tx)
        .await
        .context("marking attachments synced")?;

    if attachments.is_empty() {
        return Ok(());
    }

    let mut builder = QueryBuilder::<Postgres>::new(
        "INSERT INTO attachments (bid_id, title, download_url, document_sequence, \
         published_on, purchase_year, active) ",
    );
    builder.push_values(attachments, |mut row, attachment| {
        row.push_bind(bid_id)
            .push_bind(&attachment.title)
            .push_bind(&attachment.download_url)
            .push_bind(attachment.document_sequence)
            .push_bind(attachment.published_on)
            .push_bind(attachment.purchase_year)
            .push_bind(attachment.active);
    });
    builder.push(" ON CONFLICT (download_url) DO NOTHING");
    builder
        .build()
        .execute(&mut **tx)
        .await
        .context("inserting attachments")?;
    Ok(())
}

#[async_trait]
impl BidRepository for PgBidRepository {
    async fn find_bid_state(&self, external_id: &str) -> Result<Option<StoredBidState>> {
        let row = sqlx::query(
            r#"
            SELECT b.id,
                   b.last_update_at,
                   b.derived_status,
                   b.line_items_synced_at IS NOT NULL AS line_items_synced,
                   b.attachments_synced_at IS NOT NULL AS attachments_synced,
                   (SELECT COUNT(*) FROM line_items li WHERE li.bid_id = b.id) AS line_item_count,
                   (SELECT COUNT(*) FROM attachments a WHERE a.bid_id = b.id) AS attachment_count
              FROM bids b
             WHERE b.external_id = $1
            "#,
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("loading stored state for {external_id}"))?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(StoredBidState {
            id: row.try_get("id")?,
            last_update: row.try_get("last_update_at")?,
            line_item_count: row.try_get("line_item_count")?,
            attachment_count: row.try_get("attachment_count")?,
            line_items_synced: row.try_get("line_items_synced")?,
            attachments_synced: row.try_get("attachments_synced")?,
            derived_status: row
                .try_get::<Option<String>, _>("derived_status")?
                .and_then(|s| s.parse().ok()),
        }))
    }

    async fn write_bid(&self, write: &BidWrite) -> Result<BidId> {
        let bid = &write.bid;
        let mut tx = self.pool.begin().await.context("opening transaction")?;

        let bid_id: BidId = sqlx::query_scalar(UPSERT_BID_SQL)
            .bind(&bid.external_id)
            .bind(&bid.purchase.cnpj)
            .bind(bid.purchase.year)
            .bind(bid.purchase.sequence)
            .bind(&bid.purchase_number)
            .bind(&bid.process_number)
            .bind(bid.category_id)
            .bind(&bid.category_name)
            .bind(&bid.dispute_mode_name)
            .bind(bid.raw_status_code)
            .bind(&bid.raw_status_name)
            .bind(bid.derived_status.as_str())
            .bind(&bid.description)
            .bind(&bid.complementary_info)
            .bind(bid.srp)
            .bind(bid.estimated_total)
            .bind(bid.awarded_total)
            .bind(bid.proposal_open_at)
            .bind(bid.proposal_close_at)
            .bind(bid.published_on)
            .bind(bid.included_on)
            .bind(bid.last_update_at)
            .bind(&bid.entity_name)
            .bind(&bid.unit_code)
            .bind(&bid.unit_name)
            .bind(&bid.ibge_code)
            .bind(&bid.municipality)
            .bind(&bid.uf)
            .bind(&bid.origin_system_url)
            .bind(&bid.portal_url)
            .fetch_one(&mut *tx)
            .await
            .with_context(|| format!("upserting bid {}", bid.external_id))?;

        if let Some(items) = &write.line_items {
            replace_line_items(&mut tx, bid_id, items).await?;
        }
        if let Some(attachments) = &write.attachments {
            replace_attachments(&mut tx, bid_id, attachments).await?;
        }

        tx.commit().await.context("committing bid write")?;
        Ok(bid_id)
    }

    async fn promote_expired_receiving(&self, now: NaiveDateTime) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE bids
               SET derived_status = $1,
                   updated_at = NOW()
             WHERE derived_status = $2
               AND proposal_close_at IS NOT NULL
               AND proposal_close_at < $3
            "#,
        )
        .bind(CanonicalStatus::UnderJudgment.as_str())
        .bind(CanonicalStatus::ReceivingProposals.as_str())
        .bind(now)
        .execute(&self.pool)
        .await
        .context("promoting expired receiving bids")?;
        Ok(result.rows_affected())
    }
}
