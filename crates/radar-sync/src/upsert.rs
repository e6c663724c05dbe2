use std::sync::Arc;

use anyhow::Result;
use radar_adapters::{collect_attachments, collect_line_items, BidSource};
use radar_core::{
    derive_status_now, validate, Attachment, Bid, BidId, LineItem, RawBid, RawLineItem,
    StatusInputs,
};
use radar_storage::{JsonlJournal, RejectedRecord, RejectionKind};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::repository::{BidRepository, BidWrite};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The bid row (and any fetched children) was written.
    Written(BidId),
    /// Nothing changed at the source and no child refetch was needed.
    Unchanged(BidId),
    Rejected(RejectionKind),
}

impl UpsertOutcome {
    pub fn bid_id(self) -> Option<BidId> {
        match self {
            UpsertOutcome::Written(id) | UpsertOutcome::Unchanged(id) => Some(id),
            UpsertOutcome::Rejected(_) => None,
        }
    }
}

pub struct BidUpserter {
    source: Arc<dyn BidSource>,
    repository: Arc<dyn BidRepository>,
    rejections: JsonlJournal<RejectedRecord>,
}

impl BidUpserter {
    pub fn new(
        source: Arc<dyn BidSource>,
        repository: Arc<dyn BidRepository>,
        rejections: JsonlJournal<RejectedRecord>,
    ) -> Self {
        Self {
            source,
            repository,
            rejections,
        }
    }

    pub fn source(&self) -> &Arc<dyn BidSource> {
        &self.source
    }

    /// Returns the local id, or `None` when the record was rejected and
    /// logged to the rejection sink. `Err` only when the sink itself fails.
    pub async fn upsert_bid(&self, raw_json: &JsonValue) -> Result<Option<BidId>> {
        Ok(self.upsert(raw_json).await?.bid_id())
    }

    pub async fn upsert(&self, raw_json: &JsonValue) -> Result<UpsertOutcome> {
        let raw: RawBid = match serde_json::from_value(raw_json.clone()) {
            Ok(raw) => raw,
            Err(err) => {
                return self
                    .reject(RejectionKind::BidDecode, err.to_string(), raw_json)
                    .await
            }
        };
        let key = match validate(&raw) {
            Ok(key) => key,
            Err(err) => {
                return self
                    .reject(RejectionKind::BidValidation, err.to_string(), raw_json)
                    .await
            }
        };

        let stored = match self.repository.find_bid_state(&key.external_id).await {
            Ok(stored) => stored,
            Err(err) => {
                return self
                    .reject(RejectionKind::StoreWrite, format!("{err:#}"), raw_json)
                    .await
            }
        };

        let changed = match stored.and_then(|s| s.last_update) {
            Some(previous) => key.last_update > previous,
            None => true,
        };

        let raw_items: Option<Vec<RawLineItem>> =
            if changed || stored.map_or(true, |s| s.needs_line_items()) {
                match collect_line_items(self.source.as_ref(), &key.purchase).await {
                    Ok(items) => Some(items),
                    Err(err) => {
                        return self
                            .reject(
                                RejectionKind::LineItemsFetch,
                                format!("line items for {}: {err}", key.external_id),
                                raw_json,
                            )
                            .await
                    }
                }
            } else {
                None
            };

        let attachments: Option<Vec<Attachment>> =
            if changed || stored.map_or(true, |s| s.needs_attachments()) {
                match collect_attachments(self.source.as_ref(), &key.purchase).await {
                    Ok(raw) => Some(
                        raw.iter()
                            .filter_map(|a| {
                                Attachment::from_raw(a, |seq| {
                                    self.source.attachment_download_url(&key.purchase, seq)
                                })
                            })
                            .collect(),
                    ),
                    Err(err) => {
                        warn!(
                            external_id = %key.external_id,
                            error = %err,
                            "attachment fetch failed; keeping stored attachments"
                        );
                        None
                    }
                }
            } else {
                None
            };

        if let Some(state) = stored {
            if !changed && raw_items.is_none() && attachments.is_none() {
                debug!(external_id = %key.external_id, "unchanged");
                return Ok(UpsertOutcome::Unchanged(state.id));
            }
        }

        // Without fresh items only an unchanged stored bid can reach this point,
        // so its stored status stays authoritative.
        let derived_status = match (&raw_items, stored.and_then(|s| s.derived_status)) {
            (None, Some(status)) => status,
            (items, _) => derive_status_now(&StatusInputs {
                raw_status_code: raw.status_code,
                open_date: raw.proposal_open_at(),
                close_date: raw.proposal_close_at(),
                line_item_statuses: items
                    .iter()
                    .flatten()
                    .map(|item| item.status_text.clone())
                    .collect(),
            }),
        };

        let line_items = raw_items.map(|raw_items| {
            let items: Vec<LineItem> = raw_items.iter().filter_map(LineItem::from_raw).collect();
            let skipped = raw_items.len() - items.len();
            if skipped > 0 {
                warn!(
                    external_id = %key.external_id,
                    skipped,
                    "line items without item number skipped"
                );
            }
            items
        });

        let write = BidWrite {
            bid: Bid::from_raw(&raw, &key, derived_status),
            line_items,
            attachments,
        };

        match self.repository.write_bid(&write).await {
            Ok(id) => {
                info!(
                    external_id = %key.external_id,
                    bid_id = id,
                    changed,
                    status = %derived_status,
                    line_items = write.line_items.as_ref().map(Vec::len),
                    attachments = write.attachments.as_ref().map(Vec::len),
                    "bid stored"
                );
                Ok(UpsertOutcome::Written(id))
            }
            Err(err) => {
                self.reject(RejectionKind::StoreWrite, format!("{err:#}"), raw_json)
                    .await
            }
        }
    }

    async fn reject(
        &self,
        kind: RejectionKind,
        reason: String,
        payload: &JsonValue,
    ) -> Result<UpsertOutcome> {
        warn!(?kind, reason = %reason, "bid rejected");
        self.rejections
            .append(&RejectedRecord::now(kind, reason, payload.clone()))
            .await?;
        Ok(UpsertOutcome::Rejected(kind))
    }
}
