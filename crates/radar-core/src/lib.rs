//! Core domain model for Radar: canonical bids, their child collections and the
//! notification lease carried on every bid row.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

pub mod raw;
pub mod status;
pub mod validation;

pub use raw::{RawAttachment, RawBid, RawEntity, RawLineItem, RawUnit};
pub use status::{derive_status, derive_status_now, CanonicalStatus, StatusInputs, UnknownStatus};
pub use validation::{is_valid, validate, ValidationError};

pub const CRATE_NAME: &str = "radar-core";

/// Local surrogate key of a persisted bid.
pub type BidId = i64;

const PORTAL_BASE_URL: &str = "https://pncp.gov.br/app/editais";

/// Coordinates that address a purchase's child resources at the source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PurchaseKey {
    pub cnpj: String,
    pub year: i32,
    pub sequence: i64,
}

impl PurchaseKey {
    pub fn portal_url(&self) -> String {
        format!("{PORTAL_BASE_URL}/{}/{}/{}", self.cnpj, self.year, self.sequence)
    }
}

/// Output of a successful validation: everything needed to upsert idempotently
/// and to reach the record's child endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidKey {
    pub external_id: String,
    pub last_update: NaiveDateTime,
    pub purchase: PurchaseKey,
}

/// Canonical bid as written to the store. Lease columns belong to the
/// notification pipeline and are never written through this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    pub external_id: String,
    pub purchase: PurchaseKey,
    pub purchase_number: Option<String>,
    pub process_number: Option<String>,
    pub category_id: Option<i32>,
    pub category_name: Option<String>,
    pub dispute_mode_name: Option<String>,
    pub raw_status_code: Option<i32>,
    pub raw_status_name: Option<String>,
    pub derived_status: CanonicalStatus,
    pub description: Option<String>,
    pub complementary_info: Option<String>,
    pub srp: Option<bool>,
    pub estimated_total: Option<f64>,
    pub awarded_total: Option<f64>,
    pub proposal_open_at: Option<NaiveDateTime>,
    pub proposal_close_at: Option<NaiveDateTime>,
    pub published_on: Option<NaiveDate>,
    pub included_on: Option<NaiveDate>,
    pub last_update_at: NaiveDateTime,
    pub entity_name: Option<String>,
    pub unit_code: Option<String>,
    pub unit_name: Option<String>,
    pub ibge_code: Option<String>,
    pub municipality: Option<String>,
    pub uf: Option<String>,
    pub origin_system_url: Option<String>,
    pub portal_url: String,
}

impl Bid {
    pub fn from_raw(raw: &RawBid, key: &BidKey, derived_status: CanonicalStatus) -> Self {
        let entity = raw.entity.as_ref();
        let unit = raw.unit.as_ref();
        Self {
            external_id: key.external_id.clone(),
            purchase: key.purchase.clone(),
            purchase_number: raw.purchase_number.clone(),
            process_number: raw.process_number.clone(),
            category_id: raw.category_id,
            category_name: raw.category_name.clone(),
            dispute_mode_name: raw.dispute_mode_name.clone(),
            raw_status_code: raw.status_code,
            raw_status_name: raw.status_name.clone(),
            derived_status,
            description: raw.description.clone(),
            complementary_info: raw.complementary_info.clone(),
            srp: raw.srp,
            estimated_total: raw.estimated_total,
            awarded_total: raw.awarded_total,
            proposal_open_at: raw.proposal_open_at(),
            proposal_close_at: raw.proposal_close_at(),
            published_on: raw.published_at.as_deref().and_then(raw::parse_source_date),
            included_on: raw.included_at.as_deref().and_then(raw::parse_source_date),
            last_update_at: key.last_update,
            entity_name: entity.and_then(|e| e.name.clone()),
            unit_code: unit.and_then(|u| u.code.clone()),
            unit_name: unit.and_then(|u| u.name.clone()),
            ibge_code: unit.and_then(|u| u.ibge_code.clone()),
            municipality: unit.and_then(|u| u.municipality.clone()),
            uf: unit.and_then(|u| u.uf.clone()),
            origin_system_url: raw.origin_system_url.clone(),
            portal_url: key.purchase.portal_url(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub item_number: i32,
    pub description: Option<String>,
    pub material_or_service: Option<String>,
    pub quantity: Option<f64>,
    pub unit: Option<String>,
    pub unit_estimated_value: Option<f64>,
    pub total_value: Option<f64>,
    pub confidential_budget: bool,
    pub category_name: Option<String>,
    pub judgment_criterion: Option<String>,
    pub status_text: Option<String>,
    pub has_result: bool,
    pub included_on: Option<NaiveDate>,
    pub updated_on: Option<NaiveDate>,
}

impl LineItem {
    /// Items without a number cannot be persisted; they still count for status.
    pub fn from_raw(raw: &RawLineItem) -> Option<Self> {
        Some(Self {
            item_number: raw.item_number?,
            description: raw.description.clone(),
            material_or_service: raw.material_or_service.clone(),
            quantity: raw.quantity,
            unit: raw.unit.clone(),
            unit_estimated_value: raw.unit_estimated_value,
            total_value: raw.total_value,
            confidential_budget: raw.confidential_budget.unwrap_or(false),
            category_name: raw.category_name.clone(),
            judgment_criterion: raw.judgment_criterion.clone(),
            status_text: raw.status_text.clone(),
            has_result: raw.has_result.unwrap_or(false),
            included_on: raw.included_at.as_deref().and_then(raw::parse_source_date),
            updated_on: raw.updated_at.as_deref().and_then(raw::parse_source_date),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub title: String,
    pub download_url: String,
    pub document_sequence: i64,
    pub published_on: Option<NaiveDate>,
    pub purchase_year: Option<i32>,
    pub active: bool,
}

impl Attachment {
    pub fn from_raw(raw: &RawAttachment, download_url: impl FnOnce(i64) -> String) -> Option<Self> {
        let title = raw.title.as_deref().map(str::trim).filter(|t| !t.is_empty())?;
        let document_sequence = raw.document_sequence?;
        Some(Self {
            title: title.to_string(),
            download_url: download_url(document_sequence),
            document_sequence,
            published_on: raw.published_at.as_deref().and_then(raw::parse_source_date),
            purchase_year: raw.purchase_year,
            active: raw.active.unwrap_or(false),
        })
    }
}

/// Tri-state lease used to hand each bid to the notification pipeline once.
///
/// The integer codes are persisted and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationLease {
    Pending,
    Done,
    Claimed,
}

impl NotificationLease {
    pub const fn code(self) -> i16 {
        match self {
            NotificationLease::Pending => 0,
            NotificationLease::Done => 1,
            NotificationLease::Claimed => 2,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(NotificationLease::Pending),
            1 => Some(NotificationLease::Done),
            2 => Some(NotificationLease::Claimed),
            _ => None,
        }
    }
}
