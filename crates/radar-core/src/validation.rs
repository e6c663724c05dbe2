use thiserror::Error;

use crate::raw::{parse_source_datetime, RawBid};
use crate::{BidKey, PurchaseKey};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),
    #[error("unparseable dataAtualizacao `{0}`")]
    InvalidLastUpdate(String),
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Checks that a raw record carries everything the upsert path depends on and
/// returns its idempotency and child-resource keys.
pub fn validate(raw: &RawBid) -> Result<BidKey, ValidationError> {
    let external_id = non_empty(raw.external_id.as_deref());
    let last_update = non_empty(raw.last_update_at.as_deref());
    let cnpj = non_empty(raw.entity.as_ref().and_then(|e| e.cnpj.as_deref()));

    let mut missing = Vec::new();
    if external_id.is_none() {
        missing.push("numeroControlePNCP");
    }
    if last_update.is_none() {
        missing.push("dataAtualizacao");
    }
    if cnpj.is_none() {
        missing.push("orgaoEntidade.cnpj");
    }
    if raw.purchase_year.is_none() {
        missing.push("anoCompra");
    }
    if raw.purchase_sequence.is_none() {
        missing.push("sequencialCompra");
    }

    match (external_id, last_update, cnpj, raw.purchase_year, raw.purchase_sequence) {
        (Some(external_id), Some(last_update), Some(cnpj), Some(year), Some(sequence)) => {
            let last_update = parse_source_datetime(last_update)
                .ok_or_else(|| ValidationError::InvalidLastUpdate(last_update.to_string()))?;
            Ok(BidKey {
                external_id: external_id.to_string(),
                last_update,
                purchase: PurchaseKey {
                    cnpj: cnpj.to_string(),
                    year,
                    sequence,
                },
            })
        }
        _ => Err(ValidationError::MissingFields(missing)),
    }
}

pub fn is_valid(raw: &RawBid) -> bool {
    validate(raw).is_ok()
}
