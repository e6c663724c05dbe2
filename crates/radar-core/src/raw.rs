//! Wire records as served by the PNCP consultation and child APIs.
//!
//! Every field is optional: the source omits fields freely and validation
//! decides what is required.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawBid {
    #[serde(rename = "numeroControlePNCP")]
    pub external_id: Option<String>,
    #[serde(rename = "numeroCompra", deserialize_with = "lenient_string")]
    pub purchase_number: Option<String>,
    #[serde(rename = "anoCompra")]
    pub purchase_year: Option<i32>,
    #[serde(rename = "sequencialCompra")]
    pub purchase_sequence: Option<i64>,
    #[serde(rename = "processo", deserialize_with = "lenient_string")]
    pub process_number: Option<String>,
    #[serde(rename = "modalidadeId")]
    pub category_id: Option<i32>,
    #[serde(rename = "modalidadeNome")]
    pub category_name: Option<String>,
    #[serde(rename = "modoDisputaNome")]
    pub dispute_mode_name: Option<String>,
    #[serde(rename = "situacaoCompraId")]
    pub status_code: Option<i32>,
    #[serde(rename = "situacaoCompraNome")]
    pub status_name: Option<String>,
    #[serde(rename = "objetoCompra")]
    pub description: Option<String>,
    #[serde(rename = "informacaoComplementar")]
    pub complementary_info: Option<String>,
    pub srp: Option<bool>,
    #[serde(rename = "valorTotalEstimado")]
    pub estimated_total: Option<f64>,
    #[serde(rename = "valorTotalHomologado")]
    pub awarded_total: Option<f64>,
    #[serde(rename = "dataAberturaProposta")]
    pub proposal_open_at: Option<String>,
    #[serde(rename = "dataEncerramentoProposta")]
    pub proposal_close_at: Option<String>,
    #[serde(rename = "dataPublicacaoPncp")]
    pub published_at: Option<String>,
    #[serde(rename = "dataInclusao")]
    pub included_at: Option<String>,
    #[serde(rename = "dataAtualizacao")]
    pub last_update_at: Option<String>,
    #[serde(rename = "orgaoEntidade")]
    pub entity: Option<RawEntity>,
    #[serde(rename = "unidadeOrgao")]
    pub unit: Option<RawUnit>,
    #[serde(rename = "linkSistemaOrigem")]
    pub origin_system_url: Option<String>,
}

impl RawBid {
    pub fn proposal_open_at(&self) -> Option<NaiveDateTime> {
        self.proposal_open_at.as_deref().and_then(parse_source_datetime)
    }

    pub fn proposal_close_at(&self) -> Option<NaiveDateTime> {
        self.proposal_close_at.as_deref().and_then(parse_source_datetime)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawEntity {
    #[serde(deserialize_with = "lenient_string")]
    pub cnpj: Option<String>,
    #[serde(rename = "razaoSocial")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawUnit {
    #[serde(rename = "codigoUnidade", deserialize_with = "lenient_string")]
    pub code: Option<String>,
    #[serde(rename = "nomeUnidade")]
    pub name: Option<String>,
    #[serde(rename = "codigoIbge", deserialize_with = "lenient_string")]
    pub ibge_code: Option<String>,
    #[serde(rename = "municipioNome")]
    pub municipality: Option<String>,
    #[serde(rename = "ufSigla")]
    pub uf: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawLineItem {
    #[serde(rename = "numeroItem")]
    pub item_number: Option<i32>,
    #[serde(rename = "descricao")]
    pub description: Option<String>,
    #[serde(rename = "materialOuServicoNome")]
    pub material_or_service: Option<String>,
    #[serde(rename = "quantidade")]
    pub quantity: Option<f64>,
    #[serde(rename = "unidadeMedida")]
    pub unit: Option<String>,
    #[serde(rename = "valorUnitarioEstimado")]
    pub unit_estimated_value: Option<f64>,
    #[serde(rename = "valorTotal")]
    pub total_value: Option<f64>,
    #[serde(rename = "orcamentoSigiloso")]
    pub confidential_budget: Option<bool>,
    #[serde(rename = "itemCategoriaNome")]
    pub category_name: Option<String>,
    #[serde(rename = "criterioJulgamentoNome")]
    pub judgment_criterion: Option<String>,
    #[serde(rename = "situacaoCompraItemNome")]
    pub status_text: Option<String>,
    #[serde(rename = "temResultado")]
    pub has_result: Option<bool>,
    #[serde(rename = "dataInclusao")]
    pub included_at: Option<String>,
    #[serde(rename = "dataAtualizacao")]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawAttachment {
    #[serde(rename = "titulo")]
    pub title: Option<String>,
    #[serde(rename = "sequencialDocumento")]
    pub document_sequence: Option<i64>,
    #[serde(rename = "dataPublicacaoPncp")]
    pub published_at: Option<String>,
    #[serde(rename = "anoCompra")]
    pub purchase_year: Option<i32>,
    #[serde(rename = "statusAtivo")]
    pub active: Option<bool>,
}

/// Accepts the handful of timestamp shapes the source emits, with or without
/// fractional seconds, offsets or a time component.
pub fn parse_source_datetime(input: &str) -> Option<NaiveDateTime> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.naive_local());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(input, fmt) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

pub fn parse_source_date(input: &str) -> Option<NaiveDate> {
    parse_source_datetime(input).map(|dt| dt.date())
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<JsonValue>::deserialize(deserializer)? {
        Some(JsonValue::String(s)) => Some(s),
        Some(JsonValue::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}
