//! In-memory doubles for the source and the canonical store.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use radar_adapters::{BidSource, PageQuery, SourceError, SourcePage};
use radar_core::{
    Attachment, Bid, BidId, CanonicalStatus, LineItem, PurchaseKey, RawAttachment, RawLineItem,
};
use radar_storage::FetchError;
use serde_json::{json, Value as JsonValue};
use tokio::sync::RwLock;

use crate::repository::{BidRepository, BidWrite, StoredBidState};

pub fn server_error(url: &str) -> SourceError {
    SourceError::Fetch(FetchError::HttpStatus {
        status: 500,
        url: url.to_string(),
    })
}

pub fn purchase(sequence: i64) -> PurchaseKey {
    PurchaseKey {
        cnpj: "12345678000190".into(),
        year: 2025,
        sequence,
    }
}

/// A consultation record that passes validation.
pub fn bid_json(sequence: i64, last_update: &str) -> JsonValue {
    json!({
        "numeroControlePNCP": format!("12345678000190-1-{sequence:06}/2025"),
        "anoCompra": 2025,
        "sequencialCompra": sequence,
        "situacaoCompraId": 1,
        "objetoCompra": format!("Aquisição de trator lote {sequence}"),
        "dataAberturaProposta": "2025-01-10T08:00:00",
        "dataEncerramentoProposta": "2099-01-10T18:00:00",
        "dataAtualizacao": last_update,
        "orgaoEntidade": { "cnpj": "12345678000190", "razaoSocial": "Prefeitura de Teste" },
        "unidadeOrgao": { "municipioNome": "Curitiba", "ufSigla": "PR", "codigoIbge": "4106902" }
    })
}

pub fn external_id(sequence: i64) -> String {
    format!("12345678000190-1-{sequence:06}/2025")
}

pub fn line_item(number: i32, status: &str) -> RawLineItem {
    RawLineItem {
        item_number: Some(number),
        description: Some(format!("item {number}")),
        status_text: Some(status.to_string()),
        ..Default::default()
    }
}

pub fn attachment(sequence: i64) -> RawAttachment {
    RawAttachment {
        title: Some(format!("Documento {sequence}")),
        document_sequence: Some(sequence),
        active: Some(true),
        ..Default::default()
    }
}

#[derive(Default)]
pub struct ScriptedSource {
    pages: Mutex<HashMap<(i32, u32), Option<SourcePage>>>,
    line_items: Mutex<HashMap<i64, Option<Vec<RawLineItem>>>>,
    attachments: Mutex<HashMap<i64, Option<Vec<RawAttachment>>>>,
    page_calls: Mutex<Vec<(i32, u32)>>,
    line_item_calls: AtomicUsize,
    attachment_calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn page(self, category: i32, page: u32, records: Vec<JsonValue>, remaining: u32) -> Self {
        self.pages.lock().expect("pages").insert(
            (category, page),
            Some(SourcePage {
                records,
                pages_remaining: remaining,
            }),
        );
        self
    }

    pub fn failing_page(self, category: i32, page: u32) -> Self {
        self.pages.lock().expect("pages").insert((category, page), None);
        self
    }

    pub fn items(self, sequence: i64, items: Vec<RawLineItem>) -> Self {
        self.set_items(sequence, Some(items));
        self
    }

    pub fn failing_items(self, sequence: i64) -> Self {
        self.set_items(sequence, None);
        self
    }

    pub fn set_items(&self, sequence: i64, items: Option<Vec<RawLineItem>>) {
        self.line_items.lock().expect("items").insert(sequence, items);
    }

    pub fn attachments(self, sequence: i64, attachments: Vec<RawAttachment>) -> Self {
        self.attachments
            .lock()
            .expect("attachments")
            .insert(sequence, Some(attachments));
        self
    }

    pub fn failing_attachments(self, sequence: i64) -> Self {
        self.set_attachments(sequence, None);
        self
    }

    pub fn set_attachments(&self, sequence: i64, attachments: Option<Vec<RawAttachment>>) {
        self.attachments
            .lock()
            .expect("attachments")
            .insert(sequence, attachments);
    }

    pub fn heal_page(&self, category: i32, page: u32, records: Vec<JsonValue>) {
        self.pages.lock().expect("pages").insert(
            (category, page),
            Some(SourcePage {
                records,
                pages_remaining: 0,
            }),
        );
    }

    pub fn page_calls(&self) -> Vec<(i32, u32)> {
        self.page_calls.lock().expect("calls").clone()
    }

    pub fn child_calls(&self) -> (usize, usize) {
        (
            self.line_item_calls.load(Ordering::SeqCst),
            self.attachment_calls.load(Ordering::SeqCst),
        )
    }
}

#[async_trait]
impl BidSource for ScriptedSource {
    async fn fetch_page(&self, query: &PageQuery) -> Result<SourcePage, SourceError> {
        self.page_calls
            .lock()
            .expect("calls")
            .push((query.category, query.page));
        match self.pages.lock().expect("pages").get(&(query.category, query.page)) {
            Some(Some(page)) => Ok(page.clone()),
            Some(None) => Err(server_error("scripted://page")),
            None => Ok(SourcePage::default()),
        }
    }

    async fn fetch_line_items_page(
        &self,
        key: &PurchaseKey,
        page: u32,
    ) -> Result<Vec<JsonValue>, SourceError> {
        self.line_item_calls.fetch_add(1, Ordering::SeqCst);
        match self.line_items.lock().expect("items").get(&key.sequence) {
            Some(Some(items)) if page == 1 => Ok(as_json(items)),
            Some(None) => Err(server_error("scripted://itens")),
            _ => Ok(Vec::new()),
        }
    }

    async fn fetch_attachments_page(
        &self,
        key: &PurchaseKey,
        page: u32,
    ) -> Result<Vec<JsonValue>, SourceError> {
        self.attachment_calls.fetch_add(1, Ordering::SeqCst);
        match self.attachments.lock().expect("attachments").get(&key.sequence) {
            Some(Some(attachments)) if page == 1 => Ok(as_json(attachments)),
            Some(None) => Err(server_error("scripted://arquivos")),
            _ => Ok(Vec::new()),
        }
    }

    fn child_page_size(&self) -> usize {
        100
    }

    fn attachment_download_url(&self, key: &PurchaseKey, document_sequence: i64) -> String {
        format!(
            "scripted://{}/{}/{}/arquivos/{document_sequence}",
            key.cnpj, key.year, key.sequence
        )
    }
}

fn as_json<T: serde::Serialize>(elements: &[T]) -> Vec<JsonValue> {
    elements
        .iter()
        .map(|e| serde_json::to_value(e).expect("child json"))
        .collect()
}

#[derive(Debug, Clone)]
pub struct StoredBid {
    pub id: BidId,
    pub bid: Bid,
    pub line_items: Vec<LineItem>,
    pub attachments: Vec<Attachment>,
    pub line_items_synced: bool,
    pub attachments_synced: bool,
}

#[derive(Default)]
struct MemoryState {
    next_id: BidId,
    rows: BTreeMap<String, StoredBid>,
    writes: usize,
}

/// Mirrors the Postgres semantics closely enough for orchestration tests,
/// including first-wins handling of duplicate attachment URLs.
#[derive(Default)]
pub struct MemoryBidRepository {
    state: RwLock<MemoryState>,
    failing_writes: RwLock<HashSet<String>>,
}

impl MemoryBidRepository {
    pub async fn fail_writes_for(&self, external_id: &str) {
        self.failing_writes
            .write()
            .await
            .insert(external_id.to_string());
    }

    pub async fn get(&self, external_id: &str) -> Option<StoredBid> {
        self.state.read().await.rows.get(external_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.rows.len()
    }

    pub async fn write_count(&self) -> usize {
        self.state.read().await.writes
    }
}

#[async_trait]
impl BidRepository for MemoryBidRepository {
    async fn find_bid_state(&self, external_id: &str) -> Result<Option<StoredBidState>> {
        Ok(self
            .state
            .read()
            .await
            .rows
            .get(external_id)
            .map(|row| StoredBidState {
                id: row.id,
                last_update: Some(row.bid.last_update_at),
                line_item_count: row.line_items.len() as i64,
                attachment_count: row.attachments.len() as i64,
                line_items_synced: row.line_items_synced,
                attachments_synced: row.attachments_synced,
                derived_status: Some(row.bid.derived_status),
            }))
    }

    async fn write_bid(&self, write: &BidWrite) -> Result<BidId> {
        if self
            .failing_writes
            .read()
            .await
            .contains(&write.bid.external_id)
        {
            bail!("simulated store failure for {}", write.bid.external_id);
        }

        let mut state = self.state.write().await;
        state.writes += 1;
        let next_id = state.next_id + 1;
        let row = state
            .rows
            .entry(write.bid.external_id.clone())
            .or_insert_with(|| StoredBid {
                id: next_id,
                bid: write.bid.clone(),
                line_items: Vec::new(),
                attachments: Vec::new(),
                line_items_synced: false,
                attachments_synced: false,
            });
        row.bid = write.bid.clone();
        if let Some(items) = &write.line_items {
            row.line_items = items.clone();
            row.line_items_synced = true;
        }
        if let Some(attachments) = &write.attachments {
            row.attachments_synced = true;
            let mut seen = HashSet::new();
            row.attachments = attachments
                .iter()
                .filter(|a| seen.insert(a.download_url.clone()))
                .cloned()
                .collect();
        }
        let id = row.id;
        if id == next_id {
            state.next_id = next_id;
        }
        Ok(id)
    }

    async fn promote_expired_receiving(&self, now: NaiveDateTime) -> Result<u64> {
        let mut state = self.state.write().await;
        let mut promoted = 0;
        for row in state.rows.values_mut() {
            let expired = row.bid.proposal_close_at.is_some_and(|close| close < now);
            if row.bid.derived_status == CanonicalStatus::ReceivingProposals && expired {
                row.bid.derived_status = CanonicalStatus::UnderJudgment;
                promoted += 1;
            }
        }
        Ok(promoted)
    }
}
