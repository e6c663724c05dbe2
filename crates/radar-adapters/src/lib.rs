//! Source client contract and the PNCP implementation over `HttpFetcher`.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use radar_core::{PurchaseKey, RawAttachment, RawLineItem};
use radar_storage::{FetchError, FetchedResponse, HttpFetcher};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "radar-adapters";

pub const DEFAULT_SOURCE_BASE_URL: &str = "https://pncp.gov.br/api/consulta";
pub const DEFAULT_CHILD_API_BASE_URL: &str = "https://pncp.gov.br/pncp-api";

/// One page of the update-window consultation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageQuery {
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub category: i32,
    pub page: u32,
}

/// Records stay as raw JSON so a single malformed entry cannot fail the page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourcePage {
    pub records: Vec<JsonValue>,
    pub pages_remaining: u32,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding {what} from {url}: {source}")]
    Decode {
        what: &'static str,
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

#[async_trait]
pub trait BidSource: Send + Sync {
    async fn fetch_page(&self, query: &PageQuery) -> Result<SourcePage, SourceError>;

    /// Child pages come back as raw elements; the page length, not the number
    /// that decode, drives pagination.
    async fn fetch_line_items_page(
        &self,
        key: &PurchaseKey,
        page: u32,
    ) -> Result<Vec<JsonValue>, SourceError>;

    async fn fetch_attachments_page(
        &self,
        key: &PurchaseKey,
        page: u32,
    ) -> Result<Vec<JsonValue>, SourceError>;

    /// Page size used for child resources; a shorter page ends collection.
    fn child_page_size(&self) -> usize;

    fn child_page_pause(&self) -> Duration {
        Duration::ZERO
    }

    fn attachment_download_url(&self, key: &PurchaseKey, document_sequence: i64) -> String;
}

pub async fn collect_line_items(
    source: &dyn BidSource,
    key: &PurchaseKey,
) -> Result<Vec<RawLineItem>, SourceError> {
    let raw = collect_pages(source.child_page_size(), source.child_page_pause(), |page| {
        source.fetch_line_items_page(key, page)
    })
    .await?;
    Ok(decode_elements("line item", key, raw))
}

pub async fn collect_attachments(
    source: &dyn BidSource,
    key: &PurchaseKey,
) -> Result<Vec<RawAttachment>, SourceError> {
    let raw = collect_pages(source.child_page_size(), source.child_page_pause(), |page| {
        source.fetch_attachments_page(key, page)
    })
    .await?;
    Ok(decode_elements("attachment", key, raw))
}

fn decode_elements<T: DeserializeOwned>(
    what: &'static str,
    key: &PurchaseKey,
    raw: Vec<JsonValue>,
) -> Vec<T> {
    raw.into_iter()
        .filter_map(|value| match serde_json::from_value(value) {
            Ok(decoded) => Some(decoded),
            Err(err) => {
                warn!(
                    what,
                    cnpj = %key.cnpj,
                    year = key.year,
                    sequence = key.sequence,
                    error = %err,
                    "skipping undecodable child element"
                );
                None
            }
        })
        .collect()
}

async fn collect_pages<T, F, Fut>(
    page_size: usize,
    pause: Duration,
    mut fetch: F,
) -> Result<Vec<T>, SourceError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Vec<T>, SourceError>>,
{
    let mut all = Vec::new();
    let mut page = 1;
    loop {
        let batch = fetch(page).await?;
        let len = batch.len();
        all.extend(batch);
        if len == 0 || len < page_size {
            break;
        }
        page += 1;
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
    }
    Ok(all)
}

#[derive(Debug, Clone)]
pub struct PncpClientConfig {
    pub source_base_url: String,
    pub child_api_base_url: String,
    pub page_size: usize,
    pub child_page_pause: Duration,
}

impl Default for PncpClientConfig {
    fn default() -> Self {
        Self {
            source_base_url: DEFAULT_SOURCE_BASE_URL.to_string(),
            child_api_base_url: DEFAULT_CHILD_API_BASE_URL.to_string(),
            page_size: 50,
            child_page_pause: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConsultationEnvelope {
    #[serde(default)]
    data: Option<Vec<JsonValue>>,
    #[serde(rename = "paginasRestantes", default)]
    pages_remaining: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct PncpClient {
    http: HttpFetcher,
    config: PncpClientConfig,
}

impl PncpClient {
    pub fn new(http: HttpFetcher, config: PncpClientConfig) -> Self {
        Self { http, config }
    }

    fn purchase_url(&self, key: &PurchaseKey, resource: &str) -> String {
        format!(
            "{}/v1/orgaos/{}/compras/{}/{}/{resource}",
            self.config.child_api_base_url.trim_end_matches('/'),
            key.cnpj,
            key.year,
            key.sequence
        )
    }

    async fn fetch_child_page(
        &self,
        what: &'static str,
        url: String,
        page: u32,
    ) -> Result<Vec<JsonValue>, SourceError> {
        let query = [
            ("pagina", page.to_string()),
            ("tamanhoPagina", self.config.page_size.to_string()),
        ];
        let resp = self.http.get(what, &url, &query).await?;
        decode_or_empty(what, &resp, Vec::new)
    }
}

fn decode_or_empty<T: DeserializeOwned>(
    what: &'static str,
    resp: &FetchedResponse,
    empty: impl FnOnce() -> T,
) -> Result<T, SourceError> {
    if resp.is_empty() {
        return Ok(empty());
    }
    serde_json::from_slice(&resp.body).map_err(|source| SourceError::Decode {
        what,
        url: resp.final_url.clone(),
        source,
    })
}

#[async_trait]
impl BidSource for PncpClient {
    async fn fetch_page(&self, query: &PageQuery) -> Result<SourcePage, SourceError> {
        let url = format!(
            "{}/v1/contratacoes/atualizacao",
            self.config.source_base_url.trim_end_matches('/')
        );
        let params = [
            ("dataInicial", query.window_start.format("%Y%m%d").to_string()),
            ("dataFinal", query.window_end.format("%Y%m%d").to_string()),
            ("pagina", query.page.to_string()),
            ("tamanhoPagina", self.config.page_size.to_string()),
            ("codigoModalidadeContratacao", query.category.to_string()),
        ];
        let resp = self.http.get("bids", &url, &params).await?;
        let envelope = decode_or_empty("bid page", &resp, || ConsultationEnvelope {
            data: None,
            pages_remaining: None,
        })?;

        let page = SourcePage {
            records: envelope.data.unwrap_or_default(),
            pages_remaining: envelope.pages_remaining.unwrap_or(0),
        };
        debug!(
            category = query.category,
            page = query.page,
            records = page.records.len(),
            pages_remaining = page.pages_remaining,
            "bid page fetched"
        );
        Ok(page)
    }

    async fn fetch_line_items_page(
        &self,
        key: &PurchaseKey,
        page: u32,
    ) -> Result<Vec<JsonValue>, SourceError> {
        self.fetch_child_page("line items", self.purchase_url(key, "itens"), page)
            .await
    }

    async fn fetch_attachments_page(
        &self,
        key: &PurchaseKey,
        page: u32,
    ) -> Result<Vec<JsonValue>, SourceError> {
        self.fetch_child_page("attachments", self.purchase_url(key, "arquivos"), page)
            .await
    }

    fn child_page_size(&self) -> usize {
        self.config.page_size
    }

    fn child_page_pause(&self) -> Duration {
        self.config.child_page_pause
    }

    fn attachment_download_url(&self, key: &PurchaseKey, document_sequence: i64) -> String {
        format!("{}/{document_sequence}", self.purchase_url(key, "arquivos"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use radar_storage::{BackoffPolicy, HttpClientConfig};
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer, page_size: usize) -> PncpClient {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: None,
            backoff: BackoffPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        })
        .expect("fetcher");
        PncpClient::new(
            http,
            PncpClientConfig {
                source_base_url: server.uri(),
                child_api_base_url: format!("{}/pncp-api", server.uri()),
                page_size,
                child_page_pause: Duration::ZERO,
            },
        )
    }

    fn key() -> PurchaseKey {
        PurchaseKey {
            cnpj: "12345678000190".into(),
            year: 2025,
            sequence: 42,
        }
    }

    fn window(page: u32) -> PageQuery {
        PageQuery {
            window_start: NaiveDate::from_ymd_opt(2024, 6, 1).expect("date"),
            window_end: NaiveDate::from_ymd_opt(2025, 6, 1).expect("date"),
            category: 6,
            page,
        }
    }

    #[tokio::test]
    async fn fetch_page_sends_window_and_reads_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/contratacoes/atualizacao"))
            .and(query_param("dataInicial", "20240601"))
            .and(query_param("dataFinal", "20250601"))
            .and(query_param("pagina", "2"))
            .and(query_param("tamanhoPagina", "50"))
            .and(query_param("codigoModalidadeContratacao", "6"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"numeroControlePNCP": "a"}, {"unexpected": true}],
                "paginasRestantes": 3
            })))
            .expect(1)
            .mount(&server)
            .await;

        let page = client_for(&server, 50)
            .fetch_page(&window(2))
            .await
            .expect("page");
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.pages_remaining, 3);
    }

    #[tokio::test]
    async fn no_content_is_an_empty_final_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let page = client_for(&server, 50)
            .fetch_page(&window(1))
            .await
            .expect("page");
        assert_eq!(page, SourcePage::default());
    }

    #[tokio::test]
    async fn line_items_are_collected_until_a_short_page() {
        let server = MockServer::start().await;
        let items_path = "/pncp-api/v1/orgaos/12345678000190/compras/2025/42/itens";
        Mock::given(method("GET"))
            .and(path(items_path))
            .and(query_param("pagina", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"numeroItem": 1, "situacaoCompraItemNome": "Em andamento"},
                {"numeroItem": 2}
            ])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(items_path))
            .and(query_param("pagina", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"numeroItem": 3}])))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, 2);
        let items = collect_line_items(&client, &key()).await.expect("items");
        let numbers: Vec<_> = items.iter().map(|i| i.item_number).collect();
        assert_eq!(numbers, vec![Some(1), Some(2), Some(3)]);
    }

    #[tokio::test]
    async fn malformed_line_item_is_skipped_without_cutting_pagination() {
        let server = MockServer::start().await;
        let items_path = "/pncp-api/v1/orgaos/12345678000190/compras/2025/42/itens";
        Mock::given(method("GET"))
            .and(path(items_path))
            .and(query_param("pagina", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"numeroItem": 1},
                {"numeroItem": "dois", "quantidade": "muitos"}
            ])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(items_path))
            .and(query_param("pagina", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"numeroItem": 3}])))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, 2);
        let items = collect_line_items(&client, &key()).await.expect("items");
        let numbers: Vec<_> = items.iter().map(|i| i.item_number).collect();
        assert_eq!(numbers, vec![Some(1), Some(3)]);
    }

    #[tokio::test]
    async fn attachment_failure_surfaces_as_fetch_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let client = client_for(&server, 50);
        let err = collect_attachments(&client, &key())
            .await
            .expect_err("server error");
        assert!(matches!(
            err,
            SourceError::Fetch(FetchError::HttpStatus { status: 500, .. })
        ));
    }

    #[tokio::test]
    async fn download_url_addresses_the_document() {
        let server = MockServer::start().await;
        let client = client_for(&server, 50);
        assert_eq!(
            client.attachment_download_url(&key(), 7),
            format!(
                "{}/pncp-api/v1/orgaos/12345678000190/compras/2025/42/arquivos/7",
                server.uri()
            )
        );
    }

    #[tokio::test]
    async fn collector_stops_on_an_empty_first_page() {
        let mut calls = 0;
        let items: Vec<u8> = collect_pages(10, Duration::ZERO, |_| {
            calls += 1;
            async { Ok(Vec::new()) }
        })
        .await
        .expect("collect");
        assert!(items.is_empty());
        assert_eq!(calls, 1);
    }
}
