//! Outbound gateways. Failures are reported to the caller and never retried.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::auth::{AccessTokenSource, AuthError};
use crate::buffer::PushMessage;
use crate::config::MailgunConfig;
use crate::email::{truncate_chars, EmailMessage};
use crate::store::ClaimedBid;

const PUSH_BODY_CHARS: usize = 100;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {provider} failed: {source}")]
    Request {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{provider} rejected the request with status {status}: {body}")]
    Rejected {
        provider: &'static str,
        status: u16,
        body: String,
    },
    #[error("rendering email: {0}")]
    Render(#[from] askama::Error),
    #[error("fcm credentials: {0}")]
    Auth(#[from] AuthError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub sent: usize,
    pub failed: usize,
}

#[async_trait]
pub trait PushGateway: Send + Sync {
    /// Sends one batch. Per-message failures are counted in the outcome; an
    /// `Err` means the whole batch failed.
    async fn send_batch(&self, batch: &[PushMessage]) -> Result<BatchOutcome, DispatchError>;
}

#[async_trait]
pub trait EmailGateway: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<(), DispatchError>;
}

pub fn push_message(bid: &ClaimedBid, profile_id: i64, token: &str) -> PushMessage {
    let municipality = bid.municipality.as_deref().unwrap_or_default();
    let description = bid.description.as_deref().unwrap_or_default();
    let body = if description.chars().count() > PUSH_BODY_CHARS {
        format!("{}...", truncate_chars(description, PUSH_BODY_CHARS))
    } else {
        description.to_string()
    };

    let mut data = BTreeMap::new();
    data.insert("click_action".into(), "FLUTTER_NOTIFICATION_CLICK".into());
    data.insert("pncp".into(), bid.external_id.clone());
    data.insert("licitacao_id".into(), bid.external_id.clone());
    data.insert("alerta_id".into(), profile_id.to_string());
    data.insert("tipo".into(), "oportunidade".into());

    PushMessage {
        token: token.to_string(),
        title: format!("Nova licitação em {municipality}"),
        body,
        data,
    }
}

fn http_client(timeout: Duration) -> Result<Client, DispatchError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(DispatchError::Client)
}

/// FCM HTTP v1. Access tokens come from `tokens`, which refreshes them.
#[derive(Clone)]
pub struct FcmPushGateway {
    client: Client,
    base_url: String,
    project_id: String,
    tokens: Arc<dyn AccessTokenSource>,
}

impl FcmPushGateway {
    pub fn new(
        base_url: String,
        project_id: String,
        tokens: Arc<dyn AccessTokenSource>,
        timeout: Duration,
    ) -> Result<Self, DispatchError> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url,
            project_id,
            tokens,
        })
    }

    fn send_url(&self) -> String {
        format!(
            "{}/v1/projects/{}/messages:send",
            self.base_url.trim_end_matches('/'),
            self.project_id
        )
    }

    async fn send_one(&self, message: &PushMessage, token: &str) -> Result<(), DispatchError> {
        let payload = json!({
            "message": {
                "token": message.token,
                "notification": { "title": message.title, "body": message.body },
                "data": message.data,
                "android": { "priority": "high" },
                "apns": { "payload": { "aps": { "content-available": 1, "sound": "default" } } }
            }
        });
        let response = self
            .client
            .post(self.send_url())
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await
            .map_err(|source| DispatchError::Request {
                provider: "fcm",
                source,
            })?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(DispatchError::Rejected {
            provider: "fcm",
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        })
    }
}

#[async_trait]
impl PushGateway for FcmPushGateway {
    async fn send_batch(&self, batch: &[PushMessage]) -> Result<BatchOutcome, DispatchError> {
        let token = self.tokens.access_token().await?;
        let mut outcome = BatchOutcome::default();
        for message in batch {
            match self.send_one(message, &token).await {
                Ok(()) => outcome.sent += 1,
                // Credentials are shared by the batch; the rest would fail too.
                Err(DispatchError::Rejected { status, .. })
                    if status == StatusCode::UNAUTHORIZED.as_u16()
                        || status == StatusCode::FORBIDDEN.as_u16() =>
                {
                    warn!(status, "fcm rejected the access token; it will be re-minted");
                    self.tokens.invalidate().await;
                    return Err(DispatchError::Rejected {
                        provider: "fcm",
                        status,
                        body: "credentials rejected".into(),
                    });
                }
                Err(err) => {
                    error!(error = %err, "push message failed");
                    outcome.failed += 1;
                }
            }
        }
        debug!(sent = outcome.sent, failed = outcome.failed, "push batch sent");
        Ok(outcome)
    }
}

#[derive(Debug, Clone)]
pub struct MailgunEmailGateway {
    client: Client,
    config: MailgunConfig,
}

impl MailgunEmailGateway {
    pub fn new(config: MailgunConfig, timeout: Duration) -> Result<Self, DispatchError> {
        Ok(Self {
            client: http_client(timeout)?,
            config,
        })
    }
}

#[async_trait]
impl EmailGateway for MailgunEmailGateway {
    async fn send(&self, message: &EmailMessage) -> Result<(), DispatchError> {
        let url = format!(
            "{}/v3/{}/messages",
            self.config.base_url.trim_end_matches('/'),
            self.config.domain
        );
        let form = [
            ("from", self.config.sender.as_str()),
            ("to", message.to.as_str()),
            ("subject", message.subject.as_str()),
            ("html", message.html.as_str()),
        ];
        let response = self
            .client
            .post(url)
            .basic_auth("api", Some(&self.config.api_key))
            .form(&form)
            .send()
            .await
            .map_err(|source| DispatchError::Request {
                provider: "mailgun",
                source,
            })?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(DispatchError::Rejected {
            provider: "mailgun",
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        })
    }
}
