//! Notification matching worker: claims pending bids through the lease,
//! matches them against alert profiles and dispatches push and email.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;

pub mod auth;
pub mod buffer;
pub mod config;
pub mod dispatch;
pub mod email;
pub mod engine;
pub mod profile;
pub mod store;

#[cfg(test)]
mod testing;

pub use auth::{AccessTokenSource, AuthError, ServiceAccountKey, ServiceAccountTokenSource};
pub use buffer::{PushBuffer, PushMessage};
pub use config::{FcmConfig, MailgunConfig, NotifyConfig};
pub use dispatch::{
    push_message, BatchOutcome, DispatchError, EmailGateway, FcmPushGateway, MailgunEmailGateway,
    PushGateway,
};
pub use email::{alert_email, format_brl, EmailMessage};
pub use engine::{CycleReport, CycleSettings, NotificationEngine};
pub use profile::{compile_profiles, AlertProfile, CompiledProfile, Subscriber};
pub use store::{AlertProfileStore, ClaimedBid, LeaseStore, PgNotificationStore};

pub const CRATE_NAME: &str = "radar-notify";

impl From<&NotifyConfig> for CycleSettings {
    fn from(config: &NotifyConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            zombie_timeout: config.zombie_timeout,
            push_batch_size: config.push_batch_size,
            detail_url_base: config.detail_url_base.clone(),
            interval: config.interval,
            error_backoff: config.error_backoff,
        }
    }
}

/// Wires the Postgres stores and whichever gateways have credentials.
pub fn build_engine(config: &NotifyConfig, pool: PgPool) -> Result<NotificationEngine> {
    let store = Arc::new(PgNotificationStore::new(pool));
    let push: Option<Arc<dyn PushGateway>> = match &config.fcm {
        Some(fcm) => {
            let key = ServiceAccountKey::from_file(&fcm.credentials_path)?;
            let project_id = fcm
                .project_id
                .clone()
                .or_else(|| key.project_id.clone())
                .context("FCM project id missing from both FCM_PROJECT_ID and the key file")?;
            let tokens = ServiceAccountTokenSource::new(key, config.dispatch_timeout)?;
            Some(Arc::new(FcmPushGateway::new(
                fcm.base_url.clone(),
                project_id,
                Arc::new(tokens),
                config.dispatch_timeout,
            )?))
        }
        None => None,
    };
    let email: Option<Arc<dyn EmailGateway>> = match &config.mailgun {
        Some(mailgun) => Some(Arc::new(MailgunEmailGateway::new(
            mailgun.clone(),
            config.dispatch_timeout,
        )?)),
        None => None,
    };
    Ok(NotificationEngine::new(
        store.clone(),
        store,
        push,
        email,
        CycleSettings::from(config),
    ))
}
