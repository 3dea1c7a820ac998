//! Delivery to one channel kind each.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use super::Alert;
use crate::config::MailConfig;
use crate::db::{ChannelConfig, ChannelKind};

mod chat;
mod email;
mod pagerduty;
mod telegram;

pub use chat::ChatWebhookSender;
pub use email::EmailSender;
pub use pagerduty::PagerDutySender;
pub use telegram::TelegramSender;

#[derive(Error, Debug)]
pub enum SenderError {
    #[error("failed to send notification: {0}")]
    SendFailed(String),
    #[error("invalid channel configuration: {0}")]
    InvalidConfiguration(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl SenderError {
    /// Configuration problems do not improve with another attempt.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::InvalidConfiguration(_))
    }

    fn wrong_config(expected: ChannelKind, found: &ChannelConfig) -> Self {
        Self::InvalidConfiguration(format!(
            "expected {} config, found {}",
            expected.as_str(),
            found.kind().as_str()
        ))
    }
}

/// Sends an alert through one kind of channel.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    async fn send(&self, config: &ChannelConfig, alert: &Alert) -> Result<(), SenderError>;
}

/// Fail a non-2xx response with its body attached.
async fn check_response(service: &str, response: reqwest::Response) -> Result<(), SenderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "failed to read error body".to_string());
    Err(SenderError::SendFailed(format!(
        "{} returned {}: {}",
        service, status, body
    )))
}

pub type SenderMap = HashMap<ChannelKind, Arc<dyn ChannelSender>>;

/// One sender per channel kind, sharing an HTTP client.
pub fn default_senders(mail: MailConfig, app_name: &str) -> SenderMap {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(15))
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!("Falling back to default HTTP client: {}", e);
            reqwest::Client::new()
        });

    let chat: Arc<dyn ChannelSender> = Arc::new(ChatWebhookSender::new(client.clone()));
    let mut senders = SenderMap::new();
    senders.insert(
        ChannelKind::Telegram,
        Arc::new(TelegramSender::new(client.clone())) as Arc<dyn ChannelSender>,
    );
    senders.insert(ChannelKind::Slack, chat.clone());
    senders.insert(ChannelKind::Mattermost, chat);
    senders.insert(
        ChannelKind::Pagerduty,
        Arc::new(PagerDutySender::new(client, app_name)) as Arc<dyn ChannelSender>,
    );
    senders.insert(
        ChannelKind::Email,
        Arc::new(EmailSender::new(mail, app_name)) as Arc<dyn ChannelSender>,
    );
    senders
}
