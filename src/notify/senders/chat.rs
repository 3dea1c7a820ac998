use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use super::{check_response, ChannelSender, SenderError};
use crate::db::ChannelConfig;
use crate::notify::Alert;

/// Incoming-webhook sender shared by Slack and Mattermost, which accept the
/// same `{"text": ...}` payload.
pub struct ChatWebhookSender {
    client: Client,
}

impl ChatWebhookSender {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[derive(Serialize)]
struct WebhookMessage<'a> {
    text: &'a str,
}

#[async_trait]
impl ChannelSender for ChatWebhookSender {
    async fn send(&self, config: &ChannelConfig, alert: &Alert) -> Result<(), SenderError> {
        let (service, url) = match config {
            ChannelConfig::Slack { webhook_url } => ("Slack", webhook_url),
            ChannelConfig::Mattermost { webhook_url } => ("Mattermost", webhook_url),
            other => {
                return Err(SenderError::InvalidConfiguration(format!(
                    "expected slack or mattermost config, found {}",
                    other.kind().as_str()
                )))
            }
        };
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(SenderError::InvalidConfiguration(format!(
                "{} webhook_url must be an http(s) URL",
                service
            )));
        }

        let text = format!("*{}*\n{}", alert.headline(), alert.body());
        let response = self
            .client
            .post(url)
            .json(&WebhookMessage { text: &text })
            .send()
            .await?;
        check_response(service, response).await
    }
}
