use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use super::{check_response, ChannelSender, SenderError};
use crate::db::{ChannelConfig, ChannelKind};
use crate::notify::Alert;

/// Sends alerts through the Telegram Bot API.
pub struct TelegramSender {
    client: Client,
    api_base: String,
}

impl TelegramSender {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            api_base: "https://api.telegram.org".to_string(),
        }
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }
}

#[derive(Serialize)]
struct TelegramMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    disable_web_page_preview: bool,
}

#[async_trait]
impl ChannelSender for TelegramSender {
    async fn send(&self, config: &ChannelConfig, alert: &Alert) -> Result<(), SenderError> {
        let ChannelConfig::Telegram { token, chat_id } = config else {
            return Err(SenderError::wrong_config(ChannelKind::Telegram, config));
        };
        if token.is_empty() || chat_id.is_empty() {
            return Err(SenderError::InvalidConfiguration(
                "telegram token and chat_id are required".to_string(),
            ));
        }

        let url = format!("{}/bot{}/sendMessage", self.api_base, token);
        let text = format!("{}\n\n{}", alert.headline(), alert.body());
        let payload = TelegramMessage {
            chat_id,
            text: &text,
            disable_web_page_preview: true,
        };
        let response = self.client.post(&url).json(&payload).send().await?;
        check_response("Telegram API", response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::senders::testing::capture_server;
    use crate::notify::tests::alert;

    #[tokio::test]
    async fn test_posts_to_bot_endpoint() {
        let (base, seen) = capture_server().await;
        let sender = TelegramSender::new(Client::new()).with_api_base(base);
        let config = ChannelConfig::Telegram {
            token: "123:abc".to_string(),
            chat_id: "-100".to_string(),
        };
        sender.send(&config, &alert()).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].0, "/bot123:abc/sendMessage");
        assert_eq!(seen[0].1["chat_id"], "-100");
        assert!(seen[0].1["text"].as_str().unwrap().contains("web"));
    }

    #[tokio::test]
    async fn test_missing_token_is_permanent() {
        let sender = TelegramSender::new(Client::new());
        let config = ChannelConfig::Telegram {
            token: String::new(),
            chat_id: "1".to_string(),
        };
        let err = sender.send(&config, &alert()).await.unwrap_err();
        assert!(err.is_permanent());
    }
}
