use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use super::{check_response, ChannelSender, SenderError};
use crate::db::{ChannelConfig, ChannelKind, CheckStatus};
use crate::notify::Alert;

/// PagerDuty Events API v2. Incidents are deduplicated per check, so a
/// recovery resolves the incident its failure opened.
pub struct PagerDutySender {
    client: Client,
    events_url: String,
    source: String,
}

impl PagerDutySender {
    pub fn new(client: Client, source: &str) -> Self {
        Self {
            client,
            events_url: "https://events.pagerduty.com/v2/enqueue".to_string(),
            source: source.to_string(),
        }
    }

    pub fn with_events_url(mut self, url: impl Into<String>) -> Self {
        self.events_url = url.into();
        self
    }
}

#[derive(Serialize)]
struct PdEvent<'a> {
    routing_key: &'a str,
    event_action: &'a str,
    dedup_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<PdPayload<'a>>,
}

#[derive(Serialize)]
struct PdPayload<'a> {
    summary: String,
    source: &'a str,
    severity: &'a str,
    timestamp: String,
    component: &'a str,
    custom_details: serde_json::Value,
}

fn severity(alert: &Alert) -> &'static str {
    match alert.to {
        CheckStatus::Down if alert.priority.eq_ignore_ascii_case("critical") => "critical",
        CheckStatus::Down => "error",
        _ => "warning",
    }
}

#[async_trait]
impl ChannelSender for PagerDutySender {
    async fn send(&self, config: &ChannelConfig, alert: &Alert) -> Result<(), SenderError> {
        let ChannelConfig::Pagerduty { routing_key } = config else {
            return Err(SenderError::wrong_config(ChannelKind::Pagerduty, config));
        };
        if routing_key.is_empty() {
            return Err(SenderError::InvalidConfiguration(
                "pagerduty routing_key is required".to_string(),
            ));
        }

        let resolve = alert.to == CheckStatus::Up;
        let event = PdEvent {
            routing_key,
            event_action: if resolve { "resolve" } else { "trigger" },
            dedup_key: format!("rmon-check-{}", alert.check_id),
            payload: (!resolve).then(|| PdPayload {
                summary: alert.headline(),
                source: &self.source,
                severity: severity(alert),
                timestamp: alert.at.to_rfc3339(),
                component: alert.kind.as_str(),
                custom_details: serde_json::json!({
                    "agent": alert.agent_name,
                    "previous_status": alert.from.as_str(),
                    "message": alert.message,
                    "runbook": alert.runbook,
                }),
            }),
        };

        let response = self.client.post(&self.events_url).json(&event).send().await?;
        check_response("PagerDuty", response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::senders::testing::capture_server;
    use crate::notify::tests::alert;

    #[tokio::test]
    async fn test_trigger_then_resolve() {
        let (base, seen) = capture_server().await;
        let sender =
            PagerDutySender::new(Client::new(), "RMON").with_events_url(format!("{}/v2/enqueue", base));
        let config = ChannelConfig::Pagerduty {
            routing_key: "R0UT1NG".to_string(),
        };

        let mut a = alert();
        sender.send(&config, &a).await.unwrap();
        a.from = CheckStatus::Down;
        a.to = CheckStatus::Up;
        sender.send(&config, &a).await.unwrap();

        let seen = seen.lock().unwrap();
        let (trigger, resolve) = (&seen[0].1, &seen[1].1);
        assert_eq!(trigger["event_action"], "trigger");
        assert_eq!(trigger["payload"]["severity"], "critical");
        assert_eq!(trigger["payload"]["source"], "RMON");
        assert_eq!(resolve["event_action"], "resolve");
        assert_eq!(trigger["dedup_key"], resolve["dedup_key"]);
        assert!(resolve.get("payload").is_none());
    }
}
