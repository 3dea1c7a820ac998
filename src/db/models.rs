//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome status of a single result, and the derived status of a check.
///
/// The numeric values are part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum CheckStatus {
    Down = 0,
    Up = 1,
    Unknown = 3,
    Disabled = 4,
    /// Reachable, but a certificate is close to expiry.
    Warn = 5,
    /// Reachable with partial packet loss.
    Degraded = 6,
}

impl CheckStatus {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Down),
            1 => Some(Self::Up),
            3 => Some(Self::Unknown),
            4 => Some(Self::Disabled),
            5 => Some(Self::Warn),
            6 => Some(Self::Degraded),
            _ => None,
        }
    }

    pub fn is_failure(self) -> bool {
        self == Self::Down
    }

    /// Reachable outcomes: up, warn and degraded.
    pub fn is_reachable(self) -> bool {
        matches!(self, Self::Up | Self::Warn | Self::Degraded)
    }

    /// Whether the sample carries information about the target at all.
    pub fn is_sample(self) -> bool {
        !matches!(self, Self::Unknown | Self::Disabled)
    }

    /// Ordering used for worst-case aggregation across agents.
    pub fn severity(self) -> u8 {
        match self {
            Self::Down => 4,
            Self::Warn | Self::Degraded => 3,
            Self::Up => 2,
            Self::Unknown => 1,
            Self::Disabled => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Down => "down",
            Self::Up => "up",
            Self::Unknown => "unknown",
            Self::Disabled => "disabled",
            Self::Warn => "warn",
            Self::Degraded => "degraded",
        }
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<CheckStatus> for u8 {
    fn from(s: CheckStatus) -> u8 {
        s.code()
    }
}

impl TryFrom<u8> for CheckStatus {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Self::from_code(code).ok_or_else(|| format!("unknown status code {}", code))
    }
}

/// Latency breakdown of one result, in milliseconds.
///
/// HTTP phases are cumulative from the start of the probe, the way curl
/// reports them. Fields a kind does not measure stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name_lookup: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_connect: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_transfer: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_transfer: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_resp_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_resp_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_resp_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packet_loss_percent: Option<f64>,
}

impl Timings {
    /// Value of a metric by its wire name.
    pub fn get(&self, metric: &str) -> Option<f64> {
        match metric {
            "response_time" => self.response_time,
            "name_lookup" => self.name_lookup,
            "connect" => self.connect,
            "app_connect" => self.app_connect,
            "pre_transfer" => self.pre_transfer,
            "redirect" => self.redirect,
            "start_transfer" => self.start_transfer,
            "download" => self.download,
            "min_resp_time" => self.min_resp_time,
            "avg_resp_time" => self.avg_resp_time,
            "max_resp_time" => self.max_resp_time,
            "packet_loss_percent" => self.packet_loss_percent,
            _ => None,
        }
    }
}

/// One executed (check, agent) task. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    pub check_id: i64,
    pub agent_id: i64,
    /// Dispatch order; results for a key are applied in this order.
    pub seq: u64,
    /// When the probe started, as reported by the executor.
    pub time: DateTime<Utc>,
    /// When the result entered the pipeline.
    pub ingested_at: DateTime<Utc>,
    pub status: CheckStatus,
    pub timings: Timings,
    pub message: String,
    pub ssl_expire_date: Option<DateTime<Utc>>,
    pub meta: ResultMeta,
}

/// Raw probe details kept alongside the timings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultMeta {
    /// Final HTTP status code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// DNS answers as presentation strings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub answers: Vec<String>,
}

impl ResultMeta {
    pub fn is_empty(&self) -> bool {
        self.status_code.is_none() && self.answers.is_empty()
    }
}

/// A fired alert as kept in the alert history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertRecord {
    pub id: i64,
    pub check_id: i64,
    pub agent_id: i64,
    pub agent_name: String,
    pub from: CheckStatus,
    pub to: CheckStatus,
    pub at: DateTime<Utc>,
    pub message: String,
}

/// An execution location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub server: String,
    #[serde(default = "default_agent_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub shared: bool,
    #[serde(default)]
    pub region_id: Option<i64>,
}

fn default_agent_port() -> u16 {
    5101
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub shared: bool,
    #[serde(default)]
    pub country_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Country {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub shared: bool,
}

/// A public aggregate over an ordered set of checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPage {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub custom_style: Option<String>,
    #[serde(default)]
    pub checks: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Telegram,
    Slack,
    Pagerduty,
    Mattermost,
    Email,
}

impl ChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Telegram => "telegram",
            Self::Slack => "slack",
            Self::Pagerduty => "pagerduty",
            Self::Mattermost => "mattermost",
            Self::Email => "email",
        }
    }
}

/// Delivery settings for a notification channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ChannelConfig {
    Telegram { token: String, chat_id: String },
    Slack { webhook_url: String },
    Pagerduty { routing_key: String },
    Mattermost { webhook_url: String },
    Email { recipients: Vec<String> },
}

impl ChannelConfig {
    pub fn kind(&self) -> ChannelKind {
        match self {
            Self::Telegram { .. } => ChannelKind::Telegram,
            Self::Slack { .. } => ChannelKind::Slack,
            Self::Pagerduty { .. } => ChannelKind::Pagerduty,
            Self::Mattermost { .. } => ChannelKind::Mattermost,
            Self::Email { .. } => ChannelKind::Email,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(flatten)]
    pub config: ChannelConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_codes() {
        assert_eq!(serde_json::to_string(&CheckStatus::Warn).unwrap(), "5");
        let s: CheckStatus = serde_json::from_str("0").unwrap();
        assert_eq!(s, CheckStatus::Down);
        assert!(serde_json::from_str::<CheckStatus>("2").is_err());
    }

    #[test]
    fn test_severity_order() {
        assert!(CheckStatus::Down.severity() > CheckStatus::Degraded.severity());
        assert!(CheckStatus::Warn.severity() > CheckStatus::Up.severity());
        assert!(CheckStatus::Up.severity() > CheckStatus::Unknown.severity());
    }

    #[test]
    fn test_channel_json_shape() {
        let ch: Channel = serde_json::from_str(
            r#"{"name":"ops","kind":"slack","webhook_url":"https://hooks.example/x"}"#,
        )
        .unwrap();
        assert_eq!(ch.config.kind(), ChannelKind::Slack);
        let v = serde_json::to_value(&ch).unwrap();
        assert_eq!(v["kind"], "slack");
        assert_eq!(v["webhook_url"], "https://hooks.example/x");
    }
}
