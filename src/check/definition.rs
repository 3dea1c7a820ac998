//! Check definitions and their request-body decoding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use super::de;
use super::status_codes::parse_patterns;

/// Rejected check definition. Never reaches the scheduler.
#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("invalid request body: {0}")]
    Malformed(String),
    #[error("unknown check kind: {0}")]
    UnknownKind(String),
    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("{0} {1} does not exist")]
    MissingReference(&'static str, i64),
}

impl ValidationError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    Tcp,
    Http,
    Smtp,
    Ping,
    Dns,
    Rabbitmq,
}

impl CheckKind {
    pub const ALL: [CheckKind; 6] = [
        Self::Tcp,
        Self::Http,
        Self::Smtp,
        Self::Ping,
        Self::Dns,
        Self::Rabbitmq,
    ];

    /// Numeric kind id used by the metrics stream URL.
    pub fn type_id(self) -> u8 {
        match self {
            Self::Tcp => 1,
            Self::Http => 2,
            Self::Smtp => 3,
            Self::Ping => 4,
            Self::Dns => 5,
            Self::Rabbitmq => 6,
        }
    }

    pub fn from_type_id(id: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.type_id() == id)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Http => "http",
            Self::Smtp => "smtp",
            Self::Ping => "ping",
            Self::Dns => "dns",
            Self::Rabbitmq => "rabbitmq",
        }
    }

    /// Timing fields recorded for this kind, in chart order.
    pub fn metric_names(self) -> &'static [&'static str] {
        match self {
            Self::Tcp => &["response_time", "name_lookup", "connect"],
            Self::Http => &[
                "response_time",
                "name_lookup",
                "connect",
                "app_connect",
                "pre_transfer",
                "redirect",
                "start_transfer",
                "download",
            ],
            Self::Smtp | Self::Rabbitmq => {
                &["response_time", "name_lookup", "connect", "app_connect"]
            }
            Self::Ping => &[
                "response_time",
                "min_resp_time",
                "avg_resp_time",
                "max_resp_time",
                "packet_loss_percent",
            ],
            Self::Dns => &["response_time"],
        }
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "http" | "https" => Ok(Self::Http),
            "smtp" => Ok(Self::Smtp),
            "ping" => Ok(Self::Ping),
            "dns" => Ok(Self::Dns),
            "rabbitmq" | "rabbit" => Ok(Self::Rabbitmq),
            _ => Err(ValidationError::UnknownKind(s.to_string())),
        }
    }
}

/// Where a check executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum Placement {
    Agent(i64),
    /// Every enabled agent of the region.
    Region(i64),
    /// Every enabled agent of every region in the country.
    Country(i64),
    All,
}

/// Channel ids to alert per legacy slot. `None` means no channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationRoutes {
    #[serde(default, deserialize_with = "de::zero_as_none")]
    pub tg: Option<i64>,
    #[serde(default, deserialize_with = "de::zero_as_none")]
    pub slack: Option<i64>,
    #[serde(default, deserialize_with = "de::zero_as_none")]
    pub pd: Option<i64>,
    #[serde(default, deserialize_with = "de::zero_as_none")]
    pub mm: Option<i64>,
    #[serde(default, deserialize_with = "de::zero_as_none")]
    pub email: Option<i64>,
}

impl NotificationRoutes {
    /// Distinct channel ids in slot order.
    pub fn channel_ids(&self) -> Vec<i64> {
        let mut ids = Vec::new();
        for id in [self.tg, self.slack, self.pd, self.mm, self.email]
            .into_iter()
            .flatten()
        {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpTarget {
    pub ip: String,
    #[serde(deserialize_with = "de::flexible_num")]
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeaderAssertions {
    /// Header name to expected value; an empty value only requires presence.
    #[serde(default, deserialize_with = "de::string_map")]
    pub required: BTreeMap<String, String>,
    #[serde(default)]
    pub forbidden: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonAssertion {
    /// Dotted path, array indexes allowed: `data.items.0.state`.
    pub path: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HttpAuth {
    Basic { username: String, password: String },
    /// PEM client certificate chain and PKCS#8 key.
    Mtls { cert_pem: String, key_pem: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpTarget {
    pub url: String,
    #[serde(default = "default_method")]
    pub http_method: String,
    #[serde(default = "default_status_codes", deserialize_with = "de::status_codes")]
    pub accepted_status_codes: Vec<String>,
    /// Keyword the response body must contain.
    #[serde(default, deserialize_with = "de::opt_string")]
    pub body: Option<String>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub body_req: Option<String>,
    #[serde(default, deserialize_with = "de::string_map")]
    pub header_req: BTreeMap<String, String>,
    #[serde(default)]
    pub headers_response: HeaderAssertions,
    #[serde(default)]
    pub body_json: Option<JsonAssertion>,
    #[serde(default, deserialize_with = "de::flexible_bool")]
    pub ignore_ssl_error: bool,
    #[serde(default = "default_redirects", deserialize_with = "de::flexible_num")]
    pub redirects: u32,
    #[serde(default)]
    pub auth: Option<HttpAuth>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub proxy: Option<String>,
    #[serde(default = "default_ssl_warning", deserialize_with = "de::flexible_num")]
    pub ssl_expire_warning_days: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum DnsRecordType {
    A,
    Aaaa,
    Caa,
    Cname,
    Mx,
    Ns,
    Ptr,
    Soa,
    Srv,
    Txt,
}

impl DnsRecordType {
    pub fn qtype(self) -> u16 {
        match self {
            Self::A => 1,
            Self::Ns => 2,
            Self::Cname => 5,
            Self::Soa => 6,
            Self::Ptr => 12,
            Self::Mx => 15,
            Self::Txt => 16,
            Self::Aaaa => 28,
            Self::Srv => 33,
            Self::Caa => 257,
        }
    }
}

impl TryFrom<String> for DnsRecordType {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        let t = match s.trim().to_ascii_lowercase().as_str() {
            "a" => Self::A,
            "aaaa" | "aaa" => Self::Aaaa,
            "caa" => Self::Caa,
            "cname" => Self::Cname,
            "mx" => Self::Mx,
            "ns" => Self::Ns,
            "ptr" => Self::Ptr,
            "soa" | "sao" => Self::Soa,
            "srv" | "src" => Self::Srv,
            "txt" => Self::Txt,
            _ => return Err(format!("unsupported record type {:?}", s)),
        };
        Ok(t)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsTarget {
    /// Name to resolve.
    pub ip: String,
    pub resolver: String,
    #[serde(default = "default_dns_port", deserialize_with = "de::flexible_num")]
    pub port: u16,
    pub record_type: DnsRecordType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingTarget {
    pub ip: String,
    #[serde(default = "default_packet_size", deserialize_with = "de::flexible_num")]
    pub packet_size: u16,
    #[serde(default = "default_count_packets", deserialize_with = "de::flexible_num")]
    pub count_packets: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmtpTarget {
    pub ip: String,
    #[serde(default = "default_smtp_port", deserialize_with = "de::flexible_num")]
    pub port: u16,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub username: Option<String>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub password: Option<String>,
    /// Upgrade with STARTTLS after EHLO.
    #[serde(default, deserialize_with = "de::flexible_bool")]
    pub use_tls: bool,
    #[serde(default, deserialize_with = "de::flexible_bool")]
    pub ignore_ssl_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RabbitTarget {
    pub ip: String,
    #[serde(default = "default_amqp_port", deserialize_with = "de::flexible_num")]
    pub port: u16,
    #[serde(default = "default_guest")]
    pub username: String,
    #[serde(default = "default_guest")]
    pub password: String,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    #[serde(default, deserialize_with = "de::flexible_bool")]
    pub use_tls: bool,
    #[serde(default, deserialize_with = "de::flexible_bool")]
    pub ignore_ssl_error: bool,
}

/// Kind-specific target, tagged by `check_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check_type", rename_all = "lowercase")]
pub enum CheckTarget {
    Tcp(TcpTarget),
    Http(HttpTarget),
    Smtp(SmtpTarget),
    Ping(PingTarget),
    Dns(DnsTarget),
    Rabbitmq(RabbitTarget),
}

impl CheckTarget {
    pub fn kind(&self) -> CheckKind {
        match self {
            Self::Tcp(_) => CheckKind::Tcp,
            Self::Http(_) => CheckKind::Http,
            Self::Smtp(_) => CheckKind::Smtp,
            Self::Ping(_) => CheckKind::Ping,
            Self::Dns(_) => CheckKind::Dns,
            Self::Rabbitmq(_) => CheckKind::Rabbitmq,
        }
    }

    /// Host or URL shown in alerts.
    pub fn address(&self) -> String {
        match self {
            Self::Tcp(t) => format!("{}:{}", t.ip, t.port),
            Self::Http(t) => t.url.clone(),
            Self::Smtp(t) => format!("{}:{}", t.ip, t.port),
            Self::Ping(t) => t.ip.clone(),
            Self::Dns(t) => t.ip.clone(),
            Self::Rabbitmq(t) => format!("{}:{}", t.ip, t.port),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckDefinition {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub enabled: bool,
    /// Seconds between runs.
    pub interval: u32,
    /// Seconds allowed per attempt.
    pub timeout: u32,
    pub retries: u32,
    /// Consecutive failures before the check is considered down.
    pub threshold_timeout: u32,
    pub placement: Placement,
    pub group: Option<String>,
    pub shared: bool,
    pub runbook: Option<String>,
    pub priority: String,
    #[serde(flatten)]
    pub channels: NotificationRoutes,
    #[serde(flatten)]
    pub target: CheckTarget,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CheckDefinition {
    pub fn kind(&self) -> CheckKind {
        self.target.kind()
    }

    pub fn interval_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.interval.max(1)))
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.timeout.max(1)))
    }

    /// Field checks that need no database access.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::invalid("name", "must not be empty"));
        }
        if self.interval == 0 {
            return Err(ValidationError::invalid("interval", "must be greater than 0"));
        }
        if self.timeout == 0 {
            return Err(ValidationError::invalid("timeout", "must be greater than 0"));
        }
        if self.timeout > self.interval {
            return Err(ValidationError::invalid(
                "timeout",
                format!("{}s exceeds the interval of {}s", self.timeout, self.interval),
            ));
        }

        match &self.target {
            CheckTarget::Tcp(t) => {
                require_host("ip", &t.ip)?;
                require_port(t.port)?;
            }
            CheckTarget::Http(t) => validate_http(t)?,
            CheckTarget::Smtp(t) => {
                require_host("ip", &t.ip)?;
                require_port(t.port)?;
            }
            CheckTarget::Ping(t) => {
                require_host("ip", &t.ip)?;
                if t.packet_size < 16 {
                    return Err(ValidationError::invalid("packet_size", "must be at least 16"));
                }
                if t.count_packets == 0 || t.count_packets > 100 {
                    return Err(ValidationError::invalid("count_packets", "must be within 1-100"));
                }
            }
            CheckTarget::Dns(t) => {
                require_host("ip", &t.ip)?;
                require_host("resolver", &t.resolver)?;
                require_port(t.port)?;
            }
            CheckTarget::Rabbitmq(t) => {
                require_host("ip", &t.ip)?;
                require_port(t.port)?;
                if t.vhost.is_empty() {
                    return Err(ValidationError::invalid("vhost", "must not be empty"));
                }
            }
        }
        Ok(())
    }
}

fn validate_http(t: &HttpTarget) -> Result<(), ValidationError> {
    if !(t.url.starts_with("http://") || t.url.starts_with("https://")) {
        return Err(ValidationError::invalid(
            "url",
            "must start with http:// or https://",
        ));
    }
    const METHODS: [&str; 7] = ["get", "post", "put", "patch", "delete", "head", "options"];
    if !METHODS.contains(&t.http_method.to_ascii_lowercase().as_str()) {
        return Err(ValidationError::invalid(
            "http_method",
            format!("unsupported method {:?}", t.http_method),
        ));
    }
    if t.accepted_status_codes.is_empty() {
        return Err(ValidationError::invalid("accepted_status_codes", "must not be empty"));
    }
    parse_patterns(&t.accepted_status_codes)
        .map_err(|e| ValidationError::invalid("accepted_status_codes", e))?;
    if let Some(proxy) = &t.proxy {
        if reqwest::Proxy::all(proxy.as_str()).is_err() {
            return Err(ValidationError::invalid("proxy", format!("invalid proxy {:?}", proxy)));
        }
    }
    if let Some(assertion) = &t.body_json {
        if assertion.path.trim().is_empty() {
            return Err(ValidationError::invalid("body_json", "path must not be empty"));
        }
    }
    Ok(())
}

fn require_host(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::invalid(field, "must not be empty"));
    }
    Ok(())
}

fn require_port(port: u16) -> Result<(), ValidationError> {
    if port == 0 {
        return Err(ValidationError::invalid("port", "must be within 1-65535"));
    }
    Ok(())
}

/// Kind-independent fields of a create or update body.
#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub description: Option<String>,
    #[serde(default = "default_true", deserialize_with = "de::flexible_bool")]
    pub enabled: bool,
    #[serde(default = "default_interval", deserialize_with = "de::flexible_num")]
    pub interval: u32,
    #[serde(default = "default_timeout", deserialize_with = "de::flexible_num")]
    pub timeout: u32,
    #[serde(default = "default_retries", deserialize_with = "de::flexible_num")]
    pub retries: u32,
    #[serde(default, deserialize_with = "de::flexible_num")]
    pub threshold_timeout: u32,
    #[serde(default, deserialize_with = "de::zero_as_none")]
    pub agent_id: Option<i64>,
    #[serde(default, deserialize_with = "de::zero_as_none")]
    pub region_id: Option<i64>,
    #[serde(default, deserialize_with = "de::zero_as_none")]
    pub country_id: Option<i64>,
    #[serde(default, deserialize_with = "de::flexible_bool")]
    pub all_agents: bool,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub group: Option<String>,
    #[serde(default, deserialize_with = "de::flexible_bool")]
    pub shared: bool,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub runbook: Option<String>,
    #[serde(default, deserialize_with = "de::opt_string")]
    pub priority: Option<String>,
    #[serde(default, deserialize_with = "de::zero_as_none")]
    pub tg: Option<i64>,
    #[serde(default, deserialize_with = "de::zero_as_none")]
    pub slack: Option<i64>,
    #[serde(default, deserialize_with = "de::zero_as_none")]
    pub pd: Option<i64>,
    #[serde(default, deserialize_with = "de::zero_as_none")]
    pub mm: Option<i64>,
    #[serde(default, deserialize_with = "de::zero_as_none")]
    pub email: Option<i64>,
    #[serde(skip)]
    pub target: Option<CheckTarget>,
}

impl CheckRequest {
    /// Decode a body posted to `/rmon/check/{kind}`. The path decides the kind.
    pub fn parse(kind: CheckKind, body: &[u8]) -> Result<Self, ValidationError> {
        let mut value: serde_json::Value =
            serde_json::from_slice(body).map_err(|e| ValidationError::Malformed(e.to_string()))?;
        let obj = value
            .as_object_mut()
            .ok_or_else(|| ValidationError::Malformed("expected a JSON object".to_string()))?;
        obj.insert(
            "check_type".to_string(),
            serde_json::Value::String(kind.as_str().to_string()),
        );

        let target: CheckTarget = serde_json::from_value(value.clone())
            .map_err(|e| ValidationError::Malformed(e.to_string()))?;
        let mut req: CheckRequest =
            serde_json::from_value(value).map_err(|e| ValidationError::Malformed(e.to_string()))?;
        req.target = Some(target);
        Ok(req)
    }

    pub fn placement(&self) -> Placement {
        if let Some(id) = self.agent_id {
            Placement::Agent(id)
        } else if let Some(id) = self.region_id {
            Placement::Region(id)
        } else if let Some(id) = self.country_id {
            Placement::Country(id)
        } else {
            Placement::All
        }
    }

    /// Build a validated definition. `created_at` is kept on updates.
    pub fn into_definition(
        self,
        id: i64,
        created_at: Option<DateTime<Utc>>,
    ) -> Result<CheckDefinition, ValidationError> {
        let placement = self.placement();
        let target = self
            .target
            .ok_or_else(|| ValidationError::Malformed("missing check target".to_string()))?;
        let now = Utc::now();
        let def = CheckDefinition {
            id,
            name: self.name.trim().to_string(),
            description: self.description.unwrap_or_default(),
            enabled: self.enabled,
            interval: self.interval,
            timeout: self.timeout,
            retries: self.retries,
            threshold_timeout: self.threshold_timeout,
            placement,
            group: self.group,
            shared: self.shared,
            runbook: self.runbook,
            priority: self.priority.unwrap_or_else(|| "critical".to_string()),
            channels: NotificationRoutes {
                tg: self.tg,
                slack: self.slack,
                pd: self.pd,
                mm: self.mm,
                email: self.email,
            },
            target,
            created_at: created_at.unwrap_or(now),
            updated_at: now,
        };
        def.validate()?;
        Ok(def)
    }
}

fn default_true() -> bool {
    true
}
fn default_interval() -> u32 {
    120
}
fn default_timeout() -> u32 {
    2
}
fn default_retries() -> u32 {
    3
}
fn default_method() -> String {
    "get".to_string()
}
fn default_status_codes() -> Vec<String> {
    vec!["200".to_string()]
}
fn default_redirects() -> u32 {
    10
}
fn default_ssl_warning() -> i64 {
    14
}
fn default_dns_port() -> u16 {
    53
}
fn default_packet_size() -> u16 {
    56
}
fn default_count_packets() -> u16 {
    4
}
fn default_smtp_port() -> u16 {
    25
}
fn default_amqp_port() -> u16 {
    5672
}
fn default_guest() -> String {
    "guest".to_string()
}
fn default_vhost() -> String {
    "/".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(kind: CheckKind, body: &str) -> Result<CheckDefinition, ValidationError> {
        CheckRequest::parse(kind, body.as_bytes())?.into_definition(0, None)
    }

    #[test]
    fn test_http_defaults() {
        let def = parse(
            CheckKind::Http,
            r#"{"name":"site","url":"https://example.com","agent_id":"3","tg":0,"slack":"7"}"#,
        )
        .unwrap();
        assert_eq!(def.interval, 120);
        assert_eq!(def.timeout, 2);
        assert_eq!(def.retries, 3);
        assert_eq!(def.placement, Placement::Agent(3));
        assert_eq!(def.channels.channel_ids(), vec![7]);
        let CheckTarget::Http(t) = &def.target else {
            panic!("expected http target");
        };
        assert_eq!(t.accepted_status_codes, vec!["200"]);
        assert_eq!(t.redirects, 10);
        assert_eq!(t.ssl_expire_warning_days, 14);
    }

    #[test]
    fn test_path_kind_wins_over_body() {
        let def = parse(
            CheckKind::Tcp,
            r#"{"name":"db","check_type":"http","ip":"10.0.0.5","port":5432}"#,
        )
        .unwrap();
        assert_eq!(def.kind(), CheckKind::Tcp);
        assert_eq!(def.placement, Placement::All);
    }

    #[test]
    fn test_timeout_must_fit_interval() {
        let err = parse(
            CheckKind::Tcp,
            r#"{"name":"db","ip":"h","port":1,"interval":5,"timeout":10}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::Invalid { field: "timeout", .. }));
    }

    #[test]
    fn test_bad_status_pattern_rejected() {
        let err = parse(
            CheckKind::Http,
            r#"{"name":"x","url":"http://h","accepted_status_codes":["2x*"]}"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ValidationError::Invalid { field: "accepted_status_codes", .. }
        ));
    }

    #[test]
    fn test_dns_legacy_alias() {
        let def = parse(
            CheckKind::Dns,
            r#"{"name":"d","ip":"example.com","resolver":"1.1.1.1","record_type":"sao"}"#,
        )
        .unwrap();
        let CheckTarget::Dns(t) = def.target else {
            panic!("expected dns target");
        };
        assert_eq!(t.record_type, DnsRecordType::Soa);
        assert_eq!(t.port, 53);
    }

    #[test]
    fn test_ping_packet_size_floor() {
        let err = parse(CheckKind::Ping, r#"{"name":"p","ip":"h","packet_size":8}"#).unwrap_err();
        assert!(matches!(err, ValidationError::Invalid { field: "packet_size", .. }));
    }

    #[test]
    fn test_definition_json_carries_kind() {
        let def = parse(
            CheckKind::Rabbitmq,
            r#"{"name":"mq","ip":"mq.local","region_id":2}"#,
        )
        .unwrap();
        let v = serde_json::to_value(&def).unwrap();
        assert_eq!(v["check_type"], "rabbitmq");
        assert_eq!(v["vhost"], "/");
        assert_eq!(v["placement"]["type"], "region");
        assert_eq!(v["placement"]["id"], 2);
    }

    #[test]
    fn test_kind_ids() {
        assert_eq!(CheckKind::from_type_id(2), Some(CheckKind::Http));
        assert_eq!(CheckKind::Rabbitmq.type_id(), 6);
        assert!("ftp".parse::<CheckKind>().is_err());
    }
}
