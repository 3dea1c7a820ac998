//! Configuration module for RMON.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "rmon.db")
    pub db_path: String,
    /// Upper bound on concurrently executing probes (default: 64)
    pub workers: usize,
    /// Scheduler tick resolution in milliseconds (default: 1000)
    pub tick_ms: u64,
    /// Maximum initial offset spread across checks in milliseconds (default: 5000)
    pub jitter_ms: u64,
    /// Samples kept per (check, agent) for status and uptime (default: 40)
    pub history_window: usize,
    /// Events buffered per stream subscriber before the oldest are dropped (default: 64)
    pub stream_buffer: usize,
    /// Days of results kept in the database (default: 30)
    pub retention_days: i64,
    /// Delivery attempts per notification and channel (default: 3)
    pub notify_retries: u32,
    /// Pending notifications before new ones are dropped (default: 1024)
    pub notify_queue: usize,
    /// Ping loss percentage at or above which the check is down (default: 50)
    pub ping_loss_threshold: f64,
    /// Name used in alert messages (default: "RMON")
    pub name: String,
    pub mail: MailConfig,
}

/// Outbound SMTP relay used by the email channel.
#[derive(Debug, Clone)]
pub struct MailConfig {
    pub host: Option<String>,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub starttls: bool,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: 587,
            user: None,
            password: None,
            from: "rmon@localhost".to_string(),
            starttls: true,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "rmon.db".to_string(),
            workers: 64,
            tick_ms: 1000,
            jitter_ms: 5000,
            history_window: 40,
            stream_buffer: 64,
            retention_days: 30,
            notify_retries: 3,
            notify_queue: 1024,
            ping_loss_threshold: 50.0,
            name: "RMON".to_string(),
            mail: MailConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Every field has an `RMON_*` variable, e.g. `RMON_HTTP_PORT`,
    /// `RMON_DB_PATH`, `RMON_WORKERS`, `RMON_MAIL_HOST`. Values that fail to
    /// parse leave the default in place.
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        parse_into(&lookup, "RMON_HTTP_PORT", &mut cfg.http_port);
        if let Some(db_path) = lookup("RMON_DB_PATH") {
            cfg.db_path = db_path;
        }
        parse_into(&lookup, "RMON_WORKERS", &mut cfg.workers);
        parse_into(&lookup, "RMON_TICK_MS", &mut cfg.tick_ms);
        parse_into(&lookup, "RMON_JITTER_MS", &mut cfg.jitter_ms);
        parse_into(&lookup, "RMON_HISTORY_WINDOW", &mut cfg.history_window);
        parse_into(&lookup, "RMON_STREAM_BUFFER", &mut cfg.stream_buffer);
        parse_into(&lookup, "RMON_RETENTION_DAYS", &mut cfg.retention_days);
        parse_into(&lookup, "RMON_NOTIFY_RETRIES", &mut cfg.notify_retries);
        parse_into(&lookup, "RMON_NOTIFY_QUEUE", &mut cfg.notify_queue);
        parse_into(&lookup, "RMON_PING_LOSS_THRESHOLD", &mut cfg.ping_loss_threshold);
        if let Some(name) = lookup("RMON_NAME") {
            cfg.name = name;
        }

        cfg.mail.host = lookup("RMON_MAIL_HOST").filter(|h| !h.is_empty());
        parse_into(&lookup, "RMON_MAIL_PORT", &mut cfg.mail.port);
        cfg.mail.user = lookup("RMON_MAIL_USER").filter(|u| !u.is_empty());
        cfg.mail.password = lookup("RMON_MAIL_PASSWORD");
        if let Some(from) = lookup("RMON_MAIL_FROM") {
            cfg.mail.from = from;
        }
        parse_into(&lookup, "RMON_MAIL_STARTTLS", &mut cfg.mail.starttls);

        // Zero would stall the pool or the tick loop.
        cfg.workers = cfg.workers.max(1);
        cfg.tick_ms = cfg.tick_ms.max(10);
        cfg.history_window = cfg.history_window.max(1);
        cfg.stream_buffer = cfg.stream_buffer.max(1);
        cfg.notify_queue = cfg.notify_queue.max(1);
        cfg.notify_retries = cfg.notify_retries.max(1);

        cfg
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

fn parse_into<F, T>(lookup: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!("Ignoring unparseable {}={:?}", key, raw),
        }
    }
}
