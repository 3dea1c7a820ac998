//! Probe module for synthetic checks.
//!
//! One driver per check kind: TCP, HTTP, SMTP, ping, DNS and RabbitMQ.

mod dns;
mod http;
mod ping;
mod rabbitmq;
mod smtp;
mod tcp;
pub mod tls;

pub use dns::*;
pub use http::*;
pub use ping::*;
pub use rabbitmq::*;
pub use smtp::*;
pub use tcp::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;

use crate::check::{CheckDefinition, CheckKind};
use crate::db::Timings;

/// Probe error types.
///
/// Timeout, refusal and resolution failures stay distinct so alerts can say
/// which one happened.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("name resolution failed: {0}")]
    Resolve(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("tls error: {0}")]
    Tls(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("command failed: {0}")]
    Command(String),
}

impl ProbeError {
    pub fn from_io(e: io::Error, timeout: Duration) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionRefused => Self::Refused(e.to_string()),
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout(timeout),
            _ => Self::Network(e.to_string()),
        }
    }

    /// Failures of the engine itself rather than of the target.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

/// Metadata a driver captured besides timings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeMeta {
    pub ssl_expire_date: Option<DateTime<Utc>>,
    pub status_code: Option<u16>,
    pub answers: Vec<String>,
}

/// Outcome of one completed attempt.
///
/// `success == false` means the target answered but an assertion failed.
/// Transport failures are returned as [`ProbeError`] instead.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeOutcome {
    pub success: bool,
    /// Reachable but not healthy: certificate near expiry or partial loss.
    pub degraded: bool,
    pub timings: Timings,
    pub message: String,
    pub meta: ProbeMeta,
}

impl ProbeOutcome {
    pub fn ok(timings: Timings) -> Self {
        Self {
            success: true,
            timings,
            ..Default::default()
        }
    }

    pub fn failed(timings: Timings, message: impl Into<String>) -> Self {
        Self {
            success: false,
            timings,
            message: message.into(),
            ..Default::default()
        }
    }

    /// A certificate past `notAfter` fails the attempt; one expiring within
    /// `warning_days` degrades it.
    pub fn check_certificate(&mut self, warning_days: i64) {
        let Some(expires) = self.meta.ssl_expire_date else {
            return;
        };
        let now = Utc::now();
        if expires <= now {
            self.success = false;
            self.message = format!("certificate expired at {}", expires.format("%Y-%m-%d"));
        } else if expires - now <= chrono::Duration::days(warning_days) {
            self.degraded = true;
            self.message = format!("certificate expires in {} days", (expires - now).num_days());
        }
    }
}

/// Certificate warning window for protocols without a per-check setting.
pub const DEFAULT_CERT_WARNING_DAYS: i64 = 14;

/// Executes one attempt of a check of a single kind.
#[async_trait]
pub trait ProbeDriver: Send + Sync {
    fn kind(&self) -> CheckKind;

    /// Must give up once `timeout` has elapsed.
    async fn execute(
        &self,
        def: &CheckDefinition,
        timeout: Duration,
    ) -> Result<ProbeOutcome, ProbeError>;
}

/// One driver per kind.
pub fn default_drivers(ping_loss_threshold: f64) -> Vec<Arc<dyn ProbeDriver>> {
    vec![
        Arc::new(TcpDriver),
        Arc::new(HttpDriver),
        Arc::new(SmtpDriver),
        Arc::new(PingDriver::new(ping_loss_threshold)),
        Arc::new(DnsDriver),
        Arc::new(RabbitDriver),
    ]
}

/// Time budget shared by the phases of one attempt.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start: Instant,
    timeout: Duration,
}

impl Deadline {
    pub fn new(timeout: Duration) -> Self {
        Self {
            start: Instant::now(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Milliseconds since the attempt started.
    pub fn elapsed_ms(&self) -> f64 {
        ms(self.start.elapsed())
    }

    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.start.elapsed())
    }

    /// Run a phase, failing with [`ProbeError::Timeout`] once the budget is spent.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, ProbeError>
    where
        F: Future<Output = Result<T, ProbeError>>,
    {
        match tokio::time::timeout(self.remaining(), fut).await {
            Ok(r) => r,
            Err(_) => Err(ProbeError::Timeout(self.timeout)),
        }
    }
}

pub fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Resolve `host` to one socket address, preferring the first answer.
pub async fn resolve_host(host: &str, port: u16, deadline: &Deadline) -> Result<SocketAddr, ProbeError> {
    let host = host.trim().trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let lookup = async {
        tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| ProbeError::Resolve(format!("{}: {}", host, e)))?
            .next()
            .ok_or_else(|| ProbeError::Resolve(format!("no addresses found for {}", host)))
    };
    deadline.run(lookup).await
}

pub async fn connect_tcp(addr: SocketAddr, deadline: &Deadline) -> Result<TcpStream, ProbeError> {
    let timeout = deadline.timeout();
    deadline
        .run(async move {
            TcpStream::connect(addr)
                .await
                .map_err(|e| ProbeError::from_io(e, timeout))
        })
        .await
}
