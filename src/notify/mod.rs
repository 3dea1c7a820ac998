//! Alerting on status transitions.
//!
//! The pipeline hands alerts to [`Notifier::notify`], which never waits: a
//! full queue drops the alert with a warning. The [`Dispatcher`] drains the
//! queue, records each alert in the alert history and delivers to every
//! routed channel in its own task, retrying a bounded number of times.

pub mod senders;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::check::{CheckDefinition, CheckKind};
use crate::db::{AlertRecord, CheckStatus, DbError, Store};
use crate::status::Transition;
use senders::{SenderError, SenderMap};

/// Infrastructure noise that never reaches an alert.
const TRANSIENT_ERRORS: &[&str] = &["database is locked"];

/// A transition worth telling someone about.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub check_id: i64,
    pub check_name: String,
    pub kind: CheckKind,
    pub agent_id: i64,
    pub agent_name: String,
    pub from: CheckStatus,
    pub to: CheckStatus,
    pub at: DateTime<Utc>,
    pub message: String,
    pub runbook: Option<String>,
    pub priority: String,
    pub channels: Vec<i64>,
}

impl Alert {
    pub fn new(def: &CheckDefinition, transition: &Transition, agent_name: String) -> Self {
        Self {
            check_id: def.id,
            check_name: def.name.clone(),
            kind: def.kind(),
            agent_id: transition.agent_id,
            agent_name,
            from: transition.from,
            to: transition.to,
            at: transition.at,
            message: transition.message.clone(),
            runbook: def.runbook.clone(),
            priority: def.priority.clone(),
            channels: def.channels.channel_ids(),
        }
    }

    /// The alert as kept in the history table.
    pub fn record(&self) -> AlertRecord {
        AlertRecord {
            id: 0,
            check_id: self.check_id,
            agent_id: self.agent_id,
            agent_name: self.agent_name.clone(),
            from: self.from,
            to: self.to,
            at: self.at,
            message: self.message.clone(),
        }
    }

    /// One-line summary, e.g. `web is DOWN`.
    pub fn headline(&self) -> String {
        format!(
            "{} is {}",
            self.check_name,
            self.to.as_str().to_ascii_uppercase()
        )
    }

    pub fn body(&self) -> String {
        let mut lines = vec![
            format!("Check: {} ({})", self.check_name, self.kind),
            format!("Status: {} (was {})", self.to, self.from),
            format!("Agent: {}", self.agent_name),
            format!("Time: {}", self.at.format("%Y-%m-%d %H:%M:%S UTC")),
        ];
        if !self.message.is_empty() {
            lines.push(format!("Message: {}", self.message));
        }
        if let Some(runbook) = self.runbook.as_deref().filter(|r| !r.is_empty()) {
            lines.push(format!("Runbook: {}", runbook));
        }
        lines.join("\n")
    }
}

/// Which transitions page someone: any failure, recovery from a failure,
/// and a healthy check turning warn or degraded.
pub fn should_notify(from: CheckStatus, to: CheckStatus) -> bool {
    use CheckStatus::*;
    match (from, to) {
        (Down, Down) => false,
        (_, Down) => true,
        (Down, Up | Warn | Degraded) => true,
        (Up, Warn | Degraded) => true,
        _ => false,
    }
}

pub fn is_transient_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    TRANSIENT_ERRORS.iter().any(|e| lower.contains(e))
}

/// Non-blocking handle to the delivery queue.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<Alert>,
}

impl Notifier {
    /// Create the handle and the receiving end for a [`Dispatcher`].
    pub fn channel(queue: usize) -> (Self, mpsc::Receiver<Alert>) {
        let (tx, rx) = mpsc::channel(queue.max(1));
        (Self { tx }, rx)
    }

    /// Queue an alert unless the rules filter it. Returns whether it was
    /// queued.
    pub fn notify(&self, alert: Alert) -> bool {
        if !should_notify(alert.from, alert.to) {
            return false;
        }
        if is_transient_error(&alert.message) {
            tracing::debug!(check_id = alert.check_id, "suppressing transient error alert");
            return false;
        }
        match self.tx.try_send(alert) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(alert)) => {
                tracing::warn!(
                    check_id = alert.check_id,
                    "notification queue full, dropping alert"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(alert)) => {
                tracing::error!(check_id = alert.check_id, "notification dispatcher is gone");
                false
            }
        }
    }
}

pub struct Dispatcher {
    store: Arc<Store>,
    senders: Arc<SenderMap>,
    attempts: u32,
    backoff: Duration,
}

impl Dispatcher {
    pub fn new(store: Arc<Store>, senders: SenderMap, attempts: u32) -> Self {
        Self {
            store,
            senders: Arc::new(senders),
            attempts: attempts.max(1),
            backoff: Duration::from_secs(1),
        }
    }

    /// Base delay between attempts, doubled after each failure.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Drain the queue until every [`Notifier`] is dropped.
    pub async fn run(self, mut rx: mpsc::Receiver<Alert>) {
        while let Some(alert) = rx.recv().await {
            tracing::info!(
                check_id = alert.check_id,
                agent_id = alert.agent_id,
                "{} -> {}: notifying {} channel(s)",
                alert.from,
                alert.to,
                alert.channels.len()
            );
            if let Err(e) = self.store.add_alert(&mut alert.record()) {
                tracing::error!(check_id = alert.check_id, "failed to record alert: {}", e);
            }
            let alert = Arc::new(alert);
            for &channel_id in &alert.channels {
                let channel = match self.store.get_channel(channel_id) {
                    Ok(c) => c,
                    Err(DbError::NotFound) => {
                        tracing::warn!(channel_id, "alert routed to missing channel");
                        continue;
                    }
                    Err(e) => {
                        tracing::error!(channel_id, "failed to load channel: {}", e);
                        continue;
                    }
                };
                let Some(sender) = self.senders.get(&channel.config.kind()).cloned() else {
                    tracing::warn!(channel_id, "no sender for {}", channel.config.kind().as_str());
                    continue;
                };
                let alert = alert.clone();
                let (attempts, backoff) = (self.attempts, self.backoff);
                tokio::spawn(async move {
                    deliver(sender.as_ref(), channel_id, &channel.config, &alert, attempts, backoff)
                        .await;
                });
            }
        }
    }
}

/// Bounded retry of one delivery. Returns whether it went through.
async fn deliver(
    sender: &dyn senders::ChannelSender,
    channel_id: i64,
    config: &crate::db::ChannelConfig,
    alert: &Alert,
    attempts: u32,
    backoff: Duration,
) -> bool {
    let mut delay = backoff;
    for attempt in 1..=attempts {
        match sender.send(config, alert).await {
            Ok(()) => {
                tracing::debug!(channel_id, check_id = alert.check_id, "alert delivered");
                return true;
            }
            Err(e) if e.is_permanent() || attempt == attempts => {
                log_dropped(channel_id, alert, attempt, &e);
                return false;
            }
            Err(e) => {
                tracing::warn!(
                    channel_id,
                    check_id = alert.check_id,
                    "delivery attempt {}/{} failed: {}",
                    attempt,
                    attempts,
                    e
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }
    false
}

fn log_dropped(channel_id: i64, alert: &Alert, attempt: u32, e: &SenderError) {
    tracing::error!(
        channel_id,
        check_id = alert.check_id,
        "dropping alert after {} attempt(s): {}",
        attempt,
        e
    );
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::{Channel, ChannelConfig, ChannelKind};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::NamedTempFile;

    pub(crate) fn alert() -> Alert {
        Alert {
            check_id: 7,
            check_name: "web".to_string(),
            kind: CheckKind::Http,
            agent_id: 1,
            agent_name: "local".to_string(),
            from: CheckStatus::Up,
            to: CheckStatus::Down,
            at: Utc::now(),
            message: "connection refused".to_string(),
            runbook: Some("https://wiki.example/web".to_string()),
            priority: "critical".to_string(),
            channels: vec![1],
        }
    }

    #[test]
    fn test_notification_rules() {
        use CheckStatus::*;
        assert!(should_notify(Up, Down));
        assert!(should_notify(Unknown, Down));
        assert!(should_notify(Down, Up));
        assert!(should_notify(Up, Warn));
        assert!(should_notify(Up, Degraded));
        assert!(!should_notify(Unknown, Up));
        assert!(!should_notify(Down, Down));
        assert!(!should_notify(Warn, Up));
    }

    #[test]
    fn test_alert_text() {
        let a = alert();
        assert_eq!(a.headline(), "web is DOWN");
        let body = a.body();
        assert!(body.contains("Status: down (was up)"));
        assert!(body.contains("Agent: local"));
        assert!(body.contains("Runbook: https://wiki.example/web"));
    }

    #[test]
    fn test_transient_errors_suppressed() {
        let (notifier, mut rx) = Notifier::channel(4);
        let mut a = alert();
        a.message = "Database is locked".to_string();
        assert!(!notifier.notify(a));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let (notifier, mut rx) = Notifier::channel(2);
        assert!(notifier.notify(alert()));
        assert!(notifier.notify(alert()));
        assert!(!notifier.notify(alert()));
        assert!(rx.try_recv().is_ok());
        assert!(notifier.notify(alert()));
    }

    /// Fails the first `failures` sends.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl senders::ChannelSender for Flaky {
        async fn send(&self, _: &ChannelConfig, _: &Alert) -> Result<(), SenderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(SenderError::SendFailed(format!("attempt {}", n)))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_bounded_retry() {
        let config = ChannelConfig::Slack {
            webhook_url: "http://x".to_string(),
        };
        let flaky = Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
        };
        assert!(deliver(&flaky, 1, &config, &alert(), 3, Duration::from_millis(1)).await);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);

        let broken = Flaky {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        };
        assert!(!deliver(&broken, 1, &config, &alert(), 3, Duration::from_millis(1)).await);
        assert_eq!(broken.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_broken_channel_does_not_block_others() {
        let file = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(file.path()).unwrap());
        let mut slack = Channel {
            id: 0,
            name: "broken".to_string(),
            config: ChannelConfig::Slack {
                webhook_url: "http://x".to_string(),
            },
        };
        let mut tg = Channel {
            id: 0,
            name: "ok".to_string(),
            config: ChannelConfig::Telegram {
                token: "t".to_string(),
                chat_id: "c".to_string(),
            },
        };
        let slack_id = store.add_channel(&mut slack).unwrap();
        let tg_id = store.add_channel(&mut tg).unwrap();

        let broken = Arc::new(Flaky {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let healthy = Arc::new(Flaky {
            failures: 0,
            calls: AtomicU32::new(0),
        });
        let mut map = SenderMap::new();
        map.insert(ChannelKind::Slack, broken.clone() as Arc<dyn senders::ChannelSender>);
        map.insert(ChannelKind::Telegram, healthy.clone() as Arc<dyn senders::ChannelSender>);

        let (notifier, rx) = Notifier::channel(8);
        let dispatcher = Dispatcher::new(store, map, 2).with_backoff(Duration::from_millis(5));
        tokio::spawn(dispatcher.run(rx));

        let mut a = alert();
        a.channels = vec![slack_id, tg_id, 999];
        assert!(notifier.notify(a));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(healthy.calls.load(Ordering::SeqCst), 1);
        assert_eq!(broken.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_every_alert_is_recorded() {
        let file = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(file.path()).unwrap());
        let (notifier, rx) = Notifier::channel(8);
        let dispatcher = Dispatcher::new(store.clone(), SenderMap::new(), 1);
        let handle = tokio::spawn(dispatcher.run(rx));

        let mut routed_nowhere = alert();
        routed_nowhere.channels.clear();
        assert!(notifier.notify(routed_nowhere));
        let mut recovered = alert();
        recovered.from = CheckStatus::Down;
        recovered.to = CheckStatus::Up;
        recovered.at = Utc::now() + chrono::Duration::seconds(1);
        assert!(notifier.notify(recovered));
        drop(notifier);
        handle.await.unwrap();

        let history = store.alerts_for_check(7, 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!((history[0].from, history[0].to), (CheckStatus::Down, CheckStatus::Up));
        assert_eq!(history[1].message, "connection refused");
        assert_eq!(history[1].agent_name, "local");
    }
}
