//! Live result streams for open check views.
//!
//! Subscriptions are keyed by (check id, check type id). Each key owns a
//! bounded broadcast channel: a subscriber that falls behind loses the oldest
//! events and the publisher never waits.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::check::{CheckDefinition, Registry};
use crate::db::{CheckResult, ResultMeta};
use crate::status::{StatusSnapshot, StatusTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub check_id: i64,
    pub type_id: u8,
}

/// One pushed update, in the dashboard's field names.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamEvent {
    pub time: DateTime<Utc>,
    pub response_time: f64,
    pub status: u8,
    pub name: String,
    pub uptime: f64,
    pub avg_res_time: f64,
    pub interval: u32,
    pub updated_at: DateTime<Utc>,
    pub ssl_expire_date: Option<DateTime<Utc>>,
    pub message: String,
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
    #[serde(rename = "m_download", skip_serializing_if = "Option::is_none")]
    pub download: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_resp_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_resp_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_resp_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packet_loss_percent: Option<f64>,
    #[serde(flatten)]
    pub meta: ResultMeta,
}

impl StreamEvent {
    pub fn new(def: &CheckDefinition, result: &CheckResult, snapshot: Option<&StatusSnapshot>) -> Self {
        let t = &result.timings;
        Self {
            time: result.time,
            response_time: t.response_time.unwrap_or(0.0),
            status: snapshot.map(|s| s.status).unwrap_or(result.status).code(),
            name: def.name.clone(),
            uptime: snapshot.map(|s| s.uptime).unwrap_or(0.0),
            avg_res_time: snapshot.map(|s| s.avg_response_time).unwrap_or(0.0),
            interval: def.interval,
            updated_at: result.ingested_at,
            ssl_expire_date: result.ssl_expire_date,
            message: result.message.clone(),
            name_lookup: t.name_lookup,
            connect: t.connect,
            app_connect: t.app_connect,
            pre_transfer: t.pre_transfer,
            redirect: t.redirect,
            start_transfer: t.start_transfer,
            download: t.download,
            min_resp_time: t.min_resp_time,
            avg_resp_time: t.avg_resp_time,
            max_resp_time: t.max_resp_time,
            packet_loss_percent: t.packet_loss_percent,
            meta: result.meta.clone(),
        }
    }
}

type Topics = HashMap<StreamKey, broadcast::Sender<Arc<StreamEvent>>>;

pub struct StreamPublisher {
    capacity: usize,
    topics: Mutex<Topics>,
}

impl StreamPublisher {
    /// `capacity` is the per-subscriber backlog bound.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: Mutex::new(HashMap::new()),
        }
    }

    fn topics(&self) -> MutexGuard<'_, Topics> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(self: &Arc<Self>, key: StreamKey) -> Subscription {
        let rx = self
            .topics()
            .entry(key)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        tracing::debug!(check_id = key.check_id, "stream subscriber added");
        Subscription {
            key,
            rx: Some(rx),
            publisher: self.clone(),
        }
    }

    /// Whether anyone listens on `key`.
    pub fn is_watched(&self, key: StreamKey) -> bool {
        self.topics().contains_key(&key)
    }

    pub fn subscriber_count(&self, key: StreamKey) -> usize {
        self.topics().get(&key).map_or(0, |tx| tx.receiver_count())
    }

    /// Number of topics with at least one subscriber.
    pub fn topic_count(&self) -> usize {
        self.topics().len()
    }

    /// Push an event to every subscriber of `key`. Never blocks.
    pub fn publish(&self, key: StreamKey, event: StreamEvent) -> usize {
        match self.topics().get(&key) {
            Some(tx) => tx.send(Arc::new(event)).unwrap_or(0),
            None => 0,
        }
    }

    fn release(&self, key: StreamKey) {
        let mut topics = self.topics();
        if topics.get(&key).is_some_and(|tx| tx.receiver_count() == 0) {
            topics.remove(&key);
            tracing::debug!(check_id = key.check_id, "stream topic released");
        }
    }
}

/// A live subscription; dropping it releases its slot.
pub struct Subscription {
    key: StreamKey,
    rx: Option<broadcast::Receiver<Arc<StreamEvent>>>,
    publisher: Arc<StreamPublisher>,
}

impl Subscription {
    /// Next event, skipping over anything lost to backlog trimming.
    /// `None` once the publisher is gone.
    pub async fn next(&mut self) -> Option<Arc<StreamEvent>> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!(
                        check_id = self.key.check_id,
                        "stream subscriber lagged, dropped {} oldest events",
                        n
                    );
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        drop(self.rx.take());
        self.publisher.release(self.key);
    }
}

/// Feed the publisher from the metrics tail until the tail closes.
pub async fn run_forwarder(
    publisher: Arc<StreamPublisher>,
    registry: Arc<Registry>,
    tracker: Arc<StatusTracker>,
    mut tail: broadcast::Receiver<Arc<CheckResult>>,
) {
    loop {
        let result = match tail.recv().await {
            Ok(r) => r,
            Err(RecvError::Lagged(n)) => {
                tracing::warn!("Stream forwarder lagged, skipped {} results", n);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let Some(def) = registry.get(result.check_id) else {
            continue;
        };
        let key = StreamKey {
            check_id: result.check_id,
            type_id: def.kind().type_id(),
        };
        if !publisher.is_watched(key) {
            continue;
        }
        let snapshot = tracker.snapshot(result.check_id);
        publisher.publish(key, StreamEvent::new(&def, &result, snapshot.as_ref()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::{CheckKind, CheckRequest};
    use crate::db::{CheckStatus, Timings};

    fn event(n: u32) -> StreamEvent {
        let def = CheckRequest::parse(CheckKind::Http, br#"{"name":"web","url":"http://x"}"#)
            .unwrap()
            .into_definition(1, None)
            .unwrap();
        let result = CheckResult {
            check_id: 1,
            agent_id: 1,
            seq: n as u64,
            time: Utc::now(),
            ingested_at: Utc::now(),
            status: CheckStatus::Up,
            timings: Timings {
                response_time: Some(n as f64),
                download: Some(1.0),
                ..Default::default()
            },
            message: String::new(),
            ssl_expire_date: None,
            meta: Default::default(),
        };
        StreamEvent::new(&def, &result, None)
    }

    const KEY: StreamKey = StreamKey {
        check_id: 1,
        type_id: 2,
    };

    #[test]
    fn test_event_field_names() {
        let json = serde_json::to_value(event(3)).unwrap();
        assert_eq!(json["m_download"], 1.0);
        assert_eq!(json["response_time"], 3.0);
        assert_eq!(json["status"], 1);
        assert_eq!(json["name"], "web");
        assert!(json.get("connect").is_none());
        assert!(json.get("status_code").is_none());

        let mut e = event(1);
        e.meta.status_code = Some(503);
        e.meta.answers = vec!["10.0.0.1".to_string()];
        let json = serde_json::to_value(e).unwrap();
        assert_eq!(json["status_code"], 503);
        assert_eq!(json["answers"][0], "10.0.0.1");
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let publisher = Arc::new(StreamPublisher::new(4));
        let mut sub = publisher.subscribe(KEY);

        for n in 0..20 {
            assert_eq!(publisher.publish(KEY, event(n)), 1);
        }

        let mut seen = Vec::new();
        while let Ok(Some(e)) =
            tokio::time::timeout(std::time::Duration::from_millis(50), sub.next()).await
        {
            seen.push(e.response_time as u32);
        }
        assert_eq!(seen, vec![16, 17, 18, 19]);
    }

    #[tokio::test]
    async fn test_drop_releases_topic() {
        let publisher = Arc::new(StreamPublisher::new(8));
        let a = publisher.subscribe(KEY);
        let b = publisher.subscribe(KEY);
        assert_eq!(publisher.subscriber_count(KEY), 2);

        drop(a);
        assert!(publisher.is_watched(KEY));
        drop(b);
        assert!(!publisher.is_watched(KEY));
        assert_eq!(publisher.topic_count(), 0);
        assert_eq!(publisher.publish(KEY, event(1)), 0);
    }
}
