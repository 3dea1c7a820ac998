//! Metrics store: append-only result samples with batched persistence, range
//! queries and a live tail.

mod query;

pub use query::*;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use crate::check::CheckKind;
use crate::db::{CheckResult, DbError, Store};

/// Flush once this many rows are buffered.
const FLUSH_ROWS: usize = 500;
/// Flush at least this often.
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

pub struct MetricsStore {
    store: Arc<Store>,
    writer: mpsc::Sender<CheckResult>,
    tail: broadcast::Sender<Arc<CheckResult>>,
}

impl MetricsStore {
    /// Create the store and start its batch writer.
    pub fn new(store: Arc<Store>, tail_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(1000);
        let (tail, _) = broadcast::channel(tail_capacity.max(1));

        // Start batch writer in a separate task
        tokio::spawn(run_batch_writer(rx, store.clone()));

        Self {
            store,
            writer: tx,
            tail,
        }
    }

    /// Queue a result for persistence and publish it on the live tail.
    pub async fn append(&self, result: CheckResult) {
        let shared = Arc::new(result.clone());
        if self.writer.send(result).await.is_err() {
            tracing::error!("MetricsStore: batch writer is gone, result dropped");
        }
        // No subscribers is fine.
        let _ = self.tail.send(shared);
    }

    pub fn subscribe_tail(&self) -> broadcast::Receiver<Arc<CheckResult>> {
        self.tail.subscribe()
    }

    /// Chart data for one check. `Latest` returns the newest `window` raw
    /// samples, oldest first.
    pub fn query(
        &self,
        check_id: i64,
        kind: CheckKind,
        range: &RangeQuery,
        window: usize,
    ) -> Result<ChartData, DbError> {
        match range {
            RangeQuery::Latest => {
                let mut results = self.store.recent_results(check_id, window)?;
                results.reverse();
                Ok(ChartData::raw(kind, &results))
            }
            RangeQuery::Bucketed { step, start, end } => {
                let results = self.store.results_between(check_id, *start, *end)?;
                Ok(ChartData::bucketed(kind, &results, *step))
            }
        }
    }
}

/// Run the batch writer that accumulates and flushes results.
async fn run_batch_writer(mut rx: mpsc::Receiver<CheckResult>, store: Arc<Store>) {
    let mut buffer: Vec<CheckResult> = Vec::with_capacity(100);
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Some(r) => {
                        buffer.push(r);
                        if buffer.len() >= FLUSH_ROWS {
                            flush_buffer(&store, &mut buffer);
                        }
                    }
                    None => {
                        // Channel closed, flush remaining and exit
                        flush_buffer(&store, &mut buffer);
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                flush_buffer(&store, &mut buffer);
            }
        }
    }
}

fn flush_buffer(store: &Store, buffer: &mut Vec<CheckResult>) {
    if buffer.is_empty() {
        return;
    }

    if let Err(e) = store.add_results(buffer) {
        tracing::error!("Failed to flush {} results: {}", buffer.len(), e);
    }

    buffer.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CheckStatus, Timings};
    use chrono::Utc;
    use tempfile::NamedTempFile;

    fn result(seq: u64) -> CheckResult {
        CheckResult {
            check_id: 1,
            agent_id: 1,
            seq,
            time: Utc::now(),
            ingested_at: Utc::now(),
            status: CheckStatus::Up,
            timings: Timings {
                response_time: Some(seq as f64),
                ..Default::default()
            },
            message: String::new(),
            ssl_expire_date: None,
            meta: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_append_tails_and_persists() {
        let file = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(file.path()).unwrap());
        let metrics = MetricsStore::new(store.clone(), 16);
        let mut tail = metrics.subscribe_tail();

        for seq in 1..=3 {
            metrics.append(result(seq)).await;
        }
        assert_eq!(tail.recv().await.unwrap().seq, 1);

        // The writer flushes on its interval.
        tokio::time::sleep(FLUSH_INTERVAL + Duration::from_millis(500)).await;
        let chart = metrics
            .query(1, CheckKind::Tcp, &RangeQuery::Latest, 40)
            .unwrap();
        assert_eq!(chart.series["response_time"], "1,2,3,");
    }
}
