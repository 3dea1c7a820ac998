//! Retention manager for cleaning up old results.

use crate::db::Store;

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Manager for deleting results and alert history past the retention period.
pub struct RetentionManager {
    store: Arc<Store>,
    retention_days: i64,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl RetentionManager {
    pub fn new(store: Arc<Store>, retention_days: i64) -> Self {
        Self {
            store,
            retention_days,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the retention manager background task.
    pub fn start(&self) {
        let store = self.store.clone();
        let stop = self.stop.clone();
        let retention_days = self.retention_days;

        tokio::spawn(async move {
            let (tx, _) = tokio::sync::broadcast::channel(1);
            {
                let mut stop_guard = stop.lock().await;
                *stop_guard = Some(tx.clone());
            }

            let mut rx = tx.subscribe();
            let mut interval = tokio::time::interval(Duration::from_secs(60));

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        process_retention(&store, retention_days);
                    }
                }
            }
        });
    }

    /// Stop the retention manager.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }
}

/// Delete results and alerts older than `retention_days`. Returns the
/// number of results removed.
fn process_retention(store: &Store, retention_days: i64) -> usize {
    let Some(cutoff) = ChronoDuration::try_days(retention_days)
        .and_then(|d| Utc::now().checked_sub_signed(d))
    else {
        tracing::warn!("RetentionManager: retention of {} days is out of range", retention_days);
        return 0;
    };

    match store.delete_alerts_before(cutoff) {
        Ok(0) => {}
        Ok(n) => tracing::info!("RetentionManager: deleted {} alerts older than {}", n, cutoff),
        Err(e) => tracing::error!("RetentionManager: failed to delete old alerts: {}", e),
    }

    match store.delete_results_before(cutoff) {
        Ok(0) => 0,
        Ok(n) => {
            tracing::info!("RetentionManager: deleted {} results older than {}", n, cutoff);
            n
        }
        Err(e) => {
            tracing::error!("RetentionManager: failed to delete old results: {}", e);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CheckResult, CheckStatus, Timings};
    use tempfile::NamedTempFile;

    fn result(seq: u64, days_ago: i64) -> CheckResult {
        let time = Utc::now() - ChronoDuration::days(days_ago);
        CheckResult {
            check_id: 1,
            agent_id: 1,
            seq,
            time,
            ingested_at: time,
            status: CheckStatus::Up,
            timings: Timings::default(),
            message: String::new(),
            ssl_expire_date: None,
            meta: Default::default(),
        }
    }

    #[test]
    fn test_process_retention() {
        let file = NamedTempFile::new().unwrap();
        let store = Store::new(file.path()).unwrap();
        store
            .add_results(&[result(1, 40), result(2, 31), result(3, 1)])
            .unwrap();

        assert_eq!(process_retention(&store, 30), 2);
        assert_eq!(process_retention(&store, 30), 0);
        assert_eq!(store.recent_results(1, 10).unwrap().len(), 1);
        assert_eq!(process_retention(&store, i64::MAX), 0);
    }
}
