//! Runs one (check, agent) task through its probe driver and normalizes the
//! outcome into a [`CheckResult`].

use chrono::Utc;
use futures_util::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use crate::check::{CheckDefinition, CheckKind};
use crate::db::{CheckResult, CheckStatus, ResultMeta, Timings};
use crate::probe::{ProbeDriver, ProbeError, ProbeOutcome};

/// Slack on top of the check timeout before the executor gives up on a
/// driver that ignores its own deadline.
const TIMEOUT_GRACE: Duration = Duration::from_millis(500);

pub struct Executor {
    drivers: HashMap<CheckKind, Arc<dyn ProbeDriver>>,
}

/// Normalized outcome of a single attempt.
struct Attempt {
    status: CheckStatus,
    timings: Timings,
    message: String,
    ssl_expire_date: Option<chrono::DateTime<Utc>>,
    meta: ResultMeta,
}

impl Executor {
    pub fn new(drivers: Vec<Arc<dyn ProbeDriver>>) -> Self {
        let drivers = drivers.into_iter().map(|d| (d.kind(), d)).collect();
        Self { drivers }
    }

    /// Execute with retries; the last attempt is authoritative. Always
    /// yields exactly one result.
    pub async fn run(&self, def: Arc<CheckDefinition>, agent_id: i64, seq: u64) -> CheckResult {
        let started = Utc::now();
        let attempts = def.retries + 1;

        let mut attempt = self.attempt(&def).await;
        for n in 1..attempts {
            if attempt.status != CheckStatus::Down {
                break;
            }
            tracing::debug!(
                check_id = def.id,
                agent_id,
                "attempt {} of {} failed: {}",
                n,
                attempts,
                attempt.message
            );
            attempt = self.attempt(&def).await;
        }

        if attempt.status == CheckStatus::Down {
            tracing::debug!(check_id = def.id, agent_id, "probe failed: {}", attempt.message);
        }

        CheckResult {
            check_id: def.id,
            agent_id,
            seq,
            time: started,
            ingested_at: started,
            status: attempt.status,
            timings: attempt.timings,
            message: attempt.message,
            ssl_expire_date: attempt.ssl_expire_date,
            meta: attempt.meta,
        }
    }

    async fn attempt(&self, def: &Arc<CheckDefinition>) -> Attempt {
        let Some(driver) = self.drivers.get(&def.kind()).cloned() else {
            return Attempt::unknown(format!("no probe driver for {}", def.kind()));
        };

        let timeout = def.timeout_duration();
        // The driver runs inside this task, so cancelling the task stops the
        // probe and frees its worker. Panics surface as an error here.
        let probe = AssertUnwindSafe(driver.execute(def.as_ref(), timeout)).catch_unwind();

        match tokio::time::timeout(timeout + TIMEOUT_GRACE, probe).await {
            Ok(Ok(result)) => Attempt::from_probe(def.kind(), result),
            Ok(Err(_)) => {
                tracing::error!(check_id = def.id, "probe driver panicked");
                Attempt::unknown("probe driver panicked".to_string())
            }
            Err(_) => Attempt::down(ProbeError::Timeout(timeout).to_string()),
        }
    }
}

impl Attempt {
    fn unknown(message: String) -> Self {
        Self {
            status: CheckStatus::Unknown,
            timings: Timings::default(),
            message,
            ssl_expire_date: None,
            meta: ResultMeta::default(),
        }
    }

    fn down(message: String) -> Self {
        Self {
            status: CheckStatus::Down,
            ..Self::unknown(message)
        }
    }

    fn from_probe(kind: CheckKind, result: Result<ProbeOutcome, ProbeError>) -> Self {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) if e.is_internal() => return Self::unknown(e.to_string()),
            Err(e) => return Self::down(e.to_string()),
        };

        let status = match (outcome.success, outcome.degraded) {
            (false, _) => CheckStatus::Down,
            (true, false) => CheckStatus::Up,
            (true, true) if kind == CheckKind::Ping => CheckStatus::Degraded,
            (true, true) => CheckStatus::Warn,
        };
        Self {
            status,
            timings: outcome.timings,
            message: outcome.message,
            ssl_expire_date: outcome.meta.ssl_expire_date,
            meta: ResultMeta {
                status_code: outcome.meta.status_code,
                answers: outcome.meta.answers,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::CheckRequest;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails `fail_first` times, then succeeds.
    struct Flaky {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl ProbeDriver for Flaky {
        fn kind(&self) -> CheckKind {
            CheckKind::Tcp
        }

        async fn execute(
            &self,
            _def: &CheckDefinition,
            _timeout: Duration,
        ) -> Result<ProbeOutcome, ProbeError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(ProbeError::Refused("nope".to_string()))
            } else {
                Ok(ProbeOutcome::ok(Timings {
                    response_time: Some(1.5),
                    ..Default::default()
                }))
            }
        }
    }

    struct Stuck;

    #[async_trait]
    impl ProbeDriver for Stuck {
        fn kind(&self) -> CheckKind {
            CheckKind::Tcp
        }

        async fn execute(
            &self,
            _def: &CheckDefinition,
            _timeout: Duration,
        ) -> Result<ProbeOutcome, ProbeError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ProbeOutcome::default())
        }
    }

    struct Panics;

    #[async_trait]
    impl ProbeDriver for Panics {
        fn kind(&self) -> CheckKind {
            CheckKind::Tcp
        }

        async fn execute(
            &self,
            _def: &CheckDefinition,
            _timeout: Duration,
        ) -> Result<ProbeOutcome, ProbeError> {
            panic!("driver bug");
        }
    }

    fn tcp_def(retries: u32) -> Arc<CheckDefinition> {
        let body = format!(
            r#"{{"name":"t","ip":"127.0.0.1","port":80,"timeout":1,"retries":{}}}"#,
            retries
        );
        Arc::new(
            CheckRequest::parse(CheckKind::Tcp, body.as_bytes())
                .unwrap()
                .into_definition(7, None)
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let driver = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            fail_first: 2,
        });
        let executor = Executor::new(vec![driver.clone() as Arc<dyn ProbeDriver>]);
        let result = executor.run(tcp_def(3), 1, 42).await;
        assert_eq!(result.status, CheckStatus::Up);
        assert_eq!(result.seq, 42);
        assert_eq!(result.timings.response_time, Some(1.5));
        assert_eq!(driver.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_final_attempt_is_authoritative() {
        let driver = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            fail_first: 10,
        });
        let executor = Executor::new(vec![driver.clone() as Arc<dyn ProbeDriver>]);
        let result = executor.run(tcp_def(1), 1, 1).await;
        assert_eq!(result.status, CheckStatus::Down);
        assert!(result.message.contains("refused"));
        assert_eq!(driver.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stuck_driver_times_out() {
        let executor = Executor::new(vec![Arc::new(Stuck) as Arc<dyn ProbeDriver>]);
        let result = executor.run(tcp_def(0), 1, 1).await;
        assert_eq!(result.status, CheckStatus::Down);
        assert!(result.message.contains("timed out"));
    }

    /// Sleeps, counting runs that started and runs that finished.
    struct Counted {
        started: AtomicU32,
        finished: AtomicU32,
    }

    #[async_trait]
    impl ProbeDriver for Counted {
        fn kind(&self) -> CheckKind {
            CheckKind::Tcp
        }

        async fn execute(
            &self,
            _def: &CheckDefinition,
            _timeout: Duration,
        ) -> Result<ProbeOutcome, ProbeError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(300)).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            let mut outcome = ProbeOutcome::ok(Timings::default());
            outcome.meta.status_code = Some(204);
            Ok(outcome)
        }
    }

    #[tokio::test]
    async fn test_cancelled_task_stops_probe() {
        let driver = Arc::new(Counted {
            started: AtomicU32::new(0),
            finished: AtomicU32::new(0),
        });
        let executor = Arc::new(Executor::new(vec![driver.clone() as Arc<dyn ProbeDriver>]));
        let pool = crate::scheduler::WorkerPool::new(1);

        let task = {
            let executor = executor.clone();
            pool.spawn(async move {
                executor.run(tcp_def(0), 1, 1).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(driver.started.load(Ordering::SeqCst), 1);
        assert_eq!(pool.busy(), 1);

        task.abort();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(driver.finished.load(Ordering::SeqCst), 0);
        assert_eq!(pool.busy(), 0);

        // Uncancelled runs carry the driver's metadata.
        let result = executor.run(tcp_def(0), 1, 2).await;
        assert_eq!(result.meta.status_code, Some(204));
        assert_eq!(driver.finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panic_maps_to_unknown() {
        let executor = Executor::new(vec![Arc::new(Panics) as Arc<dyn ProbeDriver>]);
        let result = executor.run(tcp_def(2), 1, 1).await;
        assert_eq!(result.status, CheckStatus::Unknown);
    }

    #[tokio::test]
    async fn test_missing_driver_is_unknown() {
        let executor = Executor::new(Vec::new());
        let result = executor.run(tcp_def(0), 3, 9).await;
        assert_eq!(result.status, CheckStatus::Unknown);
        assert_eq!(result.agent_id, 3);
    }

    #[test]
    fn test_degraded_mapping() {
        let mut outcome = ProbeOutcome::ok(Timings::default());
        outcome.degraded = true;
        assert_eq!(
            Attempt::from_probe(CheckKind::Ping, Ok(outcome.clone())).status,
            CheckStatus::Degraded
        );
        assert_eq!(
            Attempt::from_probe(CheckKind::Http, Ok(outcome)).status,
            CheckStatus::Warn
        );
        assert_eq!(
            Attempt::from_probe(CheckKind::Http, Err(ProbeError::Config("bad".into()))).status,
            CheckStatus::Unknown
        );
    }
}
