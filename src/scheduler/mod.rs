//! Scheduler module: decides when checks are due and dispatches one task per
//! (check, agent) pair onto the worker pool.

mod executor;
mod placement;
mod pool;
mod retention;

pub use executor::*;
pub use placement::*;
pub use pool::*;
pub use retention::*;

use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::check::{CheckDefinition, Registry, RegistryEvent};
use crate::db::{CheckResult, DbError, Store};

/// Identity of one execution task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub check_id: i64,
    pub agent_id: i64,
}

/// In-flight tasks keyed by (check, agent). The token is the task's sequence
/// number, so a finished task never clears a newer reservation.
type InFlight = Arc<Mutex<HashMap<TaskKey, (u64, Option<AbortHandle>)>>>;

/// Releases a reservation when the task future completes or is dropped.
struct InFlightGuard {
    in_flight: InFlight,
    key: TaskKey,
    token: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut map = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if map.get(&self.key).is_some_and(|(token, _)| *token == self.token) {
            map.remove(&self.key);
        }
    }
}

pub struct SchedulerConfig {
    pub tick: Duration,
    /// Spread of the random offset applied to every run. Later runs are
    /// additionally limited to `interval - timeout`.
    pub jitter: Duration,
}

/// Shift `base` by a random offset in `[-bound/2, bound/2]`.
fn jittered(base: Instant, bound: Duration, rng: &mut impl Rng) -> Instant {
    let bound_ms = bound.as_millis() as u64;
    if bound_ms == 0 {
        return base;
    }
    let half = bound_ms / 2;
    let offset = rng.gen_range(0..=bound_ms);
    if offset >= half {
        base + Duration::from_millis(offset - half)
    } else {
        base.checked_sub(Duration::from_millis(half - offset)).unwrap_or(base)
    }
}

/// The main scheduler that orchestrates probe execution.
pub struct Scheduler {
    store: Arc<Store>,
    registry: Arc<Registry>,
    executor: Arc<Executor>,
    pool: WorkerPool,
    results: mpsc::Sender<CheckResult>,
    config: SchedulerConfig,
    seq: Arc<AtomicU64>,
    in_flight: InFlight,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<Registry>,
        executor: Arc<Executor>,
        pool: WorkerPool,
        results: mpsc::Sender<CheckResult>,
        config: SchedulerConfig,
    ) -> Result<Self, DbError> {
        // Sequence numbers keep increasing across restarts.
        let next_seq = store.max_result_seq()? + 1;
        Ok(Self {
            store,
            registry,
            executor,
            pool,
            results,
            config,
            seq: Arc::new(AtomicU64::new(next_seq)),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Number of (check, agent) tasks currently queued or running.
    pub fn in_flight(&self) -> usize {
        self.lock_in_flight().len()
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<TaskKey, (u64, Option<AbortHandle>)>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn first_due(&self, now: Instant) -> Instant {
        let jitter_ms = self.config.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return now;
        }
        now + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
    }

    /// Run the tick loop until `stop` fires.
    pub async fn run(self: Arc<Self>, mut stop: broadcast::Receiver<()>) {
        let mut events = self.registry.subscribe();
        let mut due: HashMap<i64, Instant> = HashMap::new();

        let now = Instant::now();
        for def in self.registry.list() {
            if def.enabled {
                due.insert(def.id, self.first_due(now));
            }
        }
        tracing::info!("Starting scheduler with {} enabled checks", due.len());

        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = stop.recv() => {
                    break;
                }
                event = events.recv() => {
                    match event {
                        Ok(event) => self.handle_event(event, &mut due),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!("Scheduler: missed {} registry events, resyncing", n);
                            self.resync(&mut due);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = ticker.tick() => {
                    self.dispatch_due(&mut due, Instant::now());
                }
            }
        }

        self.cancel_all();
        tracing::info!("Scheduler stopped");
    }

    fn handle_event(&self, event: RegistryEvent, due: &mut HashMap<i64, Instant>) {
        match event {
            RegistryEvent::Removed(id) => {
                due.remove(&id);
                self.cancel_check(id);
            }
            RegistryEvent::Upserted(def) if !def.enabled => {
                due.remove(&def.id);
                self.cancel_check(def.id);
            }
            RegistryEvent::Upserted(def) => {
                // New or edited checks run at the next tick.
                due.insert(def.id, Instant::now());
            }
        }
    }

    fn resync(&self, due: &mut HashMap<i64, Instant>) {
        let active: HashMap<i64, Arc<CheckDefinition>> = self
            .registry
            .list()
            .into_iter()
            .filter(|d| d.enabled)
            .map(|d| (d.id, d))
            .collect();
        let gone: Vec<i64> = due.keys().filter(|id| !active.contains_key(id)).copied().collect();
        for id in gone {
            due.remove(&id);
            self.cancel_check(id);
        }
        let now = Instant::now();
        for id in active.keys() {
            due.entry(*id).or_insert(now);
        }
    }

    /// Dispatch every check whose due time has passed.
    fn dispatch_due(&self, due: &mut HashMap<i64, Instant>, now: Instant) {
        let ready: Vec<i64> = due
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, _)| *id)
            .collect();
        if ready.is_empty() {
            return;
        }

        let (agents, regions) = match (self.store.get_agents(), self.store.get_regions()) {
            (Ok(a), Ok(r)) => (a, r),
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!("Scheduler: failed to load agents: {}", e);
                return;
            }
        };

        for id in ready {
            let Some(def) = self.registry.get(id).filter(|d| d.enabled) else {
                due.remove(&id);
                continue;
            };

            let interval = def.interval_duration();
            let bound = self.config.jitter.min(interval.saturating_sub(def.timeout_duration()));
            let previous = due.get(&id).copied().unwrap_or(now);
            let mut next = jittered(previous + interval, bound, &mut rand::thread_rng());
            if next <= now {
                // Fell behind; skip the missed runs.
                next = now + interval;
            }
            due.insert(id, next);

            let targets = placement_agents(&def.placement, &agents, &regions);
            if targets.is_empty() {
                tracing::debug!(check_id = id, "no enabled agents for placement {:?}", def.placement);
            }
            for agent_id in targets {
                self.submit(def.clone(), agent_id);
            }
        }
        tracing::debug!(
            "Scheduler: {} tasks in flight, {} workers busy",
            self.in_flight(),
            self.pool.busy()
        );
    }

    /// Queue one task unless the same (check, agent) is still in flight.
    fn submit(&self, def: Arc<CheckDefinition>, agent_id: i64) -> bool {
        let key = TaskKey {
            check_id: def.id,
            agent_id,
        };
        let token = self.seq.fetch_add(1, Ordering::Relaxed);
        {
            let mut map = self.lock_in_flight();
            if map.contains_key(&key) {
                tracing::debug!(check_id = def.id, agent_id, "previous run still in flight, skipping");
                return false;
            }
            map.insert(key, (token, None));
        }

        let guard = InFlightGuard {
            in_flight: self.in_flight.clone(),
            key,
            token,
        };
        let executor = self.executor.clone();
        let results = self.results.clone();

        let handle = self.pool.spawn(async move {
            let _guard = guard;
            let result = executor.run(def, agent_id, token).await;
            if results.send(result).await.is_err() {
                tracing::error!("Scheduler: result pipeline closed");
            }
        });

        if let Some(entry) = self.lock_in_flight().get_mut(&key) {
            if entry.0 == token {
                entry.1 = Some(handle.abort_handle());
            }
        }
        true
    }

    /// Best-effort cancellation of queued and running tasks of a check.
    fn cancel_check(&self, check_id: i64) {
        let mut map = self.lock_in_flight();
        let keys: Vec<TaskKey> = map.keys().filter(|k| k.check_id == check_id).copied().collect();
        for key in keys {
            if let Some((_, Some(handle))) = map.remove(&key) {
                handle.abort();
            }
        }
        tracing::info!("Scheduler: stopped check {}", check_id);
    }

    fn cancel_all(&self) {
        let mut map = self.lock_in_flight();
        for (_, (_, handle)) in map.drain() {
            if let Some(handle) = handle {
                handle.abort();
            }
        }
    }
}
