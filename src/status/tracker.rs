//! Per-check status state machine with a bounded rolling history.
//!
//! Each (check, agent) key keeps the last `window` results. A key turns
//! down only after `threshold_timeout` consecutive failures and recovers on
//! the first success. The check status is the worst status across its
//! agents.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::check::Registry;
use crate::db::{Agent, CheckResult, CheckStatus, Region};
use crate::scheduler::placement_agents;

const SHARDS: usize = 16;

/// What the tracker keeps of one result.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub seq: u64,
    pub status: CheckStatus,
    pub time: DateTime<Utc>,
    pub response_time: Option<f64>,
    pub message: String,
}

impl From<&CheckResult> for Sample {
    fn from(r: &CheckResult) -> Self {
        Self {
            seq: r.seq,
            status: r.status,
            time: r.ingested_at,
            response_time: r.timings.response_time,
            message: r.message.clone(),
        }
    }
}

/// A change of a check's aggregate status.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub check_id: i64,
    /// Agent whose result caused the change.
    pub agent_id: i64,
    pub from: CheckStatus,
    pub to: CheckStatus,
    pub at: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Default)]
struct KeyState {
    history: VecDeque<Sample>,
    last_seq: Option<u64>,
    status: Option<CheckStatus>,
}

#[derive(Debug)]
struct CheckState {
    agents: HashMap<i64, KeyState>,
    /// Agents the check currently runs on, once known. Results from other
    /// agents are ignored.
    placed: Option<HashSet<i64>>,
    status: CheckStatus,
    since: DateTime<Utc>,
}

impl CheckState {
    fn new() -> Self {
        Self {
            agents: HashMap::new(),
            placed: None,
            status: CheckStatus::Unknown,
            since: Utc::now(),
        }
    }

    fn is_placed(&self, agent_id: i64) -> bool {
        self.placed.as_ref().map_or(true, |p| p.contains(&agent_id))
    }

    fn aggregate(&self) -> CheckStatus {
        self.agents
            .values()
            .filter_map(|k| k.status)
            .max_by_key(|s| s.severity())
            .unwrap_or(CheckStatus::Unknown)
    }
}

/// Derived, read-only view of a check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub check_id: i64,
    pub status: CheckStatus,
    pub since: Option<DateTime<Utc>>,
    /// Trailing failures of the worst agent.
    pub consecutive_failures: usize,
    pub uptime: f64,
    pub avg_response_time: f64,
    pub last_check: Option<DateTime<Utc>>,
    pub message: String,
    pub agents: Vec<AgentStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentStatus {
    pub agent_id: i64,
    pub status: CheckStatus,
}

/// Status of one key from its history. `threshold` is clamped to one.
pub fn derive_status(history: &VecDeque<Sample>, threshold: u32) -> CheckStatus {
    let threshold = threshold.max(1) as usize;
    let mut samples = history.iter().rev().filter(|s| s.status.is_sample());

    let trailing = trailing_failures(history);
    if trailing >= threshold {
        return CheckStatus::Down;
    }
    samples
        .find(|s| !s.status.is_failure())
        .map(|s| s.status)
        .unwrap_or(CheckStatus::Unknown)
}

fn trailing_failures(history: &VecDeque<Sample>) -> usize {
    history
        .iter()
        .rev()
        .filter(|s| s.status.is_sample())
        .take_while(|s| s.status.is_failure())
        .count()
}

/// Percentage of reachable samples, rounded to two decimals. Unknown and
/// disabled samples are not counted.
pub fn uptime<'a>(samples: impl IntoIterator<Item = &'a Sample>) -> f64 {
    let (mut up, mut total) = (0usize, 0usize);
    for s in samples.into_iter().filter(|s| s.status.is_sample()) {
        total += 1;
        if s.status.is_reachable() {
            up += 1;
        }
    }
    if total == 0 {
        return 0.0;
    }
    (up as f64 * 100.0 / total as f64 * 100.0).round() / 100.0
}

/// Mean response time of the samples that carry one, ignoring unknown and
/// disabled samples.
pub fn avg_response_time<'a>(samples: impl IntoIterator<Item = &'a Sample>) -> f64 {
    let times: Vec<f64> = samples
        .into_iter()
        .filter(|s| s.status.is_sample())
        .filter_map(|s| s.response_time)
        .collect();
    if times.is_empty() {
        return 0.0;
    }
    let mean = times.iter().sum::<f64>() / times.len() as f64;
    (mean * 1000.0).round() / 1000.0
}

pub struct StatusTracker {
    registry: Arc<Registry>,
    window: usize,
    shards: Vec<Mutex<HashMap<i64, CheckState>>>,
}

impl StatusTracker {
    pub fn new(registry: Arc<Registry>, window: usize) -> Self {
        Self {
            registry,
            window: window.max(1),
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    fn shard(&self, check_id: i64) -> MutexGuard<'_, HashMap<i64, CheckState>> {
        let idx = check_id.rem_euclid(SHARDS as i64) as usize;
        self.shards[idx].lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fold one result into its key. Returns the aggregate transition, if any.
    ///
    /// Results older than the newest applied one for the same key are
    /// dropped, so the failure count follows dispatch order.
    pub fn apply(&self, result: &CheckResult) -> Option<Transition> {
        let threshold = self.registry.get(result.check_id)?.threshold_timeout;
        self.apply_with(result, threshold)
    }

    fn apply_with(&self, result: &CheckResult, threshold: u32) -> Option<Transition> {
        let mut shard = self.shard(result.check_id);
        let state = shard.entry(result.check_id).or_insert_with(CheckState::new);
        if !state.is_placed(result.agent_id) {
            tracing::debug!(
                check_id = result.check_id,
                agent_id = result.agent_id,
                "dropping result from an agent outside the placement"
            );
            return None;
        }
        let key = state.agents.entry(result.agent_id).or_default();

        if key.last_seq.is_some_and(|last| result.seq <= last) {
            tracing::debug!(
                check_id = result.check_id,
                agent_id = result.agent_id,
                "dropping stale result seq {}",
                result.seq
            );
            return None;
        }
        key.last_seq = Some(result.seq);
        key.history.push_back(Sample::from(result));
        while key.history.len() > self.window {
            key.history.pop_front();
        }
        key.status = Some(derive_status(&key.history, threshold));

        let next = state.aggregate();
        if next == state.status {
            return None;
        }
        let transition = Transition {
            check_id: result.check_id,
            agent_id: result.agent_id,
            from: state.status,
            to: next,
            at: result.ingested_at,
            message: result.message.clone(),
        };
        state.status = next;
        state.since = result.ingested_at;
        Some(transition)
    }

    /// Rebuild state from stored history without reporting transitions.
    /// `results` must be ordered oldest first within each key.
    pub fn restore(&self, results: &[CheckResult]) -> usize {
        let mut applied = 0;
        for r in results {
            let Some(def) = self.registry.get(r.check_id) else {
                continue;
            };
            self.apply_with(r, def.threshold_timeout);
            applied += 1;
        }
        tracing::info!("StatusTracker: restored {} results", applied);
        applied
    }

    /// Restrict a check to the agents it now runs on. State of every other
    /// agent is dropped and the aggregate recomputed; the change, if any, is
    /// returned as a transition.
    pub fn retain_agents(&self, check_id: i64, placed: &[i64]) -> Option<Transition> {
        let mut shard = self.shard(check_id);
        let state = shard.entry(check_id).or_insert_with(CheckState::new);
        let placed: HashSet<i64> = placed.iter().copied().collect();

        let mut dropped: Vec<i64> = state
            .agents
            .keys()
            .filter(|id| !placed.contains(id))
            .copied()
            .collect();
        dropped.sort_unstable();
        for id in &dropped {
            state.agents.remove(id);
        }
        state.placed = Some(placed);

        let first = *dropped.first()?;
        let next = state.aggregate();
        if next == state.status {
            return None;
        }
        let now = Utc::now();
        let transition = Transition {
            check_id,
            agent_id: first,
            from: state.status,
            to: next,
            at: now,
            message: format!("agent {} no longer runs this check", first),
        };
        state.status = next;
        state.since = now;
        Some(transition)
    }

    /// Re-resolve the placement of every active check against the current
    /// agents and regions.
    pub fn reconcile(&self, agents: &[Agent], regions: &[Region]) -> Vec<Transition> {
        let transitions: Vec<Transition> = self
            .registry
            .list()
            .iter()
            .filter_map(|def| {
                self.retain_agents(def.id, &placement_agents(&def.placement, agents, regions))
            })
            .collect();
        for t in &transitions {
            tracing::info!(check_id = t.check_id, "status {} -> {} after placement change", t.from, t.to);
        }
        transitions
    }

    /// Drop all state of a deleted check.
    pub fn forget(&self, check_id: i64) {
        self.shard(check_id).remove(&check_id);
    }

    /// Current snapshot. Disabled checks report `Disabled` whatever their
    /// history; unknown ids yield `None`.
    pub fn snapshot(&self, check_id: i64) -> Option<StatusSnapshot> {
        let def = self.registry.get(check_id)?;
        let shard = self.shard(check_id);
        let Some(state) = shard.get(&check_id) else {
            return Some(StatusSnapshot {
                check_id,
                status: if def.enabled { CheckStatus::Unknown } else { CheckStatus::Disabled },
                since: None,
                consecutive_failures: 0,
                uptime: 0.0,
                avg_response_time: 0.0,
                last_check: None,
                message: String::new(),
                agents: Vec::new(),
            });
        };

        let samples = || state.agents.values().flat_map(|k| k.history.iter());
        let latest = samples().max_by_key(|s| (s.time, s.seq));

        let mut agents: Vec<AgentStatus> = state
            .agents
            .iter()
            .map(|(id, k)| AgentStatus {
                agent_id: *id,
                status: k.status.unwrap_or(CheckStatus::Unknown),
            })
            .collect();
        agents.sort_by_key(|a| a.agent_id);

        Some(StatusSnapshot {
            check_id,
            status: if def.enabled { state.status } else { CheckStatus::Disabled },
            since: Some(state.since),
            consecutive_failures: state
                .agents
                .values()
                .map(|k| trailing_failures(&k.history))
                .max()
                .unwrap_or(0),
            uptime: uptime(samples()),
            avg_response_time: avg_response_time(samples()),
            last_check: latest.map(|s| s.time),
            message: latest.map(|s| s.message.clone()).unwrap_or_default(),
            agents,
        })
    }

    /// Status history across agents, newest first, at most one window.
    pub fn history(&self, check_id: i64) -> Vec<Sample> {
        let shard = self.shard(check_id);
        let Some(state) = shard.get(&check_id) else {
            return Vec::new();
        };
        let mut all: Vec<Sample> = state
            .agents
            .values()
            .flat_map(|k| k.history.iter().cloned())
            .collect();
        all.sort_by(|a, b| b.time.cmp(&a.time).then(b.seq.cmp(&a.seq)));
        all.truncate(self.window);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::{CheckKind, CheckRequest};
    use crate::db::{Store, Timings};
    use chrono::Duration as ChronoDuration;
    use tempfile::NamedTempFile;

    fn sample(status: CheckStatus) -> Sample {
        Sample {
            seq: 0,
            status,
            time: Utc::now(),
            response_time: Some(10.0),
            message: String::new(),
        }
    }

    fn history(statuses: &[CheckStatus]) -> VecDeque<Sample> {
        statuses.iter().map(|s| sample(*s)).collect()
    }

    use CheckStatus::{Degraded, Down, Unknown, Up, Warn};

    #[test]
    fn test_threshold_and_fast_recovery() {
        assert_eq!(derive_status(&history(&[Up, Down, Down]), 3), Up);
        assert_eq!(derive_status(&history(&[Up, Down, Down, Down]), 3), Down);
        assert_eq!(derive_status(&history(&[Down, Down, Down, Up]), 3), Up);
        // Zero means the first failure counts.
        assert_eq!(derive_status(&history(&[Up, Down]), 0), Down);
        // Unknown samples neither break nor extend a failure run.
        assert_eq!(derive_status(&history(&[Down, Unknown, Down]), 2), Down);
        assert_eq!(derive_status(&history(&[Down]), 2), Unknown);
        assert_eq!(derive_status(&history(&[Up, Warn]), 1), Warn);
    }

    #[test]
    fn test_uptime_window_composition() {
        let mut statuses = vec![Up; 30];
        statuses.extend(vec![Down; 10]);
        let h = history(&statuses);
        assert_eq!(uptime(h.iter()), 75.0);

        // Warn and degraded count as up; unknown is excluded.
        let h = history(&[Up, Warn, Degraded, Down, Unknown]);
        assert_eq!(uptime(h.iter()), 75.0);
        assert_eq!(uptime(history(&[Unknown]).iter()), 0.0);
    }

    #[test]
    fn test_avg_response_time_skips_unknown() {
        let mut h = history(&[Up, Up, Unknown]);
        h[1].response_time = Some(30.0);
        h[2].response_time = Some(1000.0);
        assert_eq!(avg_response_time(h.iter()), 20.0);
    }

    struct Fixture {
        _file: NamedTempFile,
        registry: Arc<Registry>,
        tracker: StatusTracker,
    }

    fn fixture(window: usize) -> Fixture {
        let file = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(file.path()).unwrap());
        let registry = Arc::new(Registry::load(store).unwrap());
        let tracker = StatusTracker::new(registry.clone(), window);
        Fixture {
            _file: file,
            registry,
            tracker,
        }
    }

    fn create(f: &Fixture, threshold: u32) -> i64 {
        let body = format!(
            r#"{{"name":"t","ip":"127.0.0.1","port":80,"threshold_timeout":{}}}"#,
            threshold
        );
        f.registry
            .create(CheckRequest::parse(CheckKind::Tcp, body.as_bytes()).unwrap())
            .unwrap()
            .id
    }

    fn result(check_id: i64, agent_id: i64, seq: u64, status: CheckStatus) -> CheckResult {
        let at = Utc::now() + ChronoDuration::milliseconds(seq as i64);
        CheckResult {
            check_id,
            agent_id,
            seq,
            time: at,
            ingested_at: at,
            status,
            timings: Timings {
                response_time: Some(5.0),
                ..Default::default()
            },
            message: format!("seq {}", seq),
            ssl_expire_date: None,
            meta: Default::default(),
        }
    }

    #[test]
    fn test_transitions_follow_threshold() {
        let f = fixture(40);
        let id = create(&f, 3);

        let t = f.tracker.apply(&result(id, 1, 1, Up)).unwrap();
        assert_eq!((t.from, t.to), (Unknown, Up));
        assert!(f.tracker.apply(&result(id, 1, 2, Down)).is_none());
        assert!(f.tracker.apply(&result(id, 1, 3, Down)).is_none());
        let t = f.tracker.apply(&result(id, 1, 4, Down)).unwrap();
        assert_eq!((t.from, t.to), (Up, Down));
        assert_eq!(f.tracker.snapshot(id).unwrap().consecutive_failures, 3);

        let t = f.tracker.apply(&result(id, 1, 5, Up)).unwrap();
        assert_eq!((t.from, t.to), (Down, Up));
    }

    #[test]
    fn test_stale_results_are_dropped() {
        let f = fixture(40);
        let id = create(&f, 1);
        f.tracker.apply(&result(id, 1, 10, Up));
        assert!(f.tracker.apply(&result(id, 1, 9, Down)).is_none());
        assert_eq!(f.tracker.snapshot(id).unwrap().status, Up);
        assert_eq!(f.tracker.history(id).len(), 1);
    }

    #[test]
    fn test_worst_case_across_agents() {
        let f = fixture(40);
        let id = create(&f, 1);
        f.tracker.apply(&result(id, 1, 1, Up));
        f.tracker.apply(&result(id, 2, 2, Degraded));
        assert_eq!(f.tracker.snapshot(id).unwrap().status, Degraded);
        let t = f.tracker.apply(&result(id, 3, 3, Down)).unwrap();
        assert_eq!(t.to, Down);

        let snap = f.tracker.snapshot(id).unwrap();
        assert_eq!(snap.agents.len(), 3);
        assert_eq!(snap.uptime, 66.67);
    }

    #[test]
    fn test_moved_check_forgets_old_agent() {
        let f = fixture(40);
        let id = create(&f, 1);
        f.tracker.apply(&result(id, 1, 1, Down));
        assert_eq!(f.tracker.snapshot(id).unwrap().status, Down);

        let t = f.tracker.retain_agents(id, &[2]).unwrap();
        assert_eq!((t.from, t.to, t.agent_id), (Down, Unknown, 1));

        // A late result from the old agent does not come back.
        assert!(f.tracker.apply(&result(id, 1, 2, Down)).is_none());
        for seq in 3..11 {
            f.tracker.apply(&result(id, 2, seq, Up));
        }
        let snap = f.tracker.snapshot(id).unwrap();
        assert_eq!(snap.status, Up);
        assert_eq!(snap.uptime, 100.0);
        assert_eq!(snap.agents, vec![AgentStatus { agent_id: 2, status: Up }]);

        // Nothing dropped, nothing reported.
        assert!(f.tracker.retain_agents(id, &[2, 3]).is_none());
    }

    #[test]
    fn test_disabled_overrides_history() {
        let f = fixture(40);
        let id = create(&f, 1);
        f.tracker.apply(&result(id, 1, 1, Up));

        f.registry.set_enabled(id, false).unwrap();
        assert_eq!(f.tracker.snapshot(id).unwrap().status, CheckStatus::Disabled);
        f.registry.set_enabled(id, true).unwrap();
        assert_eq!(f.tracker.snapshot(id).unwrap().status, Up);
    }

    #[test]
    fn test_window_bounds_history_and_restore() {
        let f = fixture(4);
        let id = create(&f, 1);
        let results: Vec<CheckResult> = (1..=10).map(|n| result(id, 1, n, Up)).collect();
        assert_eq!(f.tracker.restore(&results), 10);

        let history = f.tracker.history(id);
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].seq, 10);
        assert_eq!(f.tracker.snapshot(id).unwrap().status, Up);

        f.tracker.forget(id);
        assert!(f.tracker.history(id).is_empty());
    }
}
