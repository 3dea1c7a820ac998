//! Result fan-in: every finished execution passes through here exactly once.
//!
//! Order per result: stamp ingestion time, fold into the status tracker,
//! append to the metrics store (which feeds live streams), then hand any
//! transition to the notifier.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use crate::check::{CheckDefinition, Registry, RegistryEvent};
use crate::db::{CheckResult, Store};
use crate::metrics::MetricsStore;
use crate::notify::{Alert, Notifier};
use crate::scheduler::placement_agents;
use crate::status::{StatusTracker, Transition};

pub struct Pipeline {
    store: Arc<Store>,
    registry: Arc<Registry>,
    tracker: Arc<StatusTracker>,
    metrics: Arc<MetricsStore>,
    notifier: Notifier,
}

impl Pipeline {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<Registry>,
        tracker: Arc<StatusTracker>,
        metrics: Arc<MetricsStore>,
        notifier: Notifier,
    ) -> Self {
        Self {
            store,
            registry,
            tracker,
            metrics,
            notifier,
        }
    }

    /// Consume results until the scheduler side closes.
    pub async fn run(self, mut results: mpsc::Receiver<CheckResult>) {
        let mut events = self.registry.subscribe();
        loop {
            tokio::select! {
                result = results.recv() => match result {
                    Some(r) => self.ingest(r).await,
                    None => break,
                },
                event = events.recv() => match event {
                    Ok(RegistryEvent::Removed(id)) => self.tracker.forget(id),
                    Ok(RegistryEvent::Upserted(def)) => self.replace_placement(&def),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Pipeline: missed {} registry events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                },
            }
        }
        tracing::info!("Pipeline: result channel closed");
    }

    pub async fn ingest(&self, mut result: CheckResult) {
        if self.registry.get(result.check_id).is_none() {
            tracing::debug!(
                check_id = result.check_id,
                "dropping result of a deleted check"
            );
            return;
        }
        result.ingested_at = Utc::now();

        let transition = self.tracker.apply(&result);
        self.metrics.append(result).await;

        if let Some(t) = transition {
            self.on_transition(&t);
        }
    }

    /// Forget agents an edited or moved check no longer runs on.
    fn replace_placement(&self, def: &CheckDefinition) {
        let (agents, regions) = match (self.store.get_agents(), self.store.get_regions()) {
            (Ok(a), Ok(r)) => (a, r),
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!(check_id = def.id, "Pipeline: failed to load agents: {}", e);
                return;
            }
        };
        let placed = placement_agents(&def.placement, &agents, &regions);
        if let Some(t) = self.tracker.retain_agents(def.id, &placed) {
            self.on_transition(&t);
        }
    }

    fn on_transition(&self, t: &Transition) {
        tracing::info!(
            check_id = t.check_id,
            agent_id = t.agent_id,
            "status {} -> {}",
            t.from,
            t.to
        );
        let Some(def) = self.registry.get(t.check_id) else {
            return;
        };
        let agent_name = self
            .store
            .get_agent(t.agent_id)
            .map(|a| a.name)
            .unwrap_or_else(|_| format!("agent {}", t.agent_id));
        self.notifier.notify(Alert::new(&def, t, agent_name));
    }
}
