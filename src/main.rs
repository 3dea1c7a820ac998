//! RMON - synthetic check engine
//!
//! Schedules TCP, HTTP, DNS, ping, SMTP and RabbitMQ checks, tracks their
//! status, stores their metrics, streams live results and sends alerts.

mod check;
mod config;
mod db;
mod metrics;
mod notify;
mod pipeline;
mod probe;
mod scheduler;
mod status;
mod stream;
mod web;

use check::Registry;
use config::ServerConfig;
use db::Store;
use metrics::MetricsStore;
use notify::{Dispatcher, Notifier};
use pipeline::Pipeline;
use scheduler::{Executor, RetentionManager, Scheduler, SchedulerConfig, WorkerPool};
use status::StatusTracker;
use stream::StreamPublisher;
use web::{AppState, Server};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("rmon=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting {} on port {}...", cfg.name, cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    // Every check needs somewhere to run.
    if store.get_agents()?.is_empty() {
        tracing::info!("Adding default agent: local");
        let mut agent = db::Agent {
            id: 0,
            name: "local".to_string(),
            description: "Runs checks from this process".to_string(),
            server: "127.0.0.1".to_string(),
            port: 5101,
            enabled: true,
            shared: false,
            region_id: None,
        };
        store.add_agent(&mut agent)?;
    }

    let registry = Arc::new(Registry::load(store.clone())?);

    // Rebuild status from the most recent window of stored results.
    let tracker = Arc::new(StatusTracker::new(registry.clone(), cfg.history_window));
    tracker.restore(&store.recent_results_per_key(cfg.history_window)?);
    tracker.reconcile(&store.get_agents()?, &store.get_regions()?);

    let metrics = Arc::new(MetricsStore::new(store.clone(), cfg.stream_buffer * 4));

    // Live streams
    let streams = Arc::new(StreamPublisher::new(cfg.stream_buffer));
    tokio::spawn(stream::run_forwarder(
        streams.clone(),
        registry.clone(),
        tracker.clone(),
        metrics.subscribe_tail(),
    ));

    // Notifications
    let (notifier, alerts) = Notifier::channel(cfg.notify_queue);
    let dispatcher = Dispatcher::new(
        store.clone(),
        notify::senders::default_senders(cfg.mail.clone(), &cfg.name),
        cfg.notify_retries,
    );
    tokio::spawn(dispatcher.run(alerts));

    // Result fan-in
    let (results_tx, results_rx) = mpsc::channel(cfg.workers * 4);
    let pipeline = Pipeline::new(
        store.clone(),
        registry.clone(),
        tracker.clone(),
        metrics.clone(),
        notifier,
    );
    tokio::spawn(pipeline.run(results_rx));

    // Scheduler
    let executor = Arc::new(Executor::new(probe::default_drivers(cfg.ping_loss_threshold)));
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        registry.clone(),
        executor,
        WorkerPool::new(cfg.workers),
        results_tx,
        SchedulerConfig {
            tick: cfg.tick(),
            jitter: Duration::from_millis(cfg.jitter_ms),
        },
    )?);
    let (stop_tx, _) = broadcast::channel(1);
    tokio::spawn(scheduler.clone().run(stop_tx.subscribe()));

    // Start retention manager
    let retention = RetentionManager::new(store.clone(), cfg.retention_days);
    retention.start();

    // Start web server
    let server = Server::new(AppState {
        config: cfg,
        store,
        registry,
        tracker,
        metrics,
        streams,
    });

    tokio::select! {
        res = server.start() => res?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
    }

    let _ = stop_tx.send(());
    retention.stop().await;
    tracing::info!("{} tasks were in flight at shutdown", scheduler.in_flight());

    Ok(())
}
