//! Lifecycle Supervisor
//!
//! ## Responsibilities
//!
//! - Wire components in dependency order at startup
//! - Own the shutdown signal and the drain ordering on the way down
//! - Restart the bus adapter alone on a fatal exit; the store and the
//!   persistence writer survive bus outages
//!
//! Startup: persistence -> state store -> codec -> bus -> alerts ->
//! query surface + fan-out. Shutdown runs the same list in reverse with a
//! 2 s fan-out drain and a 5 s persistence drain.

use crate::alerts::{AlertEvaluator, AlertThresholds};
use crate::bus::{BusAdapter, BusOptions};
use crate::clock::{SharedClock, SystemClock};
use crate::codec::CodecRegistry;
use crate::commands::CommandDispatcher;
use crate::config::AppConfig;
use crate::fanout::FanoutHub;
use crate::ota::{OtaOptions, OtaOrchestrator};
use crate::persistence::{PersistenceWriter, Repository, WriterOptions};
use crate::state::AppState;
use crate::state_store::{run_sweeper, StateStore};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const FANOUT_DRAIN: Duration = Duration::from_secs(2);
const PERSISTENCE_DRAIN: Duration = Duration::from_secs(5);

/// Running component handles, in shutdown order
pub struct Supervisor {
    shutdown: watch::Sender<bool>,
    fanout_task: JoinHandle<()>,
    evaluator_task: JoinHandle<()>,
    ota_watcher: JoinHandle<()>,
    bus_task: JoinHandle<()>,
    sweeper_task: JoinHandle<()>,
    persistence_tasks: Vec<JoinHandle<()>>,
}

/// Build and start every component; returns the shared state for the web
/// layer plus the supervisor owning the running tasks.
pub async fn start(config: AppConfig) -> anyhow::Result<(AppState, Supervisor)> {
    let clock: SharedClock = Arc::new(SystemClock);
    let (shutdown, shutdown_rx) = watch::channel(false);

    // Persistence first: nothing downstream may outlive its history sink
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await?;
    let repo = Repository::new(pool);
    repo.init_schema().await?;
    tracing::info!("Database connected");

    let store = Arc::new(StateStore::new(
        clock.clone(),
        config.offline_timeout,
        config.persist_queue_cap,
    ));

    let writer = PersistenceWriter::new(
        repo,
        store.clone(),
        WriterOptions {
            queue_cap: config.persist_queue_cap,
            batch_size: config.persist_batch_size,
            batch_interval: config.persist_batch_interval,
            reading_retention_days: config.reading_retention_days,
        },
    );
    let persistence_tasks = writer.spawn(shutdown_rx.clone());

    let registry = Arc::new(CodecRegistry::new());

    let (bus_adapter, bus) = BusAdapter::new(
        registry.clone(),
        store.clone(),
        BusOptions {
            host: config.bus_host.clone(),
            port: config.bus_port,
            username: config.bus_username.clone(),
            password: config.bus_password.clone(),
            client_id: config.bus_client_id.clone(),
            keepalive: config.bus_keepalive,
            outbound_cap: config.outbound_cap,
        },
    );
    let bus_task = tokio::spawn(supervise_bus(bus_adapter, shutdown_rx.clone()));
    let sweeper_task = tokio::spawn(run_sweeper(store.clone(), shutdown_rx.clone()));

    let evaluator = AlertEvaluator::new(
        store.clone(),
        writer.clone(),
        clock.clone(),
        AlertThresholds {
            offline_timeout: chrono::Duration::from_std(config.offline_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(90)),
            weather_stall_timeout: chrono::Duration::from_std(config.weather_stall_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(120)),
            freezer_ajar_s: 300,
        },
    );
    let evaluator_task = evaluator.spawn(shutdown_rx.clone());

    let dispatcher = CommandDispatcher::new(registry.clone(), bus.clone(), store.clone());

    let ota = OtaOrchestrator::new(
        OtaOptions {
            source_root: config.source_root.clone(),
            raw_content_base: config.raw_content_base.clone(),
            proxy_base: config.proxy_base.clone(),
            default_ref: config.default_ref.clone(),
        },
        store.clone(),
        registry.clone(),
        bus.clone(),
        clock.clone(),
    );
    let ota_watcher = ota.spawn_watcher(shutdown_rx.clone());

    let fanout = FanoutHub::new(config.fanout_queue_cap);
    let fanout_task = fanout.spawn(store.clone(), evaluator.watch(), shutdown_rx);

    let app_state = AppState {
        config,
        store,
        writer,
        bus,
        dispatcher,
        ota,
        alerts: evaluator,
        fanout,
    };

    let supervisor = Supervisor {
        shutdown,
        fanout_task,
        evaluator_task,
        ota_watcher,
        bus_task,
        sweeper_task,
        persistence_tasks,
    };

    Ok((app_state, supervisor))
}

impl Supervisor {
    /// Stop everything in reverse startup order
    pub async fn shutdown(self) {
        tracing::info!("Shutting down");
        let _ = self.shutdown.send(true);

        join_within(self.fanout_task, FANOUT_DRAIN, "fan-out").await;
        join_within(self.evaluator_task, Duration::from_secs(1), "alert evaluator").await;
        join_within(self.ota_watcher, Duration::from_secs(1), "ota watcher").await;
        join_within(self.bus_task, Duration::from_secs(2), "bus adapter").await;
        join_within(self.sweeper_task, Duration::from_secs(1), "sweeper").await;
        for task in self.persistence_tasks {
            join_within(task, PERSISTENCE_DRAIN, "persistence writer").await;
        }
        tracing::info!("Shutdown complete");
    }
}

async fn join_within(task: JoinHandle<()>, limit: Duration, name: &str) {
    let abort = task.abort_handle();
    if tokio::time::timeout(limit, task).await.is_err() {
        tracing::warn!(component = %name, "Drain deadline exceeded, aborting");
        abort.abort();
    }
}

/// Keep the bus adapter alive: a panic restarts only this component
async fn supervise_bus(adapter: Arc<BusAdapter>, shutdown: watch::Receiver<bool>) {
    loop {
        let run = tokio::spawn(adapter.clone().run(shutdown.clone()));
        match run.await {
            Ok(()) => {}
            Err(e) if e.is_panic() => {
                tracing::error!("Bus adapter panicked, restarting");
            }
            Err(_) => {}
        }
        if *shutdown.borrow() {
            return;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        tracing::info!("Restarting bus adapter");
    }
}
