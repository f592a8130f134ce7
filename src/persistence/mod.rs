//! Persistence Writer - Durable History
//!
//! ## Responsibilities
//!
//! - Consume the state-store change stream and write it to PostgreSQL
//! - Batch readings (count or age, whichever first) off the hot path
//! - Retry transient store errors with jittered exponential backoff
//!
//! The writer never blocks the state store: it reads the broadcast stream
//! through a bounded queue and sheds *reading* events when that queue fills.
//! Status, incident, and boot events are always preserved. A permanent store
//! failure flips the health flag (surfaced as a system alert) while live
//! state keeps serving.

mod repository;

pub use repository::{
    Bucket, Incident, MetricHistoryPoint, ReadingRow, Repository, WeatherHistoryPoint,
};

use crate::state_store::{ChangeKind, StateChange, StateStore};
use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const RETRY_INITIAL: Duration = Duration::from_millis(100);
const RETRY_CAP: Duration = Duration::from_secs(10);
const RETRY_ATTEMPTS: u32 = 8;

/// Writer tuning knobs, lifted from [`crate::config::AppConfig`]
#[derive(Debug, Clone)]
pub struct WriterOptions {
    pub queue_cap: usize,
    pub batch_size: usize,
    pub batch_interval: Duration,
    pub reading_retention_days: Option<u32>,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            queue_cap: 4096,
            batch_size: 128,
            batch_interval: Duration::from_millis(250),
            reading_retention_days: None,
        }
    }
}

/// Persistence writer instance
pub struct PersistenceWriter {
    repo: Repository,
    store: Arc<StateStore>,
    options: WriterOptions,
    dropped_readings: AtomicU64,
    healthy: AtomicBool,
}

impl PersistenceWriter {
    pub fn new(repo: Repository, store: Arc<StateStore>, options: WriterOptions) -> Arc<Self> {
        Arc::new(Self {
            repo,
            store,
            options,
            dropped_readings: AtomicU64::new(0),
            healthy: AtomicBool::new(true),
        })
    }

    /// Repository handle for the query surface
    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    /// False after a write failed past its retry budget
    pub fn healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Readings shed under backpressure since boot
    pub fn dropped_readings(&self) -> u64 {
        self.dropped_readings.load(Ordering::Relaxed)
    }

    /// Spawn the forwarder and batcher tasks
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let (tx, rx) = mpsc::channel(self.options.queue_cap);
        let mut handles = vec![
            tokio::spawn(forward_changes(
                self.clone(),
                self.store.subscribe(),
                tx,
                shutdown.clone(),
            )),
            tokio::spawn(self.clone().run_batcher(rx, shutdown.clone())),
        ];
        if self.options.reading_retention_days.is_some() {
            handles.push(tokio::spawn(self.clone().run_retention(shutdown)));
        }
        handles
    }

    async fn run_batcher(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<StateChange>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut batch: Vec<ReadingRow> = Vec::with_capacity(self.options.batch_size);
        let mut tick = tokio::time::interval(self.options.batch_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(change) => {
                        self.handle_change(change, &mut batch).await;
                        if batch.len() >= self.options.batch_size {
                            self.flush(&mut batch).await;
                        }
                    }
                    None => {
                        self.flush(&mut batch).await;
                        return;
                    }
                },
                _ = tick.tick() => {
                    self.flush(&mut batch).await;
                }
                _ = shutdown.changed() => {
                    // Drain whatever is already queued, then flush and stop.
                    // The supervisor bounds this drain at five seconds.
                    while let Ok(change) = rx.try_recv() {
                        self.handle_change(change, &mut batch).await;
                    }
                    self.flush(&mut batch).await;
                    tracing::info!("Persistence writer drained");
                    return;
                }
            }
        }
    }

    async fn handle_change(&self, change: StateChange, batch: &mut Vec<ReadingRow>) {
        match &change.kind {
            ChangeKind::Reading { metric, value } => {
                batch.push(ReadingRow {
                    device_id: change.device_id.clone(),
                    metric: metric.clone(),
                    value: *value,
                    ts: change.ts,
                });
            }
            ChangeKind::Status | ChangeKind::DeviceInfo => {
                self.upsert_device(&change.device_id).await;
            }
            ChangeKind::Boot { reason, success } => {
                let repo = &self.repo;
                let (device_id, ts) = (change.device_id.clone(), change.ts);
                self.with_retry("record_boot", || {
                    repo.record_boot(&device_id, ts, reason, *success)
                })
                .await;
                self.upsert_device(&change.device_id).await;
            }
            ChangeKind::Incident { code, message } => {
                let repo = &self.repo;
                let (device_id, ts) = (change.device_id.clone(), change.ts);
                self.with_retry("upsert_incident", || {
                    repo.upsert_incident(&device_id, code, message, ts)
                })
                .await;
                self.upsert_device(&change.device_id).await;
            }
            ChangeKind::IncidentsCleared => {
                let repo = &self.repo;
                let device_id = change.device_id.clone();
                self.with_retry("resolve_all_incidents", || {
                    repo.resolve_all_incidents(&device_id, "device reported clean status")
                })
                .await;
            }
            // Section views are live-only; their numeric samples arrive as
            // Reading changes.
            ChangeKind::Door
            | ChangeKind::Light
            | ChangeKind::Power
            | ChangeKind::Freezer
            | ChangeKind::Weather => {}
        }
    }

    async fn upsert_device(&self, device_id: &str) {
        let Some(device) = self.store.snapshot_device(device_id).await else {
            return;
        };
        let repo = &self.repo;
        self.with_retry("upsert_device", || repo.upsert_device(&device))
            .await;
    }

    async fn flush(&self, batch: &mut Vec<ReadingRow>) {
        if batch.is_empty() {
            return;
        }
        let rows = std::mem::take(batch);
        let repo = &self.repo;
        let written = self
            .with_retry("append_readings", || repo.append_readings(&rows))
            .await;
        if written.is_some() {
            tracing::debug!(rows = rows.len(), "Flushed reading batch");
        }
    }

    async fn run_retention(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let Some(days) = self.options.reading_retention_days else {
            return;
        };
        let mut tick = tokio::time::interval(Duration::from_secs(3600));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(days));
                    match self.repo.prune_readings(cutoff).await {
                        Ok(0) => {}
                        Ok(n) => tracing::info!(pruned = n, "Pruned old readings"),
                        Err(e) => tracing::warn!(error = %e, "Reading prune failed"),
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Run an operation with jittered exponential backoff. Returns `None`
    /// after the retry budget is exhausted; the health flag then surfaces a
    /// system alert while live state continues serving.
    async fn with_retry<T, F, Fut>(&self, what: &str, mut f: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = crate::error::Result<T>>,
    {
        let mut delay = RETRY_INITIAL;
        for attempt in 1..=RETRY_ATTEMPTS {
            match f().await {
                Ok(value) => {
                    self.healthy.store(true, Ordering::Relaxed);
                    return Some(value);
                }
                Err(e) if attempt == RETRY_ATTEMPTS => {
                    self.healthy.store(false, Ordering::Relaxed);
                    tracing::error!(
                        op = %what,
                        error = %e,
                        attempts = attempt,
                        "Store write failed permanently; continuing with live state only"
                    );
                    return None;
                }
                Err(e) => {
                    tracing::warn!(op = %what, error = %e, attempt, "Store write failed, retrying");
                    tokio::time::sleep(jittered(delay)).await;
                    delay = (delay * 2).min(RETRY_CAP);
                }
            }
        }
        None
    }
}

/// Backoff delay with ±20% jitter
fn jittered(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    base.mul_f64(factor)
}

async fn forward_changes(
    writer: Arc<PersistenceWriter>,
    mut changes: tokio::sync::broadcast::Receiver<StateChange>,
    tx: mpsc::Sender<StateChange>,
    mut shutdown: watch::Receiver<bool>,
) {
    use tokio::sync::broadcast::error::RecvError;
    loop {
        tokio::select! {
            received = changes.recv() => match received {
                Ok(change) => {
                    match tx.try_send(change) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(change)) => {
                            if change.kind.sheddable() {
                                let n = writer.dropped_readings.fetch_add(1, Ordering::Relaxed) + 1;
                                if n % 1024 == 1 {
                                    tracing::warn!(
                                        dropped_total = n,
                                        "Persistence queue full, shedding readings"
                                    );
                                }
                            } else if tx.send(change).await.is_err() {
                                return;
                            }
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => return,
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    writer.dropped_readings.fetch_add(missed, Ordering::Relaxed);
                    tracing::warn!(missed, "Change stream lagged, oldest entries dropped");
                }
                Err(RecvError::Closed) => return,
            },
            _ = shutdown.changed() => return,
        }
    }
}
