//! Fan-Out Hub - Streaming Client Distribution
//!
//! ## Responsibilities
//!
//! - Client connection management for the WebSocket surface
//! - Grouped, coalesced state-change notifications (100 ms window)
//! - Slow-consumer disconnection via bounded per-client queues
//!
//! Clients get a full snapshot on connect and re-query on reconnect; there
//! is no delivery guarantee across connections. Multiple changes to the same
//! `(device_id, group)` inside the coalescing window collapse into one
//! message built from the latest store snapshot.

use crate::alerts::ActiveAlert;
use crate::codec::{DoorPosition, SwitchState};
use crate::state_store::{
    ChangeKind, DeviceState, FreezerView, StateChange, StateStore, WeatherView,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Coalescing window for per-group change notifications
const COALESCE_WINDOW: Duration = Duration::from_millis(100);

/// Close reason reported to clients that stop reading
pub const SLOW_CONSUMER: &str = "slow-consumer";

/// Hub message types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum FanoutMessage {
    /// Full state sent once per connection
    Snapshot {
        devices: HashMap<String, DeviceState>,
        alerts: Vec<ActiveAlert>,
    },
    Door {
        device_id: String,
        state: DoorPosition,
    },
    Light {
        device_id: String,
        state: SwitchState,
    },
    Weather {
        device_id: String,
        weather: WeatherView,
    },
    Freezer {
        device_id: String,
        freezer: FreezerView,
    },
    HouseMonitor {
        device: DeviceState,
    },
    GarageController {
        device: DeviceState,
    },
    Alerts {
        alerts: Vec<ActiveAlert>,
    },
    Pong,
}

/// Logical topic groups used for coalescing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicGroup {
    Door,
    Light,
    Weather,
    Freezer,
    /// Device-level registry changes, keyed by device id
    Device,
}

/// Map a state change to its fan-out group
pub fn group_for_change(change: &StateChange) -> Option<TopicGroup> {
    match &change.kind {
        ChangeKind::Door => Some(TopicGroup::Door),
        ChangeKind::Light => Some(TopicGroup::Light),
        ChangeKind::Weather => Some(TopicGroup::Weather),
        ChangeKind::Freezer => Some(TopicGroup::Freezer),
        ChangeKind::Reading { metric, .. } => {
            if metric.starts_with("weather_") {
                Some(TopicGroup::Weather)
            } else if metric.starts_with("freezer_") {
                Some(TopicGroup::Freezer)
            } else {
                None
            }
        }
        ChangeKind::Status
        | ChangeKind::Boot { .. }
        | ChangeKind::Power
        | ChangeKind::DeviceInfo
        | ChangeKind::Incident { .. }
        | ChangeKind::IncidentsCleared => Some(TopicGroup::Device),
    }
}

/// Client connection
struct ClientConnection {
    id: Uuid,
    tx: mpsc::Sender<FanoutMessage>,
    close_reason: Arc<std::sync::Mutex<Option<&'static str>>>,
}

/// Receiving side handed to the WebSocket task
pub struct ClientHandle {
    pub id: Uuid,
    pub rx: mpsc::Receiver<FanoutMessage>,
    close_reason: Arc<std::sync::Mutex<Option<&'static str>>>,
}

impl ClientHandle {
    /// Why the hub closed this client, if it did
    pub fn close_reason(&self) -> Option<&'static str> {
        *self.close_reason.lock().expect("close reason lock")
    }
}

/// Fan-out hub instance
pub struct FanoutHub {
    clients: RwLock<HashMap<Uuid, ClientConnection>>,
    queue_cap: usize,
    connection_count: AtomicU64,
}

impl FanoutHub {
    pub fn new(queue_cap: usize) -> Arc<Self> {
        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            queue_cap,
            connection_count: AtomicU64::new(0),
        })
    }

    /// Register a new client
    pub async fn register(&self) -> ClientHandle {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.queue_cap);
        let close_reason = Arc::new(std::sync::Mutex::new(None));
        let conn = ClientConnection {
            id,
            tx,
            close_reason: close_reason.clone(),
        };
        self.clients.write().await.insert(id, conn);
        self.connection_count.fetch_add(1, Ordering::Relaxed);
        tracing::info!(connection_id = %id, "Client connected");
        ClientHandle {
            id,
            rx,
            close_reason,
        }
    }

    /// Unregister a client
    pub async fn unregister(&self, id: &Uuid) {
        if self.clients.write().await.remove(id).is_some() {
            self.connection_count.fetch_sub(1, Ordering::Relaxed);
            tracing::info!(connection_id = %id, "Client disconnected");
        }
    }

    /// Send to every client; clients whose queue is full are closed with
    /// the slow-consumer reason and do not delay anyone else
    pub async fn broadcast(&self, message: FanoutMessage) {
        let mut slow: Vec<Uuid> = Vec::new();
        {
            let clients = self.clients.read().await;
            for conn in clients.values() {
                match conn.tx.try_send(message.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        *conn.close_reason.lock().expect("close reason lock") =
                            Some(SLOW_CONSUMER);
                        slow.push(conn.id);
                        tracing::warn!(connection_id = %conn.id, "Closing slow consumer");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        slow.push(conn.id);
                    }
                }
            }
        }
        for id in slow {
            self.unregister(&id).await;
        }
    }

    /// Send to one client (pong replies)
    pub async fn send_to(&self, id: &Uuid, message: FanoutMessage) {
        let clients = self.clients.read().await;
        if let Some(conn) = clients.get(id) {
            let _ = conn.tx.try_send(message);
        }
    }

    pub fn connection_count(&self) -> u64 {
        self.connection_count.load(Ordering::Relaxed)
    }

    /// Coalesce store changes and alert updates into grouped notifications
    pub fn spawn(
        self: &Arc<Self>,
        store: Arc<StateStore>,
        mut alerts_rx: watch::Receiver<Vec<ActiveAlert>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let hub = self.clone();
        let mut changes = store.subscribe();
        tokio::spawn(async move {
            let mut pending: HashSet<(String, TopicGroup)> = HashSet::new();
            let mut alerts_pending = false;
            let mut flush = tokio::time::interval(COALESCE_WINDOW);
            flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    received = changes.recv() => match received {
                        Ok(change) => {
                            if let Some(group) = group_for_change(&change) {
                                pending.insert((change.device_id, group));
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::warn!(missed, "Fan-out lagged behind the change stream");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    },
                    changed = alerts_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        alerts_pending = true;
                    }
                    _ = flush.tick() => {
                        if !pending.is_empty() {
                            let batch: Vec<_> = pending.drain().collect();
                            hub.flush_groups(&store, batch).await;
                        }
                        if alerts_pending {
                            alerts_pending = false;
                            let alerts = alerts_rx.borrow().clone();
                            hub.broadcast(FanoutMessage::Alerts { alerts }).await;
                        }
                    }
                    _ = shutdown.changed() => {
                        hub.clients.write().await.clear();
                        return;
                    }
                }
            }
        })
    }

    async fn flush_groups(&self, store: &StateStore, batch: Vec<(String, TopicGroup)>) {
        for (device_id, group) in batch {
            let Some(device) = store.snapshot_device(&device_id).await else {
                continue;
            };
            if let Some(message) = build_group_message(&device, group) {
                self.broadcast(message).await;
            }
        }
    }
}

/// Build the latest-state message for a `(device, group)` pair
pub fn build_group_message(device: &DeviceState, group: TopicGroup) -> Option<FanoutMessage> {
    match group {
        TopicGroup::Door => device.door.as_ref().map(|door| FanoutMessage::Door {
            device_id: device.device_id.clone(),
            state: door.state,
        }),
        TopicGroup::Light => device.light.as_ref().map(|light| FanoutMessage::Light {
            device_id: device.device_id.clone(),
            state: light.state,
        }),
        TopicGroup::Weather => device.weather.clone().map(|weather| FanoutMessage::Weather {
            device_id: device.device_id.clone(),
            weather,
        }),
        TopicGroup::Freezer => device.freezer.clone().map(|freezer| FanoutMessage::Freezer {
            device_id: device.device_id.clone(),
            freezer,
        }),
        TopicGroup::Device => match device.device_id.as_str() {
            "house-monitor" => Some(FanoutMessage::HouseMonitor {
                device: device.clone(),
            }),
            "garage-controller" => Some(FanoutMessage::GarageController {
                device: device.clone(),
            }),
            // Other devices surface through snapshots and the device list
            _ => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono::Utc;

    fn change(device_id: &str, kind: ChangeKind) -> StateChange {
        StateChange {
            device_id: device_id.to_string(),
            kind,
            before: None,
            after: None,
            ts: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn reading_metrics_map_to_section_groups() {
        let weather = change(
            "garage-controller",
            ChangeKind::Reading {
                metric: "weather_pressure_inhg".to_string(),
                value: 29.92,
            },
        );
        assert_eq!(group_for_change(&weather), Some(TopicGroup::Weather));

        let freezer = change(
            "house-monitor",
            ChangeKind::Reading {
                metric: "freezer_temperature_f_main".to_string(),
                value: 1.0,
            },
        );
        assert_eq!(group_for_change(&freezer), Some(TopicGroup::Freezer));

        let status = change("house-monitor", ChangeKind::Status);
        assert_eq!(group_for_change(&status), Some(TopicGroup::Device));
    }

    #[test]
    fn message_types_serialize_to_kebab_case_tags() {
        let msg = FanoutMessage::Pong;
        assert_eq!(serde_json::to_value(&msg).unwrap()["type"], "pong");

        let device = DeviceState::new("house-monitor");
        let msg = FanoutMessage::HouseMonitor { device };
        assert_eq!(serde_json::to_value(&msg).unwrap()["type"], "house-monitor");

        let msg = FanoutMessage::Door {
            device_id: "garage-controller".to_string(),
            state: DoorPosition::Opening,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "door");
        assert_eq!(value["state"], "opening");
    }

    #[tokio::test]
    async fn broadcast_reaches_registered_clients() {
        let hub = FanoutHub::new(8);
        let mut client = hub.register().await;
        hub.broadcast(FanoutMessage::Pong).await;
        assert_eq!(client.rx.recv().await, Some(FanoutMessage::Pong));
        hub.unregister(&client.id).await;
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn slow_consumer_is_closed_without_stalling_others() {
        let hub = FanoutHub::new(2);
        let slow = hub.register().await;
        let mut healthy = hub.register().await;

        // Fill both queues, but only the healthy client keeps reading
        hub.broadcast(FanoutMessage::Pong).await;
        hub.broadcast(FanoutMessage::Pong).await;
        assert!(matches!(healthy.rx.try_recv(), Ok(FanoutMessage::Pong)));
        assert!(matches!(healthy.rx.try_recv(), Ok(FanoutMessage::Pong)));

        // The slow client's queue overflows on the next send
        hub.broadcast(FanoutMessage::Pong).await;

        assert_eq!(hub.connection_count(), 1);
        assert_eq!(slow.close_reason(), Some(SLOW_CONSUMER));
        assert!(matches!(healthy.rx.try_recv(), Ok(FanoutMessage::Pong)));
    }

    #[tokio::test]
    async fn group_message_uses_latest_state_only() {
        let device = {
            let mut d = DeviceState::new("garage-controller");
            d.door = Some(crate::state_store::DoorView {
                state: DoorPosition::Open,
                open_switch: true,
                closed_switch: false,
                updated_at: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
            });
            d
        };
        let msg = build_group_message(&device, TopicGroup::Door).unwrap();
        assert_eq!(
            msg,
            FanoutMessage::Door {
                device_id: "garage-controller".to_string(),
                state: DoorPosition::Open,
            }
        );
        assert!(build_group_message(&device, TopicGroup::Weather).is_none());
    }
}
