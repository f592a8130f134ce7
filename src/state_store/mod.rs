//! State Store - Authoritative In-Memory Snapshot
//!
//! ## Responsibilities
//!
//! - Apply decoded events and emit coarse [`StateChange`] records
//! - Serve copy-on-read snapshots to the query surface and fan-out
//! - Drive the device status automaton, including the offline sweeper
//!
//! The bus receive loop and the sweeper are the only writers; both serialize
//! through the write lock. Readers clone the slice they need and never hold
//! references into writer-owned storage. Change subscribers hang off a
//! bounded broadcast channel with drop-oldest semantics when they lag.

mod types;

pub use types::{
    ChangeKind, DeviceState, DeviceStatus, DoorView, FreezerView, LightView, MetricSample,
    PowerView, StateChange, WeatherView, CLEAR_STREAK_FOR_RESOLUTION, FREEZER_CRITICAL_F,
};

use crate::clock::SharedClock;
use crate::codec::{DoorScope, Event, GridState, HealthTopicState, RunState};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};

/// State store instance
pub struct StateStore {
    devices: RwLock<HashMap<String, DeviceState>>,
    changes: broadcast::Sender<StateChange>,
    clock: SharedClock,
    offline_timeout: chrono::Duration,
}

impl StateStore {
    /// Create a store with the given change-stream depth
    pub fn new(clock: SharedClock, offline_timeout: Duration, change_capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(change_capacity);
        Self {
            devices: RwLock::new(HashMap::new()),
            changes,
            clock,
            offline_timeout: chrono::Duration::from_std(offline_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(90)),
        }
    }

    /// Subscribe to the change stream
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    /// Snapshot a single device
    pub async fn snapshot_device(&self, device_id: &str) -> Option<DeviceState> {
        self.devices.read().await.get(device_id).cloned()
    }

    /// Snapshot the whole fleet
    pub async fn snapshot_all(&self) -> HashMap<String, DeviceState> {
        self.devices.read().await.clone()
    }

    /// Whether a device has ever been observed
    pub async fn has_device(&self, device_id: &str) -> bool {
        self.devices.read().await.contains_key(device_id)
    }

    /// Registered device count
    pub async fn device_count(&self) -> usize {
        self.devices.read().await.len()
    }

    /// Apply one decoded event, returning the changes it produced
    ///
    /// Re-applying an event whose timestamps are not newer than stored state
    /// yields the same `DeviceState` and no duplicate changes.
    pub async fn apply(&self, event: &Event) -> Vec<StateChange> {
        let now = self.clock.now();
        let mut devices = self.devices.write().await;
        let device = devices
            .entry(event.device_id().to_string())
            .or_insert_with(|| DeviceState::new(event.device_id()));

        let mut out = Vec::new();

        if let Some(target) = target_status(event, device.status) {
            if device.status != target {
                out.push(StateChange {
                    device_id: device.device_id.clone(),
                    kind: ChangeKind::Status,
                    before: Some(serde_json::json!(device.status.as_str())),
                    after: Some(serde_json::json!(target.as_str())),
                    ts: now,
                });
                device.status = target;
            }
            if target == DeviceStatus::Online {
                device.ever_online = true;
            }
        }

        match event {
            Event::TelemetryReading {
                metric, value, ts, ..
            } => {
                let sample_ts = (*ts).unwrap_or(now);
                apply_reading(device, metric, *value, sample_ts, &mut out);
            }
            Event::DoorState { scope, state, .. } => match scope {
                DoorScope::Garage => {
                    let before = device.door.clone();
                    let view = DoorView {
                        state: *state,
                        open_switch: before.as_ref().map(|d| d.open_switch).unwrap_or(false),
                        closed_switch: before.as_ref().map(|d| d.closed_switch).unwrap_or(false),
                        updated_at: now,
                    };
                    if before.as_ref().map(|d| d.state) != Some(*state) {
                        out.push(section_change(
                            device,
                            ChangeKind::Door,
                            before.as_ref(),
                            &view,
                            now,
                        ));
                    }
                    device.door = Some(view);
                }
                DoorScope::Freezer => {
                    let before = device.freezer.clone();
                    let freezer = device.freezer.get_or_insert_with(|| FreezerView {
                        temperature_f: None,
                        door: None,
                        door_ajar_s: 0,
                        updated_at: now,
                        high_temp_streak: 0,
                    });
                    freezer.door = Some(*state);
                    freezer.updated_at = now;
                    if before.as_ref().and_then(|f| f.door) != Some(*state) {
                        let after = device.freezer.clone().unwrap();
                        out.push(section_change(
                            device,
                            ChangeKind::Freezer,
                            before.as_ref(),
                            &after,
                            now,
                        ));
                    }
                }
            },
            Event::LightState { state, .. } => {
                let before = device.light.clone();
                let view = LightView {
                    state: *state,
                    updated_at: now,
                };
                if before.as_ref().map(|l| l.state) != Some(*state) {
                    out.push(section_change(
                        device,
                        ChangeKind::Light,
                        before.as_ref(),
                        &view,
                        now,
                    ));
                }
                device.light = Some(view);
            }
            Event::PowerState { state, .. } => {
                let before = device.power.clone();
                let view = PowerView {
                    city: *state,
                    heartbeat_at: before.as_ref().and_then(|p| p.heartbeat_at),
                    updated_at: now,
                };
                if before.as_ref().map(|p| p.city) != Some(*state) {
                    out.push(section_change(
                        device,
                        ChangeKind::Power,
                        before.as_ref(),
                        &view,
                        now,
                    ));
                }
                device.power = Some(view);
            }
            Event::PowerHeartbeat { .. } => {
                let power = device.power.get_or_insert_with(|| PowerView {
                    city: GridState::Online,
                    heartbeat_at: None,
                    updated_at: now,
                });
                power.heartbeat_at = Some(now);
            }
            Event::Sos(report) => {
                device.last_error_code = Some(report.error.clone());
                device.clear_error_streak = 0;
                out.push(StateChange {
                    device_id: device.device_id.clone(),
                    kind: ChangeKind::Incident {
                        code: report.error.clone(),
                        message: report
                            .message
                            .clone()
                            .unwrap_or_else(|| report.error.clone()),
                    },
                    before: None,
                    after: None,
                    ts: epoch_ms(report.timestamp).unwrap_or(now),
                });
            }
            Event::Boot { report, .. } => {
                let boot_ts = epoch_ms(report.ts).unwrap_or(now);
                if device.last_boot != Some(boot_ts) {
                    device.last_boot = Some(boot_ts);
                    out.push(StateChange {
                        device_id: device.device_id.clone(),
                        kind: ChangeKind::Boot {
                            reason: report.reason.clone(),
                            success: report.success,
                        },
                        before: None,
                        after: None,
                        ts: boot_ts,
                    });
                }
            }
            Event::Version { version, .. } => {
                if device.version.as_deref() != Some(version.as_str()) {
                    let before = device.version.clone();
                    device.version = Some(version.clone());
                    out.push(StateChange {
                        device_id: device.device_id.clone(),
                        kind: ChangeKind::DeviceInfo,
                        before: before.map(|v| serde_json::json!({ "version": v })),
                        after: Some(serde_json::json!({ "version": version })),
                        ts: now,
                    });
                }
            }
            Event::ConsolidatedStatus { report, .. } => {
                apply_consolidated(device, report, &mut out, now);
            }
            Event::StatusUpdate { .. } | Event::Health { .. } => {}
        }

        device.last_seen = Some(now);

        for change in &out {
            let _ = self.changes.send(change.clone());
        }
        out
    }

    /// Transition silent devices to offline; runs at up to 1 Hz
    pub async fn sweep(&self) -> Vec<StateChange> {
        let now = self.clock.now();
        let mut devices = self.devices.write().await;
        let mut out = Vec::new();
        for device in devices.values_mut() {
            if device.status != DeviceStatus::Online {
                continue;
            }
            let Some(last_seen) = device.last_seen else {
                continue;
            };
            if now - last_seen > self.offline_timeout {
                tracing::warn!(
                    device_id = %device.device_id,
                    silent_for_s = (now - last_seen).num_seconds(),
                    "Device went silent, marking offline"
                );
                out.push(StateChange {
                    device_id: device.device_id.clone(),
                    kind: ChangeKind::Status,
                    before: Some(serde_json::json!(device.status.as_str())),
                    after: Some(serde_json::json!(DeviceStatus::Offline.as_str())),
                    ts: now,
                });
                device.status = DeviceStatus::Offline;
            }
        }
        drop(devices);
        for change in &out {
            let _ = self.changes.send(change.clone());
        }
        out
    }
}

/// Periodic offline detection until shutdown
pub async fn run_sweeper(store: Arc<StateStore>, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                store.sweep().await;
            }
            _ = shutdown.changed() => {
                tracing::debug!("Sweeper stopping");
                return;
            }
        }
    }
}

/// Status the automaton targets for an event; `None` leaves status untouched
fn target_status(event: &Event, current: DeviceStatus) -> Option<DeviceStatus> {
    match event {
        Event::Health { state, .. } => Some(match state {
            HealthTopicState::Online => DeviceStatus::Online,
            HealthTopicState::Error => DeviceStatus::Error,
            HealthTopicState::NeedsHelp => DeviceStatus::NeedsHelp,
            // Includes the broker-published LWT
            HealthTopicState::Offline => DeviceStatus::Offline,
        }),
        Event::StatusUpdate { status, .. } => match status {
            RunState::UpdateReceived | RunState::Updating => Some(DeviceStatus::Updating),
            // The device stays `updating` until its next health/status message
            RunState::Updated => None,
            RunState::Running | RunState::Alive => Some(DeviceStatus::Online),
            RunState::Offline => Some(DeviceStatus::Offline),
        },
        Event::Sos(_) => Some(DeviceStatus::NeedsHelp),
        // Only a health or status message exits the update window; stray
        // telemetry from a mid-update device must not end it early
        _ if current == DeviceStatus::Updating => None,
        _ => Some(DeviceStatus::Online),
    }
}

fn epoch_ms(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

fn section_change<T: serde::Serialize>(
    device: &DeviceState,
    kind: ChangeKind,
    before: Option<&T>,
    after: &T,
    now: DateTime<Utc>,
) -> StateChange {
    StateChange {
        device_id: device.device_id.clone(),
        kind,
        before: before.and_then(|b| serde_json::to_value(b).ok()),
        after: serde_json::to_value(after).ok(),
        ts: now,
    }
}

fn apply_reading(
    device: &mut DeviceState,
    metric: &str,
    value: f64,
    sample_ts: DateTime<Utc>,
    out: &mut Vec<StateChange>,
) {
    if let Some(prev) = device.metrics.get(metric) {
        if sample_ts < prev.ts {
            tracing::debug!(
                device_id = %device.device_id,
                metric = %metric,
                "Discarding out-of-order reading"
            );
            return;
        }
        if sample_ts == prev.ts && prev.value == value {
            return;
        }
    }
    device.metrics.insert(
        metric.to_string(),
        MetricSample {
            value,
            ts: sample_ts,
        },
    );
    update_section_from_metric(device, metric, value, sample_ts);
    out.push(StateChange {
        device_id: device.device_id.clone(),
        kind: ChangeKind::Reading {
            metric: metric.to_string(),
            value,
        },
        before: None,
        after: None,
        // Readings carry the sample timestamp so persistence buckets align
        ts: sample_ts,
    });
}

fn update_section_from_metric(
    device: &mut DeviceState,
    metric: &str,
    value: f64,
    ts: DateTime<Utc>,
) {
    match metric {
        "weather_temperature_f" | "weather_pressure_inhg" => {
            let weather = device.weather.get_or_insert_with(|| WeatherView {
                temperature_f: None,
                pressure_inhg: None,
                bmp388_temperature_f: None,
                updated_at: ts,
            });
            if metric == "weather_temperature_f" {
                weather.temperature_f = Some(value);
            } else {
                weather.pressure_inhg = Some(value);
            }
            weather.updated_at = ts;
        }
        "freezer_door_ajar_s" => {
            let freezer = freezer_mut(device, ts);
            freezer.door_ajar_s = value as i64;
            freezer.updated_at = ts;
        }
        m if m.starts_with("freezer_temperature_f") => {
            let freezer = freezer_mut(device, ts);
            freezer.temperature_f = Some(value);
            freezer.updated_at = ts;
            if value > FREEZER_CRITICAL_F {
                freezer.high_temp_streak += 1;
            } else {
                freezer.high_temp_streak = 0;
            }
        }
        _ => {}
    }
}

fn freezer_mut(device: &mut DeviceState, ts: DateTime<Utc>) -> &mut FreezerView {
    device.freezer.get_or_insert_with(|| FreezerView {
        temperature_f: None,
        door: None,
        door_ajar_s: 0,
        updated_at: ts,
        high_temp_streak: 0,
    })
}

fn apply_consolidated(
    device: &mut DeviceState,
    report: &crate::codec::DeviceReport,
    out: &mut Vec<StateChange>,
    now: DateTime<Utc>,
) {
    let report_ts = epoch_ms(report.timestamp).unwrap_or(now);

    if let Some(door) = &report.door {
        let before = device.door.clone();
        let view = DoorView {
            state: door.state,
            open_switch: door.open_switch,
            closed_switch: door.closed_switch,
            updated_at: report_ts,
        };
        if before
            .as_ref()
            .map(|d| (d.state, d.open_switch, d.closed_switch))
            != Some((view.state, view.open_switch, view.closed_switch))
        {
            out.push(section_change(device, ChangeKind::Door, before.as_ref(), &view, now));
        }
        device.door = Some(view);
    }

    if let Some(light) = &report.light {
        let before = device.light.clone();
        let view = LightView {
            state: light.state,
            updated_at: report_ts,
        };
        if before.as_ref().map(|l| l.state) != Some(light.state) {
            out.push(section_change(device, ChangeKind::Light, before.as_ref(), &view, now));
        }
        device.light = Some(view);
    }

    if let Some(power) = &report.power {
        let before = device.power.clone();
        let view = PowerView {
            city: power.city,
            heartbeat_at: before.as_ref().and_then(|p| p.heartbeat_at),
            updated_at: report_ts,
        };
        if before.as_ref().map(|p| p.city) != Some(power.city) {
            out.push(section_change(device, ChangeKind::Power, before.as_ref(), &view, now));
        }
        device.power = Some(view);
    }

    if let Some(freezer) = &report.freezer {
        let before = device.freezer.clone();
        let view = freezer_mut(device, report_ts);
        if let Some(temp) = freezer.temperature_f {
            view.temperature_f = Some(temp);
            if temp > FREEZER_CRITICAL_F {
                view.high_temp_streak += 1;
            } else {
                view.high_temp_streak = 0;
            }
        }
        if let Some(door) = freezer.door.as_deref() {
            view.door = crate::codec::DoorPosition::parse(door);
        }
        view.door_ajar_s = freezer.door_ajar_s;
        view.updated_at = report_ts;
        let after = device.freezer.clone().unwrap();
        let visibly_changed = before
            .as_ref()
            .map(|b| (b.temperature_f, b.door, b.door_ajar_s))
            != Some((after.temperature_f, after.door, after.door_ajar_s));
        if visibly_changed {
            out.push(section_change(
                device,
                ChangeKind::Freezer,
                before.as_ref(),
                &after,
                now,
            ));
        }
    }

    if let Some(weather) = &report.weather {
        let before = device.weather.clone();
        let view = WeatherView {
            temperature_f: weather.temperature_f,
            pressure_inhg: weather.pressure_inhg,
            bmp388_temperature_f: weather.bmp388_temperature_f,
            updated_at: report_ts,
        };
        if before
            .as_ref()
            .map(|w| (w.temperature_f, w.pressure_inhg, w.bmp388_temperature_f))
            != Some((view.temperature_f, view.pressure_inhg, view.bmp388_temperature_f))
        {
            out.push(section_change(device, ChangeKind::Weather, before.as_ref(), &view, now));
        }
        device.weather = Some(view);
    }

    if report.errors.is_empty() {
        device.clear_error_streak += 1;
        if device.clear_error_streak == CLEAR_STREAK_FOR_RESOLUTION {
            device.last_error_code = None;
            out.push(StateChange {
                device_id: device.device_id.clone(),
                kind: ChangeKind::IncidentsCleared,
                before: None,
                after: None,
                ts: now,
            });
        }
    } else {
        device.clear_error_streak = 0;
        device.last_error_code = Some(report.errors[0].code.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::codec::{
        BootReport, DeviceReport, DoorPosition, ReportHealth, SosReport, SwitchState,
    };
    use chrono::TimeZone;

    fn test_store() -> (Arc<StateStore>, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap());
        let store = Arc::new(StateStore::new(
            Arc::new(clock.clone()),
            Duration::from_secs(90),
            256,
        ));
        (store, clock)
    }

    fn telemetry(device_id: &str, metric: &str, value: f64) -> Event {
        Event::TelemetryReading {
            device_id: device_id.to_string(),
            metric: metric.to_string(),
            value,
            ts: None,
        }
    }

    fn clean_report(ts: i64) -> DeviceReport {
        DeviceReport {
            timestamp: ts,
            uptime_s: 60,
            health: ReportHealth::Online,
            power: None,
            freezer: None,
            weather: None,
            door: None,
            light: None,
            errors: vec![],
            memory: None,
        }
    }

    #[tokio::test]
    async fn first_message_creates_online_device() {
        let (store, _clock) = test_store();
        store
            .apply(&telemetry("garage-controller", "weather_temperature_f", 70.0))
            .await;
        let device = store.snapshot_device("garage-controller").await.unwrap();
        assert_eq!(device.status, DeviceStatus::Online);
        assert!(device.last_seen.is_some());
    }

    #[tokio::test]
    async fn lwt_offline_maps_to_offline() {
        let (store, _clock) = test_store();
        store
            .apply(&Event::Health {
                device_id: "house-monitor".to_string(),
                state: HealthTopicState::Online,
            })
            .await;
        let changes = store
            .apply(&Event::Health {
                device_id: "house-monitor".to_string(),
                state: HealthTopicState::Offline,
            })
            .await;
        assert_eq!(changes.len(), 1);
        let device = store.snapshot_device("house-monitor").await.unwrap();
        assert_eq!(device.status, DeviceStatus::Offline);
    }

    #[tokio::test]
    async fn sos_transitions_to_needs_help_and_opens_incident() {
        let (store, _clock) = test_store();
        let changes = store
            .apply(&Event::Sos(SosReport {
                error: "ds18b20_read_error".to_string(),
                message: Some("CRC mismatch".to_string()),
                timestamp: 1_749_000_000_000,
                device_id: "house-monitor".to_string(),
            }))
            .await;
        let device = store.snapshot_device("house-monitor").await.unwrap();
        assert_eq!(device.status, DeviceStatus::NeedsHelp);
        assert_eq!(device.last_error_code.as_deref(), Some("ds18b20_read_error"));
        assert!(changes
            .iter()
            .any(|c| matches!(&c.kind, ChangeKind::Incident { code, .. } if code == "ds18b20_read_error")));
    }

    #[tokio::test]
    async fn update_progression_ends_online_on_next_health() {
        let (store, _clock) = test_store();
        let id = "garage-controller";
        for status in [RunState::UpdateReceived, RunState::Updating, RunState::Updated] {
            store
                .apply(&Event::StatusUpdate {
                    device_id: id.to_string(),
                    status,
                })
                .await;
            let device = store.snapshot_device(id).await.unwrap();
            assert_eq!(device.status, DeviceStatus::Updating, "during {status:?}");
        }
        store
            .apply(&Event::Health {
                device_id: id.to_string(),
                state: HealthTopicState::Online,
            })
            .await;
        let device = store.snapshot_device(id).await.unwrap();
        assert_eq!(device.status, DeviceStatus::Online);
    }

    #[tokio::test]
    async fn telemetry_does_not_end_the_update_window() {
        let (store, _clock) = test_store();
        let id = "house-monitor";
        store
            .apply(&Event::StatusUpdate {
                device_id: id.to_string(),
                status: RunState::Updating,
            })
            .await;

        // A multi-sensor device keeps publishing readings mid-update;
        // none of them may flip it back online
        store
            .apply(&telemetry(id, "freezer_temperature_f_main", 1.2))
            .await;
        store
            .apply(&Event::DoorState {
                device_id: id.to_string(),
                scope: DoorScope::Freezer,
                state: DoorPosition::Closed,
            })
            .await;
        assert_eq!(
            store.snapshot_device(id).await.unwrap().status,
            DeviceStatus::Updating
        );

        store
            .apply(&Event::StatusUpdate {
                device_id: id.to_string(),
                status: RunState::Running,
            })
            .await;
        assert_eq!(
            store.snapshot_device(id).await.unwrap().status,
            DeviceStatus::Online
        );
    }

    #[tokio::test]
    async fn out_of_order_readings_are_discarded() {
        let (store, clock) = test_store();
        let late = Event::TelemetryReading {
            device_id: "garage-controller".to_string(),
            metric: "weather_temperature_f".to_string(),
            value: 71.0,
            ts: Some(clock.now()),
        };
        clock.advance(chrono::Duration::seconds(10));
        let early_ts = clock.now();
        store
            .apply(&Event::TelemetryReading {
                device_id: "garage-controller".to_string(),
                metric: "weather_temperature_f".to_string(),
                value: 75.0,
                ts: Some(early_ts),
            })
            .await;
        let changes = store.apply(&late).await;
        assert!(changes.iter().all(|c| !matches!(c.kind, ChangeKind::Reading { .. })));
        let device = store.snapshot_device("garage-controller").await.unwrap();
        let sample = device.metrics.get("weather_temperature_f").unwrap();
        assert!((sample.value - 75.0).abs() < f64::EPSILON);
        assert_eq!(sample.ts, early_ts);
    }

    #[tokio::test]
    async fn replaying_an_event_is_idempotent() {
        let (store, clock) = test_store();
        let event = Event::TelemetryReading {
            device_id: "garage-controller".to_string(),
            metric: "freezer_temperature_f".to_string(),
            value: 3.5,
            ts: Some(clock.now()),
        };
        let first = store.apply(&event).await;
        let snapshot_once = store.snapshot_device("garage-controller").await.unwrap();
        let second = store.apply(&event).await;
        let snapshot_twice = store.snapshot_device("garage-controller").await.unwrap();
        assert!(first.iter().any(|c| matches!(c.kind, ChangeKind::Reading { .. })));
        assert!(second.iter().all(|c| !matches!(c.kind, ChangeKind::Reading { .. })));
        assert_eq!(snapshot_once, snapshot_twice);
    }

    #[tokio::test]
    async fn sweeper_marks_silent_devices_offline_and_back() {
        let (store, clock) = test_store();
        store
            .apply(&telemetry("house-monitor", "freezer_temperature_f_main", 1.0))
            .await;
        clock.advance(chrono::Duration::seconds(89));
        assert!(store.sweep().await.is_empty());
        clock.advance(chrono::Duration::seconds(2));
        let changes = store.sweep().await;
        assert_eq!(changes.len(), 1);
        assert_eq!(
            store.snapshot_device("house-monitor").await.unwrap().status,
            DeviceStatus::Offline
        );
        store
            .apply(&telemetry("house-monitor", "freezer_temperature_f_main", 1.1))
            .await;
        assert_eq!(
            store.snapshot_device("house-monitor").await.unwrap().status,
            DeviceStatus::Online
        );
    }

    #[tokio::test]
    async fn freezer_streak_requires_consecutive_highs() {
        let (store, _clock) = test_store();
        store
            .apply(&telemetry("garage-controller", "freezer_temperature_f", 12.0))
            .await;
        let device = store.snapshot_device("garage-controller").await.unwrap();
        assert_eq!(device.freezer.as_ref().unwrap().high_temp_streak, 1);

        store
            .apply(&telemetry("garage-controller", "freezer_temperature_f", 4.0))
            .await;
        let device = store.snapshot_device("garage-controller").await.unwrap();
        assert_eq!(device.freezer.as_ref().unwrap().high_temp_streak, 0);

        store
            .apply(&telemetry("garage-controller", "freezer_temperature_f", 12.0))
            .await;
        store
            .apply(&telemetry("garage-controller", "freezer_temperature_f", 12.5))
            .await;
        let device = store.snapshot_device("garage-controller").await.unwrap();
        assert_eq!(device.freezer.as_ref().unwrap().high_temp_streak, 2);
    }

    #[tokio::test]
    async fn two_clean_statuses_clear_incidents_once() {
        let (store, _clock) = test_store();
        store
            .apply(&Event::Sos(SosReport {
                error: "sensor_fault".to_string(),
                message: None,
                timestamp: 1_749_000_000_000,
                device_id: "house-monitor".to_string(),
            }))
            .await;

        let first = store
            .apply(&Event::ConsolidatedStatus {
                device_id: "house-monitor".to_string(),
                report: clean_report(1_749_000_010_000),
            })
            .await;
        assert!(first.iter().all(|c| c.kind != ChangeKind::IncidentsCleared));

        let second = store
            .apply(&Event::ConsolidatedStatus {
                device_id: "house-monitor".to_string(),
                report: clean_report(1_749_000_040_000),
            })
            .await;
        assert!(second.iter().any(|c| c.kind == ChangeKind::IncidentsCleared));

        let third = store
            .apply(&Event::ConsolidatedStatus {
                device_id: "house-monitor".to_string(),
                report: clean_report(1_749_000_070_000),
            })
            .await;
        assert!(third.iter().all(|c| c.kind != ChangeKind::IncidentsCleared));
    }

    #[tokio::test]
    async fn power_change_is_edge_triggered() {
        let (store, _clock) = test_store();
        let offline = Event::PowerState {
            device_id: "house-monitor".to_string(),
            state: GridState::Offline,
        };
        let first = store.apply(&offline).await;
        assert!(first.iter().any(|c| c.kind == ChangeKind::Power));
        let second = store.apply(&offline).await;
        assert!(second.iter().all(|c| c.kind != ChangeKind::Power));
    }

    #[tokio::test]
    async fn door_and_light_views_follow_dedicated_topics() {
        let (store, _clock) = test_store();
        store
            .apply(&Event::DoorState {
                device_id: "garage-controller".to_string(),
                scope: DoorScope::Garage,
                state: DoorPosition::Opening,
            })
            .await;
        store
            .apply(&Event::LightState {
                device_id: "garage-controller".to_string(),
                state: SwitchState::On,
            })
            .await;
        let device = store.snapshot_device("garage-controller").await.unwrap();
        assert_eq!(device.door.as_ref().unwrap().state, DoorPosition::Opening);
        assert_eq!(device.light.as_ref().unwrap().state, SwitchState::On);
    }

    #[tokio::test]
    async fn boot_event_is_recorded_once() {
        let (store, _clock) = test_store();
        let boot = Event::Boot {
            device_id: "weather-station".to_string(),
            report: BootReport {
                ts: 1_749_000_000_000,
                reason: "watchdog".to_string(),
                success: true,
            },
        };
        let first = store.apply(&boot).await;
        assert!(first.iter().any(|c| matches!(c.kind, ChangeKind::Boot { .. })));
        let second = store.apply(&boot).await;
        assert!(second.iter().all(|c| !matches!(c.kind, ChangeKind::Boot { .. })));
    }
}
