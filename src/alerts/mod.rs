//! Alert Evaluator - Active Alert Set
//!
//! ## Responsibilities
//!
//! - Pure predicates over the state-store snapshot plus open incidents
//! - Re-evaluate on every state change and at a 5 s tick
//! - Publish the latest set through a watch channel for fan-out
//!
//! Given the same snapshot the evaluator returns the same set; all debounce
//! state (consecutive-high streaks, clean streaks) lives in the state store.

use crate::clock::SharedClock;
use crate::persistence::{Incident, PersistenceWriter};
use crate::state_store::{DeviceState, DeviceStatus, StateStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

const EVALUATION_TICK: Duration = Duration::from_secs(5);

/// Stable alert codes
pub mod codes {
    pub const FREEZER_TEMP_HIGH: &str = "freezer_temp_high";
    pub const FREEZER_DOOR_AJAR: &str = "freezer_door_ajar";
    pub const CITY_POWER_OFFLINE: &str = "city_power_offline";
    pub const DEVICE_DEGRADED: &str = "device_degraded";
    pub const DEVICE_SILENT: &str = "device_silent";
    pub const WEATHER_STALE: &str = "weather_stale";
    pub const STORE_UNAVAILABLE: &str = "store_unavailable";
}

/// Derived, non-persistent alert entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveAlert {
    pub device_id: String,
    pub code: String,
    pub message: String,
    pub last_seen: DateTime<Utc>,
}

/// Predicate thresholds, lifted from [`crate::config::AppConfig`]
#[derive(Debug, Clone)]
pub struct AlertThresholds {
    pub offline_timeout: chrono::Duration,
    pub weather_stall_timeout: chrono::Duration,
    /// Freezer door open longer than this is ajar
    pub freezer_ajar_s: i64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            offline_timeout: chrono::Duration::seconds(90),
            weather_stall_timeout: chrono::Duration::seconds(120),
            freezer_ajar_s: 300,
        }
    }
}

/// Evaluate every predicate against a snapshot. Pure: no clock reads, no
/// I/O; `now` and the incident set come from the caller.
pub fn evaluate(
    snapshot: &HashMap<String, DeviceState>,
    open_incidents: &[Incident],
    now: DateTime<Utc>,
    thresholds: &AlertThresholds,
    store_degraded: bool,
) -> Vec<ActiveAlert> {
    let mut alerts = Vec::new();
    let mut seen: BTreeSet<(String, String)> = BTreeSet::new();

    let mut push = |alerts: &mut Vec<ActiveAlert>, alert: ActiveAlert| {
        if seen.insert((alert.device_id.clone(), alert.code.clone())) {
            alerts.push(alert);
        }
    };

    for device in snapshot.values() {
        if let Some(freezer) = &device.freezer {
            if freezer.high_temp_streak >= 2 {
                let temp = freezer.temperature_f.unwrap_or_default();
                push(
                    &mut alerts,
                    ActiveAlert {
                        device_id: device.device_id.clone(),
                        code: codes::FREEZER_TEMP_HIGH.to_string(),
                        message: format!("Freezer temperature critical: {temp:.1}°F"),
                        last_seen: freezer.updated_at,
                    },
                );
            }
            if freezer.door_ajar_s > thresholds.freezer_ajar_s {
                push(
                    &mut alerts,
                    ActiveAlert {
                        device_id: device.device_id.clone(),
                        code: codes::FREEZER_DOOR_AJAR.to_string(),
                        message: format!("Freezer door ajar for {}s", freezer.door_ajar_s),
                        last_seen: freezer.updated_at,
                    },
                );
            }
        }

        if let Some(power) = &device.power {
            if power.city == crate::codec::GridState::Offline {
                push(
                    &mut alerts,
                    ActiveAlert {
                        device_id: device.device_id.clone(),
                        code: codes::CITY_POWER_OFFLINE.to_string(),
                        message: "City power is offline".to_string(),
                        last_seen: power.updated_at,
                    },
                );
            }
        }

        let device_incident = open_incidents
            .iter()
            .filter(|i| i.device_id == device.device_id)
            .max_by_key(|i| i.last_seen);
        if device.status == DeviceStatus::NeedsHelp || device_incident.is_some() {
            let message = device_incident
                .map(|i| match &i.message {
                    Some(msg) => format!("{}: {}", i.code, msg),
                    None => i.code.clone(),
                })
                .unwrap_or_else(|| "Device requires attention".to_string());
            push(
                &mut alerts,
                ActiveAlert {
                    device_id: device.device_id.clone(),
                    code: codes::DEVICE_DEGRADED.to_string(),
                    message,
                    last_seen: device_incident
                        .map(|i| i.last_seen)
                        .or(device.last_seen)
                        .unwrap_or(now),
                },
            );
        }

        if let Some(last_seen) = device.last_seen {
            if device.ever_online && now - last_seen > thresholds.offline_timeout {
                push(
                    &mut alerts,
                    ActiveAlert {
                        device_id: device.device_id.clone(),
                        code: codes::DEVICE_SILENT.to_string(),
                        message: format!(
                            "No contact for {}s",
                            (now - last_seen).num_seconds()
                        ),
                        last_seen,
                    },
                );
            }
        }

        if device.status == DeviceStatus::Online {
            if let Some(weather) = &device.weather {
                if now - weather.updated_at > thresholds.weather_stall_timeout {
                    push(
                        &mut alerts,
                        ActiveAlert {
                            device_id: device.device_id.clone(),
                            code: codes::WEATHER_STALE.to_string(),
                            message: format!(
                                "No weather reading for {}s",
                                (now - weather.updated_at).num_seconds()
                            ),
                            last_seen: weather.updated_at,
                        },
                    );
                }
            }
        }
    }

    if store_degraded {
        push(
            &mut alerts,
            ActiveAlert {
                device_id: "server".to_string(),
                code: codes::STORE_UNAVAILABLE.to_string(),
                message: "History store writes are failing; live state unaffected".to_string(),
                last_seen: now,
            },
        );
    }

    alerts.sort_by(|a, b| (&a.device_id, &a.code).cmp(&(&b.device_id, &b.code)));
    alerts
}

/// Alert evaluator instance
pub struct AlertEvaluator {
    store: Arc<StateStore>,
    writer: Arc<PersistenceWriter>,
    clock: SharedClock,
    thresholds: AlertThresholds,
    latest: RwLock<Vec<ActiveAlert>>,
    publish: watch::Sender<Vec<ActiveAlert>>,
    /// Last successful incident fetch, reused when the store is down
    incident_cache: RwLock<Vec<Incident>>,
}

impl AlertEvaluator {
    pub fn new(
        store: Arc<StateStore>,
        writer: Arc<PersistenceWriter>,
        clock: SharedClock,
        thresholds: AlertThresholds,
    ) -> Arc<Self> {
        let (publish, _) = watch::channel(Vec::new());
        Arc::new(Self {
            store,
            writer,
            clock,
            thresholds,
            latest: RwLock::new(Vec::new()),
            publish,
            incident_cache: RwLock::new(Vec::new()),
        })
    }

    /// Subscribe to alert-set updates (fan-out uses this)
    pub fn watch(&self) -> watch::Receiver<Vec<ActiveAlert>> {
        self.publish.subscribe()
    }

    /// Latest evaluated set without recomputing
    pub async fn current(&self) -> Vec<ActiveAlert> {
        self.latest.read().await.clone()
    }

    /// Recompute the set from a fresh snapshot and the incident table
    pub async fn evaluate_now(&self) -> Vec<ActiveAlert> {
        let snapshot = self.store.snapshot_all().await;
        let incidents = match self.writer.repository().open_incidents().await {
            Ok(incidents) => {
                *self.incident_cache.write().await = incidents.clone();
                incidents
            }
            Err(e) => {
                tracing::warn!(error = %e, "Incident fetch failed, using cached set");
                self.incident_cache.read().await.clone()
            }
        };
        let alerts = evaluate(
            &snapshot,
            &incidents,
            self.clock.now(),
            &self.thresholds,
            !self.writer.healthy(),
        );

        let mut latest = self.latest.write().await;
        if *latest != alerts {
            tracing::info!(count = alerts.len(), "Active alert set changed");
            *latest = alerts.clone();
            let _ = self.publish.send(alerts.clone());
        }
        alerts
    }

    /// Re-evaluate on every state change and on a steady tick
    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let evaluator = self.clone();
        let mut changes = evaluator.store.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(EVALUATION_TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    received = changes.recv() => match received {
                        Ok(_) => {
                            evaluator.evaluate_now().await;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                            evaluator.evaluate_now().await;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    },
                    _ = tick.tick() => {
                        evaluator.evaluate_now().await;
                    }
                    _ = shutdown.changed() => return,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::GridState;
    use crate::state_store::{FreezerView, PowerView, WeatherView};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn device(id: &str) -> DeviceState {
        let mut d = DeviceState::new(id);
        d.status = DeviceStatus::Online;
        d.last_seen = Some(now());
        d.ever_online = true;
        d
    }

    fn snapshot_of(devices: Vec<DeviceState>) -> HashMap<String, DeviceState> {
        devices
            .into_iter()
            .map(|d| (d.device_id.clone(), d))
            .collect()
    }

    fn thresholds() -> AlertThresholds {
        AlertThresholds::default()
    }

    #[test]
    fn single_freezer_spike_does_not_alert() {
        let mut d = device("garage-controller");
        d.freezer = Some(FreezerView {
            temperature_f: Some(12.0),
            door: None,
            door_ajar_s: 0,
            updated_at: now(),
            high_temp_streak: 1,
        });
        let alerts = evaluate(&snapshot_of(vec![d]), &[], now(), &thresholds(), false);
        assert!(alerts.iter().all(|a| a.code != codes::FREEZER_TEMP_HIGH));
    }

    #[test]
    fn second_consecutive_high_reading_alerts_with_temperature() {
        let mut d = device("garage-controller");
        d.freezer = Some(FreezerView {
            temperature_f: Some(12.5),
            door: None,
            door_ajar_s: 0,
            updated_at: now(),
            high_temp_streak: 2,
        });
        let alerts = evaluate(&snapshot_of(vec![d]), &[], now(), &thresholds(), false);
        let alert = alerts
            .iter()
            .find(|a| a.code == codes::FREEZER_TEMP_HIGH)
            .expect("freezer alert");
        assert_eq!(alert.device_id, "garage-controller");
        assert!(alert.message.contains("12.5°F"), "{}", alert.message);
    }

    #[test]
    fn ajar_door_alerts_past_five_minutes() {
        let mut d = device("house-monitor");
        d.freezer = Some(FreezerView {
            temperature_f: Some(2.0),
            door: None,
            door_ajar_s: 301,
            updated_at: now(),
            high_temp_streak: 0,
        });
        let alerts = evaluate(&snapshot_of(vec![d]), &[], now(), &thresholds(), false);
        assert!(alerts.iter().any(|a| a.code == codes::FREEZER_DOOR_AJAR));
    }

    #[test]
    fn power_outage_surfaces_immediately_and_clears() {
        let mut d = device("house-monitor");
        d.power = Some(PowerView {
            city: GridState::Offline,
            heartbeat_at: None,
            updated_at: now(),
        });
        let snapshot = snapshot_of(vec![d.clone()]);
        let alerts = evaluate(&snapshot, &[], now(), &thresholds(), false);
        assert!(alerts.iter().any(|a| a.code == codes::CITY_POWER_OFFLINE));

        d.power.as_mut().unwrap().city = GridState::Online;
        let alerts = evaluate(&snapshot_of(vec![d]), &[], now(), &thresholds(), false);
        assert!(alerts.iter().all(|a| a.code != codes::CITY_POWER_OFFLINE));
    }

    #[test]
    fn open_incident_yields_one_degraded_entry() {
        let d = device("house-monitor");
        let incident = Incident {
            id: 1,
            device_id: "house-monitor".to_string(),
            code: "ds18b20_read_error".to_string(),
            message: Some("CRC mismatch".to_string()),
            first_seen: now(),
            last_seen: now(),
            resolved: false,
            resolution_note: None,
        };
        let alerts = evaluate(
            &snapshot_of(vec![d]),
            &[incident],
            now(),
            &thresholds(),
            false,
        );
        let degraded: Vec<_> = alerts
            .iter()
            .filter(|a| a.device_id == "house-monitor" && a.code == codes::DEVICE_DEGRADED)
            .collect();
        assert_eq!(degraded.len(), 1);
        assert!(degraded[0].message.contains("CRC mismatch"));
    }

    #[test]
    fn silent_device_alerts_after_threshold() {
        let mut d = device("weather-station");
        d.last_seen = Some(now() - chrono::Duration::seconds(120));
        let alerts = evaluate(&snapshot_of(vec![d]), &[], now(), &thresholds(), false);
        assert!(alerts.iter().any(|a| a.code == codes::DEVICE_SILENT));
    }

    #[test]
    fn never_online_device_is_not_silent() {
        let mut d = device("weather-station");
        d.ever_online = false;
        d.last_seen = Some(now() - chrono::Duration::seconds(600));
        let alerts = evaluate(&snapshot_of(vec![d]), &[], now(), &thresholds(), false);
        assert!(alerts.iter().all(|a| a.code != codes::DEVICE_SILENT));
    }

    #[test]
    fn stale_weather_alerts_only_while_online() {
        let mut d = device("garage-controller");
        d.weather = Some(WeatherView {
            temperature_f: Some(70.0),
            pressure_inhg: Some(29.9),
            bmp388_temperature_f: None,
            updated_at: now() - chrono::Duration::seconds(180),
        });
        let alerts = evaluate(
            &snapshot_of(vec![d.clone()]),
            &[],
            now(),
            &thresholds(),
            false,
        );
        assert!(alerts.iter().any(|a| a.code == codes::WEATHER_STALE));

        d.status = DeviceStatus::Offline;
        let alerts = evaluate(&snapshot_of(vec![d]), &[], now(), &thresholds(), false);
        assert!(alerts.iter().all(|a| a.code != codes::WEATHER_STALE));
    }

    #[test]
    fn evaluation_is_deterministic() {
        let mut a = device("garage-controller");
        a.freezer = Some(FreezerView {
            temperature_f: Some(14.0),
            door: None,
            door_ajar_s: 400,
            updated_at: now(),
            high_temp_streak: 3,
        });
        let mut b = device("house-monitor");
        b.power = Some(PowerView {
            city: GridState::Offline,
            heartbeat_at: None,
            updated_at: now(),
        });
        let snapshot = snapshot_of(vec![a, b]);
        let first = evaluate(&snapshot, &[], now(), &thresholds(), true);
        let second = evaluate(&snapshot, &[], now(), &thresholds(), true);
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }
}
