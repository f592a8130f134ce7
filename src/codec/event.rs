//! Typed events produced by the codec
//!
//! A closed tagged-variant type at the decode boundary; every downstream
//! component consumes these instead of raw payload maps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Decoded bus event
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Lightweight progress string on `home/system/+/status`
    StatusUpdate { device_id: String, status: RunState },
    /// Numeric sample from a single-metric topic
    TelemetryReading {
        device_id: String,
        metric: String,
        value: f64,
        /// Present only when the payload carried its own timestamp;
        /// the state store assigns ingest time otherwise
        ts: Option<DateTime<Utc>>,
    },
    /// Door position, garage or freezer scope
    DoorState {
        device_id: String,
        scope: DoorScope,
        state: DoorPosition,
    },
    /// Flood light on/off
    LightState { device_id: String, state: SwitchState },
    /// City power grid presence
    PowerState { device_id: String, state: GridState },
    /// Liveness beacon from the power monitor
    PowerHeartbeat { device_id: String, ts: DateTime<Utc> },
    /// Device-originated problem report
    Sos(SosReport),
    /// Boot audit record
    Boot { device_id: String, report: BootReport },
    /// Application version string (retained by devices)
    Version { device_id: String, version: String },
    /// Health heartbeat, including the broker-published LWT `offline`
    Health {
        device_id: String,
        state: HealthTopicState,
    },
    /// Periodic atomic snapshot on `home/<device_id>/status`
    ConsolidatedStatus {
        device_id: String,
        report: DeviceReport,
    },
}

impl Event {
    /// Device the event belongs to
    pub fn device_id(&self) -> &str {
        match self {
            Event::StatusUpdate { device_id, .. }
            | Event::TelemetryReading { device_id, .. }
            | Event::DoorState { device_id, .. }
            | Event::LightState { device_id, .. }
            | Event::PowerState { device_id, .. }
            | Event::PowerHeartbeat { device_id, .. }
            | Event::Boot { device_id, .. }
            | Event::Version { device_id, .. }
            | Event::Health { device_id, .. }
            | Event::ConsolidatedStatus { device_id, .. } => device_id,
            Event::Sos(report) => &report.device_id,
        }
    }
}

/// Which door a [`Event::DoorState`] refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoorScope {
    Garage,
    Freezer,
}

/// Door position reported by devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoorPosition {
    Open,
    Closed,
    Opening,
    Closing,
    Error,
}

impl DoorPosition {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(DoorPosition::Open),
            "closed" => Some(DoorPosition::Closed),
            "opening" => Some(DoorPosition::Opening),
            "closing" => Some(DoorPosition::Closing),
            "error" => Some(DoorPosition::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DoorPosition::Open => "open",
            DoorPosition::Closed => "closed",
            DoorPosition::Opening => "opening",
            DoorPosition::Closing => "closing",
            DoorPosition::Error => "error",
        }
    }
}

/// Two-state switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchState {
    On,
    Off,
}

impl SwitchState {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "on" => Some(SwitchState::On),
            "off" => Some(SwitchState::Off),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SwitchState::On => "on",
            SwitchState::Off => "off",
        }
    }
}

/// City power presence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridState {
    Online,
    Offline,
}

impl GridState {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(GridState::Online),
            "offline" => Some(GridState::Offline),
            _ => None,
        }
    }
}

/// `home/system/+/status` payload values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    UpdateReceived,
    Updating,
    Updated,
    Alive,
    Offline,
}

impl RunState {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunState::Running),
            "update_received" => Some(RunState::UpdateReceived),
            "updating" => Some(RunState::Updating),
            "updated" => Some(RunState::Updated),
            "alive" => Some(RunState::Alive),
            "offline" => Some(RunState::Offline),
            _ => None,
        }
    }
}

/// `home/system/+/health` payload values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthTopicState {
    Online,
    Error,
    NeedsHelp,
    Offline,
}

impl HealthTopicState {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(HealthTopicState::Online),
            "error" => Some(HealthTopicState::Error),
            "needs_help" => Some(HealthTopicState::NeedsHelp),
            "offline" => Some(HealthTopicState::Offline),
            _ => None,
        }
    }
}

/// SOS payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SosReport {
    /// Taxonomy token, e.g. `ds18b20_read_error`
    pub error: String,
    #[serde(default)]
    pub message: Option<String>,
    /// Device epoch milliseconds
    pub timestamp: i64,
    #[serde(default)]
    pub device_id: String,
}

/// Boot payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootReport {
    /// Epoch milliseconds
    pub ts: i64,
    #[serde(default = "default_boot_reason")]
    pub reason: String,
    #[serde(default = "default_true")]
    pub success: bool,
}

fn default_boot_reason() -> String {
    "power_on".to_string()
}

fn default_true() -> bool {
    true
}

/// Overall health claimed by a consolidated status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportHealth {
    Online,
    Degraded,
}

/// Consolidated status payload (`home/<device_id>/status`)
///
/// Missing sections signal the device lacks that capability; the server
/// never infers a stale section as absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceReport {
    /// Epoch milliseconds
    pub timestamp: i64,
    #[serde(default)]
    pub uptime_s: i64,
    pub health: ReportHealth,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power: Option<PowerReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freezer: Option<FreezerReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weather: Option<WeatherReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub door: Option<DoorReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub light: Option<LightReport>,
    #[serde(default)]
    pub errors: Vec<ErrorEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerReport {
    pub city: GridState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreezerReport {
    pub temperature_f: Option<f64>,
    pub door: Option<String>,
    #[serde(default)]
    pub door_ajar_s: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherReport {
    pub temperature_f: Option<f64>,
    pub pressure_inhg: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bmp388_temperature_f: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoorReport {
    pub state: DoorPosition,
    #[serde(default)]
    pub open_switch: bool,
    #[serde(default)]
    pub closed_switch: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightReport {
    pub state: SwitchState,
}

/// Device error entry; unknown fields are kept in the catch-all map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub code: String,
    #[serde(default)]
    pub message: String,
    /// Epoch milliseconds the condition started
    #[serde(default)]
    pub since: i64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryReport {
    pub free: i64,
    pub allocated: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_state_serialization_matches_wire_strings() {
        let cases = vec![
            (RunState::Running, "running"),
            (RunState::UpdateReceived, "update_received"),
            (RunState::Updating, "updating"),
            (RunState::Updated, "updated"),
            (RunState::Alive, "alive"),
            (RunState::Offline, "offline"),
        ];
        for (state, expected) in cases {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{expected}\""));
            assert_eq!(RunState::parse(expected), Some(state));
        }
    }

    #[test]
    fn report_sections_default_to_absent() {
        let report: DeviceReport = serde_json::from_str(
            r#"{"timestamp": 1749000000000, "health": "online"}"#,
        )
        .unwrap();
        assert!(report.power.is_none());
        assert!(report.freezer.is_none());
        assert!(report.errors.is_empty());
    }
}
