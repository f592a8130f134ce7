//! State store data types

use crate::codec::{DoorPosition, GridState, SwitchState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Freezer temperature above this is critical (two consecutive readings alert)
pub const FREEZER_CRITICAL_F: f64 = 10.0;

/// Consecutive clean consolidated statuses before open incidents auto-resolve
pub const CLEAR_STREAK_FOR_RESOLUTION: u32 = 2;

/// Device lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    /// Initial state, never published to clients
    Unknown,
    Online,
    Offline,
    NeedsHelp,
    Updating,
    Error,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Unknown => "unknown",
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::NeedsHelp => "needs_help",
            DeviceStatus::Updating => "updating",
            DeviceStatus::Error => "error",
        }
    }
}

/// One retained sample per metric
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub value: f64,
    pub ts: DateTime<Utc>,
}

/// Garage door view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoorView {
    pub state: DoorPosition,
    #[serde(default)]
    pub open_switch: bool,
    #[serde(default)]
    pub closed_switch: bool,
    pub updated_at: DateTime<Utc>,
}

/// Flood light view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightView {
    pub state: SwitchState,
    pub updated_at: DateTime<Utc>,
}

/// City power view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerView {
    pub city: GridState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Freezer view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreezerView {
    pub temperature_f: Option<f64>,
    pub door: Option<DoorPosition>,
    #[serde(default)]
    pub door_ajar_s: i64,
    pub updated_at: DateTime<Utc>,
    /// Consecutive samples above [`FREEZER_CRITICAL_F`]; server-internal
    #[serde(skip)]
    pub high_temp_streak: u32,
}

/// Weather view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherView {
    pub temperature_f: Option<f64>,
    pub pressure_inhg: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bmp388_temperature_f: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

/// Authoritative per-device view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub device_id: String,
    pub status: DeviceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_boot: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i32>,
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricSample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub door: Option<DoorView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub light: Option<LightView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power: Option<PowerView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freezer: Option<FreezerView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weather: Option<WeatherView>,
    /// Consecutive clean `errors: []` consolidated statuses; server-internal
    #[serde(skip)]
    pub clear_error_streak: u32,
    /// Whether the device has ever been observed online; server-internal
    #[serde(skip)]
    pub ever_online: bool,
}

impl DeviceState {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            status: DeviceStatus::Unknown,
            last_seen: None,
            version: None,
            last_boot: None,
            last_error_code: None,
            ip_address: None,
            rssi: None,
            metrics: BTreeMap::new(),
            door: None,
            light: None,
            power: None,
            freezer: None,
            weather: None,
            clear_error_streak: 0,
            ever_online: false,
        }
    }
}

/// Coarse change record emitted by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub device_id: String,
    pub kind: ChangeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<serde_json::Value>,
    pub ts: DateTime<Utc>,
}

/// What transitioned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeKind {
    /// Device status automaton transition
    Status,
    /// Accepted telemetry sample
    Reading { metric: String, value: f64 },
    /// Garage door section
    Door,
    /// Flood light section
    Light,
    /// City power section
    Power,
    /// Freezer section
    Freezer,
    /// Weather section
    Weather,
    /// Boot audit event
    Boot { reason: String, success: bool },
    /// Open-or-refresh of an incident for `(device_id, code)`
    Incident { code: String, message: String },
    /// Device reported clean twice in a row; open incidents resolve
    IncidentsCleared,
    /// Version/ip/rssi registry fields
    DeviceInfo,
}

impl ChangeKind {
    /// Readings may be shed under backpressure; everything else is preserved
    pub fn sheddable(&self) -> bool {
        matches!(self, ChangeKind::Reading { .. })
    }
}
