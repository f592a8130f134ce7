//! API Routes

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use crate::alerts::ActiveAlert;
use crate::codec::{DoorCommand, DoorPosition, LightCommand, SwitchState};
use crate::error::{Error, Result};
use crate::models::{Accepted, OtaManifest};
use crate::persistence::{Bucket, WeatherHistoryPoint};
use crate::state::AppState;
use crate::state_store::{DeviceState, DeviceStatus};

const READ_DEADLINE: Duration = Duration::from_secs(2);
const WRITE_DEADLINE: Duration = Duration::from_secs(5);

/// Create API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health & streaming
        .route("/healthz", get(super::health_check))
        .route("/ws", get(super::ws::ws_handler))
        // Weather
        .route("/api/weather/current", get(get_weather_current))
        .route("/api/weather/history", get(get_weather_history))
        // Freezer
        .route("/api/freezer", get(get_freezer_state))
        // Garage door & light
        .route("/api/garage/door", get(get_door_state))
        .route("/api/garage/door/:command", post(send_door_command))
        .route("/api/garage/light/state", get(get_light_state))
        .route("/api/garage/light/toggle", post(toggle_light))
        .route("/api/garage/light/:state", post(set_light_state))
        // Devices
        .route("/api/devices", get(list_devices))
        .route("/api/devices/:id", get(get_device))
        .route("/api/devices/:id/reboot", post(reboot_device))
        .route("/api/devices/:id/ping", post(ping_device))
        .route("/api/devices/:id/update", post(trigger_update))
        .route("/api/devices/:id/update/preview", get(preview_update))
        // Alerts & incidents
        .route("/api/alerts", get(current_alerts))
        .route(
            "/api/incidents/:device_id/:code/resolve",
            post(resolve_incident),
        )
        .with_state(state)
}

async fn with_deadline<T>(
    deadline: Duration,
    what: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(what.to_string())),
    }
}

// ========================================
// Weather & Freezer
// ========================================

#[derive(Debug, Serialize)]
struct WeatherNow {
    temperature_f: Option<f64>,
    pressure_inhg: Option<f64>,
}

async fn get_weather_current(State(state): State<AppState>) -> Json<WeatherNow> {
    let snapshot = state.store.snapshot_all().await;
    let weather = snapshot
        .values()
        .filter_map(|d| d.weather.as_ref())
        .max_by_key(|w| w.updated_at);
    Json(WeatherNow {
        temperature_f: weather.and_then(|w| w.temperature_f),
        pressure_inhg: weather.and_then(|w| w.pressure_inhg),
    })
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    range: Option<String>,
    bucket: Option<String>,
}

async fn get_weather_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<WeatherHistoryPoint>>> {
    let bucket = match query.bucket.as_deref() {
        None => Bucket::Hour,
        Some(raw) => Bucket::parse(raw)
            .ok_or_else(|| Error::Validation(format!("unknown bucket {raw:?}")))?,
    };
    let now = Utc::now();
    let range = match query.range.as_deref() {
        None | Some("24h") => chrono::Duration::hours(24),
        Some("7d") => chrono::Duration::days(7),
        Some("30d") => chrono::Duration::days(30),
        Some(other) => {
            return Err(Error::Validation(format!("unknown range {other:?}")));
        }
    };
    let end = query.end.unwrap_or(now);
    let start = query.start.unwrap_or(end - range);
    if start >= end {
        return Err(Error::Validation("start must precede end".to_string()));
    }

    let points = with_deadline(
        READ_DEADLINE,
        "weather history",
        state.writer.repository().weather_history(start, end, bucket),
    )
    .await?;
    Ok(Json(points))
}

#[derive(Debug, Serialize)]
struct FreezerNow {
    temperature_f: Option<f64>,
}

async fn get_freezer_state(State(state): State<AppState>) -> Json<FreezerNow> {
    let snapshot = state.store.snapshot_all().await;
    let freezer = snapshot
        .values()
        .filter_map(|d| d.freezer.as_ref())
        .max_by_key(|f| f.updated_at);
    Json(FreezerNow {
        temperature_f: freezer.and_then(|f| f.temperature_f),
    })
}

// ========================================
// Garage Door & Light
// ========================================

#[derive(Debug, Serialize)]
struct DoorNow {
    state: Option<DoorPosition>,
}

async fn get_door_state(State(state): State<AppState>) -> Json<DoorNow> {
    let snapshot = state.store.snapshot_all().await;
    let door = snapshot
        .values()
        .filter_map(|d| d.door.as_ref())
        .max_by_key(|d| d.updated_at);
    Json(DoorNow {
        state: door.map(|d| d.state),
    })
}

async fn send_door_command(
    State(state): State<AppState>,
    Path(command): Path<String>,
) -> Result<Json<Accepted>> {
    let command = DoorCommand::parse(&command)
        .ok_or_else(|| Error::Validation(format!("unknown door command {command:?}")))?;
    let result = with_deadline(WRITE_DEADLINE, "door command", async {
        state.dispatcher.door(command)
    })
    .await;
    Ok(Json(accepted_from(result)?))
}

#[derive(Debug, Serialize)]
struct LightNow {
    state: Option<SwitchState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_updated: Option<DateTime<Utc>>,
}

async fn get_light_state(State(state): State<AppState>) -> Json<LightNow> {
    let snapshot = state.store.snapshot_all().await;
    let light = snapshot
        .values()
        .filter_map(|d| d.light.as_ref())
        .max_by_key(|l| l.updated_at);
    Json(LightNow {
        state: light.map(|l| l.state),
        last_updated: light.map(|l| l.updated_at),
    })
}

async fn toggle_light(State(state): State<AppState>) -> Result<Json<Accepted>> {
    let result = with_deadline(WRITE_DEADLINE, "light toggle", async {
        state.dispatcher.light_toggle()
    })
    .await;
    Ok(Json(accepted_from(result)?))
}

async fn set_light_state(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> Result<Json<Accepted>> {
    let command = LightCommand::parse(&raw)
        .ok_or_else(|| Error::Validation(format!("unknown light state {raw:?}")))?;
    let result = with_deadline(WRITE_DEADLINE, "light command", async {
        state.dispatcher.light(command)
    })
    .await;
    Ok(Json(accepted_from(result)?))
}

/// Map a dispatch result onto the `{accepted, reason}` contract; only bus
/// saturation downgrades to a soft refusal
fn accepted_from(result: Result<()>) -> Result<Accepted> {
    match result {
        Ok(()) => Ok(Accepted::yes()),
        Err(Error::BusUnavailable(_)) => Ok(Accepted::no("bus_unavailable")),
        Err(e) => Err(e),
    }
}

// ========================================
// Devices
// ========================================

/// Registry projection of a device
#[derive(Debug, Serialize)]
struct DeviceInfo {
    device_id: String,
    status: DeviceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_seen: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_boot: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rssi: Option<i32>,
}

impl From<&DeviceState> for DeviceInfo {
    fn from(device: &DeviceState) -> Self {
        Self {
            device_id: device.device_id.clone(),
            status: device.status,
            last_seen: device.last_seen,
            version: device.version.clone(),
            last_boot: device.last_boot,
            last_error_code: device.last_error_code.clone(),
            ip_address: device.ip_address.clone(),
            rssi: device.rssi,
        }
    }
}

async fn list_devices(State(state): State<AppState>) -> Json<HashMap<String, DeviceInfo>> {
    let snapshot = state.store.snapshot_all().await;
    Json(
        snapshot
            .iter()
            .map(|(id, device)| (id.clone(), DeviceInfo::from(device)))
            .collect(),
    )
}

async fn get_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeviceState>> {
    state
        .store
        .snapshot_device(&id)
        .await
        .map(Json)
        .ok_or(Error::UnknownDevice(id))
}

async fn reboot_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Accepted>> {
    let result = with_deadline(WRITE_DEADLINE, "reboot", state.dispatcher.reboot(&id)).await;
    Ok(Json(accepted_from(result)?))
}

async fn ping_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Accepted>> {
    let result = with_deadline(WRITE_DEADLINE, "ping", state.dispatcher.ping(&id)).await;
    Ok(Json(accepted_from(result)?))
}

// ========================================
// OTA
// ========================================

#[derive(Debug, Default, Deserialize)]
struct TriggerUpdateRequest {
    #[serde(rename = "ref")]
    r#ref: Option<String>,
}

#[derive(Debug, Serialize)]
struct TriggerUpdateResponse {
    accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    manifest: Option<OtaManifest>,
}

async fn trigger_update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<TriggerUpdateRequest>>,
) -> Result<Json<TriggerUpdateResponse>> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let result = with_deadline(
        WRITE_DEADLINE,
        "trigger update",
        state.ota.trigger(&id, request.r#ref.as_deref()),
    )
    .await;
    match result {
        Ok(manifest) => Ok(Json(TriggerUpdateResponse {
            accepted: true,
            reason: None,
            manifest: Some(manifest),
        })),
        Err(Error::BusUnavailable(_)) => Ok(Json(TriggerUpdateResponse {
            accepted: false,
            reason: Some("bus_unavailable".to_string()),
            manifest: None,
        })),
        Err(e) => Err(e),
    }
}

#[derive(Debug, Deserialize)]
struct PreviewQuery {
    #[serde(rename = "ref")]
    r#ref: Option<String>,
}

async fn preview_update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<PreviewQuery>,
) -> Result<Json<OtaManifest>> {
    let manifest = with_deadline(
        READ_DEADLINE,
        "preview manifest",
        state.ota.build_manifest(&id, query.r#ref.as_deref()),
    )
    .await?;
    Ok(Json(manifest))
}

// ========================================
// Alerts & Incidents
// ========================================

async fn current_alerts(State(state): State<AppState>) -> Result<Json<Vec<ActiveAlert>>> {
    let alerts = with_deadline(READ_DEADLINE, "alerts", async {
        Ok(state.alerts.evaluate_now().await)
    })
    .await?;
    Ok(Json(alerts))
}

#[derive(Debug, Default, Deserialize)]
struct ResolveRequest {
    note: Option<String>,
}

async fn resolve_incident(
    State(state): State<AppState>,
    Path((device_id, code)): Path<(String, String)>,
    body: Option<Json<ResolveRequest>>,
) -> Result<Json<Accepted>> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let resolved = with_deadline(
        WRITE_DEADLINE,
        "resolve incident",
        state
            .writer
            .repository()
            .resolve_incident(&device_id, &code, request.note.as_deref()),
    )
    .await?;
    if resolved > 0 {
        Ok(Json(Accepted::yes()))
    } else {
        Ok(Json(Accepted::no("no_open_incident")))
    }
}
