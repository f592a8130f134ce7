//! End-to-end pipeline tests: bus payloads through the codec into the state
//! store, with alerts evaluated over the resulting snapshot. No broker or
//! database; this is the pure core of the ingest path.

use chrono::{TimeZone, Utc};
use hearthd::alerts::{self, codes, AlertThresholds};
use hearthd::clock::{Clock, ManualClock};
use hearthd::codec::{CodecRegistry, Command, DoorCommand, Event};
use hearthd::state_store::{DeviceStatus, StateStore};
use std::sync::Arc;
use std::time::Duration;

fn fixture() -> (CodecRegistry, Arc<StateStore>, ManualClock) {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap());
    let store = Arc::new(StateStore::new(
        Arc::new(clock.clone()),
        Duration::from_secs(90),
        256,
    ));
    (CodecRegistry::new(), store, clock)
}

async fn ingest(registry: &CodecRegistry, store: &StateStore, topic: &str, payload: &[u8]) {
    let event = registry
        .decode(topic, payload)
        .expect("decode")
        .expect("event");
    store.apply(&event).await;
}

#[tokio::test]
async fn door_command_round_trip_reaches_queryable_state() {
    let (registry, store, _clock) = fixture();

    // The server publishes exactly the wire form the device expects
    let (topic, payload) = registry.encode_command(&Command::Door(DoorCommand::Toggle));
    assert_eq!(topic, "home/garage/door/command");
    assert_eq!(payload, b"toggle");

    // The device answers with its status progression
    ingest(&registry, &store, "home/garage/door/status", b"opening").await;
    let device = store.snapshot_device("garage-controller").await.unwrap();
    assert_eq!(device.door.as_ref().unwrap().state.as_str(), "opening");

    ingest(&registry, &store, "home/garage/door/status", b"open").await;
    let device = store.snapshot_device("garage-controller").await.unwrap();
    assert_eq!(device.door.as_ref().unwrap().state.as_str(), "open");
}

#[tokio::test]
async fn freezer_critical_needs_two_consecutive_highs() {
    let (registry, store, clock) = fixture();
    let thresholds = AlertThresholds::default();

    ingest(&registry, &store, "home/garage/freezer/temperature", b"12.0").await;
    let snapshot = store.snapshot_all().await;
    let alerts = alerts::evaluate(&snapshot, &[], clock.now(), &thresholds, false);
    assert!(alerts.iter().all(|a| a.code != codes::FREEZER_TEMP_HIGH));

    clock.advance(chrono::Duration::seconds(30));
    ingest(&registry, &store, "home/garage/freezer/temperature", b"12.5").await;
    let snapshot = store.snapshot_all().await;
    let alerts = alerts::evaluate(&snapshot, &[], clock.now(), &thresholds, false);
    let alert = alerts
        .iter()
        .find(|a| a.code == codes::FREEZER_TEMP_HIGH)
        .expect("freezer alert after second high reading");
    assert_eq!(alert.device_id, "garage-controller");
    assert!(alert.message.contains("12.5°F"));
}

#[tokio::test]
async fn power_outage_alert_follows_the_grid() {
    let (registry, store, clock) = fixture();
    let thresholds = AlertThresholds::default();

    ingest(&registry, &store, "home/power/city/status", b"offline").await;
    let alerts = alerts::evaluate(
        &store.snapshot_all().await,
        &[],
        clock.now(),
        &thresholds,
        false,
    );
    assert!(alerts.iter().any(|a| a.code == codes::CITY_POWER_OFFLINE));

    ingest(&registry, &store, "home/power/city/status", b"online").await;
    let alerts = alerts::evaluate(
        &store.snapshot_all().await,
        &[],
        clock.now(),
        &thresholds,
        false,
    );
    assert!(alerts.iter().all(|a| a.code != codes::CITY_POWER_OFFLINE));
}

#[tokio::test]
async fn ota_status_progression_ends_online() {
    let (registry, store, _clock) = fixture();
    let id = "garage-controller";

    ingest(&registry, &store, "home/garage/light/status", b"off").await;
    for status in ["update_received", "updating", "updated"] {
        ingest(
            &registry,
            &store,
            &format!("home/system/{id}/status"),
            status.as_bytes(),
        )
        .await;
        // Sensor traffic interleaved with the update must not end it
        ingest(&registry, &store, "home/garage/freezer/temperature", b"3.1").await;
        assert_eq!(
            store.snapshot_device(id).await.unwrap().status,
            DeviceStatus::Updating,
            "still updating during {status}"
        );
    }

    ingest(&registry, &store, &format!("home/system/{id}/health"), b"online").await;
    assert_eq!(
        store.snapshot_device(id).await.unwrap().status,
        DeviceStatus::Online
    );
}

#[tokio::test]
async fn sos_then_clean_statuses_resolve_the_incident_flow() {
    let (registry, store, _clock) = fixture();

    let sos = br#"{"error":"ds18b20_read_error","message":"CRC mismatch","timestamp":1749000000000,"device_id":"house-monitor"}"#;
    ingest(&registry, &store, "home/system/house-monitor/sos", sos).await;
    let device = store.snapshot_device("house-monitor").await.unwrap();
    assert_eq!(device.status, DeviceStatus::NeedsHelp);

    // A repeated sos must not disturb the open-incident invariant; the
    // store emits another upsert for the same (device, code) pair
    ingest(&registry, &store, "home/system/house-monitor/sos", sos).await;

    let clean = br#"{"timestamp": 1749000060000, "health": "online", "errors": []}"#;
    let first = registry
        .decode("home/house-monitor/status", clean)
        .unwrap()
        .unwrap();
    let changes = store.apply(&first).await;
    assert!(!changes
        .iter()
        .any(|c| c.kind == hearthd::state_store::ChangeKind::IncidentsCleared));

    let clean2 = br#"{"timestamp": 1749000090000, "health": "online", "errors": []}"#;
    let second = registry
        .decode("home/house-monitor/status", clean2)
        .unwrap()
        .unwrap();
    let changes = store.apply(&second).await;
    assert!(changes
        .iter()
        .any(|c| c.kind == hearthd::state_store::ChangeKind::IncidentsCleared));
}

#[tokio::test]
async fn offline_sweep_and_recovery() {
    let (registry, store, clock) = fixture();

    ingest(&registry, &store, "home/garage/weather/temperature", b"70.1").await;
    clock.advance(chrono::Duration::seconds(91));
    store.sweep().await;
    assert_eq!(
        store.snapshot_device("garage-controller").await.unwrap().status,
        DeviceStatus::Offline
    );

    ingest(&registry, &store, "home/garage/weather/temperature", b"70.2").await;
    assert_eq!(
        store.snapshot_device("garage-controller").await.unwrap().status,
        DeviceStatus::Online
    );
}

#[tokio::test]
async fn replayed_events_do_not_change_state() {
    let (registry, store, clock) = fixture();

    let event: Event = registry
        .decode("home/freezer/temperature/main", b"-2.5")
        .unwrap()
        .unwrap();
    store.apply(&event).await;
    let once = store.snapshot_device("house-monitor").await.unwrap();

    // Same payload again within the same instant
    let _ = clock.now();
    store.apply(&event).await;
    let twice = store.snapshot_device("house-monitor").await.unwrap();
    assert_eq!(once, twice);
}
