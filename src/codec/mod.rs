//! Codec Registry - Topic/Payload Translation
//!
//! ## Responsibilities
//!
//! - Map an incoming topic to a decoder producing a typed [`Event`]
//! - Map a logical [`Command`] to an outgoing (topic, payload) pair
//! - Topic pattern matching with `+`/`#` wildcards, most specific first
//!
//! Decoders are pure and never block. Malformed payloads and unexpected
//! topics under `home/` yield a [`DecodeError`]; topics outside the `home/`
//! hierarchy decode to `Ok(None)` and are ignored by the caller.

mod event;

pub use event::{
    BootReport, DeviceReport, DoorPosition, DoorReport, DoorScope, ErrorEntry, Event,
    FreezerReport, GridState, HealthTopicState, LightReport, MemoryReport, PowerReport,
    ReportHealth, RunState, SosReport, SwitchState, WeatherReport,
};

use crate::models::OtaManifest;
use chrono::{DateTime, TimeZone, Utc};

/// Device that owns the fixed `home/garage/**` topics
pub const GARAGE_DEVICE_ID: &str = "garage-controller";
/// Device that owns the fixed `home/freezer/**` and `home/power/**` topics
pub const HOUSE_DEVICE_ID: &str = "house-monitor";

/// Decode failure; contained at the adapter boundary, never fatal
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Topic under `home/` with no registered decoder
    #[error("unknown topic: {0}")]
    UnknownTopic(String),
    /// Registered topic with a payload that does not parse
    #[error("malformed payload on {topic}: {reason}")]
    Malformed { topic: String, reason: String },
}

/// Logical command kinds accepted from clients
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Door(DoorCommand),
    Light(LightCommand),
    Reboot { device_id: String },
    Ping { device_id: String },
    Update { device_id: String, manifest: OtaManifest },
}

/// Garage door actuation
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoorCommand {
    Open,
    Close,
    Toggle,
}

impl DoorCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            DoorCommand::Open => "open",
            DoorCommand::Close => "close",
            DoorCommand::Toggle => "toggle",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(DoorCommand::Open),
            "close" => Some(DoorCommand::Close),
            "toggle" => Some(DoorCommand::Toggle),
            _ => None,
        }
    }
}

/// Flood light actuation
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LightCommand {
    On,
    Off,
    Toggle,
}

impl LightCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            LightCommand::On => "on",
            LightCommand::Off => "off",
            LightCommand::Toggle => "toggle",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "on" => Some(LightCommand::On),
            "off" => Some(LightCommand::Off),
            "toggle" => Some(LightCommand::Toggle),
            _ => None,
        }
    }
}

/// Per-pattern decoder selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderKind {
    Consolidated,
    GarageDoorStatus,
    GarageLightStatus,
    WeatherTemperature,
    WeatherPressure,
    GarageFreezerTemperature,
    PowerStatus,
    PowerHeartbeat,
    FreezerProbeTemperature,
    FreezerDoorStatus,
    FreezerDoorAjar,
    SystemStatus,
    SystemSos,
    SystemHealth,
    SystemVersion,
    SystemBoot,
    // Outgoing topics, recognized so encode/decode round-trips
    GarageDoorCommand,
    GarageLightCommand,
    SystemReboot,
    SystemPing,
    SystemUpdate,
}

struct Route {
    pattern: &'static str,
    kind: DecoderKind,
}

/// Returns true when `pattern` (with `+`/`#` wildcards) matches `topic`
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pat = pattern.split('/');
    let mut top = topic.split('/');
    loop {
        match (pat.next(), top.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(p), Some(t)) if p == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Literal-segment count; higher wins when several patterns match
fn specificity(pattern: &str) -> usize {
    pattern
        .split('/')
        .filter(|s| *s != "+" && *s != "#")
        .count()
}

/// Codec registry instance
pub struct CodecRegistry {
    routes: Vec<Route>,
}

impl CodecRegistry {
    /// Create the registry with the full topic set
    pub fn new() -> Self {
        let routes = vec![
            Route { pattern: "home/+/status", kind: DecoderKind::Consolidated },
            Route { pattern: "home/garage/door/status", kind: DecoderKind::GarageDoorStatus },
            Route { pattern: "home/garage/door/command", kind: DecoderKind::GarageDoorCommand },
            Route { pattern: "home/garage/light/status", kind: DecoderKind::GarageLightStatus },
            Route { pattern: "home/garage/light/command", kind: DecoderKind::GarageLightCommand },
            Route { pattern: "home/garage/weather/temperature", kind: DecoderKind::WeatherTemperature },
            Route { pattern: "home/garage/weather/pressure", kind: DecoderKind::WeatherPressure },
            Route { pattern: "home/garage/freezer/temperature", kind: DecoderKind::GarageFreezerTemperature },
            Route { pattern: "home/power/city/status", kind: DecoderKind::PowerStatus },
            Route { pattern: "home/power/city/heartbeat", kind: DecoderKind::PowerHeartbeat },
            Route { pattern: "home/freezer/temperature/+", kind: DecoderKind::FreezerProbeTemperature },
            Route { pattern: "home/freezer/door/status", kind: DecoderKind::FreezerDoorStatus },
            Route { pattern: "home/freezer/door/ajar_time", kind: DecoderKind::FreezerDoorAjar },
            Route { pattern: "home/system/+/status", kind: DecoderKind::SystemStatus },
            Route { pattern: "home/system/+/sos", kind: DecoderKind::SystemSos },
            Route { pattern: "home/system/+/health", kind: DecoderKind::SystemHealth },
            Route { pattern: "home/system/+/version", kind: DecoderKind::SystemVersion },
            Route { pattern: "home/system/+/boot", kind: DecoderKind::SystemBoot },
            Route { pattern: "home/system/+/reboot", kind: DecoderKind::SystemReboot },
            Route { pattern: "home/system/+/ping", kind: DecoderKind::SystemPing },
            Route { pattern: "home/system/+/update", kind: DecoderKind::SystemUpdate },
        ];
        Self { routes }
    }

    /// Topic patterns the bus adapter subscribes to
    pub fn subscriptions(&self) -> Vec<&'static str> {
        self.routes
            .iter()
            .filter(|r| {
                !matches!(
                    r.kind,
                    DecoderKind::GarageDoorCommand
                        | DecoderKind::GarageLightCommand
                        | DecoderKind::SystemReboot
                        | DecoderKind::SystemPing
                        | DecoderKind::SystemUpdate
                )
            })
            .map(|r| r.pattern)
            .collect()
    }

    fn resolve(&self, topic: &str) -> Option<&Route> {
        // Most specific pattern wins; ties break by registration order
        // because max_by_key keeps the last max and we scan in reverse.
        self.routes
            .iter()
            .rev()
            .filter(|r| topic_matches(r.pattern, topic))
            .max_by_key(|r| specificity(r.pattern))
    }

    /// Decode an incoming message
    ///
    /// `Ok(None)` means the topic is outside the `home/` hierarchy and should
    /// be silently ignored.
    pub fn decode(&self, topic: &str, payload: &[u8]) -> Result<Option<Event>, DecodeError> {
        let route = match self.resolve(topic) {
            Some(r) => r,
            None if !topic.starts_with("home/") => return Ok(None),
            None => return Err(DecodeError::UnknownTopic(topic.to_string())),
        };

        let text = std::str::from_utf8(payload).map_err(|_| DecodeError::Malformed {
            topic: topic.to_string(),
            reason: "payload is not valid UTF-8".to_string(),
        })?;
        let text = text.trim();

        let event = match route.kind {
            DecoderKind::Consolidated => {
                let device_id = segment(topic, 1)?.to_string();
                let report: DeviceReport = parse_json(topic, text)?;
                Event::ConsolidatedStatus { device_id, report }
            }
            DecoderKind::GarageDoorStatus => Event::DoorState {
                device_id: GARAGE_DEVICE_ID.to_string(),
                scope: DoorScope::Garage,
                state: DoorPosition::parse(text).ok_or_else(|| malformed(topic, text))?,
            },
            DecoderKind::GarageLightStatus => Event::LightState {
                device_id: GARAGE_DEVICE_ID.to_string(),
                state: SwitchState::parse(text).ok_or_else(|| malformed(topic, text))?,
            },
            DecoderKind::WeatherTemperature => telemetry(
                GARAGE_DEVICE_ID,
                "weather_temperature_f",
                topic,
                text,
            )?,
            DecoderKind::WeatherPressure => telemetry(
                GARAGE_DEVICE_ID,
                "weather_pressure_inhg",
                topic,
                text,
            )?,
            DecoderKind::GarageFreezerTemperature => telemetry(
                GARAGE_DEVICE_ID,
                "freezer_temperature_f",
                topic,
                text,
            )?,
            DecoderKind::PowerStatus => Event::PowerState {
                device_id: HOUSE_DEVICE_ID.to_string(),
                state: GridState::parse(text).ok_or_else(|| malformed(topic, text))?,
            },
            DecoderKind::PowerHeartbeat => Event::PowerHeartbeat {
                device_id: HOUSE_DEVICE_ID.to_string(),
                ts: parse_epoch_ms(topic, text)?,
            },
            DecoderKind::FreezerProbeTemperature => {
                let probe = segment(topic, 3)?;
                telemetry(
                    HOUSE_DEVICE_ID,
                    &format!("freezer_temperature_f_{probe}"),
                    topic,
                    text,
                )?
            }
            DecoderKind::FreezerDoorStatus => Event::DoorState {
                device_id: HOUSE_DEVICE_ID.to_string(),
                scope: DoorScope::Freezer,
                state: match text {
                    "open" => DoorPosition::Open,
                    "closed" => DoorPosition::Closed,
                    _ => return Err(malformed(topic, text)),
                },
            },
            DecoderKind::FreezerDoorAjar => telemetry(
                HOUSE_DEVICE_ID,
                "freezer_door_ajar_s",
                topic,
                text,
            )?,
            DecoderKind::SystemStatus => Event::StatusUpdate {
                device_id: segment(topic, 2)?.to_string(),
                status: RunState::parse(text).ok_or_else(|| malformed(topic, text))?,
            },
            DecoderKind::SystemSos => {
                let device_in_topic = segment(topic, 2)?.to_string();
                let mut report: SosReport = parse_json(topic, text)?;
                if report.device_id.is_empty() {
                    report.device_id = device_in_topic;
                }
                Event::Sos(report)
            }
            DecoderKind::SystemHealth => Event::Health {
                device_id: segment(topic, 2)?.to_string(),
                state: HealthTopicState::parse(text).ok_or_else(|| malformed(topic, text))?,
            },
            DecoderKind::SystemVersion => Event::Version {
                device_id: segment(topic, 2)?.to_string(),
                version: text.to_string(),
            },
            DecoderKind::SystemBoot => {
                let device_id = segment(topic, 2)?.to_string();
                // Bootstrap firmware historically published a bare epoch-ms
                // integer; accept it alongside the structured form.
                let report = if let Ok(ms) = text.parse::<i64>() {
                    BootReport {
                        ts: ms,
                        reason: "power_on".to_string(),
                        success: true,
                    }
                } else {
                    parse_json(topic, text)?
                };
                Event::Boot { device_id, report }
            }
            DecoderKind::GarageDoorCommand
            | DecoderKind::GarageLightCommand
            | DecoderKind::SystemReboot
            | DecoderKind::SystemPing
            | DecoderKind::SystemUpdate => {
                // Server-published topics; devices consume these. Seeing one
                // here means a misconfigured subscription, not device input.
                return Err(DecodeError::UnknownTopic(topic.to_string()));
            }
        };
        Ok(Some(event))
    }

    /// Encode a logical command into its (topic, payload) pair
    pub fn encode_command(&self, command: &Command) -> (String, Vec<u8>) {
        match command {
            Command::Door(cmd) => (
                "home/garage/door/command".to_string(),
                cmd.as_str().as_bytes().to_vec(),
            ),
            Command::Light(cmd) => (
                "home/garage/light/command".to_string(),
                cmd.as_str().as_bytes().to_vec(),
            ),
            Command::Reboot { device_id } => {
                (format!("home/system/{device_id}/reboot"), b"{}".to_vec())
            }
            Command::Ping { device_id } => {
                (format!("home/system/{device_id}/ping"), b"{}".to_vec())
            }
            Command::Update {
                device_id,
                manifest,
            } => (
                format!("home/system/{device_id}/update"),
                serde_json::to_vec(manifest).unwrap_or_default(),
            ),
        }
    }

    /// Inverse of [`encode_command`]; used by tests and the topic echo tool
    pub fn decode_command(&self, topic: &str, payload: &[u8]) -> Result<Command, DecodeError> {
        let route = self
            .resolve(topic)
            .ok_or_else(|| DecodeError::UnknownTopic(topic.to_string()))?;
        let text = std::str::from_utf8(payload).map_err(|_| DecodeError::Malformed {
            topic: topic.to_string(),
            reason: "payload is not valid UTF-8".to_string(),
        })?;
        match route.kind {
            DecoderKind::GarageDoorCommand => DoorCommand::parse(text)
                .map(Command::Door)
                .ok_or_else(|| malformed(topic, text)),
            DecoderKind::GarageLightCommand => LightCommand::parse(text)
                .map(Command::Light)
                .ok_or_else(|| malformed(topic, text)),
            DecoderKind::SystemReboot => Ok(Command::Reboot {
                device_id: segment(topic, 2)?.to_string(),
            }),
            DecoderKind::SystemPing => Ok(Command::Ping {
                device_id: segment(topic, 2)?.to_string(),
            }),
            DecoderKind::SystemUpdate => Ok(Command::Update {
                device_id: segment(topic, 2)?.to_string(),
                manifest: parse_json(topic, text)?,
            }),
            _ => Err(DecodeError::UnknownTopic(topic.to_string())),
        }
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn segment(topic: &str, idx: usize) -> Result<&str, DecodeError> {
    topic
        .split('/')
        .nth(idx)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| DecodeError::Malformed {
            topic: topic.to_string(),
            reason: format!("missing topic segment {idx}"),
        })
}

fn malformed(topic: &str, text: &str) -> DecodeError {
    DecodeError::Malformed {
        topic: topic.to_string(),
        reason: format!("unexpected payload {text:?}"),
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(topic: &str, text: &str) -> Result<T, DecodeError> {
    serde_json::from_str(text).map_err(|e| DecodeError::Malformed {
        topic: topic.to_string(),
        reason: e.to_string(),
    })
}

fn telemetry(
    device_id: &str,
    metric: &str,
    topic: &str,
    text: &str,
) -> Result<Event, DecodeError> {
    let value: f64 = text.parse().map_err(|_| malformed(topic, text))?;
    Ok(Event::TelemetryReading {
        device_id: device_id.to_string(),
        metric: metric.to_string(),
        value,
        ts: None,
    })
}

fn parse_epoch_ms(topic: &str, text: &str) -> Result<DateTime<Utc>, DecodeError> {
    let ms: i64 = text.parse().map_err(|_| malformed(topic, text))?;
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| malformed(topic, text))
}
