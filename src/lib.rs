//! hearthd - Home Automation Control Plane
//!
//! Server-side coordination engine for a small fleet of sensor/actuator
//! nodes speaking MQTT.
//!
//! ## Architecture (10 Components)
//!
//! 1. CodecRegistry - topic/payload translation at the bus boundary
//! 2. StateStore - authoritative in-memory snapshot with change stream
//! 3. PersistenceWriter - batched history writes to PostgreSQL
//! 4. BusAdapter - sole owner of the broker connection
//! 5. AlertEvaluator - pure predicates over live state
//! 6. OtaOrchestrator - device-scoped update manifests
//! 7. CommandDispatcher - client intents to bus publishes
//! 8. WebAPI - request/response query surface
//! 9. FanoutHub - coalesced streaming distribution to clients
//! 10. Supervisor - startup/shutdown ordering and bus restarts
//!
//! ## Design Principles
//!
//! - The bus adapter and sweeper are the only state writers
//! - Every queue between components is bounded with an explicit
//!   overflow policy
//! - Device problems become incidents or counters, never crashes

pub mod alerts;
pub mod bus;
pub mod clock;
pub mod codec;
pub mod commands;
pub mod config;
pub mod error;
pub mod fanout;
pub mod models;
pub mod ota;
pub mod persistence;
pub mod state;
pub mod state_store;
pub mod supervisor;
pub mod web_api;

pub use config::AppConfig;
pub use error::{Error, Result};
pub use state::AppState;
