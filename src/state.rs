//! Application state
//!
//! Holds all shared components; the supervisor wires them at startup and
//! the web layer clones this into every handler.

use crate::alerts::AlertEvaluator;
use crate::bus::BusHandle;
use crate::commands::CommandDispatcher;
use crate::config::AppConfig;
use crate::fanout::FanoutHub;
use crate::ota::OtaOrchestrator;
use crate::persistence::PersistenceWriter;
use crate::state_store::StateStore;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Immutable boot-time configuration
    pub config: AppConfig,
    /// Authoritative live state
    pub store: Arc<StateStore>,
    /// History writer and repository access
    pub writer: Arc<PersistenceWriter>,
    /// Outbound bus publishes
    pub bus: BusHandle,
    /// Client intents
    pub dispatcher: Arc<CommandDispatcher>,
    /// Update manifests
    pub ota: Arc<OtaOrchestrator>,
    /// Active alert set
    pub alerts: Arc<AlertEvaluator>,
    /// Streaming clients
    pub fanout: Arc<FanoutHub>,
}
