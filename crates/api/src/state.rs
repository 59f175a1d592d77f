use std::sync::Arc;

use loregen_engine::FlowService;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable (inner data is behind `Arc`).
#[derive(Clone)]
pub struct AppState {
    /// The orchestrator facade every control operation goes through.
    pub service: Arc<FlowService>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
}
