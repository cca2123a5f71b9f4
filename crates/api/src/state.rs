use std::sync::Arc;

use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;

/// Shared application state available to all Axum handlers via `State<AppState>`.
#[derive(Clone)]
pub struct AppState {
    /// Route table and script runner.
    pub dispatcher: Arc<Dispatcher>,
    pub config: Arc<ServerConfig>,
}
