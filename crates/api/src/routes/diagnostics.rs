//! Diagnostics endpoint mounted by `enableProfilerRoute`.

use std::sync::atomic::Ordering;

use chrono::Utc;
use pglua_core::http::ResponseParts;
use serde::Serialize;

use crate::dispatch::Dispatcher;
use crate::routes::table::RouteTable;

#[derive(Debug, Serialize)]
pub struct DiagnosticsResponse {
    pub version: &'static str,
    pub uptime_secs: i64,
    pub requests: u64,
    pub script_failures: u64,
    pub not_found: u64,
    pub reloads: u64,
    pub reload_failures: u64,
    pub routes: Vec<RouteSummary>,
    pub globals: Vec<String>,
    pub table_loaded_at: String,
}

#[derive(Debug, Serialize)]
pub struct RouteSummary {
    pub methods: Vec<String>,
    pub path: String,
    pub script: String,
}

pub fn snapshot(dispatcher: &Dispatcher, table: &RouteTable) -> DiagnosticsResponse {
    let stats = dispatcher.stats();
    DiagnosticsResponse {
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: (Utc::now() - dispatcher.started_at()).num_seconds(),
        requests: stats.requests.load(Ordering::Relaxed),
        script_failures: stats.script_failures.load(Ordering::Relaxed),
        not_found: stats.not_found.load(Ordering::Relaxed),
        reloads: stats.reloads.load(Ordering::Relaxed),
        reload_failures: stats.reload_failures.load(Ordering::Relaxed),
        routes: table
            .routes
            .iter()
            .map(|route| RouteSummary {
                methods: route.methods.clone(),
                path: route.pattern.as_str().to_string(),
                script: route.script.clone(),
            })
            .collect(),
        globals: table.globals.iter().map(|(name, _)| name.clone()).collect(),
        table_loaded_at: table.loaded_at.to_rfc3339(),
    }
}

/// The snapshot as a JSON response.
pub fn report(dispatcher: &Dispatcher, table: &RouteTable) -> ResponseParts {
    let body = serde_json::to_vec(&snapshot(dispatcher, table)).unwrap_or_default();
    ResponseParts {
        status: Some(200),
        headers: vec![("Content-Type".to_string(), "application/json".to_string())],
        body,
    }
}
