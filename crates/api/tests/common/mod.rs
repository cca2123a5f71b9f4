#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use tempfile::TempDir;
use tower::ServiceExt;

use pglua_api::config::ServerConfig;
use pglua_api::config_script::build_route_table;
use pglua_api::dispatch::Dispatcher;
use pglua_api::router::build_app_router;
use pglua_api::state::AppState;
use pglua_core::transaction::{
    DbError, FieldValue, RowSet, SqlParam, Transaction, TransactionSource,
};
use pglua_core::PrintSink;

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        database_url: None,
        request_timeout_secs: 30,
        reload_interval_ms: 20,
        max_body_bytes: 64 * 1024,
    }
}

pub fn write_script(dir: &TempDir, relative: &str, source: &str) {
    let path = dir.path().join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, source).unwrap();
}

pub fn config_path(dir: &TempDir) -> PathBuf {
    dir.path().join("config.lua")
}

/// Dispatcher over `config.lua` in `dir`, with output discarded.
pub fn build_dispatcher(dir: &TempDir, source: &RecordingSource) -> Arc<Dispatcher> {
    let table = build_route_table(&config_path(dir), PrintSink::null()).unwrap();
    Arc::new(Dispatcher::new(
        table,
        Arc::new(source.clone()),
        PrintSink::null(),
    ))
}

/// Build the full application router, with the same middleware stack the
/// binary uses.
pub fn build_test_app(dispatcher: Arc<Dispatcher>) -> Router {
    let config = test_config();
    let state = AppState {
        dispatcher,
        config: Arc::new(config.clone()),
    };
    build_app_router(state, &config)
}

pub async fn send(app: Router, method: Method, uri: &str, json: Option<&str>) -> Response<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match json {
        Some(json) => {
            builder = builder.header("Content-Type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    app.oneshot(builder.body(body).unwrap()).await.unwrap()
}

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    send(app, Method::GET, uri, None).await
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    let bytes = http_body_util::BodyExt::collect(response.into_body())
        .await
        .unwrap()
        .to_bytes();
    bytes.to_vec()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// What the fake database saw.
#[derive(Debug, Default)]
pub struct TxLog {
    pub statements: Vec<String>,
    pub begins: usize,
    pub commits: usize,
    pub rollbacks: usize,
}

/// Transaction source that records statements instead of running them.
/// Statements containing `bad` fail.
#[derive(Clone, Default)]
pub struct RecordingSource {
    pub log: Arc<Mutex<TxLog>>,
}

impl RecordingSource {
    pub fn statements(&self) -> Vec<String> {
        self.log.lock().unwrap().statements.clone()
    }
}

impl TransactionSource for RecordingSource {
    fn begin(&self) -> Result<Box<dyn Transaction>, DbError> {
        self.log.lock().unwrap().begins += 1;
        Ok(Box::new(RecordingTransaction {
            log: Arc::clone(&self.log),
        }))
    }
}

struct RecordingTransaction {
    log: Arc<Mutex<TxLog>>,
}

impl Transaction for RecordingTransaction {
    fn execute(&mut self, sql: &str, _params: &[SqlParam]) -> Result<u64, DbError> {
        self.log.lock().unwrap().statements.push(sql.to_string());
        if sql.contains("bad") {
            return Err(DbError::Statement(format!("syntax error in {sql}")));
        }
        Ok(1)
    }

    fn query(&mut self, sql: &str, params: &[SqlParam]) -> Result<RowSet, DbError> {
        self.execute(sql, params)?;
        Ok(RowSet::new(
            vec!["n".to_string()],
            [vec![FieldValue::Int(1)], vec![FieldValue::Int(2)]],
        ))
    }

    fn commit(&mut self) -> Result<(), DbError> {
        self.log.lock().unwrap().commits += 1;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), DbError> {
        self.log.lock().unwrap().rollbacks += 1;
        Ok(())
    }
}
