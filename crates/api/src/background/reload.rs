//! Hot reload of the route table when the config file changes.
//!
//! The file's modification time and length are polled on a fixed interval.
//! A change rebuilds the whole table on a blocking worker and swaps it into
//! the dispatcher. A rebuild that fails leaves the previous table serving.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use pglua_core::PrintSink;
use tokio_util::sync::CancellationToken;

use crate::config_script::load_route_table;
use crate::dispatch::Dispatcher;
use crate::error::ConfigError;

/// What identifies one version of the config file.
type Fingerprint = (Option<SystemTime>, u64);

async fn fingerprint(path: &Path) -> Option<Fingerprint> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    Some((meta.modified().ok(), meta.len()))
}

/// Rebuild the table from `path` and swap it in. Blocking.
///
/// On failure the active table is kept and the error returned.
pub fn reload_now(
    dispatcher: &Dispatcher,
    path: &Path,
    print: PrintSink,
) -> Result<usize, ConfigError> {
    match load_route_table(path, print) {
        Ok(table) => {
            let routes = table.routes.len();
            dispatcher.replace_table(table);
            tracing::info!(config = %path.display(), routes, "Route table reloaded");
            Ok(routes)
        }
        Err(e) => {
            dispatcher.record_reload_failure();
            tracing::error!(
                config = %path.display(),
                error = %e,
                "Reload failed, keeping the previous route table"
            );
            Err(e)
        }
    }
}

/// Watch `path` until `cancel` fires.
pub async fn run(
    dispatcher: Arc<Dispatcher>,
    path: PathBuf,
    print: PrintSink,
    interval: Duration,
    cancel: CancellationToken,
) {
    tracing::info!(
        config = %path.display(),
        interval_ms = interval.as_millis() as u64,
        "Config watcher started"
    );

    let mut last = fingerprint(&path).await;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Config watcher stopping");
                break;
            }
            _ = ticker.tick() => {
                let current = fingerprint(&path).await;
                if current == last {
                    continue;
                }
                if current.is_none() {
                    // Mid-save; the next tick sees the new file.
                    tracing::debug!(config = %path.display(), "Config file missing");
                    continue;
                }
                last = current;

                let dispatcher = Arc::clone(&dispatcher);
                let path = path.clone();
                let print = print.clone();
                let result = tokio::task::spawn_blocking(move || {
                    reload_now(&dispatcher, &path, print).map(|_| ())
                })
                .await;
                if let Err(e) = result {
                    tracing::error!(error = %e, "Reload task panicked");
                }
            }
        }
    }
}
