//! Long-running tasks spawned next to the HTTP server.
//!
//! Each task accepts a [`CancellationToken`] for graceful shutdown.
//!
//! [`CancellationToken`]: tokio_util::sync::CancellationToken

pub mod reload;
