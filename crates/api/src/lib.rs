//! pglua HTTP server library.
//!
//! Exposes the building blocks (config, route table, dispatcher, router,
//! hot reload) so integration tests and the binary entrypoint can both
//! access them.

pub mod background;
pub mod cli;
pub mod config;
pub mod config_script;
pub mod dispatch;
pub mod error;
pub mod router;
pub mod routes;
pub mod state;
