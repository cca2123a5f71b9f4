//! Runs one routed script per request against the active route table.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use pglua_core::engine::from_json;
use pglua_core::http::{HttpRequest, ResponseParts, ResponseWriter};
use pglua_core::state::{DATABASE_POOL, HTTP_REQUEST, HTTP_RESPONSE_WRITER};
use pglua_core::transaction::TransactionSource;
use pglua_core::{ExecutionContext, ModuleLoader, ModuleRegistry, PrintSink, RunOutcome};

use crate::error::{AppError, AppResult};
use crate::routes::diagnostics;
use crate::routes::table::{Lookup, Route, RouteTable};

/// Counters reported by the diagnostics endpoint.
#[derive(Debug, Default)]
pub struct DispatchStats {
    pub requests: AtomicU64,
    pub script_failures: AtomicU64,
    pub not_found: AtomicU64,
    pub reloads: AtomicU64,
    pub reload_failures: AtomicU64,
}

impl DispatchStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct Dispatcher {
    table: RwLock<Arc<RouteTable>>,
    source: Arc<dyn TransactionSource>,
    registry: Arc<ModuleRegistry>,
    print: PrintSink,
    stats: DispatchStats,
    started_at: DateTime<Utc>,
}

impl Dispatcher {
    pub fn new(table: RouteTable, source: Arc<dyn TransactionSource>, print: PrintSink) -> Self {
        Self::with_registry(table, source, print, Arc::new(ModuleRegistry::builtin()))
    }

    pub fn with_registry(
        table: RouteTable,
        source: Arc<dyn TransactionSource>,
        print: PrintSink,
        registry: Arc<ModuleRegistry>,
    ) -> Self {
        Self {
            table: RwLock::new(Arc::new(table)),
            source,
            registry,
            print,
            stats: DispatchStats::default(),
            started_at: Utc::now(),
        }
    }

    /// The active table. Callers keep using the returned snapshot even if a
    /// reload swaps in a new one meanwhile.
    pub fn table(&self) -> Arc<RouteTable> {
        Arc::clone(&self.table.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Swap in a fully built table.
    pub fn replace_table(&self, table: RouteTable) {
        let table = Arc::new(table);
        *self.table.write().unwrap_or_else(PoisonError::into_inner) = table;
        DispatchStats::bump(&self.stats.reloads);
    }

    pub fn record_reload_failure(&self) {
        DispatchStats::bump(&self.stats.reload_failures);
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Route `request` and run its script. Blocking: call from a blocking
    /// worker, never from an async task.
    pub fn dispatch(&self, mut request: HttpRequest) -> AppResult<ResponseParts> {
        DispatchStats::bump(&self.stats.requests);
        let table = self.table();

        match table.lookup(&request.method, &request.path) {
            Lookup::Matched { route, vars } => {
                request.path_vars = vars;
                self.run_route(&table, route, request)
            }
            Lookup::MethodNotAllowed => Err(AppError::MethodNotAllowed {
                method: request.method,
                path: request.path,
            }),
            Lookup::NotFound if table.is_profiler_path(&request.path) => {
                Ok(diagnostics::report(self, &table))
            }
            Lookup::NotFound => {
                DispatchStats::bump(&self.stats.not_found);
                Err(AppError::NotFound(request.path))
            }
        }
    }

    fn run_route(
        &self,
        table: &RouteTable,
        route: &Route,
        request: HttpRequest,
    ) -> AppResult<ResponseParts> {
        let writer = Arc::new(ResponseWriter::new());
        writer.set_header("Content-Type", "application/json");

        let ctx = self.prepare(table, route, request, &writer)?;
        let context = ctx.name().to_string();

        match ctx.execute() {
            RunOutcome::Completed(_) | RunOutcome::EarlyExit => {}
            RunOutcome::Failed(err) => {
                DispatchStats::bump(&self.stats.script_failures);
                tracing::error!(context = %context, error = %err, "Script failed");
                // A response already on its way stays as written.
                let _ = writer.write(500, Vec::new());
            }
        }

        let mut parts = writer.snapshot();
        parts.status.get_or_insert(200);
        Ok(parts)
    }

    fn prepare(
        &self,
        table: &RouteTable,
        route: &Route,
        request: HttpRequest,
        writer: &Arc<ResponseWriter>,
    ) -> AppResult<ExecutionContext> {
        let internal = |e: &dyn std::fmt::Display| AppError::InternalError(e.to_string());

        let mut ctx = ExecutionContext::with_registry(
            &table.root_dir,
            &route.script,
            self.print.clone(),
            Arc::clone(&self.registry),
        )
        .map_err(|e| internal(&e))?;

        let loader = ModuleLoader::new_root(&ctx);
        loader
            .set_state(&DATABASE_POOL, Arc::clone(&self.source))
            .and_then(|()| loader.set_state(&HTTP_REQUEST, Arc::new(request)))
            .and_then(|()| loader.set_state(&HTTP_RESPONSE_WRITER, Arc::clone(writer)))
            .map_err(|e| internal(&e))?;
        ctx.attach_loader(loader);

        for (name, value) in &table.globals {
            let value = from_json(ctx.lua(), value).map_err(|e| internal(&e))?;
            ctx.predeclare(name, value).map_err(|e| internal(&e))?;
        }
        Ok(ctx)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("routes", &self.table().routes.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
