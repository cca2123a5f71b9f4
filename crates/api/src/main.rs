use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pglua_api::background::reload;
use pglua_api::cli::{exit_success, Cli, Command, ExecArgs, ServerArgs};
use pglua_api::config::ServerConfig;
use pglua_api::config_script::load_route_table;
use pglua_api::dispatch::Dispatcher;
use pglua_api::router::build_app_router;
use pglua_api::routes::RouteTable;
use pglua_api::state::AppState;
use pglua_core::transaction::TransactionSource;
use pglua_core::PrintSink;
use pglua_db::{DbPool, PgTransactionSource};

const DEFAULT_LOG_FILTER: &str = "pglua_api=debug,pglua_core=info,tower_http=debug";

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // --- Tracing ---
    // `exec` prints the response body on stdout, so its logs go to stderr.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    match cli.command {
        Command::Server(_) => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
        Command::Exec(_) => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }

    let result = match cli.command {
        Command::Server(args) => serve(args).await.map(|()| ExitCode::SUCCESS),
        Command::Exec(args) => exec(args).await,
    };

    result.unwrap_or_else(|e| {
        tracing::error!(error = %format!("{e:#}"), "Command failed");
        ExitCode::FAILURE
    })
}

async fn serve(args: ServerArgs) -> anyhow::Result<()> {
    // --- Configuration ---
    let mut config = ServerConfig::from_env()?;
    if let Some(addr) = args.bind_addr {
        config.bind_addr = addr;
    }
    tracing::info!(bind_addr = %config.bind_addr, "Loaded server configuration");

    // --- Database ---
    let pool = connect(args.postgres_config.or(config.database_url.clone())).await?;
    let source: Arc<dyn TransactionSource> =
        Arc::new(PgTransactionSource::from_current(pool.clone()));

    // --- Route table ---
    let print = PrintSink::log();
    let table = load_table(args.config.clone(), print.clone()).await?;
    let dispatcher = Arc::new(Dispatcher::new(table, source, print.clone()));

    // --- Hot reload ---
    let cancel = CancellationToken::new();
    let watcher = tokio::spawn(reload::run(
        Arc::clone(&dispatcher),
        args.config,
        print,
        Duration::from_millis(config.reload_interval_ms),
        cancel.clone(),
    ));

    // --- Router ---
    let state = AppState {
        dispatcher,
        config: Arc::new(config.clone()),
    };
    let app = build_app_router(state, &config);

    // --- Start server ---
    tracing::info!(addr = %config.bind_addr, "Starting server");
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");
    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), watcher).await;
    pool.close().await;
    tracing::info!("Graceful shutdown complete");
    Ok(())
}

async fn exec(args: ExecArgs) -> anyhow::Result<ExitCode> {
    let config = ServerConfig::from_env()?;
    let request = args.to_request()?;

    let pool = connect(args.postgres_config.clone().or(config.database_url.clone())).await?;
    let source: Arc<dyn TransactionSource> =
        Arc::new(PgTransactionSource::from_current(pool.clone()));

    let print = if args.no_print {
        PrintSink::null()
    } else {
        PrintSink::log()
    };
    let table = load_table(args.config.clone(), print.clone()).await?;
    let state = AppState {
        dispatcher: Arc::new(Dispatcher::new(table, source, print)),
        config: Arc::new(config.clone()),
    };

    let response = build_app_router(state, &config).oneshot(request).await?;
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .context("Failed to read response body")?;
    println!("{}", String::from_utf8_lossy(&body));

    pool.close().await;
    Ok(if exit_success(status.as_u16()) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn connect(database_url: Option<String>) -> anyhow::Result<DbPool> {
    let database_url =
        database_url.context("PGLUA_POSTGRES_CONFIG or DATABASE_URL must be set")?;

    let pool = pglua_db::create_pool(&database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connection pool created");

    pglua_db::health_check(&pool)
        .await
        .context("Database health check failed")?;
    tracing::info!("Database health check passed");
    Ok(pool)
}

/// Run the config script on a blocking worker; the first load is fatal.
async fn load_table(path: PathBuf, print: PrintSink) -> anyhow::Result<RouteTable> {
    let table = tokio::task::spawn_blocking(move || load_route_table(&path, print))
        .await
        .context("Config loader panicked")??;
    Ok(table)
}

/// Wait for SIGINT or SIGTERM to initiate graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
