//! Shared application router builder.
//!
//! Provides [`build_app_router`] so the server, the `exec` command and the
//! integration tests all use the exact same middleware stack.

use std::net::SocketAddr;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::HOST;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use axum::Router;
use pglua_core::http::{HttpRequest, ResponseParts};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::config::ServerConfig;
use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// Build the full application [`Router`] with all middleware layers.
///
/// Every request falls through to the script dispatcher. The middleware
/// stack is applied bottom-up:
///
/// 1. Set request ID on incoming requests
/// 2. Structured request/response tracing
/// 3. Propagate request ID to response
/// 4. Request timeout
/// 5. Panic recovery (catch panics, return 500)
pub fn build_app_router(state: AppState, config: &ServerConfig) -> Router {
    let request_id_header = HeaderName::from_static("x-request-id");

    Router::new()
        .fallback(dispatch_request)
        // -- Middleware stack (applied bottom-up) --
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(config.request_timeout_secs),
        ))
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
        .with_state(state)
}

/// Fallback handler: convert the request, run the script on a blocking
/// worker, convert the result back.
async fn dispatch_request(State(state): State<AppState>, request: Request) -> AppResult<Response> {
    let request = into_script_request(request, state.config.max_body_bytes).await?;
    let dispatcher = state.dispatcher.clone();

    let parts = tokio::task::spawn_blocking(move || dispatcher.dispatch(request))
        .await
        .map_err(|e| AppError::InternalError(format!("dispatch task failed: {e}")))??;

    Ok(into_response(parts))
}

async fn into_script_request(request: Request, limit: usize) -> AppResult<HttpRequest> {
    let (parts, body) = request.into_parts();

    let remote_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string());
    let host = parts
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|a| a.to_string()))
        .unwrap_or_default();
    let headers = parts
        .headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    let body: Bytes = axum::body::to_bytes(body, limit)
        .await
        .map_err(|_| AppError::PayloadTooLarge(limit))?;

    Ok(HttpRequest {
        method: parts.method.as_str().to_string(),
        host,
        path: parts.uri.path().to_string(),
        query: parts.uri.query().unwrap_or_default().to_string(),
        tls: parts.uri.scheme_str() == Some("https"),
        remote_addr,
        headers,
        body: body.to_vec(),
        ..HttpRequest::default()
    })
}

fn into_response(parts: ResponseParts) -> Response {
    let status = parts
        .status
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut response = Response::new(Body::from(parts.body));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    for (name, value) in parts.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => tracing::warn!(header = %name, "Dropping invalid response header"),
        }
    }
    response
}
