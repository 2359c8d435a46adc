//! HTTP Server
//!
//! One axum router serves the Telegram webhook, published response pages,
//! uploaded file downloads and a health endpoint.

use crate::app::App;
use crate::render::response_page;
use crate::telegram::UpdateRouter;
use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use teloxide::types::Update;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

pub const NOT_FOUND_TEXT: &str = "Response not found or expired.";
const FILE_NOT_FOUND_TEXT: &str = "File not found or expired.";

/// State shared across handlers
#[derive(Clone)]
pub struct WebState {
    pub app: Arc<App>,
    pub updates: Arc<UpdateRouter>,
    pub version: &'static str,
}

impl WebState {
    pub fn new(app: Arc<App>) -> Self {
        let updates = Arc::new(UpdateRouter::new(app.clone()));
        Self {
            app,
            updates,
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    /// ISO 8601
    pub timestamp: String,
}

/// Build the router with all routes and middleware
pub fn build_router(state: WebState) -> Router {
    let log_requests = state.app.config().log_requests;

    let mut router = Router::new()
        .route("/", get(index_handler).post(webhook_handler))
        .route("/health", get(health_check))
        .route("/files/{*key}", get(file_handler))
        .route("/{id}", get(response_handler))
        .with_state(state);

    if log_requests {
        router = router.layer(TraceLayer::new_for_http());
    }

    router
}

/// Serve until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("HTTP server listening on {}", addr);
    }

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("HTTP server shut down gracefully");
    Ok(())
}

/// Telegram webhook: acknowledge at once, process in the background
async fn webhook_handler(State(state): State<WebState>, body: Bytes) -> StatusCode {
    let update: Update = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(e) => {
            warn!("Rejecting malformed update: {}", e);
            return StatusCode::BAD_REQUEST;
        }
    };

    let updates = state.updates.clone();
    tokio::spawn(async move {
        if let Err(e) = updates.handle_update(update).await {
            error!("Failed to handle update: {:#}", e);
        }
    });

    StatusCode::OK
}

async fn index_handler(State(state): State<WebState>) -> Response {
    render_response(&state, "").await
}

async fn response_handler(State(state): State<WebState>, Path(id): Path<String>) -> Response {
    render_response(&state, &id).await
}

async fn render_response(state: &WebState, id: &str) -> Response {
    if id.is_empty() {
        return (StatusCode::NOT_FOUND, NOT_FOUND_TEXT).into_response();
    }

    match state.app.responses().record(id).await {
        Some(record) => Html(response_page(&record, state.app.now())).into_response(),
        None => {
            debug!("Response {} not found", id);
            (StatusCode::NOT_FOUND, NOT_FOUND_TEXT).into_response()
        }
    }
}

/// Stream a live uploaded file
async fn file_handler(State(state): State<WebState>, Path(key): Path<String>) -> Response {
    let key = key.trim_start_matches('/');

    if key.split('/').any(|segment| segment == "..") {
        return StatusCode::BAD_REQUEST.into_response();
    }

    let Some(file) = state.app.artifacts().get_by_key(key).await else {
        return (StatusCode::NOT_FOUND, FILE_NOT_FOUND_TEXT).into_response();
    };

    let mime = mime_guess::from_path(&file.info.file_name)
        .first_or_octet_stream()
        .to_string();
    let etag = format!("\"{}\"", hex::encode(Sha256::digest(&file.body)));

    match Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, mime)
        .header(header::ETAG, etag)
        .body(Body::from(file.body))
    {
        Ok(response) => response,
        Err(e) => {
            error!("Failed to build file response for {}: {}", key, e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Used by load balancers and monitoring systems
async fn health_check(State(state): State<WebState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: state.version,
        uptime_secs: state.app.uptime().as_secs(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
