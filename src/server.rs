//! HTTP surface for crawl control and document access.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/crawl/start` | Start a crawl; responds with `text/event-stream` |
//! | `POST` | `/api/crawl/stop/{task_id}` | Stop a task |
//! | `POST` | `/api/crawl/pause/{task_id}` | Pause a task |
//! | `POST` | `/api/crawl/resume/{task_id}` | Resume a task |
//! | `DELETE` | `/api/crawl/stop-all` | Stop every active task |
//! | `GET` | `/api/crawl/active` | Active task ids and snapshots |
//! | `GET` | `/api/crawl/status/{task_id}` | One task snapshot |
//! | `GET` | `/api/crawl/health` | Crawl subsystem health |
//! | `GET` | `/api/documents` | Active documents (`?namespace=&source_type=`) |
//! | `GET` | `/api/documents/{id}` | One document with chunks |
//! | `DELETE` | `/api/documents/{id}` | Soft-delete a document |
//! | `GET` | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "validation_error", "message": "...", "details": [{"field": "max_depth", "message": "..."}] } }
//! ```
//!
//! Error codes: `validation_error` (400), `not_found` (404),
//! `upstream_error` (502), `upstream_unavailable` (502), `internal` (500).
//!
//! A crawl the crawl service refuses to start still answers `200` with a
//! one-event stream: a fatal `error` event.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, KeepAliveStream, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use sqlx::SqlitePool;
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::config::Config;
use crate::documents::{self, DocumentFilter, DocumentResponse, DocumentSummary};
use crate::error::{CrawlError, FieldError};
use crate::events::CrawlEvent;
use crate::models::CrawlRequest;
use crate::relay::{ActiveTasks, ControlAck, CrawlRelay, StatusSnapshot};
use crate::{db, migrate};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<CrawlRelay>,
    pub pool: SqlitePool,
}

impl AppState {
    pub fn from_config(config: &Config, pool: SqlitePool) -> anyhow::Result<Self> {
        let relay = CrawlRelay::from_config(config, pool.clone())?;
        Ok(Self {
            relay: Arc::new(relay),
            pool,
        })
    }
}

/// Builds the router with CORS open to any origin, method and header.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/crawl/health", get(handle_crawl_health))
        .route("/api/crawl/start", post(handle_start))
        .route("/api/crawl/stop/{task_id}", post(handle_stop))
        .route("/api/crawl/pause/{task_id}", post(handle_pause))
        .route("/api/crawl/resume/{task_id}", post(handle_resume))
        .route("/api/crawl/stop-all", delete(handle_stop_all))
        .route("/api/crawl/active", get(handle_active))
        .route("/api/crawl/status/{task_id}", get(handle_status))
        .route("/api/documents", get(handle_list_documents))
        .route(
            "/api/documents/{id}",
            get(handle_get_document).delete(handle_delete_document),
        )
        .layer(cors)
        .with_state(state)
}

/// Starts the HTTP server on `[server].bind`, creating the schema if needed.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;

    let state = AppState::from_config(config, pool)?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(
        bind = %config.server.bind,
        crawl_service = %config.crawl.api_url,
        "rag-crawl server listening"
    );
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Vec<FieldError>>,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
    details: Option<Vec<FieldError>>,
}

impl AppError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::NOT_FOUND, "not_found", message)
}

fn internal(err: anyhow::Error) -> AppError {
    warn!(error = %err, "request failed");
    AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", err.to_string())
}

impl From<CrawlError> for AppError {
    fn from(err: CrawlError) -> Self {
        let message = err.to_string();
        match err {
            CrawlError::Validation(fields) => AppError {
                status: StatusCode::BAD_REQUEST,
                code: "validation_error".to_string(),
                message,
                details: Some(fields),
            },
            CrawlError::TaskNotFound(_) => not_found(message),
            CrawlError::UpstreamRequestFailed {
                status: Some(404), ..
            } => not_found(message),
            CrawlError::UpstreamRequestFailed { .. } => {
                AppError::new(StatusCode::BAD_GATEWAY, "upstream_error", message)
            }
            CrawlError::UpstreamUnavailable { .. } => {
                AppError::new(StatusCode::BAD_GATEWAY, "upstream_unavailable", message)
            }
            _ => AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message),
        }
    }
}

// ============ Health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Serialize)]
struct CrawlHealthResponse {
    status: String,
    service: String,
    timestamp: String,
}

async fn handle_crawl_health() -> Json<CrawlHealthResponse> {
    Json(CrawlHealthResponse {
        status: "healthy".to_string(),
        service: "crawl".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

// ============ Crawl ============

type SseStream = BoxStream<'static, Result<Event, Infallible>>;

/// Handler for `POST /api/crawl/start`.
///
/// Validation failures are a plain `400`. Once validation passes the
/// response is always an event stream.
async fn handle_start(
    State(state): State<AppState>,
    Json(request): Json<CrawlRequest>,
) -> Result<Sse<KeepAliveStream<SseStream>>, AppError> {
    let events: BoxStream<'static, CrawlEvent> = match state.relay.start(&request).await {
        Ok(events) => events,
        Err(err @ CrawlError::Validation(_)) => return Err(err.into()),
        Err(err) => {
            warn!(url = %request.url, error = %err, "crawl could not be started");
            stream::once(async move { CrawlEvent::fatal_error(err.to_string()) }).boxed()
        }
    };

    let sse: SseStream = events.map(|event| Ok(to_sse_event(&event))).boxed();
    Ok(Sse::new(sse).keep_alive(KeepAlive::default()))
}

fn to_sse_event(event: &CrawlEvent) -> Event {
    match serde_json::to_string(event) {
        Ok(json) => Event::default().data(json),
        Err(e) => Event::default().data(
            serde_json::json!({"type": "error", "message": e.to_string()}).to_string(),
        ),
    }
}

async fn handle_stop(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<ControlAck>, AppError> {
    Ok(Json(state.relay.stop(&task_id).await?))
}

async fn handle_pause(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<ControlAck>, AppError> {
    Ok(Json(state.relay.pause(&task_id).await?))
}

async fn handle_resume(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<ControlAck>, AppError> {
    Ok(Json(state.relay.resume(&task_id).await?))
}

async fn handle_stop_all(State(state): State<AppState>) -> Result<Json<ControlAck>, AppError> {
    Ok(Json(state.relay.stop_all().await?))
}

async fn handle_active(State(state): State<AppState>) -> Json<ActiveTasks> {
    Json(state.relay.list_active())
}

async fn handle_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<StatusSnapshot>, AppError> {
    Ok(Json(state.relay.status(&task_id).await?))
}

// ============ Documents ============

#[derive(Serialize)]
struct DocumentListResponse {
    documents: Vec<DocumentSummary>,
    count: usize,
}

async fn handle_list_documents(
    State(state): State<AppState>,
    Query(filter): Query<DocumentFilter>,
) -> Result<Json<DocumentListResponse>, AppError> {
    let documents = documents::list_documents(&state.pool, &filter)
        .await
        .map_err(internal)?;
    Ok(Json(DocumentListResponse {
        count: documents.len(),
        documents,
    }))
}

async fn handle_get_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DocumentResponse>, AppError> {
    documents::get_document(&state.pool, &id)
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or_else(|| not_found(format!("document not found: {}", id)))
}

async fn handle_delete_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    if documents::deactivate_document(&state.pool, &id)
        .await
        .map_err(internal)?
    {
        info!(document_id = %id, "document deactivated");
        Ok(Json(serde_json::json!({
            "success": true,
            "message": format!("Document {} deleted", id),
        })))
    } else {
        Err(not_found(format!("document not found: {}", id)))
    }
}
