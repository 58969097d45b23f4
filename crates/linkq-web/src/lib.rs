//! Axum JSON API for the LinkQ catalog.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{
        rejection::JsonRejection, DefaultBodyLimit, Multipart, Path as AxumPath, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use linkq_core::{
    ImportOutcome, ImportRecord, ImportStatus, ListingId, SearchQuery, SearchResult, WebsiteListing,
};
use linkq_search::{FilterRanges, SearchError};
use linkq_storage::StoreError;
use linkq_sync::{AppConfig, ImportError, Runtime};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "linkq-web";

pub const SERVICE_BANNER: &str = "Link Qualification System API";

#[derive(Clone)]
pub struct AppState {
    pub runtime: Runtime,
}

impl AppState {
    pub fn new(runtime: Runtime) -> Self {
        Self { runtime }
    }
}

/// Error body shared by every endpoint: `{ "error": <tag>, "detail": <message> }`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    tag: &'static str,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, tag: &'static str, detail: impl Into<String>) -> Self {
        Self {
            status,
            tag,
            detail: detail.into(),
        }
    }

    fn bad_request(tag: &'static str, detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, tag, detail)
    }

    fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", detail)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(
                status = %self.status,
                error = self.tag,
                detail = %self.detail,
                "request failed"
            );
        }
        (
            self.status,
            Json(json!({ "error": self.tag, "detail": self.detail })),
        )
            .into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(_) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", err.to_string())
            }
            StoreError::Rejected(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err.to_string())
            }
        }
    }
}

impl From<SearchError> for ApiError {
    fn from(err: SearchError) -> Self {
        match err {
            SearchError::Store(store) => store.into(),
            other => Self::bad_request(other.tag(), other.to_string()),
        }
    }
}

impl From<ImportError> for ApiError {
    fn from(err: ImportError) -> Self {
        match err {
            ImportError::Csv(_) => Self::bad_request(err.tag(), err.to_string()),
            ImportError::StoreUnavailable(store) => store.into(),
            ImportError::Archive(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.tag(), err.to_string())
            }
        }
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Serialize)]
pub struct ImportResponse {
    pub message: String,
    pub import_id: Uuid,
    pub outcome: ImportOutcome,
}

#[derive(Debug, Deserialize, Default)]
struct ListQuery {
    skip: Option<usize>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ImportSummary {
    pub id: Uuid,
    pub filename: String,
    pub status: ImportStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct DashboardStats {
    pub total_websites: usize,
    pub enriched_websites: usize,
    pub total_imports: usize,
    pub avg_dr: Option<f64>,
    pub avg_traffic: Option<f64>,
    pub avg_price: Option<f64>,
    pub recent_imports: Vec<ImportSummary>,
}

pub fn app(state: AppState) -> Router {
    let body_limit = state.runtime.config.max_upload_bytes;
    Router::new()
        .route("/", get(index_handler))
        .route("/api/websites", get(list_websites_handler))
        .route("/api/websites/import-csv", post(import_csv_handler))
        .route("/api/websites/{id}", get(website_detail_handler))
        .route(
            "/api/websites/imports/{import_id}/status",
            get(import_status_handler),
        )
        .route("/api/search", post(search_handler))
        .route("/api/search/filters", get(search_filters_handler))
        .route("/api/admin/dashboard", get(dashboard_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(Arc::new(state))
}

/// Serve until Ctrl-C, then drain enrichment workers and flush the catalog.
pub async fn serve(runtime: Runtime) -> anyhow::Result<()> {
    let port = runtime.config.web_port;
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "linkq api listening");

    axum::serve(listener, app(AppState::new(runtime.clone())))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving http")?;

    runtime.shutdown().await
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let runtime = Runtime::from_config(AppConfig::from_env()).await?;
    serve(runtime).await
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn index_handler() -> Json<serde_json::Value> {
    Json(json!({ "message": SERVICE_BANNER }))
}

async fn import_csv_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> ApiResult<ImportResponse> {
    while let Some(field) = multipart.next_field().await.map_err(|err| {
        ApiError::new(err.status(), "malformed_multipart", err.body_text())
    })? {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let bytes = field.bytes().await.map_err(|err| {
            ApiError::new(err.status(), "malformed_multipart", err.body_text())
        })?;

        let receipt = state.runtime.pipeline.import(&filename, &bytes).await?;
        return Ok(Json(ImportResponse {
            message: receipt.outcome.message(),
            import_id: receipt.import_id,
            outcome: receipt.outcome,
        }));
    }
    Err(ApiError::bad_request(
        "missing_file",
        "multipart field `file` is required",
    ))
}

async fn list_websites_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Vec<WebsiteListing>> {
    let listings = state.runtime.store.get_all().await?;
    Ok(Json(
        listings
            .into_iter()
            .skip(query.skip.unwrap_or(0))
            .take(query.limit.unwrap_or(usize::MAX))
            .collect(),
    ))
}

async fn website_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> ApiResult<WebsiteListing> {
    state
        .runtime
        .store
        .get(ListingId(id))
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("website {id} not found")))
}

async fn import_status_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(import_id): AxumPath<Uuid>,
) -> ApiResult<ImportRecord> {
    state
        .runtime
        .tracker
        .get(import_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("import {import_id} not found")))
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<SearchQuery>, JsonRejection>,
) -> ApiResult<Vec<SearchResult>> {
    let Json(query) =
        body.map_err(|err| ApiError::bad_request("invalid_request", err.body_text()))?;
    Ok(Json(state.runtime.search.search(&query).await?))
}

async fn search_filters_handler(
    State(state): State<Arc<AppState>>,
) -> ApiResult<FilterRanges> {
    Ok(Json(state.runtime.search.filter_ranges().await?))
}

async fn dashboard_handler(State(state): State<Arc<AppState>>) -> ApiResult<DashboardStats> {
    let stats = state.runtime.store.stats().await?;
    let recent_imports = state
        .runtime
        .tracker
        .recent(5)
        .await
        .into_iter()
        .map(|record| ImportSummary {
            id: record.id,
            filename: record.filename,
            status: record.status,
            created_at: record.created_at,
        })
        .collect();

    Ok(Json(DashboardStats {
        total_websites: stats.total,
        enriched_websites: stats.enriched,
        total_imports: state.runtime.tracker.len().await,
        avg_dr: stats.dr.map(|s| s.avg),
        avg_traffic: stats.traffic.map(|s| s.avg),
        avg_price: stats.price.map(|s| s.avg),
        recent_imports,
    }))
}
