//! Axum JSON API over the review query service.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{rejection::QueryRejection, Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use revwatch_core::{App, DEFAULT_WINDOW_HOURS};
use revwatch_storage::{QueryError, ReviewStore};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, warn};

pub const CRATE_NAME: &str = "revwatch-web";

#[derive(Clone)]
pub struct AppState {
    pub store: ReviewStore,
    pub apps: Arc<Vec<App>>,
}

impl AppState {
    pub fn new(store: ReviewStore, apps: Vec<App>) -> Self {
        Self {
            store,
            apps: Arc::new(apps),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ReviewsParams {
    hours: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AppSummary {
    id: String,
    name: String,
    last_polled: Option<DateTime<Utc>>,
    /// Set when the stored record could not be read.
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(health_handler))
        .route("/api/v1/apps", get(apps_handler))
        .route("/api/v1/apps/{id}/reviews", get(app_reviews_handler))
        .fallback(fallback_handler)
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// Serve until `shutdown` resolves, letting in-flight requests finish.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(json!({ "message": "Server is running" })).into_response()
}

async fn apps_handler(State(state): State<Arc<AppState>>) -> Response {
    let mut rows = Vec::with_capacity(state.apps.len());
    for app in state.apps.iter() {
        let (last_polled, error) = match state.store.load(&app.id).await {
            Ok(record) => (record.and_then(|r| r.last_polled), None),
            Err(err) => {
                warn!(app_id = %app.id, error = %err, "reading record for app listing failed");
                (None, Some(err.to_string()))
            }
        };
        rows.push(AppSummary {
            id: app.id.clone(),
            name: app.name.clone(),
            last_polled,
            error,
        });
    }
    Json(json!({ "data": rows })).into_response()
}

async fn app_reviews_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    params: Result<Query<ReviewsParams>, QueryRejection>,
) -> Response {
    let Query(params) = match params {
        Ok(params) => params,
        Err(rejection) => {
            return api_error(
                StatusCode::BAD_REQUEST,
                "bad_request",
                format!("hours must be a non-negative integer: {}", rejection.body_text()),
            )
        }
    };
    let hours = params.hours.unwrap_or(DEFAULT_WINDOW_HOURS);

    match state.store.query_app(&id, hours).await {
        Ok(record) => Json(json!({ "data": record })).into_response(),
        Err(QueryError::NotFound(app_id)) => api_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("no reviews recorded for app {app_id}"),
        ),
        Err(QueryError::Storage(err)) => server_error(err),
    }
}

async fn fallback_handler() -> Response {
    api_error(StatusCode::NOT_FOUND, "not_found", "route not found".to_string())
}

fn server_error(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "review query failed");
    api_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal",
        err.to_string(),
    )
}

fn api_error(status: StatusCode, code: &str, message: String) -> Response {
    (status, Json(json!({ "error": code, "message": message }))).into_response()
}
