//! HTTP API for the monitor
//!
//! Keepers register and report here, operators drive switchovers,
//! maintenance and settings, and read the formation state and events.
//! Errors are answered as [`ErrorBody`] with a status derived from the error.

use crate::common::error::Error;
use crate::common::metrics::METRICS;
use crate::common::protocol::{
    ErrorBody, GroupId, NodeId, NodeSettings, RegisterRequest, ReportRequest,
};
use crate::common::tracing_middleware::request_tracing_middleware;
use crate::monitor::service::MonitorService;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct MonitorState {
    pub service: Arc<MonitorService>,
}

/// Error answered to HTTP callers.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.to_http_status();
        let node_id = match &self.0 {
            Error::NodeNotFound(id) => Some(*id),
            _ => None,
        };
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        }
        let body = ErrorBody {
            error: self.0.to_string(),
            code: self.0.code().to_string(),
            node_id,
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn create_router(state: MonitorState) -> Router {
    Router::new()
        // Keeper protocol
        .route("/v1/nodes", post(register))
        .route("/v1/nodes/:id", delete(drop_node))
        .route("/v1/nodes/:id/report", post(report))
        .route("/v1/nodes/:id/settings", put(set_settings))
        .route(
            "/v1/nodes/:id/maintenance",
            post(enable_maintenance).delete(disable_maintenance),
        )
        // Formations
        .route("/v1/formations", get(list_formations).post(create_formation))
        .route("/v1/formations/:formation", delete(drop_formation))
        .route("/v1/formations/:formation/state", get(formation_state))
        .route("/v1/formations/:formation/events", get(events))
        .route(
            "/v1/formations/:formation/groups/:group/switchover",
            post(switchover),
        )
        .route(
            "/v1/formations/:formation/groups/:group/standby-names",
            get(standby_names),
        )
        // Health and metrics
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .route("/metrics", get(metrics))
        .layer(middleware::from_fn(request_tracing_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn register(
    State(state): State<MonitorState>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<impl IntoResponse> {
    let response = state.service.register(req).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

async fn report(
    State(state): State<MonitorState>,
    Path(id): Path<NodeId>,
    Json(req): Json<ReportRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.node_id != id {
        return Err(Error::InvalidSetting(format!(
            "report for node {} posted to node {}",
            req.node_id, id
        ))
        .into());
    }
    let response = state.service.report(req).await?;
    Ok(Json(response))
}

async fn drop_node(
    State(state): State<MonitorState>,
    Path(id): Path<NodeId>,
) -> ApiResult<StatusCode> {
    state.service.drop_node(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_settings(
    State(state): State<MonitorState>,
    Path(id): Path<NodeId>,
    Json(settings): Json<NodeSettings>,
) -> ApiResult<impl IntoResponse> {
    let status = state.service.set_node_settings(id, settings).await?;
    Ok(Json(status))
}

async fn enable_maintenance(
    State(state): State<MonitorState>,
    Path(id): Path<NodeId>,
) -> ApiResult<StatusCode> {
    state.service.enable_maintenance(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn disable_maintenance(
    State(state): State<MonitorState>,
    Path(id): Path<NodeId>,
) -> ApiResult<StatusCode> {
    state.service.disable_maintenance(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct CreateFormationRequest {
    name: String,
}

async fn list_formations(State(state): State<MonitorState>) -> impl IntoResponse {
    Json(json!({ "formations": state.service.list_formations().await }))
}

async fn create_formation(
    State(state): State<MonitorState>,
    Json(req): Json<CreateFormationRequest>,
) -> ApiResult<StatusCode> {
    state.service.create_formation(&req.name).await?;
    Ok(StatusCode::CREATED)
}

async fn drop_formation(
    State(state): State<MonitorState>,
    Path(formation): Path<String>,
) -> ApiResult<StatusCode> {
    state.service.drop_formation(&formation).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn formation_state(
    State(state): State<MonitorState>,
    Path(formation): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.formation_state(&formation).await?))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default = "default_event_count")]
    count: usize,
}

fn default_event_count() -> usize {
    10
}

async fn events(
    State(state): State<MonitorState>,
    Path(formation): Path<String>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.events(&formation, query.count).await?))
}

async fn switchover(
    State(state): State<MonitorState>,
    Path((formation, group)): Path<(String, GroupId)>,
) -> ApiResult<StatusCode> {
    state.service.switchover(&formation, group).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn standby_names(
    State(state): State<MonitorState>,
    Path((formation, group)): Path<(String, GroupId)>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.standby_names(&formation, group).await?))
}

/// Liveness probe
async fn health_live() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "alive": true,
            "version": env!("CARGO_PKG_VERSION"),
            "timestamp": crate::common::utils::timestamp_now_millis() / 1000,
        })),
    )
}

/// Readiness probe: the registry is loaded and answering.
async fn health_ready(State(state): State<MonitorState>) -> impl IntoResponse {
    let formations = state.service.list_formations().await;
    let nodes = state.service.registry().node_count().await;
    (
        StatusCode::OK,
        Json(json!({
            "ready": true,
            "formations": formations.len(),
            "nodes": nodes,
        })),
    )
}

async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        METRICS.to_prometheus(),
    )
}
