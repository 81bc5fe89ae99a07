//! HTTP handlers for the worker API
//!
//! Implements:
//! - POST/GET /.stator/ - Run one scheduling cycle
//! - POST /admin/entities/{type}/{id}/transition - Force a transition
//! - GET /admin/entities/{type}/{id} - Inspect an entity
//! - POST /admin/actions/{action} - Run an admin alias over many entities
//! - GET /admin/stuck - Retrying and frozen entities
//! - GET /admin/counts - Entity counts per type and state
//! - GET /health, GET /metrics

use crate::metrics::{record_http_request, render};
use crate::types::{
    ActionRequest, ActionResult, ErrorResponse, HealthResponse, TransitionRequest,
};
use axum::{
    extract::{MatchedPath, Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use stator_core::{EntityRecord, EntityRef, EntityType};
use stator_federation::AdminAction;
use stator_runtime::{CycleReport, Error, Outcome, StatorService, StuckEntity, TransitionReport};
use stator_storage::StateCount;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Default page size of `/admin/stuck`
const DEFAULT_STUCK_LIMIT: usize = 100;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<StatorService>,
}

/// Router with every worker route (layers are added by the binary)
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/.stator/", get(trigger_handler).post(trigger_handler))
        .route("/admin/entities/:entity_type/:id", get(entity_handler))
        .route(
            "/admin/entities/:entity_type/:id/transition",
            post(transition_handler),
        )
        .route("/admin/actions/:action", post(action_handler))
        .route("/admin/stuck", get(stuck_handler))
        .route("/admin/counts", get(counts_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route_layer(middleware::from_fn(track_metrics))
        .with_state(state)
}

async fn track_metrics(request: Request, next: Next) -> Response {
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_string());
    let start = Instant::now();
    let response = next.run(request).await;
    record_http_request(
        &endpoint,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}

/// Run one scheduling cycle
///
/// Responds once due entities are claimed and dispatched; their handlers
/// keep running after the response is sent.
pub async fn trigger_handler(State(state): State<AppState>) -> Result<Json<CycleReport>, ApiError> {
    let report = state.service.run_cycle().await?;
    info!(
        candidates = report.candidates,
        dispatched = report.dispatched,
        busy = report.busy,
        "Triggered scheduling cycle"
    );
    Ok(Json(report))
}

pub async fn entity_handler(
    State(state): State<AppState>,
    Path((entity_type, id)): Path<(String, Uuid)>,
) -> Result<Json<EntityRecord>, ApiError> {
    let entity = EntityRef::new(entity_type, id);
    Ok(Json(state.service.get(&entity).await?))
}

/// Force an entity into the requested state
pub async fn transition_handler(
    State(state): State<AppState>,
    Path((entity_type, id)): Path<(String, Uuid)>,
    Json(request): Json<TransitionRequest>,
) -> Result<Json<TransitionReport>, ApiError> {
    let entity = EntityRef::new(entity_type, id);
    let report = state
        .service
        .transition_perform(&entity, &request.target)
        .await?;

    if report.outcome == Outcome::LeaseLost {
        return Err(ApiError::Runtime(Error::Busy(format!(
            "lease on {} was lost before the write",
            entity
        ))));
    }
    Ok(Json(report))
}

/// Run an admin alias (`force-update`, `reset-state`) over a list of ids
pub async fn action_handler(
    State(state): State<AppState>,
    Path(action): Path<String>,
    Json(request): Json<ActionRequest>,
) -> Result<Json<Vec<ActionResult>>, ApiError> {
    let action = AdminAction::parse(&action).ok_or(ApiError::UnknownAction(action))?;
    let (entity_type, target) = action.target();
    let entities: Vec<EntityRef> = request
        .ids
        .into_iter()
        .map(|id| EntityRef::new(entity_type.clone(), id))
        .collect();

    let results = state.service.force_many(&entities, &target).await;
    let failed = results.iter().filter(|(_, r)| r.is_err()).count();
    info!(
        action = action.name(),
        requested = entities.len(),
        failed,
        "Admin action applied"
    );

    Ok(Json(
        results
            .into_iter()
            .map(|(entity, result)| ActionResult::from_result(entity, result))
            .collect(),
    ))
}

#[derive(Debug, Deserialize)]
pub struct StuckQuery {
    pub limit: Option<usize>,
    pub entity_type: Option<String>,
}

pub async fn stuck_handler(
    State(state): State<AppState>,
    Query(query): Query<StuckQuery>,
) -> Result<Json<Vec<StuckEntity>>, ApiError> {
    let entity_type = query.entity_type.map(EntityType::new);
    let stuck = state
        .service
        .stuck(
            entity_type.as_ref(),
            query.limit.unwrap_or(DEFAULT_STUCK_LIMIT),
        )
        .await?;
    Ok(Json(stuck))
}

pub async fn counts_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<StateCount>>, ApiError> {
    Ok(Json(state.service.counts().await?))
}

/// Health check endpoint
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse::healthy())
}

/// Prometheus text exposition
pub async fn metrics_handler() -> Result<String, ApiError> {
    render().map_err(|e| ApiError::Internal(e.to_string()))
}

/// Errors returned by the HTTP handlers
#[derive(Debug)]
pub enum ApiError {
    Runtime(Error),
    UnknownAction(String),
    Internal(String),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError::Runtime(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Runtime(e) => {
                let status = match &e {
                    Error::Busy(_) | Error::AlreadyExists(_) => StatusCode::CONFLICT,
                    Error::InvariantViolation(_) => StatusCode::UNPROCESSABLE_ENTITY,
                    Error::NotFound(_) => StatusCode::NOT_FOUND,
                    Error::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
                    Error::Configuration(_) | Error::Internal(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                if status.is_server_error() {
                    error!(error = %e, "Request failed");
                } else {
                    warn!(error = %e, "Request rejected");
                }
                (status, e.to_string())
            }
            ApiError::UnknownAction(action) => (
                StatusCode::NOT_FOUND,
                format!("unknown admin action '{}'", action),
            ),
            ApiError::Internal(msg) => {
                error!(error = %msg, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}
