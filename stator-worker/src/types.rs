//! Request and response bodies of the worker HTTP API

use serde::{Deserialize, Serialize};
use stator_core::{EntityRef, StateName};
use stator_runtime::{Error, TransitionReport};
use uuid::Uuid;

/// Body of `POST /admin/entities/{type}/{id}/transition`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRequest {
    pub target: StateName,
}

/// Body of `POST /admin/actions/{action}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    pub ids: Vec<Uuid>,
}

/// Per-entity result of a bulk action
#[derive(Debug, Clone, Serialize)]
pub struct ActionResult {
    pub entity: EntityRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<TransitionReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResult {
    pub fn from_result(entity: EntityRef, result: Result<TransitionReport, Error>) -> Self {
        match result {
            Ok(report) => Self {
                entity,
                report: Some(report),
                error: None,
            },
            Err(e) => Self {
                entity,
                report: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Error body returned by every failing endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

impl HealthResponse {
    pub fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
