//! `POST/DELETE /api/v1/backends`, `GET /api/v1/backends`,
//! `GET /api/v1/backends/status`.

use std::collections::BTreeMap;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::error::{ServiceError, ServiceResult};
use crate::types::Backend;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/v1/backends",
            get(list_backends).post(add_backend).delete(remove_backend),
        )
        .route("/api/v1/backends/status", get(backend_status))
}

#[derive(Debug, Deserialize)]
pub struct AddBackendRequest {
    pub addr: String,
    pub arch: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub capacity: Option<u32>,
}

async fn add_backend(
    State(state): State<AppState>,
    Json(req): Json<AddBackendRequest>,
) -> ServiceResult<Json<Backend>> {
    if req.addr.trim().is_empty() {
        return Err(ServiceError::BadRequest("addr must not be empty".to_string()));
    }
    if req.labels.keys().any(|k| k.trim().is_empty()) {
        return Err(ServiceError::BadRequest(
            "selector labels must have non-empty keys".to_string(),
        ));
    }

    let backend = Backend {
        addr: req.addr,
        arch: req.arch,
        labels: req.labels,
        inflight: 0,
        capacity: req.capacity.unwrap_or(1),
    };
    Ok(Json(state.pool.add(backend)?))
}

#[derive(Debug, Deserialize)]
pub struct ListBackendsQuery {
    pub arch: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListBackendsResponse {
    pub backends: Vec<Backend>,
    pub architectures: Vec<String>,
}

async fn list_backends(
    State(state): State<AppState>,
    Query(query): Query<ListBackendsQuery>,
) -> Json<ListBackendsResponse> {
    let (backends, architectures) = state.pool.list(query.arch.as_deref());
    Json(ListBackendsResponse {
        backends,
        architectures,
    })
}

#[derive(Debug, Deserialize)]
pub struct RemoveBackendQuery {
    pub addr: String,
    #[serde(default)]
    pub force: bool,
}

async fn remove_backend(
    State(state): State<AppState>,
    Query(query): Query<RemoveBackendQuery>,
) -> ServiceResult<StatusCode> {
    state.pool.remove(&query.addr, query.force)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn backend_status(State(state): State<AppState>) -> Json<Vec<Backend>> {
    Json(state.pool.status())
}
