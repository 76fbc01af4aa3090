//! `POST /api/v1/builds`, `GET /api/v1/builds`, `GET /api/v1/builds/{id}`.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::dependency;
use crate::error::{ServiceError, ServiceResult};
use crate::types::{Build, BuildMode, BuildStatus, PackageBuild};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/builds", post(submit_build).get(list_builds))
        .route("/api/v1/builds/:id", get(get_build))
}

/// One package as submitted by the caller. `spec` is opaque to the core —
/// only `DependencyExtractor` looks inside it, and only in `dag` mode.
#[derive(Debug, Deserialize)]
pub struct SubmittedPackage {
    pub name: String,
    pub version: String,
    pub spec: serde_json::Value,
}

/// The core accepts pre-parsed package specs via `configs`. `configYAML` is
/// deliberately not handled here — the YAML parser and variable-
/// substitution layer are an external collaborator per SPEC_FULL.md §1;
/// a front end that owns that layer is expected to submit parsed `configs`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitBuildRequest {
    #[serde(default)]
    pub configs: Vec<SubmittedPackage>,
    pub arch: String,
    pub mode: BuildMode,
    #[serde(default)]
    pub backend_selector: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct SubmitBuildResponse {
    pub id: String,
    pub packages: Vec<String>,
}

async fn submit_build(
    State(state): State<AppState>,
    Json(req): Json<SubmitBuildRequest>,
) -> ServiceResult<Json<SubmitBuildResponse>> {
    let submitted = req.configs;

    if submitted.is_empty() {
        return Err(ServiceError::BadRequest(
            "submission must include at least one package".to_string(),
        ));
    }

    let known_archs = state.pool.list(None).1;
    if !known_archs.is_empty() && !known_archs.contains(&req.arch) {
        return Err(ServiceError::BadRequest(format!(
            "no backend registered for architecture {}",
            req.arch
        )));
    }

    let mut names = Vec::with_capacity(submitted.len());
    let mut seen = BTreeSet::new();
    for pkg in &submitted {
        if !seen.insert(pkg.name.clone()) {
            return Err(ServiceError::BadRequest(format!(
                "duplicate package name {} in submission",
                pkg.name
            )));
        }
        names.push(pkg.name.clone());
    }

    let mut depends_on: HashMap<String, BTreeSet<String>> = HashMap::new();
    if req.mode == BuildMode::Dag {
        for pkg in &submitted {
            depends_on.insert(pkg.name.clone(), state.extractor.extract(&pkg.name, &pkg.spec));
        }
        dependency::validate_dag(&names, &depends_on)?;
    }

    let packages: Vec<PackageBuild> = submitted
        .into_iter()
        .map(|pkg| {
            let deps = depends_on.remove(&pkg.name).unwrap_or_default();
            PackageBuild::new(pkg.name, pkg.version, pkg.spec, deps)
        })
        .collect();

    let build = Build {
        id: String::new(),
        created_at: Utc::now(),
        mode: req.mode,
        arch: req.arch,
        status: BuildStatus::Pending,
        packages,
        backend_selector: req.backend_selector,
        completed_at: None,
    };

    let created = state.store.create_build(build).await?;
    state.scheduler_wakeup.notify_one();

    Ok(Json(SubmitBuildResponse {
        id: created.id,
        packages: created.packages.into_iter().map(|p| p.name).collect(),
    }))
}

async fn list_builds(State(state): State<AppState>) -> Json<Vec<Build>> {
    Json(state.store.list_builds().await)
}

async fn get_build(State(state): State<AppState>, Path(id): Path<String>) -> ServiceResult<Json<Build>> {
    Ok(Json(state.store.get_build(&id).await?))
}
