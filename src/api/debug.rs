//! Operational aids with no effect on core behavior: a Prometheus-format
//! metrics endpoint and a placeholder for heap profiling. See
//! SPEC_FULL.md §6.

use axum::{
    extract::State,
    http::StatusCode,
    routing::{any, get},
    Router,
};

use super::AppState;
use crate::types::{BuildStatus, PackageStatus};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/debug/pprof/*path", any(pprof_stub))
}

async fn metrics(State(state): State<AppState>) -> String {
    let builds = state.store.list_builds().await;
    let (backends, architectures) = state.pool.list(None);

    let mut out = String::new();
    out.push_str("# HELP build_service_builds_total Builds by aggregate status\n");
    out.push_str("# TYPE build_service_builds_total gauge\n");
    for status in [
        BuildStatus::Pending,
        BuildStatus::Running,
        BuildStatus::Success,
        BuildStatus::Failed,
        BuildStatus::Cancelled,
    ] {
        let count = builds.iter().filter(|b| b.status == status).count();
        out.push_str(&format!(
            "build_service_builds_total{{status=\"{status:?}\"}} {count}\n"
        ));
    }

    out.push_str("# HELP build_service_packages_total Packages by status across all builds\n");
    out.push_str("# TYPE build_service_packages_total gauge\n");
    for status in [
        PackageStatus::Pending,
        PackageStatus::Running,
        PackageStatus::Success,
        PackageStatus::Failed,
        PackageStatus::Cancelled,
        PackageStatus::Skipped,
    ] {
        let count: usize = builds
            .iter()
            .flat_map(|b| b.packages.iter())
            .filter(|p| p.status == status)
            .count();
        out.push_str(&format!(
            "build_service_packages_total{{status=\"{status:?}\"}} {count}\n"
        ));
    }

    out.push_str("# HELP build_service_backend_pool_size Registered backends per architecture\n");
    out.push_str("# TYPE build_service_backend_pool_size gauge\n");
    for arch in architectures {
        let count = backends.iter().filter(|b| b.arch == arch).count();
        out.push_str(&format!(
            "build_service_backend_pool_size{{arch=\"{arch}\"}} {count}\n"
        ));
    }

    out
}

/// Wiring a real heap profiler here is a deployment-time choice (e.g.
/// `pprof-rs`), not a core-behavior requirement, so the route exists but
/// reports that it isn't wired up.
async fn pprof_stub() -> (StatusCode, &'static str) {
    (
        StatusCode::NOT_IMPLEMENTED,
        "profiling endpoint not wired up in this build",
    )
}
