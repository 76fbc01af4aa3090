//! HTTP surface: submit build, query status, manage backends, health,
//! profiling. Stateless over the Store and Pool (SPEC_FULL.md §4.4).

pub mod backends;
pub mod builds;
pub mod debug;
pub mod health;

use std::sync::Arc;

use axum::Router;
use tokio::sync::Notify;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::dependency::DependencyExtractor;
use crate::pool::BackendPool;
use crate::store::BuildStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<BuildStore>,
    pub pool: Arc<BackendPool>,
    pub extractor: Arc<dyn DependencyExtractor>,
    pub scheduler_wakeup: Arc<Notify>,
    pub config: Arc<Config>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(builds::router())
        .merge(backends::router())
        .merge(debug::router())
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
