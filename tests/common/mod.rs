use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use build_service::api::{build_router, AppState};
use build_service::config::{CacheMode, Config};
use build_service::dependency::FieldDependencyExtractor;
use build_service::executor::LocalExecutor;
use build_service::pool::BackendPool;
use build_service::scheduler::Scheduler;
use build_service::storage::FsStorage;
use build_service::store::BuildStore;
use build_service::types::Build;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

pub struct TestService {
    pub router: axum::Router,
    pub pool: Arc<BackendPool>,
    pub cancel: CancellationToken,
    _tempdir: tempfile::TempDir,
}

impl TestService {
    pub async fn spawn(work_duration: Duration, max_parallel: usize) -> Self {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let config = Arc::new(Config {
            bind_addr: "127.0.0.1:0".to_string(),
            poll_interval: Duration::from_millis(20),
            max_parallel,
            drain_timeout: Duration::from_secs(2),
            eviction_interval: Duration::ZERO,
            build_ttl: Duration::from_secs(3600),
            output_dir: tempdir.path().to_path_buf(),
            cache_registry: None,
            cache_mode: CacheMode::Min,
        });

        let store = BuildStore::new(config.build_ttl, config.eviction_interval);
        let pool = Arc::new(BackendPool::new());
        let storage = Arc::new(FsStorage::new(config.output_dir.clone()));
        let executor = Arc::new(LocalExecutor::new(storage, work_duration));

        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&pool),
            executor,
            config.poll_interval,
            config.max_parallel,
            config.drain_timeout,
        ));
        let scheduler_wakeup = scheduler.wakeup_handle();
        let cancel = CancellationToken::new();

        tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            let cancel = cancel.clone();
            async move { scheduler.run(cancel).await }
        });

        let state = AppState {
            store,
            pool: Arc::clone(&pool),
            extractor: Arc::new(FieldDependencyExtractor),
            scheduler_wakeup,
            config,
        };

        Self {
            router: build_router(state),
            pool,
            cancel,
            _tempdir: tempdir,
        }
    }

    pub async fn post_json(&self, path: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        self.send(request).await
    }

    pub async fn delete(&self, path: &str) -> StatusCode {
        let request = Request::builder()
            .method("DELETE")
            .uri(path)
            .body(Body::empty())
            .unwrap();
        self.send(request).await.0
    }

    pub async fn get_json(&self, path: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method("GET")
            .uri(path)
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, value)
    }

    pub async fn get_build(&self, id: &str) -> Build {
        let (status, body) = self.get_json(&format!("/api/v1/builds/{id}")).await;
        assert_eq!(status, StatusCode::OK, "unexpected status: {body:?}");
        serde_json::from_value(body).unwrap()
    }
}
