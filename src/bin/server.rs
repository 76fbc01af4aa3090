//! Build service HTTP server.
//!
//! ```bash
//! BIND_ADDR=0.0.0.0:3000 cargo run --bin build-service
//!
//! curl -X POST http://localhost:3000/api/v1/builds \
//!   -H "Content-Type: application/json" \
//!   -d '{"config": {"name": "pkg-a", "version": "1.0", "spec": {}}, "arch": "x86_64", "mode": "flat"}'
//!
//! curl http://localhost:3000/api/v1/builds
//! curl http://localhost:3000/healthz
//! ```

use std::sync::Arc;

use build_service::api::{build_router, AppState};
use build_service::config::Config;
use build_service::dependency::FieldDependencyExtractor;
use build_service::executor::LocalExecutor;
use build_service::pool::BackendPool;
use build_service::scheduler::Scheduler;
use build_service::storage::FsStorage;
use build_service::store::BuildStore;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Arc::new(Config::from_env());
    tracing::info!(bind_addr = %config.bind_addr, max_parallel = config.max_parallel, "starting build service");

    let store = BuildStore::new(config.build_ttl, config.eviction_interval);
    let pool = Arc::new(BackendPool::new());
    let storage = Arc::new(FsStorage::new(config.output_dir.clone()));
    let executor = Arc::new(LocalExecutor::new(storage, std::time::Duration::from_millis(200)));

    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&store),
        Arc::clone(&pool),
        executor,
        config.poll_interval,
        config.max_parallel,
        config.drain_timeout,
    ));
    let scheduler_wakeup = scheduler.wakeup_handle();
    let scheduler_cancel = CancellationToken::new();

    let scheduler_task = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        let cancel = scheduler_cancel.clone();
        async move { scheduler.run(cancel).await }
    });

    let state = AppState {
        store: Arc::clone(&store),
        pool,
        extractor: Arc::new(FieldDependencyExtractor),
        scheduler_wakeup,
        config: Arc::clone(&config),
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutdown signal received, stopping scheduler");
    scheduler_cancel.cancel();
    scheduler_task.await?;
    store.close();

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
