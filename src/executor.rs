//! Executor — external interface (SPEC_FULL.md §4.5). The Scheduler
//! consumes this trait only; the real container-build engine is out of
//! scope. `LocalExecutor` below is a reference implementation suitable for
//! local operation and integration tests.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::pool::Reservation;
use crate::storage::Storage;
use crate::types::PackageBuild;

#[derive(Debug, Clone)]
pub struct ExecutorOutput {
    pub artifact_refs: Vec<String>,
    pub log_ref: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("build failed: {0}")]
    BuildFailed(String),
    #[error("backend unreachable: {0}")]
    BackendUnreachable(String),
    #[error("cancelled")]
    Cancelled,
}

/// Performs one package build against a reserved backend. Implementations
/// must honor `cancel` and must not retain `reservation` beyond return.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        build_id: &str,
        package: &PackageBuild,
        reservation: &Reservation,
        cancel: CancellationToken,
    ) -> Result<ExecutorOutput, ExecutorError>;
}

/// Reference Executor used by the shipped binary when no real
/// container-build backend is wired in. Simulates the build by sleeping a
/// short, configurable duration, then classifies the outcome from the
/// package spec:
///
/// - `{"fail": true}` → `BuildFailed`
/// - `{"unreachable": true}` → `BackendUnreachable` (exercises the
///   at-most-once requeue path)
/// - otherwise → success, writing a synthetic artifact and log to
///   `Storage`.
pub struct LocalExecutor {
    storage: std::sync::Arc<dyn Storage>,
    work_duration: Duration,
}

impl LocalExecutor {
    pub fn new(storage: std::sync::Arc<dyn Storage>, work_duration: Duration) -> Self {
        Self {
            storage,
            work_duration,
        }
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn execute(
        &self,
        build_id: &str,
        package: &PackageBuild,
        reservation: &Reservation,
        cancel: CancellationToken,
    ) -> Result<ExecutorOutput, ExecutorError> {
        tracing::info!(
            build_id,
            package = %package.name,
            backend = reservation.addr(),
            "executing package"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(ExecutorError::Cancelled),
            _ = tokio::time::sleep(self.work_duration) => {}
        }

        if package.spec.get("unreachable").and_then(|v| v.as_bool()) == Some(true) {
            return Err(ExecutorError::BackendUnreachable(format!(
                "backend {} became unreachable mid-build",
                reservation.addr()
            )));
        }

        if package.spec.get("fail").and_then(|v| v.as_bool()) == Some(true) {
            return Err(ExecutorError::BuildFailed(
                package
                    .spec
                    .get("fail_message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("build step reported failure")
                    .to_string(),
            ));
        }

        let log_body = format!("building {} {}\nok\n", package.name, package.version);
        let log_ref = self
            .storage
            .put_log(build_id, &package.name, log_body.into_bytes())
            .await
            .map_err(|e| ExecutorError::BuildFailed(format!("failed to write log: {e}")))?;

        let artifact_name = format!("{}-{}.pkg", package.name, package.version);
        let artifact_ref = self
            .storage
            .put_artifact(
                build_id,
                &package.name,
                &artifact_name,
                format!("artifact for {}", package.name).into_bytes(),
            )
            .await
            .map_err(|e| ExecutorError::BuildFailed(format!("failed to write artifact: {e}")))?;

        Ok(ExecutorOutput {
            artifact_refs: vec![artifact_ref],
            log_ref,
        })
    }
}
