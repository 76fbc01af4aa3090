//! Scheduler — transforms the pending portion of each build into
//! completed work, honoring dependencies, architecture, backend
//! selectors, and global parallelism bounds. SPEC_FULL.md §4.3 is the
//! hardest component in this service; this is its single driver loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::executor::{Executor, ExecutorError};
use crate::pool::{BackendPool, ReserveOutcome, Reservation};
use crate::store::BuildStore;
use crate::types::{Build, PackageBuild, PackageStatus};

pub struct Scheduler {
    store: Arc<BuildStore>,
    pool: Arc<BackendPool>,
    executor: Arc<dyn Executor>,
    poll_interval: Duration,
    max_parallel: usize,
    drain_timeout: Duration,
    /// Lets the API server nudge the loop the moment a build is submitted,
    /// instead of waiting out the full `poll_interval`.
    wakeup: Arc<Notify>,
}

impl Scheduler {
    pub fn new(
        store: Arc<BuildStore>,
        pool: Arc<BackendPool>,
        executor: Arc<dyn Executor>,
        poll_interval: Duration,
        max_parallel: usize,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            store,
            pool,
            executor,
            poll_interval,
            max_parallel,
            drain_timeout,
            wakeup: Arc::new(Notify::new()),
        }
    }

    pub fn wakeup_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wakeup)
    }

    /// Runs the driver loop until `cancel` fires, then drains in-flight
    /// worker tasks up to `drain_timeout` and stamps any still-`running`
    /// package as `cancelled`.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.max_parallel.max(1)));
        let mut workers: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = self.wakeup.notified() => {}
            }
            self.dispatch_tick(&semaphore, &mut workers, &cancel).await;
            // Reap completed workers so the JoinSet doesn't grow unbounded.
            while workers.try_join_next().is_some() {}
        }

        tracing::info!("scheduler shutting down, draining in-flight packages");
        let drained = tokio::time::timeout(self.drain_timeout, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!("drain timeout exceeded; remaining workers abandoned");
        }
        self.mark_remaining_running_cancelled().await;
    }

    async fn dispatch_tick(
        &self,
        semaphore: &Arc<Semaphore>,
        workers: &mut JoinSet<()>,
        cancel: &CancellationToken,
    ) {
        let builds = self.store.list_non_terminal().await;
        for build in builds {
            let ready = ready_set(&build);
            for pkg_name in ready {
                let permit = match Arc::clone(semaphore).try_acquire_owned() {
                    Ok(permit) => permit,
                    // Global inflight >= maxParallel: stop this tick entirely.
                    Err(_) => return,
                };

                match self.pool.reserve(&build.arch, &build.backend_selector) {
                    ReserveOutcome::NoMatch => {
                        drop(permit);
                        self.fail_no_backend(&build.id, &pkg_name).await;
                    }
                    ReserveOutcome::AllBusy => {
                        drop(permit);
                        // Candidates exist but are saturated; try again next tick.
                    }
                    ReserveOutcome::Reserved(reservation) => {
                        let package = build
                            .package(&pkg_name)
                            .cloned()
                            .expect("ready_set only returns known packages");
                        self.spawn_worker(
                            build.id.clone(),
                            package,
                            reservation,
                            permit,
                            workers,
                            cancel.clone(),
                        )
                        .await;
                    }
                }
            }
        }
    }

    async fn fail_no_backend(&self, build_id: &str, pkg_name: &str) {
        let now = Utc::now();
        let result = self
            .store
            .update_package(
                build_id,
                pkg_name,
                Box::new(move |p| {
                    p.status = PackageStatus::Failed;
                    p.error_message = Some("no backend satisfies selector".to_string());
                    p.completed_at = Some(now);
                    Ok(())
                }),
            )
            .await;
        if let Err(err) = result {
            tracing::error!(build_id, pkg_name, %err, "failed to record no-backend failure");
            return;
        }
        if let Err(err) = self.store.propagate_cascading_skip(build_id).await {
            tracing::error!(build_id, %err, "failed to propagate cascading skip");
        }
    }

    async fn spawn_worker(
        &self,
        build_id: String,
        package: PackageBuild,
        reservation: Reservation,
        permit: tokio::sync::OwnedSemaphorePermit,
        workers: &mut JoinSet<()>,
        cancel: CancellationToken,
    ) {
        let now = Utc::now();
        let backend_addr = reservation.addr().to_string();
        let pkg_name = package.name.clone();
        let was_requeued = package.requeued;

        let transitioned = self
            .store
            .update_package(
                &build_id,
                &pkg_name,
                Box::new({
                    let backend_addr = backend_addr.clone();
                    move |p| {
                        p.status = PackageStatus::Running;
                        p.backend_addr = Some(backend_addr);
                        p.started_at = Some(now);
                        Ok(())
                    }
                }),
            )
            .await;

        if let Err(err) = transitioned {
            tracing::error!(build_id, pkg_name, %err, "failed to transition package to running");
            reservation.release();
            drop(permit);
            return;
        }

        let store = Arc::clone(&self.store);
        let executor = Arc::clone(&self.executor);

        workers.spawn(async move {
            let _permit = permit;
            let outcome = executor
                .execute(&build_id, &package, &reservation, cancel.clone())
                .await;

            match outcome {
                Ok(output) => {
                    let _ = store
                        .update_package(
                            &build_id,
                            &pkg_name,
                            Box::new(move |p| {
                                p.status = PackageStatus::Success;
                                p.completed_at = Some(Utc::now());
                                p.artifact_refs = output.artifact_refs;
                                Ok(())
                            }),
                        )
                        .await;
                }
                Err(ExecutorError::BuildFailed(message)) => {
                    let _ = store
                        .update_package(
                            &build_id,
                            &pkg_name,
                            Box::new(move |p| {
                                p.status = PackageStatus::Failed;
                                p.error_message = Some(message);
                                p.completed_at = Some(Utc::now());
                                Ok(())
                            }),
                        )
                        .await;
                    if let Err(err) = store.propagate_cascading_skip(&build_id).await {
                        tracing::error!(build_id = %build_id, %err, "failed to propagate cascading skip");
                    }
                }
                Err(ExecutorError::Cancelled) => {
                    let _ = store
                        .update_package(
                            &build_id,
                            &pkg_name,
                            Box::new(move |p| {
                                p.status = PackageStatus::Cancelled;
                                p.completed_at = Some(Utc::now());
                                Ok(())
                            }),
                        )
                        .await;
                    if let Err(err) = store.propagate_cascading_skip(&build_id).await {
                        tracing::error!(build_id = %build_id, %err, "failed to propagate cascading skip");
                    }
                }
                Err(ExecutorError::BackendUnreachable(message)) => {
                    if was_requeued {
                        // At-most-once guard already spent: this is terminal.
                        let _ = store
                            .update_package(
                                &build_id,
                                &pkg_name,
                                Box::new(move |p| {
                                    p.status = PackageStatus::Failed;
                                    p.error_message = Some(message);
                                    p.completed_at = Some(Utc::now());
                                    Ok(())
                                }),
                            )
                            .await;
                        if let Err(err) = store.propagate_cascading_skip(&build_id).await {
                            tracing::error!(build_id = %build_id, %err, "failed to propagate cascading skip");
                        }
                    } else {
                        tracing::warn!(
                            build_id = %build_id,
                            pkg_name = %pkg_name,
                            %message,
                            "backend unreachable, restoring package to pending once"
                        );
                        let _ = store
                            .update_package(
                                &build_id,
                                &pkg_name,
                                Box::new(|p| {
                                    p.status = PackageStatus::Pending;
                                    p.backend_addr = None;
                                    p.started_at = None;
                                    p.requeued = true;
                                    Ok(())
                                }),
                            )
                            .await;
                    }
                }
            }

            reservation.release();
        });
    }

    async fn mark_remaining_running_cancelled(&self) {
        let builds = self.store.list_non_terminal().await;
        for build in builds {
            for pkg in &build.packages {
                if pkg.status == PackageStatus::Running {
                    let _ = self
                        .store
                        .update_package(
                            &build.id,
                            &pkg.name,
                            Box::new(|p| {
                                p.status = PackageStatus::Cancelled;
                                p.completed_at = Some(Utc::now());
                                Ok(())
                            }),
                        )
                        .await;
                }
            }
        }
    }
}

/// Packages in `pending` whose every entry in `dependsOn` is `success` in
/// the same build.
fn ready_set(build: &Build) -> Vec<String> {
    build
        .packages
        .iter()
        .filter(|p| p.status == PackageStatus::Pending)
        .filter(|p| {
            p.depends_on.iter().all(|dep| {
                build
                    .package(dep)
                    .map(|d| d.status == PackageStatus::Success)
                    .unwrap_or(false)
            })
        })
        .map(|p| p.name.clone())
        .collect()
}
