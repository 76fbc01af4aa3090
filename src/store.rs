//! Build Store — the authoritative state of builds and package records.
//!
//! See SPEC_FULL.md §4.2. The builds map is guarded by a coarse
//! `RwLock`; each build additionally has its own `Mutex` so that mutating
//! one build never blocks readers or writers of another. Background
//! eviction only takes the outer map lock briefly, to list candidates and
//! again to remove them — never while inspecting a build's contents.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex as AsyncMutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::{ServiceError, ServiceResult};
use crate::types::{Build, BuildStatus, PackageBuild, PackageStatus};

/// Applied atomically under a build's lock by [`BuildStore::update_package`].
/// Returning `Err` aborts the mutation (the package is left unchanged).
pub type PackageMutator = Box<dyn FnOnce(&mut PackageBuild) -> Result<(), String> + Send>;

struct BuildEntry {
    build: AsyncMutex<Build>,
    notify: watch::Sender<BuildStatus>,
}

/// Concurrency-safe store of builds and per-package records, with
/// transition guards, blocking wait support, and background eviction.
pub struct BuildStore {
    builds: RwLock<HashMap<String, Arc<BuildEntry>>>,
    closed: AtomicBool,
    ttl: Duration,
    eviction_cancel: CancellationToken,
}

impl BuildStore {
    /// `eviction_interval = Duration::ZERO` disables background eviction
    /// (used in tests).
    pub fn new(self_arc_ttl: Duration, eviction_interval: Duration) -> Arc<Self> {
        let store = Arc::new(Self {
            builds: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            ttl: self_arc_ttl,
            eviction_cancel: CancellationToken::new(),
        });

        if !eviction_interval.is_zero() {
            let weak = Arc::downgrade(&store);
            let cancel = store.eviction_cancel.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(eviction_interval);
                interval.tick().await; // first tick fires immediately
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => {}
                    }
                    let Some(store) = weak.upgrade() else { break };
                    store.evict_once().await;
                }
            });
        }

        store
    }

    fn ensure_open(&self) -> ServiceResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ServiceError::Closed);
        }
        Ok(())
    }

    pub async fn create_build(&self, mut build: Build) -> ServiceResult<Build> {
        self.ensure_open()?;
        if build.id.is_empty() {
            build.id = uuid::Uuid::new_v4().to_string();
        }
        build.refresh_status();

        let mut map = self.builds.write().await;
        if map.contains_key(&build.id) {
            return Err(ServiceError::Conflict(format!(
                "build {} already exists",
                build.id
            )));
        }
        let (tx, _rx) = watch::channel(build.status);
        let snapshot = build.clone();
        map.insert(
            build.id.clone(),
            Arc::new(BuildEntry {
                build: AsyncMutex::new(build),
                notify: tx,
            }),
        );
        Ok(snapshot)
    }

    pub async fn get_build(&self, id: &str) -> ServiceResult<Build> {
        let entry = self.lookup(id).await?;
        Ok(entry.build.lock().await.clone())
    }

    pub async fn list_builds(&self) -> Vec<Build> {
        let map = self.builds.read().await;
        let mut builds = Vec::with_capacity(map.len());
        for entry in map.values() {
            builds.push(entry.build.lock().await.clone());
        }
        builds.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        builds
    }

    /// Builds whose aggregate status is not yet terminal — what the
    /// Scheduler polls each tick.
    pub async fn list_non_terminal(&self) -> Vec<Build> {
        let map = self.builds.read().await;
        let mut builds = Vec::new();
        for entry in map.values() {
            let build = entry.build.lock().await;
            if !build.status.is_terminal() {
                builds.push(build.clone());
            }
        }
        builds
    }

    async fn lookup(&self, id: &str) -> ServiceResult<Arc<BuildEntry>> {
        let map = self.builds.read().await;
        map.get(id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("build {id} not found")))
    }

    /// Atomically applies `mutator` to one package, rejecting transitions
    /// that violate the status graph, then recomputes and publishes the
    /// build's aggregate status.
    pub async fn update_package(
        &self,
        build_id: &str,
        pkg_name: &str,
        mutator: PackageMutator,
    ) -> ServiceResult<Build> {
        self.ensure_open()?;
        let entry = self.lookup(build_id).await?;
        let mut build = entry.build.lock().await;

        let before = build
            .package(pkg_name)
            .ok_or_else(|| ServiceError::NotFound(format!("package {pkg_name} not found")))?
            .status;

        let pkg = build
            .package_mut(pkg_name)
            .expect("checked present above");
        let before_snapshot = pkg.clone();
        mutator(pkg).map_err(ServiceError::BadRequest)?;
        let attempted_status = pkg.status;

        if !is_valid_transition(before, attempted_status) {
            // Roll back: restore the pre-mutation package.
            *build.package_mut(pkg_name).unwrap() = before_snapshot;
            return Err(ServiceError::BadRequest(format!(
                "invalid transition {before:?} -> {attempted_status:?} for package {pkg_name}"
            )));
        }

        build.refresh_status();
        let snapshot = build.clone();
        let _ = entry.notify.send(snapshot.status);
        Ok(snapshot)
    }

    /// Blocks until the build's aggregate status is terminal or `cancel`
    /// fires. Implemented with a per-build watch channel (the permitted
    /// notification refinement over bare polling), falling back to
    /// `poll_interval` as a safety-net tick.
    pub async fn wait_for_build(
        &self,
        id: &str,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> ServiceResult<Build> {
        let entry = self.lookup(id).await?;
        let mut rx = entry.notify.subscribe();
        loop {
            {
                let build = entry.build.lock().await;
                if build.status.is_terminal() {
                    return Ok(build.clone());
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(ServiceError::BadRequest("wait cancelled".to_string()));
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        // Sender dropped (build evicted mid-wait); fall through to re-check.
                    }
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    async fn evict_once(&self) {
        let now = Utc::now();
        let mut expired = Vec::new();
        {
            let map = self.builds.read().await;
            for (id, entry) in map.iter() {
                let build = entry.build.lock().await;
                if build.status.is_terminal() {
                    if let Some(completed_at) = build.completed_at {
                        if completed_at + chrono::Duration::from_std(self.ttl).unwrap_or_default()
                            < now
                        {
                            expired.push(id.clone());
                        }
                    }
                }
            }
        }
        if expired.is_empty() {
            return;
        }
        let mut map = self.builds.write().await;
        for id in expired {
            map.remove(&id);
            tracing::debug!(build_id = %id, "evicted terminal build past ttl");
        }
    }

    /// Marks every still-`pending` package whose transitive dependency is
    /// `failed`/`cancelled`/`skipped` as `skipped`. Called by the Scheduler
    /// after every terminal transition it causes; any other caller that
    /// injects a terminal state (e.g. an admin cancel) must route through
    /// this same helper so cascading stays a single enforced rule.
    pub async fn propagate_cascading_skip(&self, build_id: &str) -> ServiceResult<()> {
        loop {
            let build = self.get_build(build_id).await?;
            let mut to_skip = Vec::new();
            for pkg in &build.packages {
                if pkg.status != PackageStatus::Pending {
                    continue;
                }
                let blocked = pkg.depends_on.iter().any(|dep| {
                    matches!(
                        build.package(dep).map(|p| p.status),
                        Some(PackageStatus::Failed)
                            | Some(PackageStatus::Cancelled)
                            | Some(PackageStatus::Skipped)
                    )
                });
                if blocked {
                    to_skip.push(pkg.name.clone());
                }
            }
            if to_skip.is_empty() {
                return Ok(());
            }
            for name in to_skip {
                self.update_package(
                    build_id,
                    &name,
                    Box::new(|p| {
                        p.status = PackageStatus::Skipped;
                        p.completed_at = Some(Utc::now());
                        Ok(())
                    }),
                )
                .await?;
            }
        }
    }

    /// Stops background eviction; subsequent mutating calls fail with
    /// `Closed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.eviction_cancel.cancel();
    }
}

fn is_valid_transition(before: PackageStatus, after: PackageStatus) -> bool {
    use PackageStatus::*;
    if before == after {
        return true;
    }
    match before {
        Pending => matches!(after, Running | Failed | Cancelled | Skipped),
        // Running -> Pending is the at-most-once transient-backend-failure
        // requeue (SPEC_FULL.md §4.3); the Scheduler only ever takes it once
        // per package, guarded by `PackageBuild::requeued`.
        Running => matches!(after, Success | Failed | Cancelled | Pending),
        Success | Failed | Cancelled | Skipped => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};

    fn pkg(name: &str) -> PackageBuild {
        PackageBuild::new(
            name.to_string(),
            "1.0".to_string(),
            serde_json::json!({}),
            BTreeSet::new(),
        )
    }

    fn build(id: &str, packages: Vec<PackageBuild>) -> Build {
        Build {
            id: id.to_string(),
            created_at: Utc::now(),
            mode: crate::types::BuildMode::Flat,
            arch: "x86_64".to_string(),
            status: BuildStatus::Pending,
            packages,
            backend_selector: BTreeMap::new(),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn create_build_assigns_id_and_rejects_duplicates() {
        let store = BuildStore::new(Duration::from_secs(60), Duration::ZERO);
        let b = store.create_build(build("", vec![pkg("a")])).await.unwrap();
        assert!(!b.id.is_empty());
        let dup = build(&b.id, vec![pkg("a")]);
        let err = store.create_build(dup).await.unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
    }

    #[tokio::test]
    async fn update_package_rejects_illegal_transitions() {
        let store = BuildStore::new(Duration::from_secs(60), Duration::ZERO);
        let b = store
            .create_build(build("b1", vec![pkg("a")]))
            .await
            .unwrap();

        store
            .update_package(
                &b.id,
                "a",
                Box::new(|p| {
                    p.status = PackageStatus::Success;
                    Ok(())
                }),
            )
            .await
            .unwrap_err();

        store
            .update_package(
                &b.id,
                "a",
                Box::new(|p| {
                    p.status = PackageStatus::Running;
                    Ok(())
                }),
            )
            .await
            .unwrap();

        let err = store
            .update_package(
                &b.id,
                "a",
                Box::new(|p| {
                    p.status = PackageStatus::Pending;
                    Ok(())
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::BadRequest(_)));
    }

    #[tokio::test]
    async fn aggregate_status_all_success() {
        let store = BuildStore::new(Duration::from_secs(60), Duration::ZERO);
        let b = store
            .create_build(build("b2", vec![pkg("a"), pkg("b")]))
            .await
            .unwrap();
        for name in ["a", "b"] {
            store
                .update_package(
                    &b.id,
                    name,
                    Box::new(|p| {
                        p.status = PackageStatus::Running;
                        Ok(())
                    }),
                )
                .await
                .unwrap();
            store
                .update_package(
                    &b.id,
                    name,
                    Box::new(|p| {
                        p.status = PackageStatus::Success;
                        Ok(())
                    }),
                )
                .await
                .unwrap();
        }
        let got = store.get_build(&b.id).await.unwrap();
        assert_eq!(got.status, BuildStatus::Success);
    }

    #[tokio::test]
    async fn running_to_pending_requeue_is_a_valid_transition() {
        // Exercises the at-most-once BackendUnreachable requeue path
        // (SPEC_FULL.md §4.3): a Running package must be able to go back to
        // Pending exactly once.
        let store = BuildStore::new(Duration::from_secs(60), Duration::ZERO);
        let b = store
            .create_build(build("b4", vec![pkg("a")]))
            .await
            .unwrap();

        store
            .update_package(
                &b.id,
                "a",
                Box::new(|p| {
                    p.status = PackageStatus::Running;
                    Ok(())
                }),
            )
            .await
            .unwrap();

        store
            .update_package(
                &b.id,
                "a",
                Box::new(|p| {
                    p.status = PackageStatus::Pending;
                    p.requeued = true;
                    Ok(())
                }),
            )
            .await
            .unwrap();

        let got = store.get_build(&b.id).await.unwrap();
        assert_eq!(got.package("a").unwrap().status, PackageStatus::Pending);
        assert!(got.package("a").unwrap().requeued);
    }

    #[tokio::test]
    async fn wait_for_build_returns_once_all_packages_succeed() {
        let store = BuildStore::new(Duration::from_secs(60), Duration::ZERO);
        let b = store
            .create_build(build("b5", vec![pkg("a")]))
            .await
            .unwrap();

        let store_clone = Arc::clone(&store);
        let id = b.id.clone();
        let waiter = tokio::spawn(async move {
            store_clone
                .wait_for_build(&id, Duration::from_millis(10), CancellationToken::new())
                .await
        });

        // Give the waiter a moment to subscribe before the transition lands.
        tokio::time::sleep(Duration::from_millis(5)).await;
        store
            .update_package(
                &b.id,
                "a",
                Box::new(|p| {
                    p.status = PackageStatus::Running;
                    Ok(())
                }),
            )
            .await
            .unwrap();
        store
            .update_package(
                &b.id,
                "a",
                Box::new(|p| {
                    p.status = PackageStatus::Success;
                    Ok(())
                }),
            )
            .await
            .unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("wait_for_build did not return in time")
            .expect("waiter task panicked")
            .expect("wait_for_build returned an error");
        assert_eq!(got.status, BuildStatus::Success);
    }

    #[tokio::test]
    async fn wait_for_build_honors_cancellation() {
        let store = BuildStore::new(Duration::from_secs(60), Duration::ZERO);
        let b = store
            .create_build(build("b6", vec![pkg("a")]))
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = store
            .wait_for_build(&b.id, Duration::from_millis(10), cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::BadRequest(_)));
    }

    #[tokio::test]
    async fn wait_for_build_settles_on_all_terminal_mixed_success_and_cancelled() {
        // Regression: a DAG build where one package succeeded and its
        // sibling was stamped Cancelled at shutdown must be recognized as
        // terminal (BuildStatus::Cancelled), not wedge forever as Pending —
        // otherwise WaitForBuild would never return and eviction would
        // never collect the build. See BuildStatus::derive.
        let store = BuildStore::new(Duration::from_secs(60), Duration::ZERO);
        let b = store
            .create_build(build("b7", vec![pkg("a"), pkg("b")]))
            .await
            .unwrap();

        store
            .update_package(
                &b.id,
                "a",
                Box::new(|p| {
                    p.status = PackageStatus::Running;
                    Ok(())
                }),
            )
            .await
            .unwrap();
        store
            .update_package(
                &b.id,
                "a",
                Box::new(|p| {
                    p.status = PackageStatus::Success;
                    Ok(())
                }),
            )
            .await
            .unwrap();
        store
            .update_package(
                &b.id,
                "b",
                Box::new(|p| {
                    p.status = PackageStatus::Running;
                    Ok(())
                }),
            )
            .await
            .unwrap();
        store
            .update_package(
                &b.id,
                "b",
                Box::new(|p| {
                    p.status = PackageStatus::Cancelled;
                    Ok(())
                }),
            )
            .await
            .unwrap();

        let got = store
            .wait_for_build(&b.id, Duration::from_millis(10), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(got.status, BuildStatus::Cancelled);
    }

    #[tokio::test]
    async fn closed_store_rejects_mutations() {
        let store = BuildStore::new(Duration::from_secs(60), Duration::ZERO);
        store.close();
        let err = store
            .create_build(build("b3", vec![pkg("a")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Closed));
    }
}
