//! Wire and domain types shared by the store, scheduler, pool, and API.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a build's packages are sequenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    /// No inter-package dependencies; all packages are ready at creation.
    Flat,
    /// Packages declare `dependsOn`; the Scheduler honors the partial order.
    Dag,
}

/// Status of a single package build. Terminal once it leaves `Pending`/`Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
    Skipped,
}

impl PackageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PackageStatus::Success
                | PackageStatus::Failed
                | PackageStatus::Cancelled
                | PackageStatus::Skipped
        )
    }
}

/// Aggregate status of a build, derived purely from its packages' statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl BuildStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, BuildStatus::Pending | BuildStatus::Running)
    }

    /// Pure function over the set of package statuses. See SPEC_FULL.md §4.2.
    pub fn derive(packages: &[PackageBuild]) -> BuildStatus {
        if packages.is_empty() {
            return BuildStatus::Success;
        }

        let any_running = packages.iter().any(|p| p.status == PackageStatus::Running);
        let any_pending = packages.iter().any(|p| p.status == PackageStatus::Pending);
        let any_terminal = packages.iter().any(|p| p.status.is_terminal());

        // A pending package alongside an already-terminal peer means the
        // build has made partial progress and is still in flight — distinct
        // from the "all pending at creation" case, which falls through to
        // `Pending` below.
        if any_running || (any_pending && any_terminal) {
            return BuildStatus::Running;
        }

        if packages
            .iter()
            .all(|p| p.status == PackageStatus::Success)
        {
            return BuildStatus::Success;
        }

        let any_failed = packages.iter().any(|p| p.status == PackageStatus::Failed);
        if any_failed && !any_running {
            return BuildStatus::Failed;
        }

        // Every package is terminal (no pending/running/failed survived the
        // checks above) but not all succeeded: some mix of Success with
        // Cancelled/Skipped (e.g. a DAG where one branch finished before
        // shutdown stamped the rest Cancelled). That is still a terminal
        // build — it must not fall through to Pending, which would wedge
        // eviction and WaitForBuild forever.
        if !any_pending {
            return BuildStatus::Cancelled;
        }

        BuildStatus::Pending
    }
}

/// One package within a build.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageBuild {
    pub name: String,
    pub version: String,
    /// Opaque blob consumed by the Executor; the service never inspects it
    /// beyond what `DependencyExtractor` needs.
    pub spec: serde_json::Value,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    pub status: PackageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub backend_addr: Option<String>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub artifact_refs: Vec<String>,
    /// Whether this package has already been restored to `pending` once
    /// after a `BackendUnreachable` error. Enforces the at-most-once
    /// requeue guard from SPEC_FULL.md §4.3. Not part of the public wire
    /// contract's required fields, but harmless additional JSON.
    #[serde(default)]
    pub requeued: bool,
}

impl PackageBuild {
    pub fn new(name: String, version: String, spec: serde_json::Value, depends_on: BTreeSet<String>) -> Self {
        Self {
            name,
            version,
            spec,
            depends_on,
            status: PackageStatus::Pending,
            started_at: None,
            completed_at: None,
            backend_addr: None,
            error_message: None,
            artifact_refs: Vec::new(),
            requeued: false,
        }
    }
}

/// A submission of one or more packages processed as a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Build {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub mode: BuildMode,
    pub arch: String,
    pub status: BuildStatus,
    pub packages: Vec<PackageBuild>,
    #[serde(default)]
    pub backend_selector: BTreeMap<String, String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Build {
    pub fn refresh_status(&mut self) {
        self.status = BuildStatus::derive(&self.packages);
        if self.status.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
        }
    }

    pub fn package_mut(&mut self, name: &str) -> Option<&mut PackageBuild> {
        self.packages.iter_mut().find(|p| p.name == name)
    }

    pub fn package(&self, name: &str) -> Option<&PackageBuild> {
        self.packages.iter().find(|p| p.name == name)
    }
}

/// A remote worker endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backend {
    pub addr: String,
    pub arch: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub inflight: u32,
    pub capacity: u32,
}

impl Backend {
    pub fn matches(&self, arch: &str, selector: &BTreeMap<String, String>) -> bool {
        self.arch == arch
            && selector
                .iter()
                .all(|(k, v)| self.labels.get(k) == Some(v))
    }

    pub fn has_capacity(&self) -> bool {
        self.inflight < self.capacity
    }
}
