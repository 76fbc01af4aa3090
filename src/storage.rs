//! Storage — external interface (SPEC_FULL.md §4.6). Persists per-build
//! artifacts and logs keyed by `(buildId, pkgName)`. The Scheduler never
//! calls this directly; it is used by the Executor.

use async_trait::async_trait;
use std::path::PathBuf;

#[async_trait]
pub trait Storage: Send + Sync {
    async fn put_artifact(
        &self,
        build_id: &str,
        pkg_name: &str,
        name: &str,
        bytes: Vec<u8>,
    ) -> anyhow::Result<String>;

    async fn put_log(&self, build_id: &str, pkg_name: &str, bytes: Vec<u8>) -> anyhow::Result<String>;

    async fn get_artifact(&self, reference: &str) -> anyhow::Result<Vec<u8>>;
}

/// Filesystem-backed reference implementation. Layout:
/// `{outputDir}/{buildId}/{pkgName}/{name}` for artifacts and
/// `{outputDir}/{buildId}/{pkgName}/log.txt` for the streamed log.
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn pkg_dir(&self, build_id: &str, pkg_name: &str) -> PathBuf {
        self.root.join(build_id).join(pkg_name)
    }
}

#[async_trait]
impl Storage for FsStorage {
    async fn put_artifact(
        &self,
        build_id: &str,
        pkg_name: &str,
        name: &str,
        bytes: Vec<u8>,
    ) -> anyhow::Result<String> {
        let dir = self.pkg_dir(build_id, pkg_name);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(name);
        tokio::fs::write(&path, bytes).await?;
        Ok(path.to_string_lossy().into_owned())
    }

    async fn put_log(&self, build_id: &str, pkg_name: &str, bytes: Vec<u8>) -> anyhow::Result<String> {
        self.put_artifact(build_id, pkg_name, "log.txt", bytes).await
    }

    async fn get_artifact(&self, reference: &str) -> anyhow::Result<Vec<u8>> {
        Ok(tokio::fs::read(reference).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_land_under_build_and_package_dirs() {
        let dir = tempfile_dir();
        let storage = FsStorage::new(dir.clone());
        let reference = storage
            .put_artifact("b1", "pkg-a", "pkg-a-1.0.pkg", b"hello".to_vec())
            .await
            .unwrap();
        assert!(reference.contains("b1"));
        assert!(reference.contains("pkg-a"));
        let contents = storage.get_artifact(&reference).await.unwrap();
        assert_eq!(contents, b"hello");
        std::fs::remove_dir_all(dir).ok();
    }

    fn tempfile_dir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("build-service-test-{}", uuid::Uuid::new_v4()));
        dir
    }
}
