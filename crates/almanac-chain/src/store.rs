//! Artifact storage interface.
//!
//! The production deployments put batch artifacts in an object store
//! (S3/GCS); those clients live outside this crate. The filesystem
//! implementation below serves development and tests.

use std::path::PathBuf;

use async_trait::async_trait;

use almanac_common::AlmanacError;

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put(&self, path: &str, data: Vec<u8>) -> Result<(), AlmanacError>;
    async fn get(&self, path: &str) -> Result<Vec<u8>, AlmanacError>;
}

/// Stores artifacts under a local directory, one file per batch path.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

#[async_trait]
impl ArtifactStore for FsStore {
    async fn put(&self, path: &str, data: Vec<u8>) -> Result<(), AlmanacError> {
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AlmanacError::Internal(format!("failed to create {parent:?}: {e}")))?;
        }
        tokio::fs::write(&target, data)
            .await
            .map_err(|e| AlmanacError::Internal(format!("failed to write {target:?}: {e}")))
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, AlmanacError> {
        let target = self.resolve(path);
        tokio::fs::read(&target)
            .await
            .map_err(|e| AlmanacError::NotFound(format!("artifact {path}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fs_store_round_trip() {
        let dir = std::env::temp_dir().join(format!("almanac-store-{}", std::process::id()));
        let store = FsStore::new(&dir);

        store
            .put("ethereum/000000000001-000000000100.pb", vec![1, 2, 3])
            .await
            .unwrap();
        let data = store
            .get("ethereum/000000000001-000000000100.pb")
            .await
            .unwrap();
        assert_eq!(data, vec![1, 2, 3]);

        assert!(store.get("ethereum/missing.pb").await.is_err());

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
