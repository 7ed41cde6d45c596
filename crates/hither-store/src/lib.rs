//! A content-addressed store for the binary payloads a [`hither_base::FileRef`] points at.
//! Everything above this crate only ever sees a [`hither_base::Sha256Hex`]; how and where the
//! bytes behind it actually live is this crate's business alone, the same separation drawn
//! between the job pipeline and its backing object store.

use async_trait::async_trait;
use hither_base::{NdArray, Sha256Hex};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt as _;

/// Storage and retrieval of content-addressed blobs and arrays. Kept as a trait because the
/// object store is treated as an external dependency the core consumes, not something it owns;
/// [`LocalContentStore`] is the only implementation this crate provides, suitable for a single
/// machine or a compute resource with a shared filesystem.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn put_bytes(&self, bytes: &[u8]) -> anyhow::Result<Sha256Hex>;
    async fn put_ndarray(&self, array: &NdArray) -> anyhow::Result<Sha256Hex>;
    async fn get_bytes(&self, hash: &Sha256Hex) -> anyhow::Result<Vec<u8>>;
    async fn get_ndarray(&self, hash: &Sha256Hex) -> anyhow::Result<NdArray>;

    /// Existence-only check: true iff the blob is present in *this* store without fetching it
    /// from anywhere else. The job cache uses this, not `get_bytes`, to decide whether a cached
    /// result's files are still usable.
    async fn exists_local(&self, hash: &Sha256Hex) -> bool;
}

/// A content-addressed directory tree on local disk: `<root>/<first 2 hex chars>/<rest>`, the
/// same two-level hash-prefix sharding `maelstrom-util`'s layer filesystem uses to keep any one
/// directory from accumulating too many entries.
pub struct LocalContentStore {
    root: PathBuf,
}

impl LocalContentStore {
    pub async fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn path_for(&self, hash: &Sha256Hex) -> PathBuf {
        let hex = hash.as_str();
        let (prefix, rest) = hex.split_at(2.min(hex.len()));
        self.root.join(prefix).join(rest)
    }

    async fn write_new(&self, hash: &Sha256Hex, bytes: &[u8]) -> anyhow::Result<()> {
        let path = self.path_for(hash);
        if fs::try_exists(&path).await? {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        // Write to a sibling temp file first so a reader can never observe a partially written
        // blob under the final content-addressed name.
        let tmp_path = path.with_extension("tmp");
        let mut tmp = fs::File::create(&tmp_path).await?;
        tmp.write_all(bytes).await?;
        tmp.flush().await?;
        drop(tmp);
        fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ContentStore for LocalContentStore {
    async fn put_bytes(&self, bytes: &[u8]) -> anyhow::Result<Sha256Hex> {
        let hash = Sha256Hex::of_bytes(bytes);
        self.write_new(&hash, bytes).await?;
        Ok(hash)
    }

    async fn put_ndarray(&self, array: &NdArray) -> anyhow::Result<Sha256Hex> {
        let bytes = serde_json::to_vec(array)?;
        self.put_bytes(&bytes).await
    }

    async fn get_bytes(&self, hash: &Sha256Hex) -> anyhow::Result<Vec<u8>> {
        let path = self.path_for(hash);
        fs::read(&path)
            .await
            .map_err(|e| anyhow::anyhow!("reading blob {hash}: {e}"))
    }

    async fn get_ndarray(&self, hash: &Sha256Hex) -> anyhow::Result<NdArray> {
        let bytes = self.get_bytes(hash).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn exists_local(&self, hash: &Sha256Hex) -> bool {
        fs::try_exists(self.path_for(hash)).await.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalContentStore::new(dir.path()).await.unwrap();
        let hash = store.put_bytes(b"hello").await.unwrap();
        assert!(store.exists_local(&hash).await);
        assert_eq!(store.get_bytes(&hash).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn identical_bytes_hash_to_the_same_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalContentStore::new(dir.path()).await.unwrap();
        let a = store.put_bytes(b"same").await.unwrap();
        let b = store.put_bytes(b"same").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn missing_hash_does_not_exist_locally() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalContentStore::new(dir.path()).await.unwrap();
        let missing = Sha256Hex::of_bytes(b"never stored");
        assert!(!store.exists_local(&missing).await);
        assert!(store.get_bytes(&missing).await.is_err());
    }

    #[tokio::test]
    async fn ndarray_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalContentStore::new(dir.path()).await.unwrap();
        let array = NdArray {
            shape: vec![2, 2],
            data: vec![1.0, 2.0, 3.0, 4.0],
        };
        let hash = store.put_ndarray(&array).await.unwrap();
        let back = store.get_ndarray(&hash).await.unwrap();
        assert_eq!(array, back);
    }
}
