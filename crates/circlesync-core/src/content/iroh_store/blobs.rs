//! iroh-blobs storage for encrypted content
//!
//! Memory store for tests, FsStore for production (persisted to
//! `data_dir/blobs/`). Hashes are BLAKE3, identical to [`BlobHash`].

use std::path::Path;

use bytes::Bytes;
use iroh::{Endpoint, EndpointId};
use iroh_blobs::store::fs::FsStore;
use iroh_blobs::store::mem::MemStore;
use iroh_blobs::Hash;
use tracing::{debug, info};

use crate::error::{SyncError, SyncResult};
use crate::types::BlobHash;

/// The underlying store type (memory or persistent)
enum StoreInner {
    Memory(MemStore),
    Persistent(FsStore),
}

impl std::fmt::Debug for StoreInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreInner::Memory(_) => write!(f, "MemStore"),
            StoreInner::Persistent(_) => write!(f, "FsStore"),
        }
    }
}

/// Content-addressed blob storage backed by iroh-blobs
pub struct BlobStore {
    inner: StoreInner,
}

impl Clone for BlobStore {
    fn clone(&self) -> Self {
        match &self.inner {
            StoreInner::Memory(store) => Self {
                inner: StoreInner::Memory(store.clone()),
            },
            StoreInner::Persistent(store) => Self {
                inner: StoreInner::Persistent(store.clone()),
            },
        }
    }
}

impl std::fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStore")
            .field("store", &self.inner)
            .finish()
    }
}

fn to_iroh(hash: BlobHash) -> Hash {
    Hash::from_bytes(*hash.as_bytes())
}

fn from_iroh(hash: Hash) -> BlobHash {
    BlobHash(*hash.as_bytes())
}

impl BlobStore {
    /// In-memory storage, lost on restart
    pub fn new_memory() -> Self {
        info!("Creating in-memory blob store");
        Self {
            inner: StoreInner::Memory(MemStore::new()),
        }
    }

    /// Persistent FsStore storage in `path` (created if missing)
    pub async fn new_persistent(path: &Path) -> SyncResult<Self> {
        tokio::fs::create_dir_all(path).await.map_err(|e| {
            SyncError::Storage(format!("Failed to create blob directory {:?}: {}", path, e))
        })?;

        info!(?path, "Creating persistent blob store with FsStore");
        let store = FsStore::load(path).await.map_err(|e| {
            SyncError::Storage(format!("Failed to load FsStore at {:?}: {}", path, e))
        })?;

        Ok(Self {
            inner: StoreInner::Persistent(store),
        })
    }

    /// The store as the iroh-blobs API handle (for router and downloader)
    pub fn api(&self) -> iroh_blobs::api::Store {
        match &self.inner {
            StoreInner::Memory(store) => store.as_ref().clone(),
            StoreInner::Persistent(store) => (*store).clone().into(),
        }
    }

    /// Protocol handler serving our blobs to other nodes
    pub fn protocol(&self) -> iroh_blobs::BlobsProtocol {
        iroh_blobs::BlobsProtocol::new(&self.api(), None)
    }

    /// Add bytes, returning their hash
    pub async fn add(&self, data: Vec<u8>) -> SyncResult<BlobHash> {
        let data = Bytes::from(data);
        let len = data.len();

        let blobs = match &self.inner {
            StoreInner::Memory(store) => store.blobs(),
            StoreInner::Persistent(store) => store.blobs(),
        };

        let tag = blobs
            .add_bytes(data)
            .temp_tag()
            .await
            .map_err(|e| SyncError::Storage(format!("Failed to import blob: {}", e)))?;

        let hash = from_iroh(tag.hash());
        debug!(%hash, len, "Imported blob");
        Ok(hash)
    }

    /// Whether the blob is complete locally
    pub async fn has(&self, hash: BlobHash) -> SyncResult<bool> {
        let blobs = match &self.inner {
            StoreInner::Memory(store) => store.blobs(),
            StoreInner::Persistent(store) => store.blobs(),
        };

        blobs
            .has(to_iroh(hash))
            .await
            .map_err(|e| SyncError::Storage(format!("Failed to check blob: {}", e)))
    }

    /// Local bytes, `None` if not present
    pub async fn get_local(&self, hash: BlobHash) -> SyncResult<Option<Vec<u8>>> {
        if !self.has(hash).await? {
            return Ok(None);
        }

        let blobs = match &self.inner {
            StoreInner::Memory(store) => store.blobs(),
            StoreInner::Persistent(store) => store.blobs(),
        };

        let data = blobs
            .get_bytes(to_iroh(hash))
            .await
            .map_err(|e| SyncError::Storage(format!("Failed to get blob: {}", e)))?;

        Ok(Some(data.to_vec()))
    }

    /// Download a blob from any of `providers` into the local store.
    ///
    /// Returns whether the blob is complete locally afterwards.
    pub async fn download(
        &self,
        hash: BlobHash,
        providers: Vec<EndpointId>,
        endpoint: &Endpoint,
    ) -> SyncResult<bool> {
        if providers.is_empty() {
            return Ok(false);
        }

        debug!(%hash, providers = providers.len(), "Downloading blob");
        let downloader = self.api().downloader(endpoint);

        let mut stream = downloader
            .download(to_iroh(hash), providers)
            .stream()
            .await
            .map_err(|e| SyncError::Network(format!("Failed to start download: {}", e)))?;

        use n0_future::StreamExt;
        while let Some(event) = stream.next().await {
            debug!(%hash, ?event, "Download progress");
        }

        self.has(hash).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_and_get() {
        let store = BlobStore::new_memory();
        let hash = store.add(b"Hello, World!".to_vec()).await.unwrap();
        assert_eq!(hash, BlobHash::of(b"Hello, World!"));
        assert_eq!(store.add(b"Hello, World!".to_vec()).await.unwrap(), hash);

        let bytes = store.get_local(hash).await.unwrap().unwrap();
        assert_eq!(bytes, b"Hello, World!");
    }

    #[tokio::test]
    async fn test_missing_blob() {
        let store = BlobStore::new_memory();
        let hash = BlobHash::of(b"never stored");
        assert!(!store.has(hash).await.unwrap());
        assert!(store.get_local(hash).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persistent_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new_persistent(&dir.path().join("blobs"))
            .await
            .unwrap();
        let hash = store.add(b"persisted".to_vec()).await.unwrap();
        assert!(store.has(hash).await.unwrap());
    }
}
