//! Content-addressed storage and root name resolution
//!
//! The engines talk to the network only through [`ContentStore`]. Two backends
//! implement it:
//!
//! - [`MemoryContentStore`]: an in-process network shared by many nodes, with
//!   fault injection, for tests and local demos
//! - [`IrohContentStore`]: iroh-blobs for content, a small request/response
//!   protocol for roots, and iroh-gossip root announcements
//!
//! [`StoreClient`] adds deadlines, bounded retries and the resolution cache on
//! top of any backend.

use std::collections::BTreeMap;
use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::identity::{verify_signature, Keypair};
use crate::types::{now_millis, BlobHash, PeerId, Timestamp};

mod cache;
mod client;
pub mod iroh_store;
pub mod memory;
mod retry;

pub use cache::{ResolutionCache, ROOT_PATH};
pub use client::StoreClient;
pub use iroh_store::IrohContentStore;
pub use memory::{MemoryContentStore, MemoryNetwork};
pub use retry::{retry_bounded, with_timeout, RetryPolicy};

/// Signed pointer from a peer to the hash of its current root collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootPointer {
    /// Publisher
    pub peer: PeerId,
    /// Root collection hash
    pub hash: BlobHash,
    /// Strictly increasing per publisher
    pub version: u64,
    /// Publish time (ms)
    pub published_at: Timestamp,
    /// Publisher signature over (peer, hash, version, published_at)
    pub signature: Vec<u8>,
}

impl RootPointer {
    fn signing_bytes(
        peer: &PeerId,
        hash: &BlobHash,
        version: u64,
        published_at: Timestamp,
    ) -> SyncResult<Vec<u8>> {
        postcard::to_allocvec(&(b"circlesync-root", peer, hash, version, published_at))
            .map_err(SyncError::serialization)
    }

    /// Create a pointer signed by the local identity
    pub fn sign(keypair: &Keypair, hash: BlobHash, version: u64) -> SyncResult<Self> {
        let peer = keypair.peer_id();
        let published_at = now_millis();
        let bytes = Self::signing_bytes(&peer, &hash, version, published_at)?;
        Ok(Self {
            peer,
            hash,
            version,
            published_at,
            signature: keypair.sign(&bytes),
        })
    }

    /// Check the publisher signature
    pub fn verify(&self) -> SyncResult<()> {
        let bytes = Self::signing_bytes(&self.peer, &self.hash, self.version, self.published_at)?;
        verify_signature(&self.peer, &bytes, &self.signature)
    }
}

/// Content-addressed blob storage plus root publication and resolution.
///
/// Hashes are BLAKE3 over the exact stored bytes, so storing the same
/// ciphertext twice returns the same hash. Implementations do not apply
/// deadlines themselves; callers wrap them (see [`StoreClient`]).
pub trait ContentStore: Send + Sync + 'static {
    /// Store bytes, returning their content hash
    fn store(&self, bytes: Vec<u8>) -> impl Future<Output = SyncResult<BlobHash>> + Send;

    /// Fetch bytes by hash, locally or from the network. `None` if absent.
    fn get(&self, hash: BlobHash) -> impl Future<Output = SyncResult<Option<Vec<u8>>>> + Send;

    /// Whether the blob is available locally
    fn has(&self, hash: BlobHash) -> impl Future<Output = SyncResult<bool>> + Send;

    /// Make `pointer` the resolvable root of the local peer
    fn publish_root(&self, pointer: RootPointer) -> impl Future<Output = SyncResult<()>> + Send;

    /// Latest root of `peer` with version at least `min_version`, if any
    fn resolve_root(
        &self,
        peer: PeerId,
        min_version: u64,
    ) -> impl Future<Output = SyncResult<Option<RootPointer>>> + Send;

    /// Announce that the local node can serve these hashes
    fn provide(&self, hashes: Vec<BlobHash>) -> impl Future<Output = SyncResult<()>> + Send;

    /// Start listening for root announcements from a followed peer
    fn watch(&self, peer: PeerId) -> impl Future<Output = SyncResult<()>> + Send {
        let _ = peer;
        async { Ok(()) }
    }

    /// Store a name -> hash map as a blob
    fn create_collection(
        &self,
        entries: BTreeMap<String, BlobHash>,
    ) -> impl Future<Output = SyncResult<BlobHash>> + Send {
        async move {
            let bytes = postcard::to_allocvec(&entries).map_err(SyncError::serialization)?;
            self.store(bytes).await
        }
    }

    /// Fetch and decode a collection
    fn get_collection(
        &self,
        hash: BlobHash,
    ) -> impl Future<Output = SyncResult<Option<BTreeMap<String, BlobHash>>>> + Send {
        async move {
            match self.get(hash).await? {
                Some(bytes) => postcard::from_bytes(&bytes)
                    .map(Some)
                    .map_err(|e| SyncError::ValidationFailure(format!("Bad collection {}: {}", hash, e))),
                None => Ok(None),
            }
        }
    }
}
