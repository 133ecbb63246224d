//! Deadline-bounded access to a content store

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use super::cache::{ResolutionCache, ROOT_PATH};
use super::retry::{retry_bounded, with_timeout, RetryPolicy};
use super::{ContentStore, RootPointer};
use crate::config::EngineConfig;
use crate::error::{SyncError, SyncResult};
use crate::types::{BlobHash, PeerId};

/// Wraps a [`ContentStore`] with the engine's deadlines, retry counts and
/// resolution cache.
///
/// Short deadlines for the optimistic root check, longer deadlines with
/// bounded retries for blobs and root publication.
pub struct StoreClient<C> {
    store: Arc<C>,
    cache: ResolutionCache,
    resolve: RetryPolicy,
    fetch: RetryPolicy,
    write: RetryPolicy,
    publish: RetryPolicy,
}

impl<C> Clone for StoreClient<C> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            cache: self.cache.clone(),
            resolve: self.resolve,
            fetch: self.fetch,
            write: self.write,
            publish: self.publish,
        }
    }
}

impl<C: ContentStore> StoreClient<C> {
    /// Create a client using the config's timing values
    pub fn new(store: Arc<C>, config: &EngineConfig) -> Self {
        let base_delay = std::time::Duration::from_millis(config.retry_base_delay_ms);
        Self {
            store,
            cache: ResolutionCache::new(),
            resolve: RetryPolicy::once(config.resolve_timeout()),
            fetch: RetryPolicy {
                max_attempts: config.fetch_retries,
                base_delay,
                timeout: config.fetch_timeout(),
            },
            write: RetryPolicy::once(config.publish_timeout()),
            publish: RetryPolicy {
                max_attempts: config.publish_retries,
                base_delay,
                timeout: config.publish_timeout(),
            },
        }
    }

    /// Underlying backend
    pub fn backend(&self) -> &Arc<C> {
        &self.store
    }

    /// Resolution cache
    pub fn cache(&self) -> &ResolutionCache {
        &self.cache
    }

    /// Store bytes with the write deadline
    pub async fn store(&self, bytes: Vec<u8>) -> SyncResult<BlobHash> {
        with_timeout("store", self.write.timeout, self.store.store(bytes)).await
    }

    /// Fetch a blob that must exist, retrying; absent maps to `NotFound`
    pub async fn fetch(&self, hash: BlobHash) -> SyncResult<Vec<u8>> {
        retry_bounded("fetch", self.fetch, move || async move {
            self.store
                .get(hash)
                .await?
                .ok_or_else(|| SyncError::NotFound(format!("blob {}", hash)))
        })
        .await
    }

    /// Local existence check
    pub async fn has(&self, hash: BlobHash) -> SyncResult<bool> {
        with_timeout("has", self.write.timeout, self.store.has(hash)).await
    }

    /// Store a collection with the write deadline
    pub async fn create_collection(
        &self,
        entries: BTreeMap<String, BlobHash>,
    ) -> SyncResult<BlobHash> {
        with_timeout(
            "create_collection",
            self.write.timeout,
            self.store.create_collection(entries),
        )
        .await
    }

    /// Fetch a collection that must exist
    pub async fn fetch_collection(&self, hash: BlobHash) -> SyncResult<BTreeMap<String, BlobHash>> {
        retry_bounded("fetch_collection", self.fetch, move || async move {
            self.store
                .get_collection(hash)
                .await?
                .ok_or_else(|| SyncError::NotFound(format!("collection {}", hash)))
        })
        .await
    }

    /// Resolve a peer's root with version at least `min_version`.
    ///
    /// Served from the cache when possible. Pointers with a bad signature or
    /// for a different peer are dropped.
    pub async fn resolve(&self, peer: PeerId, min_version: u64) -> SyncResult<Option<RootPointer>> {
        if let Some(pointer) = self.cache.get(&peer, ROOT_PATH, min_version) {
            debug!(%peer, version = pointer.version, "Root served from cache");
            return Ok(Some(pointer));
        }

        let resolved = retry_bounded("resolve_root", self.resolve, move || {
            self.store.resolve_root(peer, min_version)
        })
        .await?;

        let Some(pointer) = resolved else {
            return Ok(None);
        };

        if pointer.peer != peer {
            warn!(%peer, claimed = %pointer.peer, "Resolved root for the wrong peer");
            return Ok(None);
        }
        if let Err(e) = pointer.verify() {
            warn!(%peer, error = %e, "Resolved root failed signature check");
            return Ok(None);
        }
        if pointer.version < min_version {
            return Ok(None);
        }

        self.cache.insert(ROOT_PATH, pointer.clone());
        Ok(Some(pointer))
    }

    /// Publish a root with bounded retries
    pub async fn publish_root(&self, pointer: RootPointer) -> SyncResult<()> {
        retry_bounded("publish_root", self.publish, move || {
            self.store.publish_root(pointer.clone())
        })
        .await
    }

    /// Announce hashes with the write deadline
    pub async fn provide(&self, hashes: Vec<BlobHash>) -> SyncResult<()> {
        with_timeout("provide", self.write.timeout, self.store.provide(hashes)).await
    }

    /// Begin watching a followed peer for root announcements
    pub async fn watch(&self, peer: PeerId) -> SyncResult<()> {
        with_timeout("watch", self.resolve.timeout, self.store.watch(peer)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::MemoryNetwork;
    use crate::identity::Keypair;

    fn fast_config() -> EngineConfig {
        EngineConfig {
            resolve_timeout_ms: 200,
            fetch_timeout_ms: 200,
            publish_timeout_ms: 200,
            retry_base_delay_ms: 1,
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_fetch_missing_is_not_found() {
        let network = MemoryNetwork::new();
        let client = StoreClient::new(Arc::new(network.node(PeerId([1; 32]))), &fast_config());
        let result = client.fetch(BlobHash::of(b"nothing")).await;
        assert!(matches!(result, Err(SyncError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_resolve_caches_and_respects_min_version() {
        let network = MemoryNetwork::new();
        let alice = Keypair::generate();
        let alice_store = network.node(alice.peer_id());
        let client = StoreClient::new(Arc::new(network.node(PeerId([2; 32]))), &fast_config());

        let v1 = RootPointer::sign(&alice, BlobHash::of(b"1"), 1).unwrap();
        alice_store.publish_root(v1.clone()).await.unwrap();

        assert_eq!(client.resolve(alice.peer_id(), 1).await.unwrap(), Some(v1));
        assert_eq!(client.cache().len(), 1);
        assert!(client.resolve(alice.peer_id(), 2).await.unwrap().is_none());

        let v2 = RootPointer::sign(&alice, BlobHash::of(b"2"), 2).unwrap();
        alice_store.publish_root(v2.clone()).await.unwrap();
        assert_eq!(client.resolve(alice.peer_id(), 2).await.unwrap(), Some(v2));
    }

    #[tokio::test]
    async fn test_resolve_drops_forged_pointer() {
        let network = MemoryNetwork::new();
        let alice = Keypair::generate();
        let client = StoreClient::new(Arc::new(network.node(PeerId([2; 32]))), &fast_config());

        let mut forged = RootPointer::sign(&alice, BlobHash::of(b"1"), 1).unwrap();
        forged.hash = BlobHash::of(b"evil");
        network.force_root(forged);

        assert!(client.resolve(alice.peer_id(), 0).await.unwrap().is_none());
        assert!(client.cache().is_empty());
    }

    #[tokio::test]
    async fn test_publish_root_retries_transient_failures() {
        let network = MemoryNetwork::new();
        let alice = Keypair::generate();
        let config = EngineConfig {
            publish_retries: 3,
            ..fast_config()
        };
        let client = StoreClient::new(Arc::new(network.node(alice.peer_id())), &config);

        network.fail_next_publishes(&alice.peer_id(), 2);
        let pointer = RootPointer::sign(&alice, BlobHash::of(b"root"), 1).unwrap();
        client.publish_root(pointer.clone()).await.unwrap();
        assert_eq!(network.root_of(&alice.peer_id()), Some(pointer));

        network.fail_next_publishes(&alice.peer_id(), 3);
        let next = RootPointer::sign(&alice, BlobHash::of(b"root 2"), 2).unwrap();
        assert!(matches!(
            client.publish_root(next).await,
            Err(SyncError::Network(_))
        ));
        assert_eq!(network.root_of(&alice.peer_id()).unwrap().version, 1);
    }
}
