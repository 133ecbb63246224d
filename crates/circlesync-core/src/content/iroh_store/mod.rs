//! iroh-backed content store
//!
//! - blobs: iroh-blobs (memory or FsStore), served over `iroh_blobs::ALPN`
//! - roots: signed pointers served over [`ROOT_ALPN`] and announced on the
//!   publisher's gossip topic
//! - providers: peers whose roots we resolved or who announced content; blob
//!   downloads go to them
//!
//! The endpoint's secret key is the identity keypair, so a peer id is also
//! the iroh endpoint id and no address book is needed beyond discovery.

use std::collections::HashMap;
use std::path::Path;

use iroh::protocol::Router;
use iroh::{Endpoint, EndpointId, PublicKey, SecretKey};
use iroh_gossip::api::GossipSender;
use iroh_gossip::net::{Gossip, GOSSIP_ALPN};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ContentStore, ResolutionCache, RootPointer, ROOT_PATH};
use crate::error::{SyncError, SyncResult};
use crate::identity::Keypair;
use crate::types::{BlobHash, PeerId};

mod announce;
mod blobs;
mod roots;

pub use announce::{topic_for, Announcement, Providers};
pub use blobs::BlobStore;
pub use roots::{RootMessage, RootProtocolHandler, ROOT_ALPN};

/// Gossip message size limit; a signed pointer or a provide list fits well within it
const MAX_ANNOUNCEMENT_SIZE: usize = 64 * 1024;

fn endpoint_id(peer: &PeerId) -> SyncResult<EndpointId> {
    PublicKey::from_bytes(peer.as_bytes())
        .map_err(|e| SyncError::ValidationFailure(format!("{} is not an endpoint id: {}", peer, e)))
}

/// [`ContentStore`] over iroh-blobs, the root protocol and iroh-gossip
pub struct IrohContentStore {
    local: PeerId,
    endpoint: Endpoint,
    router: Router,
    blobs: BlobStore,
    gossip: Gossip,
    roots: ResolutionCache,
    providers: Providers,
    announcer: Mutex<GossipSender>,
    watching: parking_lot::Mutex<HashMap<PeerId, GossipSender>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for IrohContentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrohContentStore")
            .field("local", &self.local)
            .field("blobs", &self.blobs)
            .field("providers", &self.providers.read().len())
            .finish()
    }
}

impl IrohContentStore {
    /// In-memory blobs, for tests and ephemeral nodes
    pub async fn new_memory(keypair: &Keypair) -> SyncResult<Self> {
        Self::spawn(keypair, BlobStore::new_memory()).await
    }

    /// Blobs persisted under `data_dir/blobs`
    pub async fn new_persistent(keypair: &Keypair, data_dir: &Path) -> SyncResult<Self> {
        let blobs = BlobStore::new_persistent(&data_dir.join("blobs")).await?;
        Self::spawn(keypair, blobs).await
    }

    /// Bind the endpoint, spawn gossip and the router, and join our own
    /// announcement topic
    pub async fn spawn(keypair: &Keypair, blobs: BlobStore) -> SyncResult<Self> {
        let local = keypair.peer_id();
        let secret_key = SecretKey::from(keypair.to_bytes());

        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![
                GOSSIP_ALPN.to_vec(),
                iroh_blobs::ALPN.to_vec(),
                ROOT_ALPN.to_vec(),
            ])
            .bind()
            .await
            .map_err(|e| SyncError::Network(format!("Failed to bind endpoint: {}", e)))?;

        let endpoint_id = endpoint.id();
        info!(%endpoint_id, "Endpoint bound");

        let gossip = Gossip::builder()
            .max_message_size(MAX_ANNOUNCEMENT_SIZE)
            .spawn(endpoint.clone());

        let roots = ResolutionCache::new();
        let router = Router::builder(endpoint.clone())
            .accept(GOSSIP_ALPN, gossip.clone())
            .accept(iroh_blobs::ALPN, blobs.protocol())
            .accept(ROOT_ALPN, RootProtocolHandler::new(roots.clone()))
            .spawn();
        info!("Router spawned");

        let providers = Providers::default();
        let cancel = CancellationToken::new();

        let (announcer, receiver) = gossip
            .subscribe(topic_for(&local), Vec::new())
            .await
            .map_err(|e| SyncError::Network(format!("Failed to subscribe: {}", e)))?
            .split();

        tokio::spawn(announce::listen(
            local,
            receiver,
            roots.clone(),
            providers.clone(),
            cancel.child_token(),
        ));

        Ok(Self {
            local,
            endpoint,
            router,
            blobs,
            gossip,
            roots,
            providers,
            announcer: Mutex::new(announcer),
            watching: parking_lot::Mutex::new(HashMap::new()),
            cancel,
        })
    }

    /// The underlying endpoint
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Local blob store
    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Stop listeners, the router and the endpoint
    pub async fn shutdown(&self) {
        info!("Shutting down iroh content store");
        self.cancel.cancel();
        if let Err(e) = self.router.shutdown().await {
            warn!(error = ?e, "Failed to shutdown router cleanly");
        }
        self.endpoint.close().await;
    }

    fn provider_snapshot(&self) -> Vec<EndpointId> {
        let own = self.endpoint.id();
        self.providers
            .read()
            .iter()
            .copied()
            .filter(|id| *id != own)
            .collect()
    }

    async fn announce(&self, announcement: Announcement) -> SyncResult<()> {
        let bytes = announcement.encode()?;
        self.announcer
            .lock()
            .await
            .broadcast(bytes.into())
            .await
            .map_err(|e| SyncError::Network(format!("Failed to broadcast: {}", e)))
    }

    /// Accept a pointer for `peer` from `host` if it checks out
    fn accept_pointer(
        &self,
        peer: PeerId,
        host: EndpointId,
        pointer: RootPointer,
        min_version: u64,
    ) -> Option<RootPointer> {
        if pointer.peer != peer {
            warn!(%peer, claimed = %pointer.peer, %host, "Host answered with the wrong peer's root");
            return None;
        }
        if let Err(e) = pointer.verify() {
            warn!(%peer, %host, error = %e, "Host answered with an unsigned root");
            return None;
        }
        self.providers.write().insert(host);
        self.roots.insert(ROOT_PATH, pointer.clone());
        (pointer.version >= min_version).then_some(pointer)
    }
}

impl ContentStore for IrohContentStore {
    async fn store(&self, bytes: Vec<u8>) -> SyncResult<BlobHash> {
        self.blobs.add(bytes).await
    }

    async fn get(&self, hash: BlobHash) -> SyncResult<Option<Vec<u8>>> {
        if let Some(bytes) = self.blobs.get_local(hash).await? {
            return Ok(Some(bytes));
        }

        let providers = self.provider_snapshot();
        if !self.blobs.download(hash, providers, &self.endpoint).await? {
            debug!(%hash, "Blob not available from any provider");
            return Ok(None);
        }
        self.blobs.get_local(hash).await
    }

    async fn has(&self, hash: BlobHash) -> SyncResult<bool> {
        self.blobs.has(hash).await
    }

    async fn publish_root(&self, pointer: RootPointer) -> SyncResult<()> {
        if pointer.peer != self.local {
            return Err(SyncError::InvalidOperation(format!(
                "{} cannot publish a root for {}",
                self.local, pointer.peer
            )));
        }

        // Served over ROOT_ALPN only once the announcement went out, so a
        // failed attempt leaves nothing resolvable and can be retried
        let version = pointer.version;
        self.announce(Announcement::Root(pointer.clone())).await?;
        self.roots.insert(ROOT_PATH, pointer);
        info!(version, "Root published");
        Ok(())
    }

    async fn resolve_root(&self, peer: PeerId, min_version: u64) -> SyncResult<Option<RootPointer>> {
        if let Some(pointer) = self.roots.get(&peer, ROOT_PATH, min_version) {
            return Ok(Some(pointer));
        }
        if peer == self.local {
            return Ok(None);
        }

        let direct = endpoint_id(&peer)?;
        let mut hosts = vec![direct];
        hosts.extend(self.provider_snapshot().into_iter().filter(|id| *id != direct));

        let mut last_error = None;
        let mut answered = false;
        for host in hosts {
            match roots::request_root(&self.endpoint, host, peer, min_version).await {
                Ok(Some(pointer)) => {
                    answered = true;
                    if let Some(pointer) = self.accept_pointer(peer, host, pointer, min_version) {
                        return Ok(Some(pointer));
                    }
                }
                Ok(None) => answered = true,
                Err(e) => {
                    debug!(%peer, %host, error = %e, "Root request failed");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if !answered => Err(e),
            _ => Ok(None),
        }
    }

    async fn provide(&self, hashes: Vec<BlobHash>) -> SyncResult<()> {
        if hashes.is_empty() {
            return Ok(());
        }
        debug!(count = hashes.len(), "Announcing provided content");
        self.announce(Announcement::Provide(hashes)).await
    }

    async fn watch(&self, peer: PeerId) -> SyncResult<()> {
        if peer == self.local || self.watching.lock().contains_key(&peer) {
            return Ok(());
        }

        let bootstrap = endpoint_id(&peer)?;
        self.providers.write().insert(bootstrap);

        let (sender, receiver) = self
            .gossip
            .subscribe(topic_for(&peer), vec![bootstrap])
            .await
            .map_err(|e| SyncError::Network(format!("Failed to subscribe: {}", e)))?
            .split();

        // The sender keeps the subscription alive
        self.watching.lock().insert(peer, sender);

        info!(%peer, "Watching root announcements");
        tokio::spawn(announce::listen(
            peer,
            receiver,
            self.roots.clone(),
            self.providers.clone(),
            self.cancel.child_token(),
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_is_endpoint_id() {
        let keypair = Keypair::generate();
        let secret = SecretKey::from(keypair.to_bytes());
        let id = endpoint_id(&keypair.peer_id()).unwrap();
        assert_eq!(secret.public(), id);
    }

    #[tokio::test]
    async fn test_published_root_resolves_locally() {
        let keypair = Keypair::generate();
        let store = IrohContentStore::new_memory(&keypair).await.unwrap();

        let pointer = RootPointer::sign(&keypair, BlobHash::of(b"root"), 3).unwrap();
        store.publish_root(pointer.clone()).await.unwrap();
        assert_eq!(
            store.resolve_root(keypair.peer_id(), 3).await.unwrap(),
            Some(pointer)
        );
        assert!(store.resolve_root(keypair.peer_id(), 4).await.unwrap().is_none());

        let other = Keypair::generate();
        let foreign = RootPointer::sign(&other, BlobHash::of(b"root"), 1).unwrap();
        assert!(matches!(
            store.publish_root(foreign).await,
            Err(SyncError::InvalidOperation(_))
        ));

        store.shutdown().await;
    }
}
