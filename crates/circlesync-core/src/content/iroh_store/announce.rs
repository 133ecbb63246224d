//! Gossip announcements of new roots and provided content
//!
//! Each publisher owns one topic, derived from its peer id. Followers join
//! it with the publisher as bootstrap and learn new root pointers without
//! polling. Announcements carry signed pointers, so relayed copies are
//! verified like any other resolution result.

use std::collections::HashSet;
use std::sync::Arc;

use iroh::EndpointId;
use iroh_gossip::api::GossipReceiver;
use iroh_gossip::proto::TopicId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::content::{ResolutionCache, RootPointer, ROOT_PATH};
use crate::error::{SyncError, SyncResult};
use crate::types::{BlobHash, PeerId};

/// Messages broadcast on a publisher's topic
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Announcement {
    /// The publisher has a new root
    Root(RootPointer),
    /// The sender can serve these hashes
    Provide(Vec<BlobHash>),
}

impl Announcement {
    /// Encode message to bytes using postcard
    pub fn encode(&self) -> SyncResult<Vec<u8>> {
        postcard::to_allocvec(self)
            .map_err(|e| SyncError::Serialization(format!("Failed to encode announcement: {}", e)))
    }

    /// Decode message from bytes using postcard
    pub fn decode(bytes: &[u8]) -> SyncResult<Self> {
        postcard::from_bytes(bytes)
            .map_err(|e| SyncError::Serialization(format!("Failed to decode announcement: {}", e)))
    }
}

/// Gossip topic for a publisher's announcements
pub fn topic_for(peer: &PeerId) -> TopicId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"circlesync-root");
    hasher.update(peer.as_bytes());
    TopicId::from_bytes(*hasher.finalize().as_bytes())
}

/// Peers known to hold content worth downloading from
pub type Providers = Arc<RwLock<HashSet<EndpointId>>>;

/// Apply one announcement received on `publisher`'s topic.
///
/// Returns true if a newer root was learned.
pub fn apply(
    publisher: &PeerId,
    from: EndpointId,
    announcement: Announcement,
    roots: &ResolutionCache,
    providers: &Providers,
) -> bool {
    match announcement {
        Announcement::Root(pointer) => {
            if pointer.peer != *publisher {
                warn!(%publisher, claimed = %pointer.peer, "Root announced on the wrong topic");
                return false;
            }
            if let Err(e) = pointer.verify() {
                warn!(%publisher, error = %e, "Announced root failed signature check");
                return false;
            }
            providers.write().insert(from);
            let version = pointer.version;
            let learned = roots.insert(ROOT_PATH, pointer);
            if learned {
                info!(%publisher, version, "Learned root from announcement");
            }
            learned
        }
        Announcement::Provide(hashes) => {
            debug!(%publisher, provider = %from, count = hashes.len(), "Provider announced");
            providers.write().insert(from);
            false
        }
    }
}

/// Drain a topic until it closes or `cancel` fires
pub async fn listen(
    publisher: PeerId,
    mut receiver: GossipReceiver,
    roots: ResolutionCache,
    providers: Providers,
    cancel: CancellationToken,
) {
    use iroh_gossip::api::Event;
    use n0_future::StreamExt;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = receiver.try_next() => next,
        };

        match next {
            Ok(Some(Event::Received(msg))) => match Announcement::decode(&msg.content) {
                Ok(announcement) => {
                    apply(&publisher, msg.delivered_from, announcement, &roots, &providers);
                }
                Err(e) => {
                    warn!(%publisher, from = ?msg.delivered_from, error = %e, "Ignoring malformed announcement");
                }
            },
            Ok(Some(Event::NeighborUp(peer))) => {
                debug!(%publisher, ?peer, "Neighbor joined");
                providers.write().insert(peer);
            }
            Ok(Some(Event::NeighborDown(peer))) => {
                debug!(%publisher, ?peer, "Neighbor left");
            }
            Ok(Some(Event::Lagged)) => {
                warn!(%publisher, "Lagged behind on announcement topic");
            }
            Ok(None) => {
                debug!(%publisher, "Announcement topic closed");
                break;
            }
            Err(e) => {
                warn!(%publisher, error = ?e, "Error receiving announcements");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn endpoint_id(keypair: &Keypair) -> EndpointId {
        EndpointId::from_bytes(keypair.peer_id().as_bytes()).unwrap()
    }

    #[test]
    fn test_topic_is_per_publisher() {
        let a = Keypair::generate().peer_id();
        let b = Keypair::generate().peer_id();
        assert_eq!(topic_for(&a), topic_for(&a));
        assert_ne!(topic_for(&a), topic_for(&b));
    }

    #[test]
    fn test_apply_verified_root() {
        let alice = Keypair::generate();
        let roots = ResolutionCache::new();
        let providers = Providers::default();
        let pointer = RootPointer::sign(&alice, BlobHash::of(b"r"), 3).unwrap();

        assert!(apply(
            &alice.peer_id(),
            endpoint_id(&alice),
            Announcement::Root(pointer),
            &roots,
            &providers
        ));
        assert_eq!(roots.get(&alice.peer_id(), ROOT_PATH, 3).unwrap().version, 3);
        assert_eq!(providers.read().len(), 1);
    }

    #[test]
    fn test_apply_rejects_forged_and_misrouted_roots() {
        let alice = Keypair::generate();
        let mallory = Keypair::generate();
        let roots = ResolutionCache::new();
        let providers = Providers::default();

        let mut forged = RootPointer::sign(&alice, BlobHash::of(b"r"), 3).unwrap();
        forged.version = 9;
        assert!(!apply(
            &alice.peer_id(),
            endpoint_id(&mallory),
            Announcement::Root(forged),
            &roots,
            &providers
        ));

        let misrouted = RootPointer::sign(&mallory, BlobHash::of(b"m"), 1).unwrap();
        assert!(!apply(
            &alice.peer_id(),
            endpoint_id(&mallory),
            Announcement::Root(misrouted),
            &roots,
            &providers
        ));
        assert!(roots.is_empty());
        assert!(providers.read().is_empty());
    }

    #[test]
    fn test_announcement_encode_decode() {
        let message = Announcement::Provide(vec![BlobHash::of(b"x")]);
        let decoded = Announcement::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(message, decoded);
    }
}
