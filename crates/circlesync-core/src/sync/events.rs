//! Sync events and per-peer state

use std::fmt;

use crate::types::{BlobHash, CircleId, PeerId};

/// Capacity of the event broadcast channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Where one peer's download cycle currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerSyncState {
    /// Not running
    #[default]
    Idle,
    /// Resolving the peer's root pointer
    ResolvingRoot,
    /// Root is at or below the watermark; nothing to do
    UpToDate,
    /// Fetching and decrypting the user manifest
    Downloading,
    /// Fetching and dispatching actions directed at us
    ProcessingActions,
    /// Walking circle manifests and fetching new content
    ProcessingManifests,
}

impl fmt::Display for PeerSyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerSyncState::Idle => write!(f, "Idle"),
            PeerSyncState::ResolvingRoot => write!(f, "ResolvingRoot"),
            PeerSyncState::UpToDate => write!(f, "UpToDate"),
            PeerSyncState::Downloading => write!(f, "Downloading"),
            PeerSyncState::ProcessingActions => write!(f, "ProcessingActions"),
            PeerSyncState::ProcessingManifests => write!(f, "ProcessingManifests"),
        }
    }
}

/// Events emitted by the publish and sync engines
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A new root was published
    Published {
        /// Root version
        version: u64,
        /// Root collection hash
        root: BlobHash,
    },
    /// A peer's cycle completed and the watermark advanced
    PeerSynced {
        /// Peer
        peer: PeerId,
        /// New watermark
        version: u64,
        /// Posts persisted this cycle
        new_posts: usize,
        /// Reactions persisted this cycle
        new_reactions: usize,
    },
    /// The peer had nothing newer than the watermark
    PeerUpToDate {
        /// Peer
        peer: PeerId,
        /// Current watermark
        version: u64,
    },
    /// The peer's cycle stopped without advancing the watermark
    PeerFailed {
        /// Peer
        peer: PeerId,
        /// Reason
        reason: String,
    },
    /// A circle key from another peer was installed
    KeyInstalled {
        /// Circle owner
        owner: PeerId,
        /// Circle
        circle: CircleId,
        /// Key generation
        generation: u32,
    },
}

impl SyncEvent {
    /// The remote peer the event concerns, if any
    pub fn peer(&self) -> Option<&PeerId> {
        match self {
            SyncEvent::Published { .. } => None,
            SyncEvent::PeerSynced { peer, .. } => Some(peer),
            SyncEvent::PeerUpToDate { peer, .. } => Some(peer),
            SyncEvent::PeerFailed { peer, .. } => Some(peer),
            SyncEvent::KeyInstalled { owner, .. } => Some(owner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_default_is_idle() {
        assert_eq!(PeerSyncState::default(), PeerSyncState::Idle);
        assert_eq!(PeerSyncState::ProcessingActions.to_string(), "ProcessingActions");
    }

    #[test]
    fn test_event_peer() {
        let peer = PeerId([1; 32]);
        let event = SyncEvent::PeerUpToDate { peer, version: 2 };
        assert_eq!(event.peer(), Some(&peer));

        let published = SyncEvent::Published {
            version: 1,
            root: BlobHash::of(b"r"),
        };
        assert!(published.peer().is_none());
    }
}
