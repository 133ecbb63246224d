//! Local-only records about remote peers

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{now_millis, BlobHash, CircleId, PeerId, Timestamp};
use crate::content::RootPointer;

/// A followed peer and the sync watermark for it.
///
/// `last_accepted_version` is the replay-protection watermark: a root or
/// manifest at or below it is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Followed peer
    pub peer: PeerId,
    /// Display name from the peer's identity, once fetched
    pub name: Option<String>,
    /// Highest manifest version fully processed
    pub last_accepted_version: u64,
    /// Root pointer that produced the watermark
    pub cached_root: Option<RootPointer>,
    /// Identity blob hash last persisted
    pub identity_hash: Option<BlobHash>,
    /// Circle manifest hashes whose entries were all processed
    pub manifest_hashes: BTreeMap<CircleId, BlobHash>,
    /// When we started following (ms)
    pub followed_at: Timestamp,
    /// Last completed sync cycle (ms)
    pub last_synced_at: Option<Timestamp>,
    /// Reason the last cycle did not complete
    pub last_error: Option<String>,
}

impl PeerRecord {
    /// Fresh subscription with a zero watermark
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            name: None,
            last_accepted_version: 0,
            cached_root: None,
            identity_hash: None,
            manifest_hashes: BTreeMap::new(),
            followed_at: now_millis(),
            last_synced_at: None,
            last_error: None,
        }
    }

    /// Display label: name if known, short id otherwise
    pub fn label(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.peer.to_string())
    }
}

/// Record of an `Introduce` action received from a followed peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Introduction {
    /// Peer that made the introduction
    pub from: PeerId,
    /// Peer being introduced
    pub peer: PeerId,
    /// Name the introducer gave
    pub name: String,
    /// When it was processed (ms)
    pub received_at: Timestamp,
}
