//! Manifest records: the published index of a peer's content

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{BlobHash, CircleId, PeerId, Timestamp};

/// One post or reaction referenced by a circle manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Stored (encrypted) blob hash
    pub hash: BlobHash,
    /// Creation time of the referenced item (ms)
    pub timestamp: Timestamp,
    /// Author of the referenced item
    pub author: PeerId,
}

/// Index of everything one circle can see, encrypted under the circle key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircleManifest {
    /// Circle identifier
    pub circle_id: CircleId,
    /// Circle owner (the publisher)
    pub owner: PeerId,
    /// Circle name
    pub name: String,
    /// Posts, newest first
    pub posts: Vec<ManifestEntry>,
    /// Reactions and tags, newest first
    pub reactions: Vec<ManifestEntry>,
    /// Current members
    pub members: Vec<PeerId>,
    /// Generation of the key this manifest is encrypted under
    pub key_generation: u32,
    /// Newest entry or membership change (ms)
    pub updated_at: Timestamp,
}

impl CircleManifest {
    /// Equality that ignores entry and member order
    pub fn same_content(&self, other: &CircleManifest) -> bool {
        fn sorted<T: Ord + Clone>(items: &[T]) -> Vec<T> {
            let mut v = items.to_vec();
            v.sort();
            v
        }

        self.circle_id == other.circle_id
            && self.owner == other.owner
            && self.name == other.name
            && self.key_generation == other.key_generation
            && self.updated_at == other.updated_at
            && sorted(&self.posts) == sorted(&other.posts)
            && sorted(&self.reactions) == sorted(&other.reactions)
            && sorted(&self.members) == sorted(&other.members)
    }

    /// All referenced content hashes
    pub fn entry_hashes(&self) -> impl Iterator<Item = &BlobHash> {
        self.posts.iter().chain(self.reactions.iter()).map(|e| &e.hash)
    }
}

/// Root of one peer's published state, as seen by one audience peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserManifest {
    /// Publisher
    pub owner: PeerId,
    /// Strictly increasing per publish
    pub version: u64,
    /// Hash of the publisher's identity blob
    pub identity_hash: Option<BlobHash>,
    /// Circle manifest hash per circle
    pub circles: BTreeMap<CircleId, BlobHash>,
    /// Outstanding action hashes per target peer
    pub pending_actions: BTreeMap<PeerId, Vec<BlobHash>>,
    /// Build time (ms)
    pub updated_at: Timestamp,
}

impl UserManifest {
    /// Action hashes directed at `peer`
    pub fn actions_for(&self, peer: &PeerId) -> &[BlobHash] {
        self.pending_actions
            .get(peer)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(n: u8, ts: Timestamp) -> ManifestEntry {
        ManifestEntry {
            hash: BlobHash::of(&[n]),
            timestamp: ts,
            author: PeerId([1; 32]),
        }
    }

    fn manifest(posts: Vec<ManifestEntry>, members: Vec<PeerId>) -> CircleManifest {
        CircleManifest {
            circle_id: CircleId(ulid::Ulid::from_parts(1, 1)),
            owner: PeerId([1; 32]),
            name: "friends".into(),
            posts,
            reactions: vec![],
            members,
            key_generation: 1,
            updated_at: 10,
        }
    }

    #[test]
    fn test_same_content_ignores_order() {
        let a = manifest(
            vec![entry(1, 5), entry(2, 6)],
            vec![PeerId([1; 32]), PeerId([2; 32])],
        );
        let b = manifest(
            vec![entry(2, 6), entry(1, 5)],
            vec![PeerId([2; 32]), PeerId([1; 32])],
        );
        assert!(a.same_content(&b));
        assert_ne!(a, b);

        let c = manifest(vec![entry(1, 5)], vec![PeerId([1; 32])]);
        assert!(!a.same_content(&c));
    }

    #[test]
    fn test_actions_for_missing_peer_is_empty() {
        let manifest = UserManifest {
            owner: PeerId([1; 32]),
            version: 1,
            identity_hash: None,
            circles: BTreeMap::new(),
            pending_actions: BTreeMap::new(),
            updated_at: 0,
        };
        assert!(manifest.actions_for(&PeerId([9; 32])).is_empty());
    }
}
