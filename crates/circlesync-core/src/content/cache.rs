//! Resolution cache for root pointers

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use super::RootPointer;
use crate::types::PeerId;

/// Path of the published root within a peer's namespace
pub const ROOT_PATH: &str = "root";

/// Memoizes `(peer, path) -> RootPointer`.
///
/// A lookup never returns an entry below the caller's `min_version`, and an
/// insert never replaces a newer entry with an older one.
#[derive(Debug, Clone, Default)]
pub struct ResolutionCache {
    entries: Arc<RwLock<HashMap<(PeerId, String), RootPointer>>>,
}

impl ResolutionCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached pointer for `(peer, path)` if its version is at least `min_version`
    pub fn get(&self, peer: &PeerId, path: &str, min_version: u64) -> Option<RootPointer> {
        let entries = self.entries.read();
        let hit = entries
            .get(&(*peer, path.to_string()))
            .filter(|p| p.version >= min_version)
            .cloned();
        trace!(%peer, path, min_version, hit = hit.is_some(), "Resolution cache lookup");
        hit
    }

    /// Store a pointer unless a newer one is already cached.
    ///
    /// Returns true if the entry changed.
    pub fn insert(&self, path: &str, pointer: RootPointer) -> bool {
        let mut entries = self.entries.write();
        let key = (pointer.peer, path.to_string());
        match entries.get(&key) {
            Some(existing) if existing.version >= pointer.version => false,
            _ => {
                entries.insert(key, pointer);
                true
            }
        }
    }

    /// Drop everything cached for a peer
    pub fn invalidate(&self, peer: &PeerId) {
        self.entries.write().retain(|(p, _), _| p != peer);
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::types::BlobHash;

    fn pointer(keypair: &Keypair, version: u64) -> RootPointer {
        RootPointer::sign(keypair, BlobHash::of(&version.to_le_bytes()), version).unwrap()
    }

    #[test]
    fn test_never_serves_below_min_version() {
        let keypair = Keypair::generate();
        let cache = ResolutionCache::new();
        cache.insert(ROOT_PATH, pointer(&keypair, 3));

        let peer = keypair.peer_id();
        assert_eq!(cache.get(&peer, ROOT_PATH, 3).unwrap().version, 3);
        assert!(cache.get(&peer, ROOT_PATH, 4).is_none());
        assert!(cache.get(&peer, "other", 0).is_none());
    }

    #[test]
    fn test_insert_keeps_newest() {
        let keypair = Keypair::generate();
        let cache = ResolutionCache::new();
        assert!(cache.insert(ROOT_PATH, pointer(&keypair, 5)));
        assert!(!cache.insert(ROOT_PATH, pointer(&keypair, 4)));
        assert!(cache.insert(ROOT_PATH, pointer(&keypair, 6)));
        assert_eq!(
            cache.get(&keypair.peer_id(), ROOT_PATH, 0).unwrap().version,
            6
        );
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_invalidate() {
        let keypair = Keypair::generate();
        let cache = ResolutionCache::new();
        cache.insert(ROOT_PATH, pointer(&keypair, 1));
        cache.invalidate(&keypair.peer_id());
        assert!(cache.is_empty());
    }
}
