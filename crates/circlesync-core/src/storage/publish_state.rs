//! Publish bookkeeping: version counter and last built circle manifests

use redb::TableDefinition;
use serde::{Deserialize, Serialize};

use super::identity::META_TABLE;
use super::Storage;
use crate::error::SyncResult;
use crate::types::{BlobHash, CircleId, CircleManifest, Timestamp};

/// Last built manifest per own circle (key: circle id)
pub(crate) const BUILT_MANIFESTS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("built_manifests");

const PUBLISH_STATE_KEY: &str = "publish_state";

/// What the last successful publish produced
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishState {
    /// Version of the last published root (0 = never published)
    pub last_version: u64,
    /// Hash of the last published root collection
    pub last_root: Option<BlobHash>,
    /// When it was published (ms)
    pub last_published_at: Option<Timestamp>,
}

#[derive(Serialize, Deserialize)]
struct BuiltManifest {
    manifest: CircleManifest,
    hash: BlobHash,
}

impl Storage {
    // ═══════════════════════════════════════════════════════════════════════
    // Publish State Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Load publish state (default if never published)
    pub fn load_publish_state(&self) -> SyncResult<PublishState> {
        Ok(self.get(META_TABLE, PUBLISH_STATE_KEY)?.unwrap_or_default())
    }

    /// Save publish state
    pub fn save_publish_state(&self, state: &PublishState) -> SyncResult<()> {
        self.put(META_TABLE, PUBLISH_STATE_KEY, state)
    }

    /// Last built manifest for one of our circles
    pub fn load_built_manifest(
        &self,
        circle: &CircleId,
    ) -> SyncResult<Option<(CircleManifest, BlobHash)>> {
        Ok(self
            .get::<BuiltManifest>(BUILT_MANIFESTS_TABLE, &circle.to_string())?
            .map(|b| (b.manifest, b.hash)))
    }

    /// Remember the last built manifest for a circle
    pub fn save_built_manifest(&self, manifest: &CircleManifest, hash: &BlobHash) -> SyncResult<()> {
        let built = BuiltManifest {
            manifest: manifest.clone(),
            hash: *hash,
        };
        self.put(BUILT_MANIFESTS_TABLE, &manifest.circle_id.to_string(), &built)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PeerId;
    use tempfile::tempdir;

    #[test]
    fn test_publish_state_defaults() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().join("test.redb")).unwrap();
        assert_eq!(storage.load_publish_state().unwrap(), PublishState::default());

        let state = PublishState {
            last_version: 3,
            last_root: Some(BlobHash::of(b"root")),
            last_published_at: Some(1000),
        };
        storage.save_publish_state(&state).unwrap();
        assert_eq!(storage.load_publish_state().unwrap(), state);
    }

    #[test]
    fn test_built_manifest_roundtrip() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().join("test.redb")).unwrap();
        let manifest = CircleManifest {
            circle_id: CircleId::new(),
            owner: PeerId([1; 32]),
            name: "friends".to_string(),
            posts: Vec::new(),
            reactions: Vec::new(),
            members: vec![PeerId([1; 32])],
            key_generation: 1,
            updated_at: 10,
        };
        let hash = BlobHash::of(b"manifest");
        storage.save_built_manifest(&manifest, &hash).unwrap();

        let (loaded, loaded_hash) = storage
            .load_built_manifest(&manifest.circle_id)
            .unwrap()
            .unwrap();
        assert_eq!(loaded, manifest);
        assert_eq!(loaded_hash, hash);
    }
}
