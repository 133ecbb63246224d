//! Local keypair seed and identities

use redb::TableDefinition;

use super::Storage;
use crate::error::{SyncError, SyncResult};
use crate::types::{Identity, PeerId};

/// Singleton values (key: name)
pub(crate) const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

/// Identities, local and fetched (key: hex peer id)
pub(crate) const IDENTITIES_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("identities");

const KEYPAIR_SEED_KEY: &str = "keypair_seed";

impl Storage {
    // ═══════════════════════════════════════════════════════════════════════
    // Identity Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Persist the local Ed25519 seed
    pub fn save_keypair_seed(&self, seed: &[u8; 32]) -> SyncResult<()> {
        self.put(META_TABLE, KEYPAIR_SEED_KEY, &hex::encode(seed))
    }

    /// Load the local Ed25519 seed
    pub fn load_keypair_seed(&self) -> SyncResult<Option<[u8; 32]>> {
        let Some(encoded) = self.get::<String>(META_TABLE, KEYPAIR_SEED_KEY)? else {
            return Ok(None);
        };
        let bytes = hex::decode(&encoded)
            .map_err(|e| SyncError::Storage(format!("Corrupt keypair seed: {}", e)))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SyncError::Storage("Keypair seed has wrong length".to_string()))?;
        Ok(Some(seed))
    }

    /// Save an identity, replacing any previous version for that peer
    pub fn save_identity(&self, identity: &Identity) -> SyncResult<()> {
        self.put(IDENTITIES_TABLE, &identity.owner.to_hex(), identity)
    }

    /// Load a peer's identity
    pub fn load_identity(&self, peer: &PeerId) -> SyncResult<Option<Identity>> {
        self.get(IDENTITIES_TABLE, &peer.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_keypair_seed_roundtrip() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().join("test.redb")).unwrap();
        assert!(storage.load_keypair_seed().unwrap().is_none());

        storage.save_keypair_seed(&[7u8; 32]).unwrap();
        assert_eq!(storage.load_keypair_seed().unwrap(), Some([7u8; 32]));
    }

    #[test]
    fn test_identity_overwrite() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().join("test.redb")).unwrap();
        let peer = PeerId([1; 32]);

        let mut identity = Identity::new(peer, "Alice");
        storage.save_identity(&identity).unwrap();
        identity.rename("Alice B.");
        storage.save_identity(&identity).unwrap();

        let loaded = storage.load_identity(&peer).unwrap().unwrap();
        assert_eq!(loaded.name, "Alice B.");
        assert!(storage.load_identity(&PeerId([2; 32])).unwrap().is_none());
    }
}
