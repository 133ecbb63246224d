//! Key record storage

use redb::TableDefinition;

use super::Storage;
use crate::crypto::{KeyRecord, KeyScope};
use crate::error::SyncResult;

/// Key histories (key: scope string)
pub(crate) const KEY_RECORDS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("key_records");

impl Storage {
    // ═══════════════════════════════════════════════════════════════════════
    // Key Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Load the key history for a scope
    pub fn load_key_record(&self, scope: &KeyScope) -> SyncResult<Option<KeyRecord>> {
        self.get(KEY_RECORDS_TABLE, &scope.to_string())
    }

    /// Replace the key history for a scope
    pub fn save_key_record(&self, record: &KeyRecord) -> SyncResult<()> {
        self.put(KEY_RECORDS_TABLE, &record.scope.to_string(), record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CipherKind, SymmetricKey};
    use crate::types::{CircleId, PeerId};
    use tempfile::tempdir;

    #[test]
    fn test_key_record_roundtrip() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().join("test.redb")).unwrap();
        let scope = KeyScope::circle(PeerId([1; 32]), CircleId::new());

        assert!(storage.load_key_record(&scope).unwrap().is_none());

        let mut record = KeyRecord::new(scope);
        record.install(SymmetricKey::generate(CipherKind::ChaCha20Poly1305, 1));
        record.install(SymmetricKey::generate(CipherKind::ChaCha20Poly1305, 2));
        storage.save_key_record(&record).unwrap();

        let loaded = storage.load_key_record(&scope).unwrap().unwrap();
        assert_eq!(loaded, record);
        assert_eq!(loaded.latest_generation(), Some(2));
    }
}
