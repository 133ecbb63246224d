//! Attachment bytes: queued for upload, or fetched and decrypted

use redb::TableDefinition;

use super::Storage;
use crate::error::SyncResult;
use crate::types::{BlobHash, PendingAttachment};

/// Attachments waiting for upload (key: hex plaintext hash)
pub(crate) const PENDING_ATTACHMENTS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("pending_attachments");

/// Attachment plaintext (key: hex plaintext hash, value: raw bytes)
pub(crate) const ATTACHMENTS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("attachments");

impl Storage {
    // ═══════════════════════════════════════════════════════════════════════
    // Attachment Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Queue an attachment for upload
    pub fn save_pending_attachment(&self, attachment: &PendingAttachment) -> SyncResult<()> {
        self.put(
            PENDING_ATTACHMENTS_TABLE,
            &attachment.content_hash.to_hex(),
            attachment,
        )
    }

    /// Queued attachment by plaintext hash
    pub fn load_pending_attachment(
        &self,
        content_hash: &BlobHash,
    ) -> SyncResult<Option<PendingAttachment>> {
        self.get(PENDING_ATTACHMENTS_TABLE, &content_hash.to_hex())
    }

    /// Drop a queued attachment
    pub fn delete_pending_attachment(&self, content_hash: &BlobHash) -> SyncResult<()> {
        self.remove(PENDING_ATTACHMENTS_TABLE, &content_hash.to_hex())?;
        Ok(())
    }

    /// Save attachment plaintext. Stored raw, not JSON encoded.
    pub fn save_attachment(&self, content_hash: &BlobHash, bytes: &[u8]) -> SyncResult<()> {
        let key = content_hash.to_hex();
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(ATTACHMENTS_TABLE)?;
            table.insert(key.as_str(), bytes)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Attachment plaintext by content hash
    pub fn load_attachment(&self, content_hash: &BlobHash) -> SyncResult<Option<Vec<u8>>> {
        let key = content_hash.to_hex();
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(ATTACHMENTS_TABLE)?;

        match table.get(key.as_str())? {
            Some(v) => Ok(Some(v.value().to_vec())),
            None => Ok(None),
        }
    }
}
