//! Content-hash index
//!
//! Every hash persisted locally maps to the entity it became. The sync engine
//! checks this before fetching, so content already stored is never
//! downloaded again.
//!
//! Hashes that no candidate key could open are kept separately, with the id
//! of the candidate set that failed. They are fetched again only once that
//! set changes.

use redb::TableDefinition;
use serde::{Deserialize, Serialize};

use super::Storage;
use crate::error::SyncResult;
use crate::types::{BlobHash, PeerId, PostId};

/// Hash index (key: hex blob hash, value: [`EntityRef`])
pub(crate) const BLOB_INDEX_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("blob_index");

/// Unreadable content (key: hex blob hash, value: candidate set id)
pub(crate) const UNREADABLE_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("unreadable");

/// What a stored hash was persisted as
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityRef {
    /// A post
    Post {
        /// Author
        author: PeerId,
        /// Post id
        id: PostId,
    },
    /// A reaction or tag, by uniqueness key
    Reaction(String),
    /// A received or sent action
    Action,
    /// A peer's identity
    Identity(PeerId),
    /// An attachment, by plaintext hash
    Attachment(BlobHash),
}

impl Storage {
    // ═══════════════════════════════════════════════════════════════════════
    // Blob Index Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Whether `hash` was already persisted locally
    pub fn has_blob(&self, hash: &BlobHash) -> SyncResult<bool> {
        Ok(self.lookup_blob(hash)?.is_some())
    }

    /// Entity persisted under `hash`
    pub fn lookup_blob(&self, hash: &BlobHash) -> SyncResult<Option<EntityRef>> {
        self.get(BLOB_INDEX_TABLE, &hash.to_hex())
    }

    /// Record what `hash` was persisted as
    pub fn record_blob(&self, hash: &BlobHash, entity: &EntityRef) -> SyncResult<()> {
        self.put(BLOB_INDEX_TABLE, &hash.to_hex(), entity)
    }

    /// Remember that no key in `key_set` opens `hash`
    pub fn record_unreadable(&self, hash: &BlobHash, key_set: &BlobHash) -> SyncResult<()> {
        self.put(UNREADABLE_TABLE, &hash.to_hex(), key_set)
    }

    /// Candidate set `hash` last failed under
    pub fn unreadable_under(&self, hash: &BlobHash) -> SyncResult<Option<BlobHash>> {
        self.get(UNREADABLE_TABLE, &hash.to_hex())
    }
}
