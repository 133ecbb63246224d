//! Action storage
//!
//! Outgoing actions live in the outbox keyed by id (ULIDs sort by creation
//! time). Received actions live in the inbox keyed by the hash they were
//! fetched under, which is also the dedup key.

use redb::TableDefinition;

use super::{EntityRef, Storage};
use crate::error::{SyncError, SyncResult};
use crate::types::{Action, BlobHash};

/// Outgoing actions (key: action id)
pub(crate) const OUTBOX_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("outbox");

/// Received actions (key: hex blob hash)
pub(crate) const INBOX_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("inbox");

impl Storage {
    // ═══════════════════════════════════════════════════════════════════════
    // Action Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Save an outgoing action
    pub fn save_outgoing_action(&self, action: &Action) -> SyncResult<()> {
        self.put_indexed(
            OUTBOX_TABLE,
            &action.id.to_string(),
            action,
            action.stored_hash.as_ref().map(|h| (h, &EntityRef::Action)),
        )
    }

    /// All outgoing actions, oldest first
    pub fn outgoing_actions(&self) -> SyncResult<Vec<Action>> {
        self.scan(OUTBOX_TABLE, "")
    }

    /// Outgoing actions not yet uploaded, oldest first
    pub fn unpublished_actions(&self) -> SyncResult<Vec<Action>> {
        Ok(self
            .outgoing_actions()?
            .into_iter()
            .filter(|a| a.stored_hash.is_none())
            .collect())
    }

    /// Save a received action under its fetch hash
    pub fn save_incoming_action(&self, hash: &BlobHash, action: &Action) -> SyncResult<()> {
        let mut action = action.clone();
        action.stored_hash = Some(*hash);
        self.put_indexed(
            INBOX_TABLE,
            &hash.to_hex(),
            &action,
            Some((hash, &EntityRef::Action)),
        )
    }

    /// Received action by hash
    pub fn incoming_action(&self, hash: &BlobHash) -> SyncResult<Option<Action>> {
        self.get(INBOX_TABLE, &hash.to_hex())
    }

    /// Received actions not yet dispatched, oldest first
    pub fn unprocessed_actions(&self) -> SyncResult<Vec<Action>> {
        let mut actions: Vec<Action> = self
            .scan::<Action>(INBOX_TABLE, "")?
            .into_iter()
            .filter(|a| !a.processed)
            .collect();
        actions.sort_by_key(|a| (a.timestamp, a.id));
        Ok(actions)
    }

    /// Mark a received action as dispatched
    pub fn mark_action_processed(&self, hash: &BlobHash) -> SyncResult<()> {
        let mut action = self
            .incoming_action(hash)?
            .ok_or_else(|| SyncError::UnknownEntity {
                kind: "action",
                id: hash.to_hex(),
            })?;
        action.processed = true;
        self.put(INBOX_TABLE, &hash.to_hex(), &action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActionKind, PeerId};
    use tempfile::tempdir;

    fn delete_action(to: PeerId) -> Action {
        Action::new(
            to,
            ActionKind::Delete {
                hash: BlobHash::of(b"post"),
            },
        )
    }

    #[test]
    fn test_outbox_queue() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().join("test.redb")).unwrap();

        let mut action = delete_action(PeerId([2; 32]));
        storage.save_outgoing_action(&action).unwrap();
        assert_eq!(storage.unpublished_actions().unwrap().len(), 1);

        action.stored_hash = Some(BlobHash::of(b"sealed"));
        storage.save_outgoing_action(&action).unwrap();
        assert!(storage.unpublished_actions().unwrap().is_empty());
        assert_eq!(storage.outgoing_actions().unwrap().len(), 1);
    }

    #[test]
    fn test_inbox_processing() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().join("test.redb")).unwrap();
        let hash = BlobHash::of(b"sealed action");

        let mut action = delete_action(PeerId([1; 32]));
        action.from = Some(PeerId([2; 32]));
        storage.save_incoming_action(&hash, &action).unwrap();

        assert!(storage.has_blob(&hash).unwrap());
        assert_eq!(storage.unprocessed_actions().unwrap().len(), 1);

        storage.mark_action_processed(&hash).unwrap();
        assert!(storage.unprocessed_actions().unwrap().is_empty());
        assert!(storage.incoming_action(&hash).unwrap().unwrap().processed);
    }

    #[test]
    fn test_mark_unknown_action() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().join("test.redb")).unwrap();
        let result = storage.mark_action_processed(&BlobHash::of(b"nope"));
        assert!(matches!(result, Err(SyncError::UnknownEntity { .. })));
    }
}
