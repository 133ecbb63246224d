//! Subscriptions and introductions

use redb::TableDefinition;

use super::Storage;
use crate::error::SyncResult;
use crate::types::{Introduction, PeerId, PeerRecord};

/// Followed peers (key: hex peer id)
pub(crate) const PEERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("peers");

/// Introductions (key: "<from hex>:<peer hex>")
pub(crate) const INTRODUCTIONS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("introductions");

impl Storage {
    // ═══════════════════════════════════════════════════════════════════════
    // Peer Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Save a subscription, overwriting the previous record
    pub fn save_peer(&self, record: &PeerRecord) -> SyncResult<()> {
        self.put(PEERS_TABLE, &record.peer.to_hex(), record)
    }

    /// Load a subscription
    pub fn load_peer(&self, peer: &PeerId) -> SyncResult<Option<PeerRecord>> {
        self.get(PEERS_TABLE, &peer.to_hex())
    }

    /// All subscriptions, oldest first
    pub fn list_peers(&self) -> SyncResult<Vec<PeerRecord>> {
        let mut peers: Vec<PeerRecord> = self.scan(PEERS_TABLE, "")?;
        peers.sort_by_key(|p| (p.followed_at, p.peer));
        Ok(peers)
    }

    /// Remove a subscription
    pub fn delete_peer(&self, peer: &PeerId) -> SyncResult<bool> {
        self.remove(PEERS_TABLE, &peer.to_hex())
    }

    /// Record an introduction. A repeated introduction replaces the earlier one.
    pub fn save_introduction(&self, introduction: &Introduction) -> SyncResult<()> {
        let key = format!("{}:{}", introduction.from.to_hex(), introduction.peer.to_hex());
        self.put(INTRODUCTIONS_TABLE, &key, introduction)
    }

    /// All introductions, newest first
    pub fn list_introductions(&self) -> SyncResult<Vec<Introduction>> {
        let mut introductions: Vec<Introduction> = self.scan(INTRODUCTIONS_TABLE, "")?;
        introductions.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        Ok(introductions)
    }
}
