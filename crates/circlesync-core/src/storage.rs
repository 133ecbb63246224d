//! Persistent local store using redb.
//!
//! The engines only see [`LocalStore`], which exposes the query shapes the
//! pipelines need:
//! - entities with no stored hash (upload queue)
//! - received actions not yet processed
//! - posts and reactions by author set or circle
//! - content-hash existence (dedup before fetching)
//! - per-peer watermark get/set
//!
//! [`Storage`] implements it with one redb table per entity kind, values
//! encoded as JSON. Writes commit before returning, so a pipeline step that
//! reads "already done" on the next run sees a durable mutation.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::crypto::{KeyRecord, KeyScope};
use crate::error::{SyncError, SyncResult};
use crate::types::{
    Action, BlobHash, Circle, CircleId, CircleManifest, Identity, Introduction, PeerId,
    PeerRecord, PendingAttachment, Post, PostId, Reaction,
};

mod actions;
mod attachments;
mod blob_index;
mod circles;
mod identity;
mod keys;
mod peers;
mod posts;
mod publish_state;
mod reactions;

use actions::{INBOX_TABLE, OUTBOX_TABLE};
use attachments::{ATTACHMENTS_TABLE, PENDING_ATTACHMENTS_TABLE};
use blob_index::{BLOB_INDEX_TABLE, UNREADABLE_TABLE};
use circles::CIRCLES_TABLE;
use identity::{IDENTITIES_TABLE, META_TABLE};
use keys::KEY_RECORDS_TABLE;
use peers::{INTRODUCTIONS_TABLE, PEERS_TABLE};
use posts::POSTS_TABLE;
use publish_state::BUILT_MANIFESTS_TABLE;
use reactions::REACTIONS_TABLE;

pub use blob_index::EntityRef;
pub use publish_state::PublishState;

/// Database file name inside the data directory
pub const DB_FILE: &str = "circlesync.redb";

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Repository interface over the local persistent store.
///
/// All methods are synchronous and durable on return.
pub trait LocalStore: Send + Sync {
    // Identity
    /// Persist the local keypair seed
    fn save_keypair_seed(&self, seed: &[u8; 32]) -> SyncResult<()>;
    /// Local keypair seed, if initialized
    fn load_keypair_seed(&self) -> SyncResult<Option<[u8; 32]>>;
    /// Save an identity (local or fetched)
    fn save_identity(&self, identity: &Identity) -> SyncResult<()>;
    /// Identity of a peer
    fn load_identity(&self, peer: &PeerId) -> SyncResult<Option<Identity>>;

    // Circles
    /// Save a circle
    fn save_circle(&self, circle: &Circle) -> SyncResult<()>;
    /// Load one circle
    fn load_circle(&self, owner: &PeerId, id: &CircleId) -> SyncResult<Option<Circle>>;
    /// Circles owned by `owner`, oldest first
    fn list_circles(&self, owner: &PeerId) -> SyncResult<Vec<Circle>>;

    // Posts
    /// Save a post, indexing its stored hash if present
    fn save_post(&self, post: &Post) -> SyncResult<()>;
    /// Load one post
    fn load_post(&self, author: &PeerId, id: &PostId) -> SyncResult<Option<Post>>;
    /// Post stored under `hash`
    fn post_by_hash(&self, hash: &BlobHash) -> SyncResult<Option<Post>>;
    /// Posts by `author` with no stored hash
    fn unpublished_posts(&self, author: &PeerId) -> SyncResult<Vec<Post>>;
    /// Posts by any of `authors`, newest first
    fn posts_by_authors(&self, authors: &[PeerId]) -> SyncResult<Vec<Post>>;
    /// Published posts by `author` in one of their circles
    fn posts_in_circle(&self, author: &PeerId, circle: &CircleId) -> SyncResult<Vec<Post>>;
    /// Remove the post stored under `hash`
    fn delete_post_by_hash(&self, hash: &BlobHash) -> SyncResult<Option<Post>>;

    // Reactions
    /// Save a reaction. Returns false if the uniqueness key already existed.
    fn save_reaction(&self, reaction: &Reaction) -> SyncResult<bool>;
    /// Reactions by `author` with no stored hash
    fn unpublished_reactions(&self, author: &PeerId) -> SyncResult<Vec<Reaction>>;
    /// Published reactions by `author` in one of their circles
    fn reactions_in_circle(&self, author: &PeerId, circle: &CircleId) -> SyncResult<Vec<Reaction>>;
    /// Reactions and tags on a post
    fn reactions_for_post(&self, post_hash: &BlobHash) -> SyncResult<Vec<Reaction>>;
    /// Reaction stored under `hash`
    fn reaction_by_hash(&self, hash: &BlobHash) -> SyncResult<Option<Reaction>>;
    /// Remove the reaction stored under `hash`
    fn delete_reaction_by_hash(&self, hash: &BlobHash) -> SyncResult<Option<Reaction>>;

    // Actions
    /// Save an outgoing action (keyed by its id)
    fn save_outgoing_action(&self, action: &Action) -> SyncResult<()>;
    /// All outgoing actions, oldest first
    fn outgoing_actions(&self) -> SyncResult<Vec<Action>>;
    /// Outgoing actions with no stored hash
    fn unpublished_actions(&self) -> SyncResult<Vec<Action>>;
    /// Save a received action under the hash it was fetched by
    fn save_incoming_action(&self, hash: &BlobHash, action: &Action) -> SyncResult<()>;
    /// Received action by hash
    fn incoming_action(&self, hash: &BlobHash) -> SyncResult<Option<Action>>;
    /// Received actions not yet dispatched, oldest first
    fn unprocessed_actions(&self) -> SyncResult<Vec<Action>>;
    /// Mark a received action dispatched
    fn mark_action_processed(&self, hash: &BlobHash) -> SyncResult<()>;

    // Keys
    /// Key history for a scope
    fn load_key_record(&self, scope: &KeyScope) -> SyncResult<Option<KeyRecord>>;
    /// Replace the key history for a scope
    fn save_key_record(&self, record: &KeyRecord) -> SyncResult<()>;

    // Peers
    /// Save a subscription
    fn save_peer(&self, record: &PeerRecord) -> SyncResult<()>;
    /// Load a subscription
    fn load_peer(&self, peer: &PeerId) -> SyncResult<Option<PeerRecord>>;
    /// All subscriptions
    fn list_peers(&self) -> SyncResult<Vec<PeerRecord>>;
    /// Drop a subscription. Returns true if it existed.
    fn delete_peer(&self, peer: &PeerId) -> SyncResult<bool>;

    /// Replay watermark for a peer (0 if not followed)
    fn watermark(&self, peer: &PeerId) -> SyncResult<u64> {
        Ok(self
            .load_peer(peer)?
            .map(|r| r.last_accepted_version)
            .unwrap_or(0))
    }

    // Content hashes
    /// Whether content stored under `hash` is already persisted locally
    fn has_blob(&self, hash: &BlobHash) -> SyncResult<bool>;
    /// Record what entity a hash was persisted as
    fn record_blob(&self, hash: &BlobHash, entity: &EntityRef) -> SyncResult<()>;
    /// Remember that no key in `key_set` opens `hash`
    fn record_unreadable(&self, hash: &BlobHash, key_set: &BlobHash) -> SyncResult<()>;
    /// Candidate set `hash` last failed under, if any
    fn unreadable_under(&self, hash: &BlobHash) -> SyncResult<Option<BlobHash>>;

    // Publish state
    /// Last published version and root
    fn load_publish_state(&self) -> SyncResult<PublishState>;
    /// Save publish state
    fn save_publish_state(&self, state: &PublishState) -> SyncResult<()>;
    /// Last built manifest of one of our circles and its stored hash
    fn load_built_manifest(&self, circle: &CircleId)
        -> SyncResult<Option<(CircleManifest, BlobHash)>>;
    /// Remember a built circle manifest
    fn save_built_manifest(&self, manifest: &CircleManifest, hash: &BlobHash) -> SyncResult<()>;

    // Attachments
    /// Queue attachment bytes for upload
    fn save_pending_attachment(&self, attachment: &PendingAttachment) -> SyncResult<()>;
    /// Queued attachment by plaintext hash
    fn load_pending_attachment(&self, content_hash: &BlobHash)
        -> SyncResult<Option<PendingAttachment>>;
    /// Drop a queued attachment after upload
    fn delete_pending_attachment(&self, content_hash: &BlobHash) -> SyncResult<()>;
    /// Save attachment plaintext
    fn save_attachment(&self, content_hash: &BlobHash, bytes: &[u8]) -> SyncResult<()>;
    /// Attachment plaintext by content hash
    fn load_attachment(&self, content_hash: &BlobHash) -> SyncResult<Option<Vec<u8>>>;

    // Introductions
    /// Record an introduction
    fn save_introduction(&self, introduction: &Introduction) -> SyncResult<()>;
    /// All introductions, newest first
    fn list_introductions(&self) -> SyncResult<Vec<Introduction>>;
}

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

impl Storage {
    /// Create a new storage instance at the given path.
    ///
    /// This will:
    /// - Create the database directory if it doesn't exist
    /// - Initialize the database file
    /// - Create all required tables
    pub fn new(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(META_TABLE)?;
            let _ = write_txn.open_table(IDENTITIES_TABLE)?;
            let _ = write_txn.open_table(CIRCLES_TABLE)?;
            let _ = write_txn.open_table(POSTS_TABLE)?;
            let _ = write_txn.open_table(REACTIONS_TABLE)?;
            let _ = write_txn.open_table(OUTBOX_TABLE)?;
            let _ = write_txn.open_table(INBOX_TABLE)?;
            let _ = write_txn.open_table(KEY_RECORDS_TABLE)?;
            let _ = write_txn.open_table(PEERS_TABLE)?;
            let _ = write_txn.open_table(INTRODUCTIONS_TABLE)?;
            let _ = write_txn.open_table(BLOB_INDEX_TABLE)?;
            let _ = write_txn.open_table(UNREADABLE_TABLE)?;
            let _ = write_txn.open_table(BUILT_MANIFESTS_TABLE)?;
            let _ = write_txn.open_table(PENDING_ATTACHMENTS_TABLE)?;
            let _ = write_txn.open_table(ATTACHMENTS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    /// Open the database inside a data directory
    pub fn open_in(data_dir: impl AsRef<Path>) -> SyncResult<Self> {
        Self::new(data_dir.as_ref().join(DB_FILE))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Generic row access
    // ═══════════════════════════════════════════════════════════════════════

    fn encode<T: Serialize>(value: &T) -> SyncResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| SyncError::Serialization(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> SyncResult<T> {
        serde_json::from_slice(bytes).map_err(|e| SyncError::Serialization(e.to_string()))
    }

    fn put<T: Serialize>(&self, table: Table, key: &str, value: &T) -> SyncResult<()> {
        let data = Self::encode(value)?;
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(table)?;
            table.insert(key, data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Write a row and, if it has a stored hash, its index entry in one
    /// transaction
    fn put_indexed<T: Serialize>(
        &self,
        table: Table,
        key: &str,
        value: &T,
        stored: Option<(&BlobHash, &EntityRef)>,
    ) -> SyncResult<()> {
        let data = Self::encode(value)?;
        let index = match stored {
            Some((hash, entity)) => Some((hash.to_hex(), Self::encode(entity)?)),
            None => None,
        };

        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(table)?;
            table.insert(key, data.as_slice())?;
            if let Some((hash, entity)) = &index {
                let mut blobs = write_txn.open_table(BLOB_INDEX_TABLE)?;
                blobs.insert(hash.as_str(), entity.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Remove a row and its index entry in one transaction
    fn remove_indexed(&self, table: Table, key: &str, hash: &BlobHash) -> SyncResult<bool> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(table)?;
            let mut blobs = write_txn.open_table(BLOB_INDEX_TABLE)?;
            blobs.remove(hash.to_hex().as_str())?;
            let removed = table.remove(key)?;
            removed.is_some()
        };
        write_txn.commit()?;
        Ok(existed)
    }

    fn get<T: DeserializeOwned>(&self, table: Table, key: &str) -> SyncResult<Option<T>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(table)?;

        match table.get(key)? {
            Some(v) => Ok(Some(Self::decode(v.value())?)),
            None => Ok(None),
        }
    }

    fn remove(&self, table: Table, key: &str) -> SyncResult<bool> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(table)?;
            let removed = table.remove(key)?;
            removed.is_some()
        };
        write_txn.commit()?;
        Ok(existed)
    }

    /// Every row whose key starts with `prefix`, in key order
    fn scan<T: DeserializeOwned>(&self, table: Table, prefix: &str) -> SyncResult<Vec<T>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(table)?;

        let mut rows = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            if key.value().starts_with(prefix) {
                rows.push(Self::decode(value.value())?);
            }
        }
        Ok(rows)
    }
}

impl LocalStore for Storage {
    fn save_keypair_seed(&self, seed: &[u8; 32]) -> SyncResult<()> {
        Storage::save_keypair_seed(self, seed)
    }

    fn load_keypair_seed(&self) -> SyncResult<Option<[u8; 32]>> {
        Storage::load_keypair_seed(self)
    }

    fn save_identity(&self, identity: &Identity) -> SyncResult<()> {
        Storage::save_identity(self, identity)
    }

    fn load_identity(&self, peer: &PeerId) -> SyncResult<Option<Identity>> {
        Storage::load_identity(self, peer)
    }

    fn save_circle(&self, circle: &Circle) -> SyncResult<()> {
        Storage::save_circle(self, circle)
    }

    fn load_circle(&self, owner: &PeerId, id: &CircleId) -> SyncResult<Option<Circle>> {
        Storage::load_circle(self, owner, id)
    }

    fn list_circles(&self, owner: &PeerId) -> SyncResult<Vec<Circle>> {
        Storage::list_circles(self, owner)
    }

    fn save_post(&self, post: &Post) -> SyncResult<()> {
        Storage::save_post(self, post)
    }

    fn load_post(&self, author: &PeerId, id: &PostId) -> SyncResult<Option<Post>> {
        Storage::load_post(self, author, id)
    }

    fn post_by_hash(&self, hash: &BlobHash) -> SyncResult<Option<Post>> {
        Storage::post_by_hash(self, hash)
    }

    fn unpublished_posts(&self, author: &PeerId) -> SyncResult<Vec<Post>> {
        Storage::unpublished_posts(self, author)
    }

    fn posts_by_authors(&self, authors: &[PeerId]) -> SyncResult<Vec<Post>> {
        Storage::posts_by_authors(self, authors)
    }

    fn posts_in_circle(&self, author: &PeerId, circle: &CircleId) -> SyncResult<Vec<Post>> {
        Storage::posts_in_circle(self, author, circle)
    }

    fn delete_post_by_hash(&self, hash: &BlobHash) -> SyncResult<Option<Post>> {
        Storage::delete_post_by_hash(self, hash)
    }

    fn save_reaction(&self, reaction: &Reaction) -> SyncResult<bool> {
        Storage::save_reaction(self, reaction)
    }

    fn unpublished_reactions(&self, author: &PeerId) -> SyncResult<Vec<Reaction>> {
        Storage::unpublished_reactions(self, author)
    }

    fn reactions_in_circle(&self, author: &PeerId, circle: &CircleId) -> SyncResult<Vec<Reaction>> {
        Storage::reactions_in_circle(self, author, circle)
    }

    fn reactions_for_post(&self, post_hash: &BlobHash) -> SyncResult<Vec<Reaction>> {
        Storage::reactions_for_post(self, post_hash)
    }

    fn reaction_by_hash(&self, hash: &BlobHash) -> SyncResult<Option<Reaction>> {
        Storage::reaction_by_hash(self, hash)
    }

    fn delete_reaction_by_hash(&self, hash: &BlobHash) -> SyncResult<Option<Reaction>> {
        Storage::delete_reaction_by_hash(self, hash)
    }

    fn save_outgoing_action(&self, action: &Action) -> SyncResult<()> {
        Storage::save_outgoing_action(self, action)
    }

    fn outgoing_actions(&self) -> SyncResult<Vec<Action>> {
        Storage::outgoing_actions(self)
    }

    fn unpublished_actions(&self) -> SyncResult<Vec<Action>> {
        Storage::unpublished_actions(self)
    }

    fn save_incoming_action(&self, hash: &BlobHash, action: &Action) -> SyncResult<()> {
        Storage::save_incoming_action(self, hash, action)
    }

    fn incoming_action(&self, hash: &BlobHash) -> SyncResult<Option<Action>> {
        Storage::incoming_action(self, hash)
    }

    fn unprocessed_actions(&self) -> SyncResult<Vec<Action>> {
        Storage::unprocessed_actions(self)
    }

    fn mark_action_processed(&self, hash: &BlobHash) -> SyncResult<()> {
        Storage::mark_action_processed(self, hash)
    }

    fn load_key_record(&self, scope: &KeyScope) -> SyncResult<Option<KeyRecord>> {
        Storage::load_key_record(self, scope)
    }

    fn save_key_record(&self, record: &KeyRecord) -> SyncResult<()> {
        Storage::save_key_record(self, record)
    }

    fn save_peer(&self, record: &PeerRecord) -> SyncResult<()> {
        Storage::save_peer(self, record)
    }

    fn load_peer(&self, peer: &PeerId) -> SyncResult<Option<PeerRecord>> {
        Storage::load_peer(self, peer)
    }

    fn list_peers(&self) -> SyncResult<Vec<PeerRecord>> {
        Storage::list_peers(self)
    }

    fn delete_peer(&self, peer: &PeerId) -> SyncResult<bool> {
        Storage::delete_peer(self, peer)
    }

    fn has_blob(&self, hash: &BlobHash) -> SyncResult<bool> {
        Storage::has_blob(self, hash)
    }

    fn record_blob(&self, hash: &BlobHash, entity: &EntityRef) -> SyncResult<()> {
        Storage::record_blob(self, hash, entity)
    }

    fn record_unreadable(&self, hash: &BlobHash, key_set: &BlobHash) -> SyncResult<()> {
        Storage::record_unreadable(self, hash, key_set)
    }

    fn unreadable_under(&self, hash: &BlobHash) -> SyncResult<Option<BlobHash>> {
        Storage::unreadable_under(self, hash)
    }

    fn load_publish_state(&self) -> SyncResult<PublishState> {
        Storage::load_publish_state(self)
    }

    fn save_publish_state(&self, state: &PublishState) -> SyncResult<()> {
        Storage::save_publish_state(self, state)
    }

    fn load_built_manifest(
        &self,
        circle: &CircleId,
    ) -> SyncResult<Option<(CircleManifest, BlobHash)>> {
        Storage::load_built_manifest(self, circle)
    }

    fn save_built_manifest(&self, manifest: &CircleManifest, hash: &BlobHash) -> SyncResult<()> {
        Storage::save_built_manifest(self, manifest, hash)
    }

    fn save_pending_attachment(&self, attachment: &PendingAttachment) -> SyncResult<()> {
        Storage::save_pending_attachment(self, attachment)
    }

    fn load_pending_attachment(
        &self,
        content_hash: &BlobHash,
    ) -> SyncResult<Option<PendingAttachment>> {
        Storage::load_pending_attachment(self, content_hash)
    }

    fn delete_pending_attachment(&self, content_hash: &BlobHash) -> SyncResult<()> {
        Storage::delete_pending_attachment(self, content_hash)
    }

    fn save_attachment(&self, content_hash: &BlobHash, bytes: &[u8]) -> SyncResult<()> {
        Storage::save_attachment(self, content_hash, bytes)
    }

    fn load_attachment(&self, content_hash: &BlobHash) -> SyncResult<Option<Vec<u8>>> {
        Storage::load_attachment(self, content_hash)
    }

    fn save_introduction(&self, introduction: &Introduction) -> SyncResult<()> {
        Storage::save_introduction(self, introduction)
    }

    fn list_introductions(&self) -> SyncResult<Vec<Introduction>> {
        Storage::list_introductions(self)
    }
}
