//! Node - the primary entry point for CircleSync
//!
//! A `Node` is one local identity with its store, keys and content backend.
//! It coordinates:
//! - local authoring (identity, circles, posts, reactions, actions)
//! - the publish pipeline ([`PublishEngine`])
//! - the download pipeline ([`SyncEngine`])
//! - the background loop ([`SyncService`])
//!
//! # Example
//!
//! ```ignore
//! use circlesync_core::Node;
//!
//! let node = Node::open_in("~/.circlesync/data").await?;
//! node.set_name("alice")?;
//!
//! let everyone = node.everyone()?;
//! node.add_member(&everyone.id, bob)?;
//! node.post(&everyone.id, "hello")?;
//! node.publish().await?;
//! ```

use std::path::Path;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::content::{ContentStore, IrohContentStore, MemoryContentStore, MemoryNetwork, StoreClient};
use crate::crypto::KeyManager;
use crate::error::{SyncError, SyncResult};
use crate::identity::Keypair;
use crate::publish::{PublishEngine, PublishReport};
use crate::service::SyncService;
use crate::storage::{LocalStore, Storage};
use crate::sync::{
    PeerSyncOutcome, PeerSyncState, SyncEngine, SyncEvent, SyncReport, EVENT_CHANNEL_CAPACITY,
};
use crate::types::{
    now_millis, Action, ActionKind, BlobHash, Circle, CircleId, Clock, Identity, Introduction,
    PeerId, PeerRecord, PendingAttachment, Post, Reaction, ReactionKind,
};

/// Load the local keypair, creating and persisting one on first use
pub fn load_or_create_keypair(store: &dyn LocalStore) -> SyncResult<Keypair> {
    if let Some(seed) = store.load_keypair_seed()? {
        return Ok(Keypair::from_seed(&seed));
    }
    let keypair = Keypair::generate();
    store.save_keypair_seed(&keypair.to_bytes())?;
    info!(peer = %keypair.peer_id(), "Generated new identity keypair");
    Ok(keypair)
}

/// One local identity and everything needed to publish and sync it
pub struct Node<C> {
    store: Arc<dyn LocalStore>,
    content: StoreClient<C>,
    keys: KeyManager,
    config: EngineConfig,
    events: broadcast::Sender<SyncEvent>,
    publisher: PublishEngine<C>,
    sync: SyncEngine<C>,
}

impl Node<IrohContentStore> {
    /// Open a node in a data directory: redb store, persistent iroh blobs,
    /// `config.json` if present
    pub async fn open_in(data_dir: impl AsRef<Path>) -> SyncResult<Self> {
        let data_dir = data_dir.as_ref();
        info!(?data_dir, "Opening node");
        std::fs::create_dir_all(data_dir)?;

        let config = EngineConfig::load(data_dir)?;
        let storage: Arc<dyn LocalStore> = Arc::new(Storage::open_in(data_dir)?);
        let keypair = load_or_create_keypair(storage.as_ref())?;
        let content = IrohContentStore::new_persistent(&keypair, data_dir).await?;

        Self::open(storage, Arc::new(content), keypair, config)
    }

    /// Stop the network side
    pub async fn shutdown(&self) {
        self.content.backend().shutdown().await;
    }
}

impl Node<MemoryContentStore> {
    /// Open a data directory without networking. Authoring and reading work;
    /// publish and sync only reach this process.
    pub fn open_offline(data_dir: impl AsRef<Path>) -> SyncResult<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;

        let config = EngineConfig::load(data_dir)?;
        let storage: Arc<dyn LocalStore> = Arc::new(Storage::open_in(data_dir)?);
        let keypair = load_or_create_keypair(storage.as_ref())?;
        let content = MemoryNetwork::new().node(keypair.peer_id());

        Self::open(storage, Arc::new(content), keypair, config)
    }
}

impl<C: ContentStore> Node<C> {
    /// Assemble a node from its parts, creating the "everyone" circle and its
    /// first key if this identity has none yet
    pub fn open(
        store: Arc<dyn LocalStore>,
        content: Arc<C>,
        keypair: Keypair,
        config: EngineConfig,
    ) -> SyncResult<Self> {
        Self::open_with_clock(store, content, keypair, config, Clock::system())
    }

    /// [`Node::open`] with the publish pipeline reading time from `clock`
    pub fn open_with_clock(
        store: Arc<dyn LocalStore>,
        content: Arc<C>,
        keypair: Keypair,
        config: EngineConfig,
        clock: Clock,
    ) -> SyncResult<Self> {
        config.validate()?;
        let keypair = Arc::new(keypair);
        let local = keypair.peer_id();
        let keys = KeyManager::new(store.clone(), keypair, config.cipher);
        let content = StoreClient::new(content, &config);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let publisher = PublishEngine::new(
            store.clone(),
            content.clone(),
            keys.clone(),
            config.clone(),
            events.clone(),
        )
        .with_clock(clock);
        let sync = SyncEngine::new(
            store.clone(),
            content.clone(),
            keys.clone(),
            config.clone(),
            events.clone(),
        );

        let node = Self {
            store,
            content,
            keys,
            config,
            events,
            publisher,
            sync,
        };
        node.ensure_everyone()?;
        info!(peer = %local, "Node ready");
        Ok(node)
    }

    fn ensure_everyone(&self) -> SyncResult<()> {
        let local = self.peer_id();
        if self.store.list_circles(&local)?.iter().any(|c| c.is_everyone) {
            return Ok(());
        }
        let mut everyone = Circle::everyone(local);
        self.keys.rotate(&mut everyone)?;
        self.store.save_circle(&everyone)?;
        info!(circle = %everyone.id, "Created everyone circle");
        Ok(())
    }

    /// Local peer id
    pub fn peer_id(&self) -> PeerId {
        self.keys.keypair().peer_id()
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Content-store client shared by both pipelines
    pub fn content(&self) -> &StoreClient<C> {
        &self.content
    }

    /// Subscribe to publish and sync events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Identity
    // ═══════════════════════════════════════════════════════════════════════

    /// Set the display name, creating the identity if needed
    pub fn set_name(&self, name: &str) -> SyncResult<Identity> {
        let local = self.peer_id();
        let identity = match self.store.load_identity(&local)? {
            Some(mut identity) => {
                identity.rename(name);
                identity
            }
            None => Identity::new(local, name),
        };
        self.store.save_identity(&identity)?;
        Ok(identity)
    }

    /// Replace the avatar; uploaded with the next publish
    pub fn set_avatar(&self, file_name: &str, bytes: Vec<u8>) -> SyncResult<Identity> {
        let local = self.peer_id();
        let pending = PendingAttachment::new(file_name, bytes);
        self.store.save_pending_attachment(&pending)?;

        let mut identity = self
            .store
            .load_identity(&local)?
            .unwrap_or_else(|| Identity::new(local, local.short()));
        identity.set_avatar(Some(pending.file_ref()));
        self.store.save_identity(&identity)?;
        Ok(identity)
    }

    /// Identity of any peer, local or fetched
    pub fn identity(&self, peer: &PeerId) -> SyncResult<Option<Identity>> {
        self.store.load_identity(peer)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Circles
    // ═══════════════════════════════════════════════════════════════════════

    /// Our circles, oldest first
    pub fn circles(&self) -> SyncResult<Vec<Circle>> {
        self.store.list_circles(&self.peer_id())
    }

    /// One of our circles
    pub fn circle(&self, id: &CircleId) -> SyncResult<Circle> {
        self.store
            .load_circle(&self.peer_id(), id)?
            .ok_or_else(|| SyncError::UnknownEntity {
                kind: "circle",
                id: id.to_string(),
            })
    }

    /// The "everyone" circle
    pub fn everyone(&self) -> SyncResult<Circle> {
        self.circles()?
            .into_iter()
            .find(|c| c.is_everyone)
            .ok_or_else(|| SyncError::UnknownEntity {
                kind: "circle",
                id: Circle::EVERYONE.to_string(),
            })
    }

    /// Create a circle with its first key
    pub fn create_circle(&self, name: &str) -> SyncResult<Circle> {
        let mut circle = Circle::new(self.peer_id(), name);
        self.keys.rotate(&mut circle)?;
        self.store.save_circle(&circle)?;
        info!(circle = %circle.id, %name, "Created circle");
        Ok(circle)
    }

    /// Rename a circle
    pub fn rename_circle(&self, id: &CircleId, name: &str) -> SyncResult<Circle> {
        let mut circle = self.circle(id)?;
        circle.name = name.to_string();
        self.store.save_circle(&circle)?;
        Ok(circle)
    }

    /// Add a member, rotating the key and sending it to the new member set
    pub fn add_member(&self, id: &CircleId, peer: PeerId) -> SyncResult<Circle> {
        let mut circle = self.circle(id)?;
        if circle.is_member(&peer) {
            return Ok(circle);
        }
        circle.members.insert(peer);
        self.rotate_and_distribute(&mut circle)?;
        info!(circle = %circle.id, member = %peer, "Added circle member");
        Ok(circle)
    }

    /// Remove a member, rotating the key and sending it to those who remain
    pub fn remove_member(&self, id: &CircleId, peer: &PeerId) -> SyncResult<Circle> {
        let mut circle = self.circle(id)?;
        if *peer == circle.owner {
            return Err(SyncError::InvalidOperation(
                "the owner cannot leave their own circle".to_string(),
            ));
        }
        if !circle.members.remove(peer) {
            return Ok(circle);
        }
        self.rotate_and_distribute(&mut circle)?;
        info!(circle = %circle.id, member = %peer, "Removed circle member");
        Ok(circle)
    }

    fn rotate_and_distribute(&self, circle: &mut Circle) -> SyncResult<()> {
        circle.membership_changed_at = now_millis();
        let key = self.keys.rotate(circle)?;
        self.store.save_circle(circle)?;

        for member in circle.remote_members() {
            let action = Action::new(
                *member,
                ActionKind::UpdateKey {
                    circle_id: circle.id,
                    key: key.clone(),
                },
            );
            self.store.save_outgoing_action(&action)?;
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Posts and reactions
    // ═══════════════════════════════════════════════════════════════════════

    /// Write a text post to one of our circles
    pub fn post(&self, circle: &CircleId, text: &str) -> SyncResult<Post> {
        self.post_with(circle, text, None, Vec::new())
    }

    /// Write a post with an optional reply parent and attachments
    pub fn post_with(
        &self,
        circle: &CircleId,
        text: &str,
        parent: Option<BlobHash>,
        attachments: Vec<(String, Vec<u8>)>,
    ) -> SyncResult<Post> {
        let circle = self.circle(circle)?;

        let mut files = Vec::with_capacity(attachments.len());
        for (name, bytes) in attachments {
            let pending = PendingAttachment::new(name, bytes);
            self.store.save_pending_attachment(&pending)?;
            files.push(pending.file_ref());
        }

        let mut post = Post::new(self.peer_id(), circle.id, text).with_files(files);
        if let Some(parent) = parent {
            post = post.with_parent(parent);
        }
        self.store.save_post(&post)?;
        Ok(post)
    }

    /// React to or tag a published post, visible to one of our circles
    pub fn react(
        &self,
        post_hash: BlobHash,
        kind: ReactionKind,
        value: &str,
        circle: &CircleId,
    ) -> SyncResult<Reaction> {
        let circle = self.circle(circle)?;
        if self.store.post_by_hash(&post_hash)?.is_none() {
            return Err(SyncError::UnknownEntity {
                kind: "post",
                id: post_hash.to_hex(),
            });
        }
        let reaction = Reaction::new(post_hash, self.peer_id(), kind, value, circle.id);
        self.store.save_reaction(&reaction)?;
        Ok(reaction)
    }

    /// Delete one of our published posts here and ask its circle's members
    /// to delete it too
    pub fn delete_post(&self, hash: &BlobHash) -> SyncResult<Post> {
        let local = self.peer_id();
        let post = self
            .store
            .post_by_hash(hash)?
            .ok_or_else(|| SyncError::UnknownEntity {
                kind: "post",
                id: hash.to_hex(),
            })?;
        if post.author != local {
            return Err(SyncError::InvalidOperation(
                "only the author can delete a post".to_string(),
            ));
        }

        let circle = self.circle(&post.circle_id)?;
        self.store.delete_post_by_hash(hash)?;
        for member in circle.remote_members() {
            self.store
                .save_outgoing_action(&Action::new(*member, ActionKind::Delete { hash: *hash }))?;
        }
        info!(%hash, "Deleted post");
        Ok(post)
    }

    /// Introduce `peer` to `to`
    pub fn introduce(&self, to: PeerId, peer: PeerId, name: &str) -> SyncResult<Action> {
        if to == peer {
            return Err(SyncError::InvalidOperation(
                "cannot introduce a peer to itself".to_string(),
            ));
        }
        let action = Action::new(
            to,
            ActionKind::Introduce {
                peer,
                name: name.to_string(),
            },
        );
        self.store.save_outgoing_action(&action)?;
        Ok(action)
    }

    /// Posts by followed peers and ourselves, newest first
    pub fn feed(&self, limit: usize) -> SyncResult<Vec<Post>> {
        let mut authors: Vec<PeerId> = self.store.list_peers()?.into_iter().map(|r| r.peer).collect();
        authors.push(self.peer_id());
        let mut posts = self.store.posts_by_authors(&authors)?;
        posts.truncate(limit);
        Ok(posts)
    }

    /// Reactions and tags on a post
    pub fn reactions_for(&self, post_hash: &BlobHash) -> SyncResult<Vec<Reaction>> {
        self.store.reactions_for_post(post_hash)
    }

    /// Attachment bytes by content hash, if stored or still queued
    pub fn attachment(&self, content_hash: &BlobHash) -> SyncResult<Option<Vec<u8>>> {
        if let Some(bytes) = self.store.load_attachment(content_hash)? {
            return Ok(Some(bytes));
        }
        Ok(self
            .store
            .load_pending_attachment(content_hash)?
            .map(|p| p.bytes))
    }

    /// Introductions received, newest first
    pub fn introductions(&self) -> SyncResult<Vec<Introduction>> {
        self.store.list_introductions()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Following
    // ═══════════════════════════════════════════════════════════════════════

    /// Subscribe to a peer's published content
    pub async fn follow(&self, peer: PeerId) -> SyncResult<PeerRecord> {
        if peer == self.peer_id() {
            return Err(SyncError::InvalidOperation(
                "cannot follow yourself".to_string(),
            ));
        }
        let record = match self.store.load_peer(&peer)? {
            Some(record) => record,
            None => {
                let record = PeerRecord::new(peer);
                self.store.save_peer(&record)?;
                info!(%peer, "Following peer");
                record
            }
        };
        if let Err(e) = self.content.watch(peer).await {
            warn!(%peer, error = %e, "Failed to watch peer announcements");
        }
        Ok(record)
    }

    /// Stop following a peer. Already stored content stays.
    pub fn unfollow(&self, peer: &PeerId) -> SyncResult<bool> {
        let existed = self.store.delete_peer(peer)?;
        self.content.cache().invalidate(peer);
        if existed {
            info!(%peer, "Unfollowed peer");
        }
        Ok(existed)
    }

    /// Followed peers
    pub fn following(&self) -> SyncResult<Vec<PeerRecord>> {
        self.store.list_peers()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Pipelines
    // ═══════════════════════════════════════════════════════════════════════

    /// Publish, waiting for a running cycle to finish first
    pub async fn publish(&self) -> SyncResult<PublishReport> {
        self.publisher.publish(&CancellationToken::new()).await
    }

    /// Publish unless a cycle is already running
    pub async fn try_publish(&self) -> SyncResult<PublishReport> {
        self.publisher.try_publish(&CancellationToken::new()).await
    }

    /// Sync every followed peer
    pub async fn sync(&self) -> SyncResult<SyncReport> {
        self.sync.sync_all(&CancellationToken::new()).await
    }

    /// Sync one followed peer
    pub async fn sync_peer(&self, peer: PeerId) -> SyncResult<PeerSyncOutcome> {
        self.sync.sync_peer(peer).await
    }

    /// Where a peer's cycle currently is
    pub fn sync_state(&self, peer: &PeerId) -> PeerSyncState {
        self.sync.state(peer)
    }

    /// Background loop over this node's pipelines (not started)
    pub fn service(&self) -> SyncService<C> {
        SyncService::new(
            self.publisher.clone(),
            self.sync.clone(),
            self.config.sync_interval(),
        )
    }
}
