//! Upload pipeline
//!
//! One cycle:
//!
//! 1. identity (avatar first)
//! 2. posts and their attachments, under the circle's current key
//! 3. reactions, under the circle's current key
//! 4. actions, under the key derived with their recipient
//! 5. circle manifests, reusing the previous blob when nothing changed
//! 6. one user manifest per audience peer, plus a public one
//! 7. root collection and root pointer at `last_version + 1`
//!
//! Every stored entity gets its hash recorded before the next entity is
//! processed, so a cycle that fails part way is resumed, not repeated. Any
//! failure before step 7 returns without touching the root, so a published
//! root never references content that failed to store.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, IdentityVisibility};
use crate::content::{ContentStore, RootPointer, StoreClient};
use crate::crypto::{KeyContext, KeyManager, SymmetricKey};
use crate::error::{SyncError, SyncResult};
use crate::identity::SignedRecord;
use crate::manifest::{build_public_manifest, build_user_manifest, ManifestBuilder, PUBLIC_ENTRY};
use crate::storage::{EntityRef, LocalStore, PublishState};
use crate::sync::SyncEvent;
use crate::types::{Action, BlobHash, Circle, Clock, FileRef, PeerId, Timestamp};

/// Entities stored during one publish cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadCounts {
    /// Whether a new identity blob was stored
    pub identity: bool,
    /// Posts
    pub posts: usize,
    /// Reactions and tags
    pub reactions: usize,
    /// Actions
    pub actions: usize,
    /// Attachment blobs
    pub attachments: usize,
    /// Circle manifests stored
    pub manifests_rebuilt: usize,
    /// Circle manifests reused from the previous cycle
    pub manifests_reused: usize,
}

/// What one publish cycle did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReport {
    /// Published root version
    pub version: u64,
    /// Root collection hash
    pub root: BlobHash,
    /// Peers that got their own user manifest
    pub audience: usize,
    /// Stored entities
    pub uploads: UploadCounts,
}

/// Single-flight publisher for the local identity
pub struct PublishEngine<C> {
    store: Arc<dyn LocalStore>,
    content: StoreClient<C>,
    keys: KeyManager,
    builder: ManifestBuilder,
    config: EngineConfig,
    clock: Clock,
    lock: Arc<Mutex<()>>,
    events: broadcast::Sender<SyncEvent>,
}

impl<C> Clone for PublishEngine<C> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            content: self.content.clone(),
            keys: self.keys.clone(),
            builder: self.builder.clone(),
            config: self.config.clone(),
            clock: self.clock.clone(),
            lock: self.lock.clone(),
            events: self.events.clone(),
        }
    }
}

fn checkpoint(cancel: &CancellationToken) -> SyncResult<()> {
    if cancel.is_cancelled() {
        return Err(SyncError::Cancelled);
    }
    Ok(())
}

impl<C: ContentStore> PublishEngine<C> {
    /// Create a publisher for the identity owning `keys`
    pub fn new(
        store: Arc<dyn LocalStore>,
        content: StoreClient<C>,
        keys: KeyManager,
        config: EngineConfig,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        let local = keys.keypair().peer_id();
        let builder = ManifestBuilder::new(store.clone(), local, config.retention_window_ms());
        Self {
            store,
            content,
            keys,
            builder,
            config,
            clock: Clock::system(),
            lock: Arc::new(Mutex::new(())),
            events,
        }
    }

    /// Measure retention and manifest times against `clock`
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn local(&self) -> PeerId {
        self.keys.keypair().peer_id()
    }

    /// Run a cycle, waiting for any running one to finish first
    pub async fn publish(&self, cancel: &CancellationToken) -> SyncResult<PublishReport> {
        let _guard = self.lock.lock().await;
        self.run(cancel).await
    }

    /// Run a cycle unless one is already running
    pub async fn try_publish(&self, cancel: &CancellationToken) -> SyncResult<PublishReport> {
        let _guard = self
            .lock
            .try_lock()
            .map_err(|_| SyncError::PublishInProgress)?;
        self.run(cancel).await
    }

    /// Whether anything would change if a cycle ran now
    pub fn has_changes(&self) -> SyncResult<bool> {
        let local = self.local();
        let state = self.store.load_publish_state()?;
        if state.last_root.is_none() {
            return Ok(true);
        }
        if self
            .store
            .load_identity(&local)?
            .is_some_and(|i| i.stored_hash.is_none())
        {
            return Ok(true);
        }
        if !self.store.unpublished_posts(&local)?.is_empty()
            || !self.store.unpublished_reactions(&local)?.is_empty()
            || !self.store.unpublished_actions()?.is_empty()
        {
            return Ok(true);
        }

        let now = self.clock.now();
        for circle in self.store.list_circles(&local)? {
            let manifest = self.builder.circle_manifest(&circle, now)?;
            match self.store.load_built_manifest(&circle.id)? {
                Some((previous, _)) if previous.same_content(&manifest) => {}
                _ => return Ok(true),
            }
        }

        // Actions listed at the last publish that have since aged out
        let listed_then = self
            .builder
            .pending_actions(state.last_published_at.unwrap_or(now))?;
        let listed_now = self.builder.pending_actions(now)?;
        let hashes = |actions: &[Action]| -> Vec<Option<BlobHash>> {
            actions.iter().map(|a| a.stored_hash).collect()
        };
        Ok(hashes(&listed_then) != hashes(&listed_now))
    }

    async fn run(&self, cancel: &CancellationToken) -> SyncResult<PublishReport> {
        let local = self.local();
        let now = self.clock.now();
        let mut counts = UploadCounts::default();
        info!(peer = %local, "Starting publish cycle");

        let circles = self.store.list_circles(&local)?;

        let identity_hash = self.upload_identity(&circles, &mut counts).await?;
        checkpoint(cancel)?;

        self.upload_posts(&mut counts).await?;
        checkpoint(cancel)?;

        self.upload_reactions(&mut counts).await?;
        checkpoint(cancel)?;

        self.upload_actions(&mut counts).await?;
        checkpoint(cancel)?;

        let mut circle_hashes = Vec::with_capacity(circles.len());
        for circle in &circles {
            let hash = self.store_circle_manifest(circle, now, &mut counts).await?;
            circle_hashes.push((circle, hash));
        }
        checkpoint(cancel)?;

        let previous = self.store.load_publish_state()?;
        let version = previous.last_version + 1;
        let actions = self.builder.pending_actions(now)?;

        let mut audience: BTreeSet<PeerId> = circles
            .iter()
            .flat_map(|c| c.remote_members().copied())
            .collect();
        audience.extend(actions.iter().map(|a| a.to));
        audience.remove(&local);

        let mut entries = BTreeMap::new();
        for peer in &audience {
            let manifest = build_user_manifest(
                local,
                peer,
                version,
                identity_hash,
                &circle_hashes,
                &actions,
                now,
            );
            let key = self.keys.peer_key(peer, KeyContext::Manifest)?;
            let hash = self.seal_and_store(manifest, Some(&key)).await?;
            debug!(audience = %peer, %hash, version, "Stored user manifest");
            entries.insert(peer.to_hex(), hash);
        }
        if self.config.identity_visibility == IdentityVisibility::Public {
            let manifest = build_public_manifest(local, version, identity_hash, now);
            let hash = self.seal_and_store(manifest, None).await?;
            entries.insert(PUBLIC_ENTRY.to_string(), hash);
        }

        let mut provided: Vec<BlobHash> = entries.values().copied().collect();
        provided.extend(circle_hashes.iter().map(|(_, h)| *h));
        provided.extend(identity_hash);

        let root = self.content.create_collection(entries).await?;
        checkpoint(cancel)?;

        let pointer = RootPointer::sign(self.keys.keypair(), root, version)?;
        if let Err(e) = self.content.publish_root(pointer).await {
            // A version may have reached some resolvers; never reuse it
            self.store.save_publish_state(&PublishState {
                last_version: version,
                ..previous
            })?;
            warn!(version, error = %e, "Root publish failed");
            return Err(e);
        }

        self.store.save_publish_state(&PublishState {
            last_version: version,
            last_root: Some(root),
            last_published_at: Some(now),
        })?;

        provided.push(root);
        if let Err(e) = self.content.provide(provided).await {
            warn!(version, error = %e, "Failed to announce published content");
        }

        info!(
            version,
            %root,
            posts = counts.posts,
            reactions = counts.reactions,
            actions = counts.actions,
            audience = audience.len(),
            "Publish cycle complete"
        );
        let _ = self.events.send(SyncEvent::Published { version, root });
        Ok(PublishReport {
            version,
            root,
            audience: audience.len(),
            uploads: counts,
        })
    }

    /// Sign, optionally encrypt, and store a record
    async fn seal_and_store<T>(&self, body: T, key: Option<&SymmetricKey>) -> SyncResult<BlobHash>
    where
        T: serde::Serialize + serde::de::DeserializeOwned,
    {
        let record = SignedRecord::sign(body, self.keys.keypair())?;
        let bytes = record.to_bytes()?;
        let sealed = match key {
            Some(key) => key.encrypt(&bytes)?,
            None => bytes,
        };
        self.content.store(sealed).await
    }

    fn circle(&self, id: &crate::types::CircleId) -> SyncResult<Circle> {
        self.store
            .load_circle(&self.local(), id)?
            .ok_or_else(|| SyncError::UnknownEntity {
                kind: "circle",
                id: id.to_string(),
            })
    }

    /// Store one attachment if it has no blob yet. Returns true if stored.
    async fn upload_attachment(
        &self,
        file: &mut FileRef,
        key: Option<&SymmetricKey>,
    ) -> SyncResult<bool> {
        if file.is_uploaded() {
            return Ok(false);
        }
        let bytes = match self.store.load_pending_attachment(&file.content_hash)? {
            Some(pending) => pending.bytes,
            None => self
                .store
                .load_attachment(&file.content_hash)?
                .ok_or_else(|| SyncError::UnknownEntity {
                    kind: "attachment",
                    id: file.content_hash.to_hex(),
                })?,
        };

        let sealed = match key {
            Some(key) => key.encrypt(&bytes)?,
            None => bytes.clone(),
        };
        let hash = self.content.store(sealed).await?;
        self.store.save_attachment(&file.content_hash, &bytes)?;
        self.store
            .record_blob(&hash, &EntityRef::Attachment(file.content_hash))?;
        file.blob_hash = Some(hash);
        debug!(name = %file.name, %hash, "Stored attachment");
        Ok(true)
    }

    async fn upload_identity(
        &self,
        circles: &[Circle],
        counts: &mut UploadCounts,
    ) -> SyncResult<Option<BlobHash>> {
        let local = self.local();
        let Some(mut identity) = self.store.load_identity(&local)? else {
            return Ok(None);
        };
        if let Some(hash) = identity.stored_hash {
            return Ok(Some(hash));
        }

        let key = match self.config.identity_visibility {
            IdentityVisibility::Public => None,
            IdentityVisibility::Circle => {
                let everyone = circles.iter().find(|c| c.is_everyone).ok_or_else(|| {
                    SyncError::UnknownEntity {
                        kind: "circle",
                        id: Circle::EVERYONE.to_string(),
                    }
                })?;
                Some(self.keys.current_key(everyone)?)
            }
        };

        let mut avatar = identity.avatar.clone();
        if let Some(file) = avatar.as_mut() {
            if self.upload_attachment(file, key.as_ref()).await? {
                counts.attachments += 1;
            }
        }
        identity.avatar = avatar;

        let record = SignedRecord::sign(identity.to_wire(), self.keys.keypair())?;
        let bytes = record.to_bytes()?;
        let sealed = match &key {
            Some(key) => key.encrypt(&bytes)?,
            None => bytes,
        };
        let hash = self.content.store(sealed).await?;

        identity.signature = Some(record.signature);
        identity.stored_hash = Some(hash);
        self.store.save_identity(&identity)?;
        self.store.record_blob(&hash, &EntityRef::Identity(local))?;
        if let Some(file) = &identity.avatar {
            self.store.delete_pending_attachment(&file.content_hash)?;
        }

        counts.identity = true;
        info!(%hash, "Stored identity");
        Ok(Some(hash))
    }

    async fn upload_posts(&self, counts: &mut UploadCounts) -> SyncResult<()> {
        for mut post in self.store.unpublished_posts(&self.local())? {
            let circle = self.circle(&post.circle_id)?;
            let key = self.keys.current_key(&circle)?;

            for file in post.files.iter_mut() {
                if self.upload_attachment(file, Some(&key)).await? {
                    counts.attachments += 1;
                }
            }
            // Keep uploaded attachment hashes even if the post store fails
            self.store.save_post(&post)?;

            let record = SignedRecord::sign(post.to_wire(), self.keys.keypair())?;
            let sealed = key.encrypt(&record.to_bytes()?)?;
            let hash = self.content.store(sealed).await?;

            post.signature = Some(record.signature);
            post.stored_hash = Some(hash);
            self.store.save_post(&post)?;
            for file in &post.files {
                self.store.delete_pending_attachment(&file.content_hash)?;
            }

            counts.posts += 1;
            debug!(post = %post.id, circle = %circle.id, %hash, generation = key.generation, "Stored post");
        }
        Ok(())
    }

    async fn upload_reactions(&self, counts: &mut UploadCounts) -> SyncResult<()> {
        for mut reaction in self.store.unpublished_reactions(&self.local())? {
            let circle = self.circle(&reaction.circle_id)?;
            let key = self.keys.current_key(&circle)?;

            let record = SignedRecord::sign(reaction.to_wire(), self.keys.keypair())?;
            let sealed = key.encrypt(&record.to_bytes()?)?;
            let hash = self.content.store(sealed).await?;

            reaction.signature = Some(record.signature);
            reaction.stored_hash = Some(hash);
            self.store.save_reaction(&reaction)?;

            counts.reactions += 1;
            debug!(post = %reaction.post_hash, kind = %reaction.kind, %hash, "Stored reaction");
        }
        Ok(())
    }

    async fn upload_actions(&self, counts: &mut UploadCounts) -> SyncResult<()> {
        for mut action in self.store.unpublished_actions()? {
            let key = self.keys.peer_key(&action.to, KeyContext::Action)?;
            let hash = self.seal_and_store(action.to_wire(), Some(&key)).await?;

            action.stored_hash = Some(hash);
            self.store.save_outgoing_action(&action)?;

            counts.actions += 1;
            debug!(action = action.kind.type_name(), to = %action.to, %hash, "Stored action");
        }
        Ok(())
    }

    async fn store_circle_manifest(
        &self,
        circle: &Circle,
        now: Timestamp,
        counts: &mut UploadCounts,
    ) -> SyncResult<BlobHash> {
        let manifest = self.builder.circle_manifest(circle, now)?;

        if let Some((previous, hash)) = self.store.load_built_manifest(&circle.id)? {
            if previous.same_content(&manifest) && self.content.has(hash).await? {
                debug!(circle = %circle.id, %hash, "Circle manifest unchanged");
                counts.manifests_reused += 1;
                return Ok(hash);
            }
        }

        let key = self.keys.current_key(circle)?;
        let hash = self.seal_and_store(manifest.clone(), Some(&key)).await?;
        self.store.save_built_manifest(&manifest, &hash)?;

        counts.manifests_rebuilt += 1;
        info!(
            circle = %circle.id,
            %hash,
            posts = manifest.posts.len(),
            reactions = manifest.reactions.len(),
            generation = key.generation,
            "Stored circle manifest"
        );
        Ok(hash)
    }
}
