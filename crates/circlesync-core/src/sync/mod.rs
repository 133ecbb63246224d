//! Download pipeline
//!
//! ## Per-peer cycle
//!
//! ```text
//! Idle → ResolvingRoot ─┬─ UpToDate
//!                       └─ Downloading → ProcessingActions → ProcessingManifests → Idle
//! ```
//!
//! - **ResolvingRoot**: resolve with `min_version = watermark + 1`; nothing
//!   newer means up to date, and nothing is touched
//! - **Downloading**: fetch the root collection, pick our entry (or the public
//!   one) and trial-decrypt the user manifest
//! - **ProcessingActions**: fetch, store and dispatch actions addressed to us;
//!   all of them run before any circle manifest so a rotated key is installed
//!   before it is needed
//! - **ProcessingManifests**: walk changed circle manifests and persist the
//!   posts, reactions and attachments not stored yet
//!
//! The watermark advances only when the whole cycle completed. Items
//! persisted by an incomplete cycle stay, and the content-hash index keeps a
//! retry from downloading them again.
//!
//! Peers are independent: `sync_all` runs up to `max_parallel_peers` cycles
//! at once and one peer's failure never affects another's.

pub mod actions;
pub mod events;

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::content::{ContentStore, StoreClient};
use crate::crypto::{
    candidate_set_id, trial_decrypt, Candidate, KeyContext, KeyManager, TrialOutcome,
};
use crate::error::{SyncError, SyncResult};
use crate::manifest::{
    check_attachment, parse_action, parse_circle_manifest, parse_identity, parse_post,
    parse_reaction, parse_user_manifest, PUBLIC_ENTRY,
};
use crate::storage::{EntityRef, LocalStore};
use crate::types::{now_millis, BlobHash, CircleId, FileRef, PeerId, PeerRecord, UserManifest};

pub use actions::{dispatch, ActionEffect};
pub use events::{PeerSyncState, SyncEvent, EVENT_CHANNEL_CAPACITY};

/// What one peer cycle brought in
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Actions fetched and stored
    pub actions: usize,
    /// Circle keys newly installed
    pub keys_installed: usize,
    /// Introductions recorded
    pub introductions: usize,
    /// Posts or reactions removed on request
    pub deletions: usize,
    /// Whether a new identity was stored
    pub identity_updated: bool,
    /// Circle manifests processed
    pub manifests: usize,
    /// Posts persisted
    pub posts: usize,
    /// Reactions persisted
    pub reactions: usize,
    /// Attachments persisted
    pub attachments: usize,
    /// Items that could not be decrypted or failed validation
    pub skipped: usize,
}

/// Result of one peer cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerSyncOutcome {
    /// No root newer than the watermark
    UpToDate {
        /// Current watermark
        version: u64,
    },
    /// Completed; the watermark is now `version`
    Synced {
        /// New watermark
        version: u64,
        /// What was stored
        stats: SyncStats,
    },
    /// Some fetches failed; progress kept, watermark unchanged
    Incomplete {
        /// Version that was being processed
        version: u64,
        /// What was stored
        stats: SyncStats,
    },
}

impl PeerSyncOutcome {
    /// Stats if the cycle got past resolution
    pub fn stats(&self) -> Option<&SyncStats> {
        match self {
            PeerSyncOutcome::UpToDate { .. } => None,
            PeerSyncOutcome::Synced { stats, .. } | PeerSyncOutcome::Incomplete { stats, .. } => {
                Some(stats)
            }
        }
    }
}

/// Result of syncing every followed peer
#[derive(Debug, Default)]
pub struct SyncReport {
    /// Peers whose cycle ran to an outcome
    pub outcomes: Vec<(PeerId, PeerSyncOutcome)>,
    /// Peers whose cycle failed, with the reason
    pub failures: Vec<(PeerId, String)>,
    /// Whether the run was cancelled before every peer was visited
    pub cancelled: bool,
}

impl SyncReport {
    /// Peers whose watermark advanced
    pub fn synced(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, PeerSyncOutcome::Synced { .. }))
            .count()
    }
}

/// How far one circle manifest got
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircleProgress {
    /// Every entry handled; remember the manifest hash
    Done,
    /// Unreadable with the keys we hold; try again when it changes or a key arrives
    Skipped,
    /// Some fetch failed; the cycle is incomplete
    Incomplete,
}

fn checkpoint(cancel: &CancellationToken) -> SyncResult<()> {
    if cancel.is_cancelled() {
        return Err(SyncError::Cancelled);
    }
    Ok(())
}

/// Downloads followed peers' content
pub struct SyncEngine<C> {
    store: Arc<dyn LocalStore>,
    content: StoreClient<C>,
    keys: KeyManager,
    config: EngineConfig,
    events: broadcast::Sender<SyncEvent>,
    states: Arc<Mutex<HashMap<PeerId, PeerSyncState>>>,
}

impl<C> Clone for SyncEngine<C> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            content: self.content.clone(),
            keys: self.keys.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
            states: self.states.clone(),
        }
    }
}

impl<C: ContentStore> SyncEngine<C> {
    /// Create a sync engine for the identity owning `keys`
    pub fn new(
        store: Arc<dyn LocalStore>,
        content: StoreClient<C>,
        keys: KeyManager,
        config: EngineConfig,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        Self {
            store,
            content,
            keys,
            config,
            events,
            states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn local(&self) -> PeerId {
        self.keys.keypair().peer_id()
    }

    /// Current state of a peer's cycle
    pub fn state(&self, peer: &PeerId) -> PeerSyncState {
        self.states.lock().get(peer).copied().unwrap_or_default()
    }

    fn set_state(&self, peer: PeerId, state: PeerSyncState) {
        debug!(%peer, %state, "Peer sync state");
        self.states.lock().insert(peer, state);
    }

    /// Sync every followed peer, up to `max_parallel_peers` at a time
    pub async fn sync_all(&self, cancel: &CancellationToken) -> SyncResult<SyncReport> {
        let peers: Vec<PeerId> = self.store.list_peers()?.into_iter().map(|r| r.peer).collect();
        info!(peers = peers.len(), "Starting sync run");

        let results: Vec<(PeerId, SyncResult<PeerSyncOutcome>)> = futures::stream::iter(peers)
            .map(|peer| async move {
                if cancel.is_cancelled() {
                    return (peer, Err(SyncError::Cancelled));
                }
                (peer, self.sync_peer_with(peer, cancel).await)
            })
            .buffer_unordered(self.config.max_parallel_peers.max(1))
            .collect()
            .await;

        let mut report = SyncReport::default();
        for (peer, result) in results {
            match result {
                Ok(outcome) => report.outcomes.push((peer, outcome)),
                Err(SyncError::Cancelled) => report.cancelled = true,
                Err(e) => report.failures.push((peer, e.to_string())),
            }
        }

        info!(
            synced = report.synced(),
            failed = report.failures.len(),
            cancelled = report.cancelled,
            "Sync run complete"
        );
        Ok(report)
    }

    /// Run one cycle for a followed peer
    pub async fn sync_peer(&self, peer: PeerId) -> SyncResult<PeerSyncOutcome> {
        self.sync_peer_with(peer, &CancellationToken::new()).await
    }

    async fn sync_peer_with(
        &self,
        peer: PeerId,
        cancel: &CancellationToken,
    ) -> SyncResult<PeerSyncOutcome> {
        let result = self.run_peer(peer, cancel).await;
        self.set_state(peer, PeerSyncState::Idle);

        match &result {
            Ok(PeerSyncOutcome::Incomplete { version, .. }) => {
                self.record_error(&peer, format!("version {} incomplete", version));
            }
            Ok(_) => {}
            Err(SyncError::Cancelled) => {
                debug!(%peer, "Peer cycle cancelled");
            }
            Err(e) => {
                warn!(%peer, error = %e, "Peer cycle failed");
                self.record_error(&peer, e.to_string());
            }
        }
        result
    }

    fn record_error(&self, peer: &PeerId, reason: String) {
        match self.store.load_peer(peer) {
            Ok(Some(mut record)) => {
                record.last_error = Some(reason.clone());
                if let Err(e) = self.store.save_peer(&record) {
                    warn!(%peer, error = %e, "Failed to record sync error");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(%peer, error = %e, "Failed to load peer record"),
        }
        let _ = self.events.send(SyncEvent::PeerFailed {
            peer: *peer,
            reason,
        });
    }

    async fn run_peer(
        &self,
        peer: PeerId,
        cancel: &CancellationToken,
    ) -> SyncResult<PeerSyncOutcome> {
        let local = self.local();
        let mut record = self
            .store
            .load_peer(&peer)?
            .ok_or_else(|| SyncError::UnknownEntity {
                kind: "peer",
                id: peer.to_string(),
            })?;
        let watermark = record.last_accepted_version;

        self.set_state(peer, PeerSyncState::ResolvingRoot);
        let pointer = match self.content.resolve(peer, watermark + 1).await? {
            Some(pointer) if pointer.version > watermark => pointer,
            _ => {
                self.set_state(peer, PeerSyncState::UpToDate);
                debug!(%peer, watermark, "Peer up to date");
                let _ = self.events.send(SyncEvent::PeerUpToDate {
                    peer,
                    version: watermark,
                });
                return Ok(PeerSyncOutcome::UpToDate { version: watermark });
            }
        };
        let version = pointer.version;

        self.set_state(peer, PeerSyncState::Downloading);
        let Some(manifest) = self.fetch_user_manifest(&peer, pointer.hash).await? else {
            // Nothing published for us at this version
            info!(%peer, version, "No manifest addressed to us");
            return self.finish(record, pointer, SyncStats::default());
        };

        if manifest.version <= watermark {
            debug!(%peer, received = manifest.version, watermark, "Ignoring stale manifest");
            return Ok(PeerSyncOutcome::UpToDate { version: watermark });
        }
        if manifest.version != version {
            return Err(SyncError::ValidationFailure(format!(
                "manifest version {} under root version {}",
                manifest.version, version
            )));
        }
        checkpoint(cancel)?;

        let mut stats = SyncStats::default();

        self.set_state(peer, PeerSyncState::ProcessingActions);
        self.process_actions(&peer, &local, &manifest, &mut stats)
            .await?;
        checkpoint(cancel)?;

        self.set_state(peer, PeerSyncState::ProcessingManifests);
        let mut complete = self
            .process_identity(&peer, &manifest, &mut record, &mut stats)
            .await?;

        record
            .manifest_hashes
            .retain(|id, _| manifest.circles.contains_key(id));
        for (circle_id, hash) in &manifest.circles {
            if record.manifest_hashes.get(circle_id) == Some(hash) {
                debug!(%peer, circle = %circle_id, "Circle manifest unchanged");
                continue;
            }
            match self
                .process_circle(&peer, circle_id, *hash, &mut stats)
                .await?
            {
                CircleProgress::Done => {
                    record.manifest_hashes.insert(*circle_id, *hash);
                }
                CircleProgress::Skipped => {}
                CircleProgress::Incomplete => complete = false,
            }
        }

        if complete {
            self.finish(record, pointer, stats)
        } else {
            // Keep per-circle progress, leave the watermark
            if self.store.load_peer(&peer)?.is_some() {
                self.store.save_peer(&record)?;
            }
            warn!(%peer, version, posts = stats.posts, "Peer cycle incomplete");
            Ok(PeerSyncOutcome::Incomplete { version, stats })
        }
    }

    fn finish(
        &self,
        mut record: PeerRecord,
        pointer: crate::content::RootPointer,
        stats: SyncStats,
    ) -> SyncResult<PeerSyncOutcome> {
        let peer = record.peer;
        let version = pointer.version;

        record.last_accepted_version = version;
        record.cached_root = Some(pointer);
        record.last_synced_at = Some(now_millis());
        record.last_error = None;

        // Unfollowed while the cycle ran
        if self.store.load_peer(&peer)?.is_none() {
            return Ok(PeerSyncOutcome::Synced { version, stats });
        }
        self.store.save_peer(&record)?;

        info!(
            %peer,
            version,
            posts = stats.posts,
            reactions = stats.reactions,
            actions = stats.actions,
            "Peer synced"
        );
        let _ = self.events.send(SyncEvent::PeerSynced {
            peer,
            version,
            new_posts: stats.posts,
            new_reactions: stats.reactions,
        });
        Ok(PeerSyncOutcome::Synced { version, stats })
    }

    /// Fetch and open the user manifest addressed to us, or the public one
    async fn fetch_user_manifest(
        &self,
        peer: &PeerId,
        root: BlobHash,
    ) -> SyncResult<Option<UserManifest>> {
        let collection = self.content.fetch_collection(root).await?;

        let (hash, candidates) = if let Some(hash) = collection.get(&self.local().to_hex()) {
            (*hash, self.keys.peer_candidates(peer, KeyContext::Manifest, false)?)
        } else if let Some(hash) = collection.get(PUBLIC_ENTRY) {
            (*hash, vec![Candidate::Plaintext])
        } else {
            return Ok(None);
        };

        let bytes = self.content.fetch(hash).await?;
        let manifest = trial_decrypt(&candidates, &bytes, "user manifest", |plain| {
            parse_user_manifest(plain, peer).ok()
        })
        .into_result("user manifest")?;

        debug!(
            %peer,
            version = manifest.version,
            circles = manifest.circles.len(),
            actions = manifest.actions_for(&self.local()).len(),
            "Opened user manifest"
        );
        Ok(Some(manifest))
    }

    /// Whether `hash` already failed to open with exactly this candidate set
    fn unreadable(&self, hash: &BlobHash, key_set: &BlobHash) -> SyncResult<bool> {
        let known = self.store.unreadable_under(hash)?.as_ref() == Some(key_set);
        if known {
            debug!(%hash, "Unreadable with the current keys, not fetching");
        }
        Ok(known)
    }

    /// Fetch and store actions addressed to us, then dispatch every
    /// unprocessed action from this peer. A failed fetch aborts the cycle.
    async fn process_actions(
        &self,
        peer: &PeerId,
        local: &PeerId,
        manifest: &UserManifest,
        stats: &mut SyncStats,
    ) -> SyncResult<()> {
        let hashes = manifest.actions_for(local);
        if !hashes.is_empty() {
            let candidates = self.keys.peer_candidates(peer, KeyContext::Action, false)?;
            let key_set = candidate_set_id(&candidates);
            for hash in hashes {
                if self.store.has_blob(hash)? || self.unreadable(hash, &key_set)? {
                    continue;
                }
                let bytes = self.content.fetch(*hash).await?;
                match trial_decrypt(&candidates, &bytes, "action", |plain| {
                    parse_action(plain, peer, local).ok()
                }) {
                    TrialOutcome::Decrypted { value, .. } => {
                        self.store.save_incoming_action(hash, &value)?;
                        stats.actions += 1;
                        debug!(%peer, %hash, action = value.kind.type_name(), "Stored action");
                    }
                    TrialOutcome::Undecryptable { attempts } => {
                        warn!(%peer, %hash, attempts, "Skipping unreadable action");
                        self.store.record_unreadable(hash, &key_set)?;
                        stats.skipped += 1;
                    }
                }
            }
        }

        for action in self.store.unprocessed_actions()? {
            if action.from != Some(*peer) {
                continue;
            }
            let Some(hash) = action.stored_hash else {
                continue;
            };
            match dispatch(self.store.as_ref(), &self.keys, local, &action)? {
                ActionEffect::KeyInstalled {
                    owner,
                    circle,
                    generation,
                    new,
                } => {
                    if new {
                        stats.keys_installed += 1;
                        let _ = self.events.send(SyncEvent::KeyInstalled {
                            owner,
                            circle,
                            generation,
                        });
                    }
                }
                ActionEffect::Introduced { .. } => stats.introductions += 1,
                ActionEffect::Deleted => stats.deletions += 1,
                ActionEffect::Ignored => {}
            }
            self.store.mark_action_processed(&hash)?;
        }
        Ok(())
    }

    /// Update the peer's identity if its hash changed.
    ///
    /// Returns false if a fetch failed.
    async fn process_identity(
        &self,
        peer: &PeerId,
        manifest: &UserManifest,
        record: &mut PeerRecord,
        stats: &mut SyncStats,
    ) -> SyncResult<bool> {
        let Some(hash) = manifest.identity_hash else {
            return Ok(true);
        };
        if record.identity_hash == Some(hash) {
            return Ok(true);
        }

        let mut candidates = vec![Candidate::Plaintext];
        for circle in manifest.circles.keys() {
            candidates.extend(self.keys.circle_candidates(*peer, *circle)?);
        }

        let bytes = match self.content.fetch(hash).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_retryable() => {
                warn!(%peer, %hash, error = %e, "Identity unavailable");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        let mut identity = match trial_decrypt(&candidates, &bytes, "identity", |plain| {
            parse_identity(plain, peer).ok()
        }) {
            TrialOutcome::Decrypted { value, .. } => value,
            TrialOutcome::Undecryptable { .. } => {
                stats.skipped += 1;
                return Ok(true);
            }
        };

        let mut complete = true;
        if let Some(avatar) = identity.avatar.clone() {
            match self.fetch_attachment(&avatar, &candidates, stats).await {
                Ok(_) => {}
                Err(e) if e.is_retryable() => {
                    warn!(%peer, error = %e, "Avatar unavailable");
                    complete = false;
                }
                Err(e) => return Err(e),
            }
        }

        identity.stored_hash = Some(hash);
        self.store.save_identity(&identity)?;
        self.store.record_blob(&hash, &EntityRef::Identity(*peer))?;
        record.name = Some(identity.name.clone());
        record.identity_hash = Some(hash);
        stats.identity_updated = true;
        info!(%peer, name = %identity.name, "Updated identity");
        Ok(complete)
    }

    /// Fetch an attachment unless already stored. Undecryptable or
    /// mismatching bytes are skipped.
    async fn fetch_attachment(
        &self,
        file: &FileRef,
        candidates: &[Candidate],
        stats: &mut SyncStats,
    ) -> SyncResult<()> {
        let Some(blob_hash) = file.blob_hash else {
            return Ok(());
        };
        if self.store.load_attachment(&file.content_hash)?.is_some() {
            return Ok(());
        }

        let bytes = self.content.fetch(blob_hash).await?;
        match trial_decrypt(candidates, &bytes, "attachment", |plain| {
            check_attachment(plain, &file.content_hash).ok()
        }) {
            TrialOutcome::Decrypted { value, .. } => {
                self.store.save_attachment(&file.content_hash, &value)?;
                self.store
                    .record_blob(&blob_hash, &EntityRef::Attachment(file.content_hash))?;
                stats.attachments += 1;
                debug!(name = %file.name, hash = %blob_hash, "Stored attachment");
            }
            TrialOutcome::Undecryptable { .. } => stats.skipped += 1,
        }
        Ok(())
    }

    /// Process one changed circle manifest
    async fn process_circle(
        &self,
        peer: &PeerId,
        circle_id: &CircleId,
        hash: BlobHash,
        stats: &mut SyncStats,
    ) -> SyncResult<CircleProgress> {
        let candidates = self.keys.circle_candidates(*peer, *circle_id)?;
        if candidates.is_empty() {
            warn!(%peer, circle = %circle_id, "No key for circle, skipping");
            stats.skipped += 1;
            return Ok(CircleProgress::Skipped);
        }

        let bytes = match self.content.fetch(hash).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_retryable() => {
                warn!(%peer, circle = %circle_id, error = %e, "Circle manifest unavailable");
                return Ok(CircleProgress::Incomplete);
            }
            Err(e) => return Err(e),
        };
        let manifest = match trial_decrypt(&candidates, &bytes, "circle manifest", |plain| {
            parse_circle_manifest(plain, peer, circle_id).ok()
        }) {
            TrialOutcome::Decrypted { value, .. } => value,
            TrialOutcome::Undecryptable { attempts } => {
                warn!(%peer, circle = %circle_id, attempts, "Circle manifest unreadable");
                stats.skipped += 1;
                return Ok(CircleProgress::Skipped);
            }
        };
        stats.manifests += 1;

        let key_set = candidate_set_id(&candidates);
        let mut complete = true;
        for entry in &manifest.posts {
            if entry.author != *peer
                || self.store.has_blob(&entry.hash)?
                || self.unreadable(&entry.hash, &key_set)?
            {
                continue;
            }
            let bytes = match self.content.fetch(entry.hash).await {
                Ok(bytes) => bytes,
                Err(e) if e.is_retryable() => {
                    debug!(%peer, hash = %entry.hash, error = %e, "Post unavailable");
                    complete = false;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let mut post = match trial_decrypt(&candidates, &bytes, "post", |plain| {
                parse_post(plain, peer, circle_id).ok()
            }) {
                TrialOutcome::Decrypted { value, .. } => value,
                TrialOutcome::Undecryptable { .. } => {
                    self.store.record_unreadable(&entry.hash, &key_set)?;
                    stats.skipped += 1;
                    continue;
                }
            };

            let mut files_ready = true;
            for file in &post.files {
                match self.fetch_attachment(file, &candidates, stats).await {
                    Ok(()) => {}
                    Err(e) if e.is_retryable() => {
                        debug!(%peer, name = %file.name, error = %e, "Attachment unavailable");
                        files_ready = false;
                    }
                    Err(e) => return Err(e),
                }
            }
            if !files_ready {
                complete = false;
                continue;
            }

            post.stored_hash = Some(entry.hash);
            self.store.save_post(&post)?;
            stats.posts += 1;
            debug!(%peer, post = %post.id, hash = %entry.hash, "Stored post");
        }

        for entry in &manifest.reactions {
            if entry.author != *peer
                || self.store.has_blob(&entry.hash)?
                || self.unreadable(&entry.hash, &key_set)?
            {
                continue;
            }
            let bytes = match self.content.fetch(entry.hash).await {
                Ok(bytes) => bytes,
                Err(e) if e.is_retryable() => {
                    debug!(%peer, hash = %entry.hash, error = %e, "Reaction unavailable");
                    complete = false;
                    continue;
                }
                Err(e) => return Err(e),
            };
            match trial_decrypt(&candidates, &bytes, "reaction", |plain| {
                parse_reaction(plain, peer, circle_id).ok()
            }) {
                TrialOutcome::Decrypted { mut value, .. } => {
                    value.stored_hash = Some(entry.hash);
                    self.store.save_reaction(&value)?;
                    stats.reactions += 1;
                }
                TrialOutcome::Undecryptable { .. } => {
                    self.store.record_unreadable(&entry.hash, &key_set)?;
                    stats.skipped += 1;
                }
            }
        }

        debug!(
            %peer,
            circle = %circle_id,
            posts = manifest.posts.len(),
            reactions = manifest.reactions.len(),
            complete,
            "Processed circle manifest"
        );
        Ok(if complete {
            CircleProgress::Done
        } else {
            CircleProgress::Incomplete
        })
    }
}
