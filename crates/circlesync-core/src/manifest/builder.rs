//! Manifest construction
//!
//! Circle manifests are pure functions of the circle and the stored posts and
//! reactions visible to it, so rebuilding from the same rows gives a
//! structurally equal manifest. `updated_at` is derived from the data, never
//! from the wall clock.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use super::retention::filter_by_retention;
use crate::error::SyncResult;
use crate::storage::LocalStore;
use crate::types::{
    Action, ActionKind, BlobHash, Circle, CircleId, CircleManifest, ManifestEntry, PeerId, Post,
    Reaction, Timestamp, UserManifest,
};

fn newest_first(entries: &mut [ManifestEntry]) {
    entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(a.hash.cmp(&b.hash)));
}

/// Build a circle manifest from already-uploaded posts and reactions.
///
/// Entries without a stored hash are ignored. Retention is applied relative
/// to `now`.
pub fn build_circle_manifest(
    circle: &Circle,
    posts: &[Post],
    reactions: &[Reaction],
    now: Timestamp,
    window_ms: i64,
) -> CircleManifest {
    let post_entries = posts.iter().filter_map(|p| {
        p.stored_hash.map(|hash| ManifestEntry {
            hash,
            timestamp: p.timestamp,
            author: p.author,
        })
    });
    let reaction_entries = reactions.iter().filter_map(|r| {
        r.stored_hash.map(|hash| ManifestEntry {
            hash,
            timestamp: r.timestamp,
            author: r.author,
        })
    });

    let mut posts = filter_by_retention(post_entries, now, window_ms);
    let mut reactions = filter_by_retention(reaction_entries, now, window_ms);
    newest_first(&mut posts);
    newest_first(&mut reactions);

    let updated_at = posts
        .iter()
        .chain(reactions.iter())
        .map(|e| e.timestamp)
        .chain(std::iter::once(circle.membership_changed_at))
        .max()
        .unwrap_or(circle.membership_changed_at);

    CircleManifest {
        circle_id: circle.id,
        owner: circle.owner,
        name: circle.name.clone(),
        posts,
        reactions,
        members: circle.members.iter().copied().collect(),
        key_generation: circle.key_generation,
        updated_at,
    }
}

/// Build the user manifest one audience peer sees.
///
/// Only circles the audience belongs to and only uploaded actions directed
/// at it are listed.
pub fn build_user_manifest(
    owner: PeerId,
    audience: &PeerId,
    version: u64,
    identity_hash: Option<BlobHash>,
    circles: &[(&Circle, BlobHash)],
    actions: &[Action],
    now: Timestamp,
) -> UserManifest {
    let circles: BTreeMap<CircleId, BlobHash> = circles
        .iter()
        .filter(|(circle, _)| circle.is_member(audience))
        .map(|(circle, hash)| (circle.id, *hash))
        .collect();

    let pending: Vec<BlobHash> = actions
        .iter()
        .filter(|a| a.to == *audience)
        .filter_map(|a| a.stored_hash)
        .collect();
    let mut pending_actions = BTreeMap::new();
    if !pending.is_empty() {
        pending_actions.insert(*audience, pending);
    }

    UserManifest {
        owner,
        version,
        identity_hash,
        circles,
        pending_actions,
        updated_at: now,
    }
}

/// Manifest for readers outside every circle: identity only
pub fn build_public_manifest(
    owner: PeerId,
    version: u64,
    identity_hash: Option<BlobHash>,
    now: Timestamp,
) -> UserManifest {
    UserManifest {
        owner,
        version,
        identity_hash,
        circles: BTreeMap::new(),
        pending_actions: BTreeMap::new(),
        updated_at: now,
    }
}

/// Builds manifests for the local identity from the local store
#[derive(Clone)]
pub struct ManifestBuilder {
    store: Arc<dyn LocalStore>,
    local: PeerId,
    window_ms: i64,
}

impl ManifestBuilder {
    /// Builder over `store` for the local peer
    pub fn new(store: Arc<dyn LocalStore>, local: PeerId, window_ms: i64) -> Self {
        Self {
            store,
            local,
            window_ms,
        }
    }

    /// Circle manifest from the stored, uploaded posts and reactions
    pub fn circle_manifest(&self, circle: &Circle, now: Timestamp) -> SyncResult<CircleManifest> {
        let posts = self.store.posts_in_circle(&self.local, &circle.id)?;
        let reactions = self.store.reactions_in_circle(&self.local, &circle.id)?;
        let manifest = build_circle_manifest(circle, &posts, &reactions, now, self.window_ms);
        debug!(
            circle = %circle.id,
            posts = manifest.posts.len(),
            reactions = manifest.reactions.len(),
            "Built circle manifest"
        );
        Ok(manifest)
    }

    /// Uploaded outgoing actions to list in user manifests.
    ///
    /// Key updates are listed regardless of age: a member that stays away
    /// longer than the window still needs them to read the circle. Other
    /// actions follow the retention window.
    pub fn pending_actions(&self, now: Timestamp) -> SyncResult<Vec<Action>> {
        let (keys, others): (Vec<Action>, Vec<Action>) = self
            .store
            .outgoing_actions()?
            .into_iter()
            .filter(|a| a.stored_hash.is_some())
            .partition(|a| matches!(a.kind, ActionKind::UpdateKey { .. }));

        let mut actions = keys;
        actions.extend(filter_by_retention(others, now, self.window_ms));
        Ok(actions)
    }
}
