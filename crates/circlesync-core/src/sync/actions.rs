//! Dispatch of received actions
//!
//! - `UpdateKey`: install the key under the sender's circle scope
//! - `Introduce`: record the introduction; following stays a user decision
//! - `Delete`: remove the sender's own post or reaction stored under the hash

use tracing::{debug, info, warn};

use crate::crypto::{KeyManager, KeyScope};
use crate::error::{SyncError, SyncResult};
use crate::storage::LocalStore;
use crate::types::{now_millis, Action, ActionKind, CircleId, Introduction, PeerId};

/// Effect of dispatching one action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionEffect {
    /// A circle key was installed (or was already known)
    KeyInstalled {
        /// Circle owner (the sender)
        owner: PeerId,
        /// Circle
        circle: CircleId,
        /// Key generation
        generation: u32,
        /// False if the generation was already present
        new: bool,
    },
    /// An introduction was recorded
    Introduced {
        /// Introduced peer
        peer: PeerId,
    },
    /// A post or reaction by the sender was removed
    Deleted,
    /// Nothing applied
    Ignored,
}

/// Apply a received action.
///
/// The caller marks it processed afterwards; dispatching the same action
/// twice has no further effect.
pub fn dispatch(
    store: &dyn LocalStore,
    keys: &KeyManager,
    local: &PeerId,
    action: &Action,
) -> SyncResult<ActionEffect> {
    let sender = action.from.ok_or_else(|| {
        SyncError::InvalidOperation(format!("action {} has no sender", action.id))
    })?;
    if action.to != *local {
        warn!(%sender, to = %action.to, "Ignoring action addressed to another peer");
        return Ok(ActionEffect::Ignored);
    }

    match &action.kind {
        ActionKind::UpdateKey { circle_id, key } => {
            let generation = key.generation;
            let new = keys.install(KeyScope::circle(sender, *circle_id), key.clone())?;
            Ok(ActionEffect::KeyInstalled {
                owner: sender,
                circle: *circle_id,
                generation,
                new,
            })
        }
        ActionKind::Introduce { peer, name } => {
            if peer == local || *peer == sender {
                debug!(%sender, %peer, "Ignoring self introduction");
                return Ok(ActionEffect::Ignored);
            }
            store.save_introduction(&Introduction {
                from: sender,
                peer: *peer,
                name: name.clone(),
                received_at: now_millis(),
            })?;
            info!(%sender, %peer, %name, "Recorded introduction");
            Ok(ActionEffect::Introduced { peer: *peer })
        }
        ActionKind::Delete { hash } => {
            if let Some(post) = store.post_by_hash(hash)? {
                if post.author != sender {
                    warn!(%sender, author = %post.author, %hash, "Refusing to delete another author's post");
                    return Ok(ActionEffect::Ignored);
                }
                store.delete_post_by_hash(hash)?;
                info!(%sender, %hash, "Deleted post on request");
                return Ok(ActionEffect::Deleted);
            }
            if let Some(reaction) = store.reaction_by_hash(hash)? {
                if reaction.author != sender {
                    warn!(%sender, author = %reaction.author, %hash, "Refusing to delete another author's reaction");
                    return Ok(ActionEffect::Ignored);
                }
                store.delete_reaction_by_hash(hash)?;
                info!(%sender, %hash, "Deleted reaction on request");
                return Ok(ActionEffect::Deleted);
            }
            debug!(%sender, %hash, "Delete target not stored locally");
            Ok(ActionEffect::Ignored)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CipherKind, SymmetricKey};
    use crate::identity::Keypair;
    use crate::storage::Storage;
    use crate::types::{BlobHash, Post};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<dyn LocalStore>, KeyManager, PeerId) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn LocalStore> = Arc::new(Storage::open_in(dir.path()).unwrap());
        let keypair = Arc::new(Keypair::generate());
        let local = keypair.peer_id();
        let keys = KeyManager::new(store.clone(), keypair, CipherKind::ChaCha20Poly1305);
        (dir, store, keys, local)
    }

    fn received(from: PeerId, to: PeerId, kind: ActionKind) -> Action {
        let mut action = Action::new(to, kind);
        action.from = Some(from);
        action
    }

    #[test]
    fn test_update_key_installs_under_sender_scope() {
        let (_dir, store, keys, local) = setup();
        let alice = PeerId([1; 32]);
        let circle = CircleId::new();
        let key = SymmetricKey::generate(CipherKind::ChaCha20Poly1305, 3);

        let action = received(alice, local, ActionKind::UpdateKey { circle_id: circle, key });
        let effect = dispatch(store.as_ref(), &keys, &local, &action).unwrap();
        assert!(matches!(effect, ActionEffect::KeyInstalled { generation: 3, new: true, .. }));
        assert_eq!(keys.circle_candidates(alice, circle).unwrap().len(), 1);

        let again = dispatch(store.as_ref(), &keys, &local, &action).unwrap();
        assert!(matches!(again, ActionEffect::KeyInstalled { new: false, .. }));
    }

    #[test]
    fn test_introduce_records_without_following() {
        let (_dir, store, keys, local) = setup();
        let alice = PeerId([1; 32]);
        let carol = PeerId([3; 32]);

        let action = received(
            alice,
            local,
            ActionKind::Introduce {
                peer: carol,
                name: "Carol".into(),
            },
        );
        dispatch(store.as_ref(), &keys, &local, &action).unwrap();

        let intros = store.list_introductions().unwrap();
        assert_eq!(intros.len(), 1);
        assert_eq!(intros[0].peer, carol);
        assert!(store.load_peer(&carol).unwrap().is_none());
    }

    #[test]
    fn test_delete_only_removes_senders_content() {
        let (_dir, store, keys, local) = setup();
        let alice = PeerId([1; 32]);
        let mallory = PeerId([6; 32]);
        let hash = BlobHash::of(b"post blob");

        let mut post = Post::new(alice, CircleId::new(), "oops");
        post.stored_hash = Some(hash);
        store.save_post(&post).unwrap();

        let forged = received(mallory, local, ActionKind::Delete { hash });
        assert_eq!(
            dispatch(store.as_ref(), &keys, &local, &forged).unwrap(),
            ActionEffect::Ignored
        );
        assert!(store.post_by_hash(&hash).unwrap().is_some());

        let genuine = received(alice, local, ActionKind::Delete { hash });
        assert_eq!(
            dispatch(store.as_ref(), &keys, &local, &genuine).unwrap(),
            ActionEffect::Deleted
        );
        assert!(store.post_by_hash(&hash).unwrap().is_none());
    }

    #[test]
    fn test_action_without_sender_is_rejected() {
        let (_dir, store, keys, local) = setup();
        let action = Action::new(local, ActionKind::Delete { hash: BlobHash::of(b"x") });
        assert!(dispatch(store.as_ref(), &keys, &local, &action).is_err());
    }
}
