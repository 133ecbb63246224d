//! Key records and the key manager
//!
//! Circle keys are kept per scope as an ordered history, newest last. Old keys
//! are never discarded (historical content stays readable) and never handed
//! out again: rotation only distributes the newest key.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::cipher::{CipherKind, SymmetricKey};
use super::derive::{derive_peer_key, KeyContext};
use super::trial::Candidate;
use crate::error::{SyncError, SyncResult};
use crate::identity::Keypair;
use crate::storage::LocalStore;
use crate::types::{Circle, CircleId, PeerId};

/// Scope a circle key belongs to: `circle:<owner>:<id>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyScope {
    /// Circle owner
    pub owner: PeerId,
    /// Circle id within the owner's account
    pub circle: CircleId,
}

impl KeyScope {
    /// Scope for a circle
    pub fn circle(owner: PeerId, circle: CircleId) -> Self {
        Self { owner, circle }
    }
}

impl fmt::Display for KeyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "circle:{}:{}", self.owner.to_hex(), self.circle)
    }
}

/// All keys known for one scope, ordered by generation, newest last
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    /// Scope
    pub scope: KeyScope,
    /// Key history
    pub keys: Vec<SymmetricKey>,
}

impl KeyRecord {
    /// Empty record for a scope
    pub fn new(scope: KeyScope) -> Self {
        Self {
            scope,
            keys: Vec::new(),
        }
    }

    /// Newest key
    pub fn current(&self) -> Option<&SymmetricKey> {
        self.keys.last()
    }

    /// Highest known generation
    pub fn latest_generation(&self) -> Option<u32> {
        self.current().map(|k| k.generation)
    }

    /// Add a key, keeping generation order.
    ///
    /// Returns false if that generation is already present.
    pub fn install(&mut self, key: SymmetricKey) -> bool {
        if self.keys.iter().any(|k| k.generation == key.generation) {
            return false;
        }
        let pos = self
            .keys
            .iter()
            .position(|k| k.generation > key.generation)
            .unwrap_or(self.keys.len());
        self.keys.insert(pos, key);
        true
    }

    /// Trial decryption candidates, newest first
    pub fn candidates(&self) -> Vec<Candidate> {
        self.keys.iter().rev().cloned().map(Candidate::Key).collect()
    }
}

/// Owns key material decisions: circle key generation and rotation, remote
/// key installation, and per-peer key derivation.
#[derive(Clone)]
pub struct KeyManager {
    store: Arc<dyn LocalStore>,
    keypair: Arc<Keypair>,
    cipher: CipherKind,
}

impl fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyManager")
            .field("peer", &self.keypair.peer_id())
            .field("cipher", &self.cipher)
            .finish_non_exhaustive()
    }
}

impl KeyManager {
    /// Create a key manager over a local store
    pub fn new(store: Arc<dyn LocalStore>, keypair: Arc<Keypair>, cipher: CipherKind) -> Self {
        Self {
            store,
            keypair,
            cipher,
        }
    }

    /// Cipher used for newly generated keys
    pub fn cipher(&self) -> CipherKind {
        self.cipher
    }

    /// The local identity's keypair
    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    fn load_record(&self, scope: &KeyScope) -> SyncResult<KeyRecord> {
        Ok(self
            .store
            .load_key_record(scope)?
            .unwrap_or_else(|| KeyRecord::new(*scope)))
    }

    /// Generate and store the next key for one of our own circles.
    ///
    /// Updates `circle.key_generation`; the caller persists the circle.
    pub fn rotate(&self, circle: &mut Circle) -> SyncResult<SymmetricKey> {
        let scope = circle.key_scope();
        let mut record = self.load_record(&scope)?;
        let generation = record
            .latest_generation()
            .map(|g| g + 1)
            .unwrap_or(1)
            .max(circle.key_generation + 1);

        let key = SymmetricKey::generate(self.cipher, generation);
        record.install(key.clone());
        self.store.save_key_record(&record)?;
        circle.key_generation = generation;

        info!(
            circle = %circle.id,
            generation,
            fingerprint = %key.fingerprint(),
            "Rotated circle key"
        );
        Ok(key)
    }

    /// Current key for one of our own circles
    pub fn current_key(&self, circle: &Circle) -> SyncResult<SymmetricKey> {
        let scope = circle.key_scope();
        let record = self.load_record(&scope)?;
        record
            .keys
            .iter()
            .find(|k| k.generation == circle.key_generation)
            .or_else(|| record.current())
            .cloned()
            .ok_or_else(|| SyncError::UnknownEntity {
                kind: "circle key",
                id: scope.to_string(),
            })
    }

    /// Install a key received from a circle owner.
    ///
    /// Returns true if the key was new.
    pub fn install(&self, scope: KeyScope, key: SymmetricKey) -> SyncResult<bool> {
        let mut record = self.load_record(&scope)?;
        let generation = key.generation;
        let installed = record.install(key);
        if installed {
            self.store.save_key_record(&record)?;
            info!(%scope, generation, "Installed circle key");
        } else {
            debug!(%scope, generation, "Circle key already known");
        }
        Ok(installed)
    }

    /// Candidates for content of a circle, newest generation first
    pub fn circle_candidates(&self, owner: PeerId, circle: CircleId) -> SyncResult<Vec<Candidate>> {
        Ok(self
            .load_record(&KeyScope::circle(owner, circle))?
            .candidates())
    }

    /// Derived key shared with `remote`, using the configured cipher
    pub fn peer_key(&self, remote: &PeerId, context: KeyContext) -> SyncResult<SymmetricKey> {
        derive_peer_key(&self.keypair, remote, context, self.cipher)
    }

    /// Candidates for data encrypted with a derived key.
    ///
    /// The configured cipher comes first, then the other variant so data from
    /// peers on a different cipher still opens.
    pub fn peer_candidates(
        &self,
        remote: &PeerId,
        context: KeyContext,
        include_plaintext: bool,
    ) -> SyncResult<Vec<Candidate>> {
        let other = match self.cipher {
            CipherKind::ChaCha20Poly1305 => CipherKind::LegacyAesCbc,
            CipherKind::LegacyAesCbc => CipherKind::ChaCha20Poly1305,
        };
        let mut candidates = vec![
            Candidate::Key(derive_peer_key(&self.keypair, remote, context, self.cipher)?),
            Candidate::Key(derive_peer_key(&self.keypair, remote, context, other)?),
        ];
        if include_plaintext {
            candidates.push(Candidate::Plaintext);
        }
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use tempfile::tempdir;

    fn manager() -> (KeyManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().join("test.redb")).unwrap();
        let store: Arc<dyn LocalStore> = Arc::new(storage);
        let keypair = Arc::new(Keypair::generate());
        (
            KeyManager::new(store, keypair, CipherKind::ChaCha20Poly1305),
            dir,
        )
    }

    #[test]
    fn test_record_install_orders_by_generation() {
        let scope = KeyScope::circle(PeerId([1; 32]), CircleId::new());
        let mut record = KeyRecord::new(scope);
        assert!(record.install(SymmetricKey::generate(CipherKind::ChaCha20Poly1305, 2)));
        assert!(record.install(SymmetricKey::generate(CipherKind::ChaCha20Poly1305, 1)));
        assert!(!record.install(SymmetricKey::generate(CipherKind::ChaCha20Poly1305, 2)));

        let generations: Vec<u32> = record.keys.iter().map(|k| k.generation).collect();
        assert_eq!(generations, vec![1, 2]);
        assert_eq!(record.latest_generation(), Some(2));
    }

    #[test]
    fn test_rotate_keeps_history() {
        let (keys, _dir) = manager();
        let mut circle = Circle::new(keys.keypair().peer_id(), "friends");

        let first = keys.rotate(&mut circle).unwrap();
        let second = keys.rotate(&mut circle).unwrap();
        assert_eq!(first.generation, 1);
        assert_eq!(second.generation, 2);
        assert_eq!(circle.key_generation, 2);
        assert_eq!(keys.current_key(&circle).unwrap(), second);

        let candidates = keys.circle_candidates(circle.owner, circle.id).unwrap();
        assert_eq!(candidates.len(), 2);
        match &candidates[0] {
            Candidate::Key(k) => assert_eq!(k.generation, 2),
            Candidate::Plaintext => panic!("unexpected plaintext candidate"),
        }
    }

    #[test]
    fn test_install_remote_key_once() {
        let (keys, _dir) = manager();
        let scope = KeyScope::circle(PeerId([9; 32]), CircleId::new());
        let key = SymmetricKey::generate(CipherKind::ChaCha20Poly1305, 4);

        assert!(keys.install(scope, key.clone()).unwrap());
        assert!(!keys.install(scope, key).unwrap());
        assert_eq!(keys.circle_candidates(scope.owner, scope.circle).unwrap().len(), 1);
    }

    #[test]
    fn test_current_key_unknown_circle() {
        let (keys, _dir) = manager();
        let circle = Circle::new(keys.keypair().peer_id(), "never rotated");
        assert!(matches!(
            keys.current_key(&circle),
            Err(SyncError::UnknownEntity { .. })
        ));
    }

    #[test]
    fn test_peer_candidates_include_both_ciphers() {
        let (keys, _dir) = manager();
        let remote = Keypair::generate().peer_id();
        let candidates = keys
            .peer_candidates(&remote, KeyContext::Manifest, true)
            .unwrap();
        assert_eq!(candidates.len(), 3);
        assert!(matches!(candidates[2], Candidate::Plaintext));
    }
}
