//! Ed25519 device keypair with X25519 key agreement
//!
//! The Ed25519 verifying key is the peer id. Key agreement runs X25519 on the
//! Montgomery form of the same key, so any peer can derive a shared secret
//! with any other peer knowing nothing but its id.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use x25519_dalek::{PublicKey as AgreementPublic, StaticSecret};

use crate::error::{SyncError, SyncResult};
use crate::types::{random_bytes32, PeerId};

/// Ed25519 signature length in bytes
pub const SIGNATURE_LENGTH: usize = 64;

/// The local device identity.
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        Self::from_seed(&random_bytes32())
    }

    /// Deterministic keypair from a 32-byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(seed),
        }
    }

    /// Secret seed bytes for persistence
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// Restore from persisted seed bytes
    pub fn from_bytes(bytes: &[u8]) -> SyncResult<Self> {
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SyncError::Crypto(format!("Invalid keypair length: {}", bytes.len())))?;
        Ok(Self::from_seed(&seed))
    }

    /// This device's peer id
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_bytes(self.signing.verifying_key().to_bytes())
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }

    /// Raw X25519 shared secret with a remote peer.
    ///
    /// Symmetric: `a.shared_secret(b) == b.shared_secret(a)`.
    pub fn shared_secret(&self, remote: &PeerId) -> SyncResult<[u8; 32]> {
        let secret = StaticSecret::from(self.signing.to_scalar_bytes());
        let remote_public = agreement_public(remote)?;
        let shared = secret.diffie_hellman(&remote_public);
        if !shared.was_contributory() {
            return Err(SyncError::Crypto(format!(
                "Non-contributory key agreement with {}",
                remote
            )));
        }
        Ok(shared.to_bytes())
    }
}

impl Clone for Keypair {
    fn clone(&self) -> Self {
        Self::from_seed(&self.signing.to_bytes())
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

fn verifying_key(peer: &PeerId) -> SyncResult<VerifyingKey> {
    VerifyingKey::from_bytes(peer.as_bytes())
        .map_err(|e| SyncError::ValidationFailure(format!("Invalid peer key {}: {}", peer, e)))
}

fn agreement_public(peer: &PeerId) -> SyncResult<AgreementPublic> {
    let montgomery = verifying_key(peer)?.to_montgomery();
    Ok(AgreementPublic::from(montgomery.to_bytes()))
}

/// Verify `signature` over `message` by `peer`.
pub fn verify_signature(peer: &PeerId, message: &[u8], signature: &[u8]) -> SyncResult<()> {
    let key = verifying_key(peer)?;
    let signature = Signature::from_slice(signature)
        .map_err(|e| SyncError::ValidationFailure(format!("Malformed signature: {}", e)))?;
    key.verify(message, &signature)
        .map_err(|_| SyncError::ValidationFailure(format!("Bad signature from {}", peer)))
}
