//! Per-peer derived keys
//!
//! Two peers agree on an X25519 shared secret and expand it with HKDF-SHA256.
//! The context string separates uses, so the "manifest" and "action" keys
//! between the same two peers are unrelated.

use hkdf::Hkdf;
use sha2::Sha256;

use super::cipher::{CipherKind, SymmetricKey};
use crate::error::{SyncError, SyncResult};
use crate::identity::Keypair;
use crate::types::{CircleId, PeerId};

/// Domain separation prefix for HKDF
const HKDF_INFO: &[u8] = b"circlesync-peer-v1";

/// What a derived key is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyContext {
    /// Per-peer copy of the user manifest
    Manifest,
    /// Action payloads
    Action,
    /// Circle-scoped per-peer data
    Circle(CircleId),
}

impl KeyContext {
    fn label(&self) -> String {
        match self {
            KeyContext::Manifest => "manifest".to_string(),
            KeyContext::Action => "action".to_string(),
            KeyContext::Circle(id) => format!("circle-{}", id),
        }
    }
}

fn derive_key(shared_secret: &[u8], info: &[u8]) -> SyncResult<[u8; 32]> {
    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
    let mut output = [0u8; 32];
    hkdf.expand(info, &mut output)
        .map_err(|e| SyncError::Crypto(format!("HKDF expand failed: {}", e)))?;
    Ok(output)
}

/// Derive the symmetric key shared between `local` and `remote` for `context`.
///
/// Both sides get the same key: peer ids enter the info string in sorted order.
pub fn derive_peer_key(
    local: &Keypair,
    remote: &PeerId,
    context: KeyContext,
    kind: CipherKind,
) -> SyncResult<SymmetricKey> {
    let shared = local.shared_secret(remote)?;

    let me = local.peer_id();
    let (first, second) = if me <= *remote {
        (me, *remote)
    } else {
        (*remote, me)
    };

    let label = context.label();
    let mut info = Vec::with_capacity(HKDF_INFO.len() + label.len() + 64);
    info.extend_from_slice(HKDF_INFO);
    info.extend_from_slice(label.as_bytes());
    info.extend_from_slice(first.as_bytes());
    info.extend_from_slice(second.as_bytes());

    let bytes = derive_key(&shared, &info)?;
    Ok(SymmetricKey::from_bytes(kind, 0, bytes))
}
