//! Trial decryption across candidate keys
//!
//! When the key that produced a blob is not known up front (rotated circle
//! keys, legacy cipher variants, possibly-public data), each candidate is
//! tried in order and the first plaintext accepted by the validator wins.
//! Failure is a value, not an error: callers log it and move on.

use tracing::{debug, warn};

use super::cipher::{CipherKind, SymmetricKey};
use crate::error::{SyncError, SyncResult};
use crate::types::BlobHash;

/// One way of turning a stored blob back into plaintext
#[derive(Debug, Clone)]
pub enum Candidate {
    /// Decrypt with this key
    Key(SymmetricKey),
    /// Treat the blob as unencrypted
    Plaintext,
}

impl Candidate {
    fn open(&self, data: &[u8]) -> SyncResult<Vec<u8>> {
        match self {
            Candidate::Key(key) => key.decrypt(data),
            Candidate::Plaintext => Ok(data.to_vec()),
        }
    }
}

/// Result of [`trial_decrypt`]
#[derive(Debug)]
pub enum TrialOutcome<T> {
    /// A candidate produced a plaintext the validator accepted
    Decrypted {
        /// Validated value
        value: T,
        /// Index of the winning candidate
        key_index: usize,
    },
    /// No candidate validated
    Undecryptable {
        /// Number of candidates tried
        attempts: usize,
    },
}

impl<T> TrialOutcome<T> {
    /// Convert into a `Result`, mapping failure to `DecryptionFailure`
    pub fn into_result(self, context: &str) -> SyncResult<T> {
        match self {
            TrialOutcome::Decrypted { value, .. } => Ok(value),
            TrialOutcome::Undecryptable { attempts } => Err(SyncError::DecryptionFailure {
                context: context.to_string(),
                attempts,
            }),
        }
    }

    /// Whether a candidate succeeded
    pub fn is_decrypted(&self) -> bool {
        matches!(self, TrialOutcome::Decrypted { .. })
    }
}

/// Identifier of a candidate set. Equal sets give equal ids in any order,
/// and a set that gains a key gets a new id.
pub fn candidate_set_id(candidates: &[Candidate]) -> BlobHash {
    let mut parts: Vec<[u8; 33]> = candidates
        .iter()
        .map(|candidate| {
            let mut part = [0u8; 33];
            if let Candidate::Key(key) = candidate {
                part[0] = match key.kind {
                    CipherKind::ChaCha20Poly1305 => 1,
                    CipherKind::LegacyAesCbc => 2,
                };
                part[1..].copy_from_slice(&key.bytes);
            }
            part
        })
        .collect();
    parts.sort_unstable();
    parts.dedup();
    BlobHash::of(&parts.concat())
}

/// Try each candidate in order, returning the first validated plaintext.
///
/// `validator` parses and checks the plaintext; it should only return `Some`
/// for output that could not plausibly come from a wrong key (signature
/// checks, content hashes).
pub fn trial_decrypt<T, F>(
    candidates: &[Candidate],
    data: &[u8],
    context: &str,
    mut validator: F,
) -> TrialOutcome<T>
where
    F: FnMut(&[u8]) -> Option<T>,
{
    for (index, candidate) in candidates.iter().enumerate() {
        let plaintext = match candidate.open(data) {
            Ok(p) => p,
            Err(e) => {
                debug!(context, index, error = %e, "Candidate failed to decrypt");
                continue;
            }
        };

        if let Some(value) = validator(&plaintext) {
            debug!(context, key_index = index, "Trial decryption succeeded");
            return TrialOutcome::Decrypted {
                value,
                key_index: index,
            };
        }
        debug!(context, index, "Candidate plaintext rejected by validator");
    }

    warn!(
        context,
        attempts = candidates.len(),
        len = data.len(),
        "No candidate key could decrypt content"
    );
    TrialOutcome::Undecryptable {
        attempts: candidates.len(),
    }
}
