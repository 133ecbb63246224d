//! Cipher suite and key management
//!
//! - [`cipher`]: ChaCha20-Poly1305 and legacy AES-256-CBC symmetric keys
//! - [`derive`]: per-peer keys from X25519 agreement and HKDF
//! - [`trial`]: multi-key trial decryption with validators
//! - [`keyring`]: circle key history, rotation and installation

pub mod cipher;
pub mod derive;
pub mod keyring;
pub mod trial;

pub use cipher::{CipherKind, SymmetricKey, IV_SIZE, NONCE_SIZE, TAG_SIZE};
pub use derive::{derive_peer_key, KeyContext};
pub use keyring::{KeyManager, KeyRecord, KeyScope};
pub use trial::{candidate_set_id, trial_decrypt, Candidate, TrialOutcome};
