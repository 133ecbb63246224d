//! Signed wire records
//!
//! Every manifest, post, reaction, action and identity leaves the device as a
//! `SignedRecord`. The signature covers the postcard encoding of `body`, and
//! the whole record is postcard-encoded before encryption.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::keypair::{verify_signature, Keypair};
use crate::error::{SyncError, SyncResult};
use crate::types::PeerId;

/// A record body together with its signer and signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedRecord<T> {
    /// Signed content
    pub body: T,
    /// Claimed signer
    pub signer: PeerId,
    /// Ed25519 signature over `postcard(body)`
    pub signature: Vec<u8>,
}

impl<T> SignedRecord<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Sign `body` with the local keypair
    pub fn sign(body: T, keypair: &Keypair) -> SyncResult<Self> {
        let canonical = postcard::to_allocvec(&body).map_err(SyncError::serialization)?;
        let signature = keypair.sign(&canonical);
        Ok(Self {
            body,
            signer: keypair.peer_id(),
            signature,
        })
    }

    /// Check the signature against `signer`
    pub fn verify(&self) -> SyncResult<()> {
        let canonical = postcard::to_allocvec(&self.body).map_err(SyncError::serialization)?;
        verify_signature(&self.signer, &canonical, &self.signature)
    }

    /// Encode for storage/encryption
    pub fn to_bytes(&self) -> SyncResult<Vec<u8>> {
        postcard::to_allocvec(self).map_err(SyncError::serialization)
    }

    /// Decode without verifying
    pub fn from_bytes(bytes: &[u8]) -> SyncResult<Self> {
        postcard::from_bytes(bytes).map_err(SyncError::serialization)
    }

    /// Decode and verify, requiring a specific signer.
    ///
    /// This is the validator used during trial decryption: a wrong key's output
    /// essentially never decodes into a record carrying a valid signature by
    /// the expected peer.
    pub fn open(bytes: &[u8], expected_signer: &PeerId) -> SyncResult<Self> {
        let record = Self::from_bytes(bytes)?;
        if record.signer != *expected_signer {
            return Err(SyncError::ValidationFailure(format!(
                "Record signed by {} but expected {}",
                record.signer, expected_signer
            )));
        }
        record.verify()?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Note {
        text: String,
        n: u32,
    }

    fn note() -> Note {
        Note {
            text: "hi".into(),
            n: 7,
        }
    }

    #[test]
    fn test_sign_then_open() {
        let keypair = Keypair::generate();
        let record = SignedRecord::sign(note(), &keypair).unwrap();
        let bytes = record.to_bytes().unwrap();

        let opened = SignedRecord::<Note>::open(&bytes, &keypair.peer_id()).unwrap();
        assert_eq!(opened.body, note());
    }

    #[test]
    fn test_open_rejects_other_signer() {
        let alice = Keypair::generate();
        let mallory = Keypair::generate();
        let bytes = SignedRecord::sign(note(), &mallory)
            .unwrap()
            .to_bytes()
            .unwrap();

        let result = SignedRecord::<Note>::open(&bytes, &alice.peer_id());
        assert!(matches!(result, Err(SyncError::ValidationFailure(_))));
    }

    #[test]
    fn test_open_rejects_tampered_body() {
        let keypair = Keypair::generate();
        let mut record = SignedRecord::sign(note(), &keypair).unwrap();
        record.body.n = 8;
        let bytes = record.to_bytes().unwrap();

        let result = SignedRecord::<Note>::open(&bytes, &keypair.peer_id());
        assert!(matches!(result, Err(SyncError::ValidationFailure(_))));
    }

    #[test]
    fn test_open_rejects_garbage() {
        let keypair = Keypair::generate();
        let result = SignedRecord::<Note>::open(&[0xFF; 40], &keypair.peer_id());
        assert!(result.is_err());
    }
}
