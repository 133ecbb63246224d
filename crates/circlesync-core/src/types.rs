//! Core types for CircleSync

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use ulid::Ulid;

pub mod action;
pub mod manifest;
pub mod peer;
pub mod social;

pub use action::{Action, ActionKind};
pub use manifest::{CircleManifest, ManifestEntry, UserManifest};
pub use peer::{Introduction, PeerRecord};
pub use social::{Circle, FileRef, Identity, PendingAttachment, Post, Reaction, ReactionKind};

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// Current wall-clock time in milliseconds.
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

/// Source of "now" for the publish pipeline.
///
/// Retention windows and manifest timestamps are measured against this
/// clock; the system clock unless a node is opened with another one.
#[derive(Clone)]
pub struct Clock(std::sync::Arc<dyn Fn() -> Timestamp + Send + Sync>);

impl Clock {
    /// Wall clock
    pub fn system() -> Self {
        Self(std::sync::Arc::new(now_millis))
    }

    /// Clock that always reads `at`
    pub fn fixed(at: Timestamp) -> Self {
        Self(std::sync::Arc::new(move || at))
    }

    /// Clock backed by an arbitrary function
    pub fn from_fn(f: impl Fn() -> Timestamp + Send + Sync + 'static) -> Self {
        Self(std::sync::Arc::new(f))
    }

    /// Current time (ms)
    pub fn now(&self) -> Timestamp {
        (self.0)()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Clock").field(&self.now()).finish()
    }
}

/// Writes 32-byte identifiers as hex for JSON and raw bytes for postcard.
macro_rules! hex_bytes_serde {
    ($ty:ident) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                if serializer.is_human_readable() {
                    serializer.serialize_str(&self.to_hex())
                } else {
                    self.0.serialize(serializer)
                }
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                if deserializer.is_human_readable() {
                    let s = String::deserialize(deserializer)?;
                    $ty::from_hex(&s).map_err(de::Error::custom)
                } else {
                    let bytes = <[u8; 32]>::deserialize(deserializer)?;
                    Ok($ty(bytes))
                }
            }
        }
    };
}

fn decode_hex32(s: &str) -> Result<[u8; 32], String> {
    let bytes = hex::decode(s).map_err(|e| format!("invalid hex: {}", e))?;
    if bytes.len() != 32 {
        return Err(format!("expected 32 bytes, got {}", bytes.len()));
    }
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}

/// Stable public identifier of a device/identity (Ed25519 verifying key).
///
/// The same 32 bytes are the iroh endpoint id of the node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    /// Create a PeerId from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full lowercase hex form (used as collection entry names and CLI input)
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from the hex form
    pub fn from_hex(s: &str) -> Result<Self, String> {
        decode_hex32(s.trim()).map(Self)
    }

    /// Short base58 form for logs
    pub fn short(&self) -> String {
        bs58::encode(&self.0[..8]).into_string()
    }
}

hex_bytes_serde!(PeerId);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer_{}", self.short())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// Content address of a stored blob: BLAKE3 over the exact stored bytes.
///
/// Matches the hash iroh-blobs assigns to the same bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobHash(pub [u8; 32]);

impl BlobHash {
    /// Hash the given bytes
    pub fn of(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full hex form
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from the hex form
    pub fn from_hex(s: &str) -> Result<Self, String> {
        decode_hex32(s.trim()).map(Self)
    }
}

hex_bytes_serde!(BlobHash);

impl fmt::Display for BlobHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..12])
    }
}

impl fmt::Debug for BlobHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobHash({})", &self.to_hex()[..12])
    }
}

impl FromStr for BlobHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// Identifier of a circle, unique within its owner's account
///
/// Uses ULID so circle ids sort by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CircleId(pub Ulid);

impl CircleId {
    /// Create a new CircleId with current timestamp
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse from string representation
    pub fn from_string(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s.trim())?))
    }
}

impl Default for CircleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CircleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a post
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PostId(pub Ulid);

impl PostId {
    /// Create a new PostId with current timestamp
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse from string representation
    pub fn from_string(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s.trim())?))
    }
}

impl Default for PostId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generate 32 random bytes from the thread RNG.
pub(crate) fn random_bytes32() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_hash_is_content_address() {
        let a = BlobHash::of(b"same bytes");
        let b = BlobHash::of(b"same bytes");
        let c = BlobHash::of(b"other bytes");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_peer_id_hex_roundtrip() {
        let peer = PeerId(random_bytes32());
        let parsed = PeerId::from_hex(&peer.to_hex()).unwrap();
        assert_eq!(peer, parsed);
        assert!(PeerId::from_hex("abcd").is_err());
        assert!(PeerId::from_hex("zz").is_err());
    }

    #[test]
    fn test_ids_serialize_as_hex_in_json() {
        let hash = BlobHash::of(b"x");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash.to_hex()));
        let back: BlobHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }

    #[test]
    fn test_ids_serialize_as_bytes_in_postcard() {
        let peer = PeerId([7u8; 32]);
        let bytes = postcard::to_allocvec(&peer).unwrap();
        assert_eq!(bytes.len(), 32);
        let back: PeerId = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(back, peer);
    }

    #[test]
    fn test_peer_id_map_keys_in_json() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(PeerId([1u8; 32]), 5u64);
        let json = serde_json::to_string(&map).unwrap();
        let back: std::collections::BTreeMap<PeerId, u64> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn test_circle_id_string_roundtrip() {
        let id = CircleId::new();
        let parsed = CircleId::from_string(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }
}
