//! Social entities: identities, circles, posts, reactions and attachments

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::{now_millis, BlobHash, CircleId, PeerId, PostId, Timestamp};
use crate::crypto::KeyScope;

/// Reference to a file attached to a post or used as an avatar.
///
/// `content_hash` addresses the plaintext and is known as soon as the file is
/// attached. `blob_hash` addresses the encrypted blob and is only set once the
/// attachment has been uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    /// Original file name
    pub name: String,
    /// Plaintext size in bytes
    pub size: u64,
    /// BLAKE3 of the plaintext
    pub content_hash: BlobHash,
    /// Hash of the stored (encrypted) blob
    pub blob_hash: Option<BlobHash>,
}

impl FileRef {
    /// Reference for bytes that have not been uploaded yet
    pub fn for_bytes(name: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            name: name.into(),
            size: bytes.len() as u64,
            content_hash: BlobHash::of(bytes),
            blob_hash: None,
        }
    }

    /// Whether the attachment blob has been stored
    pub fn is_uploaded(&self) -> bool {
        self.blob_hash.is_some()
    }
}

/// Attachment bytes waiting for the next publish cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAttachment {
    /// BLAKE3 of `bytes`, matches `FileRef::content_hash`
    pub content_hash: BlobHash,
    /// Original file name
    pub name: String,
    /// Plaintext bytes
    pub bytes: Vec<u8>,
    /// When it was attached (ms)
    pub created_at: Timestamp,
}

impl PendingAttachment {
    /// Capture attachment bytes
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            content_hash: BlobHash::of(&bytes),
            name: name.into(),
            bytes,
            created_at: now_millis(),
        }
    }

    /// The reference a post or identity carries for this attachment
    pub fn file_ref(&self) -> FileRef {
        FileRef {
            name: self.name.clone(),
            size: self.bytes.len() as u64,
            content_hash: self.content_hash,
            blob_hash: None,
        }
    }
}

/// Public profile of a peer.
///
/// A published identity blob is immutable; changing the name or avatar clears
/// `stored_hash` so the next publish stores a fresh blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// The peer this identity represents
    pub owner: PeerId,
    /// Display name
    pub name: String,
    /// Optional avatar attachment
    pub avatar: Option<FileRef>,
    /// Last local change (ms)
    pub updated_at: Timestamp,
    /// Signature from the last upload
    pub signature: Option<Vec<u8>>,
    /// Hash of the published blob, `None` until uploaded
    pub stored_hash: Option<BlobHash>,
}

impl Identity {
    /// Create a new, not yet published identity
    pub fn new(owner: PeerId, name: impl Into<String>) -> Self {
        Self {
            owner,
            name: name.into(),
            avatar: None,
            updated_at: now_millis(),
            signature: None,
            stored_hash: None,
        }
    }

    /// Rename, marking the identity for re-upload
    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.touch();
    }

    /// Replace the avatar, marking the identity for re-upload
    pub fn set_avatar(&mut self, avatar: Option<FileRef>) {
        self.avatar = avatar;
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = now_millis();
        self.signature = None;
        self.stored_hash = None;
    }

    /// Copy without local-only fields, as carried inside a signed record
    pub fn to_wire(&self) -> Self {
        Self {
            signature: None,
            stored_hash: None,
            ..self.clone()
        }
    }
}

/// A named visibility group owned by the local identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Circle {
    /// Circle identifier
    pub id: CircleId,
    /// Owner identity
    pub owner: PeerId,
    /// Display name
    pub name: String,
    /// Current members, always including the owner
    pub members: BTreeSet<PeerId>,
    /// Generation of the current symmetric key
    pub key_generation: u32,
    /// Whether this is the implicit "everyone" circle
    pub is_everyone: bool,
    /// Creation time (ms)
    pub created_at: Timestamp,
    /// Last membership change (ms)
    pub membership_changed_at: Timestamp,
}

impl Circle {
    /// Name of the implicit circle every account has
    pub const EVERYONE: &'static str = "everyone";

    /// Create a circle whose only member is its owner
    pub fn new(owner: PeerId, name: impl Into<String>) -> Self {
        let now = now_millis();
        let mut members = BTreeSet::new();
        members.insert(owner);
        Self {
            id: CircleId::new(),
            owner,
            name: name.into(),
            members,
            key_generation: 0,
            is_everyone: false,
            created_at: now,
            membership_changed_at: now,
        }
    }

    /// Create the "everyone" circle for an owner
    pub fn everyone(owner: PeerId) -> Self {
        Self {
            is_everyone: true,
            ..Self::new(owner, Self::EVERYONE)
        }
    }

    /// Check membership
    pub fn is_member(&self, peer: &PeerId) -> bool {
        self.members.contains(peer)
    }

    /// Members other than the owner
    pub fn remote_members(&self) -> impl Iterator<Item = &PeerId> {
        self.members.iter().filter(move |p| **p != self.owner)
    }

    /// Key scope for this circle's symmetric keys
    pub fn key_scope(&self) -> KeyScope {
        KeyScope::circle(self.owner, self.id)
    }
}

/// A post authored by some peer into one of that peer's circles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    /// Post identifier
    pub id: PostId,
    /// Author peer
    pub author: PeerId,
    /// Author's circle the post is visible to
    pub circle_id: CircleId,
    /// Creation time (ms)
    pub timestamp: Timestamp,
    /// Hash of the post this one replies to
    pub parent_hash: Option<BlobHash>,
    /// Body text
    pub text: String,
    /// Attachments
    pub files: Vec<FileRef>,
    /// Author signature over the wire form
    pub signature: Option<Vec<u8>>,
    /// Hash of the published blob, `None` until uploaded
    pub stored_hash: Option<BlobHash>,
}

impl Post {
    /// Create an unpublished post timestamped now
    pub fn new(author: PeerId, circle_id: CircleId, text: impl Into<String>) -> Self {
        Self {
            id: PostId::new(),
            author,
            circle_id,
            timestamp: now_millis(),
            parent_hash: None,
            text: text.into(),
            files: Vec::new(),
            signature: None,
            stored_hash: None,
        }
    }

    /// Set the reply parent
    pub fn with_parent(mut self, parent: BlobHash) -> Self {
        self.parent_hash = Some(parent);
        self
    }

    /// Set attachments
    pub fn with_files(mut self, files: Vec<FileRef>) -> Self {
        self.files = files;
        self
    }

    /// Override the creation time
    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Whether the post has been uploaded
    pub fn is_published(&self) -> bool {
        self.stored_hash.is_some()
    }

    /// Copy without local-only fields, as carried inside a signed record
    pub fn to_wire(&self) -> Self {
        Self {
            signature: None,
            stored_hash: None,
            ..self.clone()
        }
    }
}

/// Distinguishes emoji-style reactions from free-form tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReactionKind {
    /// A reaction such as an emoji
    Reaction,
    /// A label attached to a post
    Tag,
}

impl std::fmt::Display for ReactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReactionKind::Reaction => write!(f, "reaction"),
            ReactionKind::Tag => write!(f, "tag"),
        }
    }
}

/// Reaction or tag on a published post.
///
/// Unique per (post hash, author, kind, value).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    /// Stored hash of the post being reacted to
    pub post_hash: BlobHash,
    /// Reacting peer
    pub author: PeerId,
    /// Reaction or tag
    pub kind: ReactionKind,
    /// Emoji or tag text
    pub value: String,
    /// Author's circle the reaction is visible to
    pub circle_id: CircleId,
    /// Creation time (ms)
    pub timestamp: Timestamp,
    /// Author signature over the wire form
    pub signature: Option<Vec<u8>>,
    /// Hash of the published blob, `None` until uploaded
    pub stored_hash: Option<BlobHash>,
}

impl Reaction {
    /// Create an unpublished reaction timestamped now
    pub fn new(
        post_hash: BlobHash,
        author: PeerId,
        kind: ReactionKind,
        value: impl Into<String>,
        circle_id: CircleId,
    ) -> Self {
        Self {
            post_hash,
            author,
            kind,
            value: value.into(),
            circle_id,
            timestamp: now_millis(),
            signature: None,
            stored_hash: None,
        }
    }

    /// Uniqueness key: post hash, author, kind and value
    pub fn unique_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.post_hash.to_hex(),
            self.author.to_hex(),
            self.kind,
            self.value
        )
    }

    /// Copy without local-only fields, as carried inside a signed record
    pub fn to_wire(&self) -> Self {
        Self {
            signature: None,
            stored_hash: None,
            ..self.clone()
        }
    }
}
