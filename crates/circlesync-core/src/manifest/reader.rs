//! Parsing decrypted manifests and content records
//!
//! Each parser takes already-decrypted bytes, checks the signature against
//! the expected publisher and checks that the body is consistent with where
//! it was found. They double as trial-decryption validators via `.ok()`.

use crate::error::{SyncError, SyncResult};
use crate::identity::SignedRecord;
use crate::types::{
    Action, BlobHash, CircleId, CircleManifest, Identity, PeerId, Post, Reaction, UserManifest,
};

fn mismatch(what: &str, detail: String) -> SyncError {
    SyncError::ValidationFailure(format!("{}: {}", what, detail))
}

/// Parse a user manifest published by `publisher`
pub fn parse_user_manifest(bytes: &[u8], publisher: &PeerId) -> SyncResult<UserManifest> {
    let manifest = SignedRecord::<UserManifest>::open(bytes, publisher)?.body;
    if manifest.owner != *publisher {
        return Err(mismatch(
            "user manifest",
            format!("owner {} but published by {}", manifest.owner, publisher),
        ));
    }
    Ok(manifest)
}

/// Parse a circle manifest for `circle_id` published by `publisher`
pub fn parse_circle_manifest(
    bytes: &[u8],
    publisher: &PeerId,
    circle_id: &CircleId,
) -> SyncResult<CircleManifest> {
    let manifest = SignedRecord::<CircleManifest>::open(bytes, publisher)?.body;
    if manifest.owner != *publisher || manifest.circle_id != *circle_id {
        return Err(mismatch(
            "circle manifest",
            format!("{}/{} listed as {}/{}", manifest.owner, manifest.circle_id, publisher, circle_id),
        ));
    }
    Ok(manifest)
}

/// Parse a post by `author` in `circle_id`, returning it with its signature
pub fn parse_post(bytes: &[u8], author: &PeerId, circle_id: &CircleId) -> SyncResult<Post> {
    let record = SignedRecord::<Post>::open(bytes, author)?;
    let mut post = record.body;
    if post.author != *author || post.circle_id != *circle_id {
        return Err(mismatch(
            "post",
            format!("{} in {} listed under {}", post.author, post.circle_id, circle_id),
        ));
    }
    post.signature = Some(record.signature);
    Ok(post)
}

/// Parse a reaction by `author` in `circle_id`
pub fn parse_reaction(bytes: &[u8], author: &PeerId, circle_id: &CircleId) -> SyncResult<Reaction> {
    let record = SignedRecord::<Reaction>::open(bytes, author)?;
    let mut reaction = record.body;
    if reaction.author != *author || reaction.circle_id != *circle_id {
        return Err(mismatch(
            "reaction",
            format!("{} in {} listed under {}", reaction.author, reaction.circle_id, circle_id),
        ));
    }
    reaction.signature = Some(record.signature);
    Ok(reaction)
}

/// Parse an action sent by `sender` to `recipient`; `from` is filled in
pub fn parse_action(bytes: &[u8], sender: &PeerId, recipient: &PeerId) -> SyncResult<Action> {
    let mut action = SignedRecord::<Action>::open(bytes, sender)?.body;
    if action.to != *recipient {
        return Err(mismatch(
            "action",
            format!("addressed to {} but delivered to {}", action.to, recipient),
        ));
    }
    action.from = Some(*sender);
    Ok(action)
}

/// Parse the identity of `owner`
pub fn parse_identity(bytes: &[u8], owner: &PeerId) -> SyncResult<Identity> {
    let record = SignedRecord::<Identity>::open(bytes, owner)?;
    let mut identity = record.body;
    if identity.owner != *owner {
        return Err(mismatch(
            "identity",
            format!("for {} but signed by {}", identity.owner, owner),
        ));
    }
    identity.signature = Some(record.signature);
    Ok(identity)
}

/// Check attachment plaintext against the content hash its reference carries
pub fn check_attachment(bytes: &[u8], content_hash: &BlobHash) -> SyncResult<Vec<u8>> {
    let actual = BlobHash::of(bytes);
    if actual != *content_hash {
        return Err(mismatch(
            "attachment",
            format!("content hash {} but expected {}", actual, content_hash),
        ));
    }
    Ok(bytes.to_vec())
}
