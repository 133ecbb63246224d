//! Directed control messages between two peers

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use super::{now_millis, BlobHash, CircleId, PeerId, Timestamp};
use crate::crypto::SymmetricKey;

/// What an action asks the recipient to do
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    /// Install a new symmetric key for one of the sender's circles
    UpdateKey {
        /// Sender's circle
        circle_id: CircleId,
        /// New key material and generation
        key: SymmetricKey,
    },
    /// Introduce a third peer to the recipient
    Introduce {
        /// Peer being introduced
        peer: PeerId,
        /// Name the sender knows them by
        name: String,
    },
    /// Ask the recipient to drop content the sender published
    Delete {
        /// Stored hash of the sender's post or reaction
        hash: BlobHash,
    },
}

impl ActionKind {
    /// Short type name for logs
    pub fn type_name(&self) -> &'static str {
        match self {
            ActionKind::UpdateKey { .. } => "UpdateKey",
            ActionKind::Introduce { .. } => "Introduce",
            ActionKind::Delete { .. } => "Delete",
        }
    }
}

/// A message from one publisher to exactly one target peer.
///
/// Outgoing actions are keyed by `id` until uploaded. Received actions are
/// keyed by the hash they were fetched under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    /// Sender-assigned identifier
    pub id: Ulid,
    /// Creation time (ms)
    pub timestamp: Timestamp,
    /// Type and payload
    pub kind: ActionKind,
    /// Target peer
    pub to: PeerId,
    /// Sender, filled in from the verified signature on receipt
    pub from: Option<PeerId>,
    /// Whether the recipient has dispatched it
    pub processed: bool,
    /// Hash of the published blob, `None` until uploaded
    pub stored_hash: Option<BlobHash>,
}

impl Action {
    /// Create an outgoing action timestamped now
    pub fn new(to: PeerId, kind: ActionKind) -> Self {
        Self {
            id: Ulid::new(),
            timestamp: now_millis(),
            kind,
            to,
            from: None,
            processed: false,
            stored_hash: None,
        }
    }

    /// Copy without local-only fields, as carried inside a signed record
    pub fn to_wire(&self) -> Self {
        Self {
            from: None,
            processed: false,
            stored_hash: None,
            ..self.clone()
        }
    }
}
