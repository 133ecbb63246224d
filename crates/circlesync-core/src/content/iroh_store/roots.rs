//! Root pointer request/response protocol
//!
//! A node answers `GetRoot { peer }` with the newest signed pointer it knows
//! for that peer: its own when `peer` is itself, otherwise one learned from
//! gossip or a previous resolution. Requesters verify the signature, so any
//! node can relay any peer's root.
//!
//! ```text
//! Requester                     Root host
//!   |                               |
//!   |--- GetRoot { peer } --------->|
//!   |                               |
//!   |<-- Root { pointer } ----------|
//!   |    (or NotFound)              |
//! ```

use iroh::endpoint::Connection;
use iroh::protocol::ProtocolHandler;
use iroh::{Endpoint, EndpointId};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::content::{ResolutionCache, RootPointer, ROOT_PATH};
use crate::error::{SyncError, SyncResult};
use crate::types::PeerId;

/// ALPN protocol identifier for root resolution
pub const ROOT_ALPN: &[u8] = b"/circlesync/root/1";

const MAX_MESSAGE_SIZE: usize = 16 * 1024;

/// Root protocol messages
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RootMessage {
    /// Ask for a peer's root with version at least `min_version`
    GetRoot {
        /// Publisher whose root is wanted
        peer: PeerId,
        /// Lowest acceptable version
        min_version: u64,
    },
    /// Newest known pointer
    Root {
        /// Signed pointer
        pointer: RootPointer,
    },
    /// Nothing at or above the requested version
    NotFound,
}

impl RootMessage {
    /// Encode message to bytes using postcard
    pub fn encode(&self) -> SyncResult<Vec<u8>> {
        postcard::to_allocvec(self)
            .map_err(|e| SyncError::Serialization(format!("Failed to encode root message: {}", e)))
    }

    /// Decode message from bytes using postcard
    pub fn decode(bytes: &[u8]) -> SyncResult<Self> {
        postcard::from_bytes(bytes)
            .map_err(|e| SyncError::Serialization(format!("Failed to decode root message: {}", e)))
    }
}

/// Serves root pointers out of the node's root table
#[derive(Debug, Clone)]
pub struct RootProtocolHandler {
    roots: ResolutionCache,
}

impl RootProtocolHandler {
    /// Serve pointers from `roots` (own and learned)
    pub fn new(roots: ResolutionCache) -> Self {
        Self { roots }
    }

    fn answer(roots: &ResolutionCache, request: RootMessage) -> RootMessage {
        match request {
            RootMessage::GetRoot { peer, min_version } => {
                match roots.get(&peer, ROOT_PATH, min_version) {
                    Some(pointer) => RootMessage::Root { pointer },
                    None => RootMessage::NotFound,
                }
            }
            _ => RootMessage::NotFound,
        }
    }

    async fn handle_connection(connection: Connection, roots: ResolutionCache) -> SyncResult<()> {
        let remote_id = connection.remote_id();
        debug!(?remote_id, "Handling root request connection");

        let (mut send, mut recv) = connection
            .accept_bi()
            .await
            .map_err(|e| SyncError::Network(format!("Failed to accept bi stream: {}", e)))?;

        let request_bytes = recv
            .read_to_end(MAX_MESSAGE_SIZE)
            .await
            .map_err(|e| SyncError::Network(format!("Failed to read request: {}", e)))?;

        let request = RootMessage::decode(&request_bytes)?;
        let response = Self::answer(&roots, request).encode()?;

        send.write_all(&response)
            .await
            .map_err(|e| SyncError::Network(format!("Failed to write response: {}", e)))?;
        send.finish()
            .map_err(|e| SyncError::Network(format!("Failed to finish stream: {}", e)))?;

        debug!(?remote_id, response_size = response.len(), "Root request handled");
        Ok(())
    }
}

impl ProtocolHandler for RootProtocolHandler {
    fn accept(
        &self,
        conn: Connection,
    ) -> impl std::future::Future<Output = Result<(), iroh::protocol::AcceptError>> + Send {
        let roots = self.roots.clone();

        async move {
            if let Err(e) = Self::handle_connection(conn, roots).await {
                error!(error = ?e, "Failed to handle root connection");
                return Err(iroh::protocol::AcceptError::from_err(e));
            }
            Ok(())
        }
    }
}

/// Ask `host` for `peer`'s root.
///
/// The returned pointer is unverified; callers check its signature.
pub async fn request_root(
    endpoint: &Endpoint,
    host: EndpointId,
    peer: PeerId,
    min_version: u64,
) -> SyncResult<Option<RootPointer>> {
    let connection = endpoint
        .connect(host, ROOT_ALPN)
        .await
        .map_err(|e| SyncError::Network(format!("Failed to connect to {}: {}", host, e)))?;

    let (mut send, mut recv) = connection
        .open_bi()
        .await
        .map_err(|e| SyncError::Network(format!("Failed to open stream: {}", e)))?;

    let request = RootMessage::GetRoot { peer, min_version }.encode()?;
    send.write_all(&request)
        .await
        .map_err(|e| SyncError::Network(format!("Failed to send request: {}", e)))?;
    send.finish()
        .map_err(|e| SyncError::Network(format!("Failed to finish stream: {}", e)))?;

    let response_bytes = recv
        .read_to_end(MAX_MESSAGE_SIZE)
        .await
        .map_err(|e| SyncError::Network(format!("Failed to read response: {}", e)))?;

    match RootMessage::decode(&response_bytes)? {
        RootMessage::Root { pointer } => Ok(Some(pointer)),
        RootMessage::NotFound => Ok(None),
        other => Err(SyncError::ValidationFailure(format!(
            "Unexpected root response: {:?}",
            other
        ))),
    }
}
