//! CircleSync Core Library
//!
//! Encrypted manifest synchronization for a peer-to-peer social network.
//!
//! ## Overview
//!
//! Each user publishes a signed, versioned root pointer to a content-addressed
//! store. The root names one encrypted manifest per audience peer; manifests
//! name circle manifests, which name posts and reactions. Followers resolve the
//! root, decrypt whatever they hold keys for, and download only what changed.
//!
//! ## Core Principles
//!
//! - **Local-first**: everything is authored into a local redb store first
//! - **Circles**: every circle has its own rotating symmetric key
//! - **Per-peer envelopes**: user manifests and actions use X25519-derived keys
//! - **Monotonic versions**: a peer's watermark only moves forward
//!
//! ## Quick Start
//!
//! ```ignore
//! use circlesync_core::Node;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let node = Node::open_in("~/.circlesync/data").await?;
//!     node.set_name("alice")?;
//!
//!     let friends = node.create_circle("friends")?;
//!     node.add_member(&friends.id, bob)?;
//!     node.post(&friends.id, "hello")?;
//!     node.publish().await?;
//!
//!     node.follow(bob).await?;
//!     node.sync().await?;
//!     for post in node.feed(20)? {
//!         println!("{}: {}", post.author.short(), post.text);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod content;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod manifest;
pub mod node;
pub mod publish;
pub mod service;
pub mod storage;
pub mod sync;
pub mod types;

// Re-exports
pub use config::{EngineConfig, IdentityVisibility};
pub use content::{ContentStore, IrohContentStore, MemoryContentStore, MemoryNetwork, StoreClient};
pub use crypto::{CipherKind, KeyManager, SymmetricKey};
pub use error::{SyncError, SyncResult};
pub use identity::Keypair;
pub use node::{load_or_create_keypair, Node};
pub use publish::{PublishEngine, PublishReport};
pub use service::SyncService;
pub use storage::{LocalStore, Storage};
pub use sync::{PeerSyncOutcome, PeerSyncState, SyncEngine, SyncEvent, SyncReport, SyncStats};
pub use types::*;
