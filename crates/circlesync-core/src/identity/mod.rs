//! Identity module for CircleSync
//!
//! ## Overview
//!
//! - **Keypair**: Ed25519 signing key whose public half is the [`PeerId`](crate::types::PeerId)
//! - **Key agreement**: X25519 over the same key material, used for per-peer derived keys
//! - **SignedRecord**: the signed envelope every published record travels in
//!
//! ## Example
//!
//! ```rust
//! use circlesync_core::identity::{Keypair, SignedRecord};
//!
//! let keypair = Keypair::generate();
//! let record = SignedRecord::sign("hello".to_string(), &keypair).unwrap();
//! let bytes = record.to_bytes().unwrap();
//!
//! let opened = SignedRecord::<String>::open(&bytes, &keypair.peer_id()).unwrap();
//! assert_eq!(opened.body, "hello");
//! ```

mod keypair;
mod signed;

pub use keypair::{verify_signature, Keypair, SIGNATURE_LENGTH};
pub use signed::SignedRecord;
