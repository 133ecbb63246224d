//! Manifest tree construction and parsing
//!
//! A published root is a collection from audience peer to that peer's
//! [`UserManifest`](crate::types::UserManifest), which points at
//! [`CircleManifest`](crate::types::CircleManifest)s, which point at posts
//! and reactions.

mod builder;
mod reader;
mod retention;

pub use builder::{
    build_circle_manifest, build_public_manifest, build_user_manifest, ManifestBuilder,
};
pub use reader::{
    check_attachment, parse_action, parse_circle_manifest, parse_identity, parse_post,
    parse_reaction, parse_user_manifest,
};
pub use retention::{filter_by_retention, Timestamped, DEFAULT_RETENTION_DAYS};

/// Root collection entry readable by peers outside every circle
pub const PUBLIC_ENTRY: &str = "public";
