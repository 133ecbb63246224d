//! Property-based tests for ciphers, retention and manifest construction
//!
//! Uses proptest to verify the invariants the publish and sync pipelines
//! rely on.

use proptest::prelude::*;

use circlesync_core::manifest::{build_circle_manifest, filter_by_retention};
use circlesync_core::{
    BlobHash, CipherKind, Circle, ManifestEntry, PeerId, Post, SymmetricKey, Timestamp,
};

// ============================================================================
// Strategy Generators
// ============================================================================

fn cipher_strategy() -> impl Strategy<Value = CipherKind> {
    prop_oneof![
        Just(CipherKind::ChaCha20Poly1305),
        Just(CipherKind::LegacyAesCbc),
    ]
}

fn timestamps_strategy() -> impl Strategy<Value = Vec<Timestamp>> {
    prop::collection::vec(0i64..1_000_000, 0..50)
}

fn entries(timestamps: &[Timestamp]) -> Vec<ManifestEntry> {
    timestamps
        .iter()
        .enumerate()
        .map(|(i, ts)| ManifestEntry {
            hash: BlobHash::of(&(i as u64).to_le_bytes()),
            timestamp: *ts,
            author: PeerId([1; 32]),
        })
        .collect()
}

fn published_posts(circle: &Circle, timestamps: &[Timestamp]) -> Vec<Post> {
    timestamps
        .iter()
        .enumerate()
        .map(|(i, ts)| {
            let mut post = Post::new(circle.owner, circle.id, format!("post {}", i))
                .with_timestamp(*ts);
            post.stored_hash = Some(BlobHash::of(format!("blob {}", i).as_bytes()));
            post
        })
        .collect()
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    /// Any plaintext survives encryption with any cipher
    #[test]
    fn cipher_roundtrip(
        kind in cipher_strategy(),
        plaintext in prop::collection::vec(any::<u8>(), 0..4096),
    ) {
        let key = SymmetricKey::generate(kind, 1);
        let ciphertext = key.encrypt(&plaintext).unwrap();
        prop_assert_eq!(key.decrypt(&ciphertext).unwrap(), plaintext);
    }

    /// A different key never yields the original plaintext
    #[test]
    fn cipher_wrong_key_never_recovers_plaintext(
        kind in cipher_strategy(),
        plaintext in prop::collection::vec(any::<u8>(), 1..1024),
    ) {
        let key = SymmetricKey::generate(kind, 1);
        let other = SymmetricKey::generate(kind, 2);
        let ciphertext = key.encrypt(&plaintext).unwrap();
        match other.decrypt(&ciphertext) {
            Ok(recovered) => prop_assert_ne!(recovered, plaintext),
            Err(_) => {}
        }
    }

    /// Filtering twice is the same as filtering once
    #[test]
    fn retention_is_idempotent(
        timestamps in timestamps_strategy(),
        now in 0i64..2_000_000,
        window in 0i64..1_000_000,
    ) {
        let once: Vec<ManifestEntry> = filter_by_retention(entries(&timestamps), now, window);
        let twice: Vec<ManifestEntry> = filter_by_retention(once.clone(), now, window);
        prop_assert_eq!(once, twice);
    }

    /// A narrower window keeps a subset of a wider one
    #[test]
    fn retention_is_monotonic_in_window(
        timestamps in timestamps_strategy(),
        now in 0i64..2_000_000,
        narrow in 0i64..500_000,
        extra in 0i64..500_000,
    ) {
        let all = entries(&timestamps);
        let small: Vec<ManifestEntry> = filter_by_retention(all.clone(), now, narrow);
        let large: Vec<ManifestEntry> = filter_by_retention(all, now, narrow + extra);
        prop_assert!(small.len() <= large.len());
        for entry in &small {
            prop_assert!(large.contains(entry));
        }
    }

    /// Input order does not affect the built manifest
    #[test]
    fn circle_manifest_is_order_independent(
        timestamps in prop::collection::vec(0i64..1_000, 0..30),
        now in 1_000i64..2_000,
    ) {
        let circle = Circle::new(PeerId([7; 32]), "friends");
        let posts = published_posts(&circle, &timestamps);
        let mut reversed = posts.clone();
        reversed.reverse();

        let a = build_circle_manifest(&circle, &posts, &[], now, 10_000);
        let b = build_circle_manifest(&circle, &reversed, &[], now, 10_000);
        prop_assert_eq!(&a, &b);
        prop_assert!(a.posts.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
    }
}
