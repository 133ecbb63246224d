//! Publish → resolve → sync end-to-end tests
//!
//! Every node here shares one [`MemoryNetwork`], so the full pipeline runs
//! (signing, per-peer envelopes, circle keys, watermarks) without sockets.
//!
//! ## What These Tests Verify
//!
//! - A post reaches a circle member exactly once
//! - Key rotation: members read old and new generations, removed members
//!   read nothing new
//! - Stale or forged roots never move a watermark backwards
//! - One unreachable peer does not affect the others
//! - Actions (delete, introduce) and reactions travel between peers
//! - Key updates reach members that sync after the retention window
//! - Unreadable content is not downloaded again under the same keys

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use circlesync_core::content::{MemoryNetwork, RootPointer};
use circlesync_core::{
    load_or_create_keypair, now_millis, Clock, EngineConfig, LocalStore, MemoryContentStore, Node,
    PeerSyncOutcome, Post, ReactionKind, Storage,
};
use tempfile::TempDir;

const DAY: i64 = 86_400_000;

struct TestNode {
    node: Node<MemoryContentStore>,
    store: Arc<dyn LocalStore>,
    _dir: TempDir,
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        resolve_timeout_ms: 500,
        fetch_timeout_ms: 500,
        publish_timeout_ms: 500,
        fetch_retries: 2,
        publish_retries: 2,
        retry_base_delay_ms: 1,
        ..EngineConfig::default()
    }
}

fn spawn_node(network: &MemoryNetwork, name: &str) -> TestNode {
    spawn_node_with(network, name, Clock::system())
}

fn spawn_node_with(network: &MemoryNetwork, name: &str, clock: Clock) -> TestNode {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn LocalStore> = Arc::new(Storage::open_in(dir.path()).unwrap());
    let keypair = load_or_create_keypair(store.as_ref()).unwrap();
    let content = Arc::new(network.node(keypair.peer_id()));
    let node =
        Node::open_with_clock(store.clone(), content, keypair, fast_config(), clock).unwrap();
    node.set_name(name).unwrap();
    TestNode {
        node,
        store,
        _dir: dir,
    }
}

fn texts(posts: &[Post]) -> Vec<&str> {
    posts.iter().map(|p| p.text.as_str()).collect()
}

#[tokio::test]
async fn test_post_reaches_member_once() {
    let network = MemoryNetwork::new();
    // Publishing at t=10s keeps a post written at t=1s inside the window
    let alice = spawn_node_with(&network, "alice", Clock::fixed(10_000));
    let bob = spawn_node(&network, "bob");
    let alice_id = alice.node.peer_id();

    let everyone = alice.node.everyone().unwrap();
    alice.node.add_member(&everyone.id, bob.node.peer_id()).unwrap();
    let post = Post::new(alice_id, everyone.id, "hello").with_timestamp(1000);
    alice.store.save_post(&post).unwrap();

    let report = alice.node.publish().await.unwrap();
    assert_eq!(report.version, 1);
    assert_eq!(report.uploads.posts, 1);

    bob.node.follow(alice_id).await.unwrap();
    let outcome = bob.node.sync_peer(alice_id).await.unwrap();
    let PeerSyncOutcome::Synced { version, stats } = outcome else {
        panic!("expected a completed cycle, got {:?}", outcome);
    };
    assert_eq!(version, 1);
    assert_eq!(stats.posts, 1);
    assert_eq!(stats.keys_installed, 1);
    assert!(stats.identity_updated);

    let feed = bob.node.feed(10).unwrap();
    assert_eq!(feed.len(), 1);
    assert_eq!(feed[0].text, "hello");
    assert_eq!(feed[0].author, alice_id);
    assert_eq!(feed[0].timestamp, 1000);

    let record = bob.store.load_peer(&alice_id).unwrap().unwrap();
    assert_eq!(record.last_accepted_version, 1);
    assert_eq!(record.name.as_deref(), Some("alice"));
    assert_eq!(bob.node.identity(&alice_id).unwrap().unwrap().name, "alice");

    // Nothing new: no state change, no duplicates
    let again = bob.node.sync_peer(alice_id).await.unwrap();
    assert_eq!(again, PeerSyncOutcome::UpToDate { version: 1 });
    assert_eq!(bob.node.feed(10).unwrap().len(), 1);
}

#[tokio::test]
async fn test_republish_without_changes_downloads_nothing() {
    let network = MemoryNetwork::new();
    let alice = spawn_node(&network, "alice");
    let bob = spawn_node(&network, "bob");
    let alice_id = alice.node.peer_id();

    let everyone = alice.node.everyone().unwrap();
    alice.node.add_member(&everyone.id, bob.node.peer_id()).unwrap();
    alice.node.post(&everyone.id, "first").unwrap();
    alice.node.publish().await.unwrap();

    bob.node.follow(alice_id).await.unwrap();
    bob.node.sync().await.unwrap();

    let report = alice.node.publish().await.unwrap();
    assert_eq!(report.version, 2);
    assert_eq!(report.uploads.posts, 0);

    let outcome = bob.node.sync_peer(alice_id).await.unwrap();
    let stats = outcome.stats().unwrap();
    assert_eq!(stats.posts, 0);
    assert_eq!(stats.manifests, 0);
    assert_eq!(bob.store.load_peer(&alice_id).unwrap().unwrap().last_accepted_version, 2);
}

#[tokio::test]
async fn test_rotation_keeps_history_and_excludes_removed_member() {
    let network = MemoryNetwork::new();
    let alice = spawn_node(&network, "alice");
    let bob = spawn_node(&network, "bob");
    let carol = spawn_node(&network, "carol");
    let alice_id = alice.node.peer_id();

    let friends = alice.node.create_circle("friends").unwrap();
    alice.node.add_member(&friends.id, bob.node.peer_id()).unwrap();
    alice.node.add_member(&friends.id, carol.node.peer_id()).unwrap();
    alice.node.post(&friends.id, "before").unwrap();
    alice.node.publish().await.unwrap();

    carol.node.follow(alice_id).await.unwrap();
    carol.node.sync().await.unwrap();
    assert_eq!(texts(&carol.node.feed(10).unwrap()), vec!["before"]);

    let circle = alice
        .node
        .remove_member(&friends.id, &carol.node.peer_id())
        .unwrap();
    assert_eq!(circle.key_generation, 4);
    alice.node.post(&friends.id, "after").unwrap();
    alice.node.publish().await.unwrap();

    // Bob's first sync needs generation 3 for "before" and 4 for "after"
    bob.node.follow(alice_id).await.unwrap();
    let report = bob.node.sync().await.unwrap();
    assert_eq!(report.synced(), 1);
    let mut seen = texts(&bob.node.feed(10).unwrap())
        .into_iter()
        .map(String::from)
        .collect::<Vec<_>>();
    seen.sort();
    assert_eq!(seen, vec!["after".to_string(), "before".to_string()]);

    carol.node.sync().await.unwrap();
    assert_eq!(texts(&carol.node.feed(10).unwrap()), vec!["before"]);
    assert_eq!(
        carol.store.load_peer(&alice_id).unwrap().unwrap().last_accepted_version,
        2
    );
}

#[tokio::test]
async fn test_stale_and_forged_roots_are_ignored() {
    let network = MemoryNetwork::new();
    let alice = spawn_node(&network, "alice");
    let bob = spawn_node(&network, "bob");
    let alice_id = alice.node.peer_id();

    let everyone = alice.node.everyone().unwrap();
    alice.node.add_member(&everyone.id, bob.node.peer_id()).unwrap();
    alice.node.post(&everyone.id, "one").unwrap();
    alice.node.publish().await.unwrap();
    let v1 = network.root_of(&alice_id).unwrap();

    alice.node.post(&everyone.id, "two").unwrap();
    alice.node.publish().await.unwrap();
    let v2 = network.root_of(&alice_id).unwrap();

    bob.node.follow(alice_id).await.unwrap();
    bob.node.sync().await.unwrap();
    assert_eq!(bob.store.load_peer(&alice_id).unwrap().unwrap().last_accepted_version, 2);

    network.force_root(v1);
    let outcome = bob.node.sync_peer(alice_id).await.unwrap();
    assert_eq!(outcome, PeerSyncOutcome::UpToDate { version: 2 });

    let mut forged = v2;
    forged.version = 10;
    network.force_root(forged);
    let outcome = bob.node.sync_peer(alice_id).await.unwrap();
    assert_eq!(outcome, PeerSyncOutcome::UpToDate { version: 2 });

    assert_eq!(bob.store.load_peer(&alice_id).unwrap().unwrap().last_accepted_version, 2);
    assert_eq!(bob.node.feed(10).unwrap().len(), 2);
}

#[tokio::test]
async fn test_unreachable_peer_does_not_block_others() {
    let network = MemoryNetwork::new();
    let alice = spawn_node(&network, "alice");
    let carol = spawn_node(&network, "carol");
    let bob = spawn_node(&network, "bob");
    let (alice_id, carol_id) = (alice.node.peer_id(), carol.node.peer_id());

    for author in [&alice, &carol] {
        let everyone = author.node.everyone().unwrap();
        author.node.add_member(&everyone.id, bob.node.peer_id()).unwrap();
        author.node.post(&everyone.id, "hi bob").unwrap();
        author.node.publish().await.unwrap();
    }

    let carol_root = network.root_of(&carol_id).unwrap();
    network.drop_blob(&carol_root.hash);

    bob.node.follow(alice_id).await.unwrap();
    bob.node.follow(carol_id).await.unwrap();
    let report = bob.node.sync().await.unwrap();

    assert_eq!(report.synced(), 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].0, carol_id);
    assert_eq!(bob.node.feed(10).unwrap().len(), 1);

    let carol_record = bob.store.load_peer(&carol_id).unwrap().unwrap();
    assert_eq!(carol_record.last_accepted_version, 0);
    assert!(carol_record.last_error.is_some());

    // Carol republishes and Bob catches up
    carol.node.publish().await.unwrap();
    let outcome = bob.node.sync_peer(carol_id).await.unwrap();
    assert!(matches!(outcome, PeerSyncOutcome::Synced { version: 2, .. }));
    assert!(bob.store.load_peer(&carol_id).unwrap().unwrap().last_error.is_none());
    assert_eq!(bob.node.feed(10).unwrap().len(), 2);
}

#[tokio::test]
async fn test_missing_post_keeps_watermark() {
    let network = MemoryNetwork::new();
    let alice = spawn_node(&network, "alice");
    let bob = spawn_node(&network, "bob");
    let alice_id = alice.node.peer_id();

    let everyone = alice.node.everyone().unwrap();
    alice.node.add_member(&everyone.id, bob.node.peer_id()).unwrap();
    let kept = alice.node.post(&everyone.id, "kept").unwrap();
    alice.node.post(&everyone.id, "lost").unwrap();
    alice.node.publish().await.unwrap();

    let lost = alice
        .node
        .feed(10)
        .unwrap()
        .into_iter()
        .find(|p| p.text == "lost")
        .and_then(|p| p.stored_hash)
        .unwrap();
    network.drop_blob(&lost);

    bob.node.follow(alice_id).await.unwrap();
    let outcome = bob.node.sync_peer(alice_id).await.unwrap();
    let PeerSyncOutcome::Incomplete { version, stats } = outcome else {
        panic!("expected an incomplete cycle, got {:?}", outcome);
    };
    assert_eq!(version, 1);
    assert_eq!(stats.posts, 1);
    assert_eq!(bob.store.load_peer(&alice_id).unwrap().unwrap().last_accepted_version, 0);

    // The retry does not download the stored post again
    let retry = bob.node.sync_peer(alice_id).await.unwrap();
    assert_eq!(retry.stats().unwrap().posts, 0);
    assert_eq!(texts(&bob.node.feed(10).unwrap()), vec![kept.text.as_str()]);
}

#[tokio::test]
async fn test_failed_root_publish_is_invisible_to_followers() {
    let network = MemoryNetwork::new();
    let alice = spawn_node(&network, "alice");
    let bob = spawn_node(&network, "bob");
    let alice_id = alice.node.peer_id();

    let everyone = alice.node.everyone().unwrap();
    alice.node.add_member(&everyone.id, bob.node.peer_id()).unwrap();
    alice.node.post(&everyone.id, "eventually").unwrap();

    network.fail_publish(&alice_id, true);
    assert!(alice.node.publish().await.is_err());

    bob.node.follow(alice_id).await.unwrap();
    let outcome = bob.node.sync_peer(alice_id).await.unwrap();
    assert_eq!(outcome, PeerSyncOutcome::UpToDate { version: 0 });
    assert!(bob.node.feed(10).unwrap().is_empty());

    network.fail_publish(&alice_id, false);
    assert_eq!(alice.node.publish().await.unwrap().version, 2);
    let outcome = bob.node.sync_peer(alice_id).await.unwrap();
    assert!(matches!(outcome, PeerSyncOutcome::Synced { version: 2, .. }));
    assert_eq!(texts(&bob.node.feed(10).unwrap()), vec!["eventually"]);
}

#[tokio::test]
async fn test_delete_propagates_to_members() {
    let network = MemoryNetwork::new();
    let alice = spawn_node(&network, "alice");
    let bob = spawn_node(&network, "bob");
    let alice_id = alice.node.peer_id();

    let everyone = alice.node.everyone().unwrap();
    alice.node.add_member(&everyone.id, bob.node.peer_id()).unwrap();
    alice.node.post(&everyone.id, "oops").unwrap();
    alice.node.publish().await.unwrap();

    bob.node.follow(alice_id).await.unwrap();
    bob.node.sync().await.unwrap();
    let hash = bob.node.feed(10).unwrap()[0].stored_hash.unwrap();

    alice.node.delete_post(&hash).unwrap();
    alice.node.publish().await.unwrap();

    let outcome = bob.node.sync_peer(alice_id).await.unwrap();
    assert_eq!(outcome.stats().unwrap().deletions, 1);
    assert!(bob.node.feed(10).unwrap().is_empty());
}

#[tokio::test]
async fn test_reaction_and_introduction_reach_peers() {
    let network = MemoryNetwork::new();
    let alice = spawn_node(&network, "alice");
    let bob = spawn_node(&network, "bob");
    let carol = spawn_node(&network, "carol");
    let (alice_id, bob_id) = (alice.node.peer_id(), bob.node.peer_id());

    let alice_everyone = alice.node.everyone().unwrap();
    alice.node.add_member(&alice_everyone.id, bob_id).unwrap();
    alice.node.post(&alice_everyone.id, "thoughts?").unwrap();
    alice
        .node
        .introduce(bob_id, carol.node.peer_id(), "carol")
        .unwrap();
    alice.node.publish().await.unwrap();

    bob.node.follow(alice_id).await.unwrap();
    bob.node.sync().await.unwrap();

    let intros = bob.node.introductions().unwrap();
    assert_eq!(intros.len(), 1);
    assert_eq!(intros[0].peer, carol.node.peer_id());
    assert_eq!(intros[0].from, alice_id);

    let post_hash = bob.node.feed(10).unwrap()[0].stored_hash.unwrap();
    let bob_everyone = bob.node.everyone().unwrap();
    bob.node.add_member(&bob_everyone.id, alice_id).unwrap();
    bob.node
        .react(post_hash, ReactionKind::Reaction, "👍", &bob_everyone.id)
        .unwrap();
    bob.node.publish().await.unwrap();

    alice.node.follow(bob_id).await.unwrap();
    alice.node.sync().await.unwrap();

    let reactions = alice.node.reactions_for(&post_hash).unwrap();
    assert_eq!(reactions.len(), 1);
    assert_eq!(reactions[0].author, bob_id);
    assert_eq!(reactions[0].value, "👍");
}

#[tokio::test]
async fn test_attachments_travel_with_posts() {
    let network = MemoryNetwork::new();
    let alice = spawn_node(&network, "alice");
    let bob = spawn_node(&network, "bob");
    let alice_id = alice.node.peer_id();

    let everyone = alice.node.everyone().unwrap();
    alice.node.add_member(&everyone.id, bob.node.peer_id()).unwrap();
    let image = vec![0xAB; 4096];
    let post = alice
        .node
        .post_with(
            &everyone.id,
            "look",
            None,
            vec![("photo.png".to_string(), image.clone())],
        )
        .unwrap();
    alice.node.publish().await.unwrap();

    bob.node.follow(alice_id).await.unwrap();
    let outcome = bob.node.sync_peer(alice_id).await.unwrap();
    assert_eq!(outcome.stats().unwrap().attachments, 1);

    let content_hash = post.files[0].content_hash;
    assert_eq!(bob.node.attachment(&content_hash).unwrap(), Some(image));
}

#[tokio::test]
async fn test_key_update_reaches_member_after_window() {
    let network = MemoryNetwork::new();
    let start = now_millis();
    let time = Arc::new(AtomicI64::new(start));
    let reading = time.clone();
    let alice = spawn_node_with(
        &network,
        "alice",
        Clock::from_fn(move || reading.load(Ordering::SeqCst)),
    );
    let bob = spawn_node(&network, "bob");
    let alice_id = alice.node.peer_id();

    let friends = alice.node.create_circle("friends").unwrap();
    alice.node.add_member(&friends.id, bob.node.peer_id()).unwrap();
    alice.node.post(&friends.id, "early").unwrap();
    alice.node.publish().await.unwrap();

    // Bob stays away for longer than the retention window
    let later = start + 40 * DAY;
    time.store(later, Ordering::SeqCst);
    let late = Post::new(alice_id, friends.id, "late").with_timestamp(later);
    alice.store.save_post(&late).unwrap();
    alice.node.publish().await.unwrap();

    bob.node.follow(alice_id).await.unwrap();
    let outcome = bob.node.sync_peer(alice_id).await.unwrap();
    let PeerSyncOutcome::Synced { version, stats } = outcome else {
        panic!("expected a completed cycle, got {:?}", outcome);
    };
    assert_eq!(version, 2);
    assert_eq!(stats.keys_installed, 1);
    assert_eq!(stats.skipped, 0);
    assert_eq!(texts(&bob.node.feed(10).unwrap()), vec!["late"]);
}

#[tokio::test]
async fn test_unreadable_action_is_not_fetched_again() {
    let network = MemoryNetwork::new();
    let alice = spawn_node(&network, "alice");
    let bob = spawn_node(&network, "bob");
    let carol = spawn_node(&network, "carol");
    let (alice_id, bob_id) = (alice.node.peer_id(), bob.node.peer_id());

    alice.node.introduce(bob_id, carol.node.peer_id(), "carol").unwrap();
    alice.node.publish().await.unwrap();

    let action_hash = alice.store.outgoing_actions().unwrap()[0]
        .stored_hash
        .unwrap();
    network.tamper_blob(&action_hash, vec![0x5A; 96]);

    bob.node.follow(alice_id).await.unwrap();
    let first = bob.node.sync_peer(alice_id).await.unwrap();
    assert!(matches!(first, PeerSyncOutcome::Synced { version: 1, .. }));
    assert_eq!(first.stats().unwrap().skipped, 1);
    assert_eq!(network.fetch_count(&action_hash), 1);

    alice.node.set_name("alice again").unwrap();
    alice.node.publish().await.unwrap();

    let second = bob.node.sync_peer(alice_id).await.unwrap();
    assert!(matches!(second, PeerSyncOutcome::Synced { version: 2, .. }));
    assert_eq!(second.stats().unwrap().actions, 0);
    assert_eq!(network.fetch_count(&action_hash), 1);
    assert!(bob.node.introductions().unwrap().is_empty());
}

#[tokio::test]
async fn test_fresh_root_over_stale_manifest_is_rejected() {
    let network = MemoryNetwork::new();
    let alice = spawn_node(&network, "alice");
    let bob = spawn_node(&network, "bob");
    let alice_id = alice.node.peer_id();

    let everyone = alice.node.everyone().unwrap();
    alice.node.add_member(&everyone.id, bob.node.peer_id()).unwrap();
    alice.node.post(&everyone.id, "one").unwrap();
    alice.node.publish().await.unwrap();
    let v1 = network.root_of(&alice_id).unwrap();

    alice.node.post(&everyone.id, "two").unwrap();
    alice.node.publish().await.unwrap();

    bob.node.follow(alice_id).await.unwrap();
    bob.node.sync().await.unwrap();
    assert_eq!(bob.store.load_peer(&alice_id).unwrap().unwrap().last_accepted_version, 2);

    // A validly signed version 3 that still points at the version 1 collection
    let alice_keys = load_or_create_keypair(alice.store.as_ref()).unwrap();
    let replayed = RootPointer::sign(&alice_keys, v1.hash, 3).unwrap();
    network.force_root(replayed);

    let outcome = bob.node.sync_peer(alice_id).await.unwrap();
    assert_eq!(outcome, PeerSyncOutcome::UpToDate { version: 2 });
    let record = bob.store.load_peer(&alice_id).unwrap().unwrap();
    assert_eq!(record.last_accepted_version, 2);
    assert_eq!(bob.node.feed(10).unwrap().len(), 2);
}
