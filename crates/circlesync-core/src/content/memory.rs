//! In-process content network
//!
//! Every node created from one [`MemoryNetwork`] shares a simulated network:
//!
//! - `store` writes to the node's own blob set
//! - `get` checks the node itself, then any online node holding the blob, then
//!   the network-wide provided set
//! - `provide` copies blobs into the provided set, so they stay reachable while
//!   their origin is offline
//! - roots live in a network-wide table that keeps the highest version
//!
//! Fault injection (offline nodes, dropped or tampered blobs, failing stores
//! and publishes, forced roots) lets tests exercise the failure paths of both
//! pipelines. Per-hash fetch counts show what a pipeline downloaded.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::{ContentStore, RootPointer};
use crate::error::{SyncError, SyncResult};
use crate::types::{BlobHash, PeerId};

#[derive(Debug, Default)]
struct NodeState {
    blobs: HashMap<BlobHash, Vec<u8>>,
    offline: bool,
    failing_stores: u32,
    failing_publishes: u32,
    fail_publish: bool,
}

#[derive(Debug, Default)]
struct NetworkState {
    nodes: HashMap<PeerId, NodeState>,
    provided: HashMap<BlobHash, Vec<u8>>,
    roots: HashMap<PeerId, RootPointer>,
    dropped: HashSet<BlobHash>,
    fetches: HashMap<BlobHash, u64>,
    publish_count: u64,
}

/// Shared simulated network
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Content store handle for a node, registering it if needed
    pub fn node(&self, peer: PeerId) -> MemoryContentStore {
        self.state.lock().nodes.entry(peer).or_default();
        MemoryContentStore {
            network: self.clone(),
            peer,
        }
    }

    /// Take a node off the network (its unprovided blobs become unreachable)
    pub fn set_offline(&self, peer: &PeerId, offline: bool) {
        self.state.lock().nodes.entry(*peer).or_default().offline = offline;
    }

    /// Make a blob unreachable everywhere except for later re-stores
    pub fn drop_blob(&self, hash: &BlobHash) {
        let mut state = self.state.lock();
        for node in state.nodes.values_mut() {
            node.blobs.remove(hash);
        }
        state.provided.remove(hash);
        state.dropped.insert(*hash);
    }

    /// Make the next `count` stores by `peer` fail
    pub fn fail_next_stores(&self, peer: &PeerId, count: u32) {
        self.state.lock().nodes.entry(*peer).or_default().failing_stores = count;
    }

    /// Serve `bytes` under `hash` wherever it is held (a host returning
    /// corrupted content)
    pub fn tamper_blob(&self, hash: &BlobHash, bytes: Vec<u8>) {
        let mut state = self.state.lock();
        for node in state.nodes.values_mut() {
            if let Some(held) = node.blobs.get_mut(hash) {
                *held = bytes.clone();
            }
        }
        if let Some(held) = state.provided.get_mut(hash) {
            *held = bytes;
        }
    }

    /// Make the next `count` root publications by `peer` fail
    pub fn fail_next_publishes(&self, peer: &PeerId, count: u32) {
        self.state.lock().nodes.entry(*peer).or_default().failing_publishes = count;
    }

    /// Make root publication by `peer` fail until cleared
    pub fn fail_publish(&self, peer: &PeerId, fail: bool) {
        self.state.lock().nodes.entry(*peer).or_default().fail_publish = fail;
    }

    /// Replace a peer's root regardless of version (simulates a replayed
    /// or stale announcement)
    pub fn force_root(&self, pointer: RootPointer) {
        self.state.lock().roots.insert(pointer.peer, pointer);
    }

    /// Currently resolvable root of a peer
    pub fn root_of(&self, peer: &PeerId) -> Option<RootPointer> {
        self.state.lock().roots.get(peer).cloned()
    }

    /// Number of successful root publications across the network
    pub fn publish_count(&self) -> u64 {
        self.state.lock().publish_count
    }

    /// Times any node asked for `hash`
    pub fn fetch_count(&self, hash: &BlobHash) -> u64 {
        self.state.lock().fetches.get(hash).copied().unwrap_or(0)
    }

    /// Number of blobs a node holds
    pub fn blob_count(&self, peer: &PeerId) -> usize {
        self.state
            .lock()
            .nodes
            .get(peer)
            .map(|n| n.blobs.len())
            .unwrap_or(0)
    }
}

/// A node's view of a [`MemoryNetwork`]
#[derive(Debug, Clone)]
pub struct MemoryContentStore {
    network: MemoryNetwork,
    peer: PeerId,
}

impl MemoryContentStore {
    /// The peer this store belongs to
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// The shared network
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    fn check_online(state: &NetworkState, peer: &PeerId) -> SyncResult<()> {
        match state.nodes.get(peer) {
            Some(node) if node.offline => Err(SyncError::Network(format!("{} is offline", peer))),
            _ => Ok(()),
        }
    }
}

impl ContentStore for MemoryContentStore {
    async fn store(&self, bytes: Vec<u8>) -> SyncResult<BlobHash> {
        let mut state = self.network.state.lock();
        let node = state.nodes.entry(self.peer).or_default();
        if node.failing_stores > 0 {
            node.failing_stores -= 1;
            return Err(SyncError::Network("injected store failure".to_string()));
        }
        let hash = BlobHash::of(&bytes);
        node.blobs.insert(hash, bytes);
        state.dropped.remove(&hash);
        debug!(peer = %self.peer, %hash, "Stored blob");
        Ok(hash)
    }

    async fn get(&self, hash: BlobHash) -> SyncResult<Option<Vec<u8>>> {
        let mut state = self.network.state.lock();
        *state.fetches.entry(hash).or_default() += 1;
        if let Some(bytes) = state.nodes.get(&self.peer).and_then(|n| n.blobs.get(&hash)) {
            return Ok(Some(bytes.clone()));
        }
        Self::check_online(&state, &self.peer)?;
        if state.dropped.contains(&hash) {
            return Ok(None);
        }

        let remote = state
            .nodes
            .iter()
            .filter(|(_, node)| !node.offline)
            .find_map(|(_, node)| node.blobs.get(&hash))
            .or_else(|| state.provided.get(&hash));
        Ok(remote.cloned())
    }

    async fn has(&self, hash: BlobHash) -> SyncResult<bool> {
        let state = self.network.state.lock();
        Ok(state
            .nodes
            .get(&self.peer)
            .is_some_and(|n| n.blobs.contains_key(&hash)))
    }

    async fn publish_root(&self, pointer: RootPointer) -> SyncResult<()> {
        let mut state = self.network.state.lock();
        Self::check_online(&state, &self.peer)?;
        let node = state.nodes.entry(self.peer).or_default();
        if node.failing_publishes > 0 {
            node.failing_publishes -= 1;
            return Err(SyncError::Network("injected publish failure".to_string()));
        }
        if node.fail_publish {
            return Err(SyncError::Network("injected publish failure".to_string()));
        }
        if pointer.peer != self.peer {
            return Err(SyncError::InvalidOperation(format!(
                "{} cannot publish a root for {}",
                self.peer, pointer.peer
            )));
        }
        let newer = state
            .roots
            .get(&self.peer)
            .map_or(true, |existing| existing.version < pointer.version);
        if newer {
            debug!(peer = %self.peer, version = pointer.version, hash = %pointer.hash, "Published root");
            state.roots.insert(self.peer, pointer);
            state.publish_count += 1;
        }
        Ok(())
    }

    async fn resolve_root(&self, peer: PeerId, min_version: u64) -> SyncResult<Option<RootPointer>> {
        let state = self.network.state.lock();
        Self::check_online(&state, &self.peer)?;
        Ok(state
            .roots
            .get(&peer)
            .filter(|p| p.version >= min_version)
            .cloned())
    }

    async fn provide(&self, hashes: Vec<BlobHash>) -> SyncResult<()> {
        let mut state = self.network.state.lock();
        Self::check_online(&state, &self.peer)?;
        let copies: Vec<(BlobHash, Vec<u8>)> = match state.nodes.get(&self.peer) {
            Some(node) => hashes
                .iter()
                .filter_map(|h| node.blobs.get(h).map(|b| (*h, b.clone())))
                .collect(),
            None => Vec::new(),
        };
        debug!(peer = %self.peer, count = copies.len(), "Provided blobs");
        state.provided.extend(copies);
        Ok(())
    }
}
