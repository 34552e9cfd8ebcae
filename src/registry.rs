//! The router's node registry.
//!
//! Nodes announce themselves with signed heartbeats on `/register-node`;
//! the registry upserts by `nodeId` (last writer wins) and answers the
//! active-set query used by the scheduler: heartbeat fresh within
//! [`HEARTBEAT_WINDOW_MS`] and not cooling down.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::proto::NodeDescriptor;
use crate::timestamp::UnixMillis;

/// Heartbeats older than this make a node stale.
pub const HEARTBEAT_WINDOW_MS: i64 = 30_000;

/// Registry of known worker nodes, owned by the router process.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: DashMap<String, NodeDescriptor>,
    /// Bumped on every mutation; the scheduler cache keys off it.
    generation: AtomicU64,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a node, stamping the heartbeat.
    pub fn upsert(&self, mut descriptor: NodeDescriptor, now: UnixMillis) {
        descriptor.last_heartbeat_ms = Some(now);
        self.nodes.insert(descriptor.node_id.clone(), descriptor);
        self.generation.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, node_id: &str) -> Option<NodeDescriptor> {
        self.nodes.get(node_id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, node_id: &str) -> Option<NodeDescriptor> {
        let removed = self.nodes.remove(node_id).map(|(_, v)| v);
        if removed.is_some() {
            self.generation.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Cache key for derived views of the node set.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    /// Every known node, in no particular order.
    pub fn all(&self) -> Vec<NodeDescriptor> {
        self.nodes.iter().map(|e| e.value().clone()).collect()
    }

    /// Nodes with a fresh heartbeat that are not in cooldown.
    ///
    /// Freshness is inclusive at exactly `now - HEARTBEAT_WINDOW_MS`.
    pub fn active(&self, now: UnixMillis, in_cooldown: impl Fn(&str) -> bool) -> Vec<NodeDescriptor> {
        let cutoff = now - HEARTBEAT_WINDOW_MS;
        self.nodes
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .last_heartbeat_ms
                    .is_some_and(|hb| hb >= cutoff)
            })
            .filter(|entry| !in_cooldown(entry.key()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Drop nodes whose heartbeat is older than `cutoff`.
    pub fn prune(&self, cutoff: UnixMillis) {
        let before = self.nodes.len();
        self.nodes.retain(|_, node| {
            node.last_heartbeat_ms.is_some_and(|hb| hb >= cutoff)
        });
        if self.nodes.len() != before {
            self.generation.fetch_add(1, Ordering::Relaxed);
        }
    }
}
