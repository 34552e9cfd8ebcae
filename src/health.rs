//! Per-node health accounting and cooldown.
//!
//! Any forwarding failure (transport error, non-2xx, bad response envelope,
//! signature mismatch) counts against the node; crossing the streak
//! threshold puts it into cooldown with a linearly growing hold. A success
//! resets the streak and clears the cooldown.

use dashmap::DashMap;
use serde::Serialize;

use crate::timestamp::UnixMillis;

/// Consecutive failures before a node enters cooldown.
pub const FAILURE_STREAK_THRESHOLD: u32 = 3;
/// Base cooldown hold.
pub const BASE_COOLDOWN_MS: i64 = 30_000;
/// Cooldown growth cap, in multiples of the base hold.
pub const COOLDOWN_MULTIPLIER_CAP: u32 = 10;

/// Success/failure tallies for one node.
///
/// `successes + failures` is the total sample count.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHealth {
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_ms: Option<UnixMillis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_ms: Option<UnixMillis>,
}

impl NodeHealth {
    pub fn total(&self) -> u64 {
        self.successes + self.failures
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 1.0;
        }
        self.successes as f64 / total as f64
    }
}

/// Health ledger and cooldown clock for all known nodes.
#[derive(Debug)]
pub struct HealthTracker {
    entries: DashMap<String, NodeHealth>,
    cooldown_until: DashMap<String, UnixMillis>,
    threshold: u32,
    base_cooldown_ms: i64,
    multiplier_cap: u32,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(FAILURE_STREAK_THRESHOLD, BASE_COOLDOWN_MS, COOLDOWN_MULTIPLIER_CAP)
    }
}

impl HealthTracker {
    pub fn new(threshold: u32, base_cooldown_ms: i64, multiplier_cap: u32) -> Self {
        HealthTracker {
            entries: DashMap::new(),
            cooldown_until: DashMap::new(),
            threshold,
            base_cooldown_ms,
            multiplier_cap,
        }
    }

    pub fn get(&self, node_id: &str) -> Option<NodeHealth> {
        self.entries.get(node_id).map(|e| *e.value())
    }

    /// Record a failed forwarding attempt. Returns the cooldown deadline if
    /// this failure pushed the node over the streak threshold.
    pub fn mark_failure(&self, node_id: &str, now: UnixMillis) -> Option<UnixMillis> {
        let mut entry = self.entries.entry(node_id.to_owned()).or_default();
        entry.failures += 1;
        entry.consecutive_failures += 1;
        entry.last_failure_ms = Some(now);

        if entry.consecutive_failures >= self.threshold {
            let multiplier = (entry.consecutive_failures - self.threshold + 1)
                .min(self.multiplier_cap);
            let until = now + self.base_cooldown_ms * multiplier as i64;
            self.cooldown_until.insert(node_id.to_owned(), until);
            Some(until)
        } else {
            None
        }
    }

    /// Record a successful round trip: reset the streak, clear cooldown.
    pub fn record_success(&self, node_id: &str, now: UnixMillis) {
        let mut entry = self.entries.entry(node_id.to_owned()).or_default();
        entry.successes += 1;
        entry.consecutive_failures = 0;
        entry.last_success_ms = Some(now);
        drop(entry);
        self.cooldown_until.remove(node_id);
    }

    pub fn in_cooldown(&self, node_id: &str, now: UnixMillis) -> bool {
        self.cooldown_until
            .get(node_id)
            .is_some_and(|until| *until.value() > now)
    }

    pub fn cooldown_deadline(&self, node_id: &str) -> Option<UnixMillis> {
        self.cooldown_until.get(node_id).map(|e| *e.value())
    }

    /// Retention sweep: drop idle health rows and expired cooldowns.
    pub fn prune(&self, now: UnixMillis, health_retention_ms: i64, cooldown_retention_ms: i64) {
        self.entries.retain(|_, h| {
            let last = h
                .last_success_ms
                .into_iter()
                .chain(h.last_failure_ms)
                .max();
            last.is_none_or(|ts| now - ts < health_retention_ms)
        });
        self.cooldown_until
            .retain(|_, until| now - *until < cooldown_retention_ms);
    }
}
