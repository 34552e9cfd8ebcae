//! Fixed-window request rate limiting.
//!
//! One limiter instance guards one admission surface: client requests on the
//! router, inbound requests on the node, and federation control messages
//! keyed by `(peerId, type)`. A counter per key resets every `window_ms`;
//! once it reaches `max`, further calls are denied until the window rolls.

use dashmap::DashMap;

use crate::timestamp::UnixMillis;

#[derive(Debug, Clone, Copy)]
struct WindowSlot {
    window_start: i64,
    count: u32,
}

/// Sliding fixed-window counter per identity.
#[derive(Debug)]
pub struct RateLimiter {
    max: u32,
    window_ms: i64,
    windows: DashMap<String, WindowSlot>,
}

impl RateLimiter {
    pub fn new(max: u32, window_ms: i64) -> Self {
        RateLimiter {
            max,
            window_ms,
            windows: DashMap::new(),
        }
    }

    /// Account one arrival for `key`; false means the caller must deny with 429.
    pub fn allow(&self, key: &str, now: UnixMillis) -> bool {
        if self.max == 0 {
            return true; // limiter disabled
        }
        let mut slot = self.windows.entry(key.to_owned()).or_insert(WindowSlot {
            window_start: now.as_i64(),
            count: 0,
        });
        if now.as_i64() - slot.window_start >= self.window_ms {
            slot.window_start = now.as_i64();
            slot.count = 0;
        }
        if slot.count >= self.max {
            return false;
        }
        slot.count += 1;
        true
    }

    /// Drop windows that ended before `now`; called from the retention loop.
    pub fn prune(&self, now: UnixMillis) {
        self.windows
            .retain(|_, slot| now.as_i64() - slot.window_start < self.window_ms);
    }
}
