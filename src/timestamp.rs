use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::ops::{Add, Sub};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch (1970-01-01T00:00:00Z).
///
/// Every `ts`, `expiresAtMs`, and `lastHeartbeatMs` field on the wire uses this
/// type. Serialized as a plain JSON number so the canonical signing bytes of an
/// envelope are identical across implementations.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct UnixMillis(pub i64);

impl UnixMillis {
    /// Current wall-clock time.
    pub fn now() -> Self {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        UnixMillis(ms)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// Absolute distance to `other` in milliseconds.
    pub fn abs_diff(&self, other: UnixMillis) -> i64 {
        (self.0 - other.0).abs()
    }

    /// True when `self` lies strictly before `other`.
    pub fn is_before(&self, other: UnixMillis) -> bool {
        self.0 < other.0
    }
}

impl Add<i64> for UnixMillis {
    type Output = Self;

    fn add(self, rhs: i64) -> Self::Output {
        UnixMillis(self.0 + rhs)
    }
}

impl Sub<i64> for UnixMillis {
    type Output = Self;

    fn sub(self, rhs: i64) -> Self::Output {
        UnixMillis(self.0 - rhs)
    }
}

impl Sub for UnixMillis {
    type Output = i64;

    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}

impl Display for UnixMillis {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
