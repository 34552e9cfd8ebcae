//! Trust scoring for node selection.
//!
//! Trust blends a node's self-reported capability manifest with observed
//! behavior: the manifest contribution decays as live samples accumulate,
//! stake commitments add a bounded bonus, and sustained performance moves
//! the score in either direction.

use crate::health::NodeHealth;
use crate::proto::NodeManifest;

/// Starting point before any signal exists.
pub const BASE_TRUST: f64 = 50.0;
/// Samples over which manifest self-reports fade to zero weight.
pub const SELF_REPORT_DECAY_SAMPLES: f64 = 20.0;
/// Committed stake units worth one trust point.
pub const STAKE_UNITS_PER_POINT: u64 = 100;
/// Upper bound of the stake contribution.
pub const STAKE_SCORE_CAP: f64 = 20.0;
/// Samples required before the performance bonus applies.
pub const PERFORMANCE_MIN_SAMPLES: u64 = 10;
/// Samples required before the reliability penalty applies.
pub const RELIABILITY_MIN_SAMPLES: u64 = 5;
/// Upper bound of the combined failure penalty.
pub const FAILURE_PENALTY_CAP: f64 = 30.0;

fn band(value: u32, thresholds: [u32; 4]) -> f64 {
    let mut score = 0.0;
    for threshold in thresholds {
        if value >= threshold {
            score += 1.0;
        }
    }
    score
}

/// Bucketed manifest score in `0..=20`: four points per capability band.
pub fn manifest_score(manifest: &NodeManifest) -> f64 {
    band(manifest.cpu_cores, [4, 8, 16, 32])
        + band(manifest.ram_gb, [16, 32, 64, 128])
        + band(manifest.disk_gb, [128, 512, 1024, 2048])
        + band(manifest.net_mbps, [100, 500, 1000, 10_000])
        + band(manifest.gpu_vram_gb, [8, 12, 24, 48])
}

/// Blended trust score, clamped to `0..=100`.
pub fn trust_score(
    manifest: Option<&NodeManifest>,
    health: Option<&NodeHealth>,
    staked_units: u64,
) -> f64 {
    let health = health.copied().unwrap_or_default();
    let total = health.total();

    let decay = (1.0 - total as f64 / SELF_REPORT_DECAY_SAMPLES).max(0.0);
    let manifest_part = manifest.map(manifest_score).unwrap_or(0.0) * decay;

    let stake_part = ((staked_units / STAKE_UNITS_PER_POINT) as f64).min(STAKE_SCORE_CAP);

    let performance_bonus = if total >= PERFORMANCE_MIN_SAMPLES {
        (((health.success_rate() - 0.9) * 100.0).round()).clamp(-10.0, 10.0)
    } else {
        0.0
    };

    let reliability_penalty = if total >= RELIABILITY_MIN_SAMPLES {
        ((1.0 - health.success_rate()) * 40.0).round()
    } else {
        0.0
    };
    let streak_penalty = health.consecutive_failures as f64 * 5.0;
    let failure_penalty = (reliability_penalty + streak_penalty).min(FAILURE_PENALTY_CAP);

    (BASE_TRUST + manifest_part + stake_part + performance_bonus - failure_penalty)
        .clamp(0.0, 100.0)
}
