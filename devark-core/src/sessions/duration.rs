//! Session duration accounting
//!
//! Sessions have no explicit end marker, so duration is derived from
//! consecutive message gaps: short gaps count as active work, long gaps are
//! idle time excluded from the total.

use crate::types::DurationStats;
use chrono::{DateTime, Utc};

/// Gaps longer than this are idle and excluded from duration.
const ACTIVE_GAP_MAX_SECS: i64 = 15 * 60;

/// Total duration never exceeds 8 hours.
const DURATION_CAP_SECS: i64 = 8 * 60 * 60;

/// Compute active duration from an ordered list of timestamps.
///
/// Rules per consecutive pair:
/// - gap ≤ 0 seconds: ignored entirely
/// - 0 < gap ≤ 15 minutes: active, added to duration
/// - gap > 15 minutes: idle, duration unchanged
///
/// Empty or single-item input returns zeros.
pub fn calculate_duration(timestamps: &[DateTime<Utc>]) -> DurationStats {
    let mut stats = DurationStats::default();
    if timestamps.len() < 2 {
        return stats;
    }

    for pair in timestamps.windows(2) {
        let gap = pair[1].signed_duration_since(pair[0]).num_seconds();
        if gap <= 0 {
            continue;
        }
        if gap <= ACTIVE_GAP_MAX_SECS {
            stats.duration_seconds += gap;
            stats.active_gaps += 1;
        } else {
            stats.idle_gaps += 1;
        }
    }

    stats.duration_seconds = stats.duration_seconds.min(DURATION_CAP_SECS);
    stats
}
