//! Long-poll cursors.
//!
//! A cursor is a coarse interval counter: `floor((now - epoch) / interval)`
//! for a fixed reference instant and 20-second intervals. Its job is to
//! permanently desynchronise lock-step polling clients sitting behind a
//! caching intermediary: a client that presents the current (or a future)
//! cursor gets it bumped by a random whole-interval jitter, so the herd
//! spreads out instead of collapsing onto the same cache key forever.

use chrono::{DateTime, Utc};
use rand::Rng;

/// Reference instant: 2024-10-09T00:00:00Z, in milliseconds.
pub const CURSOR_EPOCH_MS: i64 = 1_728_432_000_000;

/// Interval width in milliseconds.
pub const CURSOR_INTERVAL_MS: i64 = 20_000;

/// Jitter upper bound: one hour, expressed in whole intervals.
pub const MAX_JITTER_INTERVALS: i64 = 3_600_000 / CURSOR_INTERVAL_MS;

/// The interval counter for `now`.
pub fn calculate_cursor(now: DateTime<Utc>) -> i64 {
    (now.timestamp_millis() - CURSOR_EPOCH_MS) / CURSOR_INTERVAL_MS
}

/// Pick the cursor to hand back to a long-poll client.
///
/// Absent, malformed, or behind-current cursors get the current value. A
/// cursor equal to or ahead of current (a sign of interval collision under
/// high fanout) gets the client's own value plus a jitter of at least one
/// interval.
pub fn generate_response_cursor(client: Option<&str>, now: DateTime<Utc>) -> String {
    let current = calculate_cursor(now);
    match client.and_then(|c| c.trim().parse::<i64>().ok()) {
        Some(cursor) if cursor >= current => {
            let jitter = rand::thread_rng().gen_range(1..=MAX_JITTER_INTERVALS);
            (cursor + jitter).to_string()
        }
        _ => current.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn cursor_is_interval_count_since_epoch() {
        let t = DateTime::from_timestamp_millis(CURSOR_EPOCH_MS + 3 * CURSOR_INTERVAL_MS + 1)
            .unwrap();
        assert_eq!(calculate_cursor(t), 3);
    }

    #[test]
    fn missing_or_malformed_cursor_returns_current() {
        let current = calculate_cursor(now());
        assert_eq!(
            generate_response_cursor(None, now()),
            current.to_string()
        );
        assert_eq!(
            generate_response_cursor(Some("garbage"), now()),
            current.to_string()
        );
    }

    #[test]
    fn behind_cursor_returns_current() {
        let current = calculate_cursor(now());
        let behind = (current - 10).to_string();
        assert_eq!(
            generate_response_cursor(Some(&behind), now()),
            current.to_string()
        );
    }

    #[test]
    fn colliding_cursor_jitters_strictly_forward() {
        let current = calculate_cursor(now());
        for _ in 0..100 {
            let jittered: i64 = generate_response_cursor(Some(&current.to_string()), now())
                .parse()
                .unwrap();
            assert!(jittered > current, "must move at least one interval ahead");
            assert!(jittered <= current + MAX_JITTER_INTERVALS);
        }
    }

    #[test]
    fn ahead_cursor_jitters_from_the_client_value() {
        let ahead = calculate_cursor(now()) + 50;
        let jittered: i64 = generate_response_cursor(Some(&ahead.to_string()), now())
            .parse()
            .unwrap();
        assert!(jittered > ahead);
    }
}
