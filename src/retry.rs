//! Milestone-throttled retry logging.
//!
//! Reconnect loops retry at their normal cadence, but their log lines are
//! throttled on absolute time milestones from the first failure, so a
//! device left unplugged overnight produces a handful of lines instead of
//! thousands. Milestone rule: an interval larger than the previous
//! milestone is absolute, otherwise it is added to it; the last interval
//! repeats indefinitely.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Default milestones: 2s, 10s, 1min, 10min, 1hr, 1day from first failure.
pub const DEFAULT_MILESTONES_SECS: &[u64] = &[2, 10, 60, 600, 3600, 86400];

struct Tracker {
    first_failure: Instant,
    next_log: Duration,
    interval_index: usize,
    attempts: u64,
}

/// Tracks retry loops by key and decides when a warning is worth a line.
pub struct RetryLog {
    intervals: Vec<Duration>,
    trackers: Mutex<HashMap<String, Tracker>>,
}

impl Default for RetryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryLog {
    pub fn new() -> Self {
        Self::with_milestones(
            DEFAULT_MILESTONES_SECS
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
        )
    }

    pub fn with_milestones(intervals: Vec<Duration>) -> Self {
        let intervals = if intervals.is_empty() {
            vec![Duration::from_secs(2)]
        } else {
            intervals
        };
        Self {
            intervals,
            trackers: Mutex::new(HashMap::new()),
        }
    }

    /// Record one attempt for `key`; true when a log line is due.
    /// The first failure always logs.
    pub fn should_log(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut trackers = self.trackers.lock();

        let tracker = match trackers.get_mut(key) {
            Some(t) => t,
            None => {
                trackers.insert(
                    key.to_string(),
                    Tracker {
                        first_failure: now,
                        next_log: self.intervals[0],
                        interval_index: 0,
                        attempts: 1,
                    },
                );
                return true;
            }
        };

        tracker.attempts += 1;
        let elapsed = now.duration_since(tracker.first_failure);
        if elapsed < tracker.next_log {
            return false;
        }

        let prev = tracker.next_log;
        tracker.interval_index += 1;
        let idx = tracker.interval_index.min(self.intervals.len() - 1);
        let interval = self.intervals[idx];
        tracker.next_log = if interval > prev { interval } else { prev + interval };
        true
    }

    /// Forget a key; call on successful reconnection so the next outage
    /// starts logging from the first milestone again.
    pub fn reset(&self, key: &str) {
        self.trackers.lock().remove(key);
    }

    pub fn attempts(&self, key: &str) -> u64 {
        self.trackers.lock().get(key).map(|t| t.attempts).unwrap_or(0)
    }

    /// Suffix for retry warnings, e.g. `(retry #120, next log at ~10m)`.
    pub fn describe(&self, key: &str) -> String {
        let trackers = self.trackers.lock();
        match trackers.get(key) {
            Some(t) if t.interval_index > 0 => format!(
                "(retry #{}, next log at ~{})",
                t.attempts,
                format_duration(t.next_log)
            ),
            Some(t) => format!("(retry #{})", t.attempts),
            None => String::new(),
        }
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86400 {
        format!("{}h", secs / 3600)
    } else {
        format!("{}d", secs / 86400)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn first_failure_always_logs() {
        let log = RetryLog::new();
        assert!(log.should_log("midi"));
        assert!(!log.should_log("midi"));
        // Independent keys track independently.
        assert!(log.should_log("hid"));
    }

    #[test]
    fn milestones_throttle_then_fire() {
        let log = RetryLog::with_milestones(vec![
            Duration::from_millis(30),
            Duration::from_millis(30),
        ]);
        assert!(log.should_log("x"));
        assert!(!log.should_log("x"));
        sleep(Duration::from_millis(40));
        assert!(log.should_log("x")); // first milestone passed
        assert!(!log.should_log("x")); // next milestone is 30+30=60ms
        sleep(Duration::from_millis(40));
        assert!(log.should_log("x"));
    }

    #[test]
    fn reset_restarts_the_schedule() {
        let log = RetryLog::new();
        assert!(log.should_log("x"));
        assert_eq!(log.attempts("x"), 1);
        log.reset("x");
        assert_eq!(log.attempts("x"), 0);
        assert!(log.should_log("x"));
    }

    #[test]
    fn describe_reports_attempts() {
        let log = RetryLog::new();
        log.should_log("x");
        log.should_log("x");
        assert_eq!(log.describe("x"), "(retry #2)");
        assert_eq!(log.describe("missing"), "");
    }

    #[test]
    fn format_duration_units() {
        assert_eq!(format_duration(Duration::from_secs(45)), "45s");
        assert_eq!(format_duration(Duration::from_secs(600)), "10m");
        assert_eq!(format_duration(Duration::from_secs(7200)), "2h");
        assert_eq!(format_duration(Duration::from_secs(172800)), "2d");
    }
}
