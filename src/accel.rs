//! Rotation acceleration.
//!
//! Turns a raw detent delta into a rate-shaped step count: slow rotation
//! moves one unit per detent, fast rotation multiplies up to a configured
//! maximum. The multiplier is a pure function of the gap between
//! consecutive events, so a given gap always yields the same step
//! regardless of how the knob was moving before.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Acceleration curve parameters.
///
/// `steps` must be non-decreasing; gaps at or above `slow_gap_ms` map to
/// the first entry (normally 1), gaps at or below `fast_gap_ms` to the
/// last, and gaps in between index linearly into the table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccelConfig {
    #[serde(default = "default_slow_gap_ms")]
    pub slow_gap_ms: u64,
    #[serde(default = "default_fast_gap_ms")]
    pub fast_gap_ms: u64,
    #[serde(default = "default_steps")]
    pub steps: Vec<u32>,
}

fn default_slow_gap_ms() -> u64 {
    200
}

fn default_fast_gap_ms() -> u64 {
    25
}

fn default_steps() -> Vec<u32> {
    vec![1, 2, 3, 4, 6, 8, 10]
}

impl Default for AccelConfig {
    fn default() -> Self {
        Self {
            slow_gap_ms: default_slow_gap_ms(),
            fast_gap_ms: default_fast_gap_ms(),
            steps: default_steps(),
        }
    }
}

/// Per-axis acceleration state. Owned by the event pipeline, never shared.
pub struct Accelerator {
    config: AccelConfig,
    last_event: Option<Instant>,
}

impl Accelerator {
    pub fn new(config: AccelConfig) -> Self {
        let mut config = config;
        if config.fast_gap_ms >= config.slow_gap_ms {
            // Degenerate config collapses to an unaccelerated knob.
            config.fast_gap_ms = config.slow_gap_ms;
        }
        if config.steps.is_empty() {
            config.steps = vec![1];
        }
        Self {
            config,
            last_event: None,
        }
    }

    /// Rate-shape one rotation event. Deterministic given
    /// `(delta, now, last_event)`.
    pub fn step(&mut self, delta: i32, now: Instant) -> i32 {
        let gap = self
            .last_event
            .map(|last| now.saturating_duration_since(last));
        self.last_event = Some(now);

        let multiplier = match gap {
            Some(gap) => self.multiplier_for_gap(gap),
            // First event ever: nothing to measure against, take it slow.
            None => 1,
        };

        delta.saturating_mul(multiplier as i32)
    }

    /// Multiplier for a given inter-event gap. Non-increasing in `gap`.
    fn multiplier_for_gap(&self, gap: Duration) -> u32 {
        let slow = Duration::from_millis(self.config.slow_gap_ms);
        let fast = Duration::from_millis(self.config.fast_gap_ms);
        let steps = &self.config.steps;

        if gap >= slow {
            return steps[0];
        }
        if gap <= fast {
            return steps[steps.len() - 1];
        }

        let span = (slow - fast).as_secs_f64();
        let position = (slow - gap).as_secs_f64() / span;
        let index = (position * (steps.len() - 1) as f64).floor() as usize;
        steps[index.min(steps.len() - 1)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn accel() -> Accelerator {
        Accelerator::new(AccelConfig::default())
    }

    fn step_for_gap(a: &mut Accelerator, gap_ms: u64) -> i32 {
        // Feed two events `gap_ms` apart and return the second step.
        let t0 = Instant::now();
        a.last_event = Some(t0);
        a.step(1, t0 + Duration::from_millis(gap_ms))
    }

    #[test]
    fn first_event_is_single_step() {
        let mut a = accel();
        assert_eq!(a.step(1, Instant::now()), 1);
        let mut a = accel();
        assert_eq!(a.step(-1, Instant::now()), -1);
    }

    #[test]
    fn slow_rotation_never_accelerates() {
        let mut a = accel();
        assert_eq!(step_for_gap(&mut a, 200), 1);
        assert_eq!(step_for_gap(&mut a, 500), 1);
    }

    #[test]
    fn fast_rotation_hits_max_step() {
        let mut a = accel();
        assert_eq!(step_for_gap(&mut a, 5), 10);
        assert_eq!(step_for_gap(&mut a, 25), 10);
    }

    #[test]
    fn negative_deltas_scale_the_same_way() {
        let mut a = accel();
        let t0 = Instant::now();
        a.last_event = Some(t0);
        assert_eq!(a.step(-1, t0 + Duration::from_millis(5)), -10);
        assert_eq!(a.step(-2, t0 + Duration::from_millis(505)), -2);
    }

    #[test]
    fn rapid_burst_accumulates_fast_path_steps() {
        // Five detents inside 200ms total: everything after the first event
        // rides the fast part of the curve.
        let mut a = accel();
        let t0 = Instant::now();
        let mut total = 0;
        for i in 0..5 {
            total += a.step(1, t0 + Duration::from_millis(i * 40));
        }
        assert!(total >= 10, "cumulative step {total} below fast-path floor");
    }

    #[test]
    fn degenerate_config_is_flat() {
        let mut a = Accelerator::new(AccelConfig {
            slow_gap_ms: 50,
            fast_gap_ms: 100, // inverted on purpose
            steps: vec![1, 4],
        });
        assert_eq!(step_for_gap(&mut a, 10), 4);
        assert_eq!(step_for_gap(&mut a, 60), 1);
    }

    proptest! {
        /// Slower motion never yields a bigger step than faster motion.
        #[test]
        fn multiplier_non_increasing_in_gap(g1 in 0u64..1000, g2 in 0u64..1000) {
            let (fast_gap, slow_gap) = (g1.min(g2), g1.max(g2));
            let a = accel();
            let fast_mult = a.multiplier_for_gap(Duration::from_millis(fast_gap));
            let slow_mult = a.multiplier_for_gap(Duration::from_millis(slow_gap));
            prop_assert!(fast_mult >= slow_mult,
                "gap {fast_gap}ms -> {fast_mult} but gap {slow_gap}ms -> {slow_mult}");
        }

        /// A whole sequence with strictly increasing inter-event gaps
        /// produces non-increasing step sizes. The very first event has no
        /// gap (it always steps by one), so comparisons start at the second.
        #[test]
        fn increasing_gaps_never_increase_steps(gaps in proptest::collection::vec(1u64..120, 2..12)) {
            let mut a = accel();
            let mut at = Instant::now();
            let mut gap = 0u64;
            let mut last_step = None;
            a.step(1, at);
            for extra in &gaps {
                gap += *extra; // strictly increasing gaps
                at += Duration::from_millis(gap);
                let step = a.step(1, at);
                if let Some(last) = last_step {
                    prop_assert!(step <= last,
                        "step grew from {last} to {step} as gaps increased");
                }
                last_step = Some(step);
            }
        }
    }
}
