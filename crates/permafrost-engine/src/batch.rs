//! Adaptive batch sizing
//!
//! Keeps per-batch wall time near a target so the pipeline adapts to the
//! databases' current throughput without thrashing: halve when a batch runs
//! long, double when it runs short *and* came back saturated, always clamped
//! to `[min, max]`. The hard ceiling also keeps IN-list sizes safely under
//! per-command parameter limits.

use serde::Deserialize;
use std::time::Duration;

/// Bounds and target for batch-size adaptation
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchSizePolicy {
    /// Smallest batch the controller will return
    #[serde(default = "default_min")]
    pub min: u32,
    /// Largest batch the controller will return
    #[serde(default = "default_max")]
    pub max: u32,
    /// Target wall time per batch, in seconds
    #[serde(default = "default_target_seconds")]
    pub target_seconds: u64,
}

fn default_min() -> u32 {
    100
}

fn default_max() -> u32 {
    2000
}

fn default_target_seconds() -> u64 {
    20
}

impl Default for BatchSizePolicy {
    fn default() -> Self {
        Self {
            min: default_min(),
            max: default_max(),
            target_seconds: default_target_seconds(),
        }
    }
}

impl BatchSizePolicy {
    /// Target wall time per batch
    pub fn target(&self) -> Duration {
        Duration::from_secs(self.target_seconds)
    }
}

/// Next batch size given the last batch's size, row count and duration
pub fn next_batch_size(
    current: u32,
    row_count: usize,
    elapsed: Duration,
    policy: &BatchSizePolicy,
) -> u32 {
    if row_count == 0 {
        return current;
    }
    let target = policy.target();
    if elapsed > target.mul_f64(1.5) {
        return (current / 2).max(policy.min);
    }
    // Only grow on a saturated batch; a short partial batch says nothing
    // about throughput.
    if elapsed < target / 2 && row_count as u64 >= u64::from(current) {
        return current.saturating_mul(2).min(policy.max);
    }
    current
}

/// Stateful wrapper tracking the current size across a phase's loop
#[derive(Debug)]
pub struct BatchSizeController {
    policy: BatchSizePolicy,
    current: u32,
}

impl BatchSizeController {
    /// Start from `initial`, clamped into the policy's bounds
    pub fn new(initial: u32, policy: BatchSizePolicy) -> Self {
        Self {
            current: initial.clamp(policy.min, policy.max),
            policy,
        }
    }

    /// The size the next read should request
    pub fn current(&self) -> u32 {
        self.current
    }

    /// Record an observed batch and return the adjusted size
    pub fn record(&mut self, row_count: usize, elapsed: Duration) -> u32 {
        self.current = next_batch_size(self.current, row_count, elapsed, &self.policy);
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BatchSizePolicy {
        BatchSizePolicy::default()
    }

    #[test]
    fn test_defaults() {
        let p = policy();
        assert_eq!(p.min, 100);
        assert_eq!(p.max, 2000);
        assert_eq!(p.target(), Duration::from_secs(20));
    }

    #[test]
    fn test_slow_batch_halves() {
        // 45s > 1.5 x 20s
        let next = next_batch_size(800, 800, Duration::from_secs(45), &policy());
        assert_eq!(next, 400);
    }

    #[test]
    fn test_fast_saturated_batch_doubles() {
        // 5s < 20s / 2, and the batch came back full
        let next = next_batch_size(400, 400, Duration::from_secs(5), &policy());
        assert_eq!(next, 800);
    }

    #[test]
    fn test_fast_partial_batch_holds() {
        let next = next_batch_size(400, 120, Duration::from_secs(5), &policy());
        assert_eq!(next, 400);
    }

    #[test]
    fn test_on_target_holds() {
        let next = next_batch_size(500, 500, Duration::from_secs(15), &policy());
        assert_eq!(next, 500);
    }

    #[test]
    fn test_empty_batch_holds() {
        let next = next_batch_size(500, 0, Duration::from_secs(90), &policy());
        assert_eq!(next, 500);
    }

    #[test]
    fn test_bounds_respected() {
        // halving stops at min
        assert_eq!(
            next_batch_size(150, 150, Duration::from_secs(60), &policy()),
            100
        );
        // doubling stops at max
        assert_eq!(
            next_batch_size(1500, 1500, Duration::from_secs(2), &policy()),
            2000
        );
    }

    #[test]
    fn test_controller_clamps_initial_and_tracks() {
        let mut controller = BatchSizeController::new(50_000, policy());
        assert_eq!(controller.current(), 2000);

        controller.record(2000, Duration::from_secs(60));
        assert_eq!(controller.current(), 1000);

        let mut controller = BatchSizeController::new(1, policy());
        assert_eq!(controller.current(), 100);
    }

    #[test]
    fn test_sequence_stays_in_bounds() {
        let p = policy();
        let mut controller = BatchSizeController::new(800, p);
        let durations = [45_u64, 5, 5, 5, 90, 90, 90, 90, 1, 1];
        for secs in durations {
            let size = controller.current();
            let next = controller.record(size as usize, Duration::from_secs(secs));
            assert!(next >= p.min && next <= p.max);
        }
    }
}
