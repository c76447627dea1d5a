// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ingest-side flow control (§5).
//!
//! `compute_sleep` is the pure core: given the current slave-queue size
//! and the configured limits, it returns how long the caller should
//! sleep before admitting the next writeset. No flow control applies
//! below `soft_limit`; between the soft and hard limits the allowed
//! replication rate decays linearly down to `max_throttle` of normal
//! (mirrors `gcs_fc_process`'s speed/queue-size diagram); at or above
//! `hard_limit` the caller either stops forever (`max_throttle == 0`)
//! or is told to back off with [`FlowControlError::OutOfMemory`].
//!
//! [`FlowControl`] wraps the pure function with the `Instant`-driven
//! bookkeeping a caller actually needs (last-action size and time),
//! the same shape as a token-bucket rate limiter.

use std::time::{Duration, Instant};

/// `gcs_fc_hard_limit_fix` in the original: reserve a margin below the
/// nominal hard limit so the eternal-stop/`OutOfMemory` branch trips
/// before the queue is truly full, allowing for bookkeeping overhead.
pub const HARD_LIMIT_FIX: f64 = 0.9;

/// Minimum sleep worth imposing; anything shorter is rounded down to
/// "no sleep" to avoid waking the caller for negligible throttling.
const MIN_SLEEP: Duration = Duration::from_millis(1);

/// What the caller should do before admitting the next writeset.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum Sleep {
    /// No throttling; proceed immediately.
    None,
    /// Sleep for this long, then proceed.
    For(Duration),
    /// Stop admitting entirely (`max_throttle == 0.0` at the hard limit).
    Eternity,
}

/// Error from [`compute_sleep`] when flow control can no longer help.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FlowControlError {
    /// Hard limit reached and `max_throttle > 0`; the queue must be
    /// relieved by some other mechanism (the original's `-ENOMEM`).
    OutOfMemory,
}

impl std::fmt::Display for FlowControlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "flow control: slave queue hard limit exceeded")
    }
}

impl std::error::Error for FlowControlError {}

/// Pure flow-control decision (§5's contract).
///
/// `soft_limit`/`hard_limit` are absolute byte counts; `max_throttle`
/// is the fraction of normal replication speed retained at the hard
/// limit, in `[0.0, 1.0)`. `time_since_last_reset` is how long it has
/// been since the queue last crossed below the soft limit - the
/// interval the linear-decay rate is measured against.
#[must_use]
pub fn compute_sleep(
    queue_size: i64,
    hard_limit: i64,
    soft_limit: i64,
    max_throttle: f64,
    time_since_last_reset: Duration,
) -> Result<Sleep, FlowControlError> {
    let effective_hard_limit = (hard_limit as f64 * HARD_LIMIT_FIX) as i64;

    if queue_size <= soft_limit {
        return Ok(Sleep::None);
    }
    if queue_size >= effective_hard_limit {
        return if max_throttle == 0.0 { Ok(Sleep::Eternity) } else { Err(FlowControlError::OutOfMemory) };
    }

    let span = (effective_hard_limit - soft_limit).max(1) as f64;
    let fraction = (queue_size - soft_limit) as f64 / span;
    let rate_fraction = (1.0 - fraction * (1.0 - max_throttle)).max(f64::EPSILON);

    let multiplier = 1.0 / rate_fraction - 1.0;
    let sleep = time_since_last_reset.mul_f64(multiplier);

    Ok(if sleep < MIN_SLEEP { Sleep::None } else { Sleep::For(sleep) })
}

/// Stateful wrapper over [`compute_sleep`]: tracks queue size and the
/// clock needed to measure `time_since_last_reset`.
#[derive(Debug)]
pub struct FlowControl {
    hard_limit: i64,
    soft_limit: i64,
    max_throttle: f64,
    queue_size: i64,
    last_reset: Instant,
    throttling: bool,
}

impl FlowControl {
    #[must_use]
    pub fn new(config: &crate::config::FlowControlConfig) -> Self {
        Self {
            hard_limit: config.hard_limit,
            soft_limit: (config.hard_limit as f64 * config.soft_limit_fraction) as i64,
            max_throttle: config.max_throttle,
            queue_size: 0,
            last_reset: Instant::now(),
            throttling: false,
        }
    }

    /// Record a newly-queued action of `size` bytes and compute how
    /// long the caller should sleep before accepting the next one.
    ///
    /// # Errors
    /// [`FlowControlError::OutOfMemory`] once the hard limit is hit
    /// with throttling still configured to allow a residual rate.
    pub fn process(&mut self, size: i64) -> Result<Sleep, FlowControlError> {
        self.queue_size += size;
        let was_below_soft = self.queue_size - size <= self.soft_limit;
        if was_below_soft && self.queue_size > self.soft_limit {
            self.last_reset = Instant::now();
            self.throttling = true;
        }
        let elapsed = self.last_reset.elapsed();
        let decision = compute_sleep(self.queue_size, self.hard_limit, self.soft_limit, self.max_throttle, elapsed)?;
        if matches!(decision, Sleep::For(_)) {
            self.last_reset = Instant::now();
        }
        Ok(decision)
    }

    /// Reinitialize at the start of state transfer (`gcs_fc_reset`).
    pub fn reset(&mut self, queue_size: i64) {
        self.queue_size = queue_size;
        self.last_reset = Instant::now();
        self.throttling = false;
    }

    #[must_use]
    pub fn queue_size(&self) -> i64 {
        self.queue_size
    }

    #[must_use]
    pub fn is_throttling(&self) -> bool {
        self.throttling
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn below_soft_limit_never_sleeps() {
        let got = compute_sleep(50, 1000, 100, 0.1, Duration::from_secs(1)).unwrap();
        assert_eq!(got, Sleep::None);
    }

    #[test]
    fn at_hard_limit_with_zero_throttle_is_eternity() {
        let got = compute_sleep(1000, 1000, 100, 0.0, Duration::from_secs(1)).unwrap();
        assert_eq!(got, Sleep::Eternity);
    }

    #[test]
    fn at_hard_limit_with_nonzero_throttle_is_out_of_memory() {
        let err = compute_sleep(1000, 1000, 100, 0.1, Duration::from_secs(1)).unwrap_err();
        assert_eq!(err, FlowControlError::OutOfMemory);
    }

    #[test]
    fn between_limits_produces_increasing_sleep_as_queue_grows() {
        let near_soft = compute_sleep(200, 1000, 100, 0.1, Duration::from_secs(1)).unwrap();
        let near_hard = compute_sleep(850, 1000, 100, 0.1, Duration::from_secs(1)).unwrap();
        let (Sleep::For(a), Sleep::For(b)) = (near_soft, near_hard) else {
            panic!("expected both to throttle: {near_soft:?} {near_hard:?}");
        };
        assert!(b > a, "sleep should grow closer to the hard limit: {a:?} vs {b:?}");
    }

    #[test]
    fn negligible_sleep_rounds_down_to_none() {
        let got = compute_sleep(150, 1_000_000, 100, 0.99, Duration::from_millis(1)).unwrap();
        assert_eq!(got, Sleep::None);
    }

    #[test]
    fn stateful_wrapper_tracks_queue_size() {
        let cfg = crate::config::FlowControlConfig { hard_limit: 1000, soft_limit_fraction: 0.5, max_throttle: 0.1 };
        let mut fc = FlowControl::new(&cfg);
        fc.process(100).unwrap();
        assert_eq!(fc.queue_size(), 100);
        fc.process(100).unwrap();
        assert_eq!(fc.queue_size(), 200);
    }

    #[test]
    fn reset_clears_queue_size() {
        let cfg = crate::config::FlowControlConfig::default();
        let mut fc = FlowControl::new(&cfg);
        fc.process(1000).unwrap();
        fc.reset(0);
        assert_eq!(fc.queue_size(), 0);
        assert!(!fc.is_throttling());
    }
}
