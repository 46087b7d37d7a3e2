// SPDX-License-Identifier: MIT OR Apache-2.0

//! Backoff strategies for spacing out retry attempts.
//!
//! A strategy is an immutable value mapping an attempt number (starting at 1
//! for the first try) to a wait duration. Strategies are cheap to clone and
//! safe to share between concurrent callers.
//!
//! # Example
//!
//! ```
//! use resilient_api_rs::runtime::{BackoffStrategy, ExponentialBackoff};
//! use std::time::Duration;
//!
//! let backoff = ExponentialBackoff::new(Duration::from_millis(100))
//!     .with_max_delay(Duration::from_secs(5))
//!     .with_jitter(false);
//!
//! assert_eq!(backoff.delay(1), Duration::from_millis(100));
//! assert_eq!(backoff.delay(3), Duration::from_millis(400));
//! ```

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Defines a backoff strategy for retry delays.
pub trait BackoffStrategy: Clone + Send + Sync + 'static {
    /// Calculate the delay to wait after the given attempt failed.
    ///
    /// # Arguments
    /// * `attempt` - The attempt that just failed (1-indexed)
    fn delay(&self, attempt: u32) -> Duration;

    /// Upper bound for any value returned by [`delay`](Self::delay).
    fn max_delay(&self) -> Duration;
}

// =============================================================================
// Jitter
// =============================================================================

/// Source of uniform samples in `[0.0, 1.0)` used to randomize delays.
pub trait JitterSource: Send + Sync + fmt::Debug {
    /// Draw the next sample.
    fn sample(&self) -> f64;
}

/// Jitter drawn from the thread-local generator.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRngJitter;

impl JitterSource for ThreadRngJitter {
    fn sample(&self) -> f64 {
        rand::random::<f64>()
    }
}

/// Deterministic jitter from a seeded generator.
#[derive(Debug)]
pub struct SeededJitter {
    rng: Mutex<StdRng>,
}

impl SeededJitter {
    /// Create a jitter source that replays the same sequence for a seed.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl JitterSource for SeededJitter {
    fn sample(&self) -> f64 {
        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen::<f64>()
    }
}

/// Jitter that always returns the same sample.
#[derive(Debug, Clone, Copy)]
pub struct ConstantJitter(pub f64);

impl JitterSource for ConstantJitter {
    fn sample(&self) -> f64 {
        self.0.clamp(0.0, 1.0 - f64::EPSILON)
    }
}

// =============================================================================
// No Backoff
// =============================================================================

/// No delay between retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackoff;

impl NoBackoff {
    /// Create a new no-backoff strategy.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl BackoffStrategy for NoBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }

    fn max_delay(&self) -> Duration {
        Duration::ZERO
    }
}

// =============================================================================
// Fixed Backoff
// =============================================================================

/// Fixed delay between retries.
#[derive(Debug, Clone, Copy)]
pub struct FixedBackoff {
    delay: Duration,
}

impl FixedBackoff {
    /// Create a new fixed backoff strategy.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// Create a fixed backoff with delay in milliseconds.
    #[must_use]
    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }

    /// Create a fixed backoff with delay in seconds.
    #[must_use]
    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }
}

impl Default for FixedBackoff {
    fn default() -> Self {
        Self::from_secs(2)
    }
}

impl BackoffStrategy for FixedBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        self.delay
    }

    fn max_delay(&self) -> Duration {
        self.delay
    }
}

// =============================================================================
// Linear Backoff
// =============================================================================

/// Linear backoff: `initial + increment * (attempt - 1)`, capped.
#[derive(Debug, Clone, Copy)]
pub struct LinearBackoff {
    initial_delay: Duration,
    increment: Duration,
    max_delay: Duration,
}

impl LinearBackoff {
    /// Create a new linear backoff strategy.
    #[must_use]
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            increment: initial_delay,
            max_delay: Duration::from_secs(60),
        }
    }

    /// Set the increment for each retry.
    #[must_use]
    pub fn with_increment(mut self, increment: Duration) -> Self {
        self.increment = increment;
        self
    }

    /// Set the maximum delay cap.
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }
}

impl Default for LinearBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1)).with_increment(Duration::from_secs(2))
    }
}

impl BackoffStrategy for LinearBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        self.increment
            .checked_mul(attempt.saturating_sub(1))
            .and_then(|step| self.initial_delay.checked_add(step))
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn max_delay(&self) -> Duration {
        self.max_delay
    }
}

// =============================================================================
// Exponential Backoff
// =============================================================================

/// Exponential backoff: `min(initial * multiplier^(attempt - 1), max)`.
///
/// With jitter enabled the capped delay is scaled by a uniform factor in
/// `[0.5, 1.5)` and capped again, so concurrent callers spread out without
/// ever exceeding `max_delay`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
    source: Arc<dyn JitterSource>,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff strategy.
    #[must_use]
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
            source: Arc::new(ThreadRngJitter),
        }
    }

    /// Set the maximum delay cap.
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Set the multiplier for exponential growth.
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Replace the random source used for jitter.
    #[must_use]
    pub fn with_jitter_source(mut self, source: impl JitterSource + 'static) -> Self {
        self.source = Arc::new(source);
        self
    }

    /// The capped delay before jitter is applied.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let raw = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        self.clamp_secs(raw)
    }

    fn clamp_secs(&self, secs: f64) -> Duration {
        if secs.is_nan() || secs <= 0.0 {
            return Duration::ZERO;
        }
        if secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter {
            return base;
        }
        let factor = 0.5 + self.source.sample();
        self.clamp_secs(base.as_secs_f64() * factor)
    }

    fn max_delay(&self) -> Duration {
        self.max_delay
    }
}

// =============================================================================
// Runtime-selected strategy
// =============================================================================

/// A backoff strategy chosen at runtime, e.g. from a configuration file.
#[derive(Debug, Clone)]
pub enum Backoff {
    /// No delay.
    None(NoBackoff),
    /// Constant delay.
    Fixed(FixedBackoff),
    /// Linearly growing delay.
    Linear(LinearBackoff),
    /// Exponentially growing delay with optional jitter.
    Exponential(ExponentialBackoff),
}

impl Backoff {
    /// Look up a strategy by name with its stock parameters.
    ///
    /// Recognised names are `none`, `fixed` (2s), `linear` (1s, +2s per
    /// attempt) and `exponential` (1s doubling, capped at 60s, jittered).
    /// Anything else falls back to `exponential`.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "none" => Backoff::None(NoBackoff),
            "fixed" => Backoff::Fixed(FixedBackoff::default()),
            "linear" => Backoff::Linear(LinearBackoff::default()),
            _ => Backoff::Exponential(ExponentialBackoff::default()),
        }
    }

    /// Strategy name as accepted by [`Backoff::from_name`].
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Backoff::None(_) => "none",
            Backoff::Fixed(_) => "fixed",
            Backoff::Linear(_) => "linear",
            Backoff::Exponential(_) => "exponential",
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential(
            ExponentialBackoff::new(Duration::from_secs(1)).with_max_delay(Duration::from_secs(30)),
        )
    }
}

impl BackoffStrategy for Backoff {
    fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::None(b) => b.delay(attempt),
            Backoff::Fixed(b) => b.delay(attempt),
            Backoff::Linear(b) => b.delay(attempt),
            Backoff::Exponential(b) => b.delay(attempt),
        }
    }

    fn max_delay(&self) -> Duration {
        match self {
            Backoff::None(b) => b.max_delay(),
            Backoff::Fixed(b) => b.max_delay(),
            Backoff::Linear(b) => b.max_delay(),
            Backoff::Exponential(b) => b.max_delay(),
        }
    }
}

impl From<FixedBackoff> for Backoff {
    fn from(b: FixedBackoff) -> Self {
        Backoff::Fixed(b)
    }
}

impl From<LinearBackoff> for Backoff {
    fn from(b: LinearBackoff) -> Self {
        Backoff::Linear(b)
    }
}

impl From<ExponentialBackoff> for Backoff {
    fn from(b: ExponentialBackoff) -> Self {
        Backoff::Exponential(b)
    }
}

impl From<NoBackoff> for Backoff {
    fn from(b: NoBackoff) -> Self {
        Backoff::None(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_backoff() {
        let backoff = NoBackoff::new();
        assert_eq!(backoff.delay(1), Duration::ZERO);
        assert_eq!(backoff.delay(100), Duration::ZERO);
    }

    #[test]
    fn test_fixed_backoff() {
        let backoff = FixedBackoff::from_millis(100);
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(5), Duration::from_millis(100));
        assert_eq!(backoff.delay(100), Duration::from_millis(100));
    }

    #[test]
    fn test_linear_backoff() {
        let backoff = LinearBackoff::new(Duration::from_millis(100))
            .with_increment(Duration::from_millis(50))
            .with_max_delay(Duration::from_millis(500));

        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(150));
        assert_eq!(backoff.delay(3), Duration::from_millis(200));
        assert_eq!(backoff.delay(11), Duration::from_millis(500)); // Capped
        assert_eq!(backoff.delay(u32::MAX), Duration::from_millis(500));
    }

    #[test]
    fn test_attempt_zero_treated_as_first() {
        let linear = LinearBackoff::new(Duration::from_millis(100));
        assert_eq!(linear.delay(0), linear.delay(1));

        let exp = ExponentialBackoff::new(Duration::from_millis(100)).with_jitter(false);
        assert_eq!(exp.delay(0), exp.delay(1));
    }

    #[test]
    fn test_exponential_backoff() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(10))
            .with_jitter(false);

        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
    }

    #[test]
    fn test_exponential_keeps_sub_millisecond_precision() {
        let backoff = ExponentialBackoff::new(Duration::from_micros(500))
            .with_multiplier(2.0)
            .with_jitter(false);

        assert_eq!(backoff.delay(1), Duration::from_micros(500));
        assert_eq!(backoff.delay(2), Duration::from_millis(1));
        assert_eq!(backoff.delay(3), Duration::from_millis(2));

        let flat = ExponentialBackoff::new(Duration::from_micros(1500))
            .with_multiplier(1.0)
            .with_jitter(false);
        assert_eq!(flat.delay(4), Duration::from_micros(1500));
    }

    #[test]
    fn test_exponential_backoff_cap() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(500))
            .with_jitter(false);

        assert_eq!(backoff.delay(6), Duration::from_millis(500));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_millis(500));
    }

    #[test]
    fn test_exponential_base_is_non_decreasing() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(10))
            .with_multiplier(3.0)
            .with_max_delay(Duration::from_secs(20));

        let mut previous = Duration::ZERO;
        for attempt in 1..40 {
            let current = backoff.base_delay(attempt);
            assert!(current >= previous, "attempt {attempt} decreased");
            previous = current;
        }
        assert_eq!(previous, Duration::from_secs(20));
    }

    #[test]
    fn test_jitter_range() {
        let low = ExponentialBackoff::new(Duration::from_millis(400))
            .with_jitter_source(ConstantJitter(0.0));
        let high = ExponentialBackoff::new(Duration::from_millis(400))
            .with_jitter_source(ConstantJitter(0.999));

        assert_eq!(low.delay(1), Duration::from_millis(200));
        assert!(high.delay(1) < Duration::from_millis(600));
        assert!(high.delay(1) >= Duration::from_millis(599));
    }

    #[test]
    fn test_jitter_never_exceeds_max() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(300))
            .with_jitter_source(ConstantJitter(0.9));

        for attempt in 1..20 {
            assert!(backoff.delay(attempt) <= Duration::from_millis(300));
        }
    }

    #[test]
    fn test_seeded_jitter_is_deterministic() {
        let a = ExponentialBackoff::new(Duration::from_millis(100))
            .with_jitter_source(SeededJitter::new(42));
        let b = ExponentialBackoff::new(Duration::from_millis(100))
            .with_jitter_source(SeededJitter::new(42));

        let first: Vec<_> = (1..8).map(|n| a.delay(n)).collect();
        let second: Vec<_> = (1..8).map(|n| b.delay(n)).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_all_strategies_bounded_by_max() {
        let strategies = [
            Backoff::from_name("none"),
            Backoff::from_name("fixed"),
            Backoff::from_name("linear"),
            Backoff::from_name("exponential"),
            Backoff::default(),
        ];

        for strategy in &strategies {
            for attempt in 1..64 {
                let delay = strategy.delay(attempt);
                assert!(
                    delay <= strategy.max_delay(),
                    "{} exceeded max at attempt {attempt}",
                    strategy.name()
                );
            }
        }
    }

    #[test]
    fn test_backoff_from_name() {
        assert_eq!(Backoff::from_name("fixed").name(), "fixed");
        assert_eq!(Backoff::from_name(" Linear ").name(), "linear");
        assert_eq!(Backoff::from_name("exponential").name(), "exponential");
        assert_eq!(Backoff::from_name("bogus").name(), "exponential");

        assert_eq!(Backoff::from_name("fixed").delay(3), Duration::from_secs(2));
        assert_eq!(Backoff::from_name("linear").delay(3), Duration::from_secs(5));
    }
}
