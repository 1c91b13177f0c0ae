//! # Retry Pacing
//!
//! One pacing type for the three retry schedules of the runtime:
//!
//! ```text
//! ┌──────────────────┬──────────┬──────────┬──────────────────┐
//! │ Schedule         │ Floor    │ Cap      │ Additive jitter  │
//! ├──────────────────┼──────────┼──────────┼──────────────────┤
//! │ MCS connect      │ 0.5s     │ 60s      │ +10% .. +20%     │
//! │ Registration     │ 1s       │ 30s      │ +0%  .. +10%     │
//! │ Supervisor       │ 1s       │ 60s      │ +0%  .. +10%     │
//! └──────────────────┴──────────┴──────────┴──────────────────┘
//! ```
//!
//! The doubling itself comes from [`ExponentialBackoff`] with its own
//! randomization disabled; jitter is added on top so the base schedule stays
//! exact and observable.

use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use rand::Rng;

use crate::config::{McsSettings, RegistrationSettings, SupervisorSettings};

/// A capped, doubling schedule with additive jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// First delay.
    pub initial: Duration,
    /// Largest base delay.
    pub max: Duration,
    /// Lower bound of the added jitter, as a fraction of the base delay.
    pub jitter_min: f64,
    /// Upper bound of the added jitter, as a fraction of the base delay.
    pub jitter_max: f64,
}

impl RetryPolicy {
    /// Creates a policy without jitter.
    pub fn new(initial: Duration, max: Duration) -> Self {
        RetryPolicy {
            initial,
            max: max.max(initial),
            jitter_min: 0.0,
            jitter_max: 0.0,
        }
    }

    /// Sets the jitter range (fractions of the base delay).
    pub fn with_jitter(mut self, min: f64, max: f64) -> Self {
        self.jitter_min = min.max(0.0);
        self.jitter_max = max.max(self.jitter_min);
        self
    }

    /// MCS connect pacing.
    pub fn connect(settings: &McsSettings) -> Self {
        RetryPolicy::new(
            Duration::from_millis(settings.connect_initial_backoff_ms),
            Duration::from_secs(settings.connect_max_backoff_secs),
        )
        .with_jitter(0.10, 0.20)
    }

    /// Pacing between attempts of one registration call.
    pub fn registration(settings: &RegistrationSettings) -> Self {
        RetryPolicy::new(
            Duration::from_millis(settings.initial_backoff_ms),
            Duration::from_secs(settings.max_backoff_secs),
        )
        .with_jitter(0.0, 0.10)
    }

    /// Pacing between supervisor rounds.
    pub fn supervisor(settings: &SupervisorSettings) -> Self {
        RetryPolicy::new(
            Duration::from_millis(settings.initial_backoff_ms),
            Duration::from_secs(settings.max_backoff_secs),
        )
        .with_jitter(0.0, 0.10)
    }

    /// Starts a fresh schedule.
    pub fn backoff(&self) -> RetryBackoff {
        RetryBackoff {
            policy: *self,
            inner: self.exponential(),
        }
    }

    fn exponential(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial,
            current_interval: self.initial,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: self.max,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// Running state of one schedule.
#[derive(Debug)]
pub struct RetryBackoff {
    policy: RetryPolicy,
    inner: ExponentialBackoff,
}

impl RetryBackoff {
    /// Base delay the next call to [`next_delay`](Self::next_delay) starts from.
    pub fn current_base(&self) -> Duration {
        self.inner.current_interval
    }

    /// Returns the next delay (base + jitter) and doubles the base.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.inner.next_backoff().unwrap_or(self.policy.max);
        base + self.jitter(base)
    }

    /// Back to the floor.
    pub fn reset(&mut self) {
        self.inner.reset();
    }

    fn jitter(&self, base: Duration) -> Duration {
        let (min, max) = (self.policy.jitter_min, self.policy.jitter_max);
        if max <= 0.0 {
            return Duration::ZERO;
        }
        let fraction = if max > min {
            rand::thread_rng().gen_range(min..=max)
        } else {
            min
        };
        base.mul_f64(fraction)
    }
}
