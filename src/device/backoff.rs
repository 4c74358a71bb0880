use std::time::Duration;

use anyhow::{Result, ensure};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

/// Reconnection delay schedule.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct BackoffPolicy {
    #[serde(with = "humantime_serde")]
    pub base: Duration,
    pub multiplier: f64,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Upper bound of the random delay added to each nominal step.
    #[serde(with = "humantime_serde")]
    pub jitter: Duration,
    /// Consecutive failed attempts before the link parks in `Failed`.
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl BackoffPolicy {
    const fn default_base() -> Duration {
        Duration::from_secs(2)
    }

    const fn default_max_delay() -> Duration {
        Duration::from_secs(5 * 60)
    }

    const fn default_jitter() -> Duration {
        Duration::from_secs(1)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.base > Duration::ZERO,
            "device.backoff.base must be positive"
        );
        ensure!(
            self.multiplier >= 1.0 && self.multiplier.is_finite(),
            "device.backoff.multiplier must be a finite value >= 1.0"
        );
        ensure!(
            self.max_delay >= self.base,
            "device.backoff.max-delay must be at least device.backoff.base"
        );
        if let Some(max) = self.max_attempts {
            ensure!(max > 0, "device.backoff.max-attempts must be greater than zero");
        }
        Ok(())
    }

    /// Jitter-free delay before retry number `attempt` (1-based).
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let secs = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Self::default_base(),
            multiplier: 2.0,
            max_delay: Self::default_max_delay(),
            jitter: Self::default_jitter(),
            max_attempts: Some(30),
        }
    }
}

/// Running state of one reconnection episode.
#[derive(Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempts: u32,
    /// Last delay handed out; jitter never takes the next one below it.
    last: Duration,
    rng: StdRng,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            last: Duration::ZERO,
            rng: StdRng::from_os_rng(),
        }
    }

    pub fn with_seed(policy: BackoffPolicy, seed: u64) -> Self {
        Self {
            policy,
            attempts: 0,
            last: Duration::ZERO,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Record a failed attempt and return the delay before the next one, or
    /// `None` once the attempt ceiling is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        if let Some(max) = self.policy.max_attempts {
            if self.attempts >= max {
                return None;
            }
        }
        let nominal = self.policy.nominal_delay(self.attempts);
        let jitter = if self.policy.jitter.is_zero() {
            Duration::ZERO
        } else {
            let millis = self.policy.jitter.as_millis().min(u128::from(u64::MAX)) as u64;
            Duration::from_millis(self.rng.random_range(0..=millis))
        };
        let delay = (nominal + jitter).max(self.last).min(self.policy.max_delay);
        self.last = delay;
        Some(delay)
    }

    /// Failed attempts since the last success.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.last = Duration::ZERO;
    }
}
