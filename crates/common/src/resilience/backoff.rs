//! Exponential backoff with symmetric jitter
//!
//! A [`BackoffPolicy`] is a pure attempt-number → delay function. The base
//! delay grows exponentially up to a cap; jitter then perturbs it either up
//! or down by a uniformly drawn fraction so that many clients retrying the
//! same failing dependency do not synchronize into retry storms.
//!
//! Jitter is driven by an injectable random source: production callers use
//! [`BackoffPolicy::delay`] (thread RNG), tests use
//! [`BackoffPolicy::delay_with_rng`] with a seeded RNG for reproducible
//! sequences.

use std::time::Duration;

use rand::Rng;

use super::ConfigError;

/// Cap on the exponent so `factor^attempt` cannot overflow even when callers
/// configure very large attempt budgets.
pub const MAX_BACKOFF_EXPONENT: u32 = 30;

/// Attempt-number → delay policy with exponential growth and jitter.
///
/// The computed delay is always within `[0, max_delay]`: the exponential
/// curve is capped at `max_delay` before jitter, and the jittered result is
/// clamped back into that range afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay for attempt 0, before any growth
    pub initial_delay: Duration,
    /// Upper bound on the delay regardless of attempt number
    pub max_delay: Duration,
    /// Multiplier applied per attempt; must be >= 1.0
    pub factor: f64,
    /// Maximum jitter as a fraction of the base delay; must be in [0, 1]
    pub jitter_fraction: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
            jitter_fraction: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy builder seeded with the defaults.
    pub fn builder() -> BackoffPolicyBuilder {
        BackoffPolicyBuilder::new()
    }

    /// Validate the policy parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.factor < 1.0 {
            return Err(ConfigError::Invalid {
                message: "backoff factor must be at least 1.0".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(ConfigError::Invalid {
                message: "jitter_fraction must be within [0, 1]".to_string(),
            });
        }
        Ok(())
    }

    /// Compute the un-jittered delay for the given attempt.
    ///
    /// `min(max_delay, initial_delay * factor^attempt)` with the exponent
    /// clamped at [`MAX_BACKOFF_EXPONENT`].
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(MAX_BACKOFF_EXPONENT);
        let scaled = self.initial_delay.as_secs_f64() * self.factor.powi(exponent as i32);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Compute the jittered delay for the given attempt using the thread RNG.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_rng(attempt, &mut rand::thread_rng())
    }

    /// Compute the jittered delay with a caller-supplied random source.
    ///
    /// Given a seeded RNG, repeated calls with identical inputs produce
    /// identical outputs, which is what the retry tests rely on.
    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter_fraction <= 0.0 || base.is_zero() {
            return base;
        }

        let fraction = rng.gen_range(0.0..=self.jitter_fraction);
        let offset = base.as_secs_f64() * fraction;
        let jittered = if rng.gen_bool(0.5) {
            base.as_secs_f64() + offset
        } else {
            base.as_secs_f64() - offset
        };

        Duration::from_secs_f64(jittered.clamp(0.0, self.max_delay.as_secs_f64()))
    }
}

/// Builder for [`BackoffPolicy`].
#[derive(Debug, Default)]
pub struct BackoffPolicyBuilder {
    policy: BackoffPolicy,
}

impl BackoffPolicyBuilder {
    pub fn new() -> Self {
        Self { policy: BackoffPolicy::default() }
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    pub fn factor(mut self, factor: f64) -> Self {
        self.policy.factor = factor;
        self
    }

    pub fn jitter_fraction(mut self, fraction: f64) -> Self {
        self.policy.jitter_fraction = fraction;
        self
    }

    /// Disable jitter entirely; delays become fully deterministic.
    pub fn no_jitter(mut self) -> Self {
        self.policy.jitter_fraction = 0.0;
        self
    }

    pub fn build(self) -> Result<BackoffPolicy, ConfigError> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}
