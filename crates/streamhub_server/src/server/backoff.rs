#![forbid(unsafe_code)]

use std::time::Duration;

use rand::Rng;

use crate::config::ConfigError;

/// Exponential reconnect backoff with optional symmetric jitter.
///
/// The un-jittered delay for attempt `n` is `min(initial × 2^n, max)`. Jitter never
/// feeds back into later attempts; every attempt derives its base from `n` alone.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
	pub initial_delay: Duration,
	pub max_delay: Duration,
	/// `-1` retries forever.
	pub max_attempts: i64,
	/// Fraction in `[0, 1]`; the scheduled delay is drawn from `[d(1-j), d(1+j)]`.
	pub jitter_percent: f64,
	/// Continuous CONNECTED time after which the backoff resets.
	pub stable_reset: Duration,
}

impl Default for ReconnectPolicy {
	fn default() -> Self {
		Self {
			initial_delay: Duration::from_millis(1_000),
			max_delay: Duration::from_millis(60_000),
			max_attempts: -1,
			jitter_percent: 0.2,
			stable_reset: Duration::from_millis(60_000),
		}
	}
}

impl ReconnectPolicy {
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.initial_delay.is_zero() {
			return Err(ConfigError::invalid("reconnect.initial_delay_ms", "must be > 0"));
		}
		if self.max_delay < self.initial_delay {
			return Err(ConfigError::invalid(
				"reconnect.max_delay_ms",
				"must be >= reconnect.initial_delay_ms",
			));
		}
		if self.max_attempts < -1 {
			return Err(ConfigError::invalid("reconnect.max_attempts", "must be >= -1"));
		}
		if !(0.0..=1.0).contains(&self.jitter_percent) {
			return Err(ConfigError::invalid("reconnect.jitter_percent", "must be within [0, 1]"));
		}
		if self.stable_reset.is_zero() {
			return Err(ConfigError::invalid("reconnect.stable_reset_ms", "must be > 0"));
		}
		Ok(())
	}

	/// Un-jittered delay for `attempt`.
	pub fn delay(&self, attempt: u32) -> Duration {
		let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
		self.initial_delay
			.checked_mul(factor)
			.unwrap_or(self.max_delay)
			.min(self.max_delay)
	}

	/// Sample the delay actually scheduled for a base `delay`.
	pub fn jittered(&self, delay: Duration) -> Duration {
		self.jittered_with(delay, &mut rand::rng())
	}

	pub fn jittered_with<R: Rng + ?Sized>(&self, delay: Duration, rng: &mut R) -> Duration {
		let j = self.jitter_percent;
		if j <= 0.0 || delay.is_zero() {
			return delay;
		}

		let ms = delay.as_secs_f64() * 1_000.0;
		let lo = (ms * (1.0 - j)).max(0.0);
		let hi = ms * (1.0 + j);
		Duration::from_secs_f64(rng.random_range(lo..=hi) / 1_000.0)
	}

	/// Whether `attempt` failures exceed the configured bound.
	pub fn exhausted(&self, attempt: u32) -> bool {
		self.max_attempts >= 0 && i64::from(attempt) > self.max_attempts
	}
}
