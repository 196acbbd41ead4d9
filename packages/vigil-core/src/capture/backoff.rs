//! Restart delay computation with exponential backoff and bounded jitter.
//!
//! The randomness source is injected so tests observe deterministic delays.

use crate::config::{ChannelConfig, RandomSource};

/// Backoff parameters for one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the base delay the jitter may add or remove, in `[0, 1]`.
    pub jitter_factor: f64,
}

/// One computed restart delay with its observability breakdown.
///
/// `applied_jitter_ms` is defined as `delay_ms - base_delay_ms` so that
/// reported jitter always matches the clamped delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputedDelay {
    pub delay_ms: u64,
    pub base_delay_ms: u64,
    pub applied_jitter_ms: i64,
}

impl BackoffPolicy {
    /// Derives the policy from a channel's restart configuration.
    #[must_use]
    pub fn for_channel(config: &ChannelConfig) -> Self {
        Self {
            min_delay_ms: config.restart_delay_ms,
            max_delay_ms: config.restart_max_delay_ms,
            jitter_factor: config.restart_jitter_factor,
        }
    }

    /// Computes the delay for the given attempt (>= 1).
    #[must_use]
    pub fn delay_for(&self, attempt: u32, random: &RandomSource) -> ComputedDelay {
        let exponent = attempt.max(1) - 1;
        // Cap the exponent: past 2^32 the clamp to max_delay_ms has long
        // since taken over, and f64 powi stays finite.
        let scaled = (self.min_delay_ms as f64 * 2f64.powi(exponent.min(32) as i32)).round();
        let base_delay_ms = scaled
            .max(self.min_delay_ms as f64)
            .min(self.max_delay_ms as f64) as u64;

        let jitter_range = (base_delay_ms as f64 * self.jitter_factor).round();
        let centered = random.sample() * 2.0 - 1.0;
        let candidate = base_delay_ms as i64 + (centered * jitter_range).round() as i64;
        let delay_ms =
            candidate.clamp(self.min_delay_ms as i64, self.max_delay_ms as i64) as u64;

        ComputedDelay {
            delay_ms,
            base_delay_ms,
            applied_jitter_ms: delay_ms as i64 - base_delay_ms as i64,
        }
    }
}
