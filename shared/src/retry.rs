use std::time::Duration;

use rand::Rng;

pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 60_000;
pub const DEFAULT_MAX_RETRIES: u32 = 10;
pub const JITTER_MIN: f64 = 0.8;
pub const JITTER_MAX: f64 = 1.2;

/// Exponential backoff with multiplicative jitter for queued replays.
///
/// `retry_count` is the number of failed replays so far, already incremented for the
/// failure being scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
    max_retries: u32,
}

impl BackoffPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64, max_retries: u32) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            max_retries,
        }
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// `min(max, base * 2^retry_count)` before jitter.
    pub fn nominal_delay_ms(&self, retry_count: u32) -> u64 {
        let shift = retry_count.min(32);
        let multiplier = 1_u64 << shift;
        self.base_delay_ms
            .saturating_mul(multiplier)
            .min(self.max_delay_ms)
    }

    /// Nominal delay scaled by `factor`, clamped into the jitter band.
    pub fn delay_with_factor(&self, retry_count: u32, factor: f64) -> Duration {
        let factor = factor.clamp(JITTER_MIN, JITTER_MAX);
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let ms = (self.nominal_delay_ms(retry_count) as f64 * factor).round() as u64;
        Duration::from_millis(ms)
    }

    pub fn jittered_delay(&self, retry_count: u32) -> Duration {
        let factor = rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX);
        self.delay_with_factor(retry_count, factor)
    }

    /// True once a record has failed as often as the policy allows.
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_BASE_DELAY_MS,
            DEFAULT_MAX_DELAY_MS,
            DEFAULT_MAX_RETRIES,
        )
    }
}
