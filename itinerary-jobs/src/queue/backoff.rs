//! Delay before a failed task is delivered again.
//!
//! # Example
//!
//! ```
//! # use itinerary_jobs::queue::backoff::Backoff;
//! # use chrono::TimeDelta;
//! let backoff = Backoff::exponential(TimeDelta::seconds(2)).with_max(TimeDelta::seconds(10));
//!
//! assert_eq!(backoff.delay(1), TimeDelta::seconds(2));
//! assert_eq!(backoff.delay(2), TimeDelta::seconds(4));
//! assert_eq!(backoff.delay(3), TimeDelta::seconds(8));
//! assert_eq!(backoff.delay(4), TimeDelta::seconds(10));
//! ```
use chrono::TimeDelta;
use rand::Rng;

/// Exponential backoff, doubling from `base` with every attempt, optionally capped and
/// randomised by a proportion of the delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base: TimeDelta,
    max: Option<TimeDelta>,
    jitter: f64,
}

/// Four seconds doubling up to an hour, with 10% jitter.
pub const DEFAULT_BACKOFF: Backoff = Backoff::exponential(TimeDelta::seconds(4))
    .with_max(TimeDelta::hours(1))
    .with_jitter(0.1);

impl Default for Backoff {
    fn default() -> Self {
        DEFAULT_BACKOFF
    }
}

impl Backoff {
    pub const fn exponential(base: TimeDelta) -> Self {
        Self {
            base,
            max: None,
            jitter: 0.0,
        }
    }

    pub const fn with_max(self, max: TimeDelta) -> Self {
        Self {
            max: Some(max),
            ..self
        }
    }

    /// Randomise delays by up to `proportion` of their length in either direction.
    pub const fn with_jitter(self, proportion: f64) -> Self {
        Self {
            jitter: proportion,
            ..self
        }
    }

    /// The delay without jitter after the given (one based) attempt failed.
    pub fn delay(&self, attempt: u16) -> TimeDelta {
        let exponent = u32::from(attempt.saturating_sub(1)).min(62);
        let seconds = self
            .base
            .num_seconds()
            .checked_mul(1_i64 << exponent)
            .unwrap_or(i64::MAX);
        let delay = TimeDelta::seconds(seconds.min(i64::MAX / 1_000));
        match self.max {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    /// The delay after the given attempt failed, with jitter applied.
    pub fn backoff(&self, attempt: u16) -> TimeDelta {
        let delay = self.delay(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        let spread = (delay.num_milliseconds() as f64 * self.jitter) as i64;
        if spread == 0 {
            return delay;
        }
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        delay
            .checked_add(&TimeDelta::milliseconds(offset))
            .unwrap_or(delay)
    }
}
