//! Retry schedules for recovering from transient failures

use rand::Rng;
use std::{iter::Iterator, time::Duration};

/// Schedule of delays between consecutive attempts of a failing operation
///
/// Every streak of consecutive failures obtains a fresh [`schedule`](RetryPolicy::schedule).
/// Once the returned iterator is exhausted, the caller is expected to give up.
pub trait RetryPolicy: Send + Sync {
    /// Creates a new sequence of delays, starting at the first retry
    fn schedule(&self) -> Box<dyn Iterator<Item = Duration> + Send>;
}

/// Retries at a fixed interval, optionally limited to a number of attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstantBackoff {
    interval: Duration,
    limit: Option<u32>,
}

impl ConstantBackoff {
    /// Creates an unlimited schedule with the given interval
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            limit: None,
        }
    }

    /// Stops retrying after `limit` attempts
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

impl RetryPolicy for ConstantBackoff {
    fn schedule(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        let delays = std::iter::repeat(self.interval);

        match self.limit {
            Some(limit) => Box::new(delays.take(limit as usize)),
            None => Box::new(delays),
        }
    }
}

/// Exponential backoff iterator
///
/// This struct implements the iterator trait and returns monotonically increasing values until a specified limit of iterations, specified by the `limit` field, is reached.
/// Each element in the Iterator is the previous element multiplied by the `multiplier` property, capped by an optional `ceiling`.
#[derive(Debug, Clone)]
pub struct Backoff {
    retries: u32,
    limit: u32,
    multiplier: u32,
    initial: Duration,
    current: Duration,
    ceiling: Option<Duration>,
}

impl Backoff {
    /// Creates a new instance from raw parts
    pub fn new(initial: Duration, multiplier: u32, limit: u32) -> Self {
        Self {
            retries: 0,
            limit,
            multiplier,
            initial,
            current: initial,
            ceiling: None,
        }
    }

    /// Caps every yielded delay at the given maximum
    pub fn with_ceiling(mut self, ceiling: Duration) -> Self {
        self.ceiling = Some(ceiling);
        self
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(25), 2, 13)
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if self.retries >= self.limit {
            return None;
        }

        self.retries += 1;

        // Saturates instead of overflowing, long schedules end up at the ceiling or Duration::MAX
        let next = self
            .current
            .checked_mul(self.multiplier)
            .unwrap_or(Duration::MAX);

        self.current = match self.ceiling {
            Some(ceiling) => next.min(ceiling),
            None => next,
        };

        Some(self.current)
    }
}

impl RetryPolicy for Backoff {
    fn schedule(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        let mut fresh = self.clone();
        fresh.retries = 0;
        fresh.current = fresh.initial;
        Box::new(fresh)
    }
}

/// Randomizes the delays of another policy by up to `ratio` in either direction
///
/// Prevents a fleet of subscribers that failed at the same time from hammering the backend in lockstep.
#[derive(Debug, Clone)]
pub struct Jitter<P> {
    inner: P,
    ratio: f64,
}

impl<P: RetryPolicy> Jitter<P> {
    /// Wraps a policy, the ratio is clamped to `0.0..=1.0`
    pub fn new(inner: P, ratio: f64) -> Self {
        Self {
            inner,
            ratio: ratio.clamp(0.0, 1.0),
        }
    }
}

impl<P: RetryPolicy> RetryPolicy for Jitter<P> {
    fn schedule(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        let ratio = self.ratio;

        Box::new(self.inner.schedule().map(move |delay| {
            if ratio == 0.0 {
                return delay;
            }

            let factor = rand::thread_rng().gen_range((1.0 - ratio)..=(1.0 + ratio));
            delay.mul_f64(factor)
        }))
    }
}
