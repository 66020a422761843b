//! A token-bucket rate limiter for bounding download/upload throughput.
//!
//! Mirrors [`crate::counter::ThroughputCounter`]'s testing discipline: time
//! only ever advances through an explicit `now` parameter, never through an
//! internal `Instant::now()` call, so refill behavior is deterministic and
//! unit-testable.

use std::time::Instant;

/// A classic token bucket: tokens (bytes of transfer quota) accumulate at a
/// fixed rate up to a cap, and are spent by callers wanting to send or
/// receive data.
///
/// A rate of `None` means unlimited -- [`Self::try_consume`] always succeeds
/// and [`Self::available`] reports `u64::MAX`, letting callers skip the
/// bucket machinery entirely when the user hasn't configured a cap.
#[derive(Debug)]
pub(crate) struct TokenBucket {
    /// Bytes per second the bucket refills at. `None` disables limiting.
    rate: Option<u64>,
    /// The bucket's capacity -- the maximum number of bytes that can be
    /// saved up for a burst. Equal to `rate` (a one second burst budget)
    /// unless overridden.
    capacity: u64,
    /// Current token count, in bytes.
    tokens: u64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates an unlimited bucket: every [`Self::try_consume`] call
    /// succeeds regardless of amount.
    pub fn unlimited(now: Instant) -> Self {
        Self {
            rate: None,
            capacity: 0,
            tokens: 0,
            last_refill: now,
        }
    }

    /// Creates a bucket capped at `rate` bytes/second, with a one second
    /// burst allowance.
    pub fn new(rate: u64, now: Instant) -> Self {
        Self {
            rate: Some(rate),
            capacity: rate,
            tokens: rate,
            last_refill: now,
        }
    }

    /// Refills the bucket based on elapsed time since the last refill,
    /// saturating at `capacity`. A no-op for unlimited buckets.
    fn refill(&mut self, now: Instant) {
        let rate = match self.rate {
            Some(rate) => rate,
            None => return,
        };
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        let gained = (elapsed.as_secs_f64() * rate as f64) as u64;
        self.tokens = self.tokens.saturating_add(gained).min(self.capacity);
        self.last_refill = now;
    }

    /// Attempts to spend `n` bytes of quota. Returns `true` (and debits the
    /// bucket) if enough tokens are available, `false` otherwise, in which
    /// case the caller should defer and retry later.
    pub fn try_consume(&mut self, now: Instant, n: u64) -> bool {
        if self.rate.is_none() {
            return true;
        }
        self.refill(now);
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }

    /// The number of bytes currently available to spend, after refilling.
    /// Returns `u64::MAX` for an unlimited bucket.
    pub fn available(&mut self, now: Instant) -> u64 {
        if self.rate.is_none() {
            return u64::MAX;
        }
        self.refill(now);
        self.tokens
    }

    /// Changes the bucket's rate (and burst capacity) in place, e.g. when
    /// the user adjusts a configured rate limit at runtime. Existing
    /// accumulated tokens are clamped to the new capacity.
    pub fn set_rate(&mut self, rate: Option<u64>, now: Instant) {
        self.refill(now);
        self.rate = rate;
        if let Some(rate) = rate {
            self.capacity = rate;
            self.tokens = self.tokens.min(self.capacity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn unlimited_bucket_always_allows_consumption() {
        let now = Instant::now();
        let mut bucket = TokenBucket::unlimited(now);
        assert!(bucket.try_consume(now, u64::MAX / 2));
        assert_eq!(bucket.available(now), u64::MAX);
    }

    #[test]
    fn limited_bucket_starts_full_and_depletes() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(1000, now);
        assert!(bucket.try_consume(now, 1000));
        assert!(!bucket.try_consume(now, 1));
    }

    #[test]
    fn bucket_refills_over_time_up_to_capacity() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(1000, now);
        bucket.try_consume(now, 1000);
        let later = now + Duration::from_millis(500);
        assert_eq!(bucket.available(later), 500);
        let much_later = now + Duration::from_secs(10);
        assert_eq!(bucket.available(much_later), 1000);
    }

    #[test]
    fn set_rate_to_none_disables_limiting() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(10, now);
        bucket.try_consume(now, 10);
        bucket.set_rate(None, now);
        assert!(bucket.try_consume(now, 1_000_000));
    }

    #[test]
    fn lowering_capacity_clamps_existing_tokens() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(1000, now);
        bucket.set_rate(Some(100), now);
        assert_eq!(bucket.available(now), 100);
    }
}
