//! Token bucket used to pace device launches.

use tokio::time::Instant;

/// A polling token bucket.
///
/// The bucket starts with `rate` tokens and never holds more than
/// `max(2 × rate, 1)`, which bounds the burst after an idle period while
/// still letting a rate below one token every two seconds make progress. Refill reads the
/// monotonic clock, so wall-clock adjustments cannot inflate or drain it.
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    tokens: f64,
    updated: Instant,
}

impl RateLimiter {
    pub fn new(rate_per_sec: f64) -> Self {
        Self::starting_at(rate_per_sec, Instant::now())
    }

    pub fn starting_at(rate_per_sec: f64, now: Instant) -> Self {
        let rate = rate_per_sec.max(0.0);
        Self {
            rate,
            tokens: rate,
            updated: now,
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn burst_capacity(&self) -> f64 {
        (self.rate * 2.0).max(1.0)
    }

    /// Takes one token if available. Never blocks; callers back off on `false`.
    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.updated).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst_capacity());
        self.updated = self.updated.max(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn drain(limiter: &mut RateLimiter, now: Instant) -> usize {
        let mut granted = 0;
        while limiter.try_acquire_at(now) {
            granted += 1;
        }
        granted
    }

    #[test]
    fn starts_with_one_second_of_tokens() {
        let start = Instant::now();
        let mut limiter = RateLimiter::starting_at(10.0, start);
        assert_eq!(drain(&mut limiter, start), 10);
        assert!(!limiter.try_acquire_at(start));
    }

    #[test]
    fn refill_is_proportional_to_elapsed_time() {
        let start = Instant::now();
        let mut limiter = RateLimiter::starting_at(10.0, start);
        drain(&mut limiter, start);

        let later = start + Duration::from_millis(500);
        assert_eq!(drain(&mut limiter, later), 5);
    }

    #[test]
    fn idle_refill_is_capped_at_twice_the_rate() {
        let start = Instant::now();
        let mut limiter = RateLimiter::starting_at(10.0, start);
        drain(&mut limiter, start);

        let much_later = start + Duration::from_secs(60);
        assert_eq!(drain(&mut limiter, much_later), 20);
    }

    #[test]
    fn rejection_has_no_side_effect() {
        let start = Instant::now();
        let mut limiter = RateLimiter::starting_at(2.0, start);
        drain(&mut limiter, start);

        // A rejected poll must not consume the fractional refill.
        let t1 = start + Duration::from_millis(250);
        assert!(!limiter.try_acquire_at(t1));
        let t2 = start + Duration::from_millis(500);
        assert!(limiter.try_acquire_at(t2));
    }

    #[test]
    fn clock_going_backwards_does_not_add_tokens() {
        let start = Instant::now() + Duration::from_secs(10);
        let mut limiter = RateLimiter::starting_at(5.0, start);
        drain(&mut limiter, start);

        let earlier = start - Duration::from_secs(5);
        assert!(!limiter.try_acquire_at(earlier));
        assert!(!limiter.try_acquire_at(start));
    }

    #[test]
    fn acquisitions_stay_within_rate_plus_burst() {
        let rate = 25.0;
        let start = Instant::now();
        let mut limiter = RateLimiter::starting_at(rate, start);
        let step = Duration::from_millis(7);

        let mut granted = 0usize;
        let mut now = start;
        for _ in 0..1_000 {
            granted += drain(&mut limiter, now);
            let elapsed = now.duration_since(start).as_secs_f64();
            let bound = (rate * elapsed).ceil() as usize + limiter.burst_capacity() as usize;
            assert!(granted <= bound, "granted {granted} > bound {bound} at {elapsed}s");
            now += step;
        }
    }

    #[test]
    fn slow_rate_still_grants_whole_tokens() {
        let start = Instant::now();
        let mut limiter = RateLimiter::starting_at(0.25, start);
        assert_eq!(limiter.rate(), 0.25);
        assert_eq!(limiter.burst_capacity(), 1.0);
        assert!(!limiter.try_acquire_at(start));

        assert!(!limiter.try_acquire_at(start + Duration::from_secs(2)));
        assert!(limiter.try_acquire_at(start + Duration::from_secs(3)));

        // a long idle period still banks a single token
        assert_eq!(drain(&mut limiter, start + Duration::from_secs(100)), 1);
    }

    #[test]
    fn zero_rate_never_grants() {
        let start = Instant::now();
        let mut limiter = RateLimiter::starting_at(0.0, start);
        assert!(!limiter.try_acquire_at(start + Duration::from_secs(3600)));
    }
}
