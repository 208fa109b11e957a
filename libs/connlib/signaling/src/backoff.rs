use std::time::Duration;

/// `delay_n = min(initial * 2^(n-1), max_delay)`.
///
/// The exponent is capped independently of the delay cap so that `2u64 << exponent`
/// never overflows regardless of how long the caller keeps retrying.
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

const MAX_EXPONENT: u32 = 62;

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            attempt: 0,
        }
    }

    /// Returns the delay to wait before the next attempt and advances the counter.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;

        let exponent = self.attempt.saturating_sub(1).min(MAX_EXPONENT);

        // Double `initial` one step at a time instead of computing `2^exponent` up
        // front, so the intermediate value can never overflow even for a huge
        // exponent: once it exceeds `max` there is no point continuing.
        let mut delay = self.initial;
        for _ in 0..exponent {
            if delay >= self.max {
                break;
            }
            delay = delay.saturating_mul(2);
        }

        delay.min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_exponentially_until_capped() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));

        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(8));
        assert_eq!(backoff.next_delay(), Duration::from_secs(16));
        assert_eq!(backoff.next_delay(), Duration::from_secs(30)); // 32 capped to 30
        assert_eq!(backoff.next_delay(), Duration::from_secs(30));
    }

    #[test]
    fn reset_restarts_from_initial() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        backoff.next_delay();
        backoff.next_delay();

        backoff.reset();

        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn never_overflows_even_after_thousands_of_attempts() {
        let mut backoff = Backoff::new(Duration::from_millis(1), Duration::from_secs(30));

        for _ in 0..10_000 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_secs(30));
        }
    }
}
