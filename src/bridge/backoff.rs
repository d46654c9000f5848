//! Exponential backoff with jitter, used for reconnect and retry loops.
//!
//! Adapted from the transport layer's backoff helper: same delay curve and
//! jitter scheme, retargeted at [`super::BridgeError`] instead of a generic
//! transport error.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay_ms: u64,
    max_delay_ms: u64,
    factor: f64,
    max_attempts: u32,
    enable_jitter: bool,
    current_attempt: u32,
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial_delay(mut self, ms: u64) -> Self {
        self.initial_delay_ms = ms;
        self
    }

    pub fn with_max_delay(mut self, ms: u64) -> Self {
        self.max_delay_ms = ms;
        self
    }

    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_jitter(mut self, enable: bool) -> Self {
        self.enable_jitter = enable;
        self
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }

    pub fn should_retry(&self) -> bool {
        self.max_attempts == 0 || self.current_attempt < self.max_attempts
    }

    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }

        self.current_attempt += 1;

        let base_delay = if self.current_attempt == 1 {
            self.initial_delay_ms
        } else {
            let exponential =
                self.initial_delay_ms as f64 * self.factor.powi((self.current_attempt - 1) as i32);
            exponential.min(self.max_delay_ms as f64) as u64
        };

        let final_delay = if self.enable_jitter {
            let jitter_range = base_delay / 4;
            let jitter = rand::thread_rng().gen_range(0..=jitter_range.max(1));
            base_delay + jitter
        } else {
            base_delay
        };

        Some(Duration::from_millis(final_delay))
    }

    pub fn current_attempt(&self) -> u32 {
        self.current_attempt
    }

    pub fn remaining_attempts(&self) -> Option<u32> {
        if self.max_attempts == 0 {
            None
        } else {
            Some(self.max_attempts.saturating_sub(self.current_attempt))
        }
    }

    pub fn from_config(max_attempts: u32, initial_delay_ms: u64) -> Self {
        Self {
            initial_delay_ms,
            max_delay_ms: 30_000,
            factor: 2.0,
            max_attempts,
            enable_jitter: true,
            current_attempt: 0,
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            factor: 2.0,
            max_attempts: 10,
            enable_jitter: true,
            current_attempt: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_sequence() {
        let mut backoff = ExponentialBackoff::new()
            .with_initial_delay(1000)
            .with_max_delay(30000)
            .with_factor(2.0)
            .with_jitter(false)
            .with_max_attempts(7);

        let expected = vec![1000, 2000, 4000, 8000, 16000, 30000, 30000];
        for expected_ms in expected {
            let delay = backoff.next_delay().expect("should have delay");
            assert_eq!(delay.as_millis(), expected_ms);
        }
        assert!(backoff.next_delay().is_none());
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = ExponentialBackoff::new().with_max_attempts(3);
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.current_attempt(), 2);
        backoff.reset();
        assert_eq!(backoff.current_attempt(), 0);
        assert!(backoff.should_retry());
    }

    #[test]
    fn test_unlimited_attempts() {
        let mut backoff = ExponentialBackoff::new().with_max_attempts(0);
        for _ in 0..100 {
            assert!(backoff.should_retry());
            backoff.next_delay();
        }
        assert_eq!(backoff.remaining_attempts(), None);
    }
}
