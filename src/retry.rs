use std::fmt::Display;
use std::thread::sleep;
use std::time::Duration;

use rand::random;

use crate::config::RetryConfig;

/// Errors that may succeed when the same call is repeated later.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Bounded exponential backoff with jitter.
///
/// Attempt `n` (1-based) that fails transiently sleeps
/// `min(base * 2^(n-1), max) + jitter` before the next attempt.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_jitter: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_jitter: Duration::from_millis(config.max_jitter_ms),
        }
    }

    /// No sleeping between attempts.
    #[cfg(test)]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_jitter: Duration::ZERO,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let backoff = self
            .base_delay
            .saturating_mul(2u32.pow(exp))
            .min(self.max_delay);
        backoff + rand_jitter(self.max_jitter)
    }

    /// Runs `op` until it succeeds, fails permanently, or attempts run out.
    /// Returns the last error.
    pub fn run<T, E, F>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        E: Transient + Display,
        F: FnMut() -> Result<T, E>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    log::info!(
                        "{label}: retrying (attempt {}/{}) after error: {err}, backoff {}ms",
                        attempt,
                        self.max_attempts,
                        delay.as_millis()
                    );
                    sleep(delay);
                }
                Err(err) => {
                    if err.is_transient() {
                        log::warn!("{label}: giving up after {attempt} attempts: {err}");
                    }
                    return Err(err);
                }
            }
        }
    }
}

fn rand_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(random::<u64>() % max_ms)
}
