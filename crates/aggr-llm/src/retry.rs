//! Retry policy (`spec.md` §4.4, §5).
//!
//! `wait = min(max_wait, base * 2^attempt) + jitter`. The retry loop
//! itself lives in [`crate::dispatcher::Dispatcher::call_single`], which
//! also needs to record each attempt for the debug artefact; this
//! module only owns the backoff math.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub attempts: u32,
    pub base_wait: Duration,
    pub max_wait: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_wait: Duration::from_secs(2),
            max_wait: Duration::from_secs(30),
        }
    }
}

pub(crate) fn backoff(config: &RetryConfig, attempt: u32) -> Duration {
    let exp = config.base_wait.as_millis().saturating_mul(1u128 << attempt.min(20));
    let capped = exp.min(config.max_wait.as_millis());
    let jitter_ms = rand::thread_rng().gen_range(0..=250u64);
    Duration::from_millis(capped as u64) + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_caps_at_max_wait() {
        let config = RetryConfig {
            attempts: 10,
            base_wait: Duration::from_secs(2),
            max_wait: Duration::from_secs(5),
        };
        let wait = backoff(&config, 10);
        assert!(wait <= Duration::from_secs(5) + Duration::from_millis(250));
    }

    #[test]
    fn backoff_grows_with_attempt() {
        let config = RetryConfig {
            attempts: 10,
            base_wait: Duration::from_millis(100),
            max_wait: Duration::from_secs(30),
        };
        assert!(backoff(&config, 2) >= Duration::from_millis(400));
    }
}
