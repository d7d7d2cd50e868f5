use std::time::Duration;

/// Exponential backoff with full jitter, shared by the store backends and
/// the upload pipeline.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`
    /// capped at `max_delay`, then a uniformly random slice of that window.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32 << (attempt - 1).min(16))
            .min(self.max_delay);
        exp.mul_f64(rand::random::<f64>())
    }

    /// Run `f` until it succeeds, it fails non-retryably, or attempts run out.
    pub fn run<T, E>(
        &self,
        op_name: &str,
        is_retryable: impl Fn(&E) -> bool,
        mut f: impl FnMut() -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: std::fmt::Display,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match f() {
                Ok(val) => return Ok(val),
                Err(e) if is_retryable(&e) && attempt < attempts => {
                    let delay = self.backoff(attempt);
                    tracing::warn!(
                        op = op_name,
                        attempt,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        "transient failure, retrying: {e}"
                    );
                    std::thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let out: Result<u32, String> = fast_policy(4).run("op", |_| true, || {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err("transient".to_string())
            } else {
                Ok(7)
            }
        });
        assert_eq!(out.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn gives_up_after_configured_attempts() {
        let calls = AtomicU32::new(0);
        let out: Result<(), String> = fast_policy(3).run("op", |_| true, || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("still failing".to_string())
        });
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn does_not_retry_permanent_failures() {
        let calls = AtomicU32::new(0);
        let out: Result<(), String> = fast_policy(5).run("op", |_| false, || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("permanent".to_string())
        });
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_never_exceeds_cap() {
        let policy = RetryPolicy {
            attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
        };
        for attempt in 1..=9 {
            assert!(policy.backoff(attempt) <= Duration::from_millis(400));
        }
    }
}
