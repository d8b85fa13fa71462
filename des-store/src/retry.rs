//! Minimal exponential-backoff retry, mirroring the shape of the teacher's
//! `ExponentialBackoff` + jitter-function combination without pulling in a
//! configuration dependency this crate otherwise has no use for.

use des_error::Error;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_base: f64,
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            backoff_base: 2.0,
            jitter_ratio: 0.5,
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_base.powi(attempt as i32);
        let base = self.base_delay.mul_f64(factor);
        let jitter_min = 1.0 - self.jitter_ratio / 2.0;
        let jitter_max = 1.0 + self.jitter_ratio / 2.0;
        let jitter = rand::thread_rng().gen_range(jitter_min..jitter_max);
        base.mul_f64(jitter.max(0.0))
    }
}

/// Retries `op` up to `policy.max_retries` additional times whenever it
/// returns an error for which `is_retryable` returns true. The final error
/// (transient or not) is always the one returned on exhaustion.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    is_retryable: impl Fn(&Error) -> bool,
    mut op: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= policy.max_retries || !is_retryable(&err) {
                    return Err(err);
                }
                tokio::time::sleep(policy.delay_for(attempt)).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use des_error::{Code, Error as DesError};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_until_success() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(
            &policy,
            |_| true,
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(DesError::new(Code::Unavailable, "transient"))
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_on_non_retryable_error() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let err = retry_with_backoff(
            &policy,
            |_| false,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(DesError::new(Code::InvalidArgument, "nope")) }
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, Code::InvalidArgument);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
