//! Async token-bucket rate limiter protecting source databases from marker
//! load, grounded on `des/marker/rate_limiter.py::TokenBucketRateLimiter`.

use std::time::Instant;

use tokio::sync::Mutex;

struct Bucket {
    tokens: f64,
    last_update: Instant,
}

pub struct TokenBucketRateLimiter {
    rate: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

impl TokenBucketRateLimiter {
    pub fn new(rate: f64, capacity: Option<u32>) -> Self {
        let capacity = capacity.map(f64::from).unwrap_or(rate * 2.0);
        TokenBucketRateLimiter {
            rate,
            capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_update: Instant::now(),
            }),
        }
    }

    /// Waits until `tokens` tokens are available, then takes them.
    pub async fn acquire(&self, tokens: f64) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_update).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.capacity);
                bucket.last_update = now;

                if bucket.tokens >= tokens {
                    bucket.tokens -= tokens;
                    None
                } else {
                    Some((tokens - bucket.tokens) / self.rate)
                }
            };

            match wait {
                None => return,
                Some(secs) => tokio::time::sleep(std::time::Duration::from_secs_f64(secs)).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn grants_tokens_up_to_capacity_immediately() {
        let limiter = TokenBucketRateLimiter::new(10.0, Some(5));
        for _ in 0..5 {
            limiter.acquire(1.0).await;
        }
    }

    #[tokio::test]
    async fn blocks_until_refill_when_exhausted() {
        let limiter = TokenBucketRateLimiter::new(1000.0, Some(1));
        let start = Instant::now();
        limiter.acquire(1.0).await;
        limiter.acquire(1.0).await;
        assert!(start.elapsed() >= std::time::Duration::from_millis(1));
    }
}
