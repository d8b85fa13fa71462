pub mod metrics;
pub mod rate_limiter;
pub mod shutdown;
pub mod worker;

pub use metrics::MarkerMetrics;
pub use rate_limiter::TokenBucketRateLimiter;
pub use shutdown::Shutdown;
pub use worker::{BatchStats, MarkerWorker};
