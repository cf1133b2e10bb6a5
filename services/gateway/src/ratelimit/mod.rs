//! Token-bucket admission control keyed by client and rate class.

mod bucket;
mod limiter;

pub use bucket::{RateClassConfig, RateDecision, TokenBucket};
pub use limiter::{BucketKey, RateLimiter};
