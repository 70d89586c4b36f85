//! Rate limiting algorithms and the factory that builds them.

mod counter;
mod key;
mod leaky_bucket;
mod limiter;
mod service;
mod sliding_window;
mod token_bucket;

pub use counter::FixedCounterLimiter;
pub use key::{limiter_key, resolve_key, KEY_SEPARATOR};
pub use leaky_bucket::LeakyBucketLimiter;
pub use limiter::{BaseLimiter, RateLimitResult, RateLimiter};
pub use service::LimiterService;
pub use sliding_window::SlidingWindowLimiter;
pub use token_bucket::TokenBucketLimiter;
