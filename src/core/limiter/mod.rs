pub mod concurrency;
pub mod sliding_window;
pub mod token_bucket;

pub use concurrency::ConcurrencyLimiter;
pub use sliding_window::{SlidingWindowLimiter, WindowResult};
pub use token_bucket::{BucketResult, TokenBucketLimiter};
