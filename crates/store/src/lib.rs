//! kubeobserver store: snapshot cache, change queue and the informer that feeds both

#![forbid(unsafe_code)]

pub mod cache;
pub mod informer;
pub mod queue;
pub mod ratelimit;

pub use cache::SnapshotCache;
pub use informer::{Informer, WatchFilter, WatchSource};
pub use queue::ChangeQueue;
pub use ratelimit::{
    default_controller_rate_limiter, BucketRateLimiter, ExponentialFailureRateLimiter, MaxOfRateLimiter, RateLimiter,
};
