pub mod limiter;

pub use limiter::{LimitKind, RateLimited, RateLimiter};
