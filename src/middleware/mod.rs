//! HTTP middleware: request logging and ingress rate limiting.

pub mod logging;
pub mod rate_limit;

pub use rate_limit::{RateLimitConfig, RateLimiter};
