//! Ingress rate limiting.
//!
//! Sliding window per client: a deque of request timestamps inside the last
//! 60 s, with a soft per-minute limit plus a hard burst allowance. Excess
//! requests get 429 with a Retry-After derived from the oldest in-window
//! request.

use crate::error::ApiError;
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Clone)]
pub struct RateLimitConfig {
    /// Soft limit per window.
    pub per_min: u32,
    /// Extra requests above the soft limit before a hard reject.
    pub burst: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_min: 60,
            burst: 120,
            window: Duration::from_secs(60),
        }
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<HashMap<IpAddr, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Record a request; Err carries the retry-after duration.
    pub fn check(&self, ip: IpAddr) -> Result<(), Duration> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let window = state.entry(ip).or_default();

        while let Some(front) = window.front() {
            if now.duration_since(*front) >= self.config.window {
                window.pop_front();
            } else {
                break;
            }
        }

        let hard_limit = (self.config.per_min + self.config.burst) as usize;
        if window.len() >= hard_limit {
            let retry_after = window
                .front()
                .map(|oldest| self.config.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(self.config.window);
            return Err(retry_after);
        }
        if window.len() >= self.config.per_min as usize {
            debug!(%ip, in_window = window.len(), "Rate limit burst in use");
        }
        window.push_back(now);
        Ok(())
    }

    /// Drop clients with no requests in the last two windows.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let horizon = self.config.window * 2;
        self.state.lock().retain(|_, window| {
            window
                .back()
                .map(|last| now.duration_since(*last) < horizon)
                .unwrap_or(false)
        });
    }
}

pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Response {
    match limiter.check(addr.ip()) {
        Ok(()) => next.run(request).await,
        Err(retry_after) => {
            let retry_after_s = retry_after.as_secs().max(1);
            warn!(ip = %addr.ip(), retry_after_s, "Rate limit exceeded");
            ApiError::rate_limited(retry_after_s).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(per_min: u32, burst: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            per_min,
            burst,
            window: Duration::from_secs(60),
        })
    }

    #[test]
    fn allows_up_to_soft_plus_burst() {
        let limiter = limiter(5, 3);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        for _ in 0..8 {
            assert!(limiter.check(ip).is_ok());
        }
        let retry_after = limiter.check(ip).unwrap_err();
        assert!(retry_after <= Duration::from_secs(60));
    }

    #[test]
    fn clients_are_tracked_independently() {
        let limiter = limiter(1, 0);
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(limiter.check(a).is_ok());
        assert!(limiter.check(a).is_err());
        assert!(limiter.check(b).is_ok());
    }

    #[test]
    fn cleanup_drops_idle_clients() {
        let limiter = limiter(5, 0);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        limiter.check(ip).unwrap();
        assert_eq!(limiter.state.lock().len(), 1);
        // Entries are recent, so cleanup keeps them.
        limiter.cleanup();
        assert_eq!(limiter.state.lock().len(), 1);
    }
}
