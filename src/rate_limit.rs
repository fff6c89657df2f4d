//! Fixed-window rate limiting for the payment endpoints.
//!
//! Counters are keyed by client identifier and reset when their window
//! elapses. Applied as a pre-check on `/verify` and `/settle` only; exceeded
//! requests receive a structured 429.

use dashmap::DashMap;
use std::time::Instant;

use crate::config::RateLimitSettings;

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Per-client fixed-window counter.
pub struct FixedWindowLimiter {
    windows: DashMap<String, Window>,
    settings: RateLimitSettings,
}

impl FixedWindowLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            windows: DashMap::new(),
            settings,
        }
    }

    /// Record a request for `client` and report whether it is allowed.
    pub fn check(&self, client: &str) -> bool {
        let now = Instant::now();
        let mut entry = self.windows.entry(client.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.duration_since(entry.started) >= self.settings.window {
            entry.started = now;
            entry.count = 0;
        }
        entry.count += 1;
        entry.count <= self.settings.max_requests
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limiter(max_requests: u32, window: Duration) -> FixedWindowLimiter {
        FixedWindowLimiter::new(RateLimitSettings {
            max_requests,
            window,
        })
    }

    #[test]
    fn allows_up_to_the_limit_then_rejects() {
        let limiter = limiter(3, Duration::from_secs(60));
        assert!(limiter.check("client-a"));
        assert!(limiter.check("client-a"));
        assert!(limiter.check("client-a"));
        assert!(!limiter.check("client-a"));
    }

    #[test]
    fn clients_are_counted_independently() {
        let limiter = limiter(1, Duration::from_secs(60));
        assert!(limiter.check("client-a"));
        assert!(!limiter.check("client-a"));
        assert!(limiter.check("client-b"));
    }

    #[test]
    fn window_resets_after_elapsing() {
        let limiter = limiter(1, Duration::from_millis(10));
        assert!(limiter.check("client-a"));
        assert!(!limiter.check("client-a"));
        std::thread::sleep(Duration::from_millis(15));
        assert!(limiter.check("client-a"));
    }
}
