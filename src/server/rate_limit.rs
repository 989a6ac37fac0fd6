//! Sliding-window admission control, keyed by peer IP.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct RateLimiter {
    requests: Mutex<HashMap<String, Vec<Instant>>>,
    limit: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            requests: Mutex::new(HashMap::new()),
            limit,
            window,
        }
    }

    /// Prunes the peer's timestamps to the trailing window, then admits
    /// iff the remaining count is under the limit, recording the
    /// admission.
    pub fn allowed(&self, peer: &str) -> bool {
        let now = Instant::now();
        let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());

        let timestamps = requests.entry(peer.to_string()).or_default();
        timestamps.retain(|t| now.duration_since(*t) < self.window);

        if timestamps.len() >= self.limit {
            return false;
        }
        timestamps.push(now);
        true
    }

    /// Drops peers whose whole window has lapsed. Admission already prunes
    /// on access; this keeps idle peers from pinning map entries forever.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
        requests.retain(|_, timestamps| {
            timestamps.retain(|t| now.duration_since(*t) < self.window);
            !timestamps.is_empty()
        });
    }

    #[cfg(test)]
    fn tracked_peers(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_the_limit() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.allowed("10.0.0.1"));
        assert!(limiter.allowed("10.0.0.1"));
        assert!(limiter.allowed("10.0.0.1"));
        assert!(!limiter.allowed("10.0.0.1"));
    }

    #[test]
    fn peers_are_limited_independently() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.allowed("10.0.0.1"));
        assert!(limiter.allowed("10.0.0.2"));
        assert!(!limiter.allowed("10.0.0.1"));
    }

    #[test]
    fn window_lapse_readmits() {
        let limiter = RateLimiter::new(1, Duration::from_millis(20));
        assert!(limiter.allowed("10.0.0.1"));
        assert!(!limiter.allowed("10.0.0.1"));
        std::thread::sleep(Duration::from_millis(40));
        assert!(limiter.allowed("10.0.0.1"));
    }

    #[test]
    fn sweep_forgets_idle_peers() {
        let limiter = RateLimiter::new(5, Duration::from_millis(20));
        assert!(limiter.allowed("10.0.0.1"));
        assert_eq!(limiter.tracked_peers(), 1);
        std::thread::sleep(Duration::from_millis(40));
        limiter.sweep();
        assert_eq!(limiter.tracked_peers(), 0);
    }
}
