// trustgate/src/throttle.rs
//
// Per-key fixed-window request throttle.
//
// Expiry is lazy: a window past its end is reset the moment its key is
// touched, so a check is always correct on its own. The periodic sweep only
// bounds memory by dropping keys nobody touched for a whole window, and
// running it twice changes nothing.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::debug;

use crate::config::ThrottleConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    Allowed { remaining: u64 },
    Limited { retry_after_secs: i64 },
}

impl ThrottleDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u64,
    expires_at: DateTime<Utc>,
}

pub struct RequestThrottle {
    windows: DashMap<String, Window>,
    max_requests: u64,
    window: Duration,
}

impl RequestThrottle {
    pub fn new(cfg: &ThrottleConfig) -> Self {
        Self {
            windows: DashMap::new(),
            max_requests: cfg.max_requests,
            window: Duration::seconds(cfg.window_secs.max(1)),
        }
    }

    pub fn check(&self, key: &str) -> ThrottleDecision {
        self.check_at(key, Utc::now())
    }

    pub fn check_at(&self, key: &str, now: DateTime<Utc>) -> ThrottleDecision {
        let mut w = self.windows.entry(key.to_string()).or_insert(Window {
            count: 0,
            expires_at: now + self.window,
        });
        if now >= w.expires_at {
            w.count = 0;
            w.expires_at = now + self.window;
        }
        if w.count < self.max_requests {
            w.count += 1;
            ThrottleDecision::Allowed { remaining: self.max_requests - w.count }
        } else {
            let wait = (w.expires_at - now).num_seconds().max(1);
            ThrottleDecision::Limited { retry_after_secs: wait }
        }
    }

    /// Drop expired windows. Returns how many were removed.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, w| now < w.expires_at);
        before.saturating_sub(self.windows.len())
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}

/// Background sweep, one pass per interval.
pub async fn sweep_loop(throttle: Arc<RequestThrottle>, interval_secs: u64) {
    let mut tick = tokio::time::interval(StdDuration::from_secs(interval_secs.max(1)));
    loop {
        tick.tick().await;
        let removed = throttle.sweep_at(Utc::now());
        if removed > 0 {
            debug!(removed, tracked = throttle.tracked_keys(), "throttle sweep");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn throttle(max: u64) -> RequestThrottle {
        RequestThrottle::new(&ThrottleConfig { max_requests: max, window_secs: 60, sweep_interval_secs: 300 })
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
    }

    #[test]
    fn limits_within_window_and_reports_retry() {
        let th = throttle(2);
        assert_eq!(th.check_at("u1", t0()), ThrottleDecision::Allowed { remaining: 1 });
        assert_eq!(th.check_at("u1", t0()), ThrottleDecision::Allowed { remaining: 0 });
        assert_eq!(
            th.check_at("u1", t0() + Duration::seconds(20)),
            ThrottleDecision::Limited { retry_after_secs: 40 }
        );
        assert!(th.check_at("u2", t0()).is_allowed());
    }

    #[test]
    fn expired_window_resets_without_sweep() {
        let th = throttle(1);
        assert!(th.check_at("u1", t0()).is_allowed());
        assert!(!th.check_at("u1", t0() + Duration::seconds(59)).is_allowed());
        assert!(th.check_at("u1", t0() + Duration::seconds(60)).is_allowed());
    }

    #[test]
    fn sweep_is_idempotent() {
        let th = throttle(5);
        th.check_at("old", t0());
        th.check_at("new", t0() + Duration::seconds(50));

        let at = t0() + Duration::seconds(70);
        assert_eq!(th.sweep_at(at), 1);
        assert_eq!(th.sweep_at(at), 0);
        assert_eq!(th.tracked_keys(), 1);
    }
}
