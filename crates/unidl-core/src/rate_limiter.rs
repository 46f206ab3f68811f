//! Per-session sliding window rate limiter
//!
//! Each session keeps the timestamps of its admitted requests inside the
//! trailing window. Entries older than the window are discarded on every
//! check, so the queue never holds more than `max_requests` items.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use unidl_types::{SessionId, Settings};

/// Sliding window limiter keyed by session
pub struct SessionRateLimiter {
    max_requests: usize,
    window: Duration,
    windows: Mutex<HashMap<SessionId, VecDeque<Instant>>>,
}

impl SessionRateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.rate_limit_max_requests, settings.rate_limit_window())
    }

    /// Returns true and records the request if the session is under its limit
    pub fn allow(&self, session: &SessionId) -> bool {
        self.allow_at(session, Instant::now())
    }

    pub fn allow_at(&self, session: &SessionId, now: Instant) -> bool {
        let mut windows = self.windows.lock();
        let entries = windows.entry(session.clone()).or_default();
        prune(entries, now, self.window);

        if entries.len() < self.max_requests {
            entries.push_back(now);
            true
        } else {
            debug!(session = %session, count = entries.len(), "rate limit reached");
            false
        }
    }

    /// How long until the session can submit again. Zero if it can now.
    pub fn retry_after(&self, session: &SessionId) -> Duration {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let Some(entries) = windows.get_mut(session) else {
            return Duration::ZERO;
        };
        prune(entries, now, self.window);

        if entries.len() < self.max_requests {
            return Duration::ZERO;
        }
        entries
            .front()
            .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    /// Drop sessions with no requests left in their window. Returns how many were dropped.
    pub fn purge_idle(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, entries| {
            prune(entries, now, self.window);
            !entries.is_empty()
        });
        before - windows.len()
    }

    /// Number of sessions currently tracked
    pub fn tracked_sessions(&self) -> usize {
        self.windows.lock().len()
    }
}

fn prune(entries: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = entries.front() {
        if now.saturating_duration_since(*oldest) >= window {
            entries.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn denies_over_threshold_until_window_passes() {
        let limiter = SessionRateLimiter::new(10, Duration::from_secs(60));
        let session = SessionId::from("alice");

        for _ in 0..10 {
            assert!(limiter.allow(&session));
        }
        assert!(!limiter.allow(&session));
        assert!(limiter.retry_after(&session) > Duration::ZERO);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(limiter.allow(&session));
        assert_eq!(limiter.retry_after(&session), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides_per_entry() {
        let limiter = SessionRateLimiter::new(2, Duration::from_secs(10));
        let session = SessionId::from("s");

        assert!(limiter.allow(&session));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(limiter.allow(&session));
        assert!(!limiter.allow(&session));
        assert_eq!(limiter.retry_after(&session), Duration::from_secs(4));

        // First entry leaves the window, second one is still inside
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(limiter.allow(&session));
        assert!(!limiter.allow(&session));
    }

    #[tokio::test(start_paused = true)]
    async fn denied_requests_are_not_recorded() {
        let limiter = SessionRateLimiter::new(1, Duration::from_secs(10));
        let session = SessionId::from("s");

        assert!(limiter.allow(&session));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!limiter.allow(&session));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(limiter.allow(&session));
    }

    #[test]
    fn sessions_are_independent() {
        let limiter = SessionRateLimiter::new(1, Duration::from_secs(60));
        let now = Instant::now();
        assert!(limiter.allow_at(&SessionId::from("a"), now));
        assert!(!limiter.allow_at(&SessionId::from("a"), now));
        assert!(limiter.allow_at(&SessionId::from("b"), now));
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_only_idle_sessions() {
        let limiter = SessionRateLimiter::new(5, Duration::from_secs(60));
        limiter.allow(&SessionId::from("old"));
        tokio::time::advance(Duration::from_secs(30)).await;
        limiter.allow(&SessionId::from("new"));
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(limiter.purge_idle(), 1);
        assert_eq!(limiter.tracked_sessions(), 1);
    }
}
