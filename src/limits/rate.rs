//! Rate Limiting
//! Mission: Bound per-tenant concurrency and request rate in memory
//!
//! Two independent counters per tenant: live WebSocket sessions (hard
//! ceiling) and a sliding 60-second API request window.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Default)]
struct LimiterState {
    concurrent_sessions: HashMap<String, u32>,
    api_requests: HashMap<String, VecDeque<Instant>>,
}

/// In-memory per-tenant limiter, safe for concurrent use.
#[derive(Clone)]
pub struct RateLimiter {
    max_concurrent_sessions: u32,
    api_rate_limit_per_minute: u32,
    state: Arc<Mutex<LimiterState>>,
}

impl RateLimiter {
    pub fn new(max_concurrent_sessions: u32, api_rate_limit_per_minute: u32) -> Self {
        Self {
            max_concurrent_sessions,
            api_rate_limit_per_minute,
            state: Arc::new(Mutex::new(LimiterState::default())),
        }
    }

    /// Admit a live session for the tenant. The returned permit decrements
    /// the counter on drop, so release is guaranteed on abnormal
    /// disconnects too.
    pub fn acquire_session_permit(&self, tenant_id: &str) -> Option<SessionPermit> {
        let mut state = self.state.lock();
        let count = state
            .concurrent_sessions
            .entry(tenant_id.to_string())
            .or_insert(0);

        if *count >= self.max_concurrent_sessions {
            warn!(
                tenant_id,
                current = *count,
                limit = self.max_concurrent_sessions,
                "Concurrent session limit exceeded"
            );
            return None;
        }

        *count += 1;
        debug!(tenant_id, sessions = *count, "Session permit acquired");

        Some(SessionPermit {
            tenant_id: tenant_id.to_string(),
            state: self.state.clone(),
        })
    }

    pub fn concurrent_sessions(&self, tenant_id: &str) -> u32 {
        self.state
            .lock()
            .concurrent_sessions
            .get(tenant_id)
            .copied()
            .unwrap_or(0)
    }

    /// Sliding-window rate check. Admits iff the count of requests within
    /// the last 60 seconds is below the ceiling, appending `now` on
    /// admission only.
    pub fn check_api_rate_limit(&self, tenant_id: &str) -> bool {
        self.check_api_rate_limit_at(tenant_id, Instant::now())
    }

    fn check_api_rate_limit_at(&self, tenant_id: &str, now: Instant) -> bool {
        let mut state = self.state.lock();
        let requests = state
            .api_requests
            .entry(tenant_id.to_string())
            .or_default();

        while let Some(front) = requests.front() {
            if now.duration_since(*front) >= WINDOW {
                requests.pop_front();
            } else {
                break;
            }
        }

        if requests.len() as u32 >= self.api_rate_limit_per_minute {
            warn!(
                tenant_id,
                current = requests.len(),
                limit = self.api_rate_limit_per_minute,
                "API rate limit exceeded"
            );
            return false;
        }

        requests.push_back(now);
        true
    }

    /// Periodic cleanup: trim expired timestamps and free empty keys.
    /// Called from a background task every 60 seconds.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();

        for requests in state.api_requests.values_mut() {
            while let Some(front) = requests.front() {
                if now.duration_since(*front) >= WINDOW {
                    requests.pop_front();
                } else {
                    break;
                }
            }
        }
        state.api_requests.retain(|_, q| !q.is_empty());
        state.concurrent_sessions.retain(|_, c| *c > 0);

        debug!("Rate limiter sweep completed");
    }
}

/// RAII guard for one live session slot.
pub struct SessionPermit {
    tenant_id: String,
    state: Arc<Mutex<LimiterState>>,
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if let Some(count) = state.concurrent_sessions.get_mut(&self.tenant_id) {
            *count = count.saturating_sub(1);
            debug!(tenant_id = %self.tenant_id, sessions = *count, "Session permit released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_concurrency_ceiling() {
        let limiter = RateLimiter::new(2, 100);

        let p1 = limiter.acquire_session_permit("tenant-a");
        let p2 = limiter.acquire_session_permit("tenant-a");
        assert!(p1.is_some());
        assert!(p2.is_some());

        // Third enter is rejected until a leave.
        assert!(limiter.acquire_session_permit("tenant-a").is_none());

        drop(p1);
        assert!(limiter.acquire_session_permit("tenant-a").is_some());
    }

    #[test]
    fn test_concurrency_is_per_tenant() {
        let limiter = RateLimiter::new(1, 100);

        let _a = limiter.acquire_session_permit("tenant-a").unwrap();
        assert!(limiter.acquire_session_permit("tenant-b").is_some());
    }

    #[test]
    fn test_permit_released_on_drop() {
        let limiter = RateLimiter::new(5, 100);

        {
            let _p1 = limiter.acquire_session_permit("t").unwrap();
            let _p2 = limiter.acquire_session_permit("t").unwrap();
            assert_eq!(limiter.concurrent_sessions("t"), 2);
        }

        assert_eq!(limiter.concurrent_sessions("t"), 0);
    }

    #[test]
    fn test_api_rate_window_ceiling() {
        let limiter = RateLimiter::new(10, 3);
        let start = Instant::now();

        assert!(limiter.check_api_rate_limit_at("t", start));
        assert!(limiter.check_api_rate_limit_at("t", start + Duration::from_secs(1)));
        assert!(limiter.check_api_rate_limit_at("t", start + Duration::from_secs(2)));

        // Fourth request inside the window is rejected and not recorded.
        assert!(!limiter.check_api_rate_limit_at("t", start + Duration::from_secs(3)));

        // Once the first timestamp ages out, admission resumes.
        assert!(limiter.check_api_rate_limit_at("t", start + Duration::from_secs(61)));
    }

    #[test]
    fn test_rejected_requests_do_not_consume_window() {
        let limiter = RateLimiter::new(10, 1);
        let start = Instant::now();

        assert!(limiter.check_api_rate_limit_at("t", start));
        for i in 0..10 {
            assert!(!limiter.check_api_rate_limit_at("t", start + Duration::from_secs(i)));
        }

        // The single admitted timestamp expires; one new request fits.
        assert!(limiter.check_api_rate_limit_at("t", start + Duration::from_secs(60)));
    }

    #[test]
    fn test_sweep_frees_empty_keys() {
        let limiter = RateLimiter::new(10, 100);

        assert!(limiter.check_api_rate_limit("t"));
        {
            let _p = limiter.acquire_session_permit("t").unwrap();
        }

        limiter.sweep();
        // Concurrency entry at zero is gone; window entry retained until expiry.
        assert_eq!(limiter.concurrent_sessions("t"), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_never_exceeds_concurrency_ceiling(
            ceiling in 1u32..8,
            attempts in 1usize..32
        ) {
            let limiter = RateLimiter::new(ceiling, 100);

            let permits: Vec<_> = (0..attempts)
                .filter_map(|_| limiter.acquire_session_permit("t"))
                .collect();

            prop_assert!(permits.len() as u32 <= ceiling);
            prop_assert_eq!(limiter.concurrent_sessions("t"), permits.len() as u32);
        }

        #[test]
        fn prop_window_admits_at_most_ceiling(
            ceiling in 1u32..20,
            attempts in 1usize..64
        ) {
            let limiter = RateLimiter::new(10, ceiling);
            let start = Instant::now();

            let admitted = (0..attempts)
                .filter(|i| {
                    limiter.check_api_rate_limit_at("t", start + Duration::from_millis(*i as u64))
                })
                .count();

            prop_assert!(admitted as u32 <= ceiling);
        }
    }
}
