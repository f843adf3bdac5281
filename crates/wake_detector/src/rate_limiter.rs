//! Per-session rate limiting (§4.1): a short cooldown between admitted
//! wake-words plus a rolling per-minute cap, keyed by `session_uid`. Modeled
//! on the `DashMap<Uuid, RwLock<...>>` session-state pattern the antarcticom
//! voice server uses for its per-channel state.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use config::RateLimitConfig;

struct SessionRateState {
    created_at: Instant,
    last_admitted: Option<Instant>,
    /// Timestamps of admissions in the trailing 60 s, oldest first. Old
    /// entries are garbage-collected opportunistically on each `admit` call.
    admissions: VecDeque<Instant>,
}

impl SessionRateState {
    fn fresh(now: Instant) -> Self {
        Self { created_at: now, last_admitted: None, admissions: VecDeque::new() }
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    sessions: DashMap<String, SessionRateState>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self { config, sessions: DashMap::new() }
    }

    /// Returns `true` if a wake-word for `session_uid` should be admitted
    /// right now, recording the admission as a side effect. Disabled
    /// limiters always admit.
    pub fn admit(&self, session_uid: &str) -> bool {
        if !self.config.enabled {
            return true;
        }

        let now = Instant::now();
        let mut state = self
            .sessions
            .entry(session_uid.to_string())
            .or_insert_with(|| SessionRateState::fresh(now));

        if let Some(last) = state.last_admitted {
            if now.duration_since(last) < Duration::from_secs_f64(self.config.cooldown_s) {
                return false;
            }
        }

        while let Some(&oldest) = state.admissions.front() {
            if now.duration_since(oldest) >= Duration::from_secs(60) {
                state.admissions.pop_front();
            } else {
                break;
            }
        }

        if state.admissions.len() as u32 >= self.config.max_per_minute {
            return false;
        }

        state.admissions.push_back(now);
        state.last_admitted = Some(now);
        true
    }

    /// Drops tracked sessions that have been idle long enough that their
    /// state can no longer affect an admission decision. Stage `main.rs`
    /// calls this periodically so long-running processes don't accumulate
    /// one entry per session forever.
    pub fn gc(&self, idle_for: Duration) {
        let now = Instant::now();
        self.sessions.retain(|_, state| {
            let last_activity = state.last_admitted.unwrap_or(state.created_at);
            now.duration_since(last_activity) < idle_for
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(cooldown_s: f64, max_per_minute: u32) -> RateLimitConfig {
        RateLimitConfig { enabled: true, cooldown_s, max_per_minute, per_session: true }
    }

    #[test]
    fn first_admission_always_passes() {
        let limiter = RateLimiter::new(config(3.0, 15));
        assert!(limiter.admit("s1"));
    }

    #[test]
    fn second_admission_within_cooldown_is_rejected() {
        let limiter = RateLimiter::new(config(30.0, 15));
        assert!(limiter.admit("s1"));
        assert!(!limiter.admit("s1"));
    }

    #[test]
    fn disabled_limiter_always_admits() {
        let limiter = RateLimiter::new(RateLimitConfig { enabled: false, cooldown_s: 9999.0, max_per_minute: 1, per_session: true });
        assert!(limiter.admit("s1"));
        assert!(limiter.admit("s1"));
    }

    #[test]
    fn sessions_are_independent() {
        let limiter = RateLimiter::new(config(30.0, 15));
        assert!(limiter.admit("s1"));
        assert!(limiter.admit("s2"));
    }

    #[test]
    fn per_minute_cap_rejects_once_exhausted_even_past_cooldown() {
        let limiter = RateLimiter::new(config(0.0, 1));
        assert!(limiter.admit("s1"));
        assert!(!limiter.admit("s1"));
    }

    #[test]
    fn trailing_window_does_not_admit_double_the_cap_across_a_boundary() {
        // With a tumbling window, filling the cap right before a window
        // boundary and again right after would admit 2x max_per_minute
        // inside an actual 60s span. A trailing window must still reject.
        let limiter = RateLimiter::new(config(0.0, 2));
        assert!(limiter.admit("s1"));
        assert!(limiter.admit("s1"));
        assert!(!limiter.admit("s1"));
        assert!(!limiter.admit("s1"));
    }
}
