use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::{Error, Result};

/// What a caller does when the window is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitPolicy {
    /// Deny immediately.
    FailFast,
    /// Suspend until the window admits the request, for at most `max_wait`.
    Wait { max_wait: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
    /// Extra requests allowed once the window is full.
    pub burst_allowance: Option<u32>,
    pub on_limit: LimitPolicy,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window: Duration::from_secs(1),
            burst_allowance: None,
            on_limit: LimitPolicy::FailFast,
        }
    }
}

impl RateLimitConfig {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            ..Self::default()
        }
    }

    /// `n` requests per second.
    pub fn per_second(n: u32) -> Self {
        Self::new(n, Duration::from_secs(1))
    }

    pub fn with_burst_allowance(mut self, burst: u32) -> Self {
        self.burst_allowance = Some(burst);
        self
    }

    pub fn with_policy(mut self, policy: LimitPolicy) -> Self {
        self.on_limit = policy;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_requests == 0 {
            return Err(Error::invalid_field(
                "rate_limit.max_requests",
                "max requests must be positive",
            ));
        }
        if self.window.is_zero() {
            return Err(Error::invalid_field(
                "rate_limit.window_ms",
                "window must be positive",
            ));
        }
        Ok(())
    }

    fn burst(&self) -> u32 {
        self.burst_allowance.unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterSnapshot {
    pub max_requests: u32,
    pub window_ms: u64,
    /// Requests granted within the current sliding window.
    pub in_window: u32,
    pub burst_remaining: u32,
    /// Estimated wait until a request would be admitted (ms), if currently full.
    pub estimated_wait_ms: Option<u64>,
}

/// How a granted request got through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Immediate,
    Deferred { waited: Duration },
}

/// Denial from [`RateLimiter::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimited {
    pub retry_after: Duration,
}

impl fmt::Display for RateLimited {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rate limited; retry after {}ms", self.retry_after.as_millis())
    }
}

impl std::error::Error for RateLimited {}

#[derive(Debug)]
struct State {
    granted: VecDeque<Instant>,
    burst_used: u32,
    last_burst: Option<Instant>,
}

/// Sliding-window rate limiter.
///
/// - At most `max_requests` grants in any `window`
/// - Once the window is full, up to `burst_allowance` extra grants; burst
///   credit refills after a full window without burst use
/// - Async-safe; one critical section per limiter
pub struct RateLimiter {
    cfg: RateLimitConfig,
    state: Mutex<State>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimitConfig) -> Self {
        let capacity = (cfg.max_requests as usize).saturating_add(cfg.burst() as usize);
        Self {
            cfg,
            state: Mutex::new(State {
                granted: VecDeque::with_capacity(capacity.min(4_096)),
                burst_used: 0,
                last_burst: None,
            }),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.cfg
    }

    fn refresh_locked(cfg: &RateLimitConfig, st: &mut State, now: Instant) {
        while let Some(front) = st.granted.front() {
            if now.duration_since(*front) >= cfg.window {
                st.granted.pop_front();
            } else {
                break;
            }
        }
        if let Some(last) = st.last_burst {
            if now.duration_since(last) >= cfg.window {
                st.burst_used = 0;
                st.last_burst = None;
            }
        }
    }

    /// Grant a request at `now` or return how long until one would be granted.
    fn grant_locked(cfg: &RateLimitConfig, st: &mut State, now: Instant) -> std::result::Result<(), Duration> {
        Self::refresh_locked(cfg, st, now);
        let max = cfg.max_requests as usize;
        if st.granted.len() < max {
            st.granted.push_back(now);
            return Ok(());
        }
        if st.burst_used < cfg.burst() {
            st.burst_used += 1;
            st.last_burst = Some(now);
            st.granted.push_back(now);
            return Ok(());
        }
        Err(Self::wait_locked(cfg, st, now))
    }

    fn wait_locked(cfg: &RateLimitConfig, st: &State, now: Instant) -> Duration {
        let max = cfg.max_requests as usize;
        if st.granted.len() < max {
            return Duration::ZERO;
        }
        // The entry whose expiry brings the window back under the limit.
        let idx = st.granted.len() - max;
        st.granted
            .get(idx)
            .map(|t| (*t + cfg.window).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    /// Take a permit without waiting.
    pub async fn try_acquire(&self) -> bool {
        let mut st = self.state.lock().await;
        Self::grant_locked(&self.cfg, &mut st, Instant::now()).is_ok()
    }

    /// Take a permit according to the configured [`LimitPolicy`].
    pub async fn acquire(&self) -> std::result::Result<Admission, RateLimited> {
        let started = Instant::now();
        let mut deferred = false;
        loop {
            let wait = {
                let mut st = self.state.lock().await;
                match Self::grant_locked(&self.cfg, &mut st, Instant::now()) {
                    Ok(()) => {
                        return Ok(if deferred {
                            Admission::Deferred {
                                waited: started.elapsed(),
                            }
                        } else {
                            Admission::Immediate
                        });
                    }
                    Err(wait) => wait,
                }
            };

            match self.cfg.on_limit {
                LimitPolicy::FailFast => return Err(RateLimited { retry_after: wait }),
                LimitPolicy::Wait { max_wait } => {
                    if started.elapsed() + wait > max_wait {
                        return Err(RateLimited { retry_after: wait });
                    }
                    deferred = true;
                    // Never spin on a zero wait.
                    tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
                }
            }
        }
    }

    pub async fn snapshot(&self) -> RateLimiterSnapshot {
        let mut st = self.state.lock().await;
        let now = Instant::now();
        Self::refresh_locked(&self.cfg, &mut st, now);
        let burst_remaining = self.cfg.burst().saturating_sub(st.burst_used);
        let estimated_wait_ms = if burst_remaining > 0 {
            None
        } else {
            let wait = Self::wait_locked(&self.cfg, &st, now);
            (!wait.is_zero()).then(|| wait.as_millis() as u64)
        };
        RateLimiterSnapshot {
            max_requests: self.cfg.max_requests,
            window_ms: self.cfg.window.as_millis() as u64,
            in_window: st.granted.len() as u32,
            burst_remaining,
            estimated_wait_ms,
        }
    }
}
