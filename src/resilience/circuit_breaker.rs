use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::events::{BreakerEvent, BreakerEventSink, NoopEventSink};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        })
    }
}

/// Point-in-time view of one service's breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub service_name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub next_attempt_time: Option<DateTime<Utc>>,
    pub failure_threshold: u32,
    /// Number of times the circuit has opened since creation.
    pub trips: u64,
    pub current_cooldown_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip a closed circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open trial successes required to close.
    pub success_threshold: u32,
    /// Initial open duration.
    pub cooldown: Duration,
    /// Growth applied to the cooldown each time a half-open trial fails.
    pub cooldown_multiplier: f64,
    pub max_cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            cooldown: Duration::from_secs(30),
            cooldown_multiplier: 2.0,
            max_cooldown: Duration::from_secs(300),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_cooldown_multiplier(mut self, multiplier: f64) -> Self {
        self.cooldown_multiplier = multiplier;
        self
    }

    pub fn with_max_cooldown(mut self, max: Duration) -> Self {
        self.max_cooldown = max;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(Error::invalid_field(
                "circuit_breaker.failure_threshold",
                "failure threshold must be at least 1",
            ));
        }
        if self.success_threshold == 0 {
            return Err(Error::invalid_field(
                "circuit_breaker.success_threshold",
                "success threshold must be at least 1",
            ));
        }
        if self.cooldown.is_zero() {
            return Err(Error::invalid_field(
                "circuit_breaker.cooldown_ms",
                "cooldown must be positive",
            ));
        }
        if !self.cooldown_multiplier.is_finite() || self.cooldown_multiplier < 1.0 {
            return Err(Error::invalid_field(
                "circuit_breaker.cooldown_multiplier",
                "cooldown multiplier must be a finite value >= 1",
            ));
        }
        if self.max_cooldown < self.cooldown {
            return Err(Error::invalid_field(
                "circuit_breaker.max_cooldown_ms",
                "max cooldown must not be shorter than the cooldown",
            ));
        }
        Ok(())
    }
}

/// Returned when the breaker refuses a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitOpen {
    pub service_name: String,
    pub state: CircuitState,
    /// Time left until the breaker will admit a trial call, if known.
    pub retry_after: Option<Duration>,
}

impl fmt::Display for CircuitOpen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.state, self.retry_after) {
            (CircuitState::HalfOpen, _) => write!(
                f,
                "circuit breaker open for '{}': half-open trial already in flight",
                self.service_name
            ),
            (_, Some(after)) => write!(
                f,
                "circuit breaker open for '{}': next attempt in {}ms",
                self.service_name,
                after.as_millis()
            ),
            _ => write!(f, "circuit breaker open for '{}'", self.service_name),
        }
    }
}

impl std::error::Error for CircuitOpen {}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<DateTime<Utc>>,
    next_attempt_time: Option<DateTime<Utc>>,
    open_until: Option<Instant>,
    current_cooldown: Duration,
    trial_in_flight: bool,
    trips: u64,
}

/// Per-service circuit breaker.
///
/// - Closed: calls pass; consecutive failures are counted
/// - Open: calls are rejected until the cooldown elapses
/// - Half-open: one trial call at a time; enough successes close the circuit,
///   a failure reopens it with a longer cooldown
///
/// All transitions happen under the breaker's own mutex and are emitted to the
/// configured [`BreakerEventSink`] after the lock is released.
pub struct CircuitBreaker {
    service_name: String,
    cfg: CircuitBreakerConfig,
    state: Mutex<Inner>,
    sink: Arc<dyn BreakerEventSink>,
}

impl CircuitBreaker {
    pub fn new(service_name: impl Into<String>, cfg: CircuitBreakerConfig) -> Self {
        let cooldown = cfg.cooldown;
        Self {
            service_name: service_name.into(),
            cfg,
            state: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
                next_attempt_time: None,
                open_until: None,
                current_cooldown: cooldown,
                trial_in_flight: false,
                trips: 0,
            }),
            sink: Arc::new(NoopEventSink),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn BreakerEventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.cfg
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask for admission of one call.
    ///
    /// An open circuit whose cooldown has elapsed moves to half-open here and
    /// the caller becomes the trial call.
    pub fn allow(&self) -> std::result::Result<CallPermit<'_>, CircuitOpen> {
        let (trial, event) = {
            let mut st = self.lock();
            match st.state {
                CircuitState::Closed => (false, None),
                CircuitState::Open => {
                    let now = Instant::now();
                    if let Some(until) = st.open_until {
                        if now < until {
                            return Err(CircuitOpen {
                                service_name: self.service_name.clone(),
                                state: CircuitState::Open,
                                retry_after: Some(until - now),
                            });
                        }
                    }
                    let event = self.transition(&mut st, CircuitState::HalfOpen);
                    st.success_count = 0;
                    st.trial_in_flight = true;
                    (true, Some(event))
                }
                CircuitState::HalfOpen => {
                    if st.trial_in_flight {
                        return Err(CircuitOpen {
                            service_name: self.service_name.clone(),
                            state: CircuitState::HalfOpen,
                            retry_after: None,
                        });
                    }
                    st.trial_in_flight = true;
                    (true, None)
                }
            }
        };
        if let Some(event) = event {
            self.sink.emit(&event);
        }
        Ok(CallPermit {
            breaker: self,
            trial,
            resolved: false,
        })
    }

    fn transition(&self, st: &mut Inner, to: CircuitState) -> BreakerEvent {
        let from = st.state;
        st.state = to;
        let mut cooldown_ms = None;
        match to {
            CircuitState::Open => {
                let cooldown = st.current_cooldown;
                st.open_until = Some(Instant::now() + cooldown);
                let delta = chrono::Duration::from_std(cooldown)
                    .unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)));
                st.next_attempt_time = Some(Utc::now() + delta);
                st.trips = st.trips.saturating_add(1);
                cooldown_ms = Some(cooldown.as_millis() as u64);
            }
            CircuitState::HalfOpen => {
                st.open_until = None;
            }
            CircuitState::Closed => {
                st.open_until = None;
                st.next_attempt_time = None;
                st.failure_count = 0;
                st.success_count = 0;
                st.trial_in_flight = false;
                st.current_cooldown = self.cfg.cooldown;
            }
        }
        BreakerEvent {
            service_name: self.service_name.clone(),
            from,
            to,
            failure_count: st.failure_count,
            cooldown_ms,
            next_attempt_time: st.next_attempt_time,
            timestamp: Utc::now(),
        }
    }

    fn record_success(&self, trial: bool) -> Option<BreakerEvent> {
        let event = {
            let mut st = self.lock();
            match st.state {
                CircuitState::Closed => {
                    st.failure_count = 0;
                    st.success_count = st.success_count.saturating_add(1);
                    None
                }
                CircuitState::HalfOpen if trial => {
                    st.trial_in_flight = false;
                    st.success_count = st.success_count.saturating_add(1);
                    if st.success_count >= self.cfg.success_threshold {
                        Some(self.transition(&mut st, CircuitState::Closed))
                    } else {
                        None
                    }
                }
                // Late results from calls admitted before the circuit tripped.
                CircuitState::HalfOpen | CircuitState::Open => None,
            }
        };
        if let Some(ref e) = event {
            self.sink.emit(e);
        }
        event
    }

    fn record_failure(&self, trial: bool) -> Option<BreakerEvent> {
        let event = {
            let mut st = self.lock();
            match st.state {
                CircuitState::Closed => {
                    st.failure_count = st.failure_count.saturating_add(1);
                    st.success_count = 0;
                    st.last_failure_time = Some(Utc::now());
                    if st.failure_count >= self.cfg.failure_threshold {
                        Some(self.transition(&mut st, CircuitState::Open))
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen if trial => {
                    st.trial_in_flight = false;
                    st.success_count = 0;
                    st.failure_count = st.failure_count.saturating_add(1);
                    st.last_failure_time = Some(Utc::now());
                    let grown = Duration::try_from_secs_f64(
                        st.current_cooldown.as_secs_f64() * self.cfg.cooldown_multiplier,
                    )
                    .unwrap_or(self.cfg.max_cooldown)
                    .min(self.cfg.max_cooldown);
                    st.current_cooldown = grown;
                    Some(self.transition(&mut st, CircuitState::Open))
                }
                CircuitState::HalfOpen | CircuitState::Open => None,
            }
        };
        if let Some(ref e) = event {
            self.sink.emit(e);
        }
        event
    }

    fn release_trial(&self) {
        let mut st = self.lock();
        if st.state == CircuitState::HalfOpen {
            st.trial_in_flight = false;
        }
    }

    /// Force the circuit closed and clear its counters.
    pub fn reset(&self) {
        let event = {
            let mut st = self.lock();
            let was = st.state;
            let event = self.transition(&mut st, CircuitState::Closed);
            st.last_failure_time = None;
            (was != CircuitState::Closed).then_some(event)
        };
        if let Some(e) = event {
            self.sink.emit(&e);
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        let st = self.lock();
        CircuitBreakerState {
            service_name: self.service_name.clone(),
            state: st.state,
            failure_count: st.failure_count,
            success_count: st.success_count,
            last_failure_time: st.last_failure_time,
            next_attempt_time: st.next_attempt_time,
            failure_threshold: self.cfg.failure_threshold,
            trips: st.trips,
            current_cooldown_ms: st.current_cooldown.as_millis() as u64,
        }
    }
}

/// Admission ticket for one call.
///
/// Resolve it with [`CallPermit::success`] or [`CallPermit::failure`]. A trial
/// permit dropped unresolved (for example, a cancelled call) frees the
/// half-open slot without counting as either outcome.
#[must_use = "resolve the permit with success() or failure()"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    resolved: bool,
}

impl CallPermit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Record a successful call; returns the transition it caused, if any.
    pub fn success(mut self) -> Option<BreakerEvent> {
        self.resolved = true;
        self.breaker.record_success(self.trial)
    }

    /// Record a failed call; returns the transition it caused, if any.
    pub fn failure(mut self) -> Option<BreakerEvent> {
        self.resolved = true;
        self.breaker.record_failure(self.trial)
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved && self.trial {
            self.breaker.release_trial();
        }
    }
}

impl fmt::Debug for CallPermit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallPermit")
            .field("service_name", &self.breaker.service_name)
            .field("trial", &self.trial)
            .field("resolved", &self.resolved)
            .finish()
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("service_name", &self.service_name)
            .field("cfg", &self.cfg)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::events::InMemoryEventSink;
    use std::thread;

    fn fail_n(cb: &CircuitBreaker, n: u32) {
        for _ in 0..n {
            if let Ok(permit) = cb.allow() {
                let _ = permit.failure();
            }
        }
    }

    #[test]
    fn config_defaults() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.success_threshold, 1);
        assert_eq!(config.cooldown, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_validation() {
        assert!(CircuitBreakerConfig::new()
            .with_failure_threshold(0)
            .validate()
            .is_err());
        assert!(CircuitBreakerConfig::new()
            .with_cooldown(Duration::from_secs(60))
            .with_max_cooldown(Duration::from_secs(10))
            .validate()
            .is_err());
        assert!(CircuitBreakerConfig::new()
            .with_cooldown_multiplier(0.5)
            .validate()
            .is_err());
    }

    #[test]
    fn starts_closed() {
        let cb = CircuitBreaker::new("fetcher", CircuitBreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        let permit = cb.allow().unwrap();
        assert!(!permit.is_trial());
        assert!(permit.success().is_none());

        let snapshot = cb.snapshot();
        assert_eq!(snapshot.failure_count, 0);
        assert!(snapshot.next_attempt_time.is_none());
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let cb = CircuitBreaker::new("embedder", CircuitBreakerConfig::new().with_failure_threshold(5));
        fail_n(&cb, 2);
        assert_eq!(cb.failure_count(), 2);
        let _ = cb.allow().unwrap().success();
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn opens_exactly_at_threshold() {
        let cb = CircuitBreaker::new(
            "vector_store",
            CircuitBreakerConfig::new().with_failure_threshold(3),
        );
        fail_n(&cb, 2);
        assert_eq!(cb.state(), CircuitState::Closed);

        let event = cb.allow().unwrap().failure().expect("trip event");
        assert_eq!(event.to, CircuitState::Open);
        assert_eq!(cb.state(), CircuitState::Open);

        let snapshot = cb.snapshot();
        assert!(snapshot.next_attempt_time.unwrap() > Utc::now());
        assert_eq!(snapshot.trips, 1);
    }

    #[test]
    fn open_rejects_without_counting() {
        let cb = CircuitBreaker::new("fetcher", CircuitBreakerConfig::new().with_failure_threshold(5));
        fail_n(&cb, 5);
        let rejection = cb.allow().unwrap_err();
        assert_eq!(rejection.state, CircuitState::Open);
        assert!(rejection.retry_after.is_some());
        assert_eq!(cb.failure_count(), 5);
    }

    #[test]
    fn half_open_admits_single_trial() {
        let cb = CircuitBreaker::new(
            "fetcher",
            CircuitBreakerConfig::new()
                .with_failure_threshold(2)
                .with_cooldown(Duration::from_millis(30))
                .with_max_cooldown(Duration::from_millis(500)),
        );
        fail_n(&cb, 2);
        thread::sleep(Duration::from_millis(40));

        let trial = cb.allow().unwrap();
        assert!(trial.is_trial());
        assert!(format!("{:?}", trial).contains("trial: true"));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.allow().is_err());

        let event = trial.success().expect("close event");
        assert_eq!(event.to, CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert!(cb.allow().is_ok());
    }

    #[test]
    fn half_open_failure_extends_cooldown() {
        let cb = CircuitBreaker::new(
            "embedder",
            CircuitBreakerConfig::new()
                .with_failure_threshold(1)
                .with_cooldown(Duration::from_millis(20))
                .with_cooldown_multiplier(3.0)
                .with_max_cooldown(Duration::from_millis(50)),
        );
        fail_n(&cb, 1);
        thread::sleep(Duration::from_millis(30));

        let event = cb.allow().unwrap().failure().expect("reopen event");
        assert_eq!(event.from, CircuitState::HalfOpen);
        assert_eq!(event.cooldown_ms, Some(50));
        let snapshot = cb.snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.current_cooldown_ms, 50);
        assert_eq!(snapshot.trips, 2);
    }

    #[test]
    fn success_threshold_requires_consecutive_trials() {
        let cb = CircuitBreaker::new(
            "ingestion",
            CircuitBreakerConfig::new()
                .with_failure_threshold(1)
                .with_success_threshold(2)
                .with_cooldown(Duration::from_millis(10)),
        );
        fail_n(&cb, 1);
        thread::sleep(Duration::from_millis(20));

        assert!(cb.allow().unwrap().success().is_none());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        let closed = cb.allow().unwrap().success();
        assert_eq!(closed.map(|e| e.to), Some(CircuitState::Closed));
    }

    #[test]
    fn dropped_trial_releases_slot() {
        let cb = CircuitBreaker::new(
            "fetcher",
            CircuitBreakerConfig::new()
                .with_failure_threshold(1)
                .with_cooldown(Duration::from_millis(10)),
        );
        fail_n(&cb, 1);
        thread::sleep(Duration::from_millis(20));

        drop(cb.allow().unwrap());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.allow().unwrap().is_trial());
    }

    #[test]
    fn transitions_reach_sink() {
        let sink = Arc::new(InMemoryEventSink::new(16));
        let cb = CircuitBreaker::new(
            "fetcher",
            CircuitBreakerConfig::new()
                .with_failure_threshold(1)
                .with_cooldown(Duration::from_millis(10)),
        )
        .with_event_sink(sink.clone());
        fail_n(&cb, 1);
        thread::sleep(Duration::from_millis(20));
        let _ = cb.allow().unwrap().success();

        let transitions: Vec<_> = sink.events().iter().map(|e| (e.from, e.to)).collect();
        assert_eq!(
            transitions,
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[test]
    fn reset_closes_circuit() {
        let cb = CircuitBreaker::new("fetcher", CircuitBreakerConfig::new().with_failure_threshold(1));
        fail_n(&cb, 1);
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.snapshot().last_failure_time.is_none());
    }

    #[test]
    fn concurrent_failures_are_all_counted() {
        let config = CircuitBreakerConfig::new().with_failure_threshold(100);
        let cb = Arc::new(CircuitBreaker::new("shared", config));

        let mut handles = vec![];
        for _ in 0..10 {
            let cb_clone = Arc::clone(&cb);
            handles.push(thread::spawn(move || fail_n(&cb_clone, 5)));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(cb.failure_count(), 50);
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
