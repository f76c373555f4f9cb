//! Service-keyed registry of breakers, limiters and metrics.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info};

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState};
use super::events::{tracing_sink, BreakerEventSink};
use super::metrics::{MetricsSnapshot, ResilienceMetrics};
use super::rate_limiter::{LimitPolicy, RateLimitConfig, RateLimiter};
use super::retry::{RetryConfig, RetryPolicy};
use crate::invoker::ResilientInvoker;
use crate::types::{ErrorType, HealthCheckResult, SystemHealthSummary};
use crate::{Error, Result};

/// Well-known service names used by the pipeline stages.
pub mod services {
    pub const FETCHER: &str = "fetcher";
    pub const EMBEDDER: &str = "embedder";
    pub const VECTOR_STORE: &str = "vector_store";
    pub const INGESTION: &str = "ingestion";

    pub const ALL: [&str; 4] = [FETCHER, EMBEDDER, VECTOR_STORE, INGESTION];
}

/// Everything the invoker needs to know about one external service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServicePolicy {
    pub retry: RetryConfig,
    pub breaker: CircuitBreakerConfig,
    pub rate_limit: Option<RateLimitConfig>,
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Classification for timeouts and circuit rejections on this service.
    pub error_type: ErrorType,
    /// Classification for rate-limit denials.
    pub rate_limit_error_type: ErrorType,
}

impl Default for ServicePolicy {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            rate_limit: None,
            timeout: Duration::from_secs(30),
            error_type: ErrorType::Unknown,
            rate_limit_error_type: ErrorType::Network,
        }
    }
}

impl ServicePolicy {
    pub fn fetch() -> Self {
        Self {
            retry: RetryConfig::for_fetch(),
            rate_limit: Some(RateLimitConfig::per_second(10)),
            error_type: ErrorType::Network,
            ..Self::default()
        }
    }

    pub fn embedding() -> Self {
        Self {
            retry: RetryConfig::for_embedding(),
            rate_limit: Some(
                RateLimitConfig::new(60, Duration::from_secs(60)).with_burst_allowance(10),
            ),
            error_type: ErrorType::Embedding,
            ..Self::default()
        }
    }

    pub fn storage() -> Self {
        Self {
            retry: RetryConfig::for_storage(),
            rate_limit: Some(RateLimitConfig::per_second(50)),
            timeout: Duration::from_secs(10),
            error_type: ErrorType::Storage,
            ..Self::default()
        }
    }

    pub fn ingestion() -> Self {
        Self {
            retry: RetryConfig::for_ingestion(),
            breaker: CircuitBreakerConfig::default().with_failure_threshold(3),
            rate_limit: Some(RateLimitConfig::new(10, Duration::from_secs(60))),
            timeout: Duration::from_secs(60),
            error_type: ErrorType::Storage,
            ..Self::default()
        }
    }

    /// Built-in preset for a service name; unknown names get the generic default.
    pub fn preset(service: &str) -> Self {
        match service {
            services::FETCHER => Self::fetch(),
            services::EMBEDDER => Self::embedding(),
            services::VECTOR_STORE => Self::storage(),
            services::INGESTION => Self::ingestion(),
            _ => Self::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: Option<RateLimitConfig>) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_error_type(mut self, error_type: ErrorType) -> Self {
        self.error_type = error_type;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        self.breaker.validate()?;
        if let Some(ref rl) = self.rate_limit {
            rl.validate()?;
        }
        if self.timeout.is_zero() {
            return Err(Error::invalid_field("timeout_ms", "timeout must be positive"));
        }
        Ok(())
    }

    /// One-line human summary, used by the `validate-config` binary.
    pub fn describe(&self) -> String {
        let limit = match self.rate_limit {
            Some(ref rl) => {
                let policy = match rl.on_limit {
                    LimitPolicy::FailFast => "fail_fast".to_string(),
                    LimitPolicy::Wait { max_wait } => format!("wait<={}ms", max_wait.as_millis()),
                };
                format!(
                    "{} per {}ms (+{} burst, {})",
                    rl.max_requests,
                    rl.window.as_millis(),
                    rl.burst_allowance.unwrap_or(0),
                    policy
                )
            }
            None => "unlimited".to_string(),
        };
        format!(
            "retries={} base={}ms max={}ms x{} jitter={} | breaker threshold={} cooldown={}ms | rate={} | timeout={}ms | type={}",
            self.retry.max_retries,
            self.retry.base_delay.as_millis(),
            self.retry.max_delay.as_millis(),
            self.retry.backoff_multiplier,
            self.retry.jitter,
            self.breaker.failure_threshold,
            self.breaker.cooldown.as_millis(),
            limit,
            self.timeout.as_millis(),
            self.error_type,
        )
    }
}

/// Live resilience state for one service.
pub struct ServiceHandle {
    name: String,
    policy: ServicePolicy,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    limiter: Option<RateLimiter>,
    metrics: ResilienceMetrics,
}

impl ServiceHandle {
    fn new(name: &str, policy: ServicePolicy, sink: Arc<dyn BreakerEventSink>) -> Self {
        Self {
            name: name.to_string(),
            retry: RetryPolicy::new(policy.retry.clone()),
            breaker: CircuitBreaker::new(name, policy.breaker.clone()).with_event_sink(sink),
            limiter: policy.rate_limit.clone().map(RateLimiter::new),
            metrics: ResilienceMetrics::new(),
            policy,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &ServicePolicy {
        &self.policy
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn limiter(&self) -> Option<&RateLimiter> {
        self.limiter.as_ref()
    }

    pub fn metrics(&self) -> &ResilienceMetrics {
        &self.metrics
    }
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("name", &self.name)
            .field("breaker", &self.breaker)
            .finish_non_exhaustive()
    }
}

/// Registry of per-service resilience state, owned by the orchestrator.
///
/// Entries are created lazily on first use and live until [`shutdown`]. Each
/// entry has its own locks; the registry lock is only held to look up or
/// insert an entry.
///
/// [`shutdown`]: ResilienceContext::shutdown
pub struct ResilienceContext {
    policies: HashMap<String, ServicePolicy>,
    services: RwLock<HashMap<String, Arc<ServiceHandle>>>,
    sink: Arc<dyn BreakerEventSink>,
    cancel_grace: Duration,
}

impl Default for ResilienceContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ResilienceContext {
    pub fn new() -> Self {
        Self {
            policies: HashMap::new(),
            services: RwLock::new(HashMap::new()),
            sink: tracing_sink(),
            cancel_grace: Duration::from_secs(5),
        }
    }

    /// Override the policy for one service. Only affects entries created afterwards.
    pub fn with_policy(mut self, service: impl Into<String>, policy: ServicePolicy) -> Self {
        self.policies.insert(service.into(), policy);
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn BreakerEventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// How long an in-flight attempt may run on after cancellation.
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn cancel_grace(&self) -> Duration {
        self.cancel_grace
    }

    pub fn policy_for(&self, service: &str) -> ServicePolicy {
        self.policies
            .get(service)
            .cloned()
            .unwrap_or_else(|| ServicePolicy::preset(service))
    }

    /// Entry for `service`, created on first use.
    pub fn service(&self, service: &str) -> Arc<ServiceHandle> {
        {
            let map = self.services.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(handle) = map.get(service) {
                return Arc::clone(handle);
            }
        }
        let mut map = self.services.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(map.entry(service.to_string()).or_insert_with(|| {
            debug!(service, "registering resilience state");
            Arc::new(ServiceHandle::new(
                service,
                self.policy_for(service),
                Arc::clone(&self.sink),
            ))
        }))
    }

    pub fn invoker(&self, service: &str) -> ResilientInvoker {
        ResilientInvoker::new(self.service(service), self.cancel_grace)
    }

    fn handles(&self) -> Vec<Arc<ServiceHandle>> {
        let map = self.services.read().unwrap_or_else(PoisonError::into_inner);
        let mut handles: Vec<_> = map.values().cloned().collect();
        handles.sort_by(|a, b| a.name.cmp(&b.name));
        handles
    }

    pub fn service_names(&self) -> Vec<String> {
        self.handles().iter().map(|h| h.name.clone()).collect()
    }

    /// Breaker snapshots of every registered service, sorted by name.
    pub fn breaker_states(&self) -> Vec<CircuitBreakerState> {
        self.handles().iter().map(|h| h.breaker.snapshot()).collect()
    }

    pub fn metrics(&self) -> BTreeMap<String, MetricsSnapshot> {
        self.handles()
            .iter()
            .map(|h| (h.name.clone(), h.metrics.snapshot()))
            .collect()
    }

    /// Zero every service's counters; breaker state is kept.
    pub fn reset_metrics(&self) {
        for handle in self.handles() {
            handle.metrics.reset();
        }
    }

    pub fn health(&self) -> SystemHealthSummary {
        SystemHealthSummary::from_states(&self.breaker_states(), Utc::now())
    }

    /// Health of one registered service.
    pub fn check(&self, service: &str) -> Option<HealthCheckResult> {
        let map = self.services.read().unwrap_or_else(PoisonError::into_inner);
        map.get(service).map(|h| {
            let metrics = h.metrics.snapshot();
            HealthCheckResult::from_state(&h.breaker.snapshot(), Some(&metrics), Utc::now())
        })
    }

    /// Drop all registered state.
    pub fn shutdown(&self) {
        let mut map = self.services.write().unwrap_or_else(PoisonError::into_inner);
        let count = map.len();
        map.clear();
        info!(services = count, "resilience context shut down");
    }
}

impl std::fmt::Debug for ResilienceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceContext")
            .field("services", &self.service_names())
            .field("cancel_grace", &self.cancel_grace)
            .finish_non_exhaustive()
    }
}
