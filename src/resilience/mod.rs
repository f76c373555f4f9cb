//! 弹性模式模块：为每个外部服务提供重试、熔断、限流与运行指标。
//!
//! # Resilience Primitives
//!
//! Per-service failure isolation for the ingestion pipeline. Every external
//! service (fetch target, embedding endpoint, vector store, ingestion job) gets
//! its own breaker, limiter and counters, held in a [`ResilienceContext`].
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`retry`] | Exponential backoff with jitter |
//! | [`circuit_breaker`] | Closed / open / half-open state machine |
//! | [`rate_limiter`] | Sliding-window limiter with burst credit |
//! | [`metrics`] | Lock-free per-service counters |
//! | [`events`] | Breaker transition events and sinks |
//! | [`registry`] | Service-keyed registry and per-service policies |
//!
//! ```rust
//! use ingest_resilience::resilience::{ResilienceContext, ServicePolicy, services};
//! use ingest_resilience::resilience::circuit_breaker::CircuitBreakerConfig;
//!
//! let ctx = ResilienceContext::new().with_policy(
//!     services::EMBEDDER,
//!     ServicePolicy::embedding()
//!         .with_breaker(CircuitBreakerConfig::new().with_failure_threshold(3)),
//! );
//! let embedder = ctx.service(services::EMBEDDER);
//! assert_eq!(embedder.breaker().config().failure_threshold, 3);
//! assert!(ctx.health().is_healthy());
//! ```

pub mod circuit_breaker;
pub mod events;
pub mod metrics;
pub mod rate_limiter;
pub mod registry;
pub mod retry;

pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, CircuitOpen,
    CircuitState,
};
pub use events::{
    BreakerEvent, BreakerEventSink, CompositeEventSink, InMemoryEventSink, NoopEventSink,
    TracingEventSink,
};
pub use metrics::{MetricsSnapshot, ResilienceMetrics};
pub use rate_limiter::{
    Admission, LimitPolicy, RateLimitConfig, RateLimited, RateLimiter, RateLimiterSnapshot,
};
pub use registry::{services, ResilienceContext, ServiceHandle, ServicePolicy};
pub use retry::{RetryConfig, RetryPolicy};
