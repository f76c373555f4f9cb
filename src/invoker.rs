//! Retry, breaker and rate-limit composition around one collaborator call.
//!
//! Per invocation:
//! - the rate limiter is consulted once, before the first attempt
//! - the circuit breaker is consulted before every attempt
//! - each attempt runs under the service timeout with a fresh [`ErrorContext`]
//! - failures are retried while the [`RetryPolicy`](crate::resilience::RetryPolicy)
//!   allows it, sleeping asynchronously between attempts
//!
//! Every invocation ends in exactly one `Result<T, CrawlerError>`.

use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::collaborators::Fault;
use crate::resilience::{Admission, ServiceHandle};
use crate::types::{CrawlerError, ErrorContext, ErrorType};

/// Describes the call being made, for error context and logs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallDescriptor {
    pub endpoint: String,
    pub method: String,
    pub url: Option<String>,
    pub parameters: Option<BTreeMap<String, Value>>,
}

impl CallDescriptor {
    pub fn new(endpoint: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: method.into(),
            url: None,
            parameters: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    fn context(&self, attempt: u32) -> ErrorContext {
        let mut ctx = ErrorContext::new(&self.endpoint, &self.method).with_info("attempt", attempt);
        if let Some(ref params) = self.parameters {
            ctx = ctx.with_parameters(params.clone());
        }
        ctx
    }

    fn error(&self, error_type: ErrorType, message: impl Into<String>) -> crate::types::CrawlerErrorBuilder {
        let builder = CrawlerError::builder(error_type, message);
        match self.url {
            Some(ref url) => builder.url(url.clone()),
            None => builder,
        }
    }
}

enum AttemptOutcome<T> {
    Done(Result<T, Fault>),
    TimedOut,
    /// Cancelled and still running after the grace period.
    Abandoned,
}

/// Runs collaborator calls for one service under its resilience policy.
#[derive(Clone)]
pub struct ResilientInvoker {
    service: Arc<ServiceHandle>,
    cancel_grace: Duration,
}

impl ResilientInvoker {
    pub fn new(service: Arc<ServiceHandle>, cancel_grace: Duration) -> Self {
        Self {
            service,
            cancel_grace,
        }
    }

    pub fn service(&self) -> &ServiceHandle {
        &self.service
    }

    /// Invoke `op` under the service policy, without cancellation.
    pub async fn invoke<T, F, Fut>(&self, call: &CallDescriptor, op: F) -> Result<T, CrawlerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Fault>>,
    {
        self.invoke_with_cancel(call, &CancellationToken::new(), op)
            .await
    }

    /// Invoke `op` under the service policy.
    ///
    /// After `cancel` fires no new attempt starts; an attempt already in flight
    /// gets the grace period to finish.
    pub async fn invoke_with_cancel<T, F, Fut>(
        &self,
        call: &CallDescriptor,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, CrawlerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Fault>>,
    {
        let svc = &self.service;
        let policy = svc.policy();

        if let Some(limiter) = svc.limiter() {
            let admission = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.cancelled(call, 0)),
                admission = limiter.acquire() => admission,
            };
            match admission {
                Ok(Admission::Immediate) => {}
                Ok(Admission::Deferred { waited }) => {
                    svc.metrics().record_rate_limit_hit();
                    debug!(
                        service = svc.name(),
                        waited_ms = waited.as_millis() as u64,
                        "rate limit deferred call"
                    );
                }
                Err(denied) => {
                    svc.metrics().record_rate_limit_hit();
                    warn!(
                        service = svc.name(),
                        retry_after_ms = denied.retry_after.as_millis() as u64,
                        "rate limit denied call"
                    );
                    return Err(call
                        .error(
                            policy.rate_limit_error_type,
                            format!("rate limit exceeded for {}: {}", svc.name(), denied),
                        )
                        .recoverable(true)
                        .context(
                            call.context(0)
                                .with_info("retry_after_ms", denied.retry_after.as_millis() as u64),
                        )
                        .build());
                }
            }
        }

        let mut attempt: u32 = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(self.cancelled(call, attempt - 1));
            }

            let permit = match svc.breaker().allow() {
                Ok(permit) => permit,
                Err(open) => {
                    warn!(service = svc.name(), state = %open.state, "circuit rejected call");
                    let mut ctx = call.context(attempt);
                    if let Some(after) = open.retry_after {
                        ctx = ctx.with_info("retry_after_ms", after.as_millis() as u64);
                    }
                    return Err(call
                        .error(policy.error_type, open.to_string())
                        .recoverable(false)
                        .retry_count(attempt - 1)
                        .context(ctx)
                        .build());
                }
            };

            let context = call.context(attempt);
            debug!(
                service = svc.name(),
                attempt,
                request_id = context.request_id.as_str(),
                trial = permit.is_trial(),
                "attempting call"
            );

            let started = Instant::now();
            let outcome = self.attempt(op(), cancel).await;
            let elapsed = started.elapsed();

            let fault = match outcome {
                AttemptOutcome::Done(Ok(value)) => {
                    permit.success();
                    svc.metrics().record_success(elapsed);
                    return Ok(value);
                }
                AttemptOutcome::Done(Err(fault)) => fault,
                AttemptOutcome::TimedOut => Fault::new(
                    policy.error_type,
                    format!("attempt timed out after {}ms", policy.timeout.as_millis()),
                    true,
                ),
                AttemptOutcome::Abandoned => {
                    // The service did not fail; leave the breaker alone.
                    drop(permit);
                    svc.metrics().record_failure(elapsed);
                    warn!(service = svc.name(), attempt, "attempt abandoned after cancellation");
                    return Err(call
                        .error(
                            policy.error_type,
                            format!(
                                "attempt abandoned after {}ms cancellation grace",
                                self.cancel_grace.as_millis()
                            ),
                        )
                        .recoverable(true)
                        .retry_count(attempt - 1)
                        .context(context.with_info("cancelled", true))
                        .build());
                }
            };

            // A rejected request still proves the service is answering.
            let tripped = if fault.error_type == ErrorType::Validation {
                permit.success();
                false
            } else {
                permit.failure().map(|e| e.opened()).unwrap_or(false)
            };
            if tripped {
                svc.metrics().record_trip();
            }
            svc.metrics().record_failure(elapsed);

            let mut context = context;
            if let Some(details) = fault.details {
                for (k, v) in details {
                    context = context.with_info(k, v);
                }
            }
            let error = call
                .error(fault.error_type, fault.message)
                .recoverable(fault.recoverable)
                .retry_count(attempt - 1)
                .context(context)
                .build();

            // The breaker would reject the next attempt; keep the fault that opened it.
            if tripped {
                warn!(service = svc.name(), attempts = attempt, error = %error, "circuit opened, giving up");
                return Err(error);
            }

            match svc.retry().decide(attempt, &error) {
                Some(delay) if !cancel.is_cancelled() => {
                    svc.metrics().record_retry();
                    debug!(
                        service = svc.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying after backoff"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(error),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt = attempt.saturating_add(1);
                }
                _ => {
                    debug!(service = svc.name(), attempts = attempt, error = %error, "giving up");
                    return Err(error);
                }
            }
        }
    }

    async fn attempt<T, Fut>(&self, fut: Fut, cancel: &CancellationToken) -> AttemptOutcome<T>
    where
        Fut: Future<Output = Result<T, Fault>>,
    {
        let call = tokio::time::timeout(self.service.policy().timeout, fut);
        tokio::pin!(call);

        tokio::select! {
            biased;
            res = &mut call => return res.map_or(AttemptOutcome::TimedOut, AttemptOutcome::Done),
            _ = cancel.cancelled() => {}
        }

        match tokio::time::timeout(self.cancel_grace, &mut call).await {
            Ok(Ok(res)) => AttemptOutcome::Done(res),
            Ok(Err(_)) => AttemptOutcome::TimedOut,
            Err(_) => AttemptOutcome::Abandoned,
        }
    }

    fn cancelled(&self, call: &CallDescriptor, retries: u32) -> CrawlerError {
        call.error(
            ErrorType::Unknown,
            format!("cancelled before calling {}", self.service.name()),
        )
        .recoverable(true)
        .retry_count(retries)
        .build()
    }
}

impl std::fmt::Debug for ResilientInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientInvoker")
            .field("service", &self.service.name())
            .field("cancel_grace", &self.cancel_grace)
            .finish()
    }
}
