//! Health views derived from circuit breaker snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::resilience::circuit_breaker::{CircuitBreakerState, CircuitState};
use crate::resilience::metrics::MetricsSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Map a breaker snapshot onto a health status.
    ///
    /// A closed breaker whose consecutive failure count has reached half of its
    /// trip threshold is degraded.
    pub fn from_breaker(state: &CircuitBreakerState) -> Self {
        match state.state {
            CircuitState::Open => HealthStatus::Unhealthy,
            CircuitState::HalfOpen => HealthStatus::Degraded,
            CircuitState::Closed => {
                if state.failure_count > 0
                    && state.failure_count.saturating_mul(2) >= state.failure_threshold
                {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                }
            }
        }
    }
}

/// Point-in-time health of one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub service_name: String,
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", with = "opt_duration_ms")]
    pub response_time: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, Value>>,
}

impl HealthCheckResult {
    pub fn from_state(
        state: &CircuitBreakerState,
        metrics: Option<&MetricsSnapshot>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let status = HealthStatus::from_breaker(state);
        let error_message = match state.state {
            CircuitState::Open => Some(match state.next_attempt_time {
                Some(at) => format!("circuit open until {}", at.to_rfc3339()),
                None => "circuit open".to_string(),
            }),
            CircuitState::HalfOpen => Some("circuit half-open, probing recovery".to_string()),
            CircuitState::Closed if status == HealthStatus::Degraded => Some(format!(
                "{} consecutive failures (trip threshold {})",
                state.failure_count, state.failure_threshold
            )),
            CircuitState::Closed => None,
        };

        let mut metadata = BTreeMap::new();
        metadata.insert("failure_count".to_string(), Value::from(state.failure_count));
        metadata.insert("success_count".to_string(), Value::from(state.success_count));
        metadata.insert("trips".to_string(), Value::from(state.trips));
        let response_time = metrics.and_then(|m| {
            metadata.insert("total_requests".to_string(), Value::from(m.total_requests));
            metadata.insert("rate_limit_hits".to_string(), Value::from(m.rate_limit_hits));
            if m.total_requests == 0 {
                None
            } else {
                Some(Duration::from_secs_f64(m.average_response_time_ms.max(0.0) / 1000.0))
            }
        });

        Self {
            service_name: state.service_name.clone(),
            status,
            timestamp,
            response_time,
            error_message,
            metadata: Some(metadata),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceHealthDetail {
    pub name: String,
    pub status: HealthStatus,
    pub circuit_breaker_state: CircuitState,
    pub failure_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_time: Option<DateTime<Utc>>,
}

/// Health across every service known to the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealthSummary {
    pub timestamp: DateTime<Utc>,
    pub overall_status: HealthStatus,
    pub total_services: usize,
    pub healthy_services: usize,
    pub degraded_services: usize,
    pub unhealthy_services: usize,
    pub service_details: Vec<ServiceHealthDetail>,
}

impl SystemHealthSummary {
    /// Build a summary from breaker snapshots; details are ordered by service name.
    ///
    /// Overall status: healthy when every service is healthy, unhealthy when more
    /// than half the services are unhealthy, degraded otherwise.
    pub fn from_states(states: &[CircuitBreakerState], timestamp: DateTime<Utc>) -> Self {
        let mut service_details: Vec<ServiceHealthDetail> = states
            .iter()
            .map(|s| ServiceHealthDetail {
                name: s.service_name.clone(),
                status: HealthStatus::from_breaker(s),
                circuit_breaker_state: s.state,
                failure_count: s.failure_count,
                last_failure_time: s.last_failure_time,
            })
            .collect();
        service_details.sort_by(|a, b| a.name.cmp(&b.name));

        let count = |status: HealthStatus| {
            service_details
                .iter()
                .filter(|d| d.status == status)
                .count()
        };
        let total_services = service_details.len();
        let healthy_services = count(HealthStatus::Healthy);
        let degraded_services = count(HealthStatus::Degraded);
        let unhealthy_services = count(HealthStatus::Unhealthy);

        let overall_status = if healthy_services == total_services {
            HealthStatus::Healthy
        } else if unhealthy_services * 2 > total_services {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        };

        Self {
            timestamp,
            overall_status,
            total_services,
            healthy_services,
            degraded_services,
            unhealthy_services,
            service_details,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.overall_status == HealthStatus::Healthy
    }
}

mod opt_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_secs_f64() * 1000.0)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let ms: Option<f64> = Option::deserialize(d)?;
        Ok(ms.map(|ms| Duration::from_secs_f64(ms.max(0.0) / 1000.0)))
    }
}
