use std::collections::BTreeMap;

use super::{ErrorSummary, ReporterThresholds};
use crate::pipeline::IngestionOutcome;
use crate::resilience::{CircuitBreakerState, CircuitState, MetricsSnapshot};
use crate::types::{ErrorType, HealthStatus};

pub(super) struct Facts<'a> {
    pub total: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub errors: &'a ErrorSummary,
    pub breakers: &'a [CircuitBreakerState],
    pub metrics: &'a BTreeMap<String, MetricsSnapshot>,
    pub ingestion: &'a [IngestionOutcome],
}

/// Most frequent error type; ties go to the earlier type in taxonomy order.
fn dominant_error(by_type: &BTreeMap<ErrorType, usize>) -> Option<(ErrorType, usize)> {
    by_type
        .iter()
        .fold(None, |best: Option<(ErrorType, usize)>, (ty, n)| match best {
            Some((_, m)) if m >= *n => best,
            _ => Some((*ty, *n)),
        })
}

pub(super) fn derive(thresholds: &ReporterThresholds, facts: &Facts<'_>) -> Vec<String> {
    let mut out = Vec::new();

    if facts.total > 0 && facts.success_rate < thresholds.low_success_rate {
        if let Some((ty, n)) = dominant_error(&facts.errors.by_type) {
            out.push(format!(
                "Success rate {:.2}% is below {:.2}%: investigate {} errors ({} of {} failed items)",
                facts.success_rate, thresholds.low_success_rate, ty, n, facts.failed
            ));
        }
    }

    let mut breakers: Vec<&CircuitBreakerState> = facts.breakers.iter().collect();
    breakers.sort_by(|a, b| a.service_name.cmp(&b.service_name));
    for b in &breakers {
        match b.state {
            CircuitState::Open => out.push(match b.next_attempt_time {
                Some(at) => format!(
                    "Circuit for {} is open: wait for the cooldown to elapse (next attempt at {}) before retrying",
                    b.service_name,
                    at.to_rfc3339()
                ),
                None => format!(
                    "Circuit for {} is open: wait for the cooldown to elapse before retrying",
                    b.service_name
                ),
            }),
            _ if HealthStatus::from_breaker(b) == HealthStatus::Degraded => out.push(format!(
                "Service {} is degraded ({} state, {} consecutive failures): avoid raising load until it recovers",
                b.service_name, b.state, b.failure_count
            )),
            _ => {}
        }
    }

    for (service, m) in facts.metrics {
        if m.rate_limit_hits >= thresholds.high_rate_limit_hits && m.rate_limit_hits > 0 {
            out.push(format!(
                "Service {} hit its rate limit {} times: lower fan_out or raise its rate limit",
                service, m.rate_limit_hits
            ));
        }
    }

    if facts.errors.recoverable > 0 {
        out.push(format!(
            "{} item(s) failed with recoverable errors: re-run them (see retryable_operations)",
            facts.errors.recoverable
        ));
    }
    if facts.errors.non_recoverable > 0 {
        out.push(format!(
            "{} item(s) failed with non-recoverable errors: review their input or the service configuration",
            facts.errors.non_recoverable
        ));
    }

    let failed_batches: Vec<String> = facts
        .ingestion
        .iter()
        .filter(|i| !i.is_success())
        .map(|i| i.batch_index.to_string())
        .collect();
    if !failed_batches.is_empty() {
        out.push(format!(
            "Ingestion trigger failed for batch(es) {}: re-run ingestion for those batches",
            failed_batches.join(", ")
        ));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(by_type: &[(ErrorType, usize)], recoverable: usize, non_recoverable: usize) -> ErrorSummary {
        ErrorSummary {
            total: recoverable + non_recoverable,
            by_type: by_type.iter().cloned().collect(),
            recoverable,
            non_recoverable,
            details: Vec::new(),
        }
    }

    #[test]
    fn dominant_prefers_count_then_taxonomy_order() {
        let by_type: BTreeMap<_, _> =
            [(ErrorType::Storage, 2), (ErrorType::Network, 2), (ErrorType::Parsing, 1)]
                .into_iter()
                .collect();
        assert_eq!(dominant_error(&by_type), Some((ErrorType::Network, 2)));
        assert_eq!(dominant_error(&BTreeMap::new()), None);
    }

    #[test]
    fn low_success_rate_names_dominant_type() {
        let errors = summary(&[(ErrorType::Validation, 10)], 0, 10);
        let recs = derive(
            &ReporterThresholds::default(),
            &Facts {
                total: 10,
                failed: 10,
                success_rate: 0.0,
                errors: &errors,
                breakers: &[],
                metrics: &BTreeMap::new(),
                ingestion: &[],
            },
        );
        assert!(recs[0].contains("investigate validation errors"));
        assert!(recs.iter().any(|r| r.contains("non-recoverable")));
    }

    #[test]
    fn rate_limit_hits_are_called_out() {
        let errors = summary(&[], 0, 0);
        let mut metrics = BTreeMap::new();
        metrics.insert(
            "fetcher".to_string(),
            MetricsSnapshot {
                rate_limit_hits: 12,
                ..MetricsSnapshot::default()
            },
        );
        let recs = derive(
            &ReporterThresholds::default(),
            &Facts {
                total: 3,
                failed: 0,
                success_rate: 100.0,
                errors: &errors,
                breakers: &[],
                metrics: &metrics,
                ingestion: &[],
            },
        );
        assert_eq!(recs.len(), 1);
        assert!(recs[0].contains("fetcher hit its rate limit 12 times"));
    }

    #[test]
    fn clean_run_has_no_recommendations() {
        let errors = summary(&[], 0, 0);
        let recs = derive(
            &ReporterThresholds::default(),
            &Facts {
                total: 5,
                failed: 0,
                success_rate: 100.0,
                errors: &errors,
                breakers: &[],
                metrics: &BTreeMap::new(),
                ingestion: &[],
            },
        );
        assert!(recs.is_empty());
    }
}
