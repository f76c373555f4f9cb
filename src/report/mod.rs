//! 运行报告模块：把每个条目的结果汇总为部分成功报告。
//!
//! # Partial-Success Reporting
//!
//! [`ResilienceReporter`] turns the outcome list of one run, plus breaker and
//! metrics snapshots, into a [`PartialSuccessReport`]. Building is a pure
//! function of its [`ReportInput`]: outcomes are sorted by item id and every
//! map is ordered, so the report does not depend on completion order and two
//! builds from the same input compare equal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::pipeline::{IngestionOutcome, ItemOutcome, Stage};
use crate::resilience::{CircuitBreakerState, MetricsSnapshot};
use crate::types::{CrawlerError, ErrorType, SystemHealthSummary};
use crate::{Error, Result};

mod recommendations;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub total: usize,
    pub by_type: BTreeMap<ErrorType, usize>,
    pub recoverable: usize,
    pub non_recoverable: usize,
    /// Terminal errors ordered by item id.
    pub details: Vec<CrawlerError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialSuccessReport {
    pub execution_id: String,
    pub timestamp: DateTime<Utc>,
    pub total_operations: usize,
    pub successful_operations: usize,
    pub failed_operations: usize,
    /// Percentage, rounded to two decimals.
    pub success_rate: f64,
    pub partial_success: bool,
    pub errors: ErrorSummary,
    pub failures_by_stage: BTreeMap<Stage, usize>,
    pub recommendations: Vec<String>,
    pub retryable_operations: Vec<String>,
    pub system_health: SystemHealthSummary,
    pub metrics: BTreeMap<String, MetricsSnapshot>,
    pub ingestion: Vec<IngestionOutcome>,
}

impl PartialSuccessReport {
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(Error::from)
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed_operations == 0
    }
}

/// Thresholds that drive recommendations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReporterThresholds {
    /// Below this success rate (percent) the dominant error type is called out.
    pub low_success_rate: f64,
    /// At or above this many rate-limit hits a service is called out.
    pub high_rate_limit_hits: u64,
}

impl Default for ReporterThresholds {
    fn default() -> Self {
        Self {
            low_success_rate: 80.0,
            high_rate_limit_hits: 10,
        }
    }
}

impl ReporterThresholds {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.low_success_rate) {
            return Err(Error::invalid_field(
                "reporter.low_success_rate",
                "must be a percentage between 0 and 100",
            ));
        }
        Ok(())
    }
}

/// Everything one report is built from.
#[derive(Debug, Clone, Copy)]
pub struct ReportInput<'a> {
    pub execution_id: &'a str,
    pub timestamp: DateTime<Utc>,
    pub outcomes: &'a [ItemOutcome],
    pub breakers: &'a [CircuitBreakerState],
    pub metrics: &'a BTreeMap<String, MetricsSnapshot>,
    pub ingestion: &'a [IngestionOutcome],
}

#[derive(Debug, Clone, Default)]
pub struct ResilienceReporter {
    thresholds: ReporterThresholds,
}

impl ResilienceReporter {
    pub fn new(thresholds: ReporterThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &ReporterThresholds {
        &self.thresholds
    }

    pub fn build(&self, input: ReportInput<'_>) -> PartialSuccessReport {
        let mut outcomes: Vec<&ItemOutcome> = input.outcomes.iter().collect();
        outcomes.sort_by(|a, b| outcome_key(a).cmp(&outcome_key(b)));

        let total = outcomes.len();
        let successful = outcomes.iter().filter(|o| o.is_success()).count();
        let failed = total - successful;
        let success_rate = success_rate(successful, total);

        let mut by_type = BTreeMap::new();
        let mut failures_by_stage = BTreeMap::new();
        let mut details = Vec::with_capacity(failed);
        let mut retryable_operations = Vec::new();
        for outcome in &outcomes {
            let Some(ref error) = outcome.final_error else {
                continue;
            };
            *by_type.entry(error.error_type()).or_insert(0) += 1;
            if let Some(stage) = outcome.failed_stage {
                *failures_by_stage.entry(stage).or_insert(0) += 1;
            }
            if error.is_recoverable() {
                retryable_operations.push(outcome.item_id.clone());
            }
            details.push(error.clone());
        }
        let recoverable = retryable_operations.len();

        let mut ingestion = input.ingestion.to_vec();
        ingestion.sort_by_key(|i| i.batch_index);

        let errors = ErrorSummary {
            total: failed,
            by_type,
            recoverable,
            non_recoverable: failed - recoverable,
            details,
        };
        let system_health = SystemHealthSummary::from_states(input.breakers, input.timestamp);

        let recommendations = recommendations::derive(
            &self.thresholds,
            &recommendations::Facts {
                total,
                failed,
                success_rate,
                errors: &errors,
                breakers: input.breakers,
                metrics: input.metrics,
                ingestion: &ingestion,
            },
        );

        PartialSuccessReport {
            execution_id: input.execution_id.to_string(),
            timestamp: input.timestamp,
            total_operations: total,
            successful_operations: successful,
            failed_operations: failed,
            success_rate,
            partial_success: failed > 0 && successful > 0,
            errors,
            failures_by_stage,
            recommendations,
            retryable_operations,
            system_health,
            metrics: input.metrics.clone(),
            ingestion,
        }
    }
}

type ErrorKey<'a> = (ErrorType, &'a str, DateTime<Utc>, u32, bool);

/// Total order over outcomes, so items sharing an id still sort the same way
/// whatever order they completed in.
fn outcome_key(
    o: &ItemOutcome,
) -> (&str, &str, Option<Stage>, Option<ErrorKey<'_>>, usize, usize, &[Stage]) {
    let error = o.final_error.as_ref().map(|e| {
        (e.error_type(), e.message(), e.timestamp(), e.retry_count(), e.is_recoverable())
    });
    (
        o.item_id.as_str(),
        o.url.as_str(),
        o.failed_stage,
        error,
        o.vectors_stored,
        o.chunks,
        o.stages_completed.as_slice(),
    )
}

/// `successful / total * 100`, two decimals; 100 for an empty run.
fn success_rate(successful: usize, total: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    let pct = successful as f64 / total as f64 * 100.0;
    (pct * 100.0).round() / 100.0
}
