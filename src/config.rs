//! File-based resilience configuration.
//!
//! ```yaml
//! pipeline:
//!   fan_out: 8
//!   batch_size: 25
//!   cancel_grace_ms: 5000
//!   run_deadline_ms: 600000
//! reporter:
//!   low_success_rate: 80
//!   high_rate_limit_hits: 10
//! services:
//!   embedder:
//!     timeout_ms: 20000
//!     retry: { max_retries: 4, base_delay_ms: 250 }
//!     circuit_breaker: { failure_threshold: 3, cooldown_ms: 60000 }
//!     rate_limit: { max_requests: 100, window_ms: 60000, on_limit: wait, max_wait_ms: 2000 }
//! ```
//!
//! Every field is optional. Unset fields keep the built-in per-service preset.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::collaborators::TextChunker;
use crate::pipeline::PipelineConfig;
use crate::report::{ReporterThresholds, ResilienceReporter};
use crate::resilience::{services, LimitPolicy, ResilienceContext, ServicePolicy};
use crate::types::ErrorType;
use crate::{Error, ErrorSite, Result};

/// Environment variable naming the config file read by [`ResilienceConfig::from_env`].
pub const CONFIG_ENV: &str = "INGEST_RESILIENCE_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResilienceConfig {
    pub pipeline: PipelineSection,
    pub reporter: ReporterThresholds,
    pub services: BTreeMap<String, ServiceSection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineSection {
    pub fan_out: usize,
    pub batch_size: usize,
    pub cancel_grace_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_deadline_ms: Option<u64>,
    pub trigger_ingestion: bool,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for PipelineSection {
    fn default() -> Self {
        let pipeline = PipelineConfig::default();
        let chunker = TextChunker::default();
        Self {
            fan_out: pipeline.fan_out,
            batch_size: pipeline.batch_size,
            cancel_grace_ms: 5_000,
            run_deadline_ms: None,
            trigger_ingestion: pipeline.trigger_ingestion,
            chunk_size: chunker.chunk_size(),
            chunk_overlap: chunker.overlap(),
        }
    }
}

/// Overrides for one service; unset fields keep the preset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_error_type: Option<ErrorType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<BreakerSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitSection>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySection {
    pub max_retries: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub jitter: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerSection {
    pub failure_threshold: Option<u32>,
    pub success_threshold: Option<u32>,
    pub cooldown_ms: Option<u64>,
    pub cooldown_multiplier: Option<f64>,
    pub max_cooldown_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnLimit {
    FailFast,
    Wait,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitSection {
    /// `false` removes the limiter for this service.
    pub enabled: bool,
    pub max_requests: Option<u32>,
    pub window_ms: Option<u64>,
    pub burst_allowance: Option<u32>,
    pub on_limit: Option<OnLimit>,
    pub max_wait_ms: Option<u64>,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: None,
            window_ms: None,
            burst_allowance: None,
            on_limit: None,
            max_wait_ms: None,
        }
    }
}

const DEFAULT_MAX_WAIT_MS: u64 = 5_000;

impl ServiceSection {
    /// Apply these overrides on top of `base`.
    pub fn apply(&self, mut base: ServicePolicy) -> ServicePolicy {
        if let Some(ms) = self.timeout_ms {
            base.timeout = Duration::from_millis(ms);
        }
        if let Some(t) = self.error_type {
            base.error_type = t;
        }
        if let Some(t) = self.rate_limit_error_type {
            base.rate_limit_error_type = t;
        }
        if let Some(ref r) = self.retry {
            let retry = &mut base.retry;
            if let Some(n) = r.max_retries {
                retry.max_retries = n;
            }
            if let Some(ms) = r.base_delay_ms {
                retry.base_delay = Duration::from_millis(ms);
            }
            if let Some(ms) = r.max_delay_ms {
                retry.max_delay = Duration::from_millis(ms);
            }
            if let Some(m) = r.backoff_multiplier {
                retry.backoff_multiplier = m;
            }
            if let Some(j) = r.jitter {
                retry.jitter = j;
            }
        }
        if let Some(ref b) = self.circuit_breaker {
            let breaker = &mut base.breaker;
            if let Some(n) = b.failure_threshold {
                breaker.failure_threshold = n;
            }
            if let Some(n) = b.success_threshold {
                breaker.success_threshold = n;
            }
            if let Some(ms) = b.cooldown_ms {
                breaker.cooldown = Duration::from_millis(ms);
            }
            if let Some(m) = b.cooldown_multiplier {
                breaker.cooldown_multiplier = m;
            }
            if let Some(ms) = b.max_cooldown_ms {
                breaker.max_cooldown = Duration::from_millis(ms);
            }
        }
        if let Some(ref rl) = self.rate_limit {
            base.rate_limit = if rl.enabled {
                let mut limit = base.rate_limit.take().unwrap_or_default();
                if let Some(n) = rl.max_requests {
                    limit.max_requests = n;
                }
                if let Some(ms) = rl.window_ms {
                    limit.window = Duration::from_millis(ms);
                }
                if rl.burst_allowance.is_some() {
                    limit.burst_allowance = rl.burst_allowance;
                }
                match rl.on_limit {
                    Some(OnLimit::FailFast) => limit.on_limit = LimitPolicy::FailFast,
                    Some(OnLimit::Wait) => {
                        limit.on_limit = LimitPolicy::Wait {
                            max_wait: Duration::from_millis(
                                rl.max_wait_ms.unwrap_or(DEFAULT_MAX_WAIT_MS),
                            ),
                        }
                    }
                    None => {
                        if let (LimitPolicy::Wait { .. }, Some(ms)) = (limit.on_limit, rl.max_wait_ms) {
                            limit.on_limit = LimitPolicy::Wait {
                                max_wait: Duration::from_millis(ms),
                            };
                        }
                    }
                }
                Some(limit)
            } else {
                None
            };
        }
        base
    }
}

impl ResilienceConfig {
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(classify_parse_error)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(Error::from)
    }

    /// Load from a `.json`, `.yaml` or `.yml` file and validate it.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let config = if is_json {
            Self::from_json_str(&content)?
        } else {
            Self::from_yaml_str(&content)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Load the file named by `INGEST_RESILIENCE_CONFIG`, or defaults when unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path.trim()),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.pipeline_config().validate()?;
        TextChunker::new(self.pipeline.chunk_size, self.pipeline.chunk_overlap)?;
        self.reporter.validate()?;
        for (name, section) in &self.services {
            if name.trim().is_empty() {
                return Err(Error::invalid_field("services", "service name must not be empty"));
            }
            if let Some(RateLimitSection {
                on_limit: Some(OnLimit::FailFast),
                max_wait_ms: Some(_),
                ..
            }) = section.rate_limit
            {
                return Err(Error::invalid_field(
                    format!("services.{}.rate_limit.max_wait_ms", name),
                    "max_wait_ms only applies to on_limit: wait",
                ));
            }
            self.policy_for(name)
                .validate()
                .map_err(|e| e.within(&format!("services.{}", name)))?;
        }
        Ok(())
    }

    /// Effective policy for a service: its preset with configured overrides.
    pub fn policy_for(&self, service: &str) -> ServicePolicy {
        let preset = ServicePolicy::preset(service);
        match self.services.get(service) {
            Some(section) => section.apply(preset),
            None => preset,
        }
    }

    /// Effective policies for the pipeline services plus any configured extras.
    pub fn effective_policies(&self) -> BTreeMap<String, ServicePolicy> {
        services::ALL
            .iter()
            .map(|s| s.to_string())
            .chain(self.services.keys().cloned())
            .map(|name| {
                let policy = self.policy_for(&name);
                (name, policy)
            })
            .collect()
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            fan_out: self.pipeline.fan_out,
            batch_size: self.pipeline.batch_size,
            run_deadline: self.pipeline.run_deadline_ms.map(Duration::from_millis),
            trigger_ingestion: self.pipeline.trigger_ingestion,
        }
    }

    pub fn chunker(&self) -> Result<TextChunker> {
        TextChunker::new(self.pipeline.chunk_size, self.pipeline.chunk_overlap)
    }

    pub fn reporter(&self) -> ResilienceReporter {
        ResilienceReporter::new(self.reporter.clone())
    }

    /// A fresh registry carrying every effective policy.
    pub fn build_context(&self) -> Arc<ResilienceContext> {
        let ctx = self
            .effective_policies()
            .into_iter()
            .fold(ResilienceContext::new(), |ctx, (name, policy)| {
                ctx.with_policy(name, policy)
            })
            .with_cancel_grace(Duration::from_millis(self.pipeline.cancel_grace_ms));
        Arc::new(ctx)
    }
}

/// Structural mismatches are configuration errors; everything else is a YAML error.
fn classify_parse_error(e: serde_yaml::Error) -> Error {
    let msg = e.to_string();
    let structural = msg.contains("missing field")
        || msg.contains("unknown field")
        || msg.contains("unknown variant")
        || msg.contains("invalid type")
        || msg.contains("invalid value");
    if structural {
        Error::configuration_with_site(
            format!("invalid config structure: {}", msg),
            ErrorSite::new().with_source("config_loader"),
        )
    } else {
        Error::Yaml(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_defaults() {
        let cfg = ResilienceConfig::from_yaml_str("{}").unwrap();
        assert_eq!(cfg, ResilienceConfig::default());
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.policy_for(services::FETCHER), ServicePolicy::fetch());
    }

    #[test]
    fn overrides_merge_onto_presets() {
        let cfg = ResilienceConfig::from_yaml_str(
            r#"
services:
  embedder:
    timeout_ms: 1500
    retry:
      max_retries: 7
    circuit_breaker:
      failure_threshold: 2
    rate_limit:
      on_limit: wait
      max_wait_ms: 250
"#,
        )
        .unwrap();
        let p = cfg.policy_for(services::EMBEDDER);
        assert_eq!(p.timeout, Duration::from_millis(1500));
        assert_eq!(p.retry.max_retries, 7);
        assert_eq!(p.retry.base_delay, ServicePolicy::embedding().retry.base_delay);
        assert_eq!(p.breaker.failure_threshold, 2);
        let rl = p.rate_limit.unwrap();
        assert_eq!(rl.max_requests, 60);
        assert_eq!(
            rl.on_limit,
            LimitPolicy::Wait {
                max_wait: Duration::from_millis(250)
            }
        );
    }

    #[test]
    fn rate_limit_can_be_disabled() {
        let cfg = ResilienceConfig::from_yaml_str(
            "services:\n  fetcher:\n    rate_limit:\n      enabled: false\n",
        )
        .unwrap();
        assert!(cfg.policy_for(services::FETCHER).rate_limit.is_none());
    }

    #[test]
    fn validation_reports_field_path() {
        let cfg = ResilienceConfig::from_yaml_str(
            "services:\n  vector_store:\n    retry:\n      backoff_multiplier: 0.5\n",
        )
        .unwrap();
        let err = cfg.validate().unwrap_err();
        assert_eq!(
            err.site().and_then(|s| s.field_path.as_deref()),
            Some("services.vector_store.retry.backoff_multiplier")
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = ResilienceConfig::from_yaml_str("pipeline:\n  fanout: 3\n").unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn json_is_accepted() {
        let cfg = ResilienceConfig::from_json_str(r#"{"pipeline": {"fan_out": 2}}"#).unwrap();
        assert_eq!(cfg.pipeline_config().fan_out, 2);
        assert_eq!(cfg.pipeline.batch_size, 25);
    }

    #[test]
    fn context_uses_effective_policies() {
        let cfg = ResilienceConfig::from_yaml_str(
            "pipeline:\n  cancel_grace_ms: 10\nservices:\n  ingestion:\n    error_type: network\n",
        )
        .unwrap();
        let ctx = cfg.build_context();
        assert_eq!(ctx.cancel_grace(), Duration::from_millis(10));
        assert_eq!(
            ctx.service(services::INGESTION).policy().error_type,
            ErrorType::Network
        );
        assert_eq!(cfg.effective_policies().len(), 4);
    }
}
