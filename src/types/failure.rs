//! Failure taxonomy and per-attempt context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Failure category, assigned by the stage that produced the fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorType {
    Network,
    Storage,
    Embedding,
    Parsing,
    Validation,
    Unknown,
}

impl ErrorType {
    pub const ALL: [ErrorType; 6] = [
        ErrorType::Network,
        ErrorType::Storage,
        ErrorType::Embedding,
        ErrorType::Parsing,
        ErrorType::Validation,
        ErrorType::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Network => "network",
            ErrorType::Storage => "storage",
            ErrorType::Embedding => "embedding",
            ErrorType::Parsing => "parsing",
            ErrorType::Validation => "validation",
            ErrorType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Traceability context for a single attempt against an external service.
///
/// A fresh context (with a new `request_id`) is created for every attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub request_id: String,
    pub endpoint: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<BTreeMap<String, Value>>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_info: Option<BTreeMap<String, Value>>,
}

impl ErrorContext {
    pub fn new(endpoint: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            endpoint: endpoint.into(),
            method: method.into(),
            parameters: None,
            timestamp: Utc::now(),
            additional_info: None,
        }
    }

    pub fn with_parameters(mut self, parameters: BTreeMap<String, Value>) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn with_info(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.additional_info
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }
}

/// A terminal failure recorded against a pipeline item or batch operation.
///
/// Built once at the point of failure and never mutated afterwards; fields are
/// read through accessors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlerError {
    error_type: ErrorType,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    timestamp: DateTime<Utc>,
    recoverable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<ErrorContext>,
    retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    stack_trace: Option<String>,
}

impl CrawlerError {
    pub fn builder(error_type: ErrorType, message: impl Into<String>) -> CrawlerErrorBuilder {
        CrawlerErrorBuilder {
            error: CrawlerError {
                error_type,
                message: message.into(),
                url: None,
                timestamp: Utc::now(),
                recoverable: false,
                context: None,
                retry_count: 0,
                stack_trace: None,
            },
        }
    }

    pub fn error_type(&self) -> ErrorType {
        self.error_type
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn is_recoverable(&self) -> bool {
        self.recoverable
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        self.context.as_ref()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn stack_trace(&self) -> Option<&str> {
        self.stack_trace.as_deref()
    }
}

impl fmt::Display for CrawlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.error_type, self.message)?;
        if let Some(url) = &self.url {
            write!(f, " (url: {})", url)?;
        }
        if self.retry_count > 0 {
            write!(f, " after {} retries", self.retry_count)?;
        }
        Ok(())
    }
}

impl std::error::Error for CrawlerError {}

/// Assembles a [`CrawlerError`]; the error is frozen once `build` is called.
#[derive(Debug)]
pub struct CrawlerErrorBuilder {
    error: CrawlerError,
}

impl CrawlerErrorBuilder {
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.error.url = Some(url.into());
        self
    }

    pub fn recoverable(mut self, recoverable: bool) -> Self {
        self.error.recoverable = recoverable;
        self
    }

    pub fn context(mut self, context: ErrorContext) -> Self {
        self.error.context = Some(context);
        self
    }

    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.error.retry_count = retry_count;
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.error.timestamp = timestamp;
        self
    }

    pub fn stack_trace(mut self, trace: impl Into<String>) -> Self {
        self.error.stack_trace = Some(trace.into());
        self
    }

    /// Attach a backtrace when `RUST_BACKTRACE` enables capture.
    pub fn capture_backtrace(self) -> Self {
        let bt = std::backtrace::Backtrace::capture();
        if bt.status() == std::backtrace::BacktraceStatus::Captured {
            self.stack_trace(bt.to_string())
        } else {
            self
        }
    }

    pub fn build(self) -> CrawlerError {
        self.error
    }
}
