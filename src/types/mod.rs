//! Core data types shared across the resilience layer.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`ErrorType`] | Failure taxonomy assigned at the point of failure |
//! | [`ErrorContext`] | Per-attempt traceability context |
//! | [`CrawlerError`] | Immutable terminal failure record |
//! | [`HealthCheckResult`] | Health of a single service |
//! | [`SystemHealthSummary`] | Health across all services of a run |

pub mod failure;
pub mod health;

pub use failure::{CrawlerError, CrawlerErrorBuilder, ErrorContext, ErrorType};
pub use health::{HealthCheckResult, HealthStatus, ServiceHealthDetail, SystemHealthSummary};
