//! # ingest-resilience
//!
//! 这是多阶段内容摄取流水线的弹性编排层：重试、熔断、限流与部分成功报告。
//!
//! Resilience orchestration for a multi-stage content ingestion pipeline
//! (fetch → chunk → embed → store → trigger ingestion). Each stage talks to an
//! unreliable external service; this crate keeps their failures isolated,
//! retried where it helps, rate limited, and accounted for in one report per
//! run.
//!
//! ## Core Ideas
//!
//! - **Per-service isolation**: every external service gets its own circuit
//!   breaker, rate limiter and counters in a [`ResilienceContext`]
//! - **Classified failures**: collaborators report a [`collaborators::Fault`]
//!   with an [`ErrorType`]; terminal failures become immutable [`CrawlerError`]s
//! - **Partial success**: a run never aborts on item failures; it always ends
//!   in a [`PartialSuccessReport`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ingest_resilience::collaborators::memory::{
//!     HashEmbedder, InMemoryVectorStore, RecordingIngestionTrigger, StaticFetcher,
//! };
//! use ingest_resilience::{ContentItem, PipelineConfig, PipelineOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> ingest_resilience::Result<()> {
//!     let orchestrator = PipelineOrchestrator::builder()
//!         .fetcher(Arc::new(StaticFetcher::new().with_page("https://example.com/", "hello")))
//!         .embedder(Arc::new(HashEmbedder::default()))
//!         .vector_store(Arc::new(InMemoryVectorStore::new()))
//!         .ingestion_trigger(Arc::new(RecordingIngestionTrigger::new()))
//!         .build()?;
//!
//!     let items = vec![ContentItem::new("home", "https://example.com/")];
//!     let report = orchestrator.run_pipeline(items, &PipelineConfig::default()).await;
//!     println!("{}", report.to_json_pretty()?);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`resilience`] | Retry policy, circuit breaker, rate limiter, metrics, registry |
//! | [`invoker`] | Composes the primitives around one collaborator call |
//! | [`collaborators`] | Narrow traits for the external services |
//! | [`pipeline`] | Per-item stage sequencing, fan-out and cancellation |
//! | [`report`] | Partial-success report and recommendations |
//! | [`types`] | Failure taxonomy and health views |
//! | [`config`] | YAML/JSON configuration |

pub mod collaborators;
pub mod config;
pub mod invoker;
pub mod pipeline;
pub mod report;
pub mod resilience;
pub mod types;

pub mod error;
pub use error::{Error, ErrorSite};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

pub use config::ResilienceConfig;
pub use invoker::{CallDescriptor, ResilientInvoker};
pub use pipeline::{ContentItem, ItemOutcome, PipelineConfig, PipelineOrchestrator, Stage};
pub use report::{PartialSuccessReport, ResilienceReporter};
pub use resilience::ResilienceContext;
pub use types::{CrawlerError, ErrorContext, ErrorType, HealthStatus, SystemHealthSummary};
