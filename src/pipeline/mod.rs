//! 流水线编排模块：按条目依次执行抓取、分块、向量化与存储，并按批次触发索引。
//!
//! # Ingestion Pipeline Orchestration
//!
//! ```text
//! item ─▶ fetch ─▶ chunk ─▶ embed ─▶ store ─┐
//! item ─▶ fetch ─▶ chunk ─▶ embed ─▶ store ─┼─▶ trigger ingestion (per batch) ─▶ report
//! item ─▶ fetch ─x (terminal failure)       ┘
//! ```
//!
//! - Items of a batch run concurrently, up to `fan_out`
//! - Stages of one item run strictly in order; a terminal failure stops the
//!   item, never the batch
//! - Fetch, embed, store and ingestion go through a
//!   [`ResilientInvoker`](crate::invoker::ResilientInvoker) for their service;
//!   chunking runs in-process
//! - Cancellation stops new work; items not yet started are reported as
//!   recoverable failures
//!
//! | Type | Description |
//! |------|-------------|
//! | [`PipelineOrchestrator`] | Runs items and builds the report |
//! | [`PipelineConfig`] | Fan-out, batch size, run deadline |
//! | [`ContentItem`] | Input unit |
//! | [`ItemOutcome`] | Per-item result |
//! | [`IngestionOutcome`] | Per-batch ingestion trigger result |

mod orchestrator;
mod stage;

pub use orchestrator::{PipelineConfig, PipelineOrchestrator, PipelineOrchestratorBuilder};
pub use stage::{ContentItem, IngestionOutcome, ItemOutcome, Stage};
