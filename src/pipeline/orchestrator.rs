use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use super::stage::{ContentItem, IngestionOutcome, ItemOutcome, Stage};
use crate::collaborators::{
    BatchRef, Chunker, Embedder, Fetcher, IngestionTrigger, TextChunk, TextChunker, VectorRecord,
    VectorStore,
};
use crate::invoker::CallDescriptor;
use crate::report::{PartialSuccessReport, ReportInput, ResilienceReporter};
use crate::resilience::{services, ResilienceContext};
use crate::types::{CrawlerError, ErrorType, SystemHealthSummary};
use crate::{Error, ErrorSite, Result};

/// Per-run knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Items processed concurrently within a batch.
    pub fan_out: usize,
    /// Items per ingestion batch.
    pub batch_size: usize,
    /// Cancel the run automatically after this long.
    pub run_deadline: Option<Duration>,
    /// Run the batch-level ingestion trigger (when one is configured).
    pub trigger_ingestion: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fan_out: 4,
            batch_size: 25,
            run_deadline: None,
            trigger_ingestion: true,
        }
    }
}

impl PipelineConfig {
    pub fn with_fan_out(mut self, fan_out: usize) -> Self {
        self.fan_out = fan_out;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_run_deadline(mut self, deadline: Duration) -> Self {
        self.run_deadline = Some(deadline);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.fan_out == 0 {
            return Err(Error::invalid_field("pipeline.fan_out", "fan_out must be positive"));
        }
        if self.batch_size == 0 {
            return Err(Error::invalid_field(
                "pipeline.batch_size",
                "batch_size must be positive",
            ));
        }
        Ok(())
    }
}

/// Builder for [`PipelineOrchestrator`].
#[derive(Default)]
pub struct PipelineOrchestratorBuilder {
    context: Option<Arc<ResilienceContext>>,
    fetcher: Option<Arc<dyn Fetcher>>,
    chunker: Option<Arc<dyn Chunker>>,
    embedder: Option<Arc<dyn Embedder>>,
    store: Option<Arc<dyn VectorStore>>,
    trigger: Option<Arc<dyn IngestionTrigger>>,
    reporter: Option<ResilienceReporter>,
}

impl PipelineOrchestratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn context(mut self, context: Arc<ResilienceContext>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn chunker(mut self, chunker: Arc<dyn Chunker>) -> Self {
        self.chunker = Some(chunker);
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn vector_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn ingestion_trigger(mut self, trigger: Arc<dyn IngestionTrigger>) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn reporter(mut self, reporter: ResilienceReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn build(self) -> Result<PipelineOrchestrator> {
        fn missing(what: &str) -> Error {
            Error::configuration_with_site(
                format!("{} is required", what),
                ErrorSite::new()
                    .with_field_path(what)
                    .with_source("orchestrator_builder"),
            )
        }
        Ok(PipelineOrchestrator {
            context: self.context.unwrap_or_default(),
            fetcher: self.fetcher.ok_or_else(|| missing("fetcher"))?,
            chunker: self
                .chunker
                .unwrap_or_else(|| Arc::new(TextChunker::default()) as Arc<dyn Chunker>),
            embedder: self.embedder.ok_or_else(|| missing("embedder"))?,
            store: self.store.ok_or_else(|| missing("vector_store"))?,
            trigger: self.trigger,
            reporter: self.reporter.unwrap_or_default(),
        })
    }
}

/// Drives items through fetch → chunk → embed → store, then triggers
/// ingestion per batch, and reports the run.
pub struct PipelineOrchestrator {
    context: Arc<ResilienceContext>,
    fetcher: Arc<dyn Fetcher>,
    chunker: Arc<dyn Chunker>,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    trigger: Option<Arc<dyn IngestionTrigger>>,
    reporter: ResilienceReporter,
}

impl PipelineOrchestrator {
    pub fn builder() -> PipelineOrchestratorBuilder {
        PipelineOrchestratorBuilder::new()
    }

    pub fn context(&self) -> &Arc<ResilienceContext> {
        &self.context
    }

    /// Health of every service this orchestrator has used.
    pub fn get_health(&self) -> SystemHealthSummary {
        self.context.health()
    }

    pub async fn run_pipeline(
        &self,
        items: Vec<ContentItem>,
        config: &PipelineConfig,
    ) -> PartialSuccessReport {
        self.run_pipeline_with_cancel(items, config, CancellationToken::new())
            .await
    }

    /// Run all items and build the report. Always produces a report.
    pub async fn run_pipeline_with_cancel(
        &self,
        items: Vec<ContentItem>,
        config: &PipelineConfig,
        cancel: CancellationToken,
    ) -> PartialSuccessReport {
        let execution_id = uuid::Uuid::new_v4().to_string();
        let fan_out = config.fan_out.max(1);
        let batch_size = config.batch_size.max(1);
        info!(
            execution_id = execution_id.as_str(),
            items = items.len(),
            fan_out,
            batch_size,
            "pipeline run started"
        );

        self.context.reset_metrics();
        for name in [services::FETCHER, services::EMBEDDER, services::VECTOR_STORE] {
            self.context.service(name);
        }
        if self.trigger.is_some() && config.trigger_ingestion {
            self.context.service(services::INGESTION);
        }

        let deadline = config.run_deadline.map(|after| {
            let token = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                warn!(deadline_ms = after.as_millis() as u64, "run deadline reached, cancelling");
                token.cancel();
            })
        });

        let mut outcomes = Vec::with_capacity(items.len());
        let mut ingestion = Vec::new();
        for (batch_index, batch) in items.chunks(batch_size).enumerate() {
            let batch_outcomes: Vec<ItemOutcome> = futures::stream::iter(batch)
                .map(|item| self.process_item(item, &cancel))
                .buffer_unordered(fan_out)
                .collect()
                .await;

            if config.trigger_ingestion {
                if let Some(ref trigger) = self.trigger {
                    if let Some(outcome) = self
                        .trigger_batch(trigger, &execution_id, batch_index, &batch_outcomes, &cancel)
                        .await
                    {
                        ingestion.push(outcome);
                    }
                }
            }
            outcomes.extend(batch_outcomes);
        }

        if let Some(handle) = deadline {
            handle.abort();
        }

        let breakers = self.context.breaker_states();
        let metrics = self.context.metrics();
        let report = self.reporter.build(ReportInput {
            execution_id: &execution_id,
            timestamp: Utc::now(),
            outcomes: &outcomes,
            breakers: &breakers,
            metrics: &metrics,
            ingestion: &ingestion,
        });
        info!(
            execution_id = execution_id.as_str(),
            total = report.total_operations,
            successful = report.successful_operations,
            failed = report.failed_operations,
            success_rate = report.success_rate,
            cancelled = cancel.is_cancelled(),
            "pipeline run finished"
        );
        report
    }

    async fn process_item(&self, item: &ContentItem, cancel: &CancellationToken) -> ItemOutcome {
        let outcome = ItemOutcome::new(&item.id, &item.url);
        if cancel.is_cancelled() {
            let error = CrawlerError::builder(ErrorType::Unknown, "run cancelled before the item started")
                .url(&item.url)
                .recoverable(true)
                .build();
            return outcome.failed_at(Stage::Fetch, error);
        }

        let outcome = self.run_stages(item, outcome, cancel).await;
        if let Some(ref error) = outcome.final_error {
            warn!(
                item_id = item.id.as_str(),
                stage = ?outcome.failed_stage,
                error_type = %error.error_type(),
                recoverable = error.is_recoverable(),
                retries = error.retry_count(),
                "item failed"
            );
        }
        outcome
    }

    async fn run_stages(
        &self,
        item: &ContentItem,
        mut outcome: ItemOutcome,
        cancel: &CancellationToken,
    ) -> ItemOutcome {
        if let Err(error) = validate_url(&item.url) {
            return outcome.failed_at(Stage::Fetch, error);
        }

        let fetch = CallDescriptor::new(services::FETCHER, "GET")
            .with_url(&item.url)
            .with_param("item_id", item.id.as_str());
        let fetched = match self
            .context
            .invoker(services::FETCHER)
            .invoke_with_cancel(&fetch, cancel, || self.fetcher.fetch(&item.url))
            .await
        {
            Ok(content) => content,
            Err(error) => return outcome.failed_at(Stage::Fetch, error),
        };
        outcome.stages_completed.push(Stage::Fetch);

        let chunks = match self.chunker.chunk(&item.id, &fetched) {
            Ok(chunks) if chunks.is_empty() => {
                let error = CrawlerError::builder(ErrorType::Parsing, "chunker produced no chunks")
                    .url(&item.url)
                    .build();
                return outcome.failed_at(Stage::Chunk, error);
            }
            Ok(chunks) => chunks,
            Err(fault) => {
                let error = CrawlerError::builder(fault.error_type, fault.message)
                    .url(&item.url)
                    .recoverable(fault.recoverable)
                    .capture_backtrace()
                    .build();
                return outcome.failed_at(Stage::Chunk, error);
            }
        };
        outcome.chunks = chunks.len();
        outcome.stages_completed.push(Stage::Chunk);

        let embedder = self.context.invoker(services::EMBEDDER);
        let mut embedded = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let call = chunk_call(services::EMBEDDER, "EMBED", chunk);
            match embedder
                .invoke_with_cancel(&call, cancel, || self.embedder.embed(chunk))
                .await
            {
                Ok(embedding) => embedded.push(embedding),
                Err(error) => return outcome.failed_at(Stage::Embed, error),
            }
        }
        outcome.stages_completed.push(Stage::Embed);

        let store = self.context.invoker(services::VECTOR_STORE);
        for (chunk, embedding) in chunks.iter().zip(embedded) {
            let mut record = VectorRecord::from_chunk(chunk, embedding);
            for (k, v) in &item.metadata {
                record.metadata.entry(k.clone()).or_insert_with(|| v.clone());
            }
            let call = chunk_call(services::VECTOR_STORE, "UPSERT", chunk);
            match store
                .invoke_with_cancel(&call, cancel, || self.store.store(&record))
                .await
            {
                Ok(_) => outcome.vectors_stored += 1,
                Err(error) => return outcome.failed_at(Stage::Store, error),
            }
        }
        outcome.stages_completed.push(Stage::Store);
        outcome
    }

    async fn trigger_batch(
        &self,
        trigger: &Arc<dyn IngestionTrigger>,
        execution_id: &str,
        batch_index: usize,
        outcomes: &[ItemOutcome],
        cancel: &CancellationToken,
    ) -> Option<IngestionOutcome> {
        let mut item_ids: Vec<String> = outcomes
            .iter()
            .filter(|o| o.vectors_stored > 0)
            .map(|o| o.item_id.clone())
            .collect();
        if item_ids.is_empty() {
            return None;
        }
        item_ids.sort();
        let batch = BatchRef {
            execution_id: execution_id.to_string(),
            batch_index,
            vector_count: outcomes.iter().map(|o| o.vectors_stored).sum(),
            item_ids,
        };

        if cancel.is_cancelled() {
            warn!(
                execution_id,
                batch_index,
                vectors = batch.vector_count,
                "run cancelled, ingestion skipped for stored vectors"
            );
            let error = CrawlerError::builder(ErrorType::Unknown, "ingestion skipped: run cancelled")
                .recoverable(true)
                .build();
            return Some(IngestionOutcome {
                batch_index,
                item_ids: batch.item_ids,
                vector_count: batch.vector_count,
                job_id: None,
                error: Some(error),
            });
        }

        let call = CallDescriptor::new(services::INGESTION, "START")
            .with_param("execution_id", execution_id)
            .with_param("batch_index", batch_index);
        let result = self
            .context
            .invoker(services::INGESTION)
            .invoke_with_cancel(&call, cancel, || trigger.start_ingestion(&batch))
            .await;

        let (job_id, error) = match result {
            Ok(job) => {
                info!(
                    execution_id,
                    batch_index,
                    job_id = job.job_id.as_str(),
                    vectors = batch.vector_count,
                    "ingestion triggered"
                );
                (Some(job.job_id), None)
            }
            Err(error) => {
                warn!(execution_id, batch_index, error = %error, "ingestion trigger failed");
                (None, Some(error))
            }
        };
        Some(IngestionOutcome {
            batch_index,
            item_ids: batch.item_ids,
            vector_count: batch.vector_count,
            job_id,
            error,
        })
    }
}

fn chunk_call(service: &str, method: &str, chunk: &TextChunk) -> CallDescriptor {
    CallDescriptor::new(service, method)
        .with_url(&chunk.url)
        .with_param("item_id", chunk.item_id.as_str())
        .with_param("chunk_id", chunk.id.as_str())
        .with_param("chunk_index", chunk.index)
}

/// Only absolute http(s) URLs with a host are fetched.
fn validate_url(raw: &str) -> std::result::Result<Url, CrawlerError> {
    let invalid = |reason: String| {
        CrawlerError::builder(ErrorType::Validation, reason)
            .url(raw)
            .recoverable(false)
            .build()
    };
    let url = Url::parse(raw).map_err(|e| invalid(format!("invalid url: {}", e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported url scheme: {}", url.scheme())));
    }
    if !url.has_host() {
        return Err(invalid("url has no host".to_string()));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::memory::{
        HashEmbedder, InMemoryVectorStore, RecordingIngestionTrigger, StaticFetcher,
    };

    fn orchestrator(fetcher: StaticFetcher) -> (PipelineOrchestrator, Arc<InMemoryVectorStore>, Arc<RecordingIngestionTrigger>) {
        let store = Arc::new(InMemoryVectorStore::new());
        let trigger = Arc::new(RecordingIngestionTrigger::new());
        let orch = PipelineOrchestrator::builder()
            .fetcher(Arc::new(fetcher))
            .embedder(Arc::new(HashEmbedder::default()))
            .vector_store(store.clone())
            .ingestion_trigger(trigger.clone())
            .build()
            .unwrap();
        (orch, store, trigger)
    }

    #[test]
    fn url_validation() {
        assert!(validate_url("https://example.com/a").is_ok());
        assert!(validate_url("ftp://example.com/a").is_err());
        assert!(validate_url("not a url").is_err());
        assert_eq!(
            validate_url("file:///etc/passwd").unwrap_err().error_type(),
            ErrorType::Validation
        );
    }

    #[test]
    fn builder_requires_collaborators() {
        let err = PipelineOrchestrator::builder().build().err().unwrap();
        assert!(err.to_string().contains("fetcher"));
    }

    #[test]
    fn config_validation() {
        assert!(PipelineConfig::default().validate().is_ok());
        assert!(PipelineConfig::default().with_fan_out(0).validate().is_err());
        assert!(PipelineConfig::default().with_batch_size(0).validate().is_err());
    }

    #[tokio::test]
    async fn happy_path_stores_and_triggers() {
        let (orch, store, trigger) = orchestrator(
            StaticFetcher::new()
                .with_page("https://a.test/1", "first page")
                .with_page("https://a.test/2", "second page"),
        );
        let items = vec![
            ContentItem::new("1", "https://a.test/1").with_metadata("source", "docs"),
            ContentItem::new("2", "https://a.test/2"),
        ];
        let report = orch.run_pipeline(items, &PipelineConfig::default()).await;
        assert_eq!(report.successful_operations, 2);
        assert_eq!(report.success_rate, 100.0);
        assert_eq!(store.len(), 2);
        assert_eq!(store.records_for("1")[0].metadata["source"], "docs");
        assert_eq!(trigger.batches().len(), 1);
        assert_eq!(report.ingestion[0].item_ids, vec!["1", "2"]);
        assert_eq!(orch.get_health().total_services, 4);
    }

    #[tokio::test]
    async fn invalid_url_fails_without_fetching() {
        let (orch, _store, trigger) = orchestrator(StaticFetcher::new());
        let report = orch
            .run_pipeline(vec![ContentItem::new("x", "mailto:a@b.c")], &PipelineConfig::default())
            .await;
        assert_eq!(report.failed_operations, 1);
        assert_eq!(report.errors.by_type[&ErrorType::Validation], 1);
        assert_eq!(report.metrics[services::FETCHER].total_requests, 0);
        assert!(trigger.batches().is_empty());
        assert!(report.ingestion.is_empty());
    }

    #[tokio::test]
    async fn batches_trigger_separately() {
        let mut fetcher = StaticFetcher::new();
        let mut items = Vec::new();
        for i in 0..5 {
            let url = format!("https://a.test/{}", i);
            fetcher = fetcher.with_page(url.clone(), format!("page {}", i));
            items.push(ContentItem::new(format!("item-{}", i), url));
        }
        let (orch, _store, trigger) = orchestrator(fetcher);
        let report = orch
            .run_pipeline(items, &PipelineConfig::default().with_batch_size(2))
            .await;
        assert_eq!(report.successful_operations, 5);
        assert_eq!(trigger.batches().len(), 3);
        let indexes: Vec<_> = report.ingestion.iter().map(|i| i.batch_index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
    }
}
