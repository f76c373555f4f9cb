mod common;

use std::time::Duration;
use tokio_util::sync::CancellationToken;

use common::*;
use ingest_resilience::{ErrorType, PipelineConfig, Stage};

#[tokio::test]
async fn cancelling_a_run_abandons_in_flight_items_and_skips_the_rest() {
    init_tracing();
    let h = harness(
        fast_context(),
        ScriptedFetcher::new().with_delay(Duration::from_millis(200)),
        ScriptedEmbedder::ok(),
        ScriptedStore::new(),
    );
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let report = h
        .orchestrator
        .run_pipeline_with_cancel(items(6), &PipelineConfig::default().with_fan_out(2), cancel)
        .await;

    assert_eq!(report.total_operations, 6);
    assert_eq!(report.successful_operations, 0);
    assert_eq!(report.failures_by_stage[&Stage::Fetch], 6);
    // Every item can be re-run.
    assert_eq!(report.errors.recoverable, 6);
    assert_eq!(report.retryable_operations.len(), 6);

    // Only the first two items were ever started.
    assert_eq!(h.fetcher.calls(), 2);
    let abandoned = report
        .errors
        .details
        .iter()
        .filter(|e| e.message().contains("abandoned"))
        .count();
    assert_eq!(abandoned, 2);
    assert_eq!(report.errors.by_type[&ErrorType::Unknown], 4);

    assert!(h.trigger.batches().is_empty());
    assert!(report.ingestion.is_empty());
    // Abandoned attempts are not held against the service.
    assert_eq!(h.orchestrator.context().service("fetcher").breaker().failure_count(), 0);
}

#[tokio::test]
async fn in_flight_items_finishing_within_grace_still_count() {
    init_tracing();
    let h = harness(
        fast_context().with_cancel_grace(Duration::from_millis(500)),
        ScriptedFetcher::new().with_delay(Duration::from_millis(100)),
        ScriptedEmbedder::ok(),
        ScriptedStore::new(),
    );
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let report = h
        .orchestrator
        .run_pipeline_with_cancel(items(4), &PipelineConfig::default().with_fan_out(2), cancel)
        .await;

    // The two fetches finish during the grace period, but no later stage starts.
    assert_eq!(h.fetcher.calls(), 2);
    assert_eq!(report.successful_operations, 0);
    assert_eq!(report.failures_by_stage[&Stage::Embed], 2);
    assert_eq!(report.failures_by_stage[&Stage::Fetch], 2);
    assert_eq!(h.embedder.calls(), 0);
}

#[tokio::test]
async fn run_deadline_cancels_the_run() {
    init_tracing();
    let h = harness(
        fast_context(),
        ScriptedFetcher::new().with_delay(Duration::from_millis(20)),
        ScriptedEmbedder::ok(),
        ScriptedStore::new(),
    );
    let config = PipelineConfig::default()
        .with_fan_out(1)
        .with_batch_size(2)
        .with_run_deadline(Duration::from_millis(150));

    let started = tokio::time::Instant::now();
    let report = h.orchestrator.run_pipeline(items(30), &config).await;

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(report.total_operations, 30);
    assert!(report.successful_operations >= 2);
    assert!(report.failed_operations >= 20);
    assert_eq!(report.retryable_operations.len(), report.failed_operations);
    // Batches that completed before the deadline were ingested.
    assert!(!h.trigger.batches().is_empty());
    let ingested = report.ingestion.iter().filter(|i| i.is_success()).count();
    assert_eq!(ingested, h.trigger.batches().len());
    // A batch cut short by the deadline is reported, never dropped.
    assert!(report
        .ingestion
        .iter()
        .filter_map(|i| i.error.as_ref())
        .all(|e| e.is_recoverable()));
}

#[tokio::test]
async fn cancelled_batch_with_stored_vectors_reports_skipped_ingestion() {
    init_tracing();
    let h = harness(
        fast_context(),
        ScriptedFetcher::new().with_delay(Duration::from_millis(20)),
        ScriptedEmbedder::ok(),
        ScriptedStore::new(),
    );
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let report = h
        .orchestrator
        .run_pipeline_with_cancel(items(4), &PipelineConfig::default().with_fan_out(1), cancel)
        .await;

    let stored = h.store.stored_items();
    assert!(stored.contains(&"item-00".to_string()));
    assert!(stored.len() < 4);
    assert!(h.trigger.batches().is_empty());

    assert_eq!(report.ingestion.len(), 1);
    let skipped = &report.ingestion[0];
    assert!(!skipped.is_success());
    assert!(skipped.job_id.is_none());
    assert_eq!(skipped.item_ids, stored);
    assert!(skipped.vector_count > 0);
    let error = skipped.error.as_ref().unwrap();
    assert_eq!(error.error_type(), ErrorType::Unknown);
    assert!(error.is_recoverable());
    assert!(error.message().contains("run cancelled"));
    assert!(report
        .recommendations
        .iter()
        .any(|r| r.contains("re-run ingestion")));
}

#[tokio::test]
async fn uncancelled_run_completes_normally() {
    init_tracing();
    let h = harness(
        fast_context(),
        ScriptedFetcher::new(),
        ScriptedEmbedder::ok(),
        ScriptedStore::new(),
    );
    let report = h
        .orchestrator
        .run_pipeline(items(5), &PipelineConfig::default().with_batch_size(2))
        .await;

    assert!(report.all_succeeded());
    assert_eq!(report.success_rate, 100.0);
    assert_eq!(h.trigger.batches().len(), 3);
    assert_eq!(h.store.stored_items().len(), 5);
}
