//! Resilient Ingestion Example
//!
//! Runs a small crawl through the full pipeline with in-memory collaborators
//! and a deliberately flaky fetcher:
//! - transient fetch failures recovered by retries
//! - a permanently missing page reported as non-recoverable
//! - a malformed URL rejected before any call
//!
//! The partial-success report is printed as JSON at the end.
//!
//! Usage:
//!   cargo run --example resilient_ingest
//!   RUST_LOG=ingest_resilience=debug cargo run --example resilient_ingest

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ingest_resilience::collaborators::memory::{
    HashEmbedder, InMemoryVectorStore, RecordingIngestionTrigger,
};
use ingest_resilience::collaborators::{Fault, FetchedContent, Fetcher};
use ingest_resilience::{ContentItem, PipelineOrchestrator, ResilienceConfig};

/// Fails each URL a fixed number of times before serving it.
struct FlakyFetcher {
    remaining_failures: Mutex<HashMap<String, u32>>,
}

impl FlakyFetcher {
    fn new(flaky: &[(&str, u32)]) -> Self {
        Self {
            remaining_failures: Mutex::new(
                flaky.iter().map(|(url, n)| (url.to_string(), *n)).collect(),
            ),
        }
    }
}

#[async_trait]
impl Fetcher for FlakyFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedContent, Fault> {
        if url.ends_with("/missing") {
            return Err(Fault::network("404 Not Found").with_recoverable(false));
        }
        let fail = {
            let mut remaining = self
                .remaining_failures
                .lock()
                .map_err(|_| Fault::unknown("fetcher state poisoned"))?;
            match remaining.get_mut(url) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            }
        };
        if fail {
            return Err(Fault::network("connection reset by peer"));
        }
        let body = format!(
            "Documentation page at {}. {}",
            url,
            "Resilient pipelines keep going when individual pages fail. ".repeat(40)
        );
        Ok(FetchedContent::new(url, body).with_title(url))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    println!("=== Resilient Ingestion Demo ===\n");

    let config = ResilienceConfig::from_yaml_str(
        r#"
pipeline:
  fan_out: 3
  batch_size: 4
services:
  fetcher:
    retry: { max_retries: 3, base_delay_ms: 50, max_delay_ms: 200 }
"#,
    )?;
    config.validate()?;

    let store = Arc::new(InMemoryVectorStore::new());
    let trigger = Arc::new(RecordingIngestionTrigger::new());
    let orchestrator = PipelineOrchestrator::builder()
        .context(config.build_context())
        .fetcher(Arc::new(FlakyFetcher::new(&[
            ("https://docs.example.com/guide", 2),
            ("https://docs.example.com/api", 1),
        ])))
        .chunker(Arc::new(config.chunker()?))
        .embedder(Arc::new(HashEmbedder::new(16)))
        .vector_store(store.clone())
        .ingestion_trigger(trigger.clone())
        .reporter(config.reporter())
        .build()?;

    let items = vec![
        ContentItem::new("home", "https://docs.example.com/"),
        ContentItem::new("guide", "https://docs.example.com/guide"),
        ContentItem::new("api", "https://docs.example.com/api"),
        ContentItem::new("faq", "https://docs.example.com/faq").with_metadata("section", "support"),
        ContentItem::new("missing", "https://docs.example.com/missing"),
        ContentItem::new("broken", "not a url"),
    ];

    let report = orchestrator
        .run_pipeline(items, &config.pipeline_config())
        .await;

    println!(
        "\nStored {} vectors, triggered {} ingestion batch(es)\n",
        store.len(),
        trigger.batches().len()
    );
    println!("{}", report.to_json_pretty()?);
    Ok(())
}
