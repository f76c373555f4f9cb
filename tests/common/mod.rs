//! Scripted collaborators shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ingest_resilience::collaborators::memory::{HashEmbedder, RecordingIngestionTrigger};
use ingest_resilience::collaborators::{
    Embedder, Embedding, Fault, FetchedContent, Fetcher, StoreAck, TextChunk, VectorRecord,
    VectorStore,
};
use ingest_resilience::resilience::{
    services, CircuitBreakerConfig, ResilienceContext, RetryConfig, ServicePolicy,
};
use ingest_resilience::{ContentItem, PipelineOrchestrator};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("off")),
        )
        .with_test_writer()
        .try_init();
}

pub fn items(n: usize) -> Vec<ContentItem> {
    (0..n)
        .map(|i| ContentItem::new(format!("item-{:02}", i), format!("https://docs.test/page/{}", i)))
        .collect()
}

/// Millisecond backoff, no rate limits, a breaker that will not trip by accident.
pub fn fast_policy(base: ServicePolicy) -> ServicePolicy {
    base.with_retry(
        RetryConfig::new()
            .with_max_retries(2)
            .with_base_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(5))
            .with_jitter(false),
    )
    .with_breaker(CircuitBreakerConfig::new().with_failure_threshold(100))
    .with_rate_limit(None)
    .with_timeout(Duration::from_secs(2))
}

pub fn fast_context() -> ResilienceContext {
    ResilienceContext::new()
        .with_policy(services::FETCHER, fast_policy(ServicePolicy::fetch()))
        .with_policy(services::EMBEDDER, fast_policy(ServicePolicy::embedding()))
        .with_policy(services::VECTOR_STORE, fast_policy(ServicePolicy::storage()))
        .with_policy(services::INGESTION, fast_policy(ServicePolicy::ingestion()))
        .with_cancel_grace(Duration::from_millis(20))
}

/// Answers every URL with generated text, unless told to fail it.
#[derive(Default)]
pub struct ScriptedFetcher {
    failures: HashMap<String, Fault>,
    delay: Option<Duration>,
    pub calls: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, url: impl Into<String>, fault: Fault) -> Self {
        self.failures.insert(url.into(), fault);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedContent, Fault> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.failures.get(url) {
            Some(fault) => Err(fault.clone()),
            None => Ok(FetchedContent::new(url, format!("content of {}", url))),
        }
    }
}

/// Hash embeddings, or a fixed fault for every call.
pub struct ScriptedEmbedder {
    inner: HashEmbedder,
    fail_with: Option<Fault>,
    pub calls: AtomicUsize,
}

impl ScriptedEmbedder {
    pub fn ok() -> Self {
        Self {
            inner: HashEmbedder::default(),
            fail_with: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn always_failing(fault: Fault) -> Self {
        Self {
            fail_with: Some(fault),
            ..Self::ok()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embedder for ScriptedEmbedder {
    async fn embed(&self, chunk: &TextChunk) -> Result<Embedding, Fault> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.fail_with {
            Some(ref fault) => Err(fault.clone()),
            None => self.inner.embed(chunk).await,
        }
    }
}

/// Stores everything except records of the listed items.
#[derive(Default)]
pub struct ScriptedStore {
    failing_items: HashMap<String, Fault>,
    stored: Mutex<Vec<String>>,
    pub calls: AtomicUsize,
}

impl ScriptedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_item(mut self, item_id: impl Into<String>, fault: Fault) -> Self {
        self.failing_items.insert(item_id.into(), fault);
        self
    }

    pub fn stored_items(&self) -> Vec<String> {
        let mut items = self.stored.lock().unwrap().clone();
        items.sort();
        items.dedup();
        items
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VectorStore for ScriptedStore {
    async fn store(&self, record: &VectorRecord) -> Result<StoreAck, Fault> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(fault) = self.failing_items.get(&record.item_id) {
            return Err(fault.clone());
        }
        self.stored.lock().unwrap().push(record.item_id.clone());
        Ok(StoreAck {
            id: record.id.clone(),
        })
    }
}

pub struct Harness {
    pub orchestrator: PipelineOrchestrator,
    pub fetcher: Arc<ScriptedFetcher>,
    pub embedder: Arc<ScriptedEmbedder>,
    pub store: Arc<ScriptedStore>,
    pub trigger: Arc<RecordingIngestionTrigger>,
}

pub fn harness(
    context: ResilienceContext,
    fetcher: ScriptedFetcher,
    embedder: ScriptedEmbedder,
    store: ScriptedStore,
) -> Harness {
    let fetcher = Arc::new(fetcher);
    let embedder = Arc::new(embedder);
    let store = Arc::new(store);
    let trigger = Arc::new(RecordingIngestionTrigger::new());
    let orchestrator = PipelineOrchestrator::builder()
        .context(Arc::new(context))
        .fetcher(fetcher.clone())
        .embedder(embedder.clone())
        .vector_store(store.clone())
        .ingestion_trigger(trigger.clone())
        .build()
        .unwrap();
    Harness {
        orchestrator,
        fetcher,
        embedder,
        store,
        trigger,
    }
}
