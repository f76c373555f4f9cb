//! In-memory collaborators for demos and tests.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use super::{
    BatchRef, Embedder, Embedding, Fault, FetchedContent, Fetcher, IngestionJob,
    IngestionTrigger, StoreAck, TextChunk, VectorRecord, VectorStore,
};

/// Serves pages from a fixed map. Unknown URLs fail as a non-recoverable 404.
#[derive(Debug, Default)]
pub struct StaticFetcher {
    pages: HashMap<String, String>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: impl Into<String>, body: impl Into<String>) -> Self {
        self.pages.insert(url.into(), body.into());
        self
    }
}

#[async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedContent, Fault> {
        match self.pages.get(url) {
            Some(body) => Ok(FetchedContent::new(url, body.clone())),
            None => Err(Fault::network(format!("404 not found: {}", url))
                .with_recoverable(false)
                .with_detail("status", 404)),
        }
    }
}

/// Deterministic pseudo-embeddings derived from a SHA-256 of the chunk text.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(8)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, chunk: &TextChunk) -> Result<Embedding, Fault> {
        let digest = Sha256::digest(chunk.text.as_bytes());
        let mut vector: Vec<f32> = (0..self.dimensions)
            .map(|i| f32::from(digest[i % digest.len()]) / 255.0 - 0.5)
            .collect();
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(Embedding {
            chunk_id: chunk.id.clone(),
            vector,
            model: Some("sha256-hash".to_string()),
        })
    }
}

/// Keeps stored records in memory, keyed by record id.
#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    records: RwLock<BTreeMap<String, VectorRecord>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<VectorRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn records_for(&self, item_id: &str) -> Vec<VectorRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|r| r.item_id == item_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn store(&self, record: &VectorRecord) -> Result<StoreAck, Fault> {
        if record.vector.is_empty() {
            return Err(Fault::validation(format!("record {} has an empty vector", record.id)));
        }
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.id.clone(), record.clone());
        Ok(StoreAck {
            id: record.id.clone(),
        })
    }
}

/// Accepts every batch and remembers it.
#[derive(Debug, Default)]
pub struct RecordingIngestionTrigger {
    batches: RwLock<Vec<BatchRef>>,
}

impl RecordingIngestionTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<BatchRef> {
        self.batches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl IngestionTrigger for RecordingIngestionTrigger {
    async fn start_ingestion(&self, batch: &BatchRef) -> Result<IngestionJob, Fault> {
        let mut batches = self.batches.write().unwrap_or_else(PoisonError::into_inner);
        batches.push(batch.clone());
        Ok(IngestionJob {
            job_id: format!("{}-{}", batch.execution_id, batch.batch_index),
            status: Some("STARTING".to_string()),
        })
    }
}
