//! 外部协作者模块：定义抓取、分块、向量化、存储与索引触发的窄接口。
//!
//! # External Collaborators
//!
//! The pipeline never talks to a concrete HTTP client, embedding API or vector
//! database. Each stage goes through one of the traits below, and adapters
//! report failures as a [`Fault`] carrying the [`ErrorType`] they assign.
//!
//! | Trait | Stage | Default fault type |
//! |-------|-------|--------------------|
//! | [`Fetcher`] | fetch | `network` |
//! | [`Chunker`] | chunk (in-process) | `parsing` |
//! | [`Embedder`] | embed | `embedding` |
//! | [`VectorStore`] | store | `storage` |
//! | [`IngestionTrigger`] | trigger ingestion (per batch) | `storage` |
//!
//! In-memory reference implementations live in [`memory`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::types::ErrorType;

pub mod chunker;
pub mod memory;

pub use chunker::TextChunker;

/// A classified collaborator failure.
///
/// The adapter that observed the failure decides its [`ErrorType`] and
/// whether retrying may help; nothing downstream reclassifies it.
#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    pub error_type: ErrorType,
    pub message: String,
    pub recoverable: bool,
    pub details: Option<BTreeMap<String, Value>>,
}

impl Fault {
    pub fn new(error_type: ErrorType, message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            error_type,
            message: message.into(),
            recoverable,
            details: None,
        }
    }

    /// Transient transport failure (recoverable).
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Network, message, true)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Storage, message, true)
    }

    pub fn embedding(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Embedding, message, true)
    }

    pub fn parsing(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Parsing, message, false)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Validation, message, false)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Unknown, message, false)
    }

    pub fn with_recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.error_type, self.message)
    }
}

impl std::error::Error for Fault {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedContent {
    pub url: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl FetchedContent {
    pub fn new(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            body: body.into(),
            content_type: None,
            title: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// One chunk of an item's text; `id` is stable for identical input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextChunk {
    pub id: String,
    pub item_id: String,
    pub url: String,
    pub index: usize,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub chunk_id: String,
    pub vector: Vec<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Record handed to the vector store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub item_id: String,
    pub url: String,
    pub text: String,
    pub vector: Vec<f32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl VectorRecord {
    pub fn from_chunk(chunk: &TextChunk, embedding: Embedding) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("chunk_index".to_string(), Value::from(chunk.index));
        if let Some(model) = embedding.model {
            metadata.insert("model".to_string(), Value::from(model));
        }
        Self {
            id: chunk.id.clone(),
            item_id: chunk.item_id.clone(),
            url: chunk.url.clone(),
            text: chunk.text.clone(),
            vector: embedding.vector,
            metadata,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreAck {
    pub id: String,
}

/// Identifies the batch an ingestion job covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRef {
    pub execution_id: String,
    pub batch_index: usize,
    /// Items of the batch that stored at least one vector, sorted.
    pub item_ids: Vec<String>,
    pub vector_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionJob {
    pub job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedContent, Fault>;
}

/// Splits fetched content into chunks. Runs in-process.
pub trait Chunker: Send + Sync {
    fn chunk(&self, item_id: &str, content: &FetchedContent) -> Result<Vec<TextChunk>, Fault>;
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, chunk: &TextChunk) -> Result<Embedding, Fault>;
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn store(&self, record: &VectorRecord) -> Result<StoreAck, Fault>;
}

#[async_trait]
pub trait IngestionTrigger: Send + Sync {
    async fn start_ingestion(&self, batch: &BatchRef) -> Result<IngestionJob, Fault>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_defaults_follow_type() {
        assert!(Fault::network("reset").recoverable);
        assert!(Fault::storage("busy").recoverable);
        assert!(!Fault::validation("bad").recoverable);
        assert!(!Fault::parsing("empty").recoverable);
        let f = Fault::embedding("quota").with_recoverable(false).with_detail("status", 429);
        assert!(!f.recoverable);
        assert_eq!(f.details.unwrap()["status"], Value::from(429));
    }

    #[test]
    fn record_carries_chunk_metadata() {
        let chunk = TextChunk {
            id: "c1".into(),
            item_id: "item-1".into(),
            url: "https://example.com".into(),
            index: 2,
            text: "hello".into(),
        };
        let record = VectorRecord::from_chunk(
            &chunk,
            Embedding {
                chunk_id: "c1".into(),
                vector: vec![0.5, 0.5],
                model: Some("test".into()),
            },
        );
        assert_eq!(record.metadata["chunk_index"], Value::from(2));
        assert_eq!(record.metadata["model"], Value::from("test"));
        assert_eq!(Fault::network("x").to_string(), "[network] x");
    }
}
