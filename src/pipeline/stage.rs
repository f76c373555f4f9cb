use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::types::CrawlerError;

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Chunk,
    Embed,
    Store,
    /// Batch-level; never part of an item's stage list.
    TriggerIngestion,
}

impl Stage {
    /// Per-item stages in order.
    pub const ITEM_STAGES: [Stage; 4] = [Stage::Fetch, Stage::Chunk, Stage::Embed, Stage::Store];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::Chunk => "chunk",
            Stage::Embed => "embed",
            Stage::Store => "store",
            Stage::TriggerIngestion => "trigger_ingestion",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work: a URL to ingest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: String,
    pub url: String,
    /// Copied onto every stored vector record.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl ContentItem {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// What happened to one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub item_id: String,
    pub url: String,
    pub stages_completed: Vec<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_error: Option<CrawlerError>,
    pub chunks: usize,
    pub vectors_stored: usize,
}

impl ItemOutcome {
    pub fn new(item_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            url: url.into(),
            stages_completed: Vec::new(),
            failed_stage: None,
            final_error: None,
            chunks: 0,
            vectors_stored: 0,
        }
    }

    /// A successful outcome that went through every item stage.
    pub fn completed(item_id: impl Into<String>, url: impl Into<String>) -> Self {
        let mut outcome = Self::new(item_id, url);
        outcome.stages_completed = Stage::ITEM_STAGES.to_vec();
        outcome
    }

    /// A terminal failure at `stage`.
    pub fn failed_at(mut self, stage: Stage, error: CrawlerError) -> Self {
        self.failed_stage = Some(stage);
        self.final_error = Some(error);
        self
    }

    pub fn is_success(&self) -> bool {
        self.final_error.is_none()
    }
}

/// Result of the batch-level ingestion trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionOutcome {
    pub batch_index: usize,
    pub item_ids: Vec<String>,
    pub vector_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CrawlerError>,
}

impl IngestionOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorType;

    #[test]
    fn stages_order_and_names() {
        assert!(Stage::Fetch < Stage::Store);
        assert_eq!(serde_json::to_string(&Stage::TriggerIngestion).unwrap(), "\"trigger_ingestion\"");
        assert_eq!(Stage::Embed.to_string(), "embed");
    }

    #[test]
    fn outcome_helpers() {
        let ok = ItemOutcome::completed("a", "https://a.test");
        assert!(ok.is_success());
        assert_eq!(ok.stages_completed.len(), 4);

        let failed = ItemOutcome::new("b", "https://b.test").failed_at(
            Stage::Fetch,
            CrawlerError::builder(ErrorType::Network, "down").build(),
        );
        assert!(!failed.is_success());
        assert_eq!(failed.failed_stage, Some(Stage::Fetch));
    }
}
