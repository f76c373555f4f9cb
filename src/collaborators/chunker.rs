use sha2::{Digest, Sha256};

use super::{Chunker, Fault, FetchedContent, TextChunk};
use crate::{Error, Result};

/// Character-window chunker with overlap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunker {
    chunk_size: usize,
    overlap: usize,
}

impl Default for TextChunker {
    fn default() -> Self {
        Self {
            chunk_size: 1_000,
            overlap: 200,
        }
    }
}

impl TextChunker {
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::invalid_field(
                "pipeline.chunk_size",
                "chunk size must be positive",
            ));
        }
        if overlap >= chunk_size {
            return Err(Error::invalid_field(
                "pipeline.chunk_overlap",
                "overlap must be smaller than chunk size",
            ));
        }
        Ok(Self {
            chunk_size,
            overlap,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    fn chunk_id(item_id: &str, index: usize, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(item_id.as_bytes());
        hasher.update(index.to_le_bytes());
        hasher.update(text.as_bytes());
        hasher.finalize()[..8]
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

impl Chunker for TextChunker {
    fn chunk(&self, item_id: &str, content: &FetchedContent) -> std::result::Result<Vec<TextChunk>, Fault> {
        let normalized = content.body.split_whitespace().collect::<Vec<_>>().join(" ");
        if normalized.is_empty() {
            return Err(Fault::parsing(format!("no extractable text at {}", content.url)));
        }

        let chars: Vec<char> = normalized.chars().collect();
        let step = self.chunk_size - self.overlap;
        let mut chunks = Vec::new();
        let mut start = 0;
        while start < chars.len() {
            let end = (start + self.chunk_size).min(chars.len());
            let text: String = chars[start..end].iter().collect();
            let index = chunks.len();
            chunks.push(TextChunk {
                id: Self::chunk_id(item_id, index, &text),
                item_id: item_id.to_string(),
                url: content.url.clone(),
                index,
                text,
            });
            if end == chars.len() {
                break;
            }
            start += step;
        }
        Ok(chunks)
    }
}
