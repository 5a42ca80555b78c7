//! Retrieval results and assembled prompt context.

use serde::{Deserialize, Serialize};

use crate::MemoryType;

/// A ranked retrieval hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub memory_id: String,
    pub score: f32,
    pub content: String,
    pub subject: Option<String>,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
}

/// A fact offered to the model, kept so that citations in the response can
/// be traced back to the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribution {
    pub memory_id: String,
    pub subject: String,
    /// First 100 characters of the content
    pub summary: String,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
}

/// Formatted memory block ready for prompt injection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryContext {
    pub context_text: String,
    pub attributions: Vec<Attribution>,
    pub estimated_token_count: usize,
}

impl MemoryContext {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.context_text.is_empty()
    }
}
