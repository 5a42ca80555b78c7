//! Types consumed and produced by fact extraction.

use serde::{Deserialize, Serialize};

use crate::MemoryType;

/// Confidence assumed for extracted facts that do not state one.
pub const DEFAULT_EXTRACTED_CONFIDENCE: f64 = 0.8;

/// One message of the conversation window handed to extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// `user`, `assistant` or `system`
    pub role: String,
    pub content: String,
}

impl ConversationTurn {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractOptions {
    /// Entity the conversation is about, used as fallback subject
    #[serde(default)]
    pub subject_hint: Option<String>,
    /// Turn the extracted facts are linked to
    #[serde(default)]
    pub source_message_id: Option<String>,
}

/// A fact that survived parsing and deduplication.
///
/// `memory_id` is set once the fact has been persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedFact {
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    pub content: String,
    pub subject: Option<String>,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_id: Option<String>,
}
