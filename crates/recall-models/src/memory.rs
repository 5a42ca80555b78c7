//! Memory records: durable facts about a user's clients, projects and preferences.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[cfg(feature = "sqlx")]
use sqlx::FromRow;

/// Default page size for memory listings.
pub const DEFAULT_LIST_LIMIT: i64 = 20;
/// Upper bound on a single memory listing page.
pub const MAX_LIST_LIMIT: i64 = 100;
/// Confidence assigned to user-authored and user-corrected memories.
pub const USER_CONFIDENCE: f64 = 1.0;

/// What a memory is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum MemoryType {
    /// Facts about a client (budget, contacts, preferences of the client)
    ClientContext,
    /// Facts about a project the user works on
    ProjectContext,
    /// How the user likes to work or be answered
    UserPreference,
    /// Anything else worth remembering
    FactualStatement,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::ClientContext => "CLIENT_CONTEXT",
            MemoryType::ProjectContext => "PROJECT_CONTEXT",
            MemoryType::UserPreference => "USER_PREFERENCE",
            MemoryType::FactualStatement => "FACTUAL_STATEMENT",
        }
    }

    /// Strict parse. Returns `None` for anything outside the enumeration.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "CLIENT_CONTEXT" => Some(MemoryType::ClientContext),
            "PROJECT_CONTEXT" => Some(MemoryType::ProjectContext),
            "USER_PREFERENCE" => Some(MemoryType::UserPreference),
            "FACTUAL_STATEMENT" => Some(MemoryType::FactualStatement),
            _ => None,
        }
    }

    /// Lenient parse for model output: trims, ignores case and treats
    /// anything unrecognised as a factual statement.
    pub fn normalize(s: &str) -> Self {
        let upper = s.trim().to_uppercase().replace([' ', '-'], "_");
        Self::from_str(&upper).unwrap_or(MemoryType::FactualStatement)
    }

    /// Short label used when formatting facts for a prompt.
    pub fn label(&self) -> &'static str {
        match self {
            MemoryType::ClientContext => "Client",
            MemoryType::ProjectContext => "Project",
            MemoryType::UserPreference => "Preference",
            MemoryType::FactualStatement => "Fact",
        }
    }

    pub fn all() -> &'static [MemoryType] {
        &[
            MemoryType::ClientContext,
            MemoryType::ProjectContext,
            MemoryType::UserPreference,
            MemoryType::FactualStatement,
        ]
    }
}

impl Default for MemoryType {
    fn default() -> Self {
        MemoryType::FactualStatement
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a memory came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum MemorySource {
    /// Pulled out of a conversation by the extraction pipeline
    AiExtracted,
    /// Written directly by the user
    UserStated,
    /// Edited by the user after creation
    UserCorrected,
}

impl MemorySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemorySource::AiExtracted => "AI_EXTRACTED",
            MemorySource::UserStated => "USER_STATED",
            MemorySource::UserCorrected => "USER_CORRECTED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "AI_EXTRACTED" => Some(MemorySource::AiExtracted),
            "USER_STATED" => Some(MemorySource::UserStated),
            "USER_CORRECTED" => Some(MemorySource::UserCorrected),
            _ => None,
        }
    }
}

impl std::fmt::Display for MemorySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A stored memory.
///
/// `tenant_id` and `user_id` never change once the record exists. Records
/// are only ever soft-deleted; a deleted record keeps its row with
/// `is_deleted` set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(FromRow))]
pub struct MemoryRecord {
    pub id: String,
    pub tenant_id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    #[cfg_attr(feature = "sqlx", sqlx(rename = "type"))]
    pub memory_type: MemoryType,
    pub source: MemorySource,
    pub content: String,
    pub subject: Option<String>,
    pub confidence: f64,
    pub embedding_id: Option<String>,
    pub source_message_id: Option<String>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MemoryRecord {
    /// Subject if present and non-blank.
    pub fn subject_str(&self) -> Option<&str> {
        self.subject.as_deref().filter(|s| !s.trim().is_empty())
    }
}

/// Input for creating a memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMemory {
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    pub source: MemorySource,
    pub content: String,
    #[serde(default)]
    pub subject: Option<String>,
    /// Defaults to 1.0 when absent. Clamped into [0, 1].
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub source_message_id: Option<String>,
}

impl NewMemory {
    pub fn new(memory_type: MemoryType, source: MemorySource, content: impl Into<String>) -> Self {
        Self {
            memory_type,
            source,
            content: content.into(),
            subject: None,
            confidence: None,
            source_message_id: None,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_source_message(mut self, message_id: impl Into<String>) -> Self {
        self.source_message_id = Some(message_id.into());
        self
    }

    /// Confidence to persist: the supplied value clamped into [0, 1], or 1.0.
    pub fn effective_confidence(&self) -> f64 {
        match self.confidence {
            Some(c) if c.is_finite() => c.clamp(0.0, 1.0),
            _ => USER_CONFIDENCE,
        }
    }
}

/// A user correction. `subject` is left unchanged when `None`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryUpdate {
    pub content: String,
    #[serde(default)]
    pub subject: Option<String>,
}

/// Filters for listing a user's memories.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryFilter {
    #[serde(default, rename = "type")]
    pub memory_type: Option<MemoryType>,
    /// Case-insensitive substring of the subject
    #[serde(default)]
    pub subject: Option<String>,
    /// Case-insensitive substring of the content
    #[serde(default, alias = "q")]
    pub search: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
    #[serde(default)]
    pub include_deleted: bool,
}

impl MemoryFilter {
    /// Page size clamped into `1..=MAX_LIST_LIMIT`, defaulting to `DEFAULT_LIST_LIMIT`.
    pub fn effective_limit(&self) -> i64 {
        self.limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT)
    }

    pub fn effective_offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

/// One page of a listing plus the total number of matching records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryPage {
    pub records: Vec<MemoryRecord>,
    pub total: i64,
}
