//! Fact extraction from conversations.
//!
//! Asks the chat model for durable facts in a conversation window, parses
//! the JSON array out of its answer, drops facts the user already has on record and
//! persists the rest as `AI_EXTRACTED` memories. Embeddings are generated
//! in the background.
//!
//! Nothing in here fails the caller: a missing or broken model, an
//! unparseable answer or a database hiccup all end in an empty result.

use std::collections::HashSet;
use std::sync::Arc;

use recall_llm::{extract_json_array, ChatMessage, CompletionOptions};
use recall_models::{
    ConversationTurn, ExtractOptions, ExtractedFact, MemoryRecord, MemorySource, MemoryType,
    NewMemory, DEFAULT_EXTRACTED_CONFIDENCE,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::capabilities::ChatCompletion;
use super::embedding_queue::{EmbeddingJob, EmbeddingQueue};
use crate::config::MemorySettings;
use crate::db::{self, DbPool};

/// Smallest window worth sending to the model.
pub const MIN_WINDOW_TURNS: usize = 2;

/// Words shorter than this are ignored by the similarity measure.
const MIN_TOKEN_CHARS: usize = 3;

const EXTRACTION_SYSTEM_PROMPT: &str = r#"You extract durable facts worth remembering from a conversation between a user and an assistant.

Only keep facts that will still be useful in later conversations: details about the user's clients, their projects, how the user likes to work, and other stable statements. Ignore small talk, questions and anything the assistant merely suggested.

Respond with a JSON array and nothing else. Each element is an object:
{"type": "CLIENT_CONTEXT" | "PROJECT_CONTEXT" | "USER_PREFERENCE" | "FACTUAL_STATEMENT", "content": "the fact, without the subject", "subject": "who or what the fact is about", "confidence": 0.0 to 1.0}

Return [] when there is nothing worth remembering."#;

/// Role-labelled transcript, one turn per line.
pub fn format_transcript(window: &[ConversationTurn]) -> String {
    window
        .iter()
        .map(|turn| format!("{}: {}", role_label(&turn.role), turn.content.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn role_label(role: &str) -> String {
    match role.trim().to_lowercase().as_str() {
        "user" => "User".to_string(),
        "assistant" => "Assistant".to_string(),
        "system" => "System".to_string(),
        other => {
            let mut chars = other.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => "Unknown".to_string(),
            }
        }
    }
}

pub fn build_extraction_messages(
    window: &[ConversationTurn],
    subject_hint: Option<&str>,
) -> Vec<ChatMessage> {
    let mut system = EXTRACTION_SYSTEM_PROMPT.to_string();
    if let Some(hint) = subject_hint.map(str::trim).filter(|h| !h.is_empty()) {
        system.push_str(&format!(
            "\n\nThis conversation is about {}. Use \"{}\" as the subject of any fact that has no other subject.",
            hint, hint
        ));
    }

    vec![
        ChatMessage::system(system),
        ChatMessage::user(format!("Conversation:\n{}", format_transcript(window))),
    ]
}

/// Parse the model answer into facts.
///
/// Uses the first `[` .. last `]` span of the answer. Entries without a
/// `type` or `content` string are dropped. Unknown types become
/// `FACTUAL_STATEMENT`; confidence is clamped into [0, 1] and defaults to
/// 0.8. `None` means the answer held no JSON array at all.
pub fn parse_extracted_facts(response: &str) -> Option<Vec<ExtractedFact>> {
    let span = extract_json_array(response)?;
    let entries: Vec<Value> = serde_json::from_str(span).ok()?;

    Some(entries.iter().filter_map(parse_entry).collect())
}

fn parse_entry(entry: &Value) -> Option<ExtractedFact> {
    let memory_type = entry.get("type").and_then(Value::as_str)?;
    let content = entry
        .get("content")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|c| !c.is_empty())?;

    let subject = entry
        .get("subject")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let confidence = entry
        .get("confidence")
        .and_then(Value::as_f64)
        .filter(|c| c.is_finite())
        .map(|c| c.clamp(0.0, 1.0))
        .unwrap_or(DEFAULT_EXTRACTED_CONFIDENCE);

    Some(ExtractedFact {
        memory_type: MemoryType::normalize(memory_type),
        content: content.to_string(),
        subject,
        confidence,
        memory_id: None,
    })
}

fn tokens(text: &str) -> HashSet<String> {
    text.split_whitespace()
        .map(str::to_lowercase)
        .filter(|w| w.chars().count() >= MIN_TOKEN_CHARS)
        .collect()
}

/// Jaccard similarity of the case-folded words longer than two characters.
///
/// Texts made only of short words compare equal when they are the same
/// text ignoring case and spacing.
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let left = tokens(a);
    let right = tokens(b);

    if left.is_empty() && right.is_empty() {
        let normalize = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
        return if normalize(a) == normalize(b) { 1.0 } else { 0.0 };
    }
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }

    let intersection = left.intersection(&right).count();
    let union = left.union(&right).count();
    intersection as f64 / union as f64
}

/// Keep facts not too similar to any existing memory nor to a fact kept
/// earlier in the same batch.
pub fn deduplicate(
    facts: Vec<ExtractedFact>,
    existing: &[MemoryRecord],
    threshold: f64,
) -> Vec<ExtractedFact> {
    let mut kept: Vec<ExtractedFact> = Vec::with_capacity(facts.len());

    for fact in facts {
        let duplicate = existing
            .iter()
            .map(|r| r.content.as_str())
            .chain(kept.iter().map(|k| k.content.as_str()))
            .any(|other| jaccard_similarity(&fact.content, other) > threshold);

        if duplicate {
            debug!(content = %fact.content, "Discarding duplicate fact");
            metrics::counter!("recall_dedup_discarded_total").increment(1);
        } else {
            kept.push(fact);
        }
    }

    kept
}

#[derive(Clone)]
pub struct ExtractionPipeline {
    db: DbPool,
    chat: Arc<dyn ChatCompletion>,
    queue: EmbeddingQueue,
    settings: MemorySettings,
}

impl ExtractionPipeline {
    pub fn new(
        db: DbPool,
        chat: Arc<dyn ChatCompletion>,
        queue: EmbeddingQueue,
        settings: MemorySettings,
    ) -> Self {
        Self {
            db,
            chat,
            queue,
            settings,
        }
    }

    /// Extract, deduplicate and persist the facts of a conversation window.
    ///
    /// Returns the persisted facts with their memory ids.
    pub async fn extract_memories(
        &self,
        window: &[ConversationTurn],
        user_id: &str,
        tenant_id: &str,
        options: &ExtractOptions,
    ) -> Vec<ExtractedFact> {
        if window.len() < MIN_WINDOW_TURNS {
            debug!(tenant_id = %tenant_id, turns = window.len(), "Window too short for extraction");
            return Vec::new();
        }

        if !self.chat.is_available().await {
            debug!(tenant_id = %tenant_id, "No chat model available, skipping extraction");
            return Vec::new();
        }

        let hint = options
            .subject_hint
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty());

        let messages = build_extraction_messages(window, hint);
        let completion = CompletionOptions {
            temperature: self.settings.extraction_temperature,
            max_tokens: self.settings.extraction_max_tokens,
        };

        let response = match self.chat.complete(&messages, &completion).await {
            Ok(response) => response,
            Err(e) => {
                warn!(tenant_id = %tenant_id, error = %e, "Extraction completion failed");
                metrics::counter!("recall_extraction_failures_total", "stage" => "completion")
                    .increment(1);
                return Vec::new();
            }
        };

        let Some(facts) = parse_extracted_facts(&response) else {
            warn!(
                tenant_id = %tenant_id,
                response_len = response.len(),
                "Extraction response held no JSON array"
            );
            metrics::counter!("recall_extraction_failures_total", "stage" => "parse").increment(1);
            return Vec::new();
        };

        if facts.is_empty() {
            return Vec::new();
        }

        let candidates = facts.len();
        let facts = match db::list_recent_memories(
            &self.db,
            tenant_id,
            user_id,
            self.settings.dedup_pool_size,
        )
        .await
        {
            Ok(existing) => deduplicate(facts, &existing, self.settings.dedup_threshold),
            Err(e) => {
                warn!(tenant_id = %tenant_id, error = %e, "Could not load memories for dedup, skipping it");
                facts
            }
        };

        let mut persisted = Vec::with_capacity(facts.len());
        for mut fact in facts {
            let subject = fact.subject.clone().or_else(|| hint.map(str::to_string));

            let mut input = NewMemory::new(fact.memory_type, MemorySource::AiExtracted, &fact.content)
                .with_confidence(fact.confidence);
            if let Some(subject) = &subject {
                input = input.with_subject(subject.clone());
            }
            if let Some(message_id) = &options.source_message_id {
                input = input.with_source_message(message_id.clone());
            }

            match db::create_memory(&self.db, tenant_id, user_id, input).await {
                Ok(record) => {
                    self.queue.enqueue(EmbeddingJob::for_record(&record));
                    fact.subject = subject;
                    fact.memory_id = Some(record.id);
                    persisted.push(fact);
                }
                Err(e) => {
                    warn!(tenant_id = %tenant_id, error = %e, "Failed to persist extracted fact");
                    metrics::counter!("recall_extraction_failures_total", "stage" => "persist")
                        .increment(1);
                }
            }
        }

        info!(
            tenant_id = %tenant_id,
            candidates,
            persisted = persisted.len(),
            "Extracted memories"
        );

        persisted
    }
}
