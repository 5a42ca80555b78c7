//! Hybrid retrieval.
//!
//! Combines similarity search with an exact lookup on the subjects named in
//! the query. A question that names "Acme Corp" must surface the memories
//! about Acme Corp even when embeddings are poor or missing.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use recall_models::{MemoryRecord, SearchResult};
use regex::Regex;
use tracing::{debug, warn};

use super::index::EmbeddingIndex;
use crate::db::{self, DbPool};

/// Score given to memories whose subject is named in the query.
pub const SUBJECT_MATCH_SCORE: f32 = 0.95;

/// Most proper-noun phrases looked up per query.
pub const MAX_PHRASES: usize = 3;

/// Runs of capitalized words. Possessive `'s` ends a run.
static PROPER_NOUN_RUN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b\p{Lu}[\w&-]*(?:\s+\p{Lu}[\w&-]*)*").expect("proper noun pattern is valid")
});

/// Capitalized only because they open a sentence or a question.
const LEADING_STOPWORDS: &[&str] = &[
    "A", "An", "And", "Are", "As", "At", "Can", "Could", "Did", "Do", "Does", "For", "From",
    "Give", "Has", "Have", "How", "I", "If", "In", "Is", "It", "List", "My", "Of", "On", "Or",
    "Please", "Remind", "Should", "Show", "So", "Tell", "The", "This", "To", "We", "What",
    "When", "Where", "Which", "Who", "Why", "Will", "With", "Would", "You",
];

/// Proper-noun phrases in `query`, in order of appearance, at most
/// [`MAX_PHRASES`], without duplicates.
pub fn extract_proper_nouns(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut phrases = Vec::new();

    for run in PROPER_NOUN_RUN.find_iter(query) {
        let words: Vec<&str> = run
            .as_str()
            .split_whitespace()
            .skip_while(|w| LEADING_STOPWORDS.contains(w))
            .collect();
        if words.is_empty() {
            continue;
        }

        let phrase = words.join(" ");
        if phrase.chars().count() < 2 || !seen.insert(phrase.to_lowercase()) {
            continue;
        }

        phrases.push(phrase);
        if phrases.len() == MAX_PHRASES {
            break;
        }
    }

    phrases
}

/// Lexical results first, then vector results; the first occurrence of a
/// memory wins. Stable sort by score, best first, truncated to `limit`.
///
/// Vector scores are capped at [`SUBJECT_MATCH_SCORE`], so a subject hit
/// is never ranked below an embedding-only match; ties keep lexical first.
pub fn merge_results(
    lexical: Vec<SearchResult>,
    vector: Vec<SearchResult>,
    limit: usize,
) -> Vec<SearchResult> {
    let mut seen = HashSet::new();
    let vector = vector.into_iter().map(|mut r| {
        r.score = r.score.min(SUBJECT_MATCH_SCORE);
        r
    });
    let mut merged: Vec<SearchResult> = lexical
        .into_iter()
        .chain(vector)
        .filter(|r| seen.insert(r.memory_id.clone()))
        .collect();

    merged.sort_by(|a, b| b.score.total_cmp(&a.score));
    merged.truncate(limit);
    merged
}

#[derive(Clone)]
pub struct HybridRetriever {
    db: DbPool,
    index: EmbeddingIndex,
    score_threshold: f32,
}

impl HybridRetriever {
    pub fn new(db: DbPool, index: EmbeddingIndex, score_threshold: f32) -> Self {
        Self {
            db,
            index,
            score_threshold,
        }
    }

    pub async fn hybrid_search(
        &self,
        tenant_id: &str,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> Vec<SearchResult> {
        if limit == 0 || query.trim().is_empty() {
            return Vec::new();
        }

        let phrases = extract_proper_nouns(query);

        let vector = self
            .index
            .similarity_search(tenant_id, user_id, query, limit, self.score_threshold)
            .await;

        let mut lexical = Vec::new();
        for phrase in &phrases {
            match db::find_memories_by_subject(&self.db, tenant_id, user_id, phrase, limit as i64)
                .await
            {
                Ok(records) => lexical.extend(records.into_iter().map(subject_hit)),
                Err(e) => warn!(
                    tenant_id = %tenant_id,
                    phrase = %phrase,
                    error = %e,
                    "Subject lookup failed"
                ),
            }
        }

        debug!(
            tenant_id = %tenant_id,
            phrases = ?phrases,
            lexical = lexical.len(),
            vector = vector.len(),
            "Hybrid search"
        );

        merge_results(lexical, vector, limit)
    }
}

fn subject_hit(record: MemoryRecord) -> SearchResult {
    SearchResult {
        memory_id: record.id,
        score: SUBJECT_MATCH_SCORE,
        content: record.content,
        subject: record.subject,
        memory_type: record.memory_type,
    }
}
