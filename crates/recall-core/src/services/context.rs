//! Context assembly and citation matching.
//!
//! Turns ranked memories into a prompt block that fits a token budget, and
//! maps the citation phrases a model used in its answer back to the
//! memories it was offered.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use recall_models::{Attribution, MemoryContext, SearchResult};
use regex::Regex;
use tracing::debug;

use super::retriever::HybridRetriever;

pub const CONTEXT_HEADER: &str = "## What you remember about this user";
pub const CONTEXT_INSTRUCTION: &str = "Use these facts when relevant. When you rely on one, say so naturally, e.g. \"Based on our previous discussion about <subject>, ...\".";
pub const CONTEXT_FOOTER: &str = "## End of remembered facts";

/// Subject recorded for attributions of memories without one.
pub const DEFAULT_ATTRIBUTION_SUBJECT: &str = "general context";

/// Characters of content kept as an attribution summary.
pub const SUMMARY_CHARS: usize = 100;

/// Rough token count: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// `[Client: Acme Corp] has a budget of $50,000`
pub fn format_fact(result: &SearchResult) -> String {
    let label = result.memory_type.label();
    match result.subject.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(subject) => format!("[{}: {}] {}", label, subject, result.content),
        None => format!("[{}] {}", label, result.content),
    }
}

fn render(facts: &[String]) -> String {
    let mut lines = Vec::with_capacity(facts.len() + 3);
    lines.push(CONTEXT_HEADER);
    lines.push(CONTEXT_INSTRUCTION);
    lines.extend(facts.iter().map(String::as_str));
    lines.push(CONTEXT_FOOTER);
    lines.join("\n")
}

fn attribution_for(result: &SearchResult) -> Attribution {
    Attribution {
        memory_id: result.memory_id.clone(),
        subject: result
            .subject
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_ATTRIBUTION_SUBJECT)
            .to_string(),
        summary: result.content.chars().take(SUMMARY_CHARS).collect(),
        memory_type: result.memory_type,
    }
}

/// Build the context block from ranked results.
///
/// Facts are admitted in rank order while the whole block, header and
/// footer included, stays within `token_budget`. The first fact that does
/// not fit ends assembly. No fact admitted means an empty context.
pub fn assemble(results: &[SearchResult], token_budget: usize) -> MemoryContext {
    let mut facts: Vec<String> = Vec::new();
    let mut attributions = Vec::new();

    for result in results {
        facts.push(format_fact(result));
        if estimate_tokens(&render(&facts)) > token_budget {
            facts.pop();
            break;
        }
        attributions.push(attribution_for(result));
    }

    if facts.is_empty() {
        return MemoryContext::empty();
    }

    let context_text = render(&facts);
    MemoryContext {
        estimated_token_count: estimate_tokens(&context_text),
        context_text,
        attributions,
    }
}

/// Append the context block to a system prompt. An empty context leaves the
/// prompt untouched.
pub fn inject_into_prompt(base_prompt: &str, context: &MemoryContext) -> String {
    if context.context_text.is_empty() {
        return base_prompt.to_string();
    }
    if base_prompt.is_empty() {
        return context.context_text.clone();
    }
    format!("{}\n\n{}", base_prompt, context.context_text)
}

static CITATION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)based on our previous discussion about\s+([^.,;:!?\n]+)",
        r"(?i)as we discussed regarding\s+([^.,;:!?\n]+)",
        r"(?i)from our earlier conversation about\s+([^.,;:!?\n]+)",
        r"(?i)you mentioned that\s+([^.,;:!?\n]+)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("citation pattern is valid"))
    .collect()
});

/// Whether `needle` occurs in `haystack` as whole words.
fn contains_words(haystack: &str, needle: &str) -> bool {
    haystack.match_indices(needle).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + needle.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

/// Attributions whose subject matches a phrase the response cites.
///
/// A cited phrase matches when it contains the subject or the subject
/// contains it, as whole words and ignoring case. Each memory is reported
/// once, in order of first citation in the response.
pub fn match_attributions(response: &str, offered: &[Attribution]) -> Vec<Attribution> {
    let mut cited: Vec<(usize, String)> = CITATION_PATTERNS
        .iter()
        .flat_map(|re| re.captures_iter(response))
        .filter_map(|caps| caps.get(1))
        .map(|m| (m.start(), m.as_str().trim().to_lowercase()))
        .filter(|(_, p)| !p.is_empty())
        .collect();
    cited.sort_by_key(|(start, _)| *start);

    let mut seen = HashSet::new();
    let mut matched = Vec::new();

    for (_, phrase) in &cited {
        for attribution in offered {
            let subject = attribution.subject.to_lowercase();
            if subject.is_empty() {
                continue;
            }
            if (contains_words(phrase, &subject) || contains_words(&subject, phrase))
                && seen.insert(attribution.memory_id.clone())
            {
                matched.push(attribution.clone());
            }
        }
    }

    matched
}

#[derive(Clone)]
pub struct ContextAssembler {
    retriever: HybridRetriever,
    token_budget: usize,
    candidates: usize,
}

impl ContextAssembler {
    pub fn new(retriever: HybridRetriever, token_budget: usize, candidates: usize) -> Self {
        Self {
            retriever,
            token_budget,
            candidates,
        }
    }

    pub fn token_budget(&self) -> usize {
        self.token_budget
    }

    pub async fn build_context(&self, query: &str, user_id: &str, tenant_id: &str) -> MemoryContext {
        let results = self
            .retriever
            .hybrid_search(tenant_id, user_id, query, self.candidates)
            .await;
        if results.is_empty() {
            return MemoryContext::empty();
        }

        let context = assemble(&results, self.token_budget);

        debug!(
            tenant_id = %tenant_id,
            candidates = results.len(),
            included = context.attributions.len(),
            tokens = context.estimated_token_count,
            "Built memory context"
        );

        context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recall_models::MemoryType;

    fn result(id: &str, subject: Option<&str>, content: &str, memory_type: MemoryType) -> SearchResult {
        SearchResult {
            memory_id: id.to_string(),
            score: 0.9,
            content: content.to_string(),
            subject: subject.map(str::to_string),
            memory_type,
        }
    }

    fn attribution(id: &str, subject: &str) -> Attribution {
        Attribution {
            memory_id: id.to_string(),
            subject: subject.to_string(),
            summary: String::new(),
            memory_type: MemoryType::ClientContext,
        }
    }

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_format_fact() {
        let with_subject = result(
            "m1",
            Some("Acme Corp"),
            "has a budget of $50,000",
            MemoryType::ClientContext,
        );
        assert_eq!(
            format_fact(&with_subject),
            "[Client: Acme Corp] has a budget of $50,000"
        );

        let blank_subject = result("m2", Some("  "), "likes tables", MemoryType::UserPreference);
        assert_eq!(format_fact(&blank_subject), "[Preference] likes tables");
    }

    #[test]
    fn test_assemble_empty() {
        let context = assemble(&[], 800);
        assert!(context.is_empty());
        assert!(context.attributions.is_empty());
        assert_eq!(context.estimated_token_count, 0);
    }

    #[test]
    fn test_assemble_includes_attributions() {
        let long = "x".repeat(250);
        let results = vec![
            result("m1", Some("Acme Corp"), "has a budget of $50,000", MemoryType::ClientContext),
            result("m2", None, &long, MemoryType::FactualStatement),
        ];

        let context = assemble(&results, 800);
        assert!(context.context_text.starts_with(CONTEXT_HEADER));
        assert!(context.context_text.ends_with(CONTEXT_FOOTER));
        assert!(context
            .context_text
            .contains("[Client: Acme Corp] has a budget of $50,000"));
        assert_eq!(context.attributions.len(), 2);
        assert_eq!(context.attributions[0].subject, "Acme Corp");
        assert_eq!(context.attributions[1].subject, DEFAULT_ATTRIBUTION_SUBJECT);
        assert_eq!(context.attributions[1].summary.chars().count(), SUMMARY_CHARS);
        assert_eq!(
            context.estimated_token_count,
            estimate_tokens(&context.context_text)
        );
    }

    #[test]
    fn test_assemble_never_exceeds_budget() {
        let results: Vec<SearchResult> = (0..20)
            .map(|i| {
                result(
                    &format!("m{}", i),
                    Some("Acme Corp"),
                    &format!("fact number {} {}", i, "y".repeat(60)),
                    MemoryType::ClientContext,
                )
            })
            .collect();

        for budget in [60, 100, 150, 300, 800] {
            let context = assemble(&results, budget);
            assert!(context.estimated_token_count <= budget, "budget {}", budget);
            if !context.is_empty() {
                assert!(estimate_tokens(&context.context_text) <= budget);
            }
        }
    }

    #[test]
    fn test_assemble_stops_at_first_overflow() {
        let budget = 120;
        let small = result("m1", None, "short fact", MemoryType::FactualStatement);
        let huge = result("m2", None, &"z".repeat(2000), MemoryType::FactualStatement);
        let small_again = result("m3", None, "another short fact", MemoryType::FactualStatement);

        let context = assemble(&[small, huge, small_again], budget);
        let ids: Vec<&str> = context
            .attributions
            .iter()
            .map(|a| a.memory_id.as_str())
            .collect();
        assert_eq!(ids, vec!["m1"]);
        assert!(!context.context_text.contains("zzzz"));
        assert!(!context.context_text.contains("another short fact"));
    }

    #[test]
    fn test_assemble_returns_empty_when_nothing_fits() {
        let huge = result("m1", None, &"z".repeat(4000), MemoryType::FactualStatement);
        let context = assemble(&[huge], 800);
        assert!(context.is_empty());
        assert!(context.attributions.is_empty());
    }

    #[test]
    fn test_inject_into_prompt() {
        let empty = MemoryContext::empty();
        assert_eq!(inject_into_prompt("You are helpful.", &empty), "You are helpful.");

        let context = assemble(
            &[result("m1", None, "fact", MemoryType::FactualStatement)],
            800,
        );
        let prompt = inject_into_prompt("You are helpful.", &context);
        assert!(prompt.starts_with("You are helpful.\n\n"));
        assert!(prompt.ends_with(&context.context_text));
    }

    #[test]
    fn test_match_attributions_patterns() {
        let offered = vec![
            attribution("m1", "Acme Corp"),
            attribution("m2", "Project Phoenix"),
            attribution("m3", "Globex"),
        ];

        let response = "Based on our previous discussion about Acme Corp, the budget is fixed. \
                        As we discussed regarding project phoenix, the deadline moved. \
                        Based on our previous discussion about acme corp's budget, we should wait.";

        let matched = match_attributions(response, &offered);
        let ids: Vec<&str> = matched.iter().map(|a| a.memory_id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
    }

    #[test]
    fn test_match_attributions_either_direction() {
        let offered = vec![attribution("m1", "Acme Corp budget planning")];

        let matched = match_attributions("From our earlier conversation about Acme Corp.", &offered);
        assert_eq!(matched.len(), 1);

        let matched = match_attributions("You mentioned that the Acme Corp budget planning slipped", &offered);
        assert_eq!(matched.len(), 1);

        let matched = match_attributions("Acme Corp is great.", &offered);
        assert!(matched.is_empty());
    }

    #[test]
    fn test_match_attributions_in_response_order() {
        let offered = vec![attribution("m1", "Acme Corp"), attribution("m2", "Project Phoenix")];

        let response = "You mentioned that Project Phoenix slipped a week. \
                        Based on our previous discussion about Acme Corp, the budget holds.";

        let matched = match_attributions(response, &offered);
        let ids: Vec<&str> = matched.iter().map(|a| a.memory_id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m1"]);
    }

    #[test]
    fn test_match_attributions_whole_words_only() {
        let offered = vec![attribution("m1", "Initech"), attribution("m2", "Acme Corp")];

        assert!(match_attributions("You mentioned that it.", &offered).is_empty());
        assert!(match_attributions("As we discussed regarding Acme Corporation", &offered).is_empty());

        let matched = match_attributions("As we discussed regarding initech's renewal", &offered);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].memory_id, "m1");
    }

    #[test]
    fn test_contains_words() {
        assert!(contains_words("acme corp's budget", "acme corp"));
        assert!(contains_words("über gmbh", "über"));
        assert!(!contains_words("initech", "it"));
        assert!(!contains_words("acme corporation", "acme corp"));
    }
}
