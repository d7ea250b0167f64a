//! Retrieval-augmented context formatting
//!
//! Turns merged search hits into the block a chat layer appends to its
//! system prompt. Only hits above the relevance threshold are included.

use atlas_common::embeddings::truncate_chars;
use atlas_common::vector::Candidate;
use serde::Serialize;

const HEADER: &str = "\n\n---\nRelevant context from knowledge base:\n";
const FOOTER: &str = "\n---\n";

/// Context block plus the hits it was built from
#[derive(Debug, Clone, Default, Serialize)]
pub struct RagContext {
    /// Prompt-ready text; empty when nothing qualified
    pub text: String,
    /// Hits included in `text`, in order
    pub hits: Vec<Candidate>,
}

impl RagContext {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// One `[source] title: text` line
fn format_hit(hit: &Candidate, chars_per_chunk: usize) -> String {
    format!(
        "[{}] {}: {}",
        hit.source_collection.as_deref().unwrap_or("unknown"),
        hit.title(),
        truncate_chars(hit.text(), chars_per_chunk)
    )
}

/// Keep hits whose relevance exceeds `threshold` and format them
pub fn assemble(hits: Vec<Candidate>, threshold: f32, chars_per_chunk: usize) -> RagContext {
    let included: Vec<Candidate> = hits
        .into_iter()
        .filter(|h| h.relevance() > threshold)
        .collect();
    if included.is_empty() {
        return RagContext::default();
    }

    let body = included
        .iter()
        .map(|h| format_hit(h, chars_per_chunk))
        .collect::<Vec<_>>()
        .join("\n\n");

    RagContext {
        text: format!("{}{}{}", HEADER, body, FOOTER),
        hits: included,
    }
}
