//! Usage signal estimation
//!
//! Estimates how much a generated answer drew on each retrieved passage by
//! lexical keyword overlap. No model call is involved; this runs inline on
//! every turn.

use atlas_common::config::UsageConfig;
use atlas_common::vector::Candidate;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had",
    "do", "does", "did", "will", "would", "could", "should", "may", "might", "shall", "can",
    "need", "dare", "ought", "used", "to", "of", "in", "for", "on", "with", "at", "by", "from",
    "as", "into", "through", "during", "before", "after", "above", "below", "between", "out",
    "off", "over", "under", "again", "further", "then", "once", "here", "there", "when",
    "where", "why", "how", "all", "each", "every", "both", "few", "more", "most", "other",
    "some", "such", "no", "nor", "not", "only", "own", "same", "so", "than", "too", "very",
    "just", "because", "but", "and", "or", "if", "while", "that", "this", "these", "those",
    "it", "its", "i", "me", "my", "we", "our", "you", "your", "he", "him", "his", "she", "her",
    "they", "them", "their", "what", "which", "who", "whom", "whose",
];

fn word_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[a-z][a-z0-9_]+").expect("static pattern"))
}

fn stopwords() -> &'static HashSet<&'static str> {
    static SET: OnceLock<HashSet<&'static str>> = OnceLock::new();
    SET.get_or_init(|| STOPWORDS.iter().copied().collect())
}

/// The `top_n` most frequent content words of `text`.
///
/// Equal counts keep first-occurrence order.
pub fn extract_keywords(text: &str, top_n: usize, min_len: usize) -> Vec<String> {
    let lowered = text.to_lowercase();
    let mut order: Vec<&str> = Vec::new();
    let mut counts: HashMap<&str, usize> = HashMap::new();

    for word in word_pattern().find_iter(&lowered).map(|m| m.as_str()) {
        if word.len() < min_len || stopwords().contains(word) {
            continue;
        }
        let count = counts.entry(word).or_insert(0);
        if *count == 0 {
            order.push(word);
        }
        *count += 1;
    }

    // Stable sort keeps first-seen order among ties
    order.sort_by(|a, b| counts[b].cmp(&counts[a]));
    order.into_iter().take(top_n).map(str::to_string).collect()
}

/// A retrieved hit paired with its estimated usage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageScoredHit {
    #[serde(flatten)]
    pub hit: Candidate,
    /// Share of the hit's keywords found in the response, in [0, 1]
    pub usage_score: f64,
}

/// Text a hit is judged by: its title, or its passage when untitled
fn hit_text(hit: &Candidate) -> &str {
    let title = hit.title();
    if title.trim().is_empty() {
        hit.text()
    } else {
        title
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Score every hit against a generated response.
///
/// Returns one record per hit, in input order. An empty hit list, or a
/// response with no content words, yields an empty list.
pub fn compute_usage(hits: &[Candidate], response: &str, config: &UsageConfig) -> Vec<UsageScoredHit> {
    if hits.is_empty() || response.trim().is_empty() {
        return Vec::new();
    }

    let response_keywords: HashSet<String> =
        extract_keywords(response, config.response_keywords, config.min_word_len)
            .into_iter()
            .collect();
    if response_keywords.is_empty() {
        return Vec::new();
    }

    hits.iter()
        .map(|hit| {
            let keywords = extract_keywords(hit_text(hit), config.hit_keywords, config.min_word_len);
            let usage_score = if keywords.is_empty() {
                0.0
            } else {
                let overlap = keywords.iter().filter(|k| response_keywords.contains(*k)).count();
                round3((overlap as f64 / keywords.len().max(1) as f64).clamp(0.0, 1.0))
            };
            UsageScoredHit {
                hit: hit.clone(),
                usage_score,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_common::vector::Payload;
    use serde_json::json;

    fn titled(id: &str, title: &str) -> Candidate {
        let mut payload = Payload::new();
        payload.insert("title".into(), json!(title));
        Candidate::new(id, 0.5, payload)
    }

    fn config() -> UsageConfig {
        UsageConfig::default()
    }

    #[test]
    fn test_extract_keywords_filters_and_orders() {
        let keywords = extract_keywords("The pie, the PIE and an apple pie for me", 10, 3);
        assert_eq!(keywords, vec!["pie", "apple"]);
    }

    #[test]
    fn test_extract_keywords_ties_keep_first_seen() {
        let keywords = extract_keywords("zeta alpha zeta alpha gamma", 2, 3);
        assert_eq!(keywords, vec!["zeta", "alpha"]);
    }

    #[test]
    fn test_usage_partial_overlap() {
        // "recipe" never appears in the response: 2 of 3 hit keywords
        let scored = compute_usage(&[titled("p1", "apple pie recipe")], "I love apple pie", &config());
        assert_eq!(scored.len(), 1);
        assert_eq!(scored[0].usage_score, 0.667);
    }

    #[test]
    fn test_usage_full_overlap() {
        let scored = compute_usage(&[titled("p1", "apple pie")], "I love apple pie", &config());
        assert_eq!(scored[0].usage_score, 1.0);
    }

    #[test]
    fn test_usage_untitled_hit_scores_zero() {
        let hits = vec![titled("p1", ""), titled("p2", "the of and")];
        let scored = compute_usage(&hits, "apple pie is great", &config());
        assert_eq!(scored.len(), 2);
        assert!(scored.iter().all(|s| s.usage_score == 0.0));
    }

    #[test]
    fn test_usage_falls_back_to_text() {
        let mut payload = Payload::new();
        payload.insert("text".into(), json!("engine repair manual"));
        let hit = Candidate::new("m1", 0.4, payload);

        let scored = compute_usage(&[hit], "The engine needed repair", &config());
        assert_eq!(scored[0].usage_score, 0.667);
    }

    #[test]
    fn test_usage_empty_inputs() {
        assert!(compute_usage(&[], "apple pie", &config()).is_empty());
        assert!(compute_usage(&[titled("p1", "apple")], "", &config()).is_empty());
        assert!(compute_usage(&[titled("p1", "apple")], "it is what it is", &config()).is_empty());
    }

    #[test]
    fn test_usage_is_deterministic() {
        let hits = vec![titled("a", "salience feedback loop"), titled("b", "vector index")];
        let response = "The feedback loop raises salience for the vector index entries";
        let first = compute_usage(&hits, response, &config());
        let second = compute_usage(&hits, response, &config());
        assert_eq!(first, second);
        assert!(first.iter().all(|s| (0.0..=1.0).contains(&s.usage_score)));
    }
}
