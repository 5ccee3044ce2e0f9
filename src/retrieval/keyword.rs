//! Keyword-density scoring and near-duplicate detection.

use std::collections::HashSet;

/// Score contribution for each matched important term.
const PER_TERM_HIT: f32 = 0.1;

/// Keyword-density score for a chunk against the important-terms list.
///
/// Each matched term is worth [`PER_TERM_HIT`]; total occurrences relative
/// to chunk length add a density bonus. Capped at 1.0.
pub fn keyword_score(content: &str, terms: &[String]) -> f32 {
    if content.is_empty() || terms.is_empty() {
        return 0.0;
    }
    let lowered = content.to_lowercase();
    let word_count = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .count();
    if word_count == 0 {
        return 0.0;
    }

    let mut matched_terms = 0usize;
    let mut occurrences = 0usize;
    for term in terms {
        let n = count_occurrences(&lowered, &term.to_lowercase());
        if n > 0 {
            matched_terms += 1;
            occurrences += n;
        }
    }

    let density = occurrences as f32 / word_count as f32;
    (PER_TERM_HIT * matched_terms as f32 + density).min(1.0)
}

/// Boundary-aware occurrence count of `term` (may be multi-word) in
/// lowercase `text`.
fn count_occurrences(text: &str, term: &str) -> usize {
    if term.is_empty() {
        return 0;
    }
    let mut count = 0;
    let mut start = 0;
    while let Some(pos) = text[start..].find(term) {
        let begin = start + pos;
        let end = begin + term.len();
        let left_ok = begin == 0 || !text.as_bytes()[begin - 1].is_ascii_alphanumeric();
        let right_ok = end == text.len() || !text.as_bytes()[end].is_ascii_alphanumeric();
        if left_ok && right_ok {
            count += 1;
        }
        start = end;
    }
    count
}

/// Word-set Jaccard similarity between two chunk contents.
pub fn jaccard_similarity(a: &str, b: &str) -> f32 {
    let set_a = word_set(a);
    let set_b = word_set(b);
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.len() + set_b.len() - intersection;
    intersection as f32 / union as f32
}

fn word_set(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// Min-max normalize scores to [0, 1]; a constant list maps to all-ones.
pub fn normalize_scores(scores: &[f32]) -> Vec<f32> {
    if scores.is_empty() {
        return Vec::new();
    }
    let min = scores.iter().copied().fold(f32::INFINITY, f32::min);
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;
    if range.abs() < f32::EPSILON {
        return vec![1.0; scores.len()];
    }
    scores.iter().map(|&s| (s - min) / range).collect()
}
