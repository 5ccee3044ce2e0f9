//! Pluggable cue-matcher interface and the English pattern tables.
//!
//! All locale-specific regex/keyword banks used for intent and slot cues
//! sit behind [`CueMatcher`]; the extractor and the router fallback only
//! ever see this trait. Another locale supplies its own tables by
//! implementing it.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::{CompareOp, QueryKind};

/// Cue hit counts for the router's rule-based fallback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteCues {
    pub greeting: u32,
    pub structured: u32,
    pub document: u32,
}

/// Locale-specific intent and slot cue matching.
pub trait CueMatcher: Send + Sync {
    /// Word-boundary-aware alias hit, with a fuzzy fallback for single-word
    /// aliases. An exact hit is never overridden by the fuzzy path.
    fn match_alias(&self, text: &str, alias: &str) -> bool;

    /// Ordered aggregation families; first matching family wins, `None`
    /// means plain Select.
    fn query_kind(&self, text: &str) -> Option<QueryKind>;

    /// Keyword-family hit counts used when embeddings are unavailable.
    fn route_cues(&self, text: &str) -> RouteCues;

    /// Numeric comparisons anchored to `alias` ("X with more than 5
    /// approaches", "over 5000 vehicles per day").
    fn numeric_comparisons(&self, text: &str, alias: &str) -> Vec<(CompareOp, i64)>;

    /// Year mentions ("in 2019", "since 2021").
    fn years(&self, text: &str) -> Vec<String>;

    /// Location expressions ("in district X", "in the Riverside district").
    fn locations(&self, text: &str) -> Vec<String>;

    /// Grouping cue token ("per district" → "district").
    fn group_cue(&self, text: &str) -> Option<String>;

    /// Ordering cue token ("sorted by volume" → "volume").
    fn order_cue(&self, text: &str) -> Option<String>;

    /// Result-count cue ("top 5" → 5).
    fn limit_cue(&self, text: &str) -> Option<u32>;
}

/// Jaro-Winkler threshold for the fuzzy alias fallback.
const FUZZY_ALIAS_THRESHOLD: f64 = 0.92;

/// Minimum word length eligible for fuzzy matching; short words produce too
/// many accidental near-matches.
const FUZZY_MIN_LEN: usize = 5;

static COUNT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(how many|count|number of)\b").unwrap());
static SUM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(total|sum of|combined|altogether)\b").unwrap());
static AVG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(average|mean|typical)\b").unwrap());
static MAX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(highest|most|maximum|busiest|largest)\b").unwrap());
static MIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(lowest|least|minimum|quietest|smallest)\b").unwrap());

static GREETING_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(hello|hi|hey|howdy|greetings|good (morning|afternoon|evening)|thanks|thank you|goodbye|bye)\b")
        .unwrap()
});
static STRUCTURED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(how many|count|number of|average|total|sum|list|show me|top \d+|per \w+|more than|fewer than|less than|over \d+|under \d+)\b")
        .unwrap()
});
static DOCUMENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(why|how do(es)?|what is|what are|explain|describe|policy|policies|manual|report|guideline|guidelines|procedure|standard|documentation|spec)\b")
        .unwrap()
});

static GT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(more than|greater than|over|above|exceeding)\s+([\d,]+)").unwrap());
static LT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(less than|fewer than|under|below)\s+([\d,]+)").unwrap());
static EQ_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(exactly|equal to|equals)\s+([\d,]+)").unwrap());

static YEAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:in|since|from|during|before|after)\s+((?:19|20)\d{2})\b").unwrap());

static LOCATION_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        // "in district X", "in district 12"
        Regex::new(r"(?i)\bin\s+district\s+([\w-]+)").unwrap(),
        // "in the Riverside district", "in Northgate district"
        Regex::new(r"(?i)\bin\s+(?:the\s+)?([A-Za-z][\w-]*(?:\s+[A-Za-z][\w-]*)?)\s+district\b").unwrap(),
        // "district of Riverside"
        Regex::new(r"(?i)\bdistrict\s+of\s+([\w-]+)").unwrap(),
    ]
});

static GROUP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:per|for each|grouped by|broken down by)\s+([a-z][\w]*)").unwrap()
});
static ORDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:sorted by|ordered by|order by|ranked by)\s+([a-z][\w ]*?)(?:\s+(?:descending|ascending)|[.?!,]|$)")
        .unwrap()
});
static LIMIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:top|first|best)\s+(\d{1,4})\b").unwrap());

fn count_matches(re: &Regex, text: &str) -> u32 {
    re.find_iter(text).count() as u32
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(text: &str, mut index: usize) -> usize {
    while index < text.len() && !text.is_char_boundary(index) {
        index += 1;
    }
    index
}

fn parse_number(raw: &str) -> Option<i64> {
    raw.replace(',', "").parse().ok()
}

/// English cue tables.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnglishCues;

impl EnglishCues {
    fn alias_exact(text: &str, alias: &str) -> bool {
        // Substring with word-boundary characters on both sides; aliases may
        // be multi-word.
        let text = text.to_lowercase();
        let alias = alias.to_lowercase();
        let mut start = 0;
        while let Some(pos) = text[start..].find(&alias) {
            let begin = start + pos;
            let end = begin + alias.len();
            let left_ok = begin == 0
                || !text.as_bytes()[begin - 1].is_ascii_alphanumeric();
            let right_ok =
                end == text.len() || !text.as_bytes()[end].is_ascii_alphanumeric();
            if left_ok && right_ok {
                return true;
            }
            start = end;
        }
        false
    }

    fn alias_fuzzy(text: &str, alias: &str) -> bool {
        // Single-word aliases only; misspellings like "intersektions".
        if alias.contains(' ') || alias.len() < FUZZY_MIN_LEN {
            return false;
        }
        let alias = alias.to_lowercase();
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.len() >= FUZZY_MIN_LEN)
            // Length guard: the Winkler prefix boost otherwise lets a long
            // word swallow a short alias ("districtwide" vs "district").
            .filter(|w| w.len().abs_diff(alias.len()) <= 2)
            .any(|word| strsim::jaro_winkler(word, &alias) >= FUZZY_ALIAS_THRESHOLD)
    }
}

impl CueMatcher for EnglishCues {
    fn match_alias(&self, text: &str, alias: &str) -> bool {
        Self::alias_exact(text, alias) || Self::alias_fuzzy(text, alias)
    }

    fn query_kind(&self, text: &str) -> Option<QueryKind> {
        // Family order matters: "how many" beats "most" in
        // "how many of the most ...".
        if COUNT_RE.is_match(text) {
            Some(QueryKind::Count)
        } else if SUM_RE.is_match(text) {
            Some(QueryKind::Sum)
        } else if AVG_RE.is_match(text) {
            Some(QueryKind::Avg)
        } else if MAX_RE.is_match(text) {
            Some(QueryKind::Max)
        } else if MIN_RE.is_match(text) {
            Some(QueryKind::Min)
        } else {
            None
        }
    }

    fn route_cues(&self, text: &str) -> RouteCues {
        RouteCues {
            greeting: count_matches(&GREETING_RE, text),
            structured: count_matches(&STRUCTURED_RE, text),
            document: count_matches(&DOCUMENT_RE, text),
        }
    }

    fn numeric_comparisons(&self, text: &str, alias: &str) -> Vec<(CompareOp, i64)> {
        let mut found = Vec::new();
        let lowered = text.to_lowercase();
        let alias = alias.to_lowercase();

        for (re, op) in [
            (&*GT_RE, CompareOp::Gt),
            (&*LT_RE, CompareOp::Lt),
            (&*EQ_RE, CompareOp::Eq),
        ] {
            for caps in re.captures_iter(&lowered) {
                let Some(value) = caps.get(2).and_then(|m| parse_number(m.as_str())) else {
                    continue;
                };
                let full = caps.get(0).expect("whole match");
                // The alias must sit near the comparison, on either side:
                // "approaches ... more than 4" or "more than 5000 vehicles".
                let lo = floor_char_boundary(&lowered, full.start().saturating_sub(48));
                let hi = ceil_char_boundary(&lowered, (full.end() + 48).min(lowered.len()));
                let before = &lowered[lo..full.start()];
                let after = &lowered[full.end()..hi];
                if Self::alias_exact(before, &alias) || Self::alias_exact(after, &alias) {
                    found.push((op, value));
                }
            }
        }
        found
    }

    fn years(&self, text: &str) -> Vec<String> {
        YEAR_RE
            .captures_iter(text)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .collect()
    }

    fn locations(&self, text: &str) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for re in LOCATION_RES.iter() {
            for caps in re.captures_iter(text) {
                if let Some(m) = caps.get(1) {
                    let value = m.as_str().trim().to_string();
                    if !value.is_empty() && !out.iter().any(|v| v.eq_ignore_ascii_case(&value)) {
                        out.push(value);
                    }
                }
            }
        }
        out
    }

    fn group_cue(&self, text: &str) -> Option<String> {
        GROUP_RE
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_lowercase())
    }

    fn order_cue(&self, text: &str) -> Option<String> {
        ORDER_RE
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_lowercase())
    }

    fn limit_cue(&self, text: &str) -> Option<u32> {
        LIMIT_RE
            .captures(text)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_family_wins_over_max() {
        let cues = EnglishCues;
        assert_eq!(
            cues.query_kind("how many of the busiest intersections"),
            Some(QueryKind::Count)
        );
        assert_eq!(cues.query_kind("busiest intersection"), Some(QueryKind::Max));
        assert_eq!(cues.query_kind("list intersections"), None);
    }

    #[test]
    fn alias_matching_respects_word_boundaries() {
        let cues = EnglishCues;
        assert!(cues.match_alias("show the district totals", "district"));
        assert!(!cues.match_alias("districtwide numbers", "district"));
        assert!(cues.match_alias("per signal type breakdown", "signal type"));
    }

    #[test]
    fn fuzzy_alias_catches_typos_but_not_short_words() {
        let cues = EnglishCues;
        assert!(cues.match_alias("how many intersektions", "intersections"));
        assert!(!cues.match_alias("cot in the corner", "cost"));
    }

    #[test]
    fn numeric_comparison_requires_nearby_alias() {
        let cues = EnglishCues;
        let hits = cues.numeric_comparisons("intersections with more than 4 approaches", "approaches");
        assert_eq!(hits, vec![(CompareOp::Gt, 4)]);
        // Alias nowhere near the number.
        let hits = cues.numeric_comparisons("more than 4 signals in the busy district named approaches-not-here", "volume");
        assert!(hits.is_empty());
    }

    #[test]
    fn location_extraction_handles_both_shapes() {
        let cues = EnglishCues;
        assert_eq!(cues.locations("how many are in district 12"), vec!["12"]);
        assert_eq!(
            cues.locations("signals in the Riverside district"),
            vec!["Riverside"]
        );
    }

    #[test]
    fn grouping_ordering_limit_cues() {
        let cues = EnglishCues;
        assert_eq!(cues.group_cue("volume per district"), Some("district".into()));
        assert_eq!(
            cues.order_cue("list intersections sorted by daily volume"),
            Some("daily volume".into())
        );
        assert_eq!(cues.limit_cue("top 5 intersections"), Some(5));
    }

    #[test]
    fn route_cue_counts() {
        let cues = EnglishCues;
        let greeting = cues.route_cues("hello there, good morning");
        assert!(greeting.greeting >= 2);
        let structured = cues.route_cues("how many signals per district");
        assert!(structured.structured >= 2);
        let doc = cues.route_cues("explain the signal retiming policy");
        assert!(doc.document >= 2);
    }

    #[test]
    fn years_extracted_with_prepositions_only() {
        let cues = EnglishCues;
        assert_eq!(cues.years("installed since 2019"), vec!["2019"]);
        assert!(cues.years("route 2019 bus").is_empty());
    }
}
