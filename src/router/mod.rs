//! Route classification: greeting vs structured query vs document search.
//!
//! The primary path embeds the question and compares it against a bank of
//! reference examples per route (max cosine similarity). When the embedding
//! provider is unavailable, times out, is cancelled, or the bank failed to
//! embed at startup, routing degrades to a deterministic keyword-count
//! heuristic over the cue tables. Neither path can fail: on total ambiguity
//! the router defaults to document search.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::model::{Route, RouteDecision};
use crate::providers::{CancelToken, EmbeddingProvider};
use crate::retrieval::index::{dot, l2_normalize};
use crate::slots::patterns::CueMatcher;

/// Router thresholds. Values are empirically fixed; override rather than
/// re-derive.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Best similarity below this returns `Unknown`.
    pub min_confidence: f32,
    /// Greeting wins outright above this (and above both other scores).
    pub greeting_threshold: f32,
    /// Structured query must beat document search and this floor.
    pub structured_threshold: f32,
    /// Document search floor before the ambiguous default kicks in.
    pub document_threshold: f32,
    pub embed_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.3,
            greeting_threshold: 0.5,
            structured_threshold: 0.4,
            document_threshold: 0.4,
            embed_timeout: crate::providers::DEFAULT_EMBED_TIMEOUT,
        }
    }
}

/// One reference example: a phrase known to belong to a route.
#[derive(Debug, Clone)]
pub struct ReferenceExample {
    pub route: Route,
    pub text: String,
}

/// Reference bank for the shipped deployment.
pub fn default_reference_bank() -> Vec<ReferenceExample> {
    let mk = |route, text: &str| ReferenceExample {
        route,
        text: text.to_string(),
    };
    vec![
        mk(Route::Greeting, "hello"),
        mk(Route::Greeting, "hi there"),
        mk(Route::Greeting, "good morning"),
        mk(Route::Greeting, "thanks, that is all"),
        mk(Route::StructuredQuery, "how many intersections are in district 4"),
        mk(Route::StructuredQuery, "average daily volume per district"),
        mk(Route::StructuredQuery, "total maintenance cost in 2023"),
        mk(Route::StructuredQuery, "list intersections with more than 4 approaches"),
        mk(Route::StructuredQuery, "top 5 busiest intersections"),
        mk(Route::DocumentSearch, "why do signals flash yellow at night"),
        mk(Route::DocumentSearch, "explain the signal retiming policy"),
        mk(Route::DocumentSearch, "what does the maintenance manual say about LED heads"),
        mk(Route::DocumentSearch, "how do protected left turns work"),
    ]
}

struct RouteReference {
    route: Route,
    embedding: Vec<f32>,
}

pub struct Router {
    embedder: Arc<dyn EmbeddingProvider>,
    cues: Arc<dyn CueMatcher>,
    references: Vec<RouteReference>,
    cfg: RouterConfig,
}

impl Router {
    /// Build the router, embedding the reference bank once. When the
    /// provider cannot embed the bank the router still works, permanently
    /// on the keyword fallback.
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        cues: Arc<dyn CueMatcher>,
        bank: Vec<ReferenceExample>,
        cfg: RouterConfig,
    ) -> Self {
        let cancel = CancelToken::new();
        let mut references = Vec::with_capacity(bank.len());
        for example in &bank {
            match embedder.embed(&example.text, cfg.embed_timeout, &cancel) {
                Ok(mut embedding) => {
                    l2_normalize(&mut embedding);
                    references.push(RouteReference {
                        route: example.route,
                        embedding,
                    });
                }
                Err(err) => {
                    warn!(error = %err, "reference bank embedding failed; router will use keyword fallback");
                    references.clear();
                    break;
                }
            }
        }
        Self {
            embedder,
            cues,
            references,
            cfg,
        }
    }

    /// Classify one question. Pure; never fails.
    pub fn route(&self, question: &str, cancel: &CancelToken) -> RouteDecision {
        if self.references.is_empty() {
            return self.route_by_keywords(question, "no reference embeddings loaded");
        }
        if cancel.is_cancelled() {
            return self.route_by_keywords(question, "cancelled before embedding");
        }

        let mut query = match self
            .embedder
            .embed(question, self.cfg.embed_timeout, cancel)
        {
            Ok(v) => v,
            Err(err) => {
                debug!(error = %err, "question embedding failed; using keyword fallback");
                return self.route_by_keywords(question, &format!("embedding failed: {err}"));
            }
        };
        l2_normalize(&mut query);

        // Max cosine similarity per route.
        let mut scores: BTreeMap<Route, f32> = BTreeMap::new();
        for reference in &self.references {
            if reference.embedding.len() != query.len() {
                return self.route_by_keywords(question, "reference dimension mismatch");
            }
            let sim = dot(&reference.embedding, &query);
            let entry = scores.entry(reference.route).or_insert(f32::MIN);
            if sim > *entry {
                *entry = sim;
            }
        }

        self.decide(scores)
    }

    fn decide(&self, scores: BTreeMap<Route, f32>) -> RouteDecision {
        let get = |route: Route| scores.get(&route).copied().unwrap_or(0.0);
        let greeting = get(Route::Greeting);
        let structured = get(Route::StructuredQuery);
        let document = get(Route::DocumentSearch);
        let best = greeting.max(structured).max(document);

        if best < self.cfg.min_confidence {
            return RouteDecision::new(
                Route::Unknown,
                best.max(0.0),
                format!("best similarity {best:.2} below minimum {:.2}", self.cfg.min_confidence),
                scores,
            );
        }

        if greeting > self.cfg.greeting_threshold
            && greeting > structured
            && greeting > document
        {
            return RouteDecision::new(
                Route::Greeting,
                greeting,
                format!("greeting similarity {greeting:.2} dominates"),
                scores,
            );
        }

        if structured > document && structured > self.cfg.structured_threshold {
            RouteDecision::new(
                Route::StructuredQuery,
                structured,
                format!("structured similarity {structured:.2} beats document {document:.2}"),
                scores,
            )
        } else if document > self.cfg.document_threshold {
            RouteDecision::new(
                Route::DocumentSearch,
                document,
                format!("document similarity {document:.2} above threshold"),
                scores,
            )
        } else {
            // Ambiguous: never an error, document search wins with the
            // weaker of the two scores.
            RouteDecision::new(
                Route::DocumentSearch,
                structured.min(document),
                "ambiguous scores; defaulting to document search".to_string(),
                scores,
            )
        }
    }

    /// Deterministic keyword-count fallback. Must never fail.
    fn route_by_keywords(&self, question: &str, cause: &str) -> RouteDecision {
        let cues = self.cues.route_cues(question);
        let mut scores = BTreeMap::new();
        scores.insert(Route::Greeting, cues.greeting as f32);
        scores.insert(Route::StructuredQuery, cues.structured as f32);
        scores.insert(Route::DocumentSearch, cues.document as f32);

        let confidence = |hits: u32| (0.5 + 0.1 * hits as f32).min(0.95);

        if cues.greeting > cues.structured && cues.greeting > cues.document {
            RouteDecision::new(
                Route::Greeting,
                confidence(cues.greeting),
                format!("keyword fallback ({cause}): greeting cues dominate"),
                scores,
            )
        } else if cues.structured > cues.document {
            RouteDecision::new(
                Route::StructuredQuery,
                confidence(cues.structured),
                format!("keyword fallback ({cause}): structured cues dominate"),
                scores,
            )
        } else if cues.document > cues.structured {
            RouteDecision::new(
                Route::DocumentSearch,
                confidence(cues.document),
                format!("keyword fallback ({cause}): document cues dominate"),
                scores,
            )
        } else {
            RouteDecision::new(
                Route::DocumentSearch,
                0.5,
                format!("keyword fallback ({cause}): ambiguous, defaulting to document search"),
                scores,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{NullProvider, ProviderError};
    use crate::slots::patterns::EnglishCues;

    /// Embeds onto a fixed 3-axis space by keyword, so cosine scores are
    /// predictable in tests.
    struct AxisEmbedder;

    impl EmbeddingProvider for AxisEmbedder {
        fn embed(
            &self,
            text: &str,
            _timeout: Duration,
            cancel: &CancelToken,
        ) -> Result<Vec<f32>, ProviderError> {
            cancel.check()?;
            let t = text.to_lowercase();
            let greeting = ["hello", "hi", "morning", "thanks"]
                .iter()
                .filter(|w| t.contains(*w))
                .count() as f32;
            let structured = ["how many", "average", "total", "list", "top", "district"]
                .iter()
                .filter(|w| t.contains(*w))
                .count() as f32;
            let document = ["why", "explain", "manual", "policy", "work"]
                .iter()
                .filter(|w| t.contains(*w))
                .count() as f32;
            Ok(vec![greeting, structured, document, 0.1])
        }

        fn dimension(&self) -> Option<usize> {
            Some(4)
        }
    }

    fn embedded_router() -> Router {
        Router::new(
            Arc::new(AxisEmbedder),
            Arc::new(EnglishCues),
            default_reference_bank(),
            RouterConfig::default(),
        )
    }

    #[test]
    fn embedding_path_routes_structured_questions() {
        let decision = embedded_router().route(
            "how many intersections are in district 4",
            &CancelToken::new(),
        );
        assert_eq!(decision.route, Route::StructuredQuery);
        assert!(decision.confidence > 0.4);
        assert!(!decision.reasoning.is_empty());
    }

    #[test]
    fn embedding_path_routes_greetings() {
        let decision = embedded_router().route("hello", &CancelToken::new());
        assert_eq!(decision.route, Route::Greeting);
        assert!(decision.confidence > 0.5);
    }

    #[test]
    fn gibberish_is_unknown() {
        let decision = embedded_router().route("zzz qqq", &CancelToken::new());
        assert_eq!(decision.route, Route::Unknown);
    }

    #[test]
    fn provider_failure_degrades_to_keyword_fallback() {
        let router = Router::new(
            Arc::new(NullProvider),
            Arc::new(EnglishCues),
            default_reference_bank(),
            RouterConfig::default(),
        );
        let decision = router.route("hello", &CancelToken::new());
        assert_eq!(decision.route, Route::Greeting);
        assert!(decision.confidence >= 0.5);
        assert!(decision.reasoning.contains("keyword fallback"));
    }

    #[test]
    fn fallback_defaults_to_document_search_on_ambiguity() {
        let router = Router::new(
            Arc::new(NullProvider),
            Arc::new(EnglishCues),
            Vec::new(),
            RouterConfig::default(),
        );
        let decision = router.route("pelican brick", &CancelToken::new());
        assert_eq!(decision.route, Route::DocumentSearch);
        assert!((decision.confidence - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn cancellation_short_circuits_to_fallback() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let decision = embedded_router().route("how many intersections per district", &cancel);
        // Still a usable decision, produced without touching the provider.
        assert_eq!(decision.route, Route::StructuredQuery);
        assert!(decision.reasoning.contains("cancelled"));
    }

    #[test]
    fn confidence_always_in_unit_interval() {
        let router = embedded_router();
        for q in ["hello", "how many", "why", "", "district district district"] {
            let d = router.route(q, &CancelToken::new());
            assert!((0.0..=1.0).contains(&d.confidence));
        }
    }
}
