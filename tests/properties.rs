//! Property tests for the pipeline's hard invariants.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use crossway::cache::ResultCache;
use crossway::providers::{CancelToken, NullProvider};
use crossway::retrieval::keyword::{jaccard_similarity, keyword_score};
use crossway::router::{default_reference_bank, Router, RouterConfig};
use crossway::schema::SchemaRegistry;
use crossway::slots::patterns::EnglishCues;
use crossway::slots::SlotExtractor;

fn extractor() -> SlotExtractor {
    SlotExtractor::new(
        Arc::new(SchemaRegistry::default_traffic()),
        Arc::new(EnglishCues),
    )
}

fn fallback_router() -> Router {
    Router::new(
        Arc::new(NullProvider),
        Arc::new(EnglishCues),
        default_reference_bank(),
        RouterConfig::default(),
    )
}

proptest! {
    #[test]
    fn route_confidence_is_always_in_unit_interval(question in ".{0,120}") {
        let decision = fallback_router().route(&question, &CancelToken::new());
        prop_assert!((0.0..=1.0).contains(&decision.confidence));
        prop_assert!(!decision.reasoning.is_empty());
    }

    #[test]
    fn extraction_confidence_is_always_in_unit_interval(question in ".{0,120}") {
        let slots = extractor().extract(&question);
        prop_assert!((0.0..=1.0).contains(&slots.confidence));
        prop_assert!(!slots.columns.is_empty());
    }

    #[test]
    fn jaccard_is_symmetric_and_bounded(a in "[a-z ]{0,60}", b in "[a-z ]{0,60}") {
        let ab = jaccard_similarity(&a, &b);
        let ba = jaccard_similarity(&b, &a);
        prop_assert!((0.0..=1.0).contains(&ab));
        prop_assert!((ab - ba).abs() < 1e-6);
    }

    #[test]
    fn keyword_score_is_bounded(content in "[a-z ]{0,120}") {
        let terms: Vec<String> = vec!["signal".into(), "district".into(), "corridor".into()];
        let score = keyword_score(&content, &terms);
        prop_assert!((0.0..=1.0).contains(&score));
    }

    #[test]
    fn cache_never_exceeds_capacity(keys in proptest::collection::vec("[a-z]{1,8}", 1..60)) {
        let cache: ResultCache<u32> = ResultCache::new(10, Duration::from_secs(60));
        for (i, key) in keys.iter().enumerate() {
            cache.put(key, "ctx", i as u32, None);
            prop_assert!(cache.len() <= 10);
        }
    }
}
