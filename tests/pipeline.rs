//! End-to-end pipeline scenarios: routing, fast-path SQL, degraded modes.

use std::sync::Arc;
use std::time::Duration;

use crossway::cache::ResultCache;
use crossway::model::{ExecutionOutcome, QuerySource, Route};
use crossway::pipeline::{AnswerOutcome, Pipeline};
use crossway::providers::{
    CancelToken, EmbeddingProvider, NullProvider, ProviderError,
};
use crossway::retrieval::{default_important_terms, HybridRetriever, RetrieverConfig};
use crossway::router::{default_reference_bank, Router, RouterConfig};
use crossway::schema::SchemaRegistry;
use crossway::slots::patterns::EnglishCues;
use crossway::slots::SlotExtractor;
use crossway::sqlgen::executor::SqliteExecutor;
use crossway::sqlgen::{default_examples, GeneratorConfig, QueryGenerator};

/// Deterministic test embedder: projects text onto fixed keyword axes so
/// reference-bank similarities are predictable.
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
        let axis = |words: &[&str]| words.iter().filter(|w| t.contains(*w)).count() as f32;
        Ok(vec![
            axis(&["hello", "hi ", "morning", "thanks"]),
            axis(&["how many", "average", "total", "list", "top", "district"]),
            axis(&["why", "explain", "manual", "policy", "work"]),
            0.1,
        ])
    }

    fn dimension(&self) -> Option<usize> {
        Some(4)
    }
}

fn seeded_db(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("records.db");
    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE intersections (
             name TEXT, district TEXT, approach_count INTEGER,
             daily_volume INTEGER, installed_at TEXT
         );
         INSERT INTO intersections VALUES
             ('5th & Main', 'Riverside', 4, 18400, '2014-06-02'),
             ('Pine & 2nd', 'Riverside', 4, 9100, '2021-01-15'),
             ('Oak & Hill', 'Northgate', 3, 4200, '2009-11-20');",
    )
    .unwrap();
    path
}

fn doc_chunks() -> Vec<crossway::model::DocumentChunk> {
    let chunk = |id: &str, content: &str, embedding: Vec<f32>| crossway::model::DocumentChunk {
        id: id.into(),
        content: content.into(),
        embedding,
        metadata: Default::default(),
    };
    vec![
        chunk(
            "retiming-1",
            "the signal retiming policy requires corridor studies every five years",
            vec![0.0, 0.1, 1.0, 0.1],
        ),
        chunk(
            "flash-1",
            "signals flash yellow at night to reduce unnecessary stops",
            vec![0.1, 0.0, 0.9, 0.1],
        ),
    ]
}

fn pipeline(
    dir: &std::path::Path,
    embedder: Arc<dyn EmbeddingProvider>,
) -> Pipeline {
    let schema = Arc::new(SchemaRegistry::default_traffic());
    let cues = Arc::new(EnglishCues);
    let router = Router::new(
        Arc::clone(&embedder),
        cues.clone(),
        default_reference_bank(),
        RouterConfig::default(),
    );
    let generator = QueryGenerator::new(
        SlotExtractor::new(Arc::clone(&schema), cues),
        schema,
        Arc::new(NullProvider),
        Arc::new(SqliteExecutor::new(seeded_db(dir))),
        Arc::new(ResultCache::default()),
        default_examples(),
        GeneratorConfig::default(),
    );
    let retriever = HybridRetriever::from_chunks(
        doc_chunks(),
        embedder,
        default_important_terms(),
        RetrieverConfig::default(),
    )
    .unwrap();
    Pipeline::new(router, generator, retriever, 5)
}

#[test]
fn count_question_runs_fast_path_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let p = pipeline(dir.path(), Arc::new(AxisEmbedder));

    let outcome = p.answer(
        "how many intersections are in district Riverside",
        &CancelToken::new(),
    );
    let AnswerOutcome::Structured {
        decision,
        query,
        execution,
    } = outcome
    else {
        panic!("expected structured outcome");
    };

    assert_eq!(decision.route, Route::StructuredQuery);
    assert_eq!(query.source, QuerySource::RuleBased);
    assert!(query.validated);
    assert_eq!(
        query.text,
        "SELECT COUNT(*) FROM intersections WHERE district LIKE '%Riverside%'"
    );

    let ExecutionOutcome::Rows { rows, .. } = execution.unwrap().unwrap() else {
        panic!("expected rows");
    };
    assert_eq!(rows[0][0], serde_json::json!(2));
}

#[test]
fn greeting_survives_total_provider_outage() {
    let dir = tempfile::tempdir().unwrap();
    let p = pipeline(dir.path(), Arc::new(NullProvider));

    let outcome = p.answer("hello", &CancelToken::new());
    let AnswerOutcome::Greeting { decision, reply } = outcome else {
        panic!("expected greeting");
    };
    assert_eq!(decision.route, Route::Greeting);
    assert!(decision.confidence >= 0.5);
    assert!(!reply.is_empty());
}

#[test]
fn document_question_retrieves_relevant_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let p = pipeline(dir.path(), Arc::new(AxisEmbedder));

    let outcome = p.answer("explain the signal retiming policy", &CancelToken::new());
    let AnswerOutcome::Documents { decision, results } = outcome else {
        panic!("expected documents outcome");
    };
    assert_eq!(decision.route, Route::DocumentSearch);
    assert!(!results.is_empty());
    assert!(results.len() <= 5);
    assert_eq!(results[0].chunk.id, "retiming-1");
}

#[test]
fn gibberish_maps_to_unclear_not_a_crash() {
    let dir = tempfile::tempdir().unwrap();
    let p = pipeline(dir.path(), Arc::new(AxisEmbedder));

    let outcome = p.answer("zzz qqq blorp", &CancelToken::new());
    let AnswerOutcome::Unclear { decision } = outcome else {
        panic!("expected unclear outcome");
    };
    assert_eq!(decision.route, Route::Unknown);
    assert!((0.0..=1.0).contains(&decision.confidence));
}

#[test]
fn batch_generation_matches_sequential_runs() {
    let dir = tempfile::tempdir().unwrap();
    let p = pipeline(dir.path(), Arc::new(AxisEmbedder));

    let questions: Vec<String> = vec![
        "how many intersections are in district Riverside".into(),
        "how many intersections are in district Northgate".into(),
        "average daily volume per district".into(),
    ];
    let batch = p.generate_batch(&questions, &CancelToken::new());
    assert_eq!(batch.len(), questions.len());

    for (question, from_batch) in questions.iter().zip(&batch) {
        let sequential = p.generator().generate(question, &CancelToken::new());
        assert_eq!(from_batch.text, sequential.text);
        assert_eq!(from_batch.validated, sequential.validated);
    }
}

#[test]
fn generate_is_idempotent_through_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let p = pipeline(dir.path(), Arc::new(AxisEmbedder));

    let q = "how many intersections are in district Riverside";
    let first = p.generator().generate(q, &CancelToken::new());
    let before = p.generator().cache_stats();
    let second = p.generator().generate(q, &CancelToken::new());
    let after = p.generator().cache_stats();

    assert_eq!(first.text, second.text);
    assert_eq!(after.hits, before.hits + 1);
}
