//! Query generation: cached, rule-based fast path, LLM fallback with
//! bounded validate/correct retries.
//!
//! `generate` never fails: exhausted retries and provider outages come back
//! as a `GeneratedQuery` with `validated: false` and the last error. Only
//! validated queries are ever cached, keyed by (question, schema
//! fingerprint).

pub mod executor;
pub mod render;
pub mod validate;

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::cache::ResultCache;
use crate::model::{ExecutionOutcome, GeneratedQuery, QueryKind, QuerySource, SlotSet};
use crate::providers::{CancelToken, GenerationOptions, GenerationProvider, ProviderError};
use crate::schema::SchemaRegistry;
use crate::slots::SlotExtractor;
use executor::{DbError, RelationalExecutor};
use validate::{sanitize_llm_output, validate_sql};

/// Confidence assigned to a validated LLM-generated query.
const LLM_VALIDATED_CONFIDENCE: f32 = 0.8;

/// Confidence assigned to a best-effort result that never validated.
const FAILED_CONFIDENCE: f32 = 0.1;

/// Generator thresholds and limits. Empirically fixed; override rather
/// than re-derive.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Slot confidence strictly above this takes the rule-based fast path.
    pub fast_path_threshold: f32,
    /// Hard cap on LLM calls per `generate`, corrections included.
    pub max_llm_attempts: u32,
    pub cache_ttl: Duration,
    pub generation: GenerationOptions,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            fast_path_threshold: 0.7,
            max_llm_attempts: 3,
            cache_ttl: Duration::from_secs(3600),
            generation: GenerationOptions::default(),
        }
    }
}

/// One few-shot example included in generation prompts.
#[derive(Debug, Clone)]
pub struct FewShotExample {
    pub question: String,
    pub sql: String,
}

/// Few-shot set for the shipped traffic deployment.
pub fn default_examples() -> Vec<FewShotExample> {
    vec![
        FewShotExample {
            question: "how many intersections are in district Riverside".into(),
            sql: "SELECT COUNT(*) FROM intersections WHERE district LIKE '%Riverside%'".into(),
        },
        FewShotExample {
            question: "average daily volume per district".into(),
            sql: "SELECT district, AVG(daily_volume) FROM intersections GROUP BY district".into(),
        },
        FewShotExample {
            question: "total maintenance cost in 2023".into(),
            sql: "SELECT SUM(cost) FROM maintenance_logs WHERE performed_at LIKE '%2023%'".into(),
        },
    ]
}

/// Correction-loop state machine: Generated → Validating → (Accepted |
/// Correcting) → Generated, bounded by `max_llm_attempts`, else Failed.
enum GenState {
    Generate { prompt: String },
    Validate { text: String },
    Correct { failed: String, error: String },
    Accepted(GeneratedQuery),
    Failed { text: String, error: String },
}

pub struct QueryGenerator {
    extractor: SlotExtractor,
    schema: Arc<SchemaRegistry>,
    llm: Arc<dyn GenerationProvider>,
    executor: Arc<dyn RelationalExecutor>,
    cache: Arc<ResultCache<GeneratedQuery>>,
    examples: Vec<FewShotExample>,
    cfg: GeneratorConfig,
}

impl QueryGenerator {
    pub fn new(
        extractor: SlotExtractor,
        schema: Arc<SchemaRegistry>,
        llm: Arc<dyn GenerationProvider>,
        executor: Arc<dyn RelationalExecutor>,
        cache: Arc<ResultCache<GeneratedQuery>>,
        examples: Vec<FewShotExample>,
        cfg: GeneratorConfig,
    ) -> Self {
        Self {
            extractor,
            schema,
            llm,
            executor,
            cache,
            examples,
            cfg,
        }
    }

    pub fn cache_stats(&self) -> crate::cache::CacheStats {
        self.cache.stats()
    }

    /// Produce a query for the question. Never fails; the result may carry
    /// `validated: false` and an error message.
    pub fn generate(&self, question: &str, cancel: &CancelToken) -> GeneratedQuery {
        let fingerprint = self.schema.fingerprint();
        if let Some(cached) = self.cache.get(question, &fingerprint) {
            debug!(question, "query_cache_hit");
            return cached;
        }

        if cancel.is_cancelled() {
            return self.failed_result(String::new(), "cancelled before generation".into());
        }

        let slots = self.extractor.extract(question);

        // Fast path: deterministic rendering from high-confidence slots.
        if slots.confidence > self.cfg.fast_path_threshold {
            let text = render::render_sql(&slots);
            match validate_sql(&text) {
                Ok(()) => {
                    let query = GeneratedQuery {
                        text,
                        kind: slots.query_kind.as_str().into(),
                        confidence: slots.confidence,
                        source: QuerySource::RuleBased,
                        validated: true,
                        error: None,
                    };
                    self.cache
                        .put(question, &fingerprint, query.clone(), Some(self.cfg.cache_ttl));
                    info!(question, sql = %query.text, "fast_path_query");
                    return query;
                }
                Err(err) => {
                    // Shouldn't happen for rendered SQL; fall through to the
                    // LLM with the failure on record.
                    warn!(error = %err, sql = %text, "rendered query failed validation");
                }
            }
        }

        let query = self.generate_via_llm(question, &slots, cancel);
        if query.validated {
            self.cache
                .put(question, &fingerprint, query.clone(), Some(self.cfg.cache_ttl));
        }
        query
    }

    /// Fallback path as an explicit bounded state machine.
    fn generate_via_llm(
        &self,
        question: &str,
        slots: &SlotSet,
        cancel: &CancelToken,
    ) -> GeneratedQuery {
        let base_prompt = self.build_prompt(question);
        let mut llm_calls = 0u32;
        let mut state = GenState::Generate {
            prompt: base_prompt.clone(),
        };

        loop {
            state = match state {
                GenState::Generate { prompt } => {
                    if cancel.is_cancelled() {
                        break self.failed_result(String::new(), "cancelled".into());
                    }
                    llm_calls += 1;
                    match self.llm.generate(&prompt, &self.cfg.generation, cancel) {
                        Ok(raw) => GenState::Validate {
                            text: sanitize_llm_output(&raw),
                        },
                        Err(ProviderError::Cancelled) => {
                            break self.failed_result(String::new(), "cancelled".into());
                        }
                        Err(err) => {
                            // Provider outage: degrade to a best-effort,
                            // unvalidated rendering of whatever the slots say.
                            warn!(error = %err, "generation provider failed");
                            break self.failed_result(render::render_sql(slots), err.to_string());
                        }
                    }
                }
                GenState::Validate { text } => match validate_sql(&text) {
                    Ok(()) => GenState::Accepted(GeneratedQuery {
                        kind: derive_kind(&text, slots.query_kind),
                        confidence: LLM_VALIDATED_CONFIDENCE,
                        source: QuerySource::LlmGenerated,
                        validated: true,
                        error: None,
                        text,
                    }),
                    Err(err) => GenState::Correct {
                        failed: text,
                        error: err.to_string(),
                    },
                },
                GenState::Correct { failed, error } => {
                    if llm_calls >= self.cfg.max_llm_attempts {
                        GenState::Failed {
                            text: failed,
                            error,
                        }
                    } else {
                        debug!(attempt = llm_calls + 1, error = %error, "correction_retry");
                        GenState::Generate {
                            prompt: self.build_correction_prompt(&base_prompt, &failed, &error),
                        }
                    }
                }
                GenState::Accepted(query) => {
                    info!(question, sql = %query.text, "llm_query_accepted");
                    break query;
                }
                GenState::Failed { text, error } => {
                    warn!(question, error = %error, "llm_query_failed_after_retries");
                    break self.failed_result(text, error);
                }
            };
        }
    }

    fn failed_result(&self, text: String, error: String) -> GeneratedQuery {
        GeneratedQuery {
            text,
            kind: "unknown".into(),
            confidence: FAILED_CONFIDENCE,
            source: QuerySource::LlmGenerated,
            validated: false,
            error: Some(error),
        }
    }

    fn build_prompt(&self, question: &str) -> String {
        let mut prompt = String::from(
            "Translate the question into exactly one SQL statement for the schema below. \
             Reply with SQL only.\n\n",
        );
        prompt.push_str(&self.schema.describe());
        if !self.examples.is_empty() {
            prompt.push('\n');
            for example in &self.examples {
                let _ = writeln!(prompt, "Q: {}\nSQL: {}", example.question, example.sql);
            }
        }
        let _ = write!(prompt, "\nQ: {question}\nSQL:");
        prompt
    }

    fn build_correction_prompt(&self, base: &str, failed: &str, error: &str) -> String {
        format!(
            "{base}\n\nYour previous attempt was rejected.\nAttempt: {failed}\nProblem: {error}\n\
             Reply with a corrected SQL statement only."
        )
    }

    /// Execute a generated query. `DbError` passes through untouched.
    pub fn execute(&self, query: &GeneratedQuery) -> Result<ExecutionOutcome, DbError> {
        self.executor.execute(query)
    }

    /// Generate queries for independent questions on the rayon pool.
    /// Results keep the input order.
    pub fn generate_batch(&self, questions: &[String], cancel: &CancelToken) -> Vec<GeneratedQuery> {
        questions
            .par_iter()
            .map(|q| self.generate(q, cancel))
            .collect()
    }
}

fn derive_kind(text: &str, extracted: QueryKind) -> String {
    let first = text
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_uppercase();
    match first.as_str() {
        "SELECT" | "WITH" => extracted.as_str().to_string(),
        other => other.to_lowercase(),
    }
}
