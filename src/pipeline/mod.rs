//! The request pipeline as one explicitly constructed service object.
//!
//! `Pipeline` owns the router, generator and retriever (which own their
//! caches and read-only state); it is built once at startup and passed by
//! reference into request handlers. There are no ambient globals. `answer`
//! never fails: every path produces a usable [`AnswerOutcome`], down to a
//! low-confidence `Unclear`.

use tracing::{info, warn};

use crate::model::{ExecutionOutcome, GeneratedQuery, RetrievalResult, Route, RouteDecision};
use crate::providers::CancelToken;
use crate::retrieval::{HybridRetriever, SearchInput};
use crate::router::Router;
use crate::sqlgen::executor::DbError;
use crate::sqlgen::QueryGenerator;

/// Canned reply for the greeting route.
pub const GREETING_REPLY: &str =
    "Hello! Ask me about intersections and maintenance records, or search the documentation.";

/// The boundary result object. The presentation layer maps each variant to
/// a user-facing message exactly once.
#[derive(Debug)]
pub enum AnswerOutcome {
    Greeting {
        decision: RouteDecision,
        reply: &'static str,
    },
    Structured {
        decision: RouteDecision,
        query: GeneratedQuery,
        /// `None` when the query never validated; execution is skipped, not
        /// attempted and failed.
        execution: Option<Result<ExecutionOutcome, DbError>>,
    },
    Documents {
        decision: RouteDecision,
        results: Vec<RetrievalResult>,
    },
    Unclear {
        decision: RouteDecision,
    },
}

pub struct Pipeline {
    router: Router,
    generator: QueryGenerator,
    retriever: HybridRetriever,
    top_k: usize,
}

impl Pipeline {
    pub fn new(
        router: Router,
        generator: QueryGenerator,
        retriever: HybridRetriever,
        top_k: usize,
    ) -> Self {
        Self {
            router,
            generator,
            retriever,
            top_k: top_k.max(1),
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn generator(&self) -> &QueryGenerator {
        &self.generator
    }

    pub fn retriever(&self) -> &HybridRetriever {
        &self.retriever
    }

    /// Answer one question end to end.
    pub fn answer(&self, question: &str, cancel: &CancelToken) -> AnswerOutcome {
        let decision = self.router.route(question, cancel);
        info!(
            route = decision.route.as_str(),
            confidence = decision.confidence,
            reasoning = %decision.reasoning,
            "routed"
        );

        match decision.route {
            Route::Greeting => AnswerOutcome::Greeting {
                decision,
                reply: GREETING_REPLY,
            },
            Route::StructuredQuery => {
                let query = self.generator.generate(question, cancel);
                let execution = if query.validated {
                    Some(self.generator.execute(&query))
                } else {
                    None
                };
                AnswerOutcome::Structured {
                    decision,
                    query,
                    execution,
                }
            }
            Route::DocumentSearch => {
                let results = match self.retriever.search(
                    SearchInput::Text(question),
                    self.top_k,
                    None,
                    cancel,
                ) {
                    Ok(results) => results,
                    Err(err) => {
                        warn!(error = %err, "retrieval failed; returning empty result set");
                        Vec::new()
                    }
                };
                AnswerOutcome::Documents { decision, results }
            }
            Route::Unknown => AnswerOutcome::Unclear { decision },
        }
    }

    /// Generate SQL for many independent questions in parallel.
    pub fn generate_batch(
        &self,
        questions: &[String],
        cancel: &CancelToken,
    ) -> Vec<GeneratedQuery> {
        self.generator.generate_batch(questions, cancel)
    }
}
