//! Core pipeline data types.
//!
//! Everything a request produces is one of the tagged structs below; there
//! are no free-form JSON blobs flowing between stages. `RouteDecision`,
//! `SlotSet` and `GeneratedQuery` are created per request and never
//! persisted. `DocumentChunk` is owned by the retrieval index and immutable
//! after ingestion.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Destination pipeline chosen for a question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Route {
    Greeting,
    StructuredQuery,
    DocumentSearch,
    Unknown,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Greeting => "greeting",
            Route::StructuredQuery => "structured_query",
            Route::DocumentSearch => "document_search",
            Route::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of routing one question. Immutable; not persisted.
#[derive(Debug, Clone, Serialize)]
pub struct RouteDecision {
    pub route: Route,
    /// Always in [0, 1].
    pub confidence: f32,
    /// Human-readable explanation of how the route was picked.
    pub reasoning: String,
    /// Per-route similarity (or cue-count) scores.
    pub scores: BTreeMap<Route, f32>,
}

impl RouteDecision {
    pub fn new(
        route: Route,
        confidence: f32,
        reasoning: impl Into<String>,
        scores: BTreeMap<Route, f32>,
    ) -> Self {
        Self {
            route,
            confidence: confidence.clamp(0.0, 1.0),
            reasoning: reasoning.into(),
            scores,
        }
    }
}

/// Aggregation shape of a structured query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryKind {
    Select,
    Count,
    Sum,
    Avg,
    Max,
    Min,
}

impl QueryKind {
    pub fn sql_function(&self) -> Option<&'static str> {
        match self {
            QueryKind::Select => None,
            QueryKind::Count => Some("COUNT"),
            QueryKind::Sum => Some("SUM"),
            QueryKind::Avg => Some("AVG"),
            QueryKind::Max => Some("MAX"),
            QueryKind::Min => Some("MIN"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::Select => "select",
            QueryKind::Count => "count",
            QueryKind::Sum => "sum",
            QueryKind::Avg => "avg",
            QueryKind::Max => "max",
            QueryKind::Min => "min",
        }
    }
}

/// Comparison operator in an extracted condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Gt,
    Lt,
    Ge,
    Le,
    Like,
}

impl CompareOp {
    pub fn sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Gt => ">",
            CompareOp::Lt => "<",
            CompareOp::Ge => ">=",
            CompareOp::Le => "<=",
            CompareOp::Like => "LIKE",
        }
    }
}

/// One WHERE-clause condition extracted from the question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub column: String,
    pub op: CompareOp,
    pub value: String,
}

/// Structured query elements extracted from a natural-language question.
///
/// Built once per question and consumed immediately by the query generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotSet {
    pub query_kind: QueryKind,
    pub table: String,
    /// Canonical column names, order of first match, deduplicated.
    /// `["*"]` when nothing matched.
    pub columns: Vec<String>,
    pub conditions: Vec<Condition>,
    pub group_by: Vec<String>,
    pub order_by: Vec<String>,
    pub limit: Option<u32>,
    pub confidence: f32,
}

impl SlotSet {
    /// True when column resolution matched something beyond the wildcard.
    pub fn has_explicit_columns(&self) -> bool {
        self.columns.as_slice() != ["*"]
    }
}

/// How a query's text came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuerySource {
    RuleBased,
    LlmGenerated,
}

/// A generated (possibly unvalidated) query.
///
/// Invariant: execution is only permitted when `validated == true`; the
/// executor enforces this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedQuery {
    pub text: String,
    pub kind: String,
    pub confidence: f32,
    pub source: QuerySource,
    pub validated: bool,
    pub error: Option<String>,
}

/// One document chunk with its precomputed embedding.
///
/// Chunks are produced by an external ingestion pipeline and never mutated
/// here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub id: String,
    pub content: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// A retrieved chunk with its hybrid score.
///
/// Result lists are sorted descending by score and contain no two entries
/// whose chunk contents have word-set Jaccard similarity >= the configured
/// duplicate threshold.
#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub chunk: Arc<DocumentChunk>,
    pub score: f32,
}

/// Result of executing a generated query against the relational backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ExecutionOutcome {
    /// Read query: column names plus row values, temporal values normalized.
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<serde_json::Value>>,
    },
    /// Mutating query: number of rows affected.
    Affected(u64),
}
