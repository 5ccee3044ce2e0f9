//! Natural-language to query-slot extraction.
//!
//! `extract` is a pure function over the question, the schema registry and
//! the cue tables: no I/O, no locking, no state. Resolution order is
//! table → columns → query kind → conditions → grouping/ordering/limit,
//! and the confidence score only rewards what was explicitly matched.

pub mod patterns;

use std::sync::Arc;

use tracing::debug;

use crate::model::{CompareOp, Condition, QueryKind, SlotSet};
use crate::schema::{SchemaRegistry, TableDef};
use patterns::CueMatcher;

/// Confidence contribution of a detected aggregation.
const KIND_WEIGHT: f32 = 0.3;
/// Confidence contribution of an explicit table match.
const TABLE_WEIGHT: f32 = 0.3;
/// Confidence contribution of at least one explicit column match.
const COLUMN_WEIGHT: f32 = 0.4;

pub struct SlotExtractor {
    schema: Arc<SchemaRegistry>,
    cues: Arc<dyn CueMatcher>,
}

impl SlotExtractor {
    pub fn new(schema: Arc<SchemaRegistry>, cues: Arc<dyn CueMatcher>) -> Self {
        Self { schema, cues }
    }

    pub fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    /// Map a question to structured query elements.
    pub fn extract(&self, question: &str) -> SlotSet {
        let (table, table_matched) = self.resolve_table(question);
        let columns = self.resolve_columns(question, table);
        let query_kind = self.cues.query_kind(question).unwrap_or(QueryKind::Select);
        let conditions = self.extract_conditions(question, table);
        let group_by = self.resolve_group_by(question, table);
        let order_by = self.resolve_order_by(question, table);
        let limit = self.cues.limit_cue(question);

        let explicit_columns = columns.as_slice() != ["*"];
        let mut confidence = 0.0;
        if query_kind != QueryKind::Select {
            confidence += KIND_WEIGHT;
        }
        if table_matched {
            confidence += TABLE_WEIGHT;
        }
        if explicit_columns {
            confidence += COLUMN_WEIGHT;
        }
        let confidence = confidence.clamp(0.0, 1.0);

        debug!(
            table = %table.name,
            kind = query_kind.as_str(),
            columns = ?columns,
            conditions = conditions.len(),
            confidence,
            "slots_extracted"
        );

        SlotSet {
            query_kind,
            table: table.name.clone(),
            columns,
            conditions,
            group_by,
            order_by,
            limit,
            confidence,
        }
    }

    /// First alias hit wins, in registry order; otherwise the primary table.
    fn resolve_table(&self, question: &str) -> (&TableDef, bool) {
        for table in self.schema.tables() {
            if table
                .aliases
                .iter()
                .any(|alias| self.cues.match_alias(question, alias))
            {
                return (table, true);
            }
        }
        (self.schema.primary_table(), false)
    }

    /// Every alias hit contributes its canonical column, deduplicated, in
    /// order of first match; wildcard when nothing matched.
    fn resolve_columns(&self, question: &str, table: &TableDef) -> Vec<String> {
        let mut columns: Vec<String> = Vec::new();
        for col in &table.columns {
            if columns.contains(&col.name) {
                continue;
            }
            if col
                .aliases
                .iter()
                .any(|alias| self.cues.match_alias(question, alias))
            {
                columns.push(col.name.clone());
            }
        }
        if columns.is_empty() {
            columns.push("*".into());
        }
        columns
    }

    fn extract_conditions(&self, question: &str, table: &TableDef) -> Vec<Condition> {
        let mut conditions = Vec::new();

        // Numeric comparisons, anchored to numeric-column aliases.
        for col in table.columns.iter().filter(|c| c.kind.is_numeric()) {
            for alias in &col.aliases {
                for (op, value) in self.cues.numeric_comparisons(question, alias) {
                    conditions.push(Condition {
                        column: col.name.clone(),
                        op,
                        value: value.to_string(),
                    });
                }
            }
        }

        // Time expressions hit the table's temporal column.
        if let Some(col) = table.temporal_column() {
            for year in self.cues.years(question) {
                conditions.push(Condition {
                    column: col.name.clone(),
                    op: CompareOp::Like,
                    value: format!("%{year}%"),
                });
            }
        }

        // Location expressions hit the table's location column.
        if let Some(col) = table.location_column() {
            for place in self.cues.locations(question) {
                conditions.push(Condition {
                    column: col.name.clone(),
                    op: CompareOp::Like,
                    value: format!("%{place}%"),
                });
            }
        }

        conditions
    }

    /// "per X" resolves X against the table's column aliases.
    fn resolve_group_by(&self, question: &str, table: &TableDef) -> Vec<String> {
        let Some(token) = self.cues.group_cue(question) else {
            return Vec::new();
        };
        match self.column_for_token(table, &token) {
            Some(name) => vec![name],
            None => Vec::new(),
        }
    }

    fn resolve_order_by(&self, question: &str, table: &TableDef) -> Vec<String> {
        let Some(token) = self.cues.order_cue(question) else {
            return Vec::new();
        };
        match self.column_for_token(table, &token) {
            Some(name) => vec![name],
            None => Vec::new(),
        }
    }

    fn column_for_token(&self, table: &TableDef, token: &str) -> Option<String> {
        table
            .columns
            .iter()
            .find(|col| {
                col.name == token
                    || col
                        .aliases
                        .iter()
                        .any(|alias| self.cues.match_alias(token, alias))
            })
            .map(|col| col.name.clone())
    }
}
