//! Relational execution behind a trait, with a scoped-connection SQLite
//! implementation.
//!
//! Connections are opened per call and dropped on every exit path. Read
//! queries return rows with temporal values normalized to a single textual
//! format; mutating queries return the affected-row count. Backend failures
//! surface as [`DbError`] and are never retried here.

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use thiserror::Error;
use tracing::debug;

use crate::model::{ExecutionOutcome, GeneratedQuery};

/// Canonical textual format for temporal values in result rows.
pub const TEMPORAL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum DbError {
    #[error("refusing to execute an unvalidated query")]
    NotValidated,

    #[error("database unavailable: {0}")]
    Unavailable(String),

    #[error("execution failed: {0}")]
    Execution(#[from] rusqlite::Error),
}

/// Executes validated query text against the relational backend.
pub trait RelationalExecutor: Send + Sync {
    fn execute(&self, query: &GeneratedQuery) -> Result<ExecutionOutcome, DbError>;
}

/// SQLite-backed executor. Holds only the path; every call opens and
/// releases its own connection.
pub struct SqliteExecutor {
    db_path: PathBuf,
}

impl SqliteExecutor {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Open without CREATE so a missing database reads as unavailable
    /// instead of silently materializing an empty file.
    fn open(&self) -> Result<Connection, DbError> {
        Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| DbError::Unavailable(e.to_string()))
    }
}

impl RelationalExecutor for SqliteExecutor {
    fn execute(&self, query: &GeneratedQuery) -> Result<ExecutionOutcome, DbError> {
        if !query.validated {
            return Err(DbError::NotValidated);
        }

        let conn = self.open()?;
        let outcome = if is_read_query(&query.text) {
            execute_read(&conn, &query.text)
        } else {
            let affected = conn.execute(&query.text, [])?;
            Ok(ExecutionOutcome::Affected(affected as u64))
        };
        debug!(kind = %query.kind, ok = outcome.is_ok(), "query_executed");
        outcome
    }
}

fn is_read_query(text: &str) -> bool {
    let first = text
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_uppercase();
    matches!(first.as_str(), "SELECT" | "WITH")
}

fn execute_read(conn: &Connection, sql: &str) -> Result<ExecutionOutcome, DbError> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

    let mut rows = Vec::new();
    let mut raw = stmt.query([])?;
    while let Some(row) = raw.next()? {
        let mut values = Vec::with_capacity(columns.len());
        for (idx, column) in columns.iter().enumerate() {
            values.push(to_json(column, row.get_ref(idx)?));
        }
        rows.push(values);
    }

    Ok(ExecutionOutcome::Rows { columns, rows })
}

fn to_json(column: &str, value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => {
            if is_temporal_column(column) {
                if let Some(formatted) = epoch_to_text(i) {
                    return serde_json::Value::String(formatted);
                }
            }
            serde_json::Value::from(i)
        }
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes).to_string();
            match normalize_temporal_text(&text) {
                Some(formatted) => serde_json::Value::String(formatted),
                None => serde_json::Value::String(text),
            }
        }
        ValueRef::Blob(bytes) => serde_json::Value::String(format!("<{} bytes>", bytes.len())),
    }
}

fn is_temporal_column(column: &str) -> bool {
    let lower = column.to_lowercase();
    lower.ends_with("_at") || lower.ends_with("_date") || lower.ends_with("_time")
}

/// Unix seconds (or milliseconds) to canonical text; rejects values far
/// outside a plausible timestamp range so ordinary counters pass through.
fn epoch_to_text(value: i64) -> Option<String> {
    let seconds = if (1_000_000_000_000..10_000_000_000_000).contains(&value) {
        value / 1000
    } else if (100_000_000..10_000_000_000).contains(&value) {
        value
    } else {
        return None;
    };
    DateTime::<Utc>::from_timestamp(seconds, 0).map(|dt| dt.format(TEMPORAL_FORMAT).to_string())
}

/// Parse the common textual timestamp shapes and re-render canonically.
fn normalize_temporal_text(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.naive_utc().format(TEMPORAL_FORMAT).to_string());
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(dt.format(TEMPORAL_FORMAT).to_string());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        let dt = date.and_hms_opt(0, 0, 0)?;
        return Some(dt.format(TEMPORAL_FORMAT).to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::QuerySource;

    fn validated(text: &str) -> GeneratedQuery {
        GeneratedQuery {
            text: text.into(),
            kind: "select".into(),
            confidence: 1.0,
            source: QuerySource::RuleBased,
            validated: true,
            error: None,
        }
    }

    fn seeded_executor() -> (tempfile::TempDir, SqliteExecutor) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("traffic.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE intersections (
                 name TEXT, district TEXT, approach_count INTEGER,
                 daily_volume INTEGER, installed_at TEXT
             );
             INSERT INTO intersections VALUES
                 ('5th & Main', 'Riverside', 4, 18400, '2014-06-02T09:30:00'),
                 ('Oak & Hill', 'Northgate', 3, 4200, '2009-11-20'),
                 ('Pine & 2nd', 'Riverside', 4, 9100, '2021-01-15 08:00:00');",
        )
        .unwrap();
        (dir, SqliteExecutor::new(path))
    }

    #[test]
    fn unvalidated_queries_are_refused() {
        let (_dir, exec) = seeded_executor();
        let mut query = validated("SELECT * FROM intersections");
        query.validated = false;
        assert!(matches!(exec.execute(&query), Err(DbError::NotValidated)));
    }

    #[test]
    fn read_query_returns_rows_with_normalized_timestamps() {
        let (_dir, exec) = seeded_executor();
        let outcome = exec
            .execute(&validated(
                "SELECT name, installed_at FROM intersections ORDER BY name",
            ))
            .unwrap();
        let ExecutionOutcome::Rows { columns, rows } = outcome else {
            panic!("expected rows");
        };
        assert_eq!(columns, vec!["name", "installed_at"]);
        assert_eq!(rows.len(), 3);
        // All three input shapes come back in one format.
        assert_eq!(rows[0][1], serde_json::json!("2014-06-02 09:30:00"));
        assert_eq!(rows[1][1], serde_json::json!("2009-11-20 00:00:00"));
        assert_eq!(rows[2][1], serde_json::json!("2021-01-15 08:00:00"));
    }

    #[test]
    fn count_query_counts() {
        let (_dir, exec) = seeded_executor();
        let outcome = exec
            .execute(&validated(
                "SELECT COUNT(*) FROM intersections WHERE district LIKE '%Riverside%'",
            ))
            .unwrap();
        let ExecutionOutcome::Rows { rows, .. } = outcome else {
            panic!("expected rows");
        };
        assert_eq!(rows[0][0], serde_json::json!(2));
    }

    #[test]
    fn mutations_report_affected_rows() {
        let (_dir, exec) = seeded_executor();
        let mut query = validated("UPDATE intersections SET district = 'Central' WHERE approach_count = 4");
        query.kind = "update".into();
        let outcome = exec.execute(&query).unwrap();
        assert_eq!(outcome, ExecutionOutcome::Affected(2));
    }

    #[test]
    fn backend_errors_surface_as_db_error() {
        let (_dir, exec) = seeded_executor();
        let err = exec
            .execute(&validated("SELECT * FROM missing_table"))
            .unwrap_err();
        assert!(matches!(err, DbError::Execution(_)));
    }

    #[test]
    fn epoch_normalization_rejects_small_integers() {
        assert_eq!(epoch_to_text(42), None);
        assert!(epoch_to_text(1_700_000_000).is_some());
        assert!(epoch_to_text(1_700_000_000_000).is_some());
    }

    #[test]
    fn row_order_sanity() {
        let (_dir, exec) = seeded_executor();
        // name ordering: '5th & Main' < 'Oak & Hill' < 'Pine & 2nd'
        let ExecutionOutcome::Rows { rows, .. } = exec
            .execute(&validated("SELECT name FROM intersections ORDER BY name"))
            .unwrap()
        else {
            panic!("expected rows");
        };
        assert_eq!(rows[0][0], serde_json::json!("5th & Main"));
    }
}
