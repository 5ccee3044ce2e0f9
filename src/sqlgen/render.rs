//! Deterministic SQL rendering from extracted slots (the fast path).

use crate::model::{CompareOp, QueryKind, SlotSet};

/// Render a slot set as a single SELECT statement.
///
/// Aggregations other than COUNT wrap the first resolved column (or `*`);
/// COUNT always counts rows. Clauses are appended in fixed order
/// WHERE → GROUP BY → ORDER BY → LIMIT.
pub fn render_sql(slots: &SlotSet) -> String {
    let mut sql = format!("SELECT {} FROM {}", select_list(slots), slots.table);

    if !slots.conditions.is_empty() {
        let clauses: Vec<String> = slots
            .conditions
            .iter()
            .map(|c| format!("{} {} {}", c.column, c.op.sql(), render_value(c.op, &c.value)))
            .collect();
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }

    if !slots.group_by.is_empty() {
        sql.push_str(" GROUP BY ");
        sql.push_str(&slots.group_by.join(", "));
    }

    if !slots.order_by.is_empty() {
        sql.push_str(" ORDER BY ");
        sql.push_str(&slots.order_by.join(", "));
    }

    if let Some(limit) = slots.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }

    sql
}

fn select_list(slots: &SlotSet) -> String {
    let aggregate = match slots.query_kind {
        QueryKind::Select => None,
        QueryKind::Count => Some("COUNT(*)".to_string()),
        kind => {
            let func = kind.sql_function().expect("aggregate kind");
            let target = slots
                .columns
                .iter()
                .find(|c| c.as_str() != "*")
                .map(String::as_str)
                .unwrap_or("*");
            Some(format!("{func}({target})"))
        }
    };

    match aggregate {
        Some(expr) => {
            // Grouped aggregates carry their group columns in the output.
            let mut parts = slots.group_by.clone();
            parts.push(expr);
            parts.join(", ")
        }
        None => slots.columns.join(", "),
    }
}

fn render_value(op: CompareOp, value: &str) -> String {
    let numeric = value.parse::<f64>().is_ok();
    if numeric && op != CompareOp::Like {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "''"))
    }
}
