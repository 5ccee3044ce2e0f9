//! Syntactic validation of generated SQL and cleanup of LLM output.
//!
//! Validation is deliberately shallow: it guards against prose, truncated
//! statements and quoting accidents, not against semantic errors (those
//! surface as `DbError` at execution time).

use thiserror::Error;

/// Keywords that may start a statement.
pub const STATEMENT_KEYWORDS: &[&str] = &["SELECT", "INSERT", "UPDATE", "DELETE", "WITH"];

/// Keywords recognized anywhere in a statement; at least one beyond the
/// opener must be present.
pub const RECOGNIZED_KEYWORDS: &[&str] = &[
    "SELECT", "INSERT", "UPDATE", "DELETE", "WITH", "FROM", "WHERE", "GROUP", "ORDER", "LIMIT",
    "JOIN", "VALUES", "SET", "INTO", "HAVING",
];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("empty query text")]
    Empty,

    #[error("query does not start with a statement keyword")]
    NoStatementKeyword,

    #[error("query contains no recognized clause keyword")]
    NoClauseKeyword,

    #[error("unbalanced single quotes")]
    UnbalancedQuotes,

    #[error("unbalanced parentheses")]
    UnbalancedParens,

    #[error("SELECT without FROM")]
    SelectWithoutFrom,

    #[error("multiple statements are not allowed")]
    MultipleStatements,
}

/// Uppercased word list outside of string literals.
fn keywords_of(text: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut in_string = false;
    let mut current = String::new();
    for c in text.chars() {
        if c == '\'' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        if c.is_ascii_alphanumeric() || c == '_' {
            current.push(c.to_ascii_uppercase());
        } else if !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

/// Check that `text` parses as a single plausible SQL statement.
pub fn validate_sql(text: &str) -> Result<(), ValidationError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Empty);
    }

    let words = keywords_of(trimmed);
    let Some(first) = words.first() else {
        return Err(ValidationError::Empty);
    };
    if !STATEMENT_KEYWORDS.contains(&first.as_str()) {
        return Err(ValidationError::NoStatementKeyword);
    }

    // Balanced quoting and parens, single statement only.
    let mut in_string = false;
    let mut paren_depth: i32 = 0;
    for c in trimmed.chars() {
        match c {
            '\'' => in_string = !in_string,
            '(' if !in_string => paren_depth += 1,
            ')' if !in_string => {
                paren_depth -= 1;
                if paren_depth < 0 {
                    return Err(ValidationError::UnbalancedParens);
                }
            }
            ';' if !in_string => return Err(ValidationError::MultipleStatements),
            _ => {}
        }
    }
    if in_string {
        return Err(ValidationError::UnbalancedQuotes);
    }
    if paren_depth != 0 {
        return Err(ValidationError::UnbalancedParens);
    }

    if words
        .iter()
        .skip(1)
        .filter(|w| RECOGNIZED_KEYWORDS.contains(&w.as_str()))
        .count()
        == 0
    {
        return Err(ValidationError::NoClauseKeyword);
    }

    if first == "SELECT" && !words.iter().any(|w| w == "FROM") {
        return Err(ValidationError::SelectWithoutFrom);
    }

    Ok(())
}

/// Clean up raw LLM output: drop any leading prose up to the first
/// statement keyword, then drop trailing terminators and fencing.
pub fn sanitize_llm_output(raw: &str) -> String {
    let without_fences: String = raw
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n");

    let upper = without_fences.to_uppercase();
    let start = STATEMENT_KEYWORDS
        .iter()
        .filter_map(|kw| find_word(&upper, kw))
        .min()
        .unwrap_or(0);

    without_fences[start..]
        .trim()
        .trim_end_matches(';')
        .trim()
        .to_string()
}

/// Byte offset of `word` in `text` at a word boundary, if present.
fn find_word(text: &str, word: &str) -> Option<usize> {
    let mut from = 0;
    while let Some(pos) = text[from..].find(word) {
        let begin = from + pos;
        let end = begin + word.len();
        let left_ok = begin == 0 || !text.as_bytes()[begin - 1].is_ascii_alphanumeric();
        let right_ok = end == text.len() || !text.as_bytes()[end].is_ascii_alphanumeric();
        if left_ok && right_ok {
            return Some(begin);
        }
        from = end;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_select() {
        assert!(validate_sql("SELECT COUNT(*) FROM intersections").is_ok());
        assert!(validate_sql("select name from intersections where district like '%a%'").is_ok());
    }

    #[test]
    fn rejects_prose_and_empty() {
        assert_eq!(validate_sql(""), Err(ValidationError::Empty));
        assert_eq!(
            validate_sql("Sure, here is the query you asked for"),
            Err(ValidationError::NoStatementKeyword)
        );
    }

    #[test]
    fn rejects_unbalanced_quoting() {
        assert_eq!(
            validate_sql("SELECT * FROM t WHERE name = 'broken"),
            Err(ValidationError::UnbalancedQuotes)
        );
        assert_eq!(
            validate_sql("SELECT COUNT( FROM t"),
            Err(ValidationError::UnbalancedParens)
        );
    }

    #[test]
    fn rejects_select_without_from() {
        assert_eq!(
            validate_sql("SELECT 1 + 1 WHERE x"),
            Err(ValidationError::SelectWithoutFrom)
        );
    }

    #[test]
    fn rejects_stacked_statements() {
        assert_eq!(
            validate_sql("SELECT * FROM t; DROP TABLE t"),
            Err(ValidationError::MultipleStatements)
        );
    }

    #[test]
    fn quoting_hides_keywords_and_semicolons() {
        assert!(validate_sql("SELECT * FROM t WHERE note = 'keep; FROM here'").is_ok());
    }

    #[test]
    fn sanitize_strips_prose_fences_and_terminator() {
        let raw = "Here is your SQL:\n```sql\nSELECT * FROM intersections;\n```";
        assert_eq!(sanitize_llm_output(raw), "SELECT * FROM intersections");
    }

    #[test]
    fn sanitize_keeps_clean_statement_untouched() {
        assert_eq!(
            sanitize_llm_output("SELECT name FROM t"),
            "SELECT name FROM t"
        );
    }

    #[test]
    fn sanitize_is_word_boundary_aware() {
        // "DESELECTED" must not be mistaken for a statement start.
        let raw = "DESELECTED items follow. SELECT id FROM t";
        assert_eq!(sanitize_llm_output(raw), "SELECT id FROM t");
    }
}
