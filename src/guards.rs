//! SQL safety guards
//!
//! The write-keyword blocklist runs before every execution, on every path.
//! Generated statements additionally go through the parser to confirm a
//! single SELECT.

use crate::error::{AskError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use sqlparser::ast::Statement;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use tracing::warn;

lazy_static! {
    static ref WRITE_KEYWORDS: Regex =
        Regex::new(r"(?i)\b(alter|create|insert|update|delete|drop|truncate)\b").unwrap();
    static ref CODE_FENCE: Regex = Regex::new(r"```sql\s*|```").unwrap();
    static ref SQL_PREFIX: Regex = Regex::new(r"(?i)^sql\s+").unwrap();
}

/// Reject any statement containing a write/DDL keyword. Fatal and
/// non-retryable; logged as a security-relevant event.
pub fn ensure_read_only(sql: &str) -> Result<()> {
    if WRITE_KEYWORDS.is_match(sql) {
        warn!(sql_preview = %preview(sql), "write operation rejected");
        return Err(AskError::WriteRejected);
    }
    Ok(())
}

/// Parser-level confirmation that a generated statement is one SELECT.
/// Unparseable SQL is left for the engine to reject; the keyword blocklist
/// has already run.
pub fn ensure_select_only(sql: &str) -> Result<()> {
    match Parser::parse_sql(&GenericDialect {}, sql) {
        Ok(statements) => {
            if statements.len() == 1 && matches!(statements[0], Statement::Query(_)) {
                Ok(())
            } else {
                warn!(sql_preview = %preview(sql), "non-SELECT statement rejected");
                Err(AskError::WriteRejected)
            }
        }
        Err(_) => Ok(()),
    }
}

/// Strip markdown fences and a leading "sql " prefix from model output.
pub fn unwrap_sql(sql: &str) -> String {
    let without_fences = CODE_FENCE.replace_all(sql, "");
    SQL_PREFIX.replace(without_fences.trim(), "").trim().to_string()
}

fn preview(sql: &str) -> String {
    sql.chars().take(100).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_all_write_keywords_any_case() {
        for sql in [
            "ALTER TABLE x ADD y INT",
            "create table t (a int)",
            "INSERT INTO t VALUES (1)",
            "update t set a = 1",
            "DELETE FROM t",
            "drop table t",
            "TRUNCATE t",
            "SELECT 1; DROP TABLE t",
            "select * from t where a = 'x'; TrUnCaTe t",
        ] {
            assert!(ensure_read_only(sql).is_err(), "should reject: {}", sql);
        }
    }

    #[test]
    fn test_accepts_plain_select() {
        assert!(ensure_read_only("SELECT שנה, SUM(amount) FROM sales GROUP BY שנה").is_ok());
    }

    #[test]
    fn test_keyword_inside_identifier_is_not_flagged() {
        // \b boundaries: "created_at" does not contain the bare keyword
        assert!(ensure_read_only("SELECT created_at FROM events").is_ok());
    }

    #[test]
    fn test_select_only_rejects_multiple_statements() {
        assert!(ensure_select_only("SELECT 1; SELECT 2").is_err());
    }

    #[test]
    fn test_unwrap_sql_strips_fences() {
        assert_eq!(
            unwrap_sql("```sql\nSELECT 1\n```"),
            "SELECT 1"
        );
        assert_eq!(unwrap_sql("sql SELECT 2"), "SELECT 2");
        assert_eq!(unwrap_sql("  SELECT 3  "), "SELECT 3");
    }
}
