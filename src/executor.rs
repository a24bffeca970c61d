//! SQL execution with auto-refine
//!
//! Bounded repair loop around the analytic engine, modeled as an explicit
//! state machine with the attempt counter as state:
//! Pending → Executing → { Succeeded | Repairing → Executing |
//! ClarificationNeeded | Failed }.
//!
//! Repair order per failure: one mechanical identifier substitution from
//! the schema (at most once per request, no model call), then
//! model-assisted correction. A missing identifier surviving the final
//! attempt becomes a clarification request instead of another repair.

use crate::error::{AskError, Result};
use crate::execution::{AnalyticEngine, QueryResult};
use crate::guards;
use crate::llm::{calc_cost, CompletionClient};
use crate::notify::Notifier;
use crate::prompts;
use crate::schema::SchemaCache;
use crate::schemas::{ChatMessage, IdentifierKind, MissingIdentifier};
use lazy_static::lazy_static;
use regex::Regex;
use std::time::Duration;
use tracing::{error, info, warn};

/// Candidates offered in a clarification request.
const SUGGESTION_LIMIT: usize = 5;
/// Base of the linear backoff between attempts.
const BACKOFF_STEP: Duration = Duration::from_millis(1000);

lazy_static! {
    // Known driver error phrasings, checked in order.
    static ref IDENTIFIER_PATTERNS: Vec<(Regex, IdentifierKind)> = vec![
        (
            Regex::new(r#"column named "([^"]+)""#).unwrap(),
            IdentifierKind::Column,
        ),
        (
            Regex::new(r#"Referenced column "([^"]+)""#).unwrap(),
            IdentifierKind::Column,
        ),
        (
            Regex::new(r#"Referenced table "([^"]+)""#).unwrap(),
            IdentifierKind::Table,
        ),
        (
            Regex::new(r#"(?i)column[s]?\s+['"]?([\wא-ת]+)['"]?\s+not found"#).unwrap(),
            IdentifierKind::Column,
        ),
        (
            Regex::new(r"ColumnNotFound:\s*['\x22]?([\wא-ת]+)").unwrap(),
            IdentifierKind::Column,
        ),
        (
            Regex::new(r#"relation ['"]([^'"]+)['"] was not found"#).unwrap(),
            IdentifierKind::Table,
        ),
        (
            Regex::new(r#"(?i)table\s+['"]?([\wא-ת]+)['"]?\s+not found"#).unwrap(),
            IdentifierKind::Table,
        ),
    ];
}

/// Parse an execution error for the identifier it names as missing.
pub fn extract_missing_identifier(err_msg: &str) -> Option<MissingIdentifier> {
    for (pattern, kind) in IDENTIFIER_PATTERNS.iter() {
        if let Some(captures) = pattern.captures(err_msg) {
            if let Some(name) = captures.get(1) {
                return Some(MissingIdentifier {
                    kind: *kind,
                    name: name.as_str().to_string(),
                });
            }
        }
    }
    None
}

/// Loop states, kept explicit rather than encoded in the call stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefineState {
    Pending,
    Executing { attempt: u8 },
    Repairing { attempt: u8 },
}

/// Terminal outcome of one refine run.
#[derive(Debug)]
pub enum ExecOutcome {
    Succeeded {
        sql: String,
        result: QueryResult,
        attempts: u8,
        cost: f64,
    },
    ClarificationNeeded {
        missing: MissingIdentifier,
        options: Vec<String>,
    },
    Failed {
        error: String,
        attempts: u8,
        cost: f64,
    },
}

pub struct SqlExecutor<'a> {
    pub engine: &'a dyn AnalyticEngine,
    pub llm: &'a dyn CompletionClient,
    pub schema: &'a SchemaCache,
    pub notifier: &'a Notifier,
    pub fixer_model: &'a str,
    pub max_refine: u8,
    pub execution_timeout: Duration,
}

impl<'a> SqlExecutor<'a> {
    /// Run the refine loop. `Err` is reserved for non-negotiable failures
    /// (write guard, completion transport); recoverable endings come back
    /// as an `ExecOutcome`.
    pub async fn run(
        &self,
        initial_sql: &str,
        question: &str,
        rules: &str,
        message_id: &str,
    ) -> Result<ExecOutcome> {
        let mut sql = initial_sql.to_string();
        let mut substitution_used = false;
        let mut repair_cost = 0.0;
        let mut state = RefineState::Pending;
        let max_attempts = self.max_refine + 1;
        tracing::debug!(?state, max_attempts, "refine loop starting");

        for attempt in 1..=max_attempts {
            state = RefineState::Executing { attempt };
            guards::ensure_read_only(&sql)?;

            info!(attempt, max_attempts, ?state, sql_preview = %preview(&sql), "sql execution attempt");

            let execution = tokio::time::timeout(self.execution_timeout, self.engine.execute(&sql))
                .await
                .unwrap_or_else(|_| {
                    Err(AskError::SqlExecution(format!(
                        "execution timed out after {}s",
                        self.execution_timeout.as_secs()
                    )))
                });

            let err = match execution {
                Ok(result) => {
                    info!(attempt, rows = result.row_count, "sql execution succeeded");
                    return Ok(ExecOutcome::Succeeded {
                        sql,
                        result,
                        attempts: attempt,
                        cost: repair_cost,
                    });
                }
                Err(e) => e,
            };

            let err_msg = err.to_string();
            error!(attempt, error = %err_msg, "sql execution failed");
            let missing = extract_missing_identifier(&err_msg);

            if attempt == max_attempts {
                if let Some(missing) = missing {
                    let options = self.schema.suggest_identifiers(
                        &missing.name,
                        missing.kind,
                        SUGGESTION_LIMIT,
                    );
                    info!(missing = %missing.name, candidates = options.len(), "asking for clarification");
                    return Ok(ExecOutcome::ClarificationNeeded { missing, options });
                }
                return Ok(ExecOutcome::Failed {
                    error: err_msg,
                    attempts: attempt,
                    cost: repair_cost,
                });
            }

            state = RefineState::Repairing { attempt };
            tracing::debug!(?state, "entering repair");

            // One mechanical guess before spending a model call.
            if let (Some(missing), false) = (&missing, substitution_used) {
                let candidates =
                    self.schema
                        .suggest_identifiers(&missing.name, missing.kind, SUGGESTION_LIMIT);
                if let Some(candidate) = candidates.first() {
                    info!(from = %missing.name, to = %candidate, "substituting identifier");
                    sql = sql.replace(&missing.name, candidate);
                    substitution_used = true;
                    self.notifier.notify(
                        message_id,
                        "SQL מעודכן",
                        None,
                        Some(serde_json::Value::String(sql.clone())),
                    );
                    tokio::time::sleep(BACKOFF_STEP * attempt as u32).await;
                    continue;
                }
            }

            self.notifier.notify(
                message_id,
                &format!("תיקון SQL - ניסיון {}", attempt + 1),
                None,
                None,
            );
            let (fixed, cost) = self.repair_with_model(&sql, &err_msg, question, rules).await?;
            repair_cost += cost;
            if !fixed.is_empty() && fixed != sql {
                sql = fixed;
                self.notifier.notify(
                    message_id,
                    "SQL מעודכן",
                    None,
                    Some(serde_json::Value::String(sql.clone())),
                );
            } else {
                warn!(attempt, "sql correction produced no change");
            }
            tokio::time::sleep(BACKOFF_STEP * attempt as u32).await;
        }

        // Unreachable: the final attempt always returns above.
        Ok(ExecOutcome::Failed {
            error: "retries exhausted".to_string(),
            attempts: max_attempts,
            cost: repair_cost,
        })
    }

    async fn repair_with_model(
        &self,
        sql: &str,
        err_msg: &str,
        question: &str,
        rules: &str,
    ) -> Result<(String, f64)> {
        let messages = [
            ChatMessage::system(prompts::REPAIR_SYSTEM),
            ChatMessage::system(format!("Schema:\n{}\n\n{}", self.schema.text(), rules)),
            ChatMessage::user(format!(
                "שאלה עסקית: \"{}\"\n\nשגיאה:\n{}\n\nהשאילתה המקורית:\n{}\n\nתקן בבקשה:",
                question, err_msg, sql
            )),
        ];
        let completion = self.llm.chat(self.fixer_model, &messages, 0.3).await?;
        let cost = calc_cost(self.fixer_model, &completion.usage);
        Ok((guards::unwrap_sql(&completion.text), cost))
    }
}

fn preview(sql: &str) -> String {
    sql.chars().take(100).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_referenced_column() {
        let missing =
            extract_missing_identifier("Binder Error: Referenced column \"amont\" not found")
                .unwrap();
        assert_eq!(missing.kind, IdentifierKind::Column);
        assert_eq!(missing.name, "amont");
    }

    #[test]
    fn test_extract_referenced_table() {
        let missing =
            extract_missing_identifier("Catalog Error: Referenced table \"salez\" does not exist")
                .unwrap();
        assert_eq!(missing.kind, IdentifierKind::Table);
        assert_eq!(missing.name, "salez");
    }

    #[test]
    fn test_extract_engine_column_not_found() {
        let missing = extract_missing_identifier(
            "SQL execution error: ColumnNotFound: amnt not found in schema",
        )
        .unwrap();
        assert_eq!(missing.kind, IdentifierKind::Column);
        assert_eq!(missing.name, "amnt");
    }

    #[test]
    fn test_unrelated_error_yields_none() {
        assert!(extract_missing_identifier("syntax error near GROUP").is_none());
    }
}
