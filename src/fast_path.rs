//! Fast-path SQL synthesis
//!
//! One completion call turns the question into SQL directly. The prompt
//! carries the rule files and conversation hints but no schema text, to
//! keep the common case cheap. The pipeline executes the result once and
//! falls back to the staged pipeline on any failure or an empty result.

use crate::error::Result;
use crate::guards;
use crate::llm::{calc_cost, CompletionClient};
use crate::prompts;
use crate::schemas::ChatMessage;
use tracing::info;

pub struct FastSql {
    pub sql: String,
    pub cost: f64,
}

pub async fn synthesize(
    llm: &dyn CompletionClient,
    model: &str,
    rules: &str,
    recent_context: &str,
    last_sql_success: Option<&str>,
    question: &str,
) -> Result<FastSql> {
    let last_sql_hint = last_sql_success
        .map(|sql| format!("SQL קודם: {}", sql))
        .unwrap_or_default();

    let system = format!(
        "{}\n\n{}\n\n{}\n{}\n\n{}",
        prompts::FAST_SQL_SYSTEM,
        rules,
        recent_context,
        last_sql_hint,
        prompts::SQL_CRITICAL_RULES,
    );

    let completion = llm
        .chat(
            model,
            &[
                ChatMessage::system(system),
                ChatMessage::user(format!("שאלה: {}", question)),
            ],
            0.1,
        )
        .await?;

    let sql = guards::unwrap_sql(&completion.text);
    info!(sql_preview = %sql.chars().take(100).collect::<String>(), "fast path sql generated");
    Ok(FastSql {
        sql,
        cost: calc_cost(model, &completion.usage),
    })
}
