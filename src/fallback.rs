//! Fallback pipeline: analyze → plan → build
//!
//! Three sequential completion calls, each narrower than one mega-prompt.
//! Strictly more expensive than the fast path and only reached when it
//! fails; trades latency for robustness on complex questions.

use crate::context::ResultContext;
use crate::error::{AskError, Result};
use crate::guards;
use crate::llm::{calc_cost, CompletionClient};
use crate::prompts;
use crate::schemas::{
    analyze_query_function, generate_sql_function, parse_arguments, ChatMessage, QueryAnalysis,
    SqlBuildResult,
};
use tracing::info;

pub struct FallbackModels<'a> {
    pub analyzer: &'a str,
    pub planner: &'a str,
    pub builder: &'a str,
}

pub struct FallbackInput<'a> {
    pub question: &'a str,
    pub schema_text: &'a str,
    pub rules: &'a str,
    pub recent_context: &'a str,
    pub last_context: Option<&'a ResultContext>,
    pub last_sql_success: Option<&'a str>,
}

pub struct BuiltSql {
    pub analysis: QueryAnalysis,
    pub sql: String,
    pub explanation: Option<String>,
    pub cost: f64,
}

/// Stage 1: structured complexity/intent/table analysis.
pub async fn analyze(
    llm: &dyn CompletionClient,
    model: &str,
    recent_context: &str,
    question: &str,
) -> Result<(QueryAnalysis, f64)> {
    let messages = [
        ChatMessage::system(format!("{}\n\n{}", prompts::ANALYZE_SYSTEM, recent_context)),
        ChatMessage::user(question),
    ];
    let completion = llm
        .chat_with_function(model, &messages, &analyze_query_function(), 0.3)
        .await?;
    let cost = calc_cost(model, &completion.usage);

    let analysis = match completion.call {
        Some(call) => parse_arguments(&call)?,
        None => QueryAnalysis::default(),
    };
    info!(
        complexity = analysis.complexity.as_str(),
        intent = %analysis.intent,
        tables = analysis.tables_needed.len(),
        "query analysis"
    );
    Ok((analysis, cost))
}

/// Stage 2: free-form step-by-step plan.
async fn plan(
    llm: &dyn CompletionClient,
    model: &str,
    input: &FallbackInput<'_>,
) -> Result<(String, f64)> {
    let context_json = match input.last_context {
        Some(ctx) if !ctx.is_empty() => {
            format!("\nContextJSON:\n{}", serde_json::to_string(ctx)?)
        }
        _ => String::new(),
    };
    let system = format!(
        "{}\n\nSchema:\n{}\n\n{}\n{}{}",
        prompts::PLAN_SYSTEM,
        input.schema_text,
        input.rules,
        input.recent_context,
        context_json,
    );
    let completion = llm
        .chat(
            model,
            &[
                ChatMessage::system(system),
                ChatMessage::user(format!("תכנן SQL עבור: \"{}\"", input.question)),
            ],
            0.3,
        )
        .await?;
    info!(plan_length = completion.text.len(), "planning completed");
    Ok((completion.text, calc_cost(model, &completion.usage)))
}

/// Stage 3: turn the plan into a single SELECT via a structured call.
async fn build(
    llm: &dyn CompletionClient,
    model: &str,
    input: &FallbackInput<'_>,
    plan_text: &str,
) -> Result<(String, Option<String>, f64)> {
    let context_json = match input.last_context {
        Some(ctx) if !ctx.is_empty() => {
            format!("\nContextJSON:\n{}", serde_json::to_string(ctx)?)
        }
        _ => String::new(),
    };
    let previous_sql = input
        .last_sql_success
        .map(|sql| format!("\n-- שאילתה קודמת:\n{}", sql))
        .unwrap_or_default();
    let system = format!(
        "{}\n\n{}{}{}\n\nתכנית:\n{}",
        prompts::BUILD_SYSTEM,
        input.rules,
        context_json,
        previous_sql,
        plan_text,
    );
    let messages = [
        ChatMessage::system(system),
        ChatMessage::user(format!("בנה SQL עבור: \"{}\"", input.question)),
    ];
    let completion = llm
        .chat_with_function(model, &messages, &generate_sql_function(), 0.3)
        .await?;
    let cost = calc_cost(model, &completion.usage);

    let (sql, explanation) = match completion.call {
        Some(call) => {
            let built: SqlBuildResult = parse_arguments(&call)?;
            (guards::unwrap_sql(built.sql.trim()), built.explanation)
        }
        None => {
            let text = completion.text.ok_or_else(|| {
                AskError::Completion("build stage returned neither function call nor SQL".to_string())
            })?;
            (guards::unwrap_sql(text.trim()), None)
        }
    };

    // SELECT-only shape is enforced here, before the executor ever sees it.
    guards::ensure_read_only(&sql)?;
    guards::ensure_select_only(&sql)?;
    info!(sql_length = sql.len(), "sql generated");
    Ok((sql, explanation, cost))
}

/// Run all three stages. The stages themselves are never retried; a
/// transient failure propagates as a terminal error for the request.
pub async fn synthesize(
    llm: &dyn CompletionClient,
    models: &FallbackModels<'_>,
    input: &FallbackInput<'_>,
) -> Result<BuiltSql> {
    let (analysis, analyze_cost) =
        analyze(llm, models.analyzer, input.recent_context, input.question).await?;
    let (plan_text, plan_cost) = plan(llm, models.planner, input).await?;
    let (sql, explanation, build_cost) = build(llm, models.builder, input, &plan_text).await?;

    Ok(BuiltSql {
        analysis,
        sql,
        explanation,
        cost: analyze_cost + plan_cost + build_cost,
    })
}
