//! History compaction and the single-fact answer cache
//!
//! Compaction bounds token growth: once history passes the verbatim window,
//! the oldest ten turns collapse into one system-role summary. The answer
//! cache short-circuits SQL generation when the previous result already
//! answers the question.

use crate::error::Result;
use crate::llm::{calc_cost, Completion, CompletionClient};
use crate::prompts;
use crate::schemas::ChatMessage;
use crate::session::{ChatTurn, Session};
use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;

/// Recent turns kept verbatim before summarizing kicks in.
pub const VERBATIM_WINDOW: usize = 20;
/// Oldest contiguous turns replaced per compaction.
const COMPACT_CHUNK: usize = 10;
/// Sample rows offered to the cache-answer probe.
const CACHE_SAMPLE_ROWS: usize = 5;

lazy_static! {
    static ref BULLET_LINE: Regex = Regex::new(r"^\s*([-•*]|\d+[.)])\s+").unwrap();
    static ref PIPE_LINE: Regex = Regex::new(r"^\s*\|").unwrap();
}

/// Summarize the oldest turns into a single system message once history
/// exceeds the verbatim window. The removed slice is replaced by exactly
/// one summary turn; summaries also accumulate in a side list.
pub async fn maintain_history(
    llm: &dyn CompletionClient,
    model: &str,
    session: &mut Session,
) -> Result<()> {
    if session.history.len() <= VERBATIM_WINDOW {
        return Ok(());
    }

    let chunk: Vec<ChatTurn> = session.history.drain(..COMPACT_CHUNK).collect();
    let chunk_text = chunk
        .iter()
        .map(|m| format!("{}: {}", m.role.as_str(), m.content))
        .collect::<Vec<_>>()
        .join("\n");

    let completion = llm
        .chat(
            model,
            &[
                ChatMessage::system(prompts::COMPACT_SYSTEM),
                ChatMessage::user(chunk_text),
            ],
            0.3,
        )
        .await?;

    let summary = completion.text.trim().to_string();
    session.add_cost(calc_cost(model, &completion.usage));
    session
        .history
        .insert(0, ChatTurn::system(format!("סיכום: {}", summary)));
    session.summaries.push(summary);
    debug!(
        history_len = session.history.len(),
        summaries = session.summaries.len(),
        "history compacted"
    );
    Ok(())
}

/// Try answering from the cached last result. Returns `None` when there is
/// no cache or the model answers INSUFFICIENT; any other reply is a cache
/// hit returned to the caller with no SQL generated.
pub async fn try_answer_from_cache(
    llm: &dyn CompletionClient,
    model: &str,
    session: &Session,
    question: &str,
) -> Result<Option<Completion>> {
    let Some(cache) = &session.last_data else {
        return Ok(None);
    };
    if cache.rows.is_empty() {
        return Ok(None);
    }

    let sample = &cache.rows[..cache.rows.len().min(CACHE_SAMPLE_ROWS)];
    let completion = llm
        .chat(
            model,
            &[
                ChatMessage::system(prompts::CACHE_ANSWER_SYSTEM),
                ChatMessage::user(format!(
                    "השאלה: {}\nדגימת נתונים ({} שורות):\n{}",
                    question,
                    cache.rows.len(),
                    serde_json::to_string(sample)?
                )),
            ],
            0.3,
        )
        .await?;

    if completion.text.to_uppercase().starts_with("INSUFFICIENT") {
        return Ok(None);
    }
    Ok(Some(completion))
}

/// Drop oversized bullet/table blocks from a reply before it enters
/// history.
pub fn strip_long_lists(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.split('\n').collect();
    let bullet_count = lines.iter().filter(|l| BULLET_LINE.is_match(l)).count();
    let pipe_count = lines.iter().filter(|l| PIPE_LINE.is_match(l)).count();

    if bullet_count > max_lines || pipe_count > max_lines {
        return lines
            .into_iter()
            .filter(|l| !(BULLET_LINE.is_match(l) || PIPE_LINE.is_match(l)))
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string();
    }
    text.to_string()
}
