//! Query classification
//!
//! One structured completion call decides data / free / meta, then a fixed
//! override cascade runs locally. The overrides are an ordered rule list:
//! the first matching pattern flips the decision and evaluation stops.
//! Meta patterns are checked before the forecast pattern.

use crate::error::Result;
use crate::llm::CompletionClient;
use crate::prompts;
use crate::schemas::{
    classify_query_function, parse_arguments, ChatMessage, ClassificationResult, Decision,
};
use crate::session::ChatTurn;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::info;

/// History turns included in the classification prompt.
const CLASSIFY_HISTORY_TURNS: usize = 4;

lazy_static! {
    static ref OVERRIDE_RULES: Vec<(Regex, Decision)> = vec![
        // "what did I ask / remind me" - questions about the conversation
        (
            Regex::new(r"(מה\s+שאלתי|מה\s+היית[ה]?|הזכר\s+לי)").unwrap(),
            Decision::Meta,
        ),
        // "what data/SQL did you show me"
        (
            Regex::new(
                r"(?i)(איזה|מה).*?(נתונים|מידע|data|sql|שאילתה).*?(הוצאת|קיבלת|הראית|הצגת|בוצע)",
            )
            .unwrap(),
            Decision::Meta,
        ),
        // forecast vocabulary under-classified by the model
        (
            Regex::new(r"(?i)(חיזוי|תחזית|forecast|trend|projection|predict|לחזות)").unwrap(),
            Decision::Data,
        ),
    ];
}

/// Apply the local override cascade to the model's decision.
pub fn apply_overrides(question: &str, model_decision: Decision, first_turn: bool) -> Decision {
    let mut decision = model_decision;
    for (pattern, outcome) in OVERRIDE_RULES.iter() {
        if pattern.is_match(question) {
            decision = *outcome;
            break;
        }
    }
    // A first turn cannot be meta - there is nothing to recall.
    if first_turn && decision == Decision::Meta {
        decision = Decision::Free;
    }
    decision
}

/// Classify a message. Produced once per message, never retried; an
/// upstream failure here is terminal for the request.
pub async fn classify(
    llm: &dyn CompletionClient,
    model: &str,
    schema_text: &str,
    guidelines: &str,
    history: &[ChatTurn],
    question: &str,
) -> Result<(Decision, Option<f64>)> {
    let mut messages = vec![ChatMessage::system(format!(
        "Schema:\n{}\n\n{}\n\n{}",
        schema_text, guidelines, prompts::CLASSIFY_INSTRUCTION
    ))];
    let tail_start = history.len().saturating_sub(CLASSIFY_HISTORY_TURNS);
    for turn in &history[tail_start..] {
        messages.push(ChatMessage {
            role: turn.role.as_str().to_string(),
            content: Some(turn.content.clone()),
            function_call: None,
            name: None,
        });
    }
    messages.push(ChatMessage::user(question));

    let completion = llm
        .chat_with_function(model, &messages, &classify_query_function(), 0.3)
        .await?;

    // A model that answered in prose instead of the function defaults to free.
    let (model_decision, confidence) = match completion.call {
        Some(call) => {
            let parsed: ClassificationResult = parse_arguments(&call)?;
            (parsed.decision, parsed.confidence)
        }
        None => (Decision::Free, None),
    };

    let decision = apply_overrides(question, model_decision, history.is_empty());
    info!(?decision, "classification");
    Ok((decision, confidence))
}
