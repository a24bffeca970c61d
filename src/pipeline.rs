//! Per-request orchestration
//!
//! One inbound message flows: classification → meta/free short-circuits, or
//! the data path: cache answer → fast path → fallback pipeline → executor
//! with auto-refine → profiling, visualization, summary → session update.

use crate::classifier;
use crate::compactor;
use crate::config::Config;
use crate::context::extract_context;
use crate::error::{AskError, Result};
use crate::execution::{AnalyticEngine, QueryResult};
use crate::executor::{ExecOutcome, SqlExecutor};
use crate::fallback::{self, FallbackInput, FallbackModels};
use crate::fast_path;
use crate::guards;
use crate::llm::{calc_cost, CompletionClient};
use crate::notify::Notifier;
use crate::profile::DataProfile;
use crate::prompts::{self, RuleFiles};
use crate::schema::SchemaCache;
use crate::schemas::{ChatMessage, Complexity, Decision, MissingIdentifier, QueryAnalysis};
use crate::session::{ChatTurn, Session, SessionRepository, CACHED_ROW_LIMIT};
use crate::viz::{self, VizKind};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};
use uuid::Uuid;

const REPLY_LIST_LIMIT: usize = 20;

#[derive(Debug, Clone, Deserialize)]
pub struct ClarificationReply {
    pub original: String,
    pub selected: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: String,
    #[serde(rename = "chatId")]
    pub chat_id: Option<String>,
    #[serde(rename = "messageId")]
    pub message_id: Option<String>,
    pub clarification: Option<ClarificationReply>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TableData {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl TableData {
    fn empty() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReply {
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viz: Option<VizKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viz_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<TableData>,
    pub reply: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clarification: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing: Option<MissingIdentifier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<u64>,
}

impl ChatReply {
    fn base() -> Self {
        Self {
            message_id: String::new(),
            chat_id: None,
            sql: None,
            viz: None,
            viz_type: None,
            data: None,
            reply: String::new(),
            metadata: None,
            clarification: None,
            missing: None,
            options: None,
            cache: None,
            error: None,
            processing_time: None,
        }
    }

    fn no_data(reply: String) -> Self {
        Self {
            data: Some(TableData::empty()),
            viz_type: Some("none".to_string()),
            reply,
            ..Self::base()
        }
    }
}

enum FinishKind {
    Fast,
    Pipeline(QueryAnalysis),
}

pub struct ChatPipeline {
    llm: Arc<dyn CompletionClient>,
    engine: Arc<dyn AnalyticEngine>,
    sessions: Arc<SessionRepository>,
    schema: Arc<SchemaCache>,
    notifier: Notifier,
    config: Config,
    rules: RuleFiles,
}

impl ChatPipeline {
    pub fn new(
        llm: Arc<dyn CompletionClient>,
        engine: Arc<dyn AnalyticEngine>,
        sessions: Arc<SessionRepository>,
        schema: Arc<SchemaCache>,
        notifier: Notifier,
        config: Config,
    ) -> Self {
        let rules = RuleFiles::load(
            config.rules_path.as_deref(),
            config.factory_rules_path.as_deref(),
        );
        Self {
            llm,
            engine,
            sessions,
            schema,
            notifier,
            config,
            rules,
        }
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn sessions(&self) -> &SessionRepository {
        &self.sessions
    }

    pub fn schema(&self) -> &SchemaCache {
        &self.schema
    }

    /// Handle one inbound message end to end. Failures come back as a
    /// terminal-error reply, never as a panic or transport error.
    pub async fn handle(&self, request: ChatRequest) -> ChatReply {
        let started = Instant::now();
        let mut question = request.message.trim().to_string();

        // A clarification reply re-enters as a fresh request with the
        // substitution pre-applied to the question text.
        if let Some(ref clarification) = request.clarification {
            question = question.replace(&clarification.original, &clarification.selected);
        }

        let (chat_id, is_new_chat) = match request.chat_id {
            Some(id) if Uuid::parse_str(&id).is_ok() => (id, false),
            _ => (Uuid::new_v4().to_string(), true),
        };
        let message_id = request
            .message_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        self.notifier.notify(&message_id, "שאלה התקבלה", Some(0), None);
        self.notifier.notify(&message_id, "התחלת עיבוד", Some(0), None);

        let mut reply = if question.is_empty() {
            let mut reply = ChatReply::base();
            reply.reply = "empty query".to_string();
            reply.error = Some(true);
            reply
        } else {
            let handle = self.sessions.get_or_create(&chat_id);
            let mut session = handle.lock().await;
            session.touch();
            info!(
                message_id = %message_id.get(..8).unwrap_or(&message_id),
                query = %question.chars().take(100).collect::<String>(),
                "query received"
            );

            match self
                .run(&mut session, &question, &message_id, started)
                .await
            {
                Ok(reply) => reply,
                Err(err) => {
                    error!(error = %err, "request failed");
                    let text = format!("העיבוד נכשל: {}", err);
                    session.push_turn(ChatTurn::assistant(text.clone()));
                    session.enforce_history_limit(self.config.history_limit);
                    let mut reply = ChatReply::base();
                    reply.reply = text;
                    reply.error = Some(true);
                    reply
                }
            }
        };

        let elapsed = started.elapsed().as_millis() as u64;
        reply.message_id = message_id.clone();
        reply.processing_time = Some(elapsed);
        if is_new_chat {
            reply.chat_id = Some(chat_id);
        }
        self.notifier
            .notify(&message_id, "סיום עיבוד", Some(elapsed), None);
        self.notifier.notify(
            &message_id,
            &format!("זמן: {:.2}s", elapsed as f64 / 1000.0),
            Some(elapsed),
            None,
        );
        reply
    }

    async fn run(
        &self,
        session: &mut Session,
        question: &str,
        message_id: &str,
        started: Instant,
    ) -> Result<ChatReply> {
        self.schema.refresh().await?;
        self.notify(message_id, "רענון סכימה", started);

        self.notify(message_id, "סיווג שאלה", started);
        let guidelines = self.rules.combined();
        let (decision, _confidence) = classifier::classify(
            self.llm.as_ref(),
            &self.config.models.chat,
            &self.schema.text(),
            &guidelines,
            &session.history,
            question,
        )
        .await
        .map_err(|e| AskError::Classification(e.to_string()))?;

        let label = match decision {
            Decision::Free => "תשובה חופשית",
            Decision::Data => "שאלה נתונית",
            Decision::Meta => "מטא",
        };
        self.notifier.notify(
            message_id,
            &format!("החלטה: {}", label),
            Some(started.elapsed().as_millis() as u64),
            Some(json!(decision)),
        );

        match decision {
            Decision::Meta => self.answer_meta(session, question).await,
            Decision::Free => self.answer_free(session, question, &guidelines).await,
            Decision::Data => {
                self.answer_data(session, question, &guidelines, message_id, started)
                    .await
            }
        }
    }

    async fn answer_meta(&self, session: &mut Session, question: &str) -> Result<ChatReply> {
        session.push_turn(ChatTurn::user(question));

        let tail_start = session.history.len().saturating_sub(10);
        let history_for_model: Vec<serde_json::Value> = session.history[tail_start..]
            .iter()
            .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
            .collect();

        let model = &self.config.models.summarizer;
        let completion = self
            .llm
            .chat(
                model,
                &[
                    ChatMessage::system(prompts::META_SYSTEM),
                    ChatMessage::system(format!(
                        "היסטוריה:\n{}",
                        serde_json::to_string(&history_for_model)?
                    )),
                    ChatMessage::user(question),
                ],
                0.3,
            )
            .await?;

        let cost = calc_cost(model, &completion.usage);
        session.add_cost(cost);
        session.push_turn(ChatTurn {
            tokens: Some(completion.usage.clone()),
            model: Some(model.clone()),
            cost: Some(cost),
            ..ChatTurn::assistant(completion.text.clone())
        });
        session.enforce_history_limit(self.config.history_limit);

        Ok(ChatReply::no_data(completion.text))
    }

    async fn answer_free(
        &self,
        session: &mut Session,
        question: &str,
        guidelines: &str,
    ) -> Result<ChatReply> {
        session.push_turn(ChatTurn::user(question));

        let mut messages = vec![ChatMessage::system(format!(
            "{}\n\n{}",
            prompts::FREE_SYSTEM,
            guidelines
        ))];
        let tail_start = session.history.len().saturating_sub(6);
        for turn in &session.history[tail_start..] {
            messages.push(ChatMessage {
                role: turn.role.as_str().to_string(),
                content: Some(turn.content.clone()),
                function_call: None,
                name: None,
            });
        }

        let model = &self.config.models.chat;
        let completion = self.llm.chat(model, &messages, 0.3).await?;
        let cost = calc_cost(model, &completion.usage);
        session.add_cost(cost);
        session.push_turn(ChatTurn {
            tokens: Some(completion.usage.clone()),
            model: Some(model.clone()),
            cost: Some(cost),
            ..ChatTurn::assistant(completion.text.clone())
        });

        compactor::maintain_history(self.llm.as_ref(), &self.config.models.summarizer, session)
            .await?;
        session.enforce_history_limit(self.config.history_limit);

        Ok(ChatReply::no_data(completion.text))
    }

    async fn answer_data(
        &self,
        session: &mut Session,
        question: &str,
        guidelines: &str,
        message_id: &str,
        started: Instant,
    ) -> Result<ChatReply> {
        session.push_turn(ChatTurn::user(question));

        // A direct follow-up may be answerable from the cached last result
        // without generating any SQL.
        if let Some(completion) = compactor::try_answer_from_cache(
            self.llm.as_ref(),
            &self.config.models.summarizer,
            session,
            question,
        )
        .await?
        {
            info!("cache answered without sql");
            self.notify(message_id, "נענה מהמטמון", started);
            let cost = calc_cost(&self.config.models.summarizer, &completion.usage);
            session.add_cost(cost);
            session.push_turn(ChatTurn {
                tokens: Some(completion.usage.clone()),
                model: Some(self.config.models.summarizer.clone()),
                cost: Some(cost),
                ..ChatTurn::assistant(completion.text.clone())
            });
            session.enforce_history_limit(self.config.history_limit);

            let mut reply = ChatReply::no_data(completion.text);
            reply.cache = Some(true);
            return Ok(reply);
        }

        // Fast path: one synthesis call, one execution, no schema text. The
        // rule files ride along on every fast attempt.
        self.notify(message_id, "Fast Path", started);
        session.flags.sent_rules = true;
        let fast = fast_path::synthesize(
            self.llm.as_ref(),
            &self.config.models.chat,
            guidelines,
            &session.recent_context(),
            session.last_sql_success.as_deref(),
            question,
        )
        .await?;
        session.add_cost(fast.cost);

        guards::ensure_read_only(&fast.sql)?;
        let fast_execution =
            tokio::time::timeout(self.config.execution_timeout, self.engine.execute(&fast.sql))
                .await
                .unwrap_or_else(|_| {
                    Err(AskError::SqlExecution(format!(
                        "execution timed out after {}s",
                        self.config.execution_timeout.as_secs()
                    )))
                });

        match fast_execution {
            Ok(result) if result.row_count >= 1 => {
                info!(rows = result.row_count, "fast path succeeded");
                self.notifier.notify(
                    message_id,
                    "Fast SQL הצליח",
                    Some(started.elapsed().as_millis() as u64),
                    Some(serde_json::Value::String(fast.sql.clone())),
                );
                session.add_query(question, Complexity::Simple, None);
                return self
                    .finalize_success(
                        session,
                        question,
                        fast.sql,
                        result,
                        FinishKind::Fast,
                        message_id,
                        started,
                    )
                    .await;
            }
            Ok(_) => {
                info!("fast path returned no rows, falling back");
                self.notify(message_id, "Fast SQL נכשל", started);
            }
            Err(AskError::WriteRejected) => return Err(AskError::WriteRejected),
            Err(err) => {
                info!(error = %err, "fast path failed, falling back");
                self.notify(message_id, "Fast SQL נכשל", started);
            }
        }

        // Fallback: analyze → plan → build, then the refine loop.
        self.notify(message_id, "מעביר ל-Pipeline המלא", started);
        self.notify(message_id, "שלב ניתוח", started);
        let rules = guidelines.to_string();
        let built = fallback::synthesize(
            self.llm.as_ref(),
            &FallbackModels {
                analyzer: &self.config.models.analyzer,
                planner: &self.config.models.planner,
                builder: &self.config.models.builder,
            },
            &FallbackInput {
                question,
                schema_text: &self.schema.text(),
                rules: &rules,
                recent_context: &session.recent_context(),
                last_context: session.last_context.as_ref(),
                last_sql_success: session.last_sql_success.as_deref(),
            },
        )
        .await?;
        session.add_cost(built.cost);
        session.add_query(
            question,
            built.analysis.complexity,
            Some(built.analysis.business_domain.clone()),
        );

        self.notifier.notify(
            message_id,
            "הרצת SQL",
            Some(started.elapsed().as_millis() as u64),
            Some(serde_json::Value::String(built.sql.clone())),
        );

        let executor = SqlExecutor {
            engine: self.engine.as_ref(),
            llm: self.llm.as_ref(),
            schema: self.schema.as_ref(),
            notifier: &self.notifier,
            fixer_model: &self.config.models.fixer,
            max_refine: self.config.max_refine,
            execution_timeout: self.config.execution_timeout,
        };

        match executor
            .run(&built.sql, question, &rules, message_id)
            .await?
        {
            ExecOutcome::Succeeded {
                sql,
                result,
                attempts,
                cost,
            } => {
                info!(attempts, "pipeline execution succeeded");
                session.add_cost(cost);
                self.finalize_success(
                    session,
                    question,
                    sql,
                    result,
                    FinishKind::Pipeline(built.analysis),
                    message_id,
                    started,
                )
                .await
            }
            ExecOutcome::ClarificationNeeded { missing, options } => {
                self.notify(message_id, "נדרשת הבהרה", started);
                session.enforce_history_limit(self.config.history_limit);
                let reply_text = format!(
                    "לא הצלחתי למצוא את \"{}\". למה התכוונת?",
                    missing.name
                );
                let mut reply = ChatReply::base();
                reply.clarification = Some(true);
                reply.missing = Some(missing);
                reply.options = Some(options);
                reply.reply = reply_text;
                Ok(reply)
            }
            ExecOutcome::Failed {
                error: err_text,
                attempts,
                cost,
            } => {
                session.add_cost(cost);
                let text = format!(
                    "הרצת ה-SQL נכשלה לאחר {} ניסיונות: {}",
                    attempts, err_text
                );
                // Recorded so later "what went wrong" meta-questions can
                // reference the failure.
                session.push_turn(ChatTurn::assistant(text.clone()));
                session.enforce_history_limit(self.config.history_limit);
                let mut reply = ChatReply::base();
                reply.reply = text;
                reply.error = Some(true);
                Ok(reply)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finalize_success(
        &self,
        session: &mut Session,
        question: &str,
        sql: String,
        result: QueryResult,
        kind: FinishKind,
        message_id: &str,
        started: Instant,
    ) -> Result<ChatReply> {
        self.notify(message_id, "בחירת ויזואליזציה", started);
        let intent = viz::explicit_intent(question);
        let profile = DataProfile::from_rows(&result.columns, &result.rows);
        let chart = viz::choose(intent, &profile);

        self.notify(message_id, "יצירת סיכום", started);
        let (system, sample_rows) = match &kind {
            FinishKind::Fast => (prompts::FAST_SUMMARY_SYSTEM.to_string(), 2),
            FinishKind::Pipeline(_) => (
                format!(
                    "{}\n\n{}",
                    prompts::PIPELINE_SUMMARY_SYSTEM,
                    session.recent_context()
                ),
                3,
            ),
        };
        let sample = &result.rows[..result.rows.len().min(sample_rows)];
        let user_message = match &kind {
            FinishKind::Fast => format!(
                "השאילתה: \"{}\"\nתוצאות ({} שורות):\n{}",
                question,
                result.row_count,
                serde_json::to_string_pretty(sample)?
            ),
            FinishKind::Pipeline(_) => format!(
                "השאילתה: \"{}\"\nSQL: {}\nתוצאות ({} שורות):\n{}",
                question,
                sql,
                result.row_count,
                serde_json::to_string_pretty(sample)?
            ),
        };

        let model = &self.config.models.summarizer;
        let completion = self
            .llm
            .chat(
                model,
                &[ChatMessage::system(system), ChatMessage::user(user_message)],
                0.3,
            )
            .await?;
        let cost = calc_cost(model, &completion.usage);
        session.add_cost(cost);

        let ctx = extract_context(&result.columns, &result.rows);
        session.last_context = Some(ctx.clone());
        session.last_sql_success = Some(sql.clone());
        session.cache_result(&sql, &result.columns, &result.rows);

        let stored_rows = result.rows[..result.rows.len().min(CACHED_ROW_LIMIT)].to_vec();
        session.push_turn(ChatTurn {
            sql: Some(sql.clone()),
            data: Some(stored_rows),
            tokens: Some(completion.usage.clone()),
            model: Some(model.clone()),
            cost: Some(cost),
            ..ChatTurn::assistant(compactor::strip_long_lists(
                &completion.text,
                REPLY_LIST_LIMIT,
            ))
        });
        if !ctx.is_empty() {
            session.push_turn(ChatTurn::system(format!(
                "CTX: {}",
                serde_json::to_string(&ctx)?
            )));
        }

        compactor::maintain_history(self.llm.as_ref(), &self.config.models.summarizer, session)
            .await?;
        session.enforce_history_limit(self.config.history_limit);

        let processing_time = started.elapsed().as_millis() as u64;
        let metadata = match &kind {
            FinishKind::Fast => json!({
                "fastPath": true,
                "executionTime": result.execution_time_ms,
                "processingTime": processing_time,
            }),
            FinishKind::Pipeline(analysis) => json!({
                "complexity": analysis.complexity.as_str(),
                "intent": analysis.intent,
                "executionTime": result.execution_time_ms,
                "processingTime": processing_time,
                "dataProfile": {
                    "rows": result.row_count,
                    "columns": result.columns.len(),
                    "hasNumericData": profile.has_numeric_data(),
                    "hasTimeData": profile.has_time_data(),
                },
            }),
        };

        let mut reply = ChatReply::base();
        reply.sql = Some(sql);
        reply.viz = Some(chart);
        reply.data = Some(TableData {
            columns: result.columns.clone(),
            rows: result.row_arrays(),
        });
        reply.reply = completion.text;
        reply.metadata = Some(metadata);
        Ok(reply)
    }

    /// Re-execute a previously returned SQL string for the UI, under the
    /// same write guard.
    pub async fn refresh_data(&self, sql: &str) -> Result<TableData> {
        guards::ensure_read_only(sql)?;
        self.schema.refresh().await?;
        let result = self.engine.execute(sql).await?;
        Ok(TableData {
            columns: result.columns.clone(),
            rows: result.row_arrays(),
        })
    }

    /// Read-only view of one conversation for the history endpoint.
    pub async fn session_snapshot(&self, chat_id: &str) -> Option<serde_json::Value> {
        let handle = self.sessions.get(chat_id)?;
        let mut session = handle.lock().await;
        session.touch();
        Some(json!({
            "chatId": chat_id,
            "ai": {
                "summaries": session.summaries,
                "recent": session.history,
            },
            "totalCost": (session.total_cost * 1e6).round() / 1e6,
        }))
    }

    fn notify(&self, message_id: &str, status: &str, started: Instant) {
        self.notifier.notify(
            message_id,
            status,
            Some(started.elapsed().as_millis() as u64),
            None,
        );
    }
}
