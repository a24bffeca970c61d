//! End-to-end pipeline scenarios with a scripted completion client and a
//! canned analytic engine.

use askdb::config::{Config, ModelConfig};
use askdb::error::{AskError, Result};
use askdb::execution::{AnalyticEngine, QueryResult};
use askdb::llm::{Completion, CompletionClient, FunctionCompletion, Usage};
use askdb::notify::Notifier;
use askdb::pipeline::{ChatPipeline, ChatRequest};
use askdb::schema::SchemaCache;
use askdb::schemas::{ChatMessage, FunctionCall, FunctionDefinition};
use askdb::session::SessionRepository;
use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

enum Scripted {
    Text(&'static str),
    Function(&'static str, &'static str),
}

struct MockLlm {
    script: Mutex<VecDeque<Scripted>>,
}

impl MockLlm {
    fn new(script: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
        })
    }

    fn extend(&self, more: Vec<Scripted>) {
        self.script.lock().unwrap().extend(more);
    }

    fn pop(&self) -> Scripted {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .expect("mock llm script exhausted")
    }
}

#[async_trait]
impl CompletionClient for MockLlm {
    async fn chat(
        &self,
        _model: &str,
        _messages: &[ChatMessage],
        _temperature: f32,
    ) -> Result<Completion> {
        match self.pop() {
            Scripted::Text(text) => Ok(Completion {
                text: text.to_string(),
                usage: Usage::default(),
            }),
            Scripted::Function(name, _) => {
                panic!("script expected plain chat, found function {}", name)
            }
        }
    }

    async fn chat_with_function(
        &self,
        _model: &str,
        _messages: &[ChatMessage],
        _function: &FunctionDefinition,
        _temperature: f32,
    ) -> Result<FunctionCompletion> {
        match self.pop() {
            Scripted::Function(name, arguments) => Ok(FunctionCompletion {
                call: Some(FunctionCall {
                    name: name.to_string(),
                    arguments: arguments.to_string(),
                }),
                text: None,
                usage: Usage::default(),
            }),
            Scripted::Text(text) => panic!("script expected function call, found text {}", text),
        }
    }
}

enum EngineMode {
    Rows(usize),
    Fail(&'static str),
}

struct MockEngine {
    mode: EngineMode,
    schema: &'static str,
    executions: AtomicUsize,
}

impl MockEngine {
    fn new(mode: EngineMode, schema: &'static str) -> Arc<Self> {
        Arc::new(Self {
            mode,
            schema,
            executions: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl AnalyticEngine for MockEngine {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn execute(&self, _sql: &str) -> Result<QueryResult> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        match &self.mode {
            EngineMode::Rows(count) => {
                let rows: Vec<serde_json::Value> = (0..*count)
                    .map(|i| json!({ "customer": format!("c{}", i), "amount": (i as i64) * 10 }))
                    .collect();
                Ok(QueryResult {
                    columns: vec!["customer".to_string(), "amount".to_string()],
                    row_count: rows.len(),
                    rows,
                    execution_time_ms: 4,
                })
            }
            EngineMode::Fail(message) => Err(AskError::SqlExecution(message.to_string())),
        }
    }

    async fn schema_text(&self) -> Result<String> {
        Ok(self.schema.to_string())
    }

    fn source_version(&self) -> Option<SystemTime> {
        None
    }
}

fn test_config() -> Config {
    Config {
        api_key: "test".to_string(),
        base_url: "http://localhost".to_string(),
        models: ModelConfig {
            chat: "gpt-4o-mini".to_string(),
            analyzer: "gpt-4o-mini".to_string(),
            planner: "gpt-4o-mini".to_string(),
            builder: "gpt-4o-mini".to_string(),
            fixer: "gpt-4o-mini".to_string(),
            summarizer: "gpt-4o-mini".to_string(),
        },
        data_dir: PathBuf::from("."),
        rules_path: None,
        factory_rules_path: None,
        max_refine: 3,
        history_limit: 500,
        request_timeout: Duration::from_secs(30),
        execution_timeout: Duration::from_secs(30),
        session_ttl: Duration::from_secs(24 * 60 * 60),
        sweep_interval: Duration::from_secs(60 * 60),
    }
}

fn pipeline(llm: Arc<MockLlm>, engine: Arc<MockEngine>) -> ChatPipeline {
    let engine: Arc<dyn AnalyticEngine> = engine;
    let schema = Arc::new(SchemaCache::new(Arc::clone(&engine)));
    ChatPipeline::new(
        llm,
        engine,
        Arc::new(SessionRepository::new(Duration::from_secs(24 * 60 * 60))),
        schema,
        Notifier::new(),
        test_config(),
    )
}

fn message(text: &str, chat_id: Option<String>) -> ChatRequest {
    ChatRequest {
        message: text.to_string(),
        chat_id,
        message_id: None,
        clarification: None,
    }
}

const SALES_SCHEMA: &str = "sales(customer str, amount f64)";

#[tokio::test]
async fn test_first_message_free_greeting() {
    let llm = MockLlm::new(vec![
        Scripted::Function("classify_query", r#"{"decision": "free"}"#),
        Scripted::Text("שלום! אפשר לשאול על מכירות, מלאי ולקוחות."),
    ]);
    let engine = MockEngine::new(EngineMode::Rows(0), SALES_SCHEMA);
    let pipeline = pipeline(llm, engine);

    let reply = pipeline
        .handle(message("שלום, מה אפשר לשאול? הצג דוגמאות", None))
        .await;

    assert!(!reply.reply.is_empty());
    assert_eq!(reply.viz_type.as_deref(), Some("none"));
    assert!(reply.data.unwrap().rows.is_empty());
    assert!(reply.chat_id.is_some(), "new conversation id is echoed");
    assert!(reply.error.is_none());
}

#[tokio::test]
async fn test_fast_path_success_with_twelve_rows() {
    let llm = MockLlm::new(vec![
        Scripted::Function("classify_query", r#"{"decision": "data"}"#),
        Scripted::Text("SELECT customer, amount FROM sales"),
        Scripted::Text("סיכום: ללקוחות הגדולים יש ריכוז מכירות גבוה."),
    ]);
    let engine = MockEngine::new(EngineMode::Rows(12), SALES_SCHEMA);
    let pipeline = pipeline(llm, Arc::clone(&engine));

    let reply = pipeline.handle(message("הצג מכירות לפי לקוח", None)).await;

    assert!(reply.error.is_none());
    assert_eq!(reply.sql.as_deref(), Some("SELECT customer, amount FROM sales"));
    assert!(reply.viz.is_some());
    assert_eq!(reply.data.unwrap().rows.len(), 12);
    assert_eq!(reply.metadata.unwrap()["fastPath"], json!(true));
    assert_eq!(engine.executions.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_persistent_missing_column_yields_clarification() {
    let llm = MockLlm::new(vec![
        Scripted::Function("classify_query", r#"{"decision": "data"}"#),
        // fast path SQL, fails on execution
        Scripted::Text("SELECT amoun FROM sales"),
        // fallback stages
        Scripted::Function(
            "analyze_query",
            r#"{"complexity": "moderate", "intent": "data_retrieval", "requires_joins": false, "tables_needed": ["sales"], "business_domain": "sales"}"#,
        ),
        Scripted::Text("1. קח את עמודת הסכום 2. סכם לפי לקוח"),
        Scripted::Function("generate_sql", r#"{"sql": "SELECT amoun FROM sales"}"#),
        // two model repairs after the one mechanical substitution
        Scripted::Text("SELECT amoun FROM sales"),
        Scripted::Text("SELECT amoun FROM sales"),
    ]);
    let engine = MockEngine::new(
        EngineMode::Fail("Binder Error: Referenced column \"amoun\" not found"),
        SALES_SCHEMA,
    );
    let pipeline = pipeline(llm, Arc::clone(&engine));

    let reply = pipeline.handle(message("כמה מכרנו לפי amoun", None)).await;

    assert_eq!(reply.clarification, Some(true));
    let missing = reply.missing.unwrap();
    assert_eq!(missing.name, "amoun");
    let options = reply.options.unwrap();
    assert!(!options.is_empty());
    assert_eq!(options[0], "amount");
    assert!(reply.sql.is_none());
    // 1 fast attempt + max_refine + 1 refine-loop executions
    assert_eq!(engine.executions.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_cached_result_answers_follow_up_without_sql() {
    let llm = MockLlm::new(vec![
        Scripted::Function("classify_query", r#"{"decision": "data"}"#),
        Scripted::Text("SELECT customer, amount FROM sales"),
        Scripted::Text("שלושה לקוחות מובילים."),
    ]);
    let engine = MockEngine::new(EngineMode::Rows(3), SALES_SCHEMA);
    let pipeline = pipeline(Arc::clone(&llm), engine);

    let first = pipeline.handle(message("הצג מכירות לפי לקוח", None)).await;
    assert!(first.error.is_none());
    let chat_id = first.chat_id.clone().unwrap();

    llm.extend(vec![
        Scripted::Function("classify_query", r#"{"decision": "data"}"#),
        Scripted::Text("הלקוח הגדול ביותר הוא c2 עם 20."),
    ]);

    let second = pipeline
        .handle(message("ומי הלקוח הגדול ביותר מתוכם?", Some(chat_id)))
        .await;

    assert_eq!(second.cache, Some(true));
    assert!(second.sql.is_none(), "cache answers generate no SQL");
    assert!(!second.reply.is_empty());
}

#[tokio::test]
async fn test_meta_question_after_prior_turn() {
    let llm = MockLlm::new(vec![
        Scripted::Function("classify_query", r#"{"decision": "free"}"#),
        Scripted::Text("שלום!"),
    ]);
    let engine = MockEngine::new(EngineMode::Rows(0), SALES_SCHEMA);
    let pipeline = pipeline(Arc::clone(&llm), engine);

    let first = pipeline.handle(message("שלום", None)).await;
    let chat_id = first.chat_id.clone().unwrap();

    // The model says data; the local override forces meta, so the next
    // scripted response is consumed by the meta path's summarizer call.
    llm.extend(vec![
        Scripted::Function("classify_query", r#"{"decision": "data"}"#),
        Scripted::Text("שאלת: שלום"),
    ]);

    let second = pipeline.handle(message("מה שאלתי?", Some(chat_id))).await;

    assert_eq!(second.viz_type.as_deref(), Some("none"));
    assert!(second.data.unwrap().rows.is_empty());
    assert_eq!(second.reply, "שאלת: שלום");
    assert!(second.sql.is_none());
}

#[tokio::test]
async fn test_refresh_data_rejects_write_statements() {
    let llm = MockLlm::new(vec![]);
    let engine = MockEngine::new(EngineMode::Rows(1), SALES_SCHEMA);
    let pipeline = pipeline(llm, engine);

    let err = pipeline.refresh_data("DROP TABLE sales").await.unwrap_err();
    assert!(matches!(err, AskError::WriteRejected));
}

#[tokio::test]
async fn test_history_compaction_replaces_slice_with_one_summary() {
    use askdb::compactor;
    use askdb::session::ChatTurn;

    let llm = MockLlm::new(vec![Scripted::Text("דיברנו על מכירות ולקוחות.")]);
    let repo = SessionRepository::new(Duration::from_secs(60));
    let handle = repo.get_or_create("c1");
    let mut session = handle.lock().await;
    for i in 0..21 {
        session.push_turn(ChatTurn::user(format!("שאלה {}", i)));
    }

    compactor::maintain_history(llm.as_ref(), "gpt-4o-mini", &mut session)
        .await
        .unwrap();

    // 21 - 10 removed + 1 summary
    assert_eq!(session.history.len(), 12);
    assert!(session.history[0].content.starts_with("סיכום:"));
    assert_eq!(session.summaries.len(), 1);
    assert_eq!(session.history[1].content, "שאלה 10");
}
