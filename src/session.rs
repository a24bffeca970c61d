//! Conversation sessions
//!
//! In-memory only: sessions are soft conversational state, not a system of
//! record, and a process restart loses them by design. The repository keys
//! sessions by conversation id and hands out per-session mutexes so two
//! concurrent requests on the same conversation serialize their
//! read-modify-write spans.

use crate::context::ResultContext;
use crate::llm::Usage;
use crate::schemas::Complexity;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::info;

/// Hard bound on retained history turns.
pub const HISTORY_LIMIT: usize = 500;
/// Most-recent query triples kept for prompt context.
const RECENT_QUERIES: usize = 3;
/// Rows retained in the answer cache and in history data payloads.
pub const CACHED_ROW_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// One history turn. Immutable once appended; only the compactor replaces
/// ranges.
#[derive(Debug, Clone, Serialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            sql: None,
            data: None,
            tokens: None,
            model: None,
            cost: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentQuery {
    pub query: String,
    pub complexity: Complexity,
    pub domain: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CachedResult {
    pub sql: String,
    pub rows: Vec<serde_json::Value>,
    pub columns: Vec<String>,
}

/// One-shot booleans.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SessionFlags {
    pub sent_rules: bool,
}

pub struct Session {
    pub chat_id: String,
    pub history: Vec<ChatTurn>,
    pub recent_queries: Vec<RecentQuery>,
    pub last_sql_success: Option<String>,
    pub last_data: Option<CachedResult>,
    pub last_context: Option<ResultContext>,
    pub total_cost: f64,
    pub flags: SessionFlags,
    pub summaries: Vec<String>,
    pub last_access: Instant,
}

impl Session {
    fn new(chat_id: String) -> Self {
        Self {
            chat_id,
            history: Vec::new(),
            recent_queries: Vec::new(),
            last_sql_success: None,
            last_data: None,
            last_context: None,
            total_cost: 0.0,
            flags: SessionFlags::default(),
            summaries: Vec::new(),
            last_access: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_access = Instant::now();
    }

    pub fn push_turn(&mut self, turn: ChatTurn) {
        self.history.push(turn);
    }

    /// Record a handled query; keeps only the most recent three.
    pub fn add_query(&mut self, query: &str, complexity: Complexity, domain: Option<String>) {
        self.recent_queries.push(RecentQuery {
            query: query.to_string(),
            complexity,
            domain,
            at: Utc::now(),
        });
        if self.recent_queries.len() > RECENT_QUERIES {
            self.recent_queries.remove(0);
        }
        self.touch();
    }

    /// Prompt line carrying the last two questions.
    pub fn recent_context(&self) -> String {
        if self.recent_queries.is_empty() {
            return String::new();
        }
        let recent: Vec<String> = self
            .recent_queries
            .iter()
            .rev()
            .take(2)
            .rev()
            .map(|q| format!("\"{}\"", q.query))
            .collect();
        format!("הקשר אחרון: {}", recent.join(", "))
    }

    /// Cost only ever accumulates.
    pub fn add_cost(&mut self, cost: f64) {
        if cost > 0.0 {
            self.total_cost += cost;
        }
    }

    pub fn cache_result(&mut self, sql: &str, columns: &[String], rows: &[serde_json::Value]) {
        self.last_data = Some(CachedResult {
            sql: sql.to_string(),
            rows: rows[..rows.len().min(CACHED_ROW_LIMIT)].to_vec(),
            columns: columns.to_vec(),
        });
    }

    /// Drop the oldest turns beyond the hard limit.
    pub fn enforce_history_limit(&mut self, limit: usize) {
        if self.history.len() > limit {
            let excess = self.history.len() - limit;
            self.history.drain(..excess);
        }
    }
}

pub type SessionHandle = Arc<Mutex<Session>>;

pub struct SessionRepository {
    sessions: DashMap<String, SessionHandle>,
    ttl: Duration,
}

impl SessionRepository {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl,
        }
    }

    pub fn get_or_create(&self, chat_id: &str) -> SessionHandle {
        self.sessions
            .entry(chat_id.to_string())
            .or_insert_with(|| {
                info!(chat_id = %chat_id.get(..8).unwrap_or(chat_id), "new session created");
                Arc::new(Mutex::new(Session::new(chat_id.to_string())))
            })
            .clone()
    }

    pub fn get(&self, chat_id: &str) -> Option<SessionHandle> {
        self.sessions.get(chat_id).map(|entry| entry.value().clone())
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// Aggregate cost across sessions; ones locked by an in-flight request
    /// are skipped.
    pub fn total_cost(&self) -> f64 {
        self.sessions
            .iter()
            .filter_map(|entry| entry.try_lock().ok().map(|s| s.total_cost))
            .sum()
    }

    /// Evict sessions idle past the TTL. Sessions currently locked by a
    /// request are kept.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, handle| match handle.try_lock() {
            Ok(session) => now.duration_since(session.last_access) <= self.ttl,
            Err(_) => true,
        });
        let evicted = before - self.sessions.len();
        if evicted > 0 {
            info!(evicted, remaining = self.sessions.len(), "session cleanup");
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_queries_keep_last_three() {
        let mut session = Session::new("c1".to_string());
        for i in 0..5 {
            session.add_query(&format!("q{}", i), Complexity::Simple, None);
        }
        assert_eq!(session.recent_queries.len(), 3);
        assert_eq!(session.recent_queries[0].query, "q2");
    }

    #[test]
    fn test_recent_context_quotes_last_two() {
        let mut session = Session::new("c1".to_string());
        session.add_query("ראשונה", Complexity::Simple, None);
        session.add_query("שניה", Complexity::Simple, None);
        session.add_query("שלישית", Complexity::Simple, None);
        assert_eq!(session.recent_context(), "הקשר אחרון: \"שניה\", \"שלישית\"");
    }

    #[test]
    fn test_history_limit_enforced() {
        let mut session = Session::new("c1".to_string());
        for i in 0..510 {
            session.push_turn(ChatTurn::user(format!("m{}", i)));
        }
        session.enforce_history_limit(HISTORY_LIMIT);
        assert_eq!(session.history.len(), HISTORY_LIMIT);
        assert_eq!(session.history[0].content, "m10");
    }

    #[test]
    fn test_cache_result_bounded_to_200_rows() {
        let mut session = Session::new("c1".to_string());
        let rows: Vec<serde_json::Value> =
            (0..300).map(|i| serde_json::json!({ "v": i })).collect();
        session.cache_result("SELECT 1", &["v".to_string()], &rows);
        assert_eq!(session.last_data.as_ref().unwrap().rows.len(), CACHED_ROW_LIMIT);
    }

    #[test]
    fn test_cost_is_monotone() {
        let mut session = Session::new("c1".to_string());
        session.add_cost(0.5);
        session.add_cost(-1.0);
        session.add_cost(0.25);
        assert!((session.total_cost - 0.75).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_eviction_by_ttl() {
        let repo = SessionRepository::new(Duration::from_millis(10));
        repo.get_or_create("old");
        tokio::time::sleep(Duration::from_millis(30)).await;
        let fresh = repo.get_or_create("fresh");
        fresh.lock().await.touch();
        let evicted = repo.evict_expired();
        assert_eq!(evicted, 1);
        assert!(repo.get("old").is_none());
        assert!(repo.get("fresh").is_some());
    }
}
