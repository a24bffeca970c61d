use crate::error::Result;
use crate::execution::result::QueryResult;
use async_trait::async_trait;
use std::time::SystemTime;

/// Narrow contract over the analytic engine.
#[async_trait]
pub trait AnalyticEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Execute a single SQL statement and return the full result set.
    async fn execute(&self, sql: &str) -> Result<QueryResult>;

    /// Table/column inventory in `table(col type, ...)` line format,
    /// consumed by prompts and identifier suggestions.
    async fn schema_text(&self) -> Result<String>;

    /// Version marker of the backing data (newest file mtime). `None` means
    /// unknown; the schema cache then refreshes only when empty.
    fn source_version(&self) -> Option<SystemTime>;
}
