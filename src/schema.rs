//! Schema text cache
//!
//! Caches the engine's table inventory in the `table(col type, ...)` line
//! format the prompts consume. Rebuilt only when the backing files' newest
//! mtime changes; otherwise served read-only. A stale-by-one-version read
//! under concurrent refresh is acceptable.

use crate::error::Result;
use crate::execution::AnalyticEngine;
use crate::schemas::IdentifierKind;
use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;
use tracing::info;

#[derive(Debug, Clone, Default)]
struct CachedSchema {
    text: String,
    version: Option<SystemTime>,
    refreshed_at: Option<DateTime<Utc>>,
    table_count: usize,
}

pub struct SchemaCache {
    engine: Arc<dyn AnalyticEngine>,
    inner: RwLock<CachedSchema>,
}

/// Freshness snapshot for the health endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SchemaFreshness {
    pub table_count: usize,
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl SchemaCache {
    pub fn new(engine: Arc<dyn AnalyticEngine>) -> Self {
        Self {
            engine,
            inner: RwLock::new(CachedSchema::default()),
        }
    }

    /// Rebuild the cached text if the data version moved; no-op otherwise.
    pub async fn refresh(&self) -> Result<()> {
        let version = self.engine.source_version();
        {
            let cached = self.inner.read().expect("schema cache poisoned");
            let unchanged = match (version, cached.version) {
                (Some(new), Some(old)) => new == old,
                (None, _) => !cached.text.is_empty(),
                (Some(_), None) => false,
            };
            if unchanged && cached.refreshed_at.is_some() {
                return Ok(());
            }
        }

        let started = std::time::Instant::now();
        let text = self.engine.schema_text().await?;
        let table_count = text.lines().filter(|l| !l.trim().is_empty()).count();

        let mut cached = self.inner.write().expect("schema cache poisoned");
        cached.text = text;
        cached.version = version;
        cached.refreshed_at = Some(Utc::now());
        cached.table_count = table_count;
        info!(
            tables = table_count,
            took_ms = started.elapsed().as_millis() as u64,
            "schema refreshed"
        );
        Ok(())
    }

    pub fn text(&self) -> String {
        self.inner.read().expect("schema cache poisoned").text.clone()
    }

    pub fn freshness(&self) -> SchemaFreshness {
        let cached = self.inner.read().expect("schema cache poisoned");
        SchemaFreshness {
            table_count: cached.table_count,
            refreshed_at: cached.refreshed_at,
        }
    }

    /// Real identifiers matching `partial` (case-insensitive substring),
    /// ranked by string similarity.
    pub fn suggest_identifiers(
        &self,
        partial: &str,
        kind: IdentifierKind,
        limit: usize,
    ) -> Vec<String> {
        let text = self.text();
        let lower = partial.to_lowercase();
        let mut suggestions: Vec<String> = Vec::new();

        match kind {
            IdentifierKind::Column => {
                for line in text.lines() {
                    let Some(open) = line.find('(') else { continue };
                    let segment = line[open + 1..].trim_end_matches(')');
                    for col in segment.split(',') {
                        let Some(name) = col.trim().split(' ').next() else {
                            continue;
                        };
                        if name.to_lowercase().contains(&lower)
                            && !suggestions.iter().any(|s| s == name)
                        {
                            suggestions.push(name.to_string());
                        }
                    }
                }
            }
            IdentifierKind::Table => {
                for line in text.lines() {
                    let table = line.split('(').next().unwrap_or("").trim();
                    if !table.is_empty()
                        && table.to_lowercase().contains(&lower)
                        && !suggestions.iter().any(|s| s == table)
                    {
                        suggestions.push(table.to_string());
                    }
                }
            }
        }

        suggestions.sort_by(|a, b| {
            let score_a = strsim::jaro_winkler(&lower, &a.to_lowercase());
            let score_b = strsim::jaro_winkler(&lower, &b.to_lowercase());
            score_b
                .partial_cmp(&score_a)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        suggestions.truncate(limit);
        suggestions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::QueryResult;
    use async_trait::async_trait;

    struct FixedSchemaEngine(&'static str);

    #[async_trait]
    impl AnalyticEngine for FixedSchemaEngine {
        fn name(&self) -> &'static str {
            "fixed"
        }
        async fn execute(&self, _sql: &str) -> Result<QueryResult> {
            Ok(QueryResult::default())
        }
        async fn schema_text(&self) -> Result<String> {
            Ok(self.0.to_string())
        }
        fn source_version(&self) -> Option<SystemTime> {
            None
        }
    }

    fn cache() -> SchemaCache {
        SchemaCache::new(Arc::new(FixedSchemaEngine(
            "sales(customer str, שנה i64, amount f64)\ninventory(product str, stock i64)",
        )))
    }

    #[tokio::test]
    async fn test_refresh_populates_text_once() {
        let cache = cache();
        cache.refresh().await.unwrap();
        assert_eq!(cache.freshness().table_count, 2);
        let first = cache.freshness().refreshed_at;
        cache.refresh().await.unwrap();
        assert_eq!(cache.freshness().refreshed_at, first);
    }

    #[tokio::test]
    async fn test_suggest_columns_by_substring() {
        let cache = cache();
        cache.refresh().await.unwrap();
        let suggestions = cache.suggest_identifiers("amoun", IdentifierKind::Column, 5);
        assert_eq!(suggestions, vec!["amount"]);
    }

    #[tokio::test]
    async fn test_suggest_tables() {
        let cache = cache();
        cache.refresh().await.unwrap();
        let suggestions = cache.suggest_identifiers("invent", IdentifierKind::Table, 5);
        assert_eq!(suggestions, vec!["inventory"]);
    }

    #[tokio::test]
    async fn test_no_match_gives_empty_suggestions() {
        let cache = cache();
        cache.refresh().await.unwrap();
        assert!(cache
            .suggest_identifiers("zzz", IdentifierKind::Column, 5)
            .is_empty());
    }
}
