//! Polars execution engine
//!
//! Runs SQL through a `SQLContext` over the CSV/Parquet tables found in the
//! data directory. Each file registers under its stem as the table name.

use crate::error::{AskError, Result};
use crate::execution::engine::AnalyticEngine;
use crate::execution::result::QueryResult;
use async_trait::async_trait;
use polars::prelude::*;
use polars::sql::SQLContext;
use std::path::PathBuf;
use std::time::SystemTime;
use tracing::{debug, info};

pub struct PolarsEngine {
    data_dir: PathBuf,
}

impl PolarsEngine {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    /// Lazy scans for every table file in the data directory.
    fn scan_tables(&self) -> Result<Vec<(String, LazyFrame)>> {
        let mut tables = Vec::new();
        for entry in std::fs::read_dir(&self.data_dir)? {
            let path = entry?.path();
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let lf = match path.extension().and_then(|e| e.to_str()) {
                Some("csv") => LazyCsvReader::new(&path)
                    .with_has_header(true)
                    .with_try_parse_dates(true)
                    .with_infer_schema_length(Some(1000))
                    .finish()
                    .map_err(|e| AskError::Engine(format!("Failed to read CSV: {}", e)))?,
                Some("parquet") => LazyFrame::scan_parquet(&path, ScanArgsParquet::default())
                    .map_err(|e| AskError::Engine(format!("Failed to read Parquet: {}", e)))?,
                _ => continue,
            };
            tables.push((name.to_string(), lf));
        }
        tables.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(tables)
    }

    fn table_files(&self) -> Vec<PathBuf> {
        std::fs::read_dir(&self.data_dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| {
                        matches!(
                            p.extension().and_then(|e| e.to_str()),
                            Some("csv") | Some("parquet")
                        )
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl AnalyticEngine for PolarsEngine {
    fn name(&self) -> &'static str {
        "polars"
    }

    async fn execute(&self, sql: &str) -> Result<QueryResult> {
        let start = std::time::Instant::now();
        debug!(sql_preview = %sql.chars().take(100).collect::<String>(), "executing query");

        let mut ctx = SQLContext::new();
        for (name, lf) in self.scan_tables()? {
            ctx.register(&name, lf);
        }

        let df = ctx
            .execute(sql)
            .map_err(|e| AskError::SqlExecution(e.to_string()))?
            .collect()
            .map_err(|e| AskError::SqlExecution(e.to_string()))?;

        let execution_time_ms = start.elapsed().as_millis() as u64;
        info!(
            rows = df.height(),
            execution_time_ms, "query executed"
        );
        QueryResult::from_dataframe(&df, execution_time_ms)
    }

    async fn schema_text(&self) -> Result<String> {
        let mut lines = Vec::new();
        for (name, mut lf) in self.scan_tables()? {
            let schema = lf
                .schema()
                .map_err(|e| AskError::Engine(format!("Failed to read schema: {}", e)))?;
            let cols: Vec<String> = schema
                .iter()
                .map(|(col, dtype)| format!("{} {}", col, dtype))
                .collect();
            lines.push(format!("{}({})", name, cols.join(", ")));
        }
        Ok(lines.join("\n"))
    }

    fn source_version(&self) -> Option<SystemTime> {
        self.table_files()
            .iter()
            .filter_map(|p| p.metadata().ok().and_then(|m| m.modified().ok()))
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fixture_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("sales.csv")).unwrap();
        writeln!(file, "customer,year,amount").unwrap();
        writeln!(file, "acme,2023,100").unwrap();
        writeln!(file, "acme,2024,150").unwrap();
        writeln!(file, "globex,2024,90").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_execute_select() {
        let dir = fixture_dir();
        let engine = PolarsEngine::new(dir.path().to_path_buf());
        let result = engine
            .execute("SELECT customer, SUM(amount) AS total FROM sales GROUP BY customer ORDER BY total DESC")
            .await
            .unwrap();
        assert_eq!(result.row_count, 2);
        assert_eq!(result.columns, vec!["customer", "total"]);
        assert_eq!(result.rows[0]["customer"], serde_json::json!("acme"));
    }

    #[tokio::test]
    async fn test_schema_text_lists_tables_and_columns() {
        let dir = fixture_dir();
        let engine = PolarsEngine::new(dir.path().to_path_buf());
        let schema = engine.schema_text().await.unwrap();
        assert!(schema.starts_with("sales("));
        assert!(schema.contains("customer"));
        assert!(schema.contains("amount"));
    }

    #[tokio::test]
    async fn test_unknown_table_is_an_execution_error() {
        let dir = fixture_dir();
        let engine = PolarsEngine::new(dir.path().to_path_buf());
        let err = engine.execute("SELECT * FROM nowhere").await.unwrap_err();
        assert!(matches!(err, AskError::SqlExecution(_)));
    }

    #[test]
    fn test_source_version_tracks_files() {
        let dir = fixture_dir();
        let engine = PolarsEngine::new(dir.path().to_path_buf());
        assert!(engine.source_version().is_some());
    }
}
