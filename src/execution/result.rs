//! Query result - standardized result format from the analytic engine

use crate::error::{AskError, Result};
use polars::prelude::*;
use serde::Serialize;

/// Result set with the engine's column order preserved.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    /// One JSON object per row, keyed by column name.
    pub rows: Vec<serde_json::Value>,
    pub row_count: usize,
    pub execution_time_ms: u64,
}

impl QueryResult {
    pub fn from_dataframe(df: &DataFrame, execution_time_ms: u64) -> Result<Self> {
        let columns: Vec<String> = df
            .get_column_names()
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut rows = Vec::with_capacity(df.height());

        for row_idx in 0..df.height() {
            let mut row = serde_json::Map::new();
            for series in df.get_columns() {
                let value = series_to_json_value(series, row_idx)?;
                row.insert(series.name().to_string(), value);
            }
            rows.push(serde_json::Value::Object(row));
        }

        Ok(Self {
            row_count: rows.len(),
            columns,
            rows,
            execution_time_ms,
        })
    }

    /// Rows re-shaped into arrays following the column order, the format the
    /// HTTP surface returns.
    pub fn row_arrays(&self) -> Vec<Vec<serde_json::Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .map(|c| row[c.as_str()].clone())
                    .collect()
            })
            .collect()
    }
}

fn series_to_json_value(series: &Series, row_idx: usize) -> Result<serde_json::Value> {
    let any_val = series
        .get(row_idx)
        .map_err(|e| AskError::Engine(format!("Failed to get value: {}", e)))?;

    if any_val.is_null() {
        return Ok(serde_json::Value::Null);
    }

    let value = match any_val {
        AnyValue::Null => serde_json::Value::Null,
        AnyValue::Boolean(b) => serde_json::Value::Bool(b),
        AnyValue::String(s) => serde_json::Value::String(s.to_string()),
        AnyValue::Int8(i) => serde_json::Value::Number(i.into()),
        AnyValue::Int16(i) => serde_json::Value::Number(i.into()),
        AnyValue::Int32(i) => serde_json::Value::Number(i.into()),
        AnyValue::Int64(i) => serde_json::Value::Number(i.into()),
        AnyValue::UInt8(u) => serde_json::Value::Number(u.into()),
        AnyValue::UInt16(u) => serde_json::Value::Number(u.into()),
        AnyValue::UInt32(u) => serde_json::Value::Number(u.into()),
        AnyValue::UInt64(u) => serde_json::Value::Number(u.into()),
        AnyValue::Float32(f) => serde_json::Number::from_f64(f as f64)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        AnyValue::Float64(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        AnyValue::Date(days) => date_to_json(days),
        AnyValue::Datetime(ticks, unit, _) => datetime_to_json(ticks, unit),
        other => serde_json::Value::String(format!("{}", other)),
    };

    Ok(value)
}

// Calendar dates serialize as ISO day strings, the format the UI renders.
fn date_to_json(days: i32) -> serde_json::Value {
    match chrono::DateTime::from_timestamp(days as i64 * 86_400, 0) {
        Some(dt) => serde_json::Value::String(dt.format("%Y-%m-%d").to_string()),
        None => serde_json::Value::Null,
    }
}

fn datetime_to_json(ticks: i64, unit: TimeUnit) -> serde_json::Value {
    let seconds = match unit {
        TimeUnit::Nanoseconds => ticks / 1_000_000_000,
        TimeUnit::Microseconds => ticks / 1_000_000,
        TimeUnit::Milliseconds => ticks / 1_000,
    };
    match chrono::DateTime::from_timestamp(seconds, 0) {
        Some(dt) => serde_json::Value::String(dt.format("%Y-%m-%d %H:%M:%S").to_string()),
        None => serde_json::Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_dataframe_preserves_column_order() {
        let df = df![
            "customer" => ["acme", "globex"],
            "amount" => [10i64, 20],
        ]
        .unwrap();
        let result = QueryResult::from_dataframe(&df, 5).unwrap();
        assert_eq!(result.columns, vec!["customer", "amount"]);
        assert_eq!(result.row_count, 2);
        assert_eq!(result.rows[1]["amount"], serde_json::json!(20));
        assert_eq!(result.row_arrays()[0], vec![
            serde_json::json!("acme"),
            serde_json::json!(10)
        ]);
    }

    #[test]
    fn test_nulls_serialize_as_json_null() {
        let df = df![
            "v" => [Some(1i64), None],
        ]
        .unwrap();
        let result = QueryResult::from_dataframe(&df, 0).unwrap();
        assert_eq!(result.rows[1]["v"], serde_json::Value::Null);
    }
}
