//! Context extraction
//!
//! Pulls reusable facts out of a result set (years, months, dominant
//! entities) so the next turn's prompts can carry them.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const SAMPLE_ROWS: usize = 200;
const TOP_ENTITIES: usize = 5;

const YEAR_KEYS: [&str; 3] = ["שנה", "year", "Year"];
const MONTH_KEYS: [&str; 3] = ["חודש", "month", "Month"];
const ENTITY_KEYS: [&str; 3] = ["לקוח", "customer", "Customer"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopEntities {
    pub column: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub years: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub months: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_entities: Option<TopEntities>,
}

impl ResultContext {
    pub fn is_empty(&self) -> bool {
        self.years.is_none() && self.months.is_none() && self.top_entities.is_none()
    }
}

/// Extract dimension facts from the first rows of a result set.
pub fn extract_context(columns: &[String], rows: &[serde_json::Value]) -> ResultContext {
    let mut ctx = ResultContext::default();
    if rows.is_empty() {
        return ctx;
    }
    let sample = &rows[..rows.len().min(SAMPLE_ROWS)];

    ctx.years = distinct_values(columns, sample, &YEAR_KEYS);
    ctx.months = distinct_values(columns, sample, &MONTH_KEYS);

    if let Some(column) = first_present(columns, &ENTITY_KEYS) {
        let mut freq: HashMap<String, usize> = HashMap::new();
        for row in sample {
            let value = display_value(&row[column.as_str()]);
            *freq.entry(value).or_insert(0) += 1;
        }
        let values = freq
            .into_iter()
            .sorted_by(|a, b| b.1.cmp(&a.1))
            .take(TOP_ENTITIES)
            .map(|(v, _)| v)
            .collect();
        ctx.top_entities = Some(TopEntities { column, values });
    }

    ctx
}

fn first_present(columns: &[String], keys: &[&str]) -> Option<String> {
    keys.iter()
        .find(|k| columns.iter().any(|c| c == *k))
        .map(|k| k.to_string())
}

fn distinct_values(
    columns: &[String],
    sample: &[serde_json::Value],
    keys: &[&str],
) -> Option<Vec<serde_json::Value>> {
    let column = first_present(columns, keys)?;
    let values: Vec<serde_json::Value> = sample
        .iter()
        .map(|row| row[column.as_str()].clone())
        .unique_by(|v| v.to_string())
        .collect();
    Some(values)
}

fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_extracts_distinct_years() {
        let columns = cols(&["שנה", "amount"]);
        let rows = vec![
            json!({"שנה": 2023, "amount": 10}),
            json!({"שנה": 2024, "amount": 20}),
            json!({"שנה": 2023, "amount": 30}),
        ];
        let ctx = extract_context(&columns, &rows);
        assert_eq!(ctx.years.unwrap().len(), 2);
        assert!(ctx.months.is_none());
    }

    #[test]
    fn test_top_entities_ranked_by_frequency() {
        let columns = cols(&["customer", "amount"]);
        let rows = vec![
            json!({"customer": "acme", "amount": 1}),
            json!({"customer": "acme", "amount": 2}),
            json!({"customer": "globex", "amount": 3}),
        ];
        let ctx = extract_context(&columns, &rows);
        let top = ctx.top_entities.unwrap();
        assert_eq!(top.column, "customer");
        assert_eq!(top.values[0], "acme");
    }

    #[test]
    fn test_empty_rows_yield_empty_context() {
        assert!(extract_context(&cols(&["שנה"]), &[]).is_empty());
    }
}
