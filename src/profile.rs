//! Result-set profiling
//!
//! Classifies the columns of a result set from its first row's value types
//! and column-name patterns. Stateless; feeds the visualization selector.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

lazy_static! {
    static ref DATE_LIKE: Regex = Regex::new(r"(?i)^(שנה|year|month|day|חודש|תאריך)$").unwrap();
    static ref YEAR_LIKE: Regex = Regex::new(r"(?i)(שנה|year)").unwrap();
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DataProfile {
    pub columns: Vec<String>,
    pub numeric_columns: Vec<String>,
    pub year_columns: Vec<String>,
    pub date_columns: Vec<String>,
    pub row_count: usize,
}

impl DataProfile {
    /// Profile a result set. `columns` carries the engine's column order;
    /// `rows` are JSON objects keyed by column name.
    pub fn from_rows(columns: &[String], rows: &[serde_json::Value]) -> Self {
        let Some(first) = rows.first() else {
            return Self::default();
        };

        // A numeric-typed column whose name looks like a year or date is a
        // time axis, not a metric.
        let numeric_columns = columns
            .iter()
            .filter(|c| first[c.as_str()].is_number() && !DATE_LIKE.is_match(c))
            .cloned()
            .collect();
        let year_columns = columns
            .iter()
            .filter(|c| YEAR_LIKE.is_match(c))
            .cloned()
            .collect();
        let date_columns = columns
            .iter()
            .filter(|c| DATE_LIKE.is_match(c) && !first[c.as_str()].is_number())
            .cloned()
            .collect();

        Self {
            columns: columns.to_vec(),
            numeric_columns,
            year_columns,
            date_columns,
            row_count: rows.len(),
        }
    }

    /// Columns that are neither metrics nor time axes.
    pub fn dimension_count(&self) -> usize {
        self.columns
            .len()
            .saturating_sub(self.numeric_columns.len())
            .saturating_sub(self.year_columns.len())
            .saturating_sub(self.date_columns.len())
    }

    pub fn has_numeric_data(&self) -> bool {
        !self.numeric_columns.is_empty()
    }

    pub fn has_time_data(&self) -> bool {
        !self.date_columns.is_empty() || !self.year_columns.is_empty()
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
    fn test_numeric_year_column_is_not_a_metric() {
        let columns = cols(&["שנה", "total"]);
        let rows = vec![json!({"שנה": 2024, "total": 1500.5})];
        let profile = DataProfile::from_rows(&columns, &rows);
        assert_eq!(profile.numeric_columns, vec!["total"]);
        assert_eq!(profile.year_columns, vec!["שנה"]);
        assert!(profile.date_columns.is_empty());
    }

    #[test]
    fn test_dimension_count_excludes_metrics_and_time() {
        let columns = cols(&["customer", "year", "amount"]);
        let rows = vec![json!({"customer": "acme", "year": 2023, "amount": 10})];
        let profile = DataProfile::from_rows(&columns, &rows);
        assert_eq!(profile.dimension_count(), 1);
    }

    #[test]
    fn test_empty_rows_give_empty_profile() {
        let profile = DataProfile::from_rows(&cols(&["a"]), &[]);
        assert_eq!(profile.row_count, 0);
        assert!(profile.columns.is_empty());
    }

    #[test]
    fn test_textual_date_column() {
        let columns = cols(&["תאריך", "amount"]);
        let rows = vec![json!({"תאריך": "2024-01-01", "amount": 3})];
        let profile = DataProfile::from_rows(&columns, &rows);
        assert_eq!(profile.date_columns, vec!["תאריך"]);
        assert_eq!(profile.numeric_columns, vec!["amount"]);
    }
}
