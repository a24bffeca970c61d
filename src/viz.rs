//! Visualization selection
//!
//! Two ordered rule lists: explicit chart keywords in the user's text win
//! unconditionally, otherwise the profile heuristics are evaluated top to
//! bottom and the first match decides.

use crate::profile::DataProfile;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VizKind {
    Table,
    Bar,
    Line,
    Pie,
    Kpi,
    GroupBar,
    StackBar,
}

impl VizKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VizKind::Table => "table",
            VizKind::Bar => "bar",
            VizKind::Line => "line",
            VizKind::Pie => "pie",
            VizKind::Kpi => "kpi",
            VizKind::GroupBar => "groupbar",
            VizKind::StackBar => "stackbar",
        }
    }
}

lazy_static! {
    // Hebrew and English chart keywords, checked in this order.
    static ref INTENT_RULES: Vec<(Regex, VizKind)> = vec![
        (Regex::new(r"(pie|עוג(ה|ת))").unwrap(), VizKind::Pie),
        (
            Regex::new(r#"\bline\b|(^|[\s"׳״])[בלכמ]?קו([\s"׳״]|$)"#).unwrap(),
            VizKind::Line,
        ),
        (
            Regex::new(r"(stack(ed)?[-\s]?bar|מוערם)").unwrap(),
            VizKind::StackBar,
        ),
        (
            Regex::new(r"(group(ed)?[-\s]?bar|השווא|שנים)").unwrap(),
            VizKind::GroupBar,
        ),
        (
            Regex::new(r#"(^|[\s"׳״])(bar|עמוד|גרף(ה)?)([\s"׳״]|$)"#).unwrap(),
            VizKind::Bar,
        ),
        (
            Regex::new(r#"(^|[\s"׳״])(ב)?טבלת|טבלה([\s"׳״]|$)|\btable\b"#).unwrap(),
            VizKind::Table,
        ),
    ];
}

/// Chart type the user asked for by name, if any.
pub fn explicit_intent(question: &str) -> Option<VizKind> {
    let q = question.to_lowercase();
    INTENT_RULES
        .iter()
        .find(|(pattern, _)| pattern.is_match(&q))
        .map(|(_, kind)| *kind)
}

/// Pick a chart type. Earlier rules win; this is a precedence list, not a
/// scored decision.
pub fn choose(intent: Option<VizKind>, p: &DataProfile) -> VizKind {
    if let Some(kind) = intent {
        return kind;
    }
    if p.row_count > 500 {
        return VizKind::Table;
    }
    let dims = p.dimension_count();
    if p.row_count <= 3 && p.numeric_columns.len() <= 3 {
        return VizKind::Kpi;
    }
    if dims >= 1 && !p.year_columns.is_empty() {
        return VizKind::GroupBar;
    }
    if dims == 2 && p.numeric_columns.len() == 1 {
        return VizKind::StackBar;
    }
    if dims >= 1 && p.numeric_columns.len() == 1 && p.row_count <= 50 {
        return VizKind::Bar;
    }
    if p.date_columns.len() == 1 && p.row_count <= 15 {
        return VizKind::Line;
    }
    VizKind::Table
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(
        columns: &[&str],
        numerics: &[&str],
        years: &[&str],
        dates: &[&str],
        row_count: usize,
    ) -> DataProfile {
        let to_vec = |v: &[&str]| v.iter().map(|s| s.to_string()).collect();
        DataProfile {
            columns: to_vec(columns),
            numeric_columns: to_vec(numerics),
            year_columns: to_vec(years),
            date_columns: to_vec(dates),
            row_count,
        }
    }

    #[test]
    fn test_explicit_intent_wins_over_heuristics() {
        let p = profile(&["a", "b"], &["b"], &[], &[], 1000);
        assert_eq!(choose(Some(VizKind::Pie), &p), VizKind::Pie);
    }

    #[test]
    fn test_large_result_forces_table() {
        let p = profile(&["a", "b"], &["b"], &[], &[], 501);
        assert_eq!(choose(None, &p), VizKind::Table);
    }

    #[test]
    fn test_small_numeric_result_is_kpi() {
        let p = profile(&["total"], &["total"], &[], &[], 1);
        assert_eq!(choose(None, &p), VizKind::Kpi);
    }

    #[test]
    fn test_dimension_with_year_is_groupbar() {
        let p = profile(
            &["customer", "year", "amount"],
            &["amount"],
            &["year"],
            &[],
            20,
        );
        assert_eq!(choose(None, &p), VizKind::GroupBar);
    }

    #[test]
    fn test_two_dimensions_one_metric_is_stackbar() {
        let p = profile(
            &["region", "agent", "sales"],
            &["sales"],
            &[],
            &[],
            30,
        );
        assert_eq!(choose(None, &p), VizKind::StackBar);
    }

    #[test]
    fn test_single_dimension_small_result_is_bar() {
        let p = profile(&["customer", "amount"], &["amount"], &[], &[], 12);
        assert_eq!(choose(None, &p), VizKind::Bar);
    }

    #[test]
    fn test_date_series_is_line() {
        let p = profile(&["תאריך", "amount", "count"], &["amount", "count"], &[], &["תאריך"], 10);
        assert_eq!(choose(None, &p), VizKind::Line);
    }

    #[test]
    fn test_hebrew_pie_keyword() {
        assert_eq!(explicit_intent("הצג עוגה של מכירות"), Some(VizKind::Pie));
    }

    #[test]
    fn test_english_table_keyword() {
        assert_eq!(explicit_intent("show me a table of sales"), Some(VizKind::Table));
    }

    #[test]
    fn test_no_intent() {
        assert_eq!(explicit_intent("כמה מכרנו החודש"), None);
    }
}
