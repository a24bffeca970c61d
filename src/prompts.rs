//! Prompt templates and rule-file loading
//!
//! All system prompts sent to the completion service live here. The user
//! base works in Hebrew, so the instruction texts do too.

use std::path::Path;
use tracing::warn;

pub const CLASSIFY_INSTRUCTION: &str =
    "החלט: data (שאלה נתונית), free (תשובה חופשית), meta (שאלה על השיחה).";

pub const FREE_SYSTEM: &str = "אתה עוזר BI חכם למערכת ERP. תן תשובות קצרות ומועילות.";

pub const META_SYSTEM: &str =
    "ענה בקצרה ומדויק לשאלה מטא בהתבסס על היסטוריית השיחה המצורפת. אם אין מידע מספיק, השב בהתאם.";

pub const FAST_SQL_SYSTEM: &str = "אתה מומחה SQL אנליטי. החזר רק SQL תקין ללא הסברים.";

pub const SQL_CRITICAL_RULES: &str = "כללים קריטיים:
1. רק SELECT - אסור ALTER/INSERT/UPDATE/DELETE
2. בדוק בקפדנות שכל העמודות קיימות בסכמה
3. השתמש בשמות מדויקים כפי שמופיעים בסכמה
4. החזר רק SQL, ללא markdown";

pub const ANALYZE_SYSTEM: &str =
    "נתח שאילתות BI עבור מערכת ERP. זהה מורכבות, כוונה וטבלאות נדרשות.";

pub const PLAN_SYSTEM: &str = "תכנן SQL אנליטי. חשוב שלב אחר שלב.";

pub const BUILD_SYSTEM: &str = "בנה SQL מיטבי.
 חובה להשתמש ב-SELECT בלבד. אל תבצע ALTER/INSERT/UPDATE/DELETE.
 אסור להשתמש בעמודות שלא קיימות בסכמה.
 השתמש אך ורק בשמות עמודות שמופיעים במפורש ב-Schema.";

pub const REPAIR_SYSTEM: &str = "תקן שאילתת SQL שנכשלה. חובה להשתמש ב-SELECT בלבד (אין ALTER/CREATE/INSERT/UPDATE/DELETE). החזר רק SQL בלי הסברים.";

pub const FAST_SUMMARY_SYSTEM: &str =
    "סכם בתובנות עסקיות קצרות. התייחס למידע עצמו ואל תספק מידע כללי אלא נקודתי.";

pub const PIPELINE_SUMMARY_SYSTEM: &str =
    "נתח את התוצאות ותן תובנות עסקיות מעשיות. התמקד בנתונים האמיתיים.";

pub const CACHE_ANSWER_SYSTEM: &str =
    "ענה על השאלה על-סמך הנתונים המצורפים בלבד. אם אי-אפשר, השב במילה INSUFFICIENT.";

pub const COMPACT_SYSTEM: &str = "סכם בקצרה וענייניות את מקטע השיחה המצורפת.";

pub const NO_DATA_REPLY: &str = "אין נתונים";

/// Domain and manufacturing rule files prepended to SQL-generation prompts.
#[derive(Debug, Clone, Default)]
pub struct RuleFiles {
    pub domain: String,
    pub manufacturing: String,
}

impl RuleFiles {
    /// Load both rule files; a missing file degrades to an empty string.
    pub fn load(domain: Option<&Path>, manufacturing: Option<&Path>) -> Self {
        Self {
            domain: read_or_empty(domain),
            manufacturing: read_or_empty(manufacturing),
        }
    }

    /// Rule text in prompt order: domain first, then manufacturing.
    pub fn combined(&self) -> String {
        match (self.domain.is_empty(), self.manufacturing.is_empty()) {
            (true, true) => String::new(),
            (false, true) => self.domain.clone(),
            (true, false) => self.manufacturing.clone(),
            (false, false) => format!("{}\n\n{}", self.domain, self.manufacturing),
        }
    }
}

fn read_or_empty(path: Option<&Path>) -> String {
    let Some(path) = path else {
        return String::new();
    };
    match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "rule file not readable, continuing without it");
            String::new()
        }
    }
}
