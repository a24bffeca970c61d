//! Completion-service function contracts
//!
//! Typed schemas for every structured decision the pipeline requests from
//! the completion API. Arguments are validated on parse; a shape mismatch
//! fails the request instead of trusting the model output.

use crate::error::{AskError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Function definition advertised to the completion API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Function call returned by the completion API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments.
    pub arguments: String,
}

/// Message in the chat-completion wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain("assistant", content)
    }

    fn plain(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.into()),
            function_call: None,
            name: None,
        }
    }
}

/// Three-way routing decision for an incoming message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Data,
    Free,
    Meta,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassificationResult {
    pub decision: Decision,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
    VeryComplex,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Simple => "simple",
            Complexity::Moderate => "moderate",
            Complexity::Complex => "complex",
            Complexity::VeryComplex => "very_complex",
        }
    }
}

/// Structured analysis produced by the fallback pipeline's first stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryAnalysis {
    pub complexity: Complexity,
    pub intent: String,
    pub requires_joins: bool,
    #[serde(default)]
    pub tables_needed: Vec<String>,
    #[serde(default = "default_domain")]
    pub business_domain: String,
}

fn default_domain() -> String {
    "general".to_string()
}

impl Default for QueryAnalysis {
    fn default() -> Self {
        Self {
            complexity: Complexity::Simple,
            intent: "data_retrieval".to_string(),
            requires_joins: false,
            tables_needed: Vec::new(),
            business_domain: default_domain(),
        }
    }
}

/// Structured SQL produced by the fallback pipeline's build stage.
#[derive(Debug, Clone, Deserialize)]
pub struct SqlBuildResult {
    pub sql: String,
    #[serde(default)]
    pub explanation: Option<String>,
}

/// Kind of identifier an execution error named as missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierKind {
    Column,
    Table,
}

/// Identifier the engine could not resolve, surfaced to the caller in a
/// clarification response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissingIdentifier {
    #[serde(rename = "type")]
    pub kind: IdentifierKind,
    pub name: String,
}

pub fn classify_query_function() -> FunctionDefinition {
    FunctionDefinition {
        name: "classify_query".to_string(),
        description: "Classify if query needs data analysis or free-form response".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "decision": { "type": "string", "enum": ["data", "free", "meta"] },
                "confidence": { "type": "number", "description": "Confidence level 0-1" }
            },
            "required": ["decision"]
        }),
    }
}

pub fn analyze_query_function() -> FunctionDefinition {
    FunctionDefinition {
        name: "analyze_query".to_string(),
        description: "Analyze query complexity, intent, and data requirements".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "complexity": {
                    "type": "string",
                    "enum": ["simple", "moderate", "complex", "very_complex"],
                    "description": "Query complexity level"
                },
                "intent": {
                    "type": "string",
                    "enum": ["data_retrieval", "comparison", "trend_analysis", "forecasting", "anomaly_detection"],
                    "description": "Primary intent of the query"
                },
                "requires_joins": {
                    "type": "boolean",
                    "description": "Whether query requires table joins"
                },
                "tables_needed": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "List of tables required for this query"
                },
                "business_domain": {
                    "type": "string",
                    "enum": ["sales", "inventory", "customers", "products", "general"],
                    "description": "Business domain classification"
                }
            },
            "required": ["complexity", "intent", "requires_joins", "tables_needed"]
        }),
    }
}

pub fn generate_sql_function() -> FunctionDefinition {
    FunctionDefinition {
        name: "generate_sql".to_string(),
        description: "Generate optimized analytic SQL with business logic".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "sql": { "type": "string", "description": "The SQL query" },
                "explanation": { "type": "string", "description": "Brief explanation of the query logic" }
            },
            "required": ["sql"]
        }),
    }
}

/// Parse and validate function-call arguments into a typed contract.
pub fn parse_arguments<T: DeserializeOwned>(call: &FunctionCall) -> Result<T> {
    serde_json::from_str(&call.arguments).map_err(|e| {
        AskError::Completion(format!(
            "Failed to parse {} arguments: {}. Arguments: {}",
            call.name, e, call.arguments
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_classification_arguments() {
        let call = FunctionCall {
            name: "classify_query".to_string(),
            arguments: r#"{"decision": "data", "confidence": 0.9}"#.to_string(),
        };
        let parsed: ClassificationResult = parse_arguments(&call).unwrap();
        assert_eq!(parsed.decision, Decision::Data);
        assert_eq!(parsed.confidence, Some(0.9));
    }

    #[test]
    fn test_parse_rejects_shape_mismatch() {
        let call = FunctionCall {
            name: "classify_query".to_string(),
            arguments: r#"{"decision": "maybe"}"#.to_string(),
        };
        let parsed: Result<ClassificationResult> = parse_arguments(&call);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_analysis_defaults_fill_missing_domain() {
        let call = FunctionCall {
            name: "analyze_query".to_string(),
            arguments: r#"{"complexity": "moderate", "intent": "comparison", "requires_joins": true, "tables_needed": ["sales"]}"#.to_string(),
        };
        let parsed: QueryAnalysis = parse_arguments(&call).unwrap();
        assert_eq!(parsed.complexity, Complexity::Moderate);
        assert_eq!(parsed.business_domain, "general");
    }
}
