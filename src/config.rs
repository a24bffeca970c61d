//! Runtime configuration
//!
//! Everything is read from environment variables once at startup (a `.env`
//! file is honored by the server binary). Defaults match the production
//! deployment.

use std::path::PathBuf;
use std::time::Duration;

/// Model name per pipeline stage.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Classification, fast-path SQL, free-form answers.
    pub chat: String,
    /// Query analysis (fallback stage 1).
    pub analyzer: String,
    /// Step-by-step planning (fallback stage 2).
    pub planner: String,
    /// SQL building (fallback stage 3).
    pub builder: String,
    /// SQL repair inside the auto-refine loop.
    pub fixer: String,
    /// Summaries, meta answers, cache answers, history compaction.
    pub summarizer: String,
}

impl ModelConfig {
    fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).unwrap_or_else(|_| "gpt-4o-mini".to_string());
        Self {
            chat: var("OPENAI_MODEL_CHAT"),
            analyzer: var("OPENAI_MODEL_ANALYZER"),
            planner: var("OPENAI_MODEL_PLANNER"),
            builder: var("OPENAI_MODEL_BUILDER"),
            fixer: var("OPENAI_MODEL_FIXER"),
            summarizer: var("OPENAI_MODEL_SUMMARIZER"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub base_url: String,
    pub models: ModelConfig,
    /// Directory holding the CSV/Parquet tables served by the analytic engine.
    pub data_dir: PathBuf,
    /// Domain rule file prepended to SQL-generation prompts.
    pub rules_path: Option<PathBuf>,
    /// Manufacturing rule file, appended after the domain rules.
    pub factory_rules_path: Option<PathBuf>,
    /// Repairs allowed after the first execution attempt.
    pub max_refine: u8,
    /// Hard bound on retained history turns per session.
    pub history_limit: usize,
    /// Client-side timeout for a single completion call.
    pub request_timeout: Duration,
    /// Timeout wrapped around a single engine execution.
    pub execution_timeout: Duration,
    /// Inactivity TTL before a session is swept.
    pub session_ttl: Duration,
    /// Period of the eviction sweep.
    pub sweep_interval: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        let api_key =
            std::env::var("OPENAI_API_KEY").unwrap_or_else(|_| "dummy-api-key".to_string());
        let base_url = std::env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let data_dir = std::env::var("ASKDB_DATA_DIR").unwrap_or_else(|_| "data".to_string());

        Self {
            api_key,
            base_url,
            models: ModelConfig::from_env(),
            data_dir: PathBuf::from(data_dir),
            rules_path: std::env::var("ASKDB_RULES_FILE").ok().map(PathBuf::from),
            factory_rules_path: std::env::var("ASKDB_FACTORY_RULES_FILE")
                .ok()
                .map(PathBuf::from),
            max_refine: std::env::var("ASKDB_MAX_REFINE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            history_limit: 500,
            request_timeout: Duration::from_secs(30),
            execution_timeout: Duration::from_secs(30),
            session_ttl: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
