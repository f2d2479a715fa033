//! Environment-driven runtime configuration
//!
//! Every tunable has a safe default so the pipeline can start with nothing
//! but credentials set. `.env` loading happens in the binary via dotenv.

use std::collections::HashMap;
use std::env;

#[derive(Debug)]
pub enum ConfigError {
    MissingVariable(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingVariable(var) => write!(f, "Missing environment variable: {}", var),
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// API credentials. Bearer token drives v2 endpoints; the OAuth 1.0a set is
/// only needed for the legacy home-timeline endpoint.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub bearer_token: String,
    pub consumer_key: String,
    pub consumer_secret: String,
    pub access_token: String,
    pub access_secret: String,
}

/// Gateway tuning: request rate, burst, and retry policy.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub rps: f64,
    pub burst: u32,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            rps: 2.0,
            burst: 10,
            max_attempts: 5,
            base_backoff_ms: 500,
        }
    }
}

/// Per-type action budget. Zero means unlimited on that axis.
#[derive(Debug, Clone, Copy, Default)]
pub struct Budget {
    pub max_per_hour: i64,
    pub max_per_day: i64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub username: String,
    pub credentials: Credentials,
    pub api: ApiConfig,
    pub db_path: String,
    pub ingest_interval_secs: u64,
    pub ingest_horizon_secs: u64,
    pub keywords: Vec<String>,
    pub keyword_weights: HashMap<String, f64>,
    pub budgets: HashMap<String, Budget>,
    pub model_bin: String,
    pub model_path: String,
}

impl Config {
    /// Builds configuration from the environment, falling back to defaults
    /// for everything except values that cannot be guessed.
    pub fn from_env() -> Self {
        let api = ApiConfig {
            rps: parse_env("X_API_RPS", 2.0),
            burst: parse_env("X_API_BURST", 10),
            max_attempts: parse_env("X_API_MAX_ATTEMPTS", 5),
            base_backoff_ms: parse_env("X_API_BASE_BACKOFF_MS", 500),
        };

        Self {
            username: env::var("ACCOUNT_USERNAME").unwrap_or_default(),
            credentials: Credentials {
                bearer_token: env::var("X_BEARER_TOKEN").unwrap_or_default(),
                consumer_key: env::var("X_CONSUMER_KEY").unwrap_or_default(),
                consumer_secret: env::var("X_CONSUMER_SECRET").unwrap_or_default(),
                access_token: env::var("X_ACCESS_TOKEN").unwrap_or_default(),
                access_secret: env::var("X_ACCESS_SECRET").unwrap_or_default(),
            },
            api,
            db_path: env::var("DB_PATH").unwrap_or_else(|_| "./pulseflow.db".to_string()),
            ingest_interval_secs: parse_env("INGEST_INTERVAL_SECS", 900),
            ingest_horizon_secs: parse_env("INGEST_HORIZON_SECS", 3600),
            keywords: parse_list(&env::var("INTEREST_KEYWORDS").unwrap_or_default()),
            keyword_weights: parse_weights(&env::var("INTEREST_WEIGHTS").unwrap_or_default()),
            budgets: parse_budgets(&env::var("ENGAGE_BUDGETS").unwrap_or_default()),
            model_bin: env::var("MODEL_BIN").unwrap_or_else(|_| "./pulseflow-nn".to_string()),
            model_path: env::var("MODEL_PATH").unwrap_or_else(|_| "./model.json".to_string()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.username.is_empty() {
            return Err(ConfigError::MissingVariable("ACCOUNT_USERNAME".to_string()));
        }
        if self.api.rps <= 0.0 {
            return Err(ConfigError::InvalidValue(
                "X_API_RPS must be positive".to_string(),
            ));
        }
        if self.api.burst == 0 {
            return Err(ConfigError::InvalidValue(
                "X_API_BURST must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Parses `keyword=weight` comma lists, e.g. `rust=1.2,llm=1.0`.
fn parse_weights(raw: &str) -> HashMap<String, f64> {
    let mut out = HashMap::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((k, v)) = part.split_once('=') {
            if let Ok(w) = v.trim().parse::<f64>() {
                out.insert(k.trim().to_lowercase(), w);
            } else {
                log::warn!("Ignoring malformed keyword weight: {}", part);
            }
        }
    }
    out
}

/// Parses `type=hour:day` comma lists, e.g. `reply=6:40,like=10:100`.
/// A missing or unparsable axis falls back to 0 (unlimited).
fn parse_budgets(raw: &str) -> HashMap<String, Budget> {
    let mut out = HashMap::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let Some((typ, caps)) = part.split_once('=') else {
            log::warn!("Ignoring malformed budget spec: {}", part);
            continue;
        };
        let (hour, day) = match caps.split_once(':') {
            Some((h, d)) => (
                h.trim().parse::<i64>().unwrap_or(0),
                d.trim().parse::<i64>().unwrap_or(0),
            ),
            None => (caps.trim().parse::<i64>().unwrap_or(0), 0),
        };
        out.insert(
            typ.trim().to_lowercase(),
            Budget {
                max_per_hour: hour,
                max_per_day: day,
            },
        );
    }
    out
}
