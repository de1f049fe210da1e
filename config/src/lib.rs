//! Parley configuration.
//!
//! Read from `~/.parley/config.toml`. Every field is optional:
//!
//! ```toml
//! [app]
//! model = "gpt-4o-mini"
//! system_prompt = "You are a helpful assistant."
//! strategy = "sliding_window"
//! token_limit = 5000
//! warning_threshold = 0.8
//!
//! [api]
//! openai_key = "${OPENAI_API_KEY}"
//! base_url = "https://api.openai.com/v1"
//! request_timeout_secs = 120
//! stream_idle_timeout_secs = 60
//! max_retries = 2
//!
//! [context]
//! recent_window_size = 14
//! summary_batch_size = 14
//! summary_max_tokens = 100
//! fact_window = 6
//! sticky_recent_messages = 6
//!
//! [storage]
//! database = "~/.parley/conversations.db"
//! ```
//!
//! [`Settings::resolve`] layers defaults, the file, and the environment
//! (`OPENAI_API_KEY`, `PARLEY_BASE_URL`, `PARLEY_MODEL`) into concrete values.

use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use serde::Deserialize;
use thiserror::Error;

use parley_types::StrategyKind;

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_TOKEN_LIMIT: u32 = 5000;
pub const DEFAULT_WARNING_THRESHOLD: f64 = 0.8;

#[derive(Debug, Default, Deserialize)]
pub struct ParleyConfig {
    pub app: Option<AppConfig>,
    pub api: Option<ApiConfig>,
    pub context: Option<ContextConfig>,
    pub storage: Option<StorageConfig>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct AppConfig {
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    /// Strategy used when `parley start` is given none.
    pub strategy: Option<String>,
    pub token_limit: Option<u32>,
    /// Fraction of `token_limit` at which the budget warning fires.
    pub warning_threshold: Option<f64>,
}

#[derive(Default, Deserialize)]
pub struct ApiConfig {
    /// Supports `${VAR}` expansion.
    pub openai_key: Option<String>,
    pub base_url: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub stream_idle_timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
}

// Manual Debug impl to keep the key out of logs.
impl std::fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiConfig")
            .field(
                "openai_key",
                &self.openai_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("base_url", &self.base_url)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("stream_idle_timeout_secs", &self.stream_idle_timeout_secs)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ContextConfig {
    pub recent_window_size: Option<usize>,
    pub summary_batch_size: Option<usize>,
    pub summary_max_tokens: Option<u32>,
    pub fact_window: Option<usize>,
    pub sticky_recent_messages: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StorageConfig {
    /// `~/` is expanded to the home directory.
    pub database: Option<String>,
}

/// Replace every `${VAR}` in `value` with the environment variable's value.
///
/// Unset variables expand to the empty string; an unclosed `${` is kept
/// verbatim.
#[must_use]
pub fn expand_env_vars(value: &str) -> String {
    expand_with(value, |name| env::var(name).ok())
}

fn expand_with(value: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(pos) = rest.find("${") {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[pos..]);
            return out;
        };
        let name = &after[..end];
        if !name.is_empty() {
            out.push_str(&lookup(name).unwrap_or_default());
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

impl ParleyConfig {
    /// Load the config file. `Ok(None)` when there is no file.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(None),
        }
    }

    pub fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(path).map_err(|source| {
            tracing::warn!(path = %path.display(), error = %source, "Failed to read config");
            ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }
        })?;

        toml::from_str(&content).map(Some).map_err(|source| {
            tracing::warn!(path = %path.display(), error = %source, "Failed to parse config");
            ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }
}

#[must_use]
pub fn config_path() -> Option<PathBuf> {
    parley_home().map(|home| home.join("config.toml"))
}

/// `~/.parley`, home of the config, the database and the logs.
#[must_use]
pub fn parley_home() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".parley"))
}

/// Fully resolved settings.
#[derive(Clone)]
pub struct Settings {
    pub model: String,
    pub system_prompt: String,
    pub default_strategy: StrategyKind,
    pub token_limit: u32,
    pub warning_threshold: f64,
    pub api_key: Option<String>,
    pub base_url: String,
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
    pub max_retries: u32,
    pub recent_window_size: usize,
    pub summary_batch_size: usize,
    pub summary_max_tokens: u32,
    pub fact_window: usize,
    pub sticky_recent_messages: usize,
    pub database_path: PathBuf,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("model", &self.model)
            .field("default_strategy", &self.default_strategy)
            .field("token_limit", &self.token_limit)
            .field("warning_threshold", &self.warning_threshold)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("base_url", &self.base_url)
            .field("database_path", &self.database_path)
            .finish_non_exhaustive()
    }
}

impl Settings {
    /// Resolve against the process environment.
    #[must_use]
    pub fn resolve(config: Option<&ParleyConfig>) -> Self {
        Self::resolve_with(config, |name| env::var(name).ok())
    }

    fn resolve_with(config: Option<&ParleyConfig>, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let app = config.and_then(|c| c.app.as_ref());
        let api = config.and_then(|c| c.api.as_ref());
        let context = config.and_then(|c| c.context.as_ref());
        let storage = config.and_then(|c| c.storage.as_ref());
        let non_empty = |value: Option<String>| value.filter(|v| !v.trim().is_empty());

        let default_strategy = app
            .and_then(|a| a.strategy.as_deref())
            .and_then(|raw| match raw.parse::<StrategyKind>() {
                Ok(kind) => Some(kind),
                Err(e) => {
                    tracing::warn!(error = %e, "Ignoring configured strategy");
                    None
                }
            })
            .unwrap_or_default();

        let warning_threshold = app
            .and_then(|a| a.warning_threshold)
            .filter(|t| (0.0..=1.0).contains(t))
            .unwrap_or(DEFAULT_WARNING_THRESHOLD);

        let file_key = api
            .and_then(|a| a.openai_key.as_deref())
            .map(|raw| expand_with(raw, &lookup));

        Self {
            model: non_empty(lookup("PARLEY_MODEL"))
                .or_else(|| app.and_then(|a| a.model.clone()))
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            system_prompt: app
                .and_then(|a| a.system_prompt.clone())
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            default_strategy,
            token_limit: app
                .and_then(|a| a.token_limit)
                .filter(|limit| *limit > 0)
                .unwrap_or(DEFAULT_TOKEN_LIMIT),
            warning_threshold,
            api_key: non_empty(lookup("OPENAI_API_KEY")).or_else(|| non_empty(file_key)),
            base_url: non_empty(lookup("PARLEY_BASE_URL"))
                .or_else(|| api.and_then(|a| a.base_url.clone()))
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            request_timeout: Duration::from_secs(
                api.and_then(|a| a.request_timeout_secs).unwrap_or(120),
            ),
            stream_idle_timeout: Duration::from_secs(
                api.and_then(|a| a.stream_idle_timeout_secs).unwrap_or(60),
            ),
            max_retries: api.and_then(|a| a.max_retries).unwrap_or(2),
            recent_window_size: context.and_then(|c| c.recent_window_size).unwrap_or(14),
            summary_batch_size: context
                .and_then(|c| c.summary_batch_size)
                .filter(|size| *size > 0)
                .unwrap_or(14),
            summary_max_tokens: context.and_then(|c| c.summary_max_tokens).unwrap_or(100),
            fact_window: context.and_then(|c| c.fact_window).unwrap_or(6),
            sticky_recent_messages: context.and_then(|c| c.sticky_recent_messages).unwrap_or(6),
            database_path: storage
                .and_then(|s| s.database.as_deref())
                .map(expand_home)
                .unwrap_or_else(default_database_path),
        }
    }
}

fn default_database_path() -> PathBuf {
    parley_home()
        .unwrap_or_else(|| PathBuf::from(".parley"))
        .join("conversations.db")
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
