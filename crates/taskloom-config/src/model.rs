use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use taskloom_common::{Error, Result};

/// Error fragments treated as transient when no explicit list is configured.
pub const DEFAULT_RETRYABLE_SIGNATURES: &[&str] = &[
    "econnreset",
    "econnrefused",
    "etimedout",
    "connection reset",
    "connection refused",
    "connection aborted",
    "timed out",
    "timeout",
    "rate limit",
    "too many requests",
    "temporarily unavailable",
    "overloaded",
    "network error",
    "dns error",
];

/// Top-level configuration, usually loaded from `~/.taskloom/config.yml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub provider: ProviderConfig,
    pub engine: EngineConfig,
    pub retry: RetryConfig,
    pub context: ContextConfig,
    pub approval: ApprovalConfig,
    pub memory: MemoryConfig,
    pub tools: ToolsConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Reject combinations the engine cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.provider.model.trim().is_empty() {
            return Err(Error::Config("provider.model must not be empty".into()));
        }
        if self.engine.preserve_recent < 3 {
            return Err(Error::Config(format!(
                "engine.preserve_recent must be at least 3 (got {})",
                self.engine.preserve_recent
            )));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::Config(format!(
                "retry.backoff_multiplier must be >= 1.0 (got {})",
                self.retry.backoff_multiplier
            )));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(Error::Config(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".into(),
            ));
        }
        for profile in self
            .context
            .profiles
            .iter()
            .chain(self.context.default_profile.iter())
        {
            if profile.buffer_tokens >= profile.max_tokens {
                return Err(Error::Config(format!(
                    "context profile '{}' reserves its whole window ({} >= {})",
                    profile.model, profile.buffer_tokens, profile.max_tokens
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Base URL of an OpenAI-compatible API.
    pub base_url: Option<String>,
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Inline key; prefer `api_key_env`.
    pub api_key: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub system_prompt: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            model: "gpt-4o".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            api_key: None,
            max_tokens: Some(4096),
            temperature: None,
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinuationMode {
    /// Never run a follow-up round on its own.
    #[default]
    Never,
    /// Keep reasoning while tools produce output.
    ToolActivity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub working_dir: Option<PathBuf>,
    /// Skip interactive confirmations (requests are still emitted as events).
    pub auto_run: bool,
    pub max_reasoning_rounds: u32,
    pub continuation: ContinuationMode,
    /// Most recent conversation entries that truncation never touches.
    pub preserve_recent: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            working_dir: None,
            auto_run: false,
            max_reasoning_rounds: 3,
            continuation: ContinuationMode::Never,
            preserve_recent: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub retryable_signatures: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            retryable_signatures: DEFAULT_RETRYABLE_SIGNATURES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Replaces the built-in fallback profile when set.
    pub default_profile: Option<ProfileConfig>,
    /// Added to (or overriding) the built-in model profiles.
    pub profiles: Vec<ProfileConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileConfig {
    pub model: String,
    pub max_tokens: usize,
    pub buffer_tokens: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    /// Read-only capabilities run without asking.
    #[default]
    ReadOnly,
    /// Every capability runs without asking.
    All,
    /// Every capability asks.
    None,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    pub mode: ApprovalMode,
    /// Capabilities that never ask, on top of `mode`.
    pub allow: Vec<String>,
    /// Capabilities that always ask, overriding `mode` and `allow`.
    pub ask: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// SQLite file; defaults to `<config dir>/memory.db`.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub command_timeout_secs: u64,
    /// Truncate tool output above this many bytes.
    pub max_output_bytes: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: 120,
            max_output_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
