use secrecy::SecretString;

use crate::config::helpers::{optional_env, parse_optional_env, parse_string_env};
use crate::error::ConfigError;

/// Anthropic Messages API settings for the advisory step.
///
/// The API key is optional: without it the advisory step is skipped and
/// jobs still produce metrics.
#[derive(Debug, Clone)]
pub struct AdvisoryConfig {
    pub api_key: Option<SecretString>,
    pub model: String,
    pub base_url: String,
    pub max_tokens: u32,
    /// Per-request HTTP timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for AdvisoryConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "claude-sonnet-4-20250514".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            max_tokens: 1024,
            request_timeout_secs: 120,
        }
    }
}

impl AdvisoryConfig {
    /// Env var carrying the advisory credential. Also the name it is bound
    /// to inside the sandbox for the runner invocation.
    pub const API_KEY_ENV: &'static str = "ANTHROPIC_API_KEY";

    pub fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            api_key: optional_env(Self::API_KEY_ENV)?.map(SecretString::from),
            model: parse_string_env("ANTHROPIC_MODEL", defaults.model)?,
            base_url: parse_string_env("ANTHROPIC_BASE_URL", defaults.base_url)?,
            max_tokens: parse_optional_env("ANTHROPIC_MAX_TOKENS", defaults.max_tokens)?,
            request_timeout_secs: parse_optional_env(
                "ANTHROPIC_TIMEOUT_SECS",
                defaults.request_timeout_secs,
            )?,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }
}
