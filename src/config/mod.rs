//! Configuration for treasury-sim.
//!
//! Everything comes from environment variables. A `.env` file in the
//! working directory is loaded first via dotenvy, which never overwrites
//! variables that are already set.

pub(crate) mod helpers;
mod llm;
mod sandbox;

use crate::config::helpers::{parse_optional_env, parse_string_env};
use crate::error::ConfigError;

pub use self::llm::AdvisoryConfig;
pub use self::sandbox::{DaytonaConfig, DockerConfig, JobConfig, SandboxBackendKind, SandboxConfig};

/// HTTP listener settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            host: parse_string_env("HOST", "0.0.0.0")?,
            port: parse_optional_env("PORT", 8000)?,
        })
    }
}

/// Main configuration for the service.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub sandbox: SandboxConfig,
    pub job: JobConfig,
    pub advisory: AdvisoryConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Fails when the selected sandbox backend is missing its credential.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Ok(Self {
            server: ServerConfig::resolve()?,
            sandbox: SandboxConfig::resolve()?,
            job: JobConfig::resolve()?,
            advisory: AdvisoryConfig::resolve()?,
        })
    }
}
