use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::config::helpers::{optional_env, parse_bool_env, parse_optional_env, parse_string_env};
use crate::error::ConfigError;

/// Which sandbox provider hosts the per-job environments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SandboxBackendKind {
    /// Hosted Daytona sandboxes (default).
    #[default]
    Daytona,
    /// Local Docker containers.
    Docker,
}

impl std::str::FromStr for SandboxBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "daytona" | "hosted" => Ok(Self::Daytona),
            "docker" | "local" => Ok(Self::Docker),
            _ => Err(format!(
                "invalid sandbox backend '{}', expected one of: daytona, docker",
                s
            )),
        }
    }
}

impl std::fmt::Display for SandboxBackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Daytona => write!(f, "daytona"),
            Self::Docker => write!(f, "docker"),
        }
    }
}

/// Hosted sandbox API settings.
#[derive(Debug, Clone)]
pub struct DaytonaConfig {
    pub api_key: SecretString,
    pub api_url: String,
    /// Region the sandboxes are created in.
    pub target: String,
}

/// Local Docker settings.
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Base image used when no snapshot image is configured or it fails.
    pub image: String,
    pub memory_limit_mb: u64,
    pub cpu_shares: u32,
    /// Pull the image when it is missing locally.
    pub auto_pull_image: bool,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: "debian:bookworm-slim".to_string(),
            memory_limit_mb: 1024,
            cpu_shares: 1024,
            auto_pull_image: true,
        }
    }
}

/// Sandbox provider configuration.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub backend: SandboxBackendKind,
    /// Populated when backend=daytona.
    pub daytona: Option<DaytonaConfig>,
    /// Populated when backend=docker.
    pub docker: Option<DockerConfig>,
    /// Snapshot (hosted) or pre-baked image (docker) tried before a fresh environment.
    pub snapshot: Option<String>,
}

impl SandboxConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let backend: SandboxBackendKind = match optional_env("SANDBOX_BACKEND")? {
            Some(raw) => raw.parse().map_err(|e| ConfigError::InvalidValue {
                key: "SANDBOX_BACKEND".to_string(),
                message: e,
            })?,
            None => SandboxBackendKind::default(),
        };

        let daytona = if backend == SandboxBackendKind::Daytona {
            let api_key = optional_env("DAYTONA_API_KEY")?
                .map(SecretString::from)
                .ok_or_else(|| ConfigError::MissingRequired {
                    key: "DAYTONA_API_KEY".to_string(),
                    hint: "Set DAYTONA_API_KEY or use SANDBOX_BACKEND=docker".to_string(),
                })?;
            Some(DaytonaConfig {
                api_key,
                api_url: parse_string_env("DAYTONA_API_URL", "https://app.daytona.io/api")?,
                target: parse_string_env("DAYTONA_TARGET", "us")?,
            })
        } else {
            None
        };

        let docker = if backend == SandboxBackendKind::Docker {
            let defaults = DockerConfig::default();
            Some(DockerConfig {
                image: parse_string_env("SANDBOX_IMAGE", defaults.image)?,
                memory_limit_mb: parse_optional_env(
                    "SANDBOX_MEMORY_LIMIT_MB",
                    defaults.memory_limit_mb,
                )?,
                cpu_shares: parse_optional_env("SANDBOX_CPU_SHARES", defaults.cpu_shares)?,
                auto_pull_image: parse_bool_env("SANDBOX_AUTO_PULL", defaults.auto_pull_image)?,
            })
        } else {
            None
        };

        Ok(Self {
            backend,
            daytona,
            docker,
            snapshot: optional_env("SANDBOX_SNAPSHOT")?,
        })
    }
}

/// Per-job execution settings.
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Whole-job deadline.
    pub timeout: Duration,
    /// Tear environments down after each job.
    pub auto_cleanup: bool,
    /// Inactivity auto-stop set on every environment.
    pub auto_stop_minutes: u32,
    /// Run a trivial command before transferring files.
    pub liveness_probe: bool,
    /// Program shipped into each environment. `None` means the running executable.
    pub runner_binary: Option<PathBuf>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(240),
            auto_cleanup: true,
            auto_stop_minutes: 10,
            liveness_probe: true,
            runner_binary: None,
        }
    }
}

impl JobConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let timeout_secs: u64 = parse_optional_env("SIMULATION_TIMEOUT", defaults.timeout.as_secs())?;
        if timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "SIMULATION_TIMEOUT".to_string(),
                message: "must be at least 1 second".to_string(),
            });
        }
        Ok(Self {
            timeout: Duration::from_secs(timeout_secs),
            auto_cleanup: parse_bool_env("AUTO_CLEANUP", defaults.auto_cleanup)?,
            auto_stop_minutes: parse_optional_env(
                "SANDBOX_AUTO_STOP_MINUTES",
                defaults.auto_stop_minutes,
            )?,
            liveness_probe: parse_bool_env("SANDBOX_LIVENESS_PROBE", defaults.liveness_probe)?,
            runner_binary: optional_env("RUNNER_BINARY")?.map(PathBuf::from),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::helpers::ENV_MUTEX;

    fn clear_sandbox_env() {
        // SAFETY: Only called under ENV_MUTEX in tests.
        unsafe {
            for key in [
                "SANDBOX_BACKEND",
                "DAYTONA_API_KEY",
                "DAYTONA_API_URL",
                "DAYTONA_TARGET",
                "SANDBOX_SNAPSHOT",
                "SANDBOX_IMAGE",
                "SIMULATION_TIMEOUT",
                "AUTO_CLEANUP",
            ] {
                std::env::remove_var(key);
            }
        }
    }

    #[test]
    fn backend_parses_aliases() {
        assert_eq!("Docker".parse::<SandboxBackendKind>(), Ok(SandboxBackendKind::Docker));
        assert_eq!("hosted".parse::<SandboxBackendKind>(), Ok(SandboxBackendKind::Daytona));
        assert!("kubernetes".parse::<SandboxBackendKind>().is_err());
    }

    #[test]
    fn daytona_requires_api_key() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_sandbox_env();

        let err = SandboxConfig::resolve().unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { ref key, .. } if key == "DAYTONA_API_KEY"));
    }

    #[test]
    fn daytona_defaults_url_and_target() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_sandbox_env();
        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::set_var("DAYTONA_API_KEY", "dtn-test");
        }

        let cfg = SandboxConfig::resolve().expect("resolve should succeed");
        let daytona = cfg.daytona.expect("daytona config should be present");
        assert_eq!(daytona.api_url, "https://app.daytona.io/api");
        assert_eq!(daytona.target, "us");
        assert!(cfg.docker.is_none());

        clear_sandbox_env();
    }

    #[test]
    fn docker_backend_needs_no_key() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_sandbox_env();
        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::set_var("SANDBOX_BACKEND", "docker");
            std::env::set_var("SANDBOX_SNAPSHOT", "treasury-runner:baked");
        }

        let cfg = SandboxConfig::resolve().expect("resolve should succeed");
        assert_eq!(cfg.backend, SandboxBackendKind::Docker);
        assert_eq!(cfg.docker.unwrap().image, "debian:bookworm-slim");
        assert_eq!(cfg.snapshot.as_deref(), Some("treasury-runner:baked"));

        clear_sandbox_env();
    }

    #[test]
    fn job_config_defaults_and_overrides() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_sandbox_env();

        let cfg = JobConfig::resolve().unwrap();
        assert_eq!(cfg.timeout, Duration::from_secs(240));
        assert!(cfg.auto_cleanup);
        assert_eq!(cfg.auto_stop_minutes, 10);

        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::set_var("SIMULATION_TIMEOUT", "30");
            std::env::set_var("AUTO_CLEANUP", "false");
        }
        let cfg = JobConfig::resolve().unwrap();
        assert_eq!(cfg.timeout, Duration::from_secs(30));
        assert!(!cfg.auto_cleanup);

        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::set_var("SIMULATION_TIMEOUT", "0");
        }
        assert!(JobConfig::resolve().is_err());

        clear_sandbox_env();
    }
}
