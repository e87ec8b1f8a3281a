//! Disposable execution environments.
//!
//! A [`SandboxBackend`] knows how to create, drive and destroy environments
//! on one provider. Callers never hold a backend directly; every operation
//! goes through the [`EnvironmentRegistry`], which tracks the live set and
//! refuses to touch environments that are gone or being torn down.

mod daytona;
mod docker;
mod registry;

pub use daytona::DaytonaBackend;
pub use docker::DockerBackend;
pub use registry::{EnvironmentHandle, EnvironmentRegistry, EnvironmentStatus, TeardownOutcome};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::config::{SandboxBackendKind, SandboxConfig};
use crate::error::{CapturedOutput, SandboxError};

/// Provider-assigned environment identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentId(String);

impl EnvironmentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parameters for creating an environment.
#[derive(Debug, Clone, Default)]
pub struct ProvisionRequest {
    pub name: String,
    /// Snapshot or pre-baked image. `None` means a fresh environment.
    pub snapshot: Option<String>,
    pub labels: BTreeMap<String, String>,
    /// Inactivity auto-stop applied from the moment of allocation.
    pub auto_stop_minutes: Option<u32>,
}

/// A file to place inside an environment. Relative paths resolve against
/// the environment's working directory.
#[derive(Debug, Clone)]
pub struct SandboxFile {
    pub path: String,
    pub bytes: Vec<u8>,
    pub executable: bool,
}

impl SandboxFile {
    pub fn new(path: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            bytes,
            executable: false,
        }
    }

    pub fn executable(mut self) -> Self {
        self.executable = true;
        self
    }
}

/// A command to run inside an environment.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub argv: Vec<String>,
    /// Bound for this invocation only.
    pub env: Vec<(String, SecretString)>,
    pub working_dir: Option<String>,
    pub timeout: Option<Duration>,
}

impl ExecRequest {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: SecretString) -> Self {
        self.env.push((key.into(), value));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Result of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

impl From<ExecOutput> for CapturedOutput {
    fn from(output: ExecOutput) -> Self {
        Self {
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        }
    }
}

/// One sandbox provider.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Short provider name, reported by `/health`.
    fn name(&self) -> &'static str;

    /// Whether the provider is reachable.
    async fn health_check(&self) -> Result<(), SandboxError>;

    /// Allocate an environment and return its id as soon as the provider
    /// has assigned one. The environment may not be usable yet.
    async fn allocate(&self, request: &ProvisionRequest) -> Result<EnvironmentId, SandboxError>;

    /// Wait until an allocated environment accepts commands.
    async fn wait_ready(&self, id: &EnvironmentId) -> Result<(), SandboxError>;

    /// Ask the provider to stop the environment after `minutes` of inactivity.
    async fn set_auto_stop(&self, id: &EnvironmentId, minutes: u32) -> Result<(), SandboxError>;

    async fn upload(&self, id: &EnvironmentId, file: &SandboxFile) -> Result<(), SandboxError>;

    async fn exec(
        &self,
        id: &EnvironmentId,
        request: &ExecRequest,
    ) -> Result<ExecOutput, SandboxError>;

    async fn download(&self, id: &EnvironmentId, path: &str) -> Result<Vec<u8>, SandboxError>;

    async fn destroy(&self, id: &EnvironmentId) -> Result<(), SandboxError>;
}

/// Create the configured backend.
pub async fn create_backend(
    config: &SandboxConfig,
) -> Result<Arc<dyn SandboxBackend>, SandboxError> {
    match config.backend {
        SandboxBackendKind::Daytona => {
            let daytona = config.daytona.clone().ok_or_else(|| SandboxError::Connection {
                backend: "daytona".to_string(),
                reason: "missing daytona configuration".to_string(),
            })?;
            Ok(Arc::new(DaytonaBackend::new(daytona)?))
        }
        SandboxBackendKind::Docker => {
            let docker = config.docker.clone().unwrap_or_default();
            Ok(Arc::new(DockerBackend::connect(docker).await?))
        }
    }
}

/// Join a relative path onto a working directory.
pub(crate) fn resolve_path(workdir: &str, path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", workdir.trim_end_matches('/'), path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_path_joins_relative() {
        assert_eq!(resolve_path("/workspace", "input.json"), "/workspace/input.json");
        assert_eq!(resolve_path("/workspace/", "a/b"), "/workspace/a/b");
        assert_eq!(resolve_path("/workspace", "/etc/hosts"), "/etc/hosts");
    }

    #[test]
    fn environment_id_serializes_as_string() {
        let id = EnvironmentId::new("sbx-123");
        assert_eq!(serde_json::to_value(&id).unwrap(), serde_json::json!("sbx-123"));
        assert_eq!(id.to_string(), "sbx-123");
    }

    #[test]
    fn exec_output_converts_to_captured() {
        let output = ExecOutput {
            exit_code: 2,
            stdout: "out".to_string(),
            stderr: "err".to_string(),
        };
        assert!(!output.success());
        let captured: CapturedOutput = output.into();
        assert_eq!(captured.exit_code, 2);
        assert_eq!(captured.stderr, "err");
    }
}
