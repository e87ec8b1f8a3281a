//! Error types for treasury-sim.

use std::time::Duration;

use crate::sandbox::EnvironmentId;

/// Configuration errors raised while resolving environment variables.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key} ({hint})")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors from the advisory reasoning provider.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("{provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("{provider} rejected the credential")]
    AuthFailed { provider: String },

    #[error("{provider} rate limited the request")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("{provider} returned an invalid response: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

/// Errors from a sandbox backend or the environment registry.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("Failed to connect to {backend}: {reason}")]
    Connection { backend: String, reason: String },

    #[error("Failed to provision environment: {reason}")]
    ProvisionFailed { reason: String },

    #[error("Environment {id} is not active")]
    NotFound { id: EnvironmentId },

    #[error("Failed to set auto-stop on {id}: {reason}")]
    AutoStopFailed { id: EnvironmentId, reason: String },

    #[error("Failed to upload {path} to {id}: {reason}")]
    UploadFailed {
        id: EnvironmentId,
        path: String,
        reason: String,
    },

    #[error("Failed to execute command in {id}: {reason}")]
    ExecFailed { id: EnvironmentId, reason: String },

    #[error("Failed to download {path} from {id}: {reason}")]
    DownloadFailed {
        id: EnvironmentId,
        path: String,
        reason: String,
    },

    #[error("Failed to destroy environment {id}: {reason}")]
    DestroyFailed { id: EnvironmentId, reason: String },
}

/// The step of a job in which an execution error happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobPhase {
    Provision,
    Transfer,
    RemoteExec,
    Retrieve,
    Parse,
    Validate,
}

impl JobPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provision => "provision",
            Self::Transfer => "transfer",
            Self::RemoteExec => "remote-exec",
            Self::Retrieve => "retrieve",
            Self::Parse => "parse",
            Self::Validate => "validate",
        }
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Standard output and standard error captured from a remote invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

/// A job failed in one of its phases.
#[derive(Debug, thiserror::Error)]
#[error("{phase} failed: {cause}")]
pub struct ExecutionError {
    pub phase: JobPhase,
    pub cause: String,
    /// Present for `remote-exec` failures.
    pub output: Option<CapturedOutput>,
    /// The job's environment, if one was provisioned.
    pub environment_id: Option<EnvironmentId>,
}

impl ExecutionError {
    pub fn new(phase: JobPhase, cause: impl std::fmt::Display) -> Self {
        Self {
            phase,
            cause: cause.to_string(),
            output: None,
            environment_id: None,
        }
    }

    pub fn with_output(mut self, output: CapturedOutput) -> Self {
        self.output = Some(output);
        self
    }
}

/// Outcome of a failed `JobExecutor::run`.
///
/// `Timeout` is kept apart from `Execution` so callers can tell a job that
/// ran and failed from one that never finished.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("Simulation timed out after {} seconds", .after.as_secs())]
    Timeout {
        after: Duration,
        environment_id: Option<EnvironmentId>,
    },
}

impl JobError {
    /// The environment the job ran in, if it got that far.
    pub fn environment_id(&self) -> Option<&EnvironmentId> {
        match self {
            Self::Execution(e) => e.environment_id.as_ref(),
            Self::Timeout { environment_id, .. } => environment_id.as_ref(),
        }
    }

    /// A single-line description including captured remote output.
    pub fn describe(&self) -> String {
        match self {
            Self::Execution(ExecutionError {
                output: Some(output),
                ..
            }) => {
                let mut message = format!("{}: {}", self, output.stdout.trim());
                if !output.stderr.trim().is_empty() {
                    message.push_str(&format!("\nstderr: {}", output.stderr.trim()));
                }
                message
            }
            _ => self.to_string(),
        }
    }
}
