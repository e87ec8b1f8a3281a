//! Runs one simulation job in its own disposable environment.
//!
//! A job walks through provision, transfer, remote-exec, retrieve, parse
//! and validate under a single deadline. Whatever happens, the environment
//! is torn down afterwards unless auto-cleanup is off.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::advisory::Advisory;
use crate::config::{AdvisoryConfig, JobConfig};
use crate::error::{ExecutionError, JobError, JobPhase};
use crate::runner::{INPUT_FILE, OUTPUT_FILE, ResultDocument};
use crate::sandbox::{EnvironmentId, EnvironmentRegistry, ExecRequest, SandboxFile};
use crate::simulation::{Metrics, SimulationRequest};

/// File name of the runner program inside an environment.
pub const RUNNER_FILE: &str = "treasury-sim";

/// Outcome of a successful job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationResponse {
    #[serde(flatten)]
    pub metrics: Metrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advisory: Option<Advisory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<EnvironmentId>,
    /// True when auto-cleanup is off and the environment was left running.
    #[serde(default)]
    pub environment_retained: bool,
}

impl SimulationResponse {
    /// A response computed in-process, with no environment involved.
    pub fn local(metrics: Metrics) -> Self {
        Self {
            metrics,
            advisory: None,
            sandbox_id: None,
            environment_retained: false,
        }
    }
}

/// The program shipped into every environment.
#[derive(Clone)]
pub struct RunnerProgram {
    bytes: Arc<Vec<u8>>,
}

impl RunnerProgram {
    /// Load the runner from `path`, or the running executable when `None`.
    pub async fn load(path: Option<&Path>) -> std::io::Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => std::env::current_exe()?,
        };
        let bytes = tokio::fs::read(&path).await?;
        tracing::info!(path = %path.display(), bytes = bytes.len(), "Loaded runner program");
        Ok(Self::from_bytes(bytes))
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(bytes),
        }
    }
}

/// Something that can run one simulation job.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(
        &self,
        request: &SimulationRequest,
        deadline: Duration,
    ) -> Result<SimulationResponse, JobError>;
}

pub struct JobExecutor {
    registry: Arc<EnvironmentRegistry>,
    program: RunnerProgram,
    job: JobConfig,
    snapshot: Option<String>,
    /// Bound into the runner invocation only.
    advisory_key: Option<SecretString>,
}

impl JobExecutor {
    pub fn new(
        registry: Arc<EnvironmentRegistry>,
        program: RunnerProgram,
        job: JobConfig,
    ) -> Self {
        Self {
            registry,
            program,
            job,
            snapshot: None,
            advisory_key: None,
        }
    }

    pub fn with_snapshot(mut self, snapshot: Option<String>) -> Self {
        self.snapshot = snapshot;
        self
    }

    pub fn with_advisory_key(mut self, key: Option<SecretString>) -> Self {
        self.advisory_key = key;
        self
    }

    pub fn registry(&self) -> &Arc<EnvironmentRegistry> {
        &self.registry
    }

    /// Default per-job deadline.
    pub fn default_deadline(&self) -> Duration {
        self.job.timeout
    }

    async fn run_phases(
        &self,
        job_id: Uuid,
        request: &SimulationRequest,
        deadline: Duration,
        environment: &mut Option<EnvironmentId>,
    ) -> Result<ResultDocument, ExecutionError> {
        let name = format!("treasury-sim-{}-{}", request.mode, job_id.simple());
        let handle = self
            .registry
            .allocate(
                &name,
                self.snapshot.as_deref(),
                Some(self.job.auto_stop_minutes),
            )
            .await
            .map_err(|e| ExecutionError::new(JobPhase::Provision, e))?;
        let id = handle.id;
        // Recorded before startup so a deadline hit while starting still tears it down.
        *environment = Some(id.clone());
        self.registry
            .wait_ready(&id)
            .await
            .map_err(|e| ExecutionError::new(JobPhase::Provision, e))?;

        if let Err(e) = self
            .registry
            .set_inactivity_deadline(&id, self.job.auto_stop_minutes)
            .await
        {
            tracing::warn!(environment_id = %id, error = %e, "Could not set inactivity auto-stop");
        }

        if self.job.liveness_probe {
            match self.registry.exec(&id, &ExecRequest::new(["true"])).await {
                Ok(output) if output.success() => {}
                Ok(output) => tracing::warn!(
                    environment_id = %id,
                    exit_code = output.exit_code,
                    "Liveness probe exited non-zero"
                ),
                Err(e) => tracing::warn!(environment_id = %id, error = %e, "Liveness probe failed"),
            }
        }

        let input = serde_json::to_vec(request)
            .map_err(|e| ExecutionError::new(JobPhase::Transfer, e))?;
        self.registry
            .upload(&id, &SandboxFile::new(INPUT_FILE, input))
            .await
            .map_err(|e| ExecutionError::new(JobPhase::Transfer, e))?;
        self.registry
            .upload(
                &id,
                &SandboxFile::new(RUNNER_FILE, self.program.bytes.as_ref().clone()).executable(),
            )
            .await
            .map_err(|e| ExecutionError::new(JobPhase::Transfer, e))?;
        tracing::debug!(environment_id = %id, "Transferred input and runner");

        let program = format!("./{}", RUNNER_FILE);
        let mut invocation = ExecRequest::new([
            program.as_str(),
            "runner",
            "--input",
            INPUT_FILE,
            "--output",
            OUTPUT_FILE,
        ])
        .with_timeout(deadline);
        if let Some(key) = &self.advisory_key {
            invocation = invocation.with_env(AdvisoryConfig::API_KEY_ENV, key.clone());
        }

        let output = self
            .registry
            .exec(&id, &invocation)
            .await
            .map_err(|e| ExecutionError::new(JobPhase::RemoteExec, e))?;
        if !output.success() {
            return Err(ExecutionError::new(
                JobPhase::RemoteExec,
                format!("runner exited with code {}", output.exit_code),
            )
            .with_output(output.into()));
        }

        let bytes = self
            .registry
            .download(&id, OUTPUT_FILE)
            .await
            .map_err(|e| ExecutionError::new(JobPhase::Retrieve, e))?;

        let value: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|e| ExecutionError::new(JobPhase::Parse, e))?;
        if !value.is_object() {
            return Err(ExecutionError::new(
                JobPhase::Parse,
                "result is not a JSON object",
            ));
        }

        ResultDocument::from_value(value).map_err(|e| ExecutionError::new(JobPhase::Validate, e))
    }
}

#[async_trait]
impl JobRunner for JobExecutor {
    async fn run(
        &self,
        request: &SimulationRequest,
        deadline: Duration,
    ) -> Result<SimulationResponse, JobError> {
        let job_id = Uuid::new_v4();
        let started = Instant::now();
        tracing::info!(job_id = %job_id, mode = %request.mode, "Starting simulation job");

        let mut environment = None;
        let outcome = tokio::time::timeout(
            deadline,
            self.run_phases(job_id, request, deadline, &mut environment),
        )
        .await;

        let retained = !self.job.auto_cleanup;
        if let Some(id) = &environment {
            if retained {
                tracing::info!(environment_id = %id, "Auto-cleanup disabled, retaining environment");
            } else {
                let teardown = self.registry.remove(id).await;
                tracing::debug!(environment_id = %id, outcome = ?teardown, "Teardown finished");
            }
        }

        let elapsed = started.elapsed();
        match outcome {
            Ok(Ok(document)) => {
                tracing::info!(
                    job_id = %job_id,
                    mode = %request.mode,
                    elapsed_ms = elapsed.as_millis() as u64,
                    advisory = document.advisory.as_ref().is_some_and(|a| a.enabled),
                    "Simulation job completed"
                );
                Ok(SimulationResponse {
                    metrics: document.metrics,
                    advisory: document.advisory,
                    sandbox_id: environment,
                    environment_retained: retained,
                })
            }
            Ok(Err(mut e)) => {
                e.environment_id = environment;
                tracing::warn!(job_id = %job_id, phase = %e.phase, error = %e.cause, "Simulation job failed");
                Err(e.into())
            }
            Err(_) => {
                tracing::warn!(
                    job_id = %job_id,
                    timeout_secs = deadline.as_secs(),
                    "Simulation job timed out"
                );
                Err(JobError::Timeout {
                    after: deadline,
                    environment_id: environment,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{InMemorySandbox, StubLlm, sample_request};

    fn executor(backend: Arc<InMemorySandbox>, job: JobConfig) -> JobExecutor {
        let registry = Arc::new(EnvironmentRegistry::new(backend));
        JobExecutor::new(registry, RunnerProgram::from_bytes(b"runner".to_vec()), job)
    }

    fn deadline() -> Duration {
        Duration::from_secs(30)
    }

    #[tokio::test]
    async fn successful_job_tears_down_environment() {
        let backend = Arc::new(InMemorySandbox::new());
        let executor = executor(backend.clone(), JobConfig::default());

        let response = executor.run(&sample_request(), deadline()).await.unwrap();

        assert_eq!(response.metrics, sample_request().compute_metrics());
        assert!(!response.environment_retained);
        let id = response.sandbox_id.unwrap();
        assert_eq!(backend.destroyed(), vec![id]);
        assert!(executor.registry().list_active().await.is_empty());
        assert!(!response.advisory.unwrap().enabled);
    }

    #[tokio::test]
    async fn provision_failure_reports_phase() {
        let backend = Arc::new(InMemorySandbox::new());
        backend.fail_provisioning();
        let executor = executor(backend.clone(), JobConfig::default());

        let err = executor.run(&sample_request(), deadline()).await.unwrap_err();
        match err {
            JobError::Execution(e) => {
                assert_eq!(e.phase, JobPhase::Provision);
                assert!(e.environment_id.is_none());
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(backend.destroyed().is_empty());
    }

    #[tokio::test]
    async fn remote_failure_carries_output_and_tears_down() {
        let backend = Arc::new(InMemorySandbox::new());
        backend.fail_mode(sample_request().mode);
        let executor = executor(backend.clone(), JobConfig::default());

        let err = executor.run(&sample_request(), deadline()).await.unwrap_err();
        let id = err.environment_id().cloned().unwrap();
        match err {
            JobError::Execution(e) => {
                assert_eq!(e.phase, JobPhase::RemoteExec);
                let output = e.output.unwrap();
                assert_eq!(output.exit_code, 1);
                assert_eq!(output.stderr, "simulated runner failure");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(executor.registry().get(&id).await.is_none());
        assert_eq!(backend.destroyed(), vec![id]);
    }

    #[tokio::test]
    async fn download_failure_is_retrieve_phase() {
        let backend = Arc::new(InMemorySandbox::new());
        backend.fail_download();
        let executor = executor(backend.clone(), JobConfig::default());

        let err = executor.run(&sample_request(), deadline()).await.unwrap_err();
        assert!(matches!(err, JobError::Execution(ref e) if e.phase == JobPhase::Retrieve));
        assert_eq!(backend.active_count(), 0);
    }

    #[tokio::test]
    async fn malformed_result_is_parse_phase() {
        let backend = Arc::new(InMemorySandbox::new());
        backend.override_result("{truncated");
        let executor = executor(backend.clone(), JobConfig::default());

        let err = executor.run(&sample_request(), deadline()).await.unwrap_err();
        assert!(matches!(err, JobError::Execution(ref e) if e.phase == JobPhase::Parse));
    }

    #[tokio::test]
    async fn unexpected_keys_are_validate_phase() {
        let backend = Arc::new(InMemorySandbox::new());
        let mut document = serde_json::to_value(ResultDocument::new(
            sample_request().compute_metrics(),
            None,
        ))
        .unwrap();
        document["debugDump"] = serde_json::json!("oops");
        backend.override_result(serde_json::to_vec(&document).unwrap());
        let executor = executor(backend.clone(), JobConfig::default());

        let err = executor.run(&sample_request(), deadline()).await.unwrap_err();
        match err {
            JobError::Execution(e) => {
                assert_eq!(e.phase, JobPhase::Validate);
                assert!(e.cause.contains("debugDump"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(backend.active_count(), 0);
    }

    #[tokio::test]
    async fn timeout_tears_down_before_returning() {
        let backend = Arc::new(InMemorySandbox::new());
        backend.hang_runner();
        let executor = executor(backend.clone(), JobConfig::default());

        let err = executor
            .run(&sample_request(), Duration::from_millis(200))
            .await
            .unwrap_err();
        match &err {
            JobError::Timeout { after, environment_id } => {
                assert_eq!(*after, Duration::from_millis(200));
                let id = environment_id.clone().unwrap();
                assert_eq!(backend.destroyed(), vec![id]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(executor.registry().list_active().await.is_empty());
    }

    #[tokio::test]
    async fn deadline_during_startup_destroys_allocated_environment() {
        let backend = Arc::new(InMemorySandbox::new());
        backend.hang_start();
        let executor = executor(backend.clone(), JobConfig::default());

        let err = executor
            .run(&sample_request(), Duration::from_millis(200))
            .await
            .unwrap_err();
        let JobError::Timeout { environment_id, .. } = &err else {
            panic!("unexpected error: {err:?}");
        };
        assert!(environment_id.is_some());
        assert_eq!(backend.created_count(), 1);
        assert_eq!(backend.destroyed().len(), backend.created_count());
        assert_eq!(backend.active_count(), 0);
        assert!(executor.registry().list_active().await.is_empty());
    }

    #[tokio::test]
    async fn auto_cleanup_off_retains_environment() {
        let backend = Arc::new(InMemorySandbox::new());
        let job = JobConfig {
            auto_cleanup: false,
            ..JobConfig::default()
        };
        let executor = executor(backend.clone(), job);

        let response = executor.run(&sample_request(), deadline()).await.unwrap();
        assert!(response.environment_retained);
        let id = response.sandbox_id.unwrap();
        assert!(executor.registry().get(&id).await.is_some());
        assert!(backend.destroyed().is_empty());
    }

    #[tokio::test]
    async fn degraded_setup_steps_are_not_fatal() {
        let backend = Arc::new(InMemorySandbox::new());
        backend.fail_auto_stop();
        backend.fail_probe();
        let executor = executor(backend.clone(), JobConfig::default());

        assert!(executor.run(&sample_request(), deadline()).await.is_ok());
    }

    #[tokio::test]
    async fn teardown_failure_keeps_primary_outcome() {
        let backend = Arc::new(InMemorySandbox::new());
        backend.fail_destroy();
        let executor = executor(backend.clone(), JobConfig::default());

        let response = executor.run(&sample_request(), deadline()).await.unwrap();
        assert!(response.sandbox_id.is_some());
        assert!(executor.registry().list_active().await.is_empty());
    }

    #[tokio::test]
    async fn credential_is_bound_only_for_runner_invocation() {
        let backend = Arc::new(InMemorySandbox::new().with_llm(Arc::new(StubLlm::default())));
        let executor = executor(backend.clone(), JobConfig::default())
            .with_advisory_key(Some(SecretString::from("sk-ant-test".to_string())));

        let response = executor.run(&sample_request(), deadline()).await.unwrap();
        assert!(response.advisory.unwrap().enabled);

        // probe, then runner
        let envs = backend.exec_env_keys();
        assert_eq!(envs.len(), 2);
        assert!(envs[0].is_empty());
        assert_eq!(envs[1], vec![AdvisoryConfig::API_KEY_ENV.to_string()]);
    }

    #[tokio::test]
    async fn snapshot_fallback_still_runs() {
        let backend = Arc::new(InMemorySandbox::new());
        backend.fail_snapshot_creation();
        let executor = executor(backend.clone(), JobConfig::default())
            .with_snapshot(Some("treasury-runner".to_string()));

        assert!(executor.run(&sample_request(), deadline()).await.is_ok());
        assert_eq!(backend.created_count(), 1);
    }
}
