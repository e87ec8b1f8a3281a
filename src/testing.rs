//! Test doubles shared by unit and integration tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::advisory::Advisor;
use crate::config::AdvisoryConfig;
use crate::error::{LlmError, SandboxError};
use crate::llm::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
use crate::runner;
use crate::sandbox::{
    EnvironmentId, ExecOutput, ExecRequest, ProvisionRequest, SandboxBackend, SandboxFile,
    resolve_path,
};
use crate::simulation::{
    Account, AccountCategory, ForecastItem, Policy, SimulationMode, SimulationRequest,
};

/// LLM provider returning a canned reply or a canned error.
pub struct StubLlm {
    reply: Result<String, String>,
    calls: AtomicUsize,
}

impl StubLlm {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: Ok(reply.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            reply: Err(reason.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for StubLlm {
    fn default() -> Self {
        Self::new(
            "RECOMMENDATION: Proceed with the transfer.\n\
             REASONING: Coverage comfortably exceeds the policy minimum.\n\
             RISK_ASSESSMENT: LOW - ample liquidity\n\
             CONFIDENCE: 0.85",
        )
    }
}

#[async_trait]
impl LlmProvider for StubLlm {
    fn model_name(&self) -> &str {
        "stub-model"
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.reply {
            Ok(text) => Ok(CompletionResponse {
                content: text.clone(),
                input_tokens: 0,
                output_tokens: 0,
                finish_reason: FinishReason::Stop,
            }),
            Err(reason) => Err(LlmError::RequestFailed {
                provider: "stub".to_string(),
                reason: reason.clone(),
            }),
        }
    }
}

const WORKDIR: &str = "/workspace";

#[derive(Default)]
struct SandboxState {
    next_id: u64,
    environments: HashMap<EnvironmentId, HashMap<String, (Vec<u8>, bool)>>,
    created: usize,
    destroyed: Vec<EnvironmentId>,
    exec_env_keys: Vec<Vec<String>>,
    fail_provision: bool,
    fail_snapshot: bool,
    fail_auto_stop: bool,
    fail_probe: bool,
    fail_destroy: bool,
    fail_download: bool,
    hang_runner: bool,
    hang_start: bool,
    fail_modes: HashSet<SimulationMode>,
    result_override: Option<Vec<u8>>,
}

/// In-process sandbox backend.
///
/// Environments are maps of files. Executing the uploaded runner program
/// runs the real runner code in-process against those files, so results are
/// the ones a real sandbox would produce. Failures are injected per
/// instance.
#[derive(Default)]
pub struct InMemorySandbox {
    state: Mutex<SandboxState>,
    llm: Option<Arc<dyn LlmProvider>>,
}

impl InMemorySandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider used by the runner when the advisory credential is bound.
    pub fn with_llm(mut self, llm: Arc<dyn LlmProvider>) -> Self {
        self.llm = Some(llm);
        self
    }

    fn state(&self) -> MutexGuard<'_, SandboxState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn fail_provisioning(&self) {
        self.state().fail_provision = true;
    }

    pub fn fail_snapshot_creation(&self) {
        self.state().fail_snapshot = true;
    }

    pub fn fail_auto_stop(&self) {
        self.state().fail_auto_stop = true;
    }

    pub fn fail_probe(&self) {
        self.state().fail_probe = true;
    }

    pub fn fail_destroy(&self) {
        self.state().fail_destroy = true;
    }

    pub fn fail_download(&self) {
        self.state().fail_download = true;
    }

    /// Allocated environments never finish starting.
    pub fn hang_start(&self) {
        self.state().hang_start = true;
    }

    /// Runner invocations never finish.
    pub fn hang_runner(&self) {
        self.state().hang_runner = true;
    }

    /// Runner invocations for `mode` exit non-zero.
    pub fn fail_mode(&self, mode: SimulationMode) {
        self.state().fail_modes.insert(mode);
    }

    /// Replace whatever the runner writes with `bytes`.
    pub fn override_result(&self, bytes: impl Into<Vec<u8>>) {
        self.state().result_override = Some(bytes.into());
    }

    pub fn created_count(&self) -> usize {
        self.state().created
    }

    pub fn active_count(&self) -> usize {
        self.state().environments.len()
    }

    pub fn destroyed(&self) -> Vec<EnvironmentId> {
        self.state().destroyed.clone()
    }

    /// Environment variable names bound on each exec, in order.
    pub fn exec_env_keys(&self) -> Vec<Vec<String>> {
        self.state().exec_env_keys.clone()
    }

    fn missing(id: &EnvironmentId) -> SandboxError {
        SandboxError::NotFound { id: id.clone() }
    }

    fn read_file(&self, id: &EnvironmentId, path: &str) -> Option<(Vec<u8>, bool)> {
        self.state()
            .environments
            .get(id)
            .and_then(|files| files.get(&resolve_path(WORKDIR, path)).cloned())
    }

    async fn run_runner(&self, id: &EnvironmentId, request: &ExecRequest) -> ExecOutput {
        let arg = |flag: &str| {
            request
                .argv
                .iter()
                .position(|a| a == flag)
                .and_then(|i| request.argv.get(i + 1))
                .cloned()
        };
        let (Some(input_path), Some(output_path)) = (arg("--input"), arg("--output")) else {
            return ExecOutput {
                exit_code: 2,
                stderr: "usage: runner --input <path> --output <path>".to_string(),
                ..Default::default()
            };
        };

        let Some((input, _)) = self.read_file(id, &input_path) else {
            return ExecOutput {
                exit_code: 1,
                stderr: format!("{}: no such file", input_path),
                ..Default::default()
            };
        };

        let (hang, failing) = {
            let state = self.state();
            let mode = serde_json::from_slice::<SimulationRequest>(&input)
                .map(|r| r.mode)
                .ok();
            (
                state.hang_runner,
                mode.is_some_and(|m| state.fail_modes.contains(&m)),
            )
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if failing {
            return ExecOutput {
                exit_code: 1,
                stdout: "Computing metrics\n".to_string(),
                stderr: "simulated runner failure".to_string(),
            };
        }

        let has_key = request
            .env
            .iter()
            .any(|(key, _)| key == AdvisoryConfig::API_KEY_ENV);
        let advisor = Advisor::new(if has_key { self.llm.clone() } else { None });

        let bytes = match runner::process_input(&input, &advisor).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return ExecOutput {
                    exit_code: 1,
                    stderr: e.to_string(),
                    ..Default::default()
                };
            }
        };

        let mut state = self.state();
        let bytes = state.result_override.clone().unwrap_or(bytes);
        if let Some(files) = state.environments.get_mut(id) {
            files.insert(resolve_path(WORKDIR, &output_path), (bytes, false));
        }
        ExecOutput::default()
    }
}

#[async_trait]
impl SandboxBackend for InMemorySandbox {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn health_check(&self) -> Result<(), SandboxError> {
        Ok(())
    }

    async fn allocate(&self, request: &ProvisionRequest) -> Result<EnvironmentId, SandboxError> {
        let mut state = self.state();
        if state.fail_provision {
            return Err(SandboxError::ProvisionFailed {
                reason: "provider unavailable".to_string(),
            });
        }
        if request.snapshot.is_some() && state.fail_snapshot {
            return Err(SandboxError::ProvisionFailed {
                reason: "snapshot not found".to_string(),
            });
        }
        state.next_id += 1;
        state.created += 1;
        let id = EnvironmentId::new(format!("mem-{}", state.next_id));
        state.environments.insert(id.clone(), HashMap::new());
        Ok(id)
    }

    async fn wait_ready(&self, id: &EnvironmentId) -> Result<(), SandboxError> {
        let hang = {
            let state = self.state();
            if !state.environments.contains_key(id) {
                return Err(Self::missing(id));
            }
            state.hang_start
        };
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn set_auto_stop(&self, id: &EnvironmentId, _minutes: u32) -> Result<(), SandboxError> {
        let state = self.state();
        if !state.environments.contains_key(id) {
            return Err(Self::missing(id));
        }
        if state.fail_auto_stop {
            return Err(SandboxError::AutoStopFailed {
                id: id.clone(),
                reason: "not supported".to_string(),
            });
        }
        Ok(())
    }

    async fn upload(&self, id: &EnvironmentId, file: &SandboxFile) -> Result<(), SandboxError> {
        let mut state = self.state();
        let files = state
            .environments
            .get_mut(id)
            .ok_or_else(|| Self::missing(id))?;
        files.insert(
            resolve_path(WORKDIR, &file.path),
            (file.bytes.clone(), file.executable),
        );
        Ok(())
    }

    async fn exec(
        &self,
        id: &EnvironmentId,
        request: &ExecRequest,
    ) -> Result<ExecOutput, SandboxError> {
        {
            let mut state = self.state();
            if !state.environments.contains_key(id) {
                return Err(Self::missing(id));
            }
            state
                .exec_env_keys
                .push(request.env.iter().map(|(k, _)| k.clone()).collect());
        }

        let Some(program) = request.argv.first() else {
            return Err(SandboxError::ExecFailed {
                id: id.clone(),
                reason: "empty command".to_string(),
            });
        };

        if program == "true" {
            let exit_code = if self.state().fail_probe { 1 } else { 0 };
            return Ok(ExecOutput {
                exit_code,
                ..Default::default()
            });
        }

        match self.read_file(id, program) {
            Some((_, true)) if request.argv.get(1).map(String::as_str) == Some("runner") => {
                Ok(self.run_runner(id, request).await)
            }
            Some((_, false)) => Ok(ExecOutput {
                exit_code: 126,
                stderr: format!("{}: permission denied", program),
                ..Default::default()
            }),
            _ => Ok(ExecOutput {
                exit_code: 127,
                stderr: format!("{}: not found", program),
                ..Default::default()
            }),
        }
    }

    async fn download(&self, id: &EnvironmentId, path: &str) -> Result<Vec<u8>, SandboxError> {
        if self.state().fail_download {
            return Err(SandboxError::DownloadFailed {
                id: id.clone(),
                path: path.to_string(),
                reason: "connection reset".to_string(),
            });
        }
        self.read_file(id, path)
            .map(|(bytes, _)| bytes)
            .ok_or_else(|| SandboxError::DownloadFailed {
                id: id.clone(),
                path: path.to_string(),
                reason: "no such file".to_string(),
            })
    }

    async fn destroy(&self, id: &EnvironmentId) -> Result<(), SandboxError> {
        let mut state = self.state();
        if state.fail_destroy {
            return Err(SandboxError::DestroyFailed {
                id: id.clone(),
                reason: "provider error".to_string(),
            });
        }
        if state.environments.remove(id).is_none() {
            return Err(Self::missing(id));
        }
        state.destroyed.push(id.clone());
        Ok(())
    }
}

/// The conservative scenario used across tests: 100k checking, 50k
/// high-yield, 10k inflow and 2k daily outflow over a week, 20k minimum
/// liquidity, 50k invest-above.
pub fn sample_request() -> SimulationRequest {
    SimulationRequest {
        mode: SimulationMode::Conservative,
        accounts: vec![
            Account {
                id: "acc-1".to_string(),
                name: "Operating".to_string(),
                bank: "First Bank".to_string(),
                currency: "USD".to_string(),
                balance: 100_000.0,
                account_type: AccountCategory::Checking,
            },
            Account {
                id: "acc-2".to_string(),
                name: "Yield".to_string(),
                bank: "First Bank".to_string(),
                currency: "USD".to_string(),
                balance: 50_000.0,
                account_type: AccountCategory::HighYield,
            },
        ],
        forecast: [2_000.0, 1_000.0, 1_500.0, 1_500.0, 1_000.0, 2_000.0, 1_000.0]
            .into_iter()
            .enumerate()
            .map(|(n, inflow)| ForecastItem {
                id: format!("f{}", n),
                date: format!("2025-01-{:02}", n + 1),
                inflow,
                outflow: 2_000.0,
                description: None,
            })
            .collect(),
        policy: Policy {
            id: "pol-1".to_string(),
            name: "Default".to_string(),
            min_liquidity: 20_000.0,
            invest_above: 50_000.0,
            risk_profile: "moderate".to_string(),
        },
        parameters: None,
    }
}

/// `sample_request` under a different mode.
pub fn sample_request_with_mode(mode: SimulationMode) -> SimulationRequest {
    SimulationRequest {
        mode,
        ..sample_request()
    }
}
