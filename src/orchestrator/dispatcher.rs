//! Fans a batch of simulation requests out to independent jobs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;

use crate::orchestrator::executor::{JobRunner, SimulationResponse};
use crate::simulation::SimulationRequest;

/// Results of a parallel batch, keyed by job label.
#[derive(Debug, Default)]
pub struct ParallelOutcome {
    pub results: BTreeMap<String, SimulationResponse>,
    pub errors: BTreeMap<String, String>,
    pub total_elapsed: Duration,
}

/// Label each request by its mode. Repeated modes get `-2`, `-3`, ...
pub fn job_labels(requests: &[SimulationRequest]) -> Vec<String> {
    let mut seen: HashMap<&'static str, usize> = HashMap::new();
    requests
        .iter()
        .map(|request| {
            let mode = request.mode.as_str();
            let count = seen.entry(mode).or_insert(0);
            *count += 1;
            if *count == 1 {
                mode.to_string()
            } else {
                format!("{}-{}", mode, count)
            }
        })
        .collect()
}

/// Runs every job of a batch concurrently, each in its own environment.
///
/// One job failing, timing out, or panicking never affects the others.
#[derive(Clone)]
pub struct ParallelDispatcher {
    runner: Arc<dyn JobRunner>,
    deadline: Duration,
}

impl ParallelDispatcher {
    pub fn new(runner: Arc<dyn JobRunner>, deadline: Duration) -> Self {
        Self { runner, deadline }
    }

    pub async fn run_all(&self, requests: Vec<SimulationRequest>) -> ParallelOutcome {
        let started = Instant::now();
        let labels = job_labels(&requests);
        tracing::info!(jobs = requests.len(), "Dispatching parallel simulations");

        let mut tasks = JoinSet::new();
        let mut task_labels = HashMap::new();
        for (label, request) in labels.into_iter().zip(requests) {
            let runner = Arc::clone(&self.runner);
            let deadline = self.deadline;
            let handle = tasks.spawn(async move { runner.run(&request, deadline).await });
            task_labels.insert(handle.id(), label);
        }

        let mut outcome = ParallelOutcome::default();
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((task_id, result)) => {
                    let label = task_labels
                        .remove(&task_id)
                        .unwrap_or_else(|| task_id.to_string());
                    match result {
                        Ok(response) => {
                            outcome.results.insert(label, response);
                        }
                        Err(e) => {
                            outcome.errors.insert(label, e.describe());
                        }
                    }
                }
                Err(join_error) => {
                    let task_id = join_error.id();
                    let label = task_labels
                        .remove(&task_id)
                        .unwrap_or_else(|| task_id.to_string());
                    tracing::error!(job = %label, error = %join_error, "Simulation job aborted");
                    let reason = if join_error.is_panic() {
                        "job panicked".to_string()
                    } else {
                        "job was cancelled".to_string()
                    };
                    outcome.errors.insert(label, reason);
                }
            }
        }

        outcome.total_elapsed = started.elapsed();
        tracing::info!(
            succeeded = outcome.results.len(),
            failed = outcome.errors.len(),
            elapsed_ms = outcome.total_elapsed.as_millis() as u64,
            "Parallel simulations finished"
        );
        outcome
    }
}
