//! The program executed inside each sandbox.
//!
//! `treasury-sim runner --input input.json --output results.json` reads a
//! [`SimulationRequest`], runs the calculation engine and the advisory step,
//! and writes a [`ResultDocument`]. It is the same binary as the service, so
//! local and remote metrics come from the same compiled code.

mod document;

pub use document::{ResultDocument, SCHEMA_VERSION};

use std::path::Path;

use crate::advisory::Advisor;
use crate::config::AdvisoryConfig;
use crate::llm::create_llm_provider;
use crate::simulation::SimulationRequest;

/// Working file names inside the sandbox.
pub const INPUT_FILE: &str = "input.json";
pub const OUTPUT_FILE: &str = "results.json";

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Invalid input document: {0}")]
    InvalidInput(String),

    #[error("Failed to encode result document: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] crate::error::ConfigError),

    #[error(transparent)]
    Llm(#[from] crate::error::LlmError),
}

/// Turn an input document into an encoded result document.
pub async fn process_input(input: &[u8], advisor: &Advisor) -> Result<Vec<u8>, RunnerError> {
    let request: SimulationRequest =
        serde_json::from_slice(input).map_err(|e| RunnerError::InvalidInput(e.to_string()))?;
    request.validate().map_err(RunnerError::InvalidInput)?;

    tracing::info!(mode = %request.mode, accounts = request.accounts.len(), "Computing metrics");
    let metrics = request.compute_metrics();

    let advisory = advisor
        .analyze(
            &metrics,
            request.mode,
            &request.accounts,
            &request.policy,
            &request.forecast,
        )
        .await;

    let document = ResultDocument::new(metrics, Some(advisory));
    Ok(serde_json::to_vec_pretty(&document)?)
}

/// Entry point of the `runner` subcommand.
///
/// The advisory credential is read from the process environment, where the
/// orchestrator binds it for this invocation only.
pub async fn run(input: &Path, output: &Path) -> Result<(), RunnerError> {
    let bytes = tokio::fs::read(input).await.map_err(|source| RunnerError::Io {
        path: input.display().to_string(),
        source,
    })?;

    let config = AdvisoryConfig::resolve()?;
    let advisor = Advisor::new(create_llm_provider(&config)?).with_max_tokens(config.max_tokens);

    let encoded = process_input(&bytes, &advisor).await?;
    tokio::fs::write(output, encoded)
        .await
        .map_err(|source| RunnerError::Io {
            path: output.display().to_string(),
            source,
        })?;

    tracing::info!(output = %output.display(), "Result document written");
    Ok(())
}
