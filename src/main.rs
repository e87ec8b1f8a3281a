//! treasury-sim - main entry point.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use treasury_sim::{
    config::Config,
    orchestrator::{AppState, JobExecutor, RunnerProgram, SimulationResponse, serve},
    runner,
    sandbox::{EnvironmentRegistry, create_backend},
    simulation::SimulationRequest,
};

#[derive(Parser, Debug)]
#[command(name = "treasury-sim")]
#[command(about = "Runs treasury simulations in disposable sandboxes")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP service (default)
    Serve,

    /// Run one simulation from an input document (executed inside a sandbox)
    Runner {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },

    /// Compute metrics for a request file in-process and print them
    Local {
        #[arg(long)]
        input: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load .env first so LOG_LEVEL and RUST_LOG from it reach the filter.
    let _ = dotenvy::dotenv();

    // Logs always go to stderr; stdout is reserved for command output.
    let default_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "treasury_sim={},tower_http=info",
            default_level.to_lowercase()
        ))
    });
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => run_service().await,
        Command::Runner { input, output } => {
            runner::run(&input, &output).await?;
            Ok(())
        }
        Command::Local { input } => run_local(&input).await,
    }
}

async fn run_service() -> anyhow::Result<()> {
    tracing::info!("Starting treasury-sim...");

    let config = Config::from_env()?;

    let backend = create_backend(&config.sandbox).await?;
    let registry = Arc::new(EnvironmentRegistry::new(backend));
    tracing::info!("Sandbox backend initialized: {}", registry.backend_name());

    let program = RunnerProgram::load(config.job.runner_binary.as_deref())
        .await
        .context("failed to load runner program")?;

    if config.advisory.is_enabled() {
        tracing::info!(model = %config.advisory.model, "Advisory enabled");
    } else {
        tracing::info!("Advisory disabled (no ANTHROPIC_API_KEY)");
    }

    let executor = JobExecutor::new(Arc::clone(&registry), program, config.job.clone())
        .with_snapshot(config.sandbox.snapshot.clone())
        .with_advisory_key(config.advisory.api_key.clone());
    let state = AppState::new(Arc::new(executor));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| {
            format!(
                "invalid listen address {}:{}",
                config.server.host, config.server.port
            )
        })?;

    serve(addr, state, shutdown_signal()).await?;

    tracing::info!("Shutting down, tearing down remaining environments");
    registry.teardown_all().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn run_local(input: &Path) -> anyhow::Result<()> {
    let bytes = tokio::fs::read(input)
        .await
        .with_context(|| format!("failed to read {}", input.display()))?;
    let request: SimulationRequest = serde_json::from_slice(&bytes)?;
    request.validate().map_err(anyhow::Error::msg)?;

    let response = SimulationResponse::local(request.compute_metrics());
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
