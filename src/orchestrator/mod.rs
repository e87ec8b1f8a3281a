//! Ephemeral job orchestration.
//!
//! ```text
//! ┌────────────────────────────────────────────────────┐
//! │  HTTP API                                          │
//! │    POST /simulate            -> JobExecutor        │
//! │    POST /simulate/parallel   -> ParallelDispatcher │
//! │    POST /simulate/local      -> simulation::compute│
//! │                                                    │
//! │  JobExecutor (one per job)                         │
//! │    provision -> transfer -> remote-exec ->         │
//! │    retrieve -> parse -> validate, then teardown    │
//! │                                                    │
//! │  EnvironmentRegistry                               │
//! │    owns every environment handle                   │
//! └────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod dispatcher;
pub mod executor;

pub use api::{AppState, router, serve, start_server};
pub use dispatcher::{ParallelDispatcher, ParallelOutcome, job_labels};
pub use executor::{JobExecutor, JobRunner, RUNNER_FILE, RunnerProgram, SimulationResponse};
