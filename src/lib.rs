//! Treasury simulations in disposable sandboxes.
//!
//! Each simulation job gets its own environment. The service ships the job's
//! input and the runner program in, runs it under a deadline, pulls the
//! result document back out and tears the environment down.

pub mod advisory;
pub mod config;
pub mod error;
pub mod llm;
pub mod orchestrator;
pub mod runner;
pub mod sandbox;
pub mod simulation;
pub mod testing;
