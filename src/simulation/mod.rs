//! Treasury simulation model and calculation engine.

pub mod engine;
mod types;

pub use engine::compute;
pub use types::{
    Account, AccountCategory, ForecastItem, Metrics, Policy, SimulationMode,
    SimulationParameters, SimulationRequest, TransferDetails,
};

impl SimulationRequest {
    /// Run the calculation engine on this request.
    pub fn compute_metrics(&self) -> Metrics {
        compute(
            self.mode,
            &self.accounts,
            &self.forecast,
            &self.policy,
            self.parameters.as_ref(),
        )
    }
}
