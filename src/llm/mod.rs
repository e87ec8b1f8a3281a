//! LLM integration for the advisory step.
//!
//! Uses the Anthropic Messages API as the reasoning provider.

mod anthropic;
mod provider;

pub use anthropic::AnthropicProvider;
pub use provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role,
};

use std::sync::Arc;

use crate::config::AdvisoryConfig;
use crate::error::LlmError;

/// Create the advisory provider, or `None` when no credential is configured.
pub fn create_llm_provider(
    config: &AdvisoryConfig,
) -> Result<Option<Arc<dyn LlmProvider>>, LlmError> {
    Ok(AnthropicProvider::from_config(config)?
        .map(|provider| Arc::new(provider) as Arc<dyn LlmProvider>))
}
