pub mod claude_tool_provider;

use std::sync::Arc;

use parsec_core::config::LlmConfig;
use parsec_core::ConfigError;
use parsec_tool_runtime::ToolAwareLlmProvider;

/// Build the streaming tool-use provider from config.
pub fn create_tool_provider(
    llm_config: &LlmConfig,
) -> Result<Arc<dyn ToolAwareLlmProvider>, ConfigError> {
    let provider = claude_tool_provider::ClaudeToolProvider::from_config(llm_config)?;
    tracing::info!(model = %llm_config.model, "LLM provider ready");
    Ok(Arc::new(provider))
}
