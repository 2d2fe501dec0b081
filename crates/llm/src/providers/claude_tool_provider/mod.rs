//! Claude (Anthropic API) implementation of [`ToolAwareLlmProvider`].
//!
//! Supports streaming tool use via SSE, translating between the Anthropic Messages
//! API format and the provider-agnostic [`StreamEvent`] / [`Turn`] types.
//!
//! [`ToolAwareLlmProvider`]: parsec_tool_runtime::ToolAwareLlmProvider
//! [`StreamEvent`]: parsec_tool_runtime::StreamEvent
//! [`Turn`]: parsec_tool_runtime::Turn

mod sse;
mod streaming;
mod translate;

pub use self::streaming::ClaudeToolProvider;

#[cfg(test)]
mod tests;
