//! [`ToolAwareLlmProvider`] trait implementation for the Claude streaming API.

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::fmt::Display;
use tracing::debug;

use parsec_core::config::LlmConfig;
use parsec_core::ConfigError;
use parsec_tool_runtime::{
    EventStream, LlmError, StreamEvent, ToolAwareLlmProvider, ToolDefinition, Turn,
};

use super::sse::{BlockTracker, SseDecoder};
use super::translate::{tool_definition_to_claude, turns_to_claude};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Claude (Anthropic) provider with streaming tool-use support.
///
/// Uses the Anthropic Messages API (`/v1/messages`) with `stream: true` to emit
/// incremental [`StreamEvent`]s that the orchestrator consumes.
pub struct ClaudeToolProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl ClaudeToolProvider {
    /// Create a new Claude tool provider.
    ///
    /// # Arguments
    /// * `api_key` - Anthropic API key
    /// * `model` - Model name (e.g. `"claude-sonnet-4-20250514"`)
    /// * `base_url` - API base URL (e.g. `"https://api.anthropic.com"`)
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, ConfigError> {
        let api_key = config.require_api_key()?;
        Ok(Self::new(
            api_key.to_string(),
            config.model.clone(),
            config.base_url.clone(),
        ))
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub(super) fn request_body(
        &self,
        messages: &[Turn],
        system_prompt: Option<&str>,
        tools: &[ToolDefinition],
        temperature: f32,
        max_tokens: u32,
    ) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": turns_to_claude(messages),
            "temperature": temperature,
            "max_tokens": max_tokens,
            "stream": true,
        });
        if !tools.is_empty() {
            body["tools"] = tools.iter().map(tool_definition_to_claude).collect();
        }
        if let Some(system) = system_prompt {
            body["system"] = json!(system);
        }
        body
    }
}

/// Map a non-success response to an [`LlmError`].
pub(super) fn error_for_status(status: u16, retry_after: Option<u64>, body: String) -> LlmError {
    match status {
        401 | 403 => LlmError::AuthError,
        429 => {
            let retry_after_secs = retry_after
                .or_else(|| {
                    serde_json::from_str::<Value>(&body)
                        .ok()
                        .and_then(|v| v["error"]["retry_after_secs"].as_u64())
                })
                .unwrap_or(30);
            LlmError::RateLimited { retry_after_secs }
        }
        _ => {
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v["error"]["message"].as_str().map(String::from))
                .unwrap_or(body);
            LlmError::ApiError { status, message }
        }
    }
}

/// Turn a raw SSE byte stream into [`StreamEvent`]s.
pub(super) fn decode_events<S, B, E>(bytes: S) -> EventStream
where
    S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    struct State<S> {
        bytes: S,
        decoder: SseDecoder,
        tracker: BlockTracker,
        pending: VecDeque<StreamEvent>,
        done: bool,
    }

    let state = State {
        bytes,
        decoder: SseDecoder::new(),
        tracker: BlockTracker::new(),
        pending: VecDeque::new(),
        done: false,
    };

    let events = stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((Ok(event), state));
            }
            if state.done {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    for frame in state.decoder.push(chunk.as_ref()) {
                        let events = state.tracker.process(&frame);
                        state.pending.extend(events);
                    }
                }
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(LlmError::StreamError(e.to_string())), state));
                }
                None => {
                    state.done = true;
                    if let Some(frame) = state.decoder.finish() {
                        let events = state.tracker.process(&frame);
                        state.pending.extend(events);
                    }
                }
            }
        }
    });
    Box::pin(events)
}

#[async_trait]
impl ToolAwareLlmProvider for ClaudeToolProvider {
    async fn stream_with_tools(
        &self,
        messages: Vec<Turn>,
        system_prompt: Option<String>,
        tools: Vec<ToolDefinition>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<EventStream, LlmError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.request_body(
            &messages,
            system_prompt.as_deref(),
            &tools,
            temperature,
            max_tokens,
        );

        debug!(model = %self.model, url = %url, messages = messages.len(), "starting Claude streaming request");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok());
            let body_text = response.text().await.unwrap_or_default();
            return Err(error_for_status(status.as_u16(), retry_after, body_text));
        }

        Ok(decode_events(Box::pin(response.bytes_stream())))
    }

    fn provider_name(&self) -> &str {
        "claude"
    }
}
