use crate::conversation::Turn;
use crate::stream::StreamEvent;
use crate::tool::ToolDefinition;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, LlmError>> + Send>>;

/// Trait for LLM providers that support tool use and streaming.
///
/// This trait lives in tool-runtime (not in crates/llm) because it's
/// defined by the consumer (the orchestrator), not the provider.
/// Implementations live in crates/llm.
#[async_trait]
pub trait ToolAwareLlmProvider: Send + Sync {
    /// Stream a response from the LLM with tool definitions available.
    async fn stream_with_tools(
        &self,
        messages: Vec<Turn>,
        system_prompt: Option<String>,
        tools: Vec<ToolDefinition>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<EventStream, LlmError>;

    /// Provider name for logging/debugging (e.g., "claude")
    fn provider_name(&self) -> &str;
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("Authentication failed")]
    AuthError,
    #[error("Stream error: {0}")]
    StreamError(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Mock LLM provider for testing the orchestrator without real API calls.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use crate::stream::StopReason;
    use futures::stream;
    use serde_json::Value;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    enum Scripted {
        Events(Vec<StreamEvent>),
        Fail(String),
    }

    /// A mock provider that replays scripted responses in FIFO order.
    ///
    /// With [`MockLlmProvider::always_call_tool`] set, every call with an
    /// empty script requests the same tool again under a fresh id.
    pub struct MockLlmProvider {
        responses: Mutex<VecDeque<Scripted>>,
        repeat: Mutex<Option<(String, Value)>>,
        requests: Mutex<Vec<Vec<Turn>>>,
        delay: Mutex<Option<Duration>>,
    }

    impl MockLlmProvider {
        pub fn new() -> Self {
            Self {
                responses: Mutex::new(VecDeque::new()),
                repeat: Mutex::new(None),
                requests: Mutex::new(Vec::new()),
                delay: Mutex::new(None),
            }
        }

        /// Queue a response that will be returned after those already queued.
        pub fn queue_response(&self, events: Vec<StreamEvent>) {
            self.responses
                .lock()
                .unwrap()
                .push_back(Scripted::Events(events));
        }

        /// Queue a simple text response.
        pub fn queue_text(&self, text: &str) {
            self.queue_response(vec![
                StreamEvent::TextDelta {
                    text: text.to_string(),
                },
                StreamEvent::MessageEnd {
                    stop_reason: StopReason::EndTurn,
                },
            ]);
        }

        /// Queue a response requesting the given `(id, tool, input)` calls.
        pub fn queue_tool_calls(&self, calls: Vec<(&str, &str, Value)>) {
            let mut events = Vec::new();
            for (id, name, input) in calls {
                events.extend(tool_call_events(id, name, &input));
            }
            events.push(StreamEvent::MessageEnd {
                stop_reason: StopReason::ToolUse,
            });
            self.queue_response(events);
        }

        /// Queue a request-level failure.
        pub fn queue_error(&self, message: &str) {
            self.responses
                .lock()
                .unwrap()
                .push_back(Scripted::Fail(message.to_string()));
        }

        pub fn always_call_tool(&self, name: &str, input: Value) {
            *self.repeat.lock().unwrap() = Some((name.to_string(), input));
        }

        /// Wait this long before answering each call.
        pub fn with_delay(self, delay: Duration) -> Self {
            *self.delay.lock().unwrap() = Some(delay);
            self
        }

        pub fn call_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        /// Messages sent with each call so far.
        pub fn requests(&self) -> Vec<Vec<Turn>> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl Default for MockLlmProvider {
        fn default() -> Self {
            Self::new()
        }
    }

    fn tool_call_events(id: &str, name: &str, input: &Value) -> Vec<StreamEvent> {
        vec![
            StreamEvent::ToolCallStart {
                id: id.to_string(),
                name: name.to_string(),
            },
            StreamEvent::ToolCallDelta {
                id: id.to_string(),
                arguments_delta: input.to_string(),
            },
            StreamEvent::ToolCallEnd { id: id.to_string() },
        ]
    }

    #[async_trait]
    impl ToolAwareLlmProvider for MockLlmProvider {
        async fn stream_with_tools(
            &self,
            messages: Vec<Turn>,
            _system_prompt: Option<String>,
            _tools: Vec<ToolDefinition>,
            _temperature: f32,
            _max_tokens: u32,
        ) -> Result<EventStream, LlmError> {
            let call_index = {
                let mut requests = self.requests.lock().unwrap();
                requests.push(messages);
                requests.len()
            };
            let delay = *self.delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let scripted = self.responses.lock().unwrap().pop_front();
            let events = match scripted {
                Some(Scripted::Events(events)) => events,
                Some(Scripted::Fail(message)) => {
                    return Err(LlmError::ApiError {
                        status: 529,
                        message,
                    })
                }
                None => match self.repeat.lock().unwrap().clone() {
                    Some((name, input)) => {
                        let mut events =
                            tool_call_events(&format!("call_{call_index}"), &name, &input);
                        events.push(StreamEvent::MessageEnd {
                            stop_reason: StopReason::ToolUse,
                        });
                        events
                    }
                    None => vec![StreamEvent::MessageEnd {
                        stop_reason: StopReason::EndTurn,
                    }],
                },
            };
            Ok(Box::pin(stream::iter(events.into_iter().map(Ok))))
        }

        fn provider_name(&self) -> &str {
            "mock"
        }
    }
}
