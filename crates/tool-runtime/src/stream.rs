use crate::conversation::{Segment, Turn};
use crate::provider::LlmError;
use crate::tool::ToolCall;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Events emitted during streaming LLM responses.
/// Provider-agnostic; translated from the wire format in the provider layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamEvent {
    /// A chunk of text from the assistant
    TextDelta { text: String },
    /// Start of a tool call (LLM wants to execute a tool)
    ToolCallStart { id: String, name: String },
    /// Incremental JSON argument data for a tool call
    ToolCallDelta { id: String, arguments_delta: String },
    /// Tool call arguments are complete
    ToolCallEnd { id: String },
    /// The entire message is complete
    MessageEnd { stop_reason: StopReason },
    /// An error occurred during streaming
    Error { message: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StopReason {
    /// Normal end of response
    EndTurn,
    /// Model wants to use tools
    ToolUse,
    /// Hit max tokens limit
    MaxTokens,
    /// Stopped by stop sequence
    StopSequence,
}

/// Folds one streamed model response into an assistant [`Turn`].
///
/// Consecutive text deltas coalesce into one text segment; tool calls keep
/// the position at which they started, and their argument fragments are
/// parsed once the call ends.
#[derive(Debug, Default)]
pub struct TurnAssembler {
    segments: Vec<Segment>,
    /// Argument buffers for calls that have started, by segment index.
    arguments: Vec<(usize, String)>,
    stop_reason: Option<StopReason>,
}

impl TurnAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: StreamEvent) -> Result<(), LlmError> {
        match event {
            StreamEvent::TextDelta { text } => {
                if let Some(Segment::Text { text: last }) = self.segments.last_mut() {
                    last.push_str(&text);
                } else if !text.is_empty() {
                    self.segments.push(Segment::Text { text });
                }
            }
            StreamEvent::ToolCallStart { id, name } => {
                self.arguments.push((self.segments.len(), String::new()));
                self.segments.push(Segment::ToolCall(ToolCall {
                    id,
                    name,
                    input: Value::Null,
                }));
            }
            StreamEvent::ToolCallDelta {
                id,
                arguments_delta,
            } => {
                let buffer = self.buffer_for(&id)?;
                buffer.push_str(&arguments_delta);
            }
            StreamEvent::ToolCallEnd { id } => self.finish_call(&id)?,
            StreamEvent::MessageEnd { stop_reason } => self.stop_reason = Some(stop_reason),
            StreamEvent::Error { message } => return Err(LlmError::StreamError(message)),
        }
        Ok(())
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    pub fn has_tool_calls(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::ToolCall(_)))
    }

    /// The assembled turn and its tool calls in declaration order.
    pub fn finish(mut self) -> Result<(Turn, Vec<ToolCall>), LlmError> {
        let open: Vec<String> = self
            .arguments
            .iter()
            .filter_map(|(idx, _)| match &self.segments[*idx] {
                Segment::ToolCall(call) if call.input.is_null() => Some(call.id.clone()),
                _ => None,
            })
            .collect();
        for id in open {
            self.finish_call(&id)?;
        }

        let calls = self
            .segments
            .iter()
            .filter_map(|s| match s {
                Segment::ToolCall(call) => Some(call.clone()),
                Segment::Text { .. } => None,
            })
            .collect();
        Ok((
            Turn::Assistant {
                segments: self.segments,
            },
            calls,
        ))
    }

    fn position_of(&self, id: &str) -> Result<usize, LlmError> {
        self.arguments
            .iter()
            .position(|(idx, _)| {
                matches!(&self.segments[*idx], Segment::ToolCall(call) if call.id == id)
            })
            .ok_or_else(|| LlmError::InvalidResponse(format!("unknown tool call id '{id}'")))
    }

    fn buffer_for(&mut self, id: &str) -> Result<&mut String, LlmError> {
        let pos = self.position_of(id)?;
        Ok(&mut self.arguments[pos].1)
    }

    fn finish_call(&mut self, id: &str) -> Result<(), LlmError> {
        let pos = self.position_of(id)?;
        let (idx, raw) = &self.arguments[pos];
        let input = if raw.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(raw).map_err(|e| {
                LlmError::InvalidResponse(format!("tool call '{id}' has malformed arguments: {e}"))
            })?
        };
        if let Segment::ToolCall(call) = &mut self.segments[*idx] {
            call.input = input;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_assembles_text_and_calls_in_order() {
        let mut asm = TurnAssembler::new();
        for event in [
            StreamEvent::TextDelta { text: "Let me ".into() },
            StreamEvent::TextDelta { text: "check.".into() },
            StreamEvent::ToolCallStart {
                id: "t1".into(),
                name: "query_provisions_db".into(),
            },
            StreamEvent::ToolCallDelta {
                id: "t1".into(),
                arguments_delta: r#"{"sql": "SEL"#.into(),
            },
            StreamEvent::ToolCallDelta {
                id: "t1".into(),
                arguments_delta: r#"ECT 1"}"#.into(),
            },
            StreamEvent::ToolCallEnd { id: "t1".into() },
            StreamEvent::ToolCallStart {
                id: "t2".into(),
                name: "query_cost_monitor".into(),
            },
            StreamEvent::ToolCallEnd { id: "t2".into() },
            StreamEvent::MessageEnd {
                stop_reason: StopReason::ToolUse,
            },
        ] {
            asm.apply(event).unwrap();
        }
        assert!(asm.has_tool_calls());
        assert_eq!(asm.stop_reason(), Some(StopReason::ToolUse));

        let (turn, calls) = asm.finish().unwrap();
        assert_eq!(turn.text(), "Let me check.");
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].input, json!({"sql": "SELECT 1"}));
        assert_eq!(calls[1].input, json!({}));
        let Turn::Assistant { segments } = turn else {
            panic!("expected assistant turn");
        };
        assert_eq!(segments.len(), 3);
    }

    #[test]
    fn test_error_event_fails() {
        let mut asm = TurnAssembler::new();
        let err = asm
            .apply(StreamEvent::Error {
                message: "overloaded".into(),
            })
            .unwrap_err();
        assert!(matches!(err, LlmError::StreamError(m) if m == "overloaded"));
    }

    #[test]
    fn test_malformed_arguments_fail() {
        let mut asm = TurnAssembler::new();
        asm.apply(StreamEvent::ToolCallStart {
            id: "t1".into(),
            name: "x".into(),
        })
        .unwrap();
        asm.apply(StreamEvent::ToolCallDelta {
            id: "t1".into(),
            arguments_delta: "{not json".into(),
        })
        .unwrap();
        assert!(asm.apply(StreamEvent::ToolCallEnd { id: "t1".into() }).is_err());
    }

    #[test]
    fn test_delta_for_unknown_call_fails() {
        let mut asm = TurnAssembler::new();
        assert!(asm
            .apply(StreamEvent::ToolCallDelta {
                id: "ghost".into(),
                arguments_delta: "{}".into(),
            })
            .is_err());
    }

    #[test]
    fn test_unterminated_call_is_closed_on_finish() {
        let mut asm = TurnAssembler::new();
        asm.apply(StreamEvent::ToolCallStart {
            id: "t1".into(),
            name: "x".into(),
        })
        .unwrap();
        asm.apply(StreamEvent::ToolCallDelta {
            id: "t1".into(),
            arguments_delta: r#"{"a": 1}"#.into(),
        })
        .unwrap();
        let (_, calls) = asm.finish().unwrap();
        assert_eq!(calls[0].input, json!({"a": 1}));
    }
}
