//! Client-facing progress events.
//!
//! The [`EventEncoder`] serializes each event as it is emitted and hands it to
//! a bounded channel that the transport drains. It enforces the stream's
//! ordering contract: a tool's `tool-start` precedes its `tool-result`, and
//! exactly one `done` or `error` ends the stream with nothing after it.

use crate::conversation::Turn;
use crate::tool::{ToolCall, ToolResult, WireOutput};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    TextDelta,
    ToolStart,
    ToolResult,
    Status,
    Chart,
    Report,
    History,
    Error,
    Done,
}

impl EventKind {
    /// SSE event name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TextDelta => "text-delta",
            EventKind::ToolStart => "tool-start",
            EventKind::ToolResult => "tool-result",
            EventKind::Status => "status",
            EventKind::Chart => "chart",
            EventKind::Report => "report",
            EventKind::History => "history",
            EventKind::Error => "error",
            EventKind::Done => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EventKind::Error | EventKind::Done)
    }
}

/// Link to a generated report file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportLink {
    pub url: String,
    pub filename: String,
    pub format: String,
}

/// An event to emit. Payloads are borrowed from the conversation and are
/// serialized in place.
#[derive(Debug, Clone, Copy)]
pub enum ClientEvent<'a> {
    TextDelta(&'a str),
    ToolStart(&'a ToolCall),
    ToolResult(&'a ToolResult),
    Status(&'a str),
    Chart(&'a Value),
    Report(&'a ReportLink),
    History(&'a [Turn]),
    Error(&'a str),
    Done,
}

impl ClientEvent<'_> {
    pub fn kind(&self) -> EventKind {
        match self {
            ClientEvent::TextDelta(_) => EventKind::TextDelta,
            ClientEvent::ToolStart(_) => EventKind::ToolStart,
            ClientEvent::ToolResult(_) => EventKind::ToolResult,
            ClientEvent::Status(_) => EventKind::Status,
            ClientEvent::Chart(_) => EventKind::Chart,
            ClientEvent::Report(_) => EventKind::Report,
            ClientEvent::History(_) => EventKind::History,
            ClientEvent::Error(_) => EventKind::Error,
            ClientEvent::Done => EventKind::Done,
        }
    }

    fn payload(&self) -> Result<String, serde_json::Error> {
        match *self {
            ClientEvent::TextDelta(content) => serde_json::to_string(&TextPayload { content }),
            ClientEvent::ToolStart(call) => serde_json::to_string(&ToolStartPayload {
                id: &call.id,
                tool: &call.name,
                input: &call.input,
            }),
            ClientEvent::ToolResult(result) => serde_json::to_string(&ToolResultPayload {
                id: &result.tool_call_id,
                tool: &result.tool_name,
                result: result.output.wire(),
            }),
            ClientEvent::Status(message) | ClientEvent::Error(message) => {
                serde_json::to_string(&MessagePayload { message })
            }
            ClientEvent::Chart(spec) => serde_json::to_string(spec),
            ClientEvent::Report(link) => serde_json::to_string(link),
            ClientEvent::History(messages) => serde_json::to_string(&HistoryPayload { messages }),
            ClientEvent::Done => Ok("{}".to_string()),
        }
    }
}

#[derive(Serialize)]
struct TextPayload<'a> {
    content: &'a str,
}

#[derive(Serialize)]
struct ToolStartPayload<'a> {
    id: &'a str,
    tool: &'a str,
    input: &'a Value,
}

#[derive(Serialize)]
struct ToolResultPayload<'a> {
    id: &'a str,
    tool: &'a str,
    result: WireOutput<'a>,
}

#[derive(Serialize)]
struct MessagePayload<'a> {
    message: &'a str,
}

#[derive(Serialize)]
struct HistoryPayload<'a> {
    messages: &'a [Turn],
}

/// One serialized event, ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedEvent {
    pub seq: u64,
    pub kind: EventKind,
    pub data: String,
}

#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("event consumer disconnected")]
    Closed,
    #[error("event stream already terminated")]
    Terminated,
    #[error("out-of-order event: {0}")]
    OutOfOrder(String),
    #[error("failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Ordered, typed event sink for one request.
pub struct EventEncoder {
    tx: mpsc::Sender<EncodedEvent>,
    seq: u64,
    started: HashSet<String>,
    finished: HashSet<String>,
    terminated: bool,
    closed: bool,
}

impl EventEncoder {
    pub fn new(tx: mpsc::Sender<EncodedEvent>) -> Self {
        Self {
            tx,
            seq: 0,
            started: HashSet::new(),
            finished: HashSet::new(),
            terminated: false,
            closed: false,
        }
    }

    /// Encoder plus the receiving end the transport reads from.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<EncodedEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// True once the consumer has gone away.
    pub fn is_closed(&self) -> bool {
        self.closed || self.tx.is_closed()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub async fn emit(&mut self, event: ClientEvent<'_>) -> Result<(), EncoderError> {
        if self.terminated {
            return Err(EncoderError::Terminated);
        }
        if self.is_closed() {
            self.closed = true;
            return Err(EncoderError::Closed);
        }

        match event {
            ClientEvent::ToolStart(call) => {
                if self.started.contains(&call.id) {
                    return Err(EncoderError::OutOfOrder(format!(
                        "tool-start for '{}' emitted twice",
                        call.id
                    )));
                }
            }
            ClientEvent::ToolResult(result) => {
                let id = &result.tool_call_id;
                if !self.started.contains(id) {
                    return Err(EncoderError::OutOfOrder(format!(
                        "tool-result for '{id}' before its tool-start"
                    )));
                }
                if self.finished.contains(id) {
                    return Err(EncoderError::OutOfOrder(format!(
                        "tool-result for '{id}' emitted twice"
                    )));
                }
            }
            _ => {}
        }

        let kind = event.kind();
        let data = event.payload()?;
        match event {
            ClientEvent::ToolStart(call) => {
                self.started.insert(call.id.clone());
            }
            ClientEvent::ToolResult(result) => {
                self.finished.insert(result.tool_call_id.clone());
            }
            _ => {}
        }
        if kind.is_terminal() {
            self.terminated = true;
        }

        let encoded = EncodedEvent {
            seq: self.seq,
            kind,
            data,
        };
        self.seq += 1;
        if self.tx.send(encoded).await.is_err() {
            self.closed = true;
            tracing::debug!(kind = kind.as_str(), "event consumer gone");
            return Err(EncoderError::Closed);
        }
        Ok(())
    }
}
