//! SSE framing, event parsing and content-block state tracking for the Claude
//! streaming API.

use serde_json::Value;
use tracing::trace;

use parsec_tool_runtime::stream::{StopReason, StreamEvent};

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Incremental SSE decoder.
///
/// Bytes are buffered until a full line is available, so multi-byte UTF-8
/// characters and lines split across network chunks decode correctly. A frame
/// is dispatched on the blank line that ends it.
#[derive(Debug, Default)]
pub(super) struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub(super) fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every frame it completes.
    pub(super) fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]);
            let line = line.trim_end_matches('\r');
            if let Some(frame) = self.line(line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush a trailing frame that was not followed by a blank line.
    pub(super) fn finish(&mut self) -> Option<SseFrame> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string();
            self.line(&line);
        }
        self.dispatch()
    }

    fn line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        let event = event
            .or_else(|| {
                serde_json::from_str::<Value>(&data)
                    .ok()
                    .and_then(|v| v["type"].as_str().map(String::from))
            })
            .unwrap_or_default();
        Some(SseFrame { event, data })
    }
}

/// Parse a single SSE event (type + data) into zero or more [`StreamEvent`]s.
///
/// Tool-call deltas and block stops carry `__index_N` placeholders; the
/// [`BlockTracker`] replaces them with real tool-use ids.
pub(super) fn parse_sse_event(event_type: &str, data: &str) -> Vec<StreamEvent> {
    let mut events = Vec::new();

    match event_type {
        "content_block_start" => {
            if let Ok(parsed) = serde_json::from_str::<Value>(data) {
                let block = &parsed["content_block"];
                match block["type"].as_str() {
                    Some("text") => {
                        if let Some(text) = block["text"].as_str().filter(|t| !t.is_empty()) {
                            events.push(StreamEvent::TextDelta {
                                text: text.to_string(),
                            });
                        }
                    }
                    Some("tool_use") => {
                        let id = block["id"].as_str().unwrap_or("").to_string();
                        let name = block["name"].as_str().unwrap_or("").to_string();
                        events.push(StreamEvent::ToolCallStart { id, name });
                    }
                    _ => {}
                }
            }
        }
        "content_block_delta" => {
            if let Ok(parsed) = serde_json::from_str::<Value>(data) {
                let delta = &parsed["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => {
                        if let Some(text) = delta["text"].as_str() {
                            events.push(StreamEvent::TextDelta {
                                text: text.to_string(),
                            });
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(json_str) = delta["partial_json"].as_str() {
                            let index = parsed["index"].as_u64().unwrap_or(0);
                            events.push(StreamEvent::ToolCallDelta {
                                id: placeholder(index),
                                arguments_delta: json_str.to_string(),
                            });
                        }
                    }
                    _ => {}
                }
            }
        }
        "content_block_stop" => {
            if let Ok(parsed) = serde_json::from_str::<Value>(data) {
                let index = parsed["index"].as_u64().unwrap_or(0);
                events.push(StreamEvent::ToolCallEnd {
                    id: placeholder(index),
                });
            }
        }
        "message_delta" => {
            if let Ok(parsed) = serde_json::from_str::<Value>(data) {
                let stop_reason = match parsed["delta"]["stop_reason"].as_str() {
                    Some("tool_use") => StopReason::ToolUse,
                    Some("max_tokens") => StopReason::MaxTokens,
                    Some("stop_sequence") => StopReason::StopSequence,
                    _ => StopReason::EndTurn,
                };
                events.push(StreamEvent::MessageEnd { stop_reason });
            }
        }
        // message_delta already carried the stop reason
        "message_stop" | "message_start" | "ping" => {}
        "error" => {
            let message = serde_json::from_str::<Value>(data)
                .ok()
                .and_then(|v| v["error"]["message"].as_str().map(String::from))
                .unwrap_or_else(|| data.to_string());
            events.push(StreamEvent::Error { message });
        }
        _ => {
            trace!(event_type, "ignoring unknown SSE event type");
        }
    }

    events
}

fn placeholder(index: u64) -> String {
    format!("__index_{index}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Block {
    Text,
    ToolUse(String),
}

/// Tracks per-block state so `__index_N` placeholders resolve to real
/// tool_use ids, and text-block stops are dropped.
#[derive(Debug, Default)]
pub(super) struct BlockTracker {
    blocks: Vec<Option<Block>>,
}

impl BlockTracker {
    pub(super) fn new() -> Self {
        Self::default()
    }

    pub(super) fn register_block(&mut self, index: usize, block: Block) {
        if index >= self.blocks.len() {
            self.blocks.resize(index + 1, None);
        }
        self.blocks[index] = Some(block);
    }

    pub(super) fn resolve(&self, placeholder_id: &str) -> Option<&Block> {
        let index: usize = placeholder_id.strip_prefix("__index_")?.parse().ok()?;
        self.blocks.get(index)?.as_ref()
    }

    /// Parse one frame and resolve its block references.
    pub(super) fn process(&mut self, frame: &SseFrame) -> Vec<StreamEvent> {
        let parsed = serde_json::from_str::<Value>(&frame.data).ok();
        let index = parsed
            .as_ref()
            .and_then(|v| v["index"].as_u64())
            .map(|i| i as usize);
        if frame.event == "content_block_start" {
            let is_text = parsed
                .as_ref()
                .is_some_and(|v| v["content_block"]["type"] == "text");
            if let (true, Some(i)) = (is_text, index) {
                self.register_block(i, Block::Text);
            }
        }

        let mut events = Vec::new();
        for event in parse_sse_event(&frame.event, &frame.data) {
            match event {
                StreamEvent::ToolCallStart { ref id, .. } => {
                    self.register_block(index.unwrap_or(0), Block::ToolUse(id.clone()));
                    events.push(event);
                }
                StreamEvent::TextDelta { ref text } if text.is_empty() => {}
                StreamEvent::ToolCallDelta {
                    id,
                    arguments_delta,
                } => match self.resolve(&id) {
                    Some(Block::ToolUse(real)) => events.push(StreamEvent::ToolCallDelta {
                        id: real.clone(),
                        arguments_delta,
                    }),
                    _ => trace!(%id, "argument delta for unknown block"),
                },
                StreamEvent::ToolCallEnd { id } => {
                    if let Some(Block::ToolUse(real)) = self.resolve(&id) {
                        events.push(StreamEvent::ToolCallEnd { id: real.clone() });
                    }
                }
                other => events.push(other),
            }
        }
        events
    }
}
