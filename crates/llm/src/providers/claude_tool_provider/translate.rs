//! Translation between provider-agnostic conversation types and the Claude API format.

use serde_json::{json, Value};

use parsec_tool_runtime::{Segment, ToolDefinition, Turn};

/// Translate a [`ToolDefinition`] into the Claude API tool format.
pub(super) fn tool_definition_to_claude(tool: &ToolDefinition) -> Value {
    json!({
        "name": tool.name,
        "description": tool.description,
        "input_schema": tool.input_schema,
    })
}

/// Translate a history into Claude API messages.
///
/// Consecutive tool turns answer the same assistant turn, and the API expects
/// all of their `tool_result` blocks in a single user message.
pub(super) fn turns_to_claude(turns: &[Turn]) -> Vec<Value> {
    let mut messages: Vec<Value> = Vec::new();
    let mut results: Vec<Value> = Vec::new();

    for turn in turns {
        if let Turn::Tool { result } = turn {
            results.push(json!({
                "type": "tool_result",
                "tool_use_id": result.tool_call_id,
                "content": result.output.to_model_content(),
                "is_error": result.is_error(),
            }));
            continue;
        }
        if !results.is_empty() {
            messages.push(json!({"role": "user", "content": std::mem::take(&mut results)}));
        }
        if let Some(message) = turn_to_claude(turn) {
            messages.push(message);
        }
    }
    if !results.is_empty() {
        messages.push(json!({"role": "user", "content": results}));
    }
    messages
}

fn turn_to_claude(turn: &Turn) -> Option<Value> {
    match turn {
        Turn::User { content } => Some(json!({
            "role": "user",
            "content": content,
        })),
        Turn::Assistant { segments } => {
            let blocks: Vec<Value> = segments
                .iter()
                .filter_map(|segment| match segment {
                    Segment::Text { text } if text.is_empty() => None,
                    Segment::Text { text } => Some(json!({"type": "text", "text": text})),
                    Segment::ToolCall(tc) => Some(json!({
                        "type": "tool_use",
                        "id": tc.id,
                        "name": tc.name,
                        "input": tc.input,
                    })),
                })
                .collect();
            // The API rejects assistant messages without content.
            (!blocks.is_empty()).then(|| {
                json!({
                    "role": "assistant",
                    "content": blocks,
                })
            })
        }
        Turn::Tool { .. } => None,
    }
}
