//! Unit tests for the Claude tool provider.

use futures::{stream, StreamExt};
use serde_json::json;

use parsec_tool_runtime::{
    LlmError, Segment, StopReason, StreamEvent, ToolCall, ToolDefinition, ToolErrorKind,
    ToolOutput, ToolResult, Turn, TurnAssembler,
};

use super::sse::{parse_sse_event, Block, BlockTracker, SseDecoder, SseFrame};
use super::streaming::{decode_events, error_for_status, ClaudeToolProvider};
use super::translate::{tool_definition_to_claude, turns_to_claude};

fn tool_call(id: &str, name: &str, input: serde_json::Value) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        input,
    }
}

fn tool_turn(id: &str, output: ToolOutput) -> Turn {
    Turn::Tool {
        result: ToolResult {
            tool_call_id: id.to_string(),
            tool_name: "query_provisions_db".to_string(),
            output,
        },
    }
}

#[test]
fn test_tool_definition_translation() {
    let def = ToolDefinition {
        name: "query_provisions_db".to_string(),
        description: "Run a read-only SQL query".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "sql": { "type": "string", "description": "A single SELECT statement" }
            },
            "required": ["sql"]
        }),
    };

    let claude_json = tool_definition_to_claude(&def);

    assert_eq!(claude_json["name"], "query_provisions_db");
    assert_eq!(claude_json["description"], "Run a read-only SQL query");
    assert_eq!(claude_json["input_schema"]["properties"]["sql"]["type"], "string");
}

#[test]
fn test_user_message_translation() {
    let messages = turns_to_claude(&[Turn::user("Which accounts spiked?")]);
    assert_eq!(messages, vec![json!({"role": "user", "content": "Which accounts spiked?"})]);
}

#[test]
fn test_assistant_mixed_content_translation() {
    let turn = Turn::Assistant {
        segments: vec![
            Segment::Text {
                text: "Let me check.".to_string(),
            },
            Segment::ToolCall(tool_call(
                "toolu_01",
                "query_provisions_db",
                json!({"sql": "SELECT 1"}),
            )),
        ],
    };
    let messages = turns_to_claude(&[turn]);

    let content = messages[0]["content"].as_array().unwrap();
    assert_eq!(messages[0]["role"], "assistant");
    assert_eq!(content.len(), 2);
    assert_eq!(content[0], json!({"type": "text", "text": "Let me check."}));
    assert_eq!(content[1]["type"], "tool_use");
    assert_eq!(content[1]["id"], "toolu_01");
    assert_eq!(content[1]["input"]["sql"], "SELECT 1");
}

#[test]
fn test_consecutive_tool_results_share_one_message() {
    let turns = vec![
        Turn::user("q"),
        Turn::Assistant {
            segments: vec![
                Segment::ToolCall(tool_call("a", "query_provisions_db", json!({}))),
                Segment::ToolCall(tool_call("b", "query_provisions_db", json!({}))),
            ],
        },
        tool_turn("a", ToolOutput::success(json!({"row_count": 0}))),
        tool_turn(
            "b",
            ToolOutput::error(ToolErrorKind::Validation, "forbidden SQL keyword: DROP"),
        ),
        Turn::Assistant {
            segments: vec![Segment::Text {
                text: "Done.".to_string(),
            }],
        },
    ];

    let messages = turns_to_claude(&turns);

    assert_eq!(messages.len(), 4);
    assert_eq!(messages[2]["role"], "user");
    let blocks = messages[2]["content"].as_array().unwrap();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0]["tool_use_id"], "a");
    assert_eq!(blocks[0]["is_error"], false);
    assert_eq!(blocks[1]["tool_use_id"], "b");
    assert_eq!(blocks[1]["is_error"], true);
    assert!(blocks[1]["content"]
        .as_str()
        .unwrap()
        .contains("forbidden SQL keyword: DROP"));
    assert_eq!(messages[3]["role"], "assistant");
}

#[test]
fn test_trailing_tool_results_are_flushed() {
    let turns = vec![
        Turn::user("q"),
        Turn::Assistant {
            segments: vec![Segment::ToolCall(tool_call("a", "x", json!({})))],
        },
        tool_turn("a", ToolOutput::success(json!({}))),
    ];
    let messages = turns_to_claude(&turns);
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[2]["content"][0]["type"], "tool_result");
}

#[test]
fn test_empty_assistant_turn_is_skipped() {
    let turns = vec![
        Turn::user("q"),
        Turn::Assistant {
            segments: vec![Segment::Text {
                text: String::new(),
            }],
        },
    ];
    assert_eq!(turns_to_claude(&turns).len(), 1);
}

#[test]
fn test_request_body() {
    let provider = ClaudeToolProvider::new(
        "key".to_string(),
        "claude-test".to_string(),
        "https://api.example.com/".to_string(),
    );
    let tools = vec![ToolDefinition {
        name: "echo".to_string(),
        description: "Echo".to_string(),
        input_schema: json!({"type": "object"}),
    }];

    let body = provider.request_body(&[Turn::user("hi")], Some("be terse"), &tools, 0.0, 4096);

    assert_eq!(body["model"], "claude-test");
    assert_eq!(body["stream"], true);
    assert_eq!(body["max_tokens"], 4096);
    assert_eq!(body["system"], "be terse");
    assert_eq!(body["tools"][0]["name"], "echo");

    let bare = provider.request_body(&[Turn::user("hi")], None, &[], 0.0, 100);
    assert!(bare.get("tools").is_none());
    assert!(bare.get("system").is_none());
}

#[test]
fn test_error_for_status() {
    assert!(matches!(error_for_status(401, None, String::new()), LlmError::AuthError));
    assert!(matches!(
        error_for_status(429, Some(12), String::new()),
        LlmError::RateLimited { retry_after_secs: 12 }
    ));
    assert!(matches!(
        error_for_status(429, None, "not json".to_string()),
        LlmError::RateLimited { retry_after_secs: 30 }
    ));
    match error_for_status(
        529,
        None,
        r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#.to_string(),
    ) {
        LlmError::ApiError { status, message } => {
            assert_eq!(status, 529);
            assert_eq!(message, "Overloaded");
        }
        other => panic!("expected ApiError, got {:?}", other),
    }
}

#[test]
fn test_sse_text_delta() {
    let events = parse_sse_event(
        "content_block_delta",
        r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}"#,
    );
    assert_eq!(
        events,
        vec![StreamEvent::TextDelta {
            text: "Hello".to_string()
        }]
    );
}

#[test]
fn test_sse_tool_call_start() {
    let events = parse_sse_event(
        "content_block_start",
        r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_abc","name":"query_pricing"}}"#,
    );
    match &events[..] {
        [StreamEvent::ToolCallStart { id, name }] => {
            assert_eq!(id, "toolu_abc");
            assert_eq!(name, "query_pricing");
        }
        other => panic!("expected ToolCallStart, got {:?}", other),
    }
}

#[test]
fn test_sse_tool_call_delta() {
    let events = parse_sse_event(
        "content_block_delta",
        r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"sql\":"}}"#,
    );
    assert_eq!(
        events,
        vec![StreamEvent::ToolCallDelta {
            id: "__index_1".to_string(),
            arguments_delta: "{\"sql\":".to_string(),
        }]
    );
}

#[test]
fn test_sse_message_delta_stop_reasons() {
    for (raw, expected) in [
        ("end_turn", StopReason::EndTurn),
        ("tool_use", StopReason::ToolUse),
        ("max_tokens", StopReason::MaxTokens),
    ] {
        let data = format!(r#"{{"type":"message_delta","delta":{{"stop_reason":"{raw}"}}}}"#);
        assert_eq!(
            parse_sse_event("message_delta", &data),
            vec![StreamEvent::MessageEnd {
                stop_reason: expected
            }]
        );
    }
}

#[test]
fn test_sse_error_event() {
    let events = parse_sse_event(
        "error",
        r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
    );
    assert_eq!(
        events,
        vec![StreamEvent::Error {
            message: "Overloaded".to_string()
        }]
    );
}

#[test]
fn test_sse_informational_events_ignored() {
    assert!(parse_sse_event("ping", "{}").is_empty());
    assert!(parse_sse_event("message_stop", r#"{"type":"message_stop"}"#).is_empty());
    assert!(parse_sse_event("message_start", r#"{"type":"message_start"}"#).is_empty());
}

#[test]
fn test_block_tracker_resolution() {
    let mut tracker = BlockTracker::new();
    tracker.register_block(0, Block::Text);
    tracker.register_block(1, Block::ToolUse("toolu_abc".to_string()));

    assert_eq!(
        tracker.resolve("__index_1"),
        Some(&Block::ToolUse("toolu_abc".to_string()))
    );
    assert_eq!(tracker.resolve("__index_0"), Some(&Block::Text));
    assert!(tracker.resolve("__index_99").is_none());
    assert!(tracker.resolve("not_a_placeholder").is_none());
}

#[test]
fn test_block_tracker_drops_text_block_stop() {
    let mut tracker = BlockTracker::new();
    let start = SseFrame {
        event: "content_block_start".to_string(),
        data: r#"{"index":0,"content_block":{"type":"text","text":""}}"#.to_string(),
    };
    let stop = SseFrame {
        event: "content_block_stop".to_string(),
        data: r#"{"index":0}"#.to_string(),
    };
    assert!(tracker.process(&start).is_empty());
    assert!(tracker.process(&stop).is_empty());
}

#[test]
fn test_decoder_handles_split_chunks() {
    let mut decoder = SseDecoder::new();
    let raw = "event: content_block_delta\ndata: {\"delta\":{\"type\":\"text_delta\",\"text\":\"caf\u{e9}\"}}\n\n";
    let bytes = raw.as_bytes();
    // Split inside the two-byte 'é'.
    let split = raw.find('\u{e9}').unwrap() + 1;

    assert!(decoder.push(&bytes[..split]).is_empty());
    let frames = decoder.push(&bytes[split..]);

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].event, "content_block_delta");
    assert!(frames[0].data.contains("caf\u{e9}"));
}

#[test]
fn test_decoder_crlf_comments_and_trailing_frame() {
    let mut decoder = SseDecoder::new();
    let frames = decoder.push(b": keepalive\r\nevent: ping\r\ndata: {}\r\n\r\nevent: message_stop\ndata: {\"type\":\"message_stop\"}");
    assert_eq!(
        frames,
        vec![SseFrame {
            event: "ping".to_string(),
            data: "{}".to_string()
        }]
    );
    let last = decoder.finish().unwrap();
    assert_eq!(last.event, "message_stop");
    assert!(decoder.finish().is_none());
}

fn sse(event: &str, data: serde_json::Value) -> String {
    format!("event: {event}\ndata: {data}\n\n")
}

#[tokio::test]
async fn test_decode_full_tool_use_response() {
    let body = [
        sse("message_start", json!({"type": "message_start"})),
        sse(
            "content_block_start",
            json!({"index": 0, "content_block": {"type": "text", "text": ""}}),
        ),
        sse(
            "content_block_delta",
            json!({"index": 0, "delta": {"type": "text_delta", "text": "Checking."}}),
        ),
        sse("content_block_stop", json!({"index": 0})),
        sse(
            "content_block_start",
            json!({"index": 1, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "query_provisions_db"}}),
        ),
        sse(
            "content_block_delta",
            json!({"index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"sql\": \"SELECT"}}),
        ),
        sse(
            "content_block_delta",
            json!({"index": 1, "delta": {"type": "input_json_delta", "partial_json": " 1\"}"}}),
        ),
        sse("content_block_stop", json!({"index": 1})),
        sse("message_delta", json!({"delta": {"stop_reason": "tool_use"}})),
        sse("message_stop", json!({"type": "message_stop"})),
    ]
    .concat();

    // Deliver in awkward 7-byte chunks.
    let chunks: Vec<Result<Vec<u8>, String>> =
        body.as_bytes().chunks(7).map(|c| Ok(c.to_vec())).collect();
    let events: Vec<StreamEvent> = decode_events(stream::iter(chunks))
        .map(|e| e.unwrap())
        .collect()
        .await;

    let mut assembler = TurnAssembler::new();
    for event in events.clone() {
        assembler.apply(event).unwrap();
    }
    assert_eq!(assembler.stop_reason(), Some(StopReason::ToolUse));
    let (turn, calls) = assembler.finish().unwrap();
    assert_eq!(turn.text(), "Checking.");
    assert_eq!(calls, vec![tool_call("toolu_1", "query_provisions_db", json!({"sql": "SELECT 1"}))]);
    assert!(!events
        .iter()
        .any(|e| matches!(e, StreamEvent::ToolCallEnd { id } if id.starts_with("__index_"))));
}

#[tokio::test]
async fn test_decode_transport_error() {
    let chunks: Vec<Result<Vec<u8>, String>> = vec![
        Ok(sse(
            "content_block_delta",
            json!({"index": 0, "delta": {"type": "text_delta", "text": "Hi"}}),
        )
        .into_bytes()),
        Err("connection reset".to_string()),
    ];
    let events: Vec<Result<StreamEvent, LlmError>> =
        decode_events(stream::iter(chunks)).collect().await;

    assert_eq!(events.len(), 2);
    assert!(matches!(&events[0], Ok(StreamEvent::TextDelta { text }) if text == "Hi"));
    assert!(matches!(&events[1], Err(LlmError::StreamError(m)) if m == "connection reset"));
}
