use crate::tool::{ToolCall, ToolOutput, ToolResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;

/// Tool results larger than this many serialized characters are compacted
/// once they fall out of the most recent rounds.
const COMPACT_THRESHOLD_CHARS: usize = 2000;
/// Rounds whose tool results are never compacted.
const UNCOMPACTED_ROUNDS: usize = 2;
/// Entries kept from `rows`/`results` arrays in compacted results.
const COMPACT_KEEP_ENTRIES: usize = 5;

/// One span of an assistant turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Segment {
    Text { text: String },
    ToolCall(ToolCall),
}

/// A message in the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Turn {
    /// User's text input
    User { content: String },
    /// Assistant's response: text spans and tool calls in generation order
    Assistant { segments: Vec<Segment> },
    /// Result of a tool execution
    Tool { result: ToolResult },
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Turn::User {
            content: content.into(),
        }
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        let segments: &[Segment] = match self {
            Turn::Assistant { segments } => segments,
            _ => &[],
        };
        segments.iter().filter_map(|s| match s {
            Segment::ToolCall(call) => Some(call),
            Segment::Text { .. } => None,
        })
    }

    /// Concatenated text of an assistant turn.
    pub fn text(&self) -> String {
        match self {
            Turn::User { content } => content.clone(),
            Turn::Assistant { segments } => segments
                .iter()
                .filter_map(|s| match s {
                    Segment::Text { text } => Some(text.as_str()),
                    Segment::ToolCall(_) => None,
                })
                .collect(),
            Turn::Tool { .. } => String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HistoryError {
    #[error("tool result '{0}' does not answer a call from the preceding assistant turn")]
    OrphanResult(String),
    #[error("tool result '{0}' appears more than once")]
    DuplicateResult(String),
    #[error("tool call id '{0}' appears more than once")]
    DuplicateCall(String),
    #[error("tool call '{0}' has no result")]
    UnansweredCall(String),
}

/// Ordered transcript of one request.
///
/// Owned by the in-flight request and never persisted; clients resubmit prior
/// turns with each question.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conversation {
    /// System prompt (always retained)
    system_prompt: Option<String>,
    turns: Vec<Turn>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system_prompt(mut self, prompt: String) -> Self {
        self.system_prompt = Some(prompt);
        self
    }

    /// Restore a client-submitted transcript.
    ///
    /// Every tool call must be answered exactly once, by results that
    /// directly follow the assistant turn that made it.
    pub fn from_turns(
        system_prompt: Option<String>,
        turns: Vec<Turn>,
    ) -> Result<Self, HistoryError> {
        let mut call_ids = HashSet::new();
        let mut answered = HashSet::new();
        let mut open: Vec<String> = Vec::new();

        for turn in &turns {
            match turn {
                Turn::User { .. } | Turn::Assistant { .. } => {
                    if let Some(id) = open.first() {
                        return Err(HistoryError::UnansweredCall(id.clone()));
                    }
                    for call in turn.tool_calls() {
                        if !call_ids.insert(call.id.clone()) {
                            return Err(HistoryError::DuplicateCall(call.id.clone()));
                        }
                        open.push(call.id.clone());
                    }
                }
                Turn::Tool { result } => {
                    let id = &result.tool_call_id;
                    if let Some(pos) = open.iter().position(|o| o == id) {
                        open.remove(pos);
                        answered.insert(id.clone());
                    } else if answered.contains(id) {
                        return Err(HistoryError::DuplicateResult(id.clone()));
                    } else {
                        return Err(HistoryError::OrphanResult(id.clone()));
                    }
                }
            }
        }
        if let Some(id) = open.first() {
            return Err(HistoryError::UnansweredCall(id.clone()));
        }

        Ok(Self {
            system_prompt,
            turns,
        })
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    pub fn append(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    /// Roll back to the first `len` turns.
    pub fn truncate(&mut self, len: usize) {
        self.turns.truncate(len);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn into_turns(self) -> Vec<Turn> {
        self.turns
    }

    /// Independent copy of the transcript as it stands.
    pub fn snapshot(&self) -> Conversation {
        self.clone()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Approximate token count using character count / 4 heuristic.
    pub fn approximate_tokens(&self) -> usize {
        let prompt = self.system_prompt.as_ref().map_or(0, |p| p.len());
        let turns: usize = self.turns.iter().map(turn_chars).sum();
        (prompt + turns) / 4
    }

    /// Copy of the transcript that fits `budget` approximate tokens.
    ///
    /// Large tool results outside the most recent rounds are compacted first.
    /// Then whole exchanges (a user turn and the rounds it started) are dropped
    /// oldest first, and within the final exchange the oldest rounds go, each
    /// assistant turn together with its results. The system prompt, the most
    /// recent user turn and the latest round always survive, so the result may
    /// still exceed a very small budget.
    pub fn trimmed_for_model(&self, budget: usize) -> Conversation {
        let mut trimmed = self.clone();
        if trimmed.approximate_tokens() <= budget {
            return trimmed;
        }

        trimmed.compact_old_results();

        while trimmed.approximate_tokens() > budget {
            let user_turns: Vec<usize> = trimmed
                .turns
                .iter()
                .enumerate()
                .filter(|(_, t)| matches!(t, Turn::User { .. }))
                .map(|(i, _)| i)
                .collect();

            let dropped = match user_turns.last().copied() {
                Some(last) if last > 0 => {
                    let next_exchange = user_turns.iter().copied().find(|&i| i > 0).unwrap_or(last);
                    trimmed.turns.drain(..next_exchange);
                    true
                }
                Some(last) => trimmed.drop_oldest_round(last + 1),
                None => trimmed.drop_oldest_round(0),
            };
            if !dropped {
                break;
            }
        }

        tracing::debug!(
            before = self.turns.len(),
            after = trimmed.turns.len(),
            tokens = trimmed.approximate_tokens(),
            "trimmed history for model"
        );
        trimmed
    }

    /// Remove the first round at or after `from`, unless it is the last one.
    fn drop_oldest_round(&mut self, from: usize) -> bool {
        let starts: Vec<usize> = self
            .turns
            .iter()
            .enumerate()
            .skip(from)
            .filter(|(_, t)| matches!(t, Turn::Assistant { .. }))
            .map(|(i, _)| i)
            .collect();
        if starts.len() < 2 {
            return false;
        }
        self.turns.drain(starts[0]..starts[1]);
        true
    }

    fn compact_old_results(&mut self) {
        let round_starts: Vec<usize> = self
            .turns
            .iter()
            .enumerate()
            .filter(|(_, t)| matches!(t, Turn::Assistant { .. }))
            .map(|(i, _)| i)
            .collect();
        if round_starts.len() <= UNCOMPACTED_ROUNDS {
            return;
        }
        let keep_from = round_starts[round_starts.len() - UNCOMPACTED_ROUNDS];
        for turn in &mut self.turns[..keep_from] {
            if let Turn::Tool { result } = turn {
                compact_output(&mut result.output);
            }
        }
    }
}

fn turn_chars(turn: &Turn) -> usize {
    serde_json::to_string(turn).map_or(0, |s| s.len())
}

fn compact_output(output: &mut ToolOutput) {
    match output {
        ToolOutput::Success { value } => {
            let size = serde_json::to_string(value).map_or(0, |s| s.len());
            if size <= COMPACT_THRESHOLD_CHARS {
                return;
            }
            let mut compacted = false;
            if let Value::Object(map) = value {
                for key in ["rows", "results"] {
                    if let Some(Value::Array(items)) = map.get_mut(key) {
                        if items.len() > COMPACT_KEEP_ENTRIES {
                            items.truncate(COMPACT_KEEP_ENTRIES);
                            compacted = true;
                        }
                    }
                }
                if compacted {
                    map.insert("_truncated_for_context".to_string(), Value::Bool(true));
                    return;
                }
            }
            let preview: String = value
                .to_string()
                .chars()
                .take(COMPACT_THRESHOLD_CHARS)
                .collect();
            *value = json!({
                "_truncated_for_context": true,
                "preview": format!("{preview}... [truncated]"),
            });
        }
        ToolOutput::Error { message, .. } => {
            if message.len() > COMPACT_THRESHOLD_CHARS {
                let kept: String = message.chars().take(COMPACT_THRESHOLD_CHARS).collect();
                *message = format!("{kept}... [truncated]");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: "query_provisions_db".to_string(),
            input: json!({"sql": "SELECT 1"}),
        }
    }

    fn assistant(calls: &[&str]) -> Turn {
        let mut segments = vec![Segment::Text {
            text: "checking".to_string(),
        }];
        segments.extend(calls.iter().map(|id| Segment::ToolCall(call(id))));
        Turn::Assistant { segments }
    }

    fn result(id: &str, value: Value) -> Turn {
        Turn::Tool {
            result: ToolResult::new(&call(id), ToolOutput::success(value)),
        }
    }

    fn big_rows(n: usize) -> Value {
        let rows: Vec<Value> = (0..n)
            .map(|i| json!({"id": i, "name": format!("account-{i:04}-with-a-long-name")}))
            .collect();
        json!({"columns": ["id", "name"], "rows": rows, "row_count": n, "truncated": false})
    }

    fn assert_paired(conv: &Conversation) {
        let mut open: Vec<String> = Vec::new();
        for turn in conv.turns() {
            match turn {
                Turn::Tool { result } => {
                    let pos = open
                        .iter()
                        .position(|id| *id == result.tool_call_id)
                        .expect("result without its call");
                    open.remove(pos);
                }
                other => {
                    assert!(open.is_empty(), "call without its result: {open:?}");
                    open.extend(other.tool_calls().map(|c| c.id.clone()));
                }
            }
        }
        assert!(open.is_empty(), "call without its result: {open:?}");
    }

    #[test]
    fn test_conversation_basic() {
        let mut conv = Conversation::new().with_system_prompt("You investigate.".into());
        conv.append(Turn::user("Hello"));
        conv.append(Turn::Assistant {
            segments: vec![Segment::Text {
                text: "Hi there!".to_string(),
            }],
        });

        assert_eq!(conv.len(), 2);
        assert_eq!(conv.turns()[1].text(), "Hi there!");
        assert_eq!(conv.system_prompt(), Some("You investigate."));
    }

    #[test]
    fn test_snapshot_is_independent() {
        let mut conv = Conversation::new();
        conv.append(Turn::user("q1"));
        let snap = conv.snapshot();
        conv.append(Turn::user("q2"));
        assert_eq!(snap.len(), 1);
        assert_eq!(conv.len(), 2);
    }

    #[test]
    fn test_turn_wire_format() {
        let turn = assistant(&["call_1"]);
        let value = serde_json::to_value(&turn).unwrap();
        assert_eq!(value["role"], "assistant");
        assert_eq!(value["segments"][0]["type"], "text");
        assert_eq!(value["segments"][1]["type"], "tool_call");
        assert_eq!(value["segments"][1]["id"], "call_1");

        let back: Turn = serde_json::from_value(value).unwrap();
        assert_eq!(back, turn);

        let user: Turn = serde_json::from_value(json!({"role": "user", "content": "hi"})).unwrap();
        assert_eq!(user, Turn::user("hi"));
    }

    #[test]
    fn test_from_turns_accepts_balanced_history() {
        let turns = vec![
            Turn::user("q"),
            assistant(&["a", "b"]),
            result("b", json!({})),
            result("a", json!({})),
            assistant(&[]),
        ];
        let conv = Conversation::from_turns(None, turns).unwrap();
        assert_eq!(conv.len(), 5);
    }

    #[test]
    fn test_from_turns_rejects_malformed_history() {
        let orphan = vec![Turn::user("q"), result("x", json!({}))];
        assert_eq!(
            Conversation::from_turns(None, orphan),
            Err(HistoryError::OrphanResult("x".into()))
        );

        let duplicate = vec![
            Turn::user("q"),
            assistant(&["a"]),
            result("a", json!({})),
            result("a", json!({})),
        ];
        assert_eq!(
            Conversation::from_turns(None, duplicate),
            Err(HistoryError::DuplicateResult("a".into()))
        );

        let unanswered = vec![Turn::user("q"), assistant(&["a"]), Turn::user("again")];
        assert_eq!(
            Conversation::from_turns(None, unanswered),
            Err(HistoryError::UnansweredCall("a".into()))
        );

        let dangling = vec![Turn::user("q"), assistant(&["a"])];
        assert!(Conversation::from_turns(None, dangling).is_err());

        let reused = vec![
            Turn::user("q"),
            assistant(&["a"]),
            result("a", json!({})),
            assistant(&["a"]),
            result("a", json!({})),
        ];
        assert_eq!(
            Conversation::from_turns(None, reused),
            Err(HistoryError::DuplicateCall("a".into()))
        );
    }

    #[test]
    fn test_trim_under_budget_is_identity() {
        let mut conv = Conversation::new();
        conv.append(Turn::user("small"));
        assert_eq!(conv.trimmed_for_model(1_000), conv);
    }

    #[test]
    fn test_trim_drops_oldest_exchanges_first() {
        let mut conv = Conversation::new().with_system_prompt("system".into());
        for q in 0..5 {
            conv.append(Turn::user(format!("question {q} {}", "x".repeat(400))));
            conv.append(assistant(&[&format!("c{q}")]));
            conv.append(result(&format!("c{q}"), json!({"n": q})));
            conv.append(assistant(&[]));
        }

        let trimmed = conv.trimmed_for_model(300);
        assert_eq!(trimmed.system_prompt(), Some("system"));
        assert!(trimmed.len() < conv.len());
        assert!(matches!(&trimmed.turns()[0], Turn::User { content } if content.starts_with("question")));
        // The most recent user turn survives.
        assert!(trimmed
            .turns()
            .iter()
            .any(|t| matches!(t, Turn::User { content } if content.starts_with("question 4"))));
        assert_paired(&trimmed);
    }

    #[test]
    fn test_trim_never_splits_calls_from_results() {
        let mut conv = Conversation::new();
        conv.append(Turn::user("why did costs spike?"));
        for r in 0..8 {
            let a = format!("r{r}a");
            let b = format!("r{r}b");
            conv.append(assistant(&[&a, &b]));
            conv.append(result(&a, big_rows(3)));
            conv.append(result(&b, big_rows(3)));
        }

        for budget in [50, 200, 400, 800, 1_500] {
            let trimmed = conv.trimmed_for_model(budget);
            assert_paired(&trimmed);
            assert_eq!(trimmed.turns()[0], Turn::user("why did costs spike?"));
            // The latest round survives intact.
            assert_eq!(trimmed.turns().last(), conv.turns().last());
        }
    }

    #[test]
    fn test_compaction_of_old_large_results() {
        let mut conv = Conversation::new();
        conv.append(Turn::user("q"));
        for r in 0..3 {
            let id = format!("c{r}");
            conv.append(assistant(&[&id]));
            conv.append(result(&id, big_rows(200)));
        }

        let trimmed = conv.trimmed_for_model(conv.approximate_tokens() - 1);
        let Turn::Tool { result } = &trimmed.turns()[2] else {
            panic!("expected the first result to survive");
        };
        let value = result.output.value().unwrap();
        assert_eq!(value["rows"].as_array().unwrap().len(), 5);
        assert_eq!(value["_truncated_for_context"], true);

        // The two most recent rounds are untouched.
        let Turn::Tool { result } = trimmed.turns().last().unwrap() else {
            panic!("expected a tool turn");
        };
        assert_eq!(result.output.value().unwrap()["rows"].as_array().unwrap().len(), 200);
    }

    #[test]
    fn test_compaction_truncates_opaque_payloads() {
        let mut output = ToolOutput::success(json!({"blob": "z".repeat(5_000)}));
        compact_output(&mut output);
        let value = output.value().unwrap();
        assert_eq!(value["_truncated_for_context"], true);
        assert!(value["preview"].as_str().unwrap().ends_with("[truncated]"));

        let mut small = ToolOutput::success(json!({"rows": [1, 2, 3, 4, 5, 6, 7]}));
        compact_output(&mut small);
        assert_eq!(small.value().unwrap()["rows"].as_array().unwrap().len(), 7);
    }

    #[test]
    fn test_approximate_tokens() {
        let mut conv = Conversation::new();
        assert_eq!(conv.approximate_tokens(), 0);
        conv.append(Turn::user("x".repeat(400)));
        assert!(conv.approximate_tokens() >= 100);
    }
}
