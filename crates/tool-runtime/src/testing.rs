//! Tools and backends for exercising the orchestrator in tests.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::sql_guard::BoundedQuery;
use crate::tool::{Tool, ToolContext, ToolDefinition, ToolError, ToolProfile};
use crate::tools::provisions_db::{QueryBackend, QueryRows};

/// Echoes back its `text` input.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "echo".to_string(),
            description: "Echoes back the input text. For testing.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "text": {"type": "string", "description": "The text to echo back"}
                },
                "required": ["text"]
            }),
        }
    }

    async fn execute(&self, input: Value, _context: &ToolContext) -> Result<Value, ToolError> {
        let text = crate::tool::required_str(&input, "text")?;
        Ok(json!({ "text": text }))
    }
}

#[derive(Clone)]
enum Outcome {
    Value(Value),
    Fail(String),
    Panic,
}

/// A tool with a fixed outcome and optional delay, recording when it ran.
pub struct ScriptedTool {
    name: String,
    outcome: Outcome,
    delay: Duration,
    profile: ToolProfile,
    calls: Arc<AtomicUsize>,
    log: Option<Arc<Mutex<Vec<String>>>>,
}

impl ScriptedTool {
    fn with_outcome(name: &str, outcome: Outcome) -> Self {
        Self {
            name: name.to_string(),
            outcome,
            delay: Duration::ZERO,
            profile: ToolProfile::default(),
            calls: Arc::new(AtomicUsize::new(0)),
            log: None,
        }
    }

    pub fn ok(name: &str, value: Value) -> Self {
        Self::with_outcome(name, Outcome::Value(value))
    }

    pub fn failing(name: &str, message: &str) -> Self {
        Self::with_outcome(name, Outcome::Fail(message.to_string()))
    }

    pub fn panicking(name: &str) -> Self {
        Self::with_outcome(name, Outcome::Panic)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_profile(mut self, profile: ToolProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Append `"<name>:start"` and `"<name>:end"` to `log` as the tool runs.
    pub fn with_log(mut self, log: Arc<Mutex<Vec<String>>>) -> Self {
        self.log = Some(log);
        self
    }

    /// Shared counter of executions.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    fn record(&self, what: &str) {
        if let Some(log) = &self.log {
            log.lock().unwrap().push(format!("{}:{what}", self.name));
        }
    }
}

#[async_trait]
impl Tool for ScriptedTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: format!("Scripted test tool {}", self.name),
            input_schema: json!({"type": "object"}),
        }
    }

    fn profile(&self) -> ToolProfile {
        self.profile.clone()
    }

    async fn execute(&self, _input: Value, _context: &ToolContext) -> Result<Value, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.record("start");
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.record("end");
        match &self.outcome {
            Outcome::Value(v) => Ok(v.clone()),
            Outcome::Fail(m) => Err(ToolError::ExecutionFailed(m.clone())),
            Outcome::Panic => panic!("scripted tool {} panicked", self.name),
        }
    }
}

/// Query backend that records every query and returns canned rows.
#[derive(Default)]
pub struct RecordingQueryBackend {
    rows: QueryRows,
    seen: Mutex<Vec<BoundedQuery>>,
}

impl RecordingQueryBackend {
    pub fn with_rows(columns: &[&str], rows: Vec<Value>) -> Self {
        let rows = rows
            .into_iter()
            .map(|r| match r {
                Value::Object(map) => map,
                _ => Map::new(),
            })
            .collect();
        Self {
            rows: QueryRows {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows,
            },
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn queries(&self) -> Vec<BoundedQuery> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueryBackend for RecordingQueryBackend {
    async fn fetch(&self, query: &BoundedQuery) -> Result<QueryRows, ToolError> {
        self.seen.lock().unwrap().push(query.clone());
        Ok(self.rows.clone())
    }

    async fn ping(&self) -> Result<(), ToolError> {
        Ok(())
    }
}
