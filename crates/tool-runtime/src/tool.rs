use async_trait::async_trait;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Describes a tool's interface for LLM consumption.
/// Maps to Claude's tool format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique tool name (e.g., "query_provisions_db")
    pub name: String,
    /// Human-readable description for the LLM
    pub description: String,
    /// JSON Schema describing the expected input
    pub input_schema: Value,
}

/// Client-visible artifact a successful call produces in addition to its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Chart,
    Report,
}

/// Dispatch-time properties a tool declares about itself.
///
/// None of these are inferred from data: a tool is independent, unbounded by
/// a custom timeout and free of query validation unless it says otherwise.
#[derive(Debug, Clone, Default)]
pub struct ToolProfile {
    /// Input field holding model-generated query text. Calls to such tools
    /// pass the query validator before their handler runs.
    pub query_input: Option<&'static str>,
    /// Tools whose output this tool consumes within the same round.
    pub depends_on: Vec<String>,
    /// Overrides the orchestrator's per-call timeout.
    pub timeout: Option<Duration>,
    /// Shown in keepalive status events while the call is running.
    pub status_label: Option<String>,
    pub artifact: Option<ArtifactKind>,
}

/// Represents an LLM requesting execution of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique ID for this invocation (used to match results)
    pub id: String,
    /// Tool name to execute
    pub name: String,
    /// JSON input arguments
    pub input: Value,
}

/// Category of a failed call, surfaced to the model and the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    InvalidInput,
    Validation,
    Execution,
    Timeout,
    UnknownTool,
}

impl fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ToolErrorKind::InvalidInput => "invalid_input",
            ToolErrorKind::Validation => "validation",
            ToolErrorKind::Execution => "execution",
            ToolErrorKind::Timeout => "timeout",
            ToolErrorKind::UnknownTool => "unknown_tool",
        };
        f.write_str(s)
    }
}

/// Captured outcome of one call: a structured value or an error descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutput {
    Success { value: Value },
    Error { kind: ToolErrorKind, message: String },
}

impl ToolOutput {
    pub fn success(value: Value) -> Self {
        ToolOutput::Success { value }
    }

    pub fn error(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        ToolOutput::Error {
            kind,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ToolOutput::Error { .. })
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            ToolOutput::Success { value } => Some(value),
            ToolOutput::Error { .. } => None,
        }
    }

    /// Wire shape: the value's own fields on success, `{error, kind}` otherwise.
    pub fn wire(&self) -> WireOutput<'_> {
        WireOutput(self)
    }

    /// Tool result content as sent back to the model.
    pub fn to_model_content(&self) -> String {
        serde_json::to_string(&self.wire()).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Borrowed view of a [`ToolOutput`] serialized in its wire shape.
pub struct WireOutput<'a>(&'a ToolOutput);

impl Serialize for WireOutput<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            ToolOutput::Success { value } => value.serialize(serializer),
            ToolOutput::Error { kind, message } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("error", message)?;
                map.serialize_entry("kind", kind)?;
                map.end()
            }
        }
    }
}

/// Result of executing a tool, sent back to the LLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Must match the ToolCall id
    pub tool_call_id: String,
    pub tool_name: String,
    pub output: ToolOutput,
}

impl ToolResult {
    pub fn new(call: &ToolCall, output: ToolOutput) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            output,
        }
    }

    pub fn is_error(&self) -> bool {
        self.output.is_error()
    }
}

/// Per-request context passed to tool execution.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// Correlates tool logs with the request that caused them
    pub request_id: String,
    /// Identity forwarded by the auth proxy, if any
    pub user: Option<String>,
}

/// The primary extension point: all tools implement this trait.
///
/// Tools are object-safe, Send + Sync, and async. Handlers return structured
/// values; any `Err` is converted into a [`ToolOutput::Error`] by the
/// dispatcher and never propagates past it.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Returns the tool's definition (name, description, JSON Schema).
    fn definition(&self) -> ToolDefinition;

    fn profile(&self) -> ToolProfile {
        ToolProfile::default()
    }

    /// Execute the tool with the given JSON input.
    async fn execute(&self, input: Value, context: &ToolContext) -> Result<Value, ToolError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Query rejected: {0}")]
    Rejected(String),
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
    #[error("Timeout after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ToolError {
    pub fn kind(&self) -> ToolErrorKind {
        match self {
            ToolError::InvalidInput(_) => ToolErrorKind::InvalidInput,
            ToolError::Rejected(_) => ToolErrorKind::Validation,
            ToolError::ExecutionFailed(_) | ToolError::Other(_) => ToolErrorKind::Execution,
            ToolError::Timeout(_) => ToolErrorKind::Timeout,
        }
    }

    pub fn into_output(self) -> ToolOutput {
        ToolOutput::error(self.kind(), self.to_string())
    }
}

impl fmt::Display for ToolDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.description)
    }
}

/// Fetch a required string field from a tool's JSON input.
pub fn required_str<'a>(input: &'a Value, field: &str) -> Result<&'a str, ToolError> {
    input
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidInput(format!("missing '{field}' field")))
}
