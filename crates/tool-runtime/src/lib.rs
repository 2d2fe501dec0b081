pub mod context;
pub mod conversation;
pub mod events;
pub mod provider;
pub mod registry;
pub mod runtime;
pub mod sql_guard;
pub mod stream;
pub mod tool;
pub mod tools;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use conversation::{Conversation, HistoryError, Segment, Turn};
pub use events::{ClientEvent, EncodedEvent, EncoderError, EventEncoder, EventKind, ReportLink};
pub use provider::{EventStream, LlmError, ToolAwareLlmProvider};
pub use registry::{RegistryError, ToolRegistry};
pub use runtime::{LoopError, LoopOutcome, Orchestrator, Phase, Termination};
pub use sql_guard::{
    BoundedQuery, QueryLimits, QueryValidator, ReadOnlySqlValidator, RejectReason,
    ValidatedQuery, ValidationVerdict,
};
pub use stream::{StopReason, StreamEvent, TurnAssembler};
pub use tool::{
    ArtifactKind, Tool, ToolCall, ToolContext, ToolDefinition, ToolError, ToolErrorKind,
    ToolOutput, ToolProfile, ToolResult,
};
