//! Turning one round's tool calls into executable groups.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::registry::ToolRegistry;
use crate::sql_guard::QueryValidator;
use crate::tool::{
    Tool, ToolCall, ToolContext, ToolErrorKind, ToolOutput, ToolProfile, ToolResult,
};

pub(crate) enum Action {
    Run(Arc<dyn Tool>),
    /// Settled before dispatch (unknown tool, bad input, rejected query).
    Resolved(ToolOutput),
}

pub(crate) struct Prepared {
    pub call: ToolCall,
    pub profile: ToolProfile,
    pub action: Action,
}

/// Look the call up, check its input against the tool's schema and, for
/// query-generating tools, run the query text through the validator.
pub(crate) fn prepare(
    registry: &ToolRegistry,
    validator: &dyn QueryValidator,
    call: ToolCall,
) -> Prepared {
    let Some(tool) = registry.get(&call.name) else {
        warn!(tool = %call.name, id = %call.id, "model requested unknown tool");
        let output = ToolOutput::error(
            ToolErrorKind::UnknownTool,
            format!("unknown tool '{}'", call.name),
        );
        return Prepared {
            call,
            profile: ToolProfile::default(),
            action: Action::Resolved(output),
        };
    };
    let profile = registry.profile(&call.name).cloned().unwrap_or_default();

    if let Err(message) = registry.validate_input(&call.name, &call.input) {
        warn!(tool = %call.name, id = %call.id, %message, "tool input failed schema validation");
        return Prepared {
            call,
            profile,
            action: Action::Resolved(ToolOutput::error(ToolErrorKind::InvalidInput, message)),
        };
    }

    if let Some(field) = profile.query_input {
        let text = call.input.get(field).and_then(|v| v.as_str()).unwrap_or("");
        if let Some(reason) = validator.validate(text).reason() {
            warn!(tool = %call.name, id = %call.id, %reason, "query rejected before execution");
            let output = ToolOutput::error(ToolErrorKind::Validation, reason.to_string());
            return Prepared {
                call,
                profile,
                action: Action::Resolved(output),
            };
        }
    }

    Prepared {
        call,
        profile,
        action: Action::Run(tool),
    }
}

fn depends(a: &Prepared, b: &Prepared) -> bool {
    a.profile.depends_on.iter().any(|d| *d == b.call.name)
}

/// Split calls into consecutive groups that may run concurrently.
///
/// A call joins the current group unless it depends on a member, or a member
/// depends on it; then it opens the next group. Declaration order is kept
/// within and across groups.
pub(crate) fn independence_groups(calls: Vec<Prepared>) -> Vec<Vec<Prepared>> {
    let mut groups: Vec<Vec<Prepared>> = Vec::new();
    for call in calls {
        let conflicts = groups.last().is_some_and(|group| {
            group
                .iter()
                .any(|member| depends(&call, member) || depends(member, &call))
        });
        match groups.last_mut() {
            Some(group) if !conflicts => group.push(call),
            _ => groups.push(vec![call]),
        }
    }
    debug!(
        groups = groups.len(),
        sizes = ?groups.iter().map(Vec::len).collect::<Vec<_>>(),
        "partitioned tool calls"
    );
    groups
}

/// Run one call on its own task, bounded by `limit`.
pub(crate) fn spawn_call(
    tool: Arc<dyn Tool>,
    call: &ToolCall,
    context: &ToolContext,
    limit: Duration,
) -> JoinHandle<ToolOutput> {
    let input = call.input.clone();
    let name = call.name.clone();
    let context = context.clone();
    tokio::spawn(async move {
        match tokio::time::timeout(limit, tool.execute(input, &context)).await {
            Ok(Ok(value)) => ToolOutput::success(value),
            Ok(Err(e)) => {
                warn!(tool = %name, error = %e, "tool failed");
                e.into_output()
            }
            Err(_) => {
                warn!(tool = %name, timeout_secs = limit.as_secs_f64(), "tool timed out");
                ToolOutput::error(
                    ToolErrorKind::Timeout,
                    format!("tool '{name}' timed out after {}s", limit.as_secs()),
                )
            }
        }
    })
}

/// Result for a call whose group was never started because the client left.
/// Calls settled before dispatch keep their own outcome.
pub(crate) fn not_started(prepared: Prepared) -> ToolResult {
    let output = match prepared.action {
        Action::Resolved(output) => output,
        Action::Run(_) => {
            debug!(tool = %prepared.call.name, id = %prepared.call.id, "skipping tool, client disconnected");
            ToolOutput::error(
                ToolErrorKind::Execution,
                "not started: the client disconnected",
            )
        }
    };
    ToolResult::new(&prepared.call, output)
}

pub(crate) enum Slot {
    Running(JoinHandle<ToolOutput>),
    Settled(ToolOutput),
}

/// Wait for every slot; panics and cancellations become execution errors.
pub(crate) async fn join_slots(slots: Vec<(String, Slot)>) -> Vec<ToolOutput> {
    let mut outputs = Vec::with_capacity(slots.len());
    for (name, slot) in slots {
        let output = match slot {
            Slot::Settled(output) => output,
            Slot::Running(handle) => match handle.await {
                Ok(output) => output,
                Err(e) => {
                    warn!(tool = %name, error = %e, "tool task did not complete");
                    let what = if e.is_panic() { "panicked" } else { "was cancelled" };
                    ToolOutput::error(ToolErrorKind::Execution, format!("tool '{name}' {what}"))
                }
            },
        };
        outputs.push(output);
    }
    outputs
}
