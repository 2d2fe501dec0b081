//! The bounded tool-orchestration loop.
//!
//! Flow: question → model → tool calls → results → model → ... → answer.
//!
//! Each request runs one [`Orchestrator::run`] through an explicit state
//! machine ([`Phase`]). The round counter is the loop's liveness bound: once
//! `max_rounds` rounds of tool dispatch have completed, the next model turn is
//! never requested and the request ends with a round-cap error.

mod dispatch;


use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use crate::conversation::{Conversation, Turn};
use crate::events::{ClientEvent, EncoderError, EventEncoder, ReportLink};
use crate::provider::{LlmError, ToolAwareLlmProvider};
use crate::registry::ToolRegistry;
use crate::sql_guard::{QueryValidator, ReadOnlySqlValidator};
use crate::stream::TurnAssembler;
use crate::tool::{ArtifactKind, ToolCall, ToolContext, ToolResult};

use dispatch::{Action, Slot};

pub const DEFAULT_MAX_ROUNDS: usize = 10;

/// Orchestrator states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingModel,
    Dispatching,
    AwaitingTools,
    Synthesizing,
    Done,
    Error,
    RoundCapExceeded,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::Error | Phase::RoundCapExceeded)
    }

    pub fn can_transition_to(&self, next: Phase) -> bool {
        use Phase::*;
        match (self, next) {
            (current, _) if current.is_terminal() => false,
            (_, Error) => true,
            (AwaitingModel, Dispatching | Synthesizing | RoundCapExceeded | Done) => true,
            (Dispatching, AwaitingTools) => true,
            (AwaitingTools, AwaitingModel | Done) => true,
            (Synthesizing, Done) => true,
            _ => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error("model request failed: {0}")]
    Model(#[from] LlmError),
    #[error("event stream failed: {0}")]
    Encoder(EncoderError),
}

/// How a run ended.
#[derive(Debug)]
pub enum Termination {
    /// Final answer streamed, `done` emitted.
    Completed,
    /// Round cap reached before a final answer.
    RoundCapExceeded,
    /// The client went away; remaining rounds were skipped.
    Disconnected,
    /// Unrecoverable failure; the conversation is the last good state.
    Failed(LoopError),
}

#[derive(Debug)]
pub struct LoopOutcome {
    pub conversation: Conversation,
    pub termination: Termination,
    /// Completed rounds of tool dispatch.
    pub rounds: usize,
}

enum ModelReply {
    Answer(Turn),
    ToolUse(Turn, Vec<ToolCall>),
    Disconnected,
}

/// Drives model invocations, dispatches tool calls through the registry,
/// records history and streams progress.
pub struct Orchestrator {
    provider: Arc<dyn ToolAwareLlmProvider>,
    registry: Arc<ToolRegistry>,
    validator: Arc<dyn QueryValidator>,
    max_rounds: usize,
    tool_timeout: Duration,
    heartbeat: Duration,
    history_budget: usize,
    temperature: f32,
    max_tokens: u32,
    report_url_prefix: String,
}

impl Orchestrator {
    pub fn new(provider: Arc<dyn ToolAwareLlmProvider>, registry: Arc<ToolRegistry>) -> Self {
        Self {
            provider,
            registry,
            validator: Arc::new(ReadOnlySqlValidator),
            max_rounds: DEFAULT_MAX_ROUNDS,
            tool_timeout: Duration::from_secs(60),
            heartbeat: Duration::from_secs(10),
            history_budget: 150_000,
            temperature: 0.0,
            max_tokens: 4096,
            report_url_prefix: "/api/reports".to_string(),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn QueryValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_max_rounds(mut self, max: usize) -> Self {
        self.max_rounds = max;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn with_heartbeat(mut self, period: Duration) -> Self {
        self.heartbeat = period;
        self
    }

    pub fn with_history_budget(mut self, tokens: usize) -> Self {
        self.history_budget = tokens;
        self
    }

    pub fn with_temperature(mut self, temp: f32) -> Self {
        self.temperature = temp;
        self
    }

    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = max;
        self
    }

    pub fn with_report_url_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.report_url_prefix = prefix.into().trim_end_matches('/').to_string();
        self
    }

    pub fn max_rounds(&self) -> usize {
        self.max_rounds
    }

    /// Answer `question` on top of `conversation`, streaming through `encoder`.
    ///
    /// Never returns early with an error: every outcome, including failures,
    /// is reported in the returned [`LoopOutcome`] and, while the client is
    /// connected, by a terminal `done` or `error` event.
    pub async fn run(
        &self,
        mut conversation: Conversation,
        question: String,
        context: &ToolContext,
        encoder: &mut EventEncoder,
    ) -> LoopOutcome {
        conversation.append(Turn::user(question));

        let mut phase = Phase::AwaitingModel;
        let mut rounds = 0usize;
        let mut pending: Vec<ToolCall> = Vec::new();
        let mut groups = Vec::new();
        let mut failure: Option<LoopError> = None;
        let mut connected = true;
        // Length of the transcript before the current round's assistant turn.
        let mut checkpoint = conversation.len();

        let termination = loop {
            let next = match phase {
                Phase::AwaitingModel => {
                    if encoder.is_closed() {
                        connected = false;
                        Phase::Done
                    } else if rounds >= self.max_rounds {
                        Phase::RoundCapExceeded
                    } else {
                        match self.ask_model(&conversation, rounds, encoder).await {
                            Ok(ModelReply::Answer(turn)) => {
                                if !matches!(&turn, Turn::Assistant { segments } if segments.is_empty()) {
                                    conversation.append(turn);
                                }
                                Phase::Synthesizing
                            }
                            Ok(ModelReply::ToolUse(turn, calls)) => {
                                checkpoint = conversation.len();
                                conversation.append(turn);
                                pending = calls;
                                Phase::Dispatching
                            }
                            Ok(ModelReply::Disconnected) => {
                                connected = false;
                                Phase::Done
                            }
                            Err(e) => {
                                failure = Some(e);
                                Phase::Error
                            }
                        }
                    }
                }
                Phase::Dispatching => {
                    info!(round = rounds + 1, calls = pending.len(), "dispatching tool calls");
                    let prepared = std::mem::take(&mut pending)
                        .into_iter()
                        .map(|call| dispatch::prepare(&self.registry, self.validator.as_ref(), call))
                        .collect();
                    groups = dispatch::independence_groups(prepared);
                    Phase::AwaitingTools
                }
                Phase::AwaitingTools => {
                    let mut results = Vec::new();
                    let mut error = None;
                    for group in std::mem::take(&mut groups) {
                        if !connected {
                            results.extend(group.into_iter().map(dispatch::not_started));
                            continue;
                        }
                        match self.run_group(group, context, encoder, &mut connected).await {
                            Ok(group_results) => results.extend(group_results),
                            Err(e) => {
                                error = Some(e);
                                break;
                            }
                        }
                    }
                    match error {
                        Some(e) => {
                            // A round with unanswered calls is not a valid transcript.
                            warn!(
                                round = rounds + 1,
                                dropped = conversation.len() - checkpoint,
                                "rolling back unfinished round"
                            );
                            conversation.truncate(checkpoint);
                            failure = Some(e);
                            Phase::Error
                        }
                        None => {
                            for result in results {
                                conversation.append(Turn::Tool { result });
                            }
                            rounds += 1;
                            if connected {
                                Phase::AwaitingModel
                            } else {
                                Phase::Done
                            }
                        }
                    }
                }
                Phase::Synthesizing => {
                    self.finish(&conversation, encoder, ClientEvent::Done).await;
                    info!(rounds, "request complete");
                    break Termination::Completed;
                }
                Phase::RoundCapExceeded => {
                    warn!(rounds, "round cap reached without a final answer");
                    let message = format!(
                        "Reached the maximum of {} tool rounds without a final answer; \
                         please narrow the question.",
                        self.max_rounds
                    );
                    self.finish(&conversation, encoder, ClientEvent::Error(&message)).await;
                    break Termination::RoundCapExceeded;
                }
                Phase::Error => {
                    let error = failure.take().unwrap_or_else(|| {
                        LoopError::Model(LlmError::Other(anyhow::anyhow!("unknown failure")))
                    });
                    warn!(rounds, error = %error, "request failed");
                    let message = error.to_string();
                    self.finish(&conversation, encoder, ClientEvent::Error(&message)).await;
                    break Termination::Failed(error);
                }
                Phase::Done => {
                    info!(rounds, "client disconnected, stopping");
                    break Termination::Disconnected;
                }
            };
            debug_assert!(phase.can_transition_to(next), "{phase:?} -> {next:?}");
            debug!(from = ?phase, to = ?next, "phase transition");
            phase = next;
        };

        LoopOutcome {
            conversation,
            termination,
            rounds,
        }
    }

    async fn ask_model(
        &self,
        conversation: &Conversation,
        rounds: usize,
        encoder: &mut EventEncoder,
    ) -> Result<ModelReply, LoopError> {
        let label = if rounds == 0 {
            "Analyzing question"
        } else {
            "Analyzing results"
        };
        if !deliver(encoder, ClientEvent::Status(&format!("{label}..."))).await? {
            return Ok(ModelReply::Disconnected);
        }

        let trimmed = conversation.trimmed_for_model(self.history_budget);
        debug!(
            round = rounds + 1,
            turns = trimmed.len(),
            tokens = trimmed.approximate_tokens(),
            provider = self.provider.provider_name(),
            "requesting model turn"
        );
        let started = Instant::now();
        let request = self.provider.stream_with_tools(
            trimmed.into_turns(),
            conversation.system_prompt().map(String::from),
            self.registry.list(),
            self.temperature,
            self.max_tokens,
        );
        let mut stream = self
            .await_with_heartbeat(request, encoder, label, started, true)
            .await?;

        let mut assembler = TurnAssembler::new();
        let mut ticker = interval_at(Instant::now() + self.heartbeat, self.heartbeat);
        loop {
            tokio::select! {
                biased;
                next = stream.next() => {
                    let Some(event) = next else { break };
                    let event = event?;
                    ticker.reset();
                    if let crate::stream::StreamEvent::TextDelta { text } = &event {
                        if !text.is_empty() && !deliver(encoder, ClientEvent::TextDelta(text)).await? {
                            return Ok(ModelReply::Disconnected);
                        }
                    }
                    assembler.apply(event)?;
                }
                _ = ticker.tick() => {
                    heartbeat_status(encoder, label, started).await;
                }
            }
        }

        let stop_reason = assembler.stop_reason();
        let (turn, calls) = assembler.finish()?;
        debug!(?stop_reason, calls = calls.len(), "model turn complete");
        if calls.is_empty() {
            Ok(ModelReply::Answer(turn))
        } else {
            Ok(ModelReply::ToolUse(turn, calls))
        }
    }

    /// Run one independence group: start every call, wait for all of them,
    /// then report results in declaration order.
    async fn run_group(
        &self,
        group: Vec<dispatch::Prepared>,
        context: &ToolContext,
        encoder: &mut EventEncoder,
        connected: &mut bool,
    ) -> Result<Vec<ToolResult>, LoopError> {
        let label = group
            .iter()
            .find_map(|p| p.profile.status_label.clone())
            .unwrap_or_else(|| "Running tools".to_string());

        let mut slots = Vec::with_capacity(group.len());
        let mut calls = Vec::with_capacity(group.len());
        for prepared in group {
            let slot = match prepared.action {
                Action::Run(tool) => {
                    let limit = prepared.profile.timeout.unwrap_or(self.tool_timeout);
                    info!(tool = %prepared.call.name, id = %prepared.call.id, "starting tool");
                    Slot::Running(dispatch::spawn_call(tool, &prepared.call, context, limit))
                }
                Action::Resolved(output) => Slot::Settled(output),
            };
            slots.push((prepared.call.name.clone(), slot));
            calls.push((prepared.call, prepared.profile.artifact));
        }

        for (call, _) in &calls {
            if *connected {
                *connected = deliver(encoder, ClientEvent::ToolStart(call)).await?;
            }
        }

        let started = Instant::now();
        let outputs = self
            .await_with_heartbeat(dispatch::join_slots(slots), encoder, &label, started, *connected)
            .await;

        let mut results = Vec::with_capacity(calls.len());
        for ((call, artifact), output) in calls.into_iter().zip(outputs) {
            let result = ToolResult::new(&call, output);
            info!(
                tool = %call.name,
                id = %call.id,
                error = result.is_error(),
                "tool finished"
            );
            if *connected {
                *connected = self.report_result(&result, artifact, encoder).await?;
            }
            results.push(result);
        }
        Ok(results)
    }

    async fn report_result(
        &self,
        result: &ToolResult,
        artifact: Option<ArtifactKind>,
        encoder: &mut EventEncoder,
    ) -> Result<bool, LoopError> {
        if !deliver(encoder, ClientEvent::ToolResult(result)).await? {
            return Ok(false);
        }
        let Some(value) = result.output.value() else {
            return Ok(true);
        };
        match artifact {
            Some(ArtifactKind::Chart) => deliver(encoder, ClientEvent::Chart(value)).await,
            Some(ArtifactKind::Report) => match self.report_link(value) {
                Some(link) => deliver(encoder, ClientEvent::Report(&link)).await,
                None => Ok(true),
            },
            None => Ok(true),
        }
    }

    fn report_link(&self, value: &Value) -> Option<ReportLink> {
        let filename = value.get("filename")?.as_str()?;
        let format = value.get("format")?.as_str()?;
        Some(ReportLink {
            url: format!("{}/{}", self.report_url_prefix, filename),
            filename: filename.to_string(),
            format: format.to_string(),
        })
    }

    /// Await `fut`, emitting a status event every heartbeat period while
    /// `connected`.
    async fn await_with_heartbeat<F: Future>(
        &self,
        fut: F,
        encoder: &mut EventEncoder,
        label: &str,
        started: Instant,
        connected: bool,
    ) -> F::Output {
        if !connected {
            return fut.await;
        }
        tokio::pin!(fut);
        let mut ticker = interval_at(Instant::now() + self.heartbeat, self.heartbeat);
        loop {
            tokio::select! {
                biased;
                output = &mut fut => return output,
                _ = ticker.tick() => heartbeat_status(encoder, label, started).await,
            }
        }
    }

    /// Emit the history snapshot followed by the terminal event.
    async fn finish(
        &self,
        conversation: &Conversation,
        encoder: &mut EventEncoder,
        terminal: ClientEvent<'_>,
    ) {
        for event in [ClientEvent::History(conversation.turns()), terminal] {
            if let Err(e) = encoder.emit(event).await {
                debug!(error = %e, "terminal events not delivered");
                return;
            }
        }
    }
}

/// Advisory keepalive; a failed send is noticed at the next real event.
async fn heartbeat_status(encoder: &mut EventEncoder, label: &str, started: Instant) {
    if encoder.is_closed() {
        return;
    }
    let message = format!("{label}... ({}s)", started.elapsed().as_secs());
    if let Err(e) = encoder.emit(ClientEvent::Status(&message)).await {
        debug!(error = %e, "heartbeat not delivered");
    }
}

/// Emit one event. `Ok(false)` means the client has disconnected.
async fn deliver(encoder: &mut EventEncoder, event: ClientEvent<'_>) -> Result<bool, LoopError> {
    match encoder.emit(event).await {
        Ok(()) => Ok(true),
        Err(EncoderError::Closed) => Ok(false),
        Err(e) => Err(LoopError::Encoder(e)),
    }
}
