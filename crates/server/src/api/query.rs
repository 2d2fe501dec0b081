//! Investigation query endpoint.
//!
//! Streams the orchestrator's progress as Server-Sent Events. Event names
//! match the encoder's event kinds:
//! - `status`      -- progress and keepalive messages
//! - `text-delta`  -- assistant text as it is generated
//! - `tool-start` / `tool-result` -- one pair per tool call
//! - `chart` / `report` -- artifacts produced by tools
//! - `history`     -- the full transcript, sent once before the terminal event
//! - `done` / `error` -- exactly one, always last

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{info, warn, Instrument};

use parsec_tool_runtime::context::with_current_date;
use parsec_tool_runtime::{Conversation, EventEncoder, Termination, ToolContext, Turn};

use crate::auth::ForwardedUser;
use crate::state::AppState;

use super::{api_error, ApiError};

/// Buffered events per request before the orchestrator waits on the client.
const EVENT_BUFFER: usize = 64;

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub question: String,
    /// Transcript from earlier questions in the same session.
    #[serde(default)]
    pub conversation_history: Vec<Turn>,
}

pub async fn query(
    State(state): State<Arc<AppState>>,
    user: Option<Extension<ForwardedUser>>,
    Json(req): Json<QueryRequest>,
) -> Result<Response, ApiError> {
    let question = req.question.trim().to_string();
    if question.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "question must not be empty"));
    }

    let system_prompt = with_current_date(&state.system_prompt, chrono::Utc::now().date_naive());
    let conversation = Conversation::from_turns(Some(system_prompt), req.conversation_history)
        .map_err(|e| {
            warn!(error = %e, "rejected conversation history");
            api_error(StatusCode::BAD_REQUEST, format!("invalid conversation_history: {e}"))
        })?;

    let context = ToolContext {
        request_id: uuid::Uuid::new_v4().to_string(),
        user: user.and_then(|Extension(ForwardedUser(u))| u),
    };
    info!(
        request_id = %context.request_id,
        user = context.user.as_deref().unwrap_or("(anonymous)"),
        prior_turns = conversation.len(),
        "query received"
    );

    let (mut encoder, rx) = EventEncoder::channel(EVENT_BUFFER);
    let orchestrator = state.orchestrator.clone();
    let span = tracing::info_span!("query", request_id = %context.request_id);
    tokio::spawn(
        async move {
            let outcome = orchestrator
                .run(conversation, question, &context, &mut encoder)
                .await;
            match &outcome.termination {
                Termination::Completed => info!(rounds = outcome.rounds, "query answered"),
                Termination::RoundCapExceeded => warn!(rounds = outcome.rounds, "query hit round cap"),
                Termination::Disconnected => info!(rounds = outcome.rounds, "client disconnected"),
                Termination::Failed(e) => warn!(rounds = outcome.rounds, error = %e, "query failed"),
            }
        }
        .instrument(span),
    );

    let stream = ReceiverStream::new(rx).map(|event| {
        Ok::<_, Infallible>(
            Event::default()
                .event(event.kind.as_str())
                .id(event.seq.to_string())
                .data(event.data),
        )
    });

    Ok((
        [("x-accel-buffering", "no")],
        Sse::new(stream).keep_alive(KeepAlive::default()),
    )
        .into_response())
}
