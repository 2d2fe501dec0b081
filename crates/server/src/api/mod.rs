//! HTTP endpoint modules.
//!
//! Each sub-module owns a single responsibility area; shared types live here.

mod health;
mod query;
mod reports;

use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

// ── Shared types ─────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct QueryErrorResponse {
    pub error: String,
}

pub type ApiError = (StatusCode, Json<QueryErrorResponse>);

pub(crate) fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(QueryErrorResponse {
            error: error.into(),
        }),
    )
}

// ── Re-exports ───────────────────────────────────────────────────

pub use health::{health, ready};
pub use query::{query, QueryRequest};
pub use reports::download_report;
