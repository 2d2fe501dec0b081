//! Generated report downloads.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

use parsec_tool_runtime::tools::{is_servable_report_name, ReportFormat};

use crate::state::AppState;

use super::{api_error, ApiError};

/// Serve a file written by `generate_report`.
///
/// Names are checked against what the report tool can produce before touching
/// the filesystem, so paths outside the reports directory are unreachable.
pub async fn download_report(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    let format = ReportFormat::from_filename(&filename)
        .filter(|_| is_servable_report_name(&filename))
        .ok_or_else(|| {
            tracing::warn!(%filename, "rejected report name");
            api_error(StatusCode::NOT_FOUND, "Report not found")
        })?;

    let path = state.reports_dir.join(&filename);
    let body = tokio::fs::read(&path).await.map_err(|e| {
        tracing::debug!(path = %path.display(), error = %e, "report not readable");
        api_error(StatusCode::NOT_FOUND, "Report not found")
    })?;

    Ok((
        [
            (header::CONTENT_TYPE, format.content_type().to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        body,
    )
        .into_response())
}
