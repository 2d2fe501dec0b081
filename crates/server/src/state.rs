use std::path::PathBuf;
use std::sync::Arc;

use parsec_core::config::AuthConfig;
use parsec_tool_runtime::tools::QueryBackend;
use parsec_tool_runtime::Orchestrator;

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Base system prompt; today's date is appended per request.
    pub system_prompt: String,
    pub reports_dir: PathBuf,
    pub auth: AuthConfig,
    /// `*` or a single allowed origin.
    pub cors_origin: String,
    /// Provisions database, when configured. Used by the readiness probe.
    pub provisions: Option<Arc<dyn QueryBackend>>,
}
