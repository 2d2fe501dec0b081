//! Server startup: tool registry and shared state initialization.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use parsec_core::Config;
use parsec_tool_runtime::context::load_system_prompt;
use parsec_tool_runtime::tools::{
    CostMonitorTool, GenerateReportTool, InMemoryPricingCache, PgQueryBackend, PricingLookupTool,
    ProvisionsDbTool, QueryBackend, RenderChartTool,
};
use parsec_tool_runtime::{
    Orchestrator, QueryLimits, ReadOnlySqlValidator, ToolAwareLlmProvider, ToolRegistry,
};

use crate::state::AppState;

/// Register the built-in tools. Returns the provisions backend too, when the
/// database is configured, so the readiness probe can reach it.
pub fn build_registry(
    config: &Config,
) -> anyhow::Result<(ToolRegistry, Option<Arc<dyn QueryBackend>>)> {
    let mut registry = ToolRegistry::new();

    let provisions: Option<Arc<dyn QueryBackend>> = if config.provisions_db.is_configured() {
        let backend = PgQueryBackend::connect_lazy(&config.provisions_db)
            .context("invalid provisions database settings")?;
        Some(Arc::new(backend))
    } else {
        warn!("Provisions database not configured -- query_provisions_db disabled");
        None
    };
    if let Some(backend) = &provisions {
        registry.register(ProvisionsDbTool::new(
            backend.clone(),
            Arc::new(ReadOnlySqlValidator),
            QueryLimits {
                max_rows: config.provisions_db.max_rows,
                statement_timeout: Duration::from_millis(config.provisions_db.statement_timeout_ms),
            },
        ))?;
    }

    registry.register(CostMonitorTool::new(
        config.cost_monitor.api_url.clone(),
        config.cost_monitor.dashboard_url.clone(),
    ))?;

    let cache = match &config.pricing.cache_path {
        Some(path) => InMemoryPricingCache::load_json(path).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "pricing cache unavailable, starting empty");
            InMemoryPricingCache::new()
        }),
        None => InMemoryPricingCache::new(),
    };
    registry.register(PricingLookupTool::new(
        Arc::new(cache),
        config.pricing.max_age_hours,
    ))?;

    registry.register(RenderChartTool)?;
    registry.register(GenerateReportTool::new(config.reports.dir.clone()))?;

    info!(
        tools = ?registry.list().iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
        "Tool registry ready"
    );
    Ok((registry, provisions))
}

/// Build `AppState` around an already-constructed model provider.
pub fn build_app_state(
    config: &Config,
    provider: Arc<dyn ToolAwareLlmProvider>,
) -> anyhow::Result<Arc<AppState>> {
    let (registry, provisions) = build_registry(config)?;

    let orchestrator = Orchestrator::new(provider, Arc::new(registry))
        .with_max_rounds(config.agent.max_rounds)
        .with_tool_timeout(Duration::from_secs(config.agent.tool_timeout_secs))
        .with_heartbeat(Duration::from_secs(config.agent.heartbeat_secs.max(1)))
        .with_history_budget(config.agent.history_token_budget)
        .with_temperature(config.llm.temperature)
        .with_max_tokens(config.llm.max_tokens);

    Ok(Arc::new(AppState {
        orchestrator: Arc::new(orchestrator),
        system_prompt: load_system_prompt(config.agent.system_prompt_path.as_deref()),
        reports_dir: config.reports.dir.clone(),
        auth: config.auth.clone(),
        cors_origin: config.server.cors_origin.clone(),
        provisions,
    }))
}
