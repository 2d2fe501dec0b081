use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u16(profile: &str, key: &str, default: u16) -> u16 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Split a comma-separated list, trimming and lowercasing entries.
pub fn parse_user_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|u| u.trim().to_lowercase())
        .filter(|u| !u.is_empty())
        .collect()
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub agent: AgentConfig,
    pub provisions_db: ProvisionsDbConfig,
    pub cost_monitor: CostMonitorConfig,
    pub pricing: PricingConfig,
    pub reports: ReportsConfig,
    pub auth: AuthConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `PARSEC_PROFILE`. When set (e.g. `PROD`), every key
    /// is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("PARSEC_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            server: ServerConfig::from_env_profiled(p),
            llm: LlmConfig::from_env_profiled(p),
            agent: AgentConfig::from_env_profiled(p),
            provisions_db: ProvisionsDbConfig::from_env_profiled(p),
            cost_monitor: CostMonitorConfig::from_env_profiled(p),
            pricing: PricingConfig::from_env_profiled(p),
            reports: ReportsConfig::from_env_profiled(p),
            auth: AuthConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Reject settings the agent loop cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.max_rounds == 0 {
            return Err(ConfigError::Invalid {
                key: "AGENT_MAX_ROUNDS",
                value: self.agent.max_rounds.to_string(),
            });
        }
        if self.provisions_db.max_rows == 0 {
            return Err(ConfigError::Invalid {
                key: "PG_MAX_ROWS",
                value: self.provisions_db.max_rows.to_string(),
            });
        }
        self.llm.require_api_key()?;
        Ok(())
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  server:        {}:{}", self.server.host, self.server.port);
        tracing::info!("  llm:           model={}, configured={}", self.llm.model, self.llm.is_configured());
        tracing::info!(
            "  agent:         max_rounds={}, tool_timeout={}s, heartbeat={}s",
            self.agent.max_rounds, self.agent.tool_timeout_secs, self.agent.heartbeat_secs
        );
        tracing::info!(
            "  provisions_db: host={}, db={}, max_rows={}",
            self.provisions_db.host, self.provisions_db.database, self.provisions_db.max_rows
        );
        tracing::info!("  cost_monitor:  url={}", self.cost_monitor.api_url);
        tracing::info!(
            "  pricing:       cache={}",
            self.pricing.cache_path.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "(none)".into())
        );
        tracing::info!("  reports:       dir={}", self.reports.dir.display());
        tracing::info!("  auth:          allowed_users={}", self.auth.allowed_users.len());
    }

    /// Return a redacted view safe for API responses (no secrets).
    pub fn redacted_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "profile": self.profile_label(),
            "server": { "host": self.server.host, "port": self.server.port },
            "llm": {
                "model": self.llm.model,
                "base_url": self.llm.base_url,
                "configured": self.llm.is_configured(),
            },
            "agent": {
                "max_rounds": self.agent.max_rounds,
                "tool_timeout_secs": self.agent.tool_timeout_secs,
                "heartbeat_secs": self.agent.heartbeat_secs,
                "history_token_budget": self.agent.history_token_budget,
            },
            "provisions_db": {
                "host": self.provisions_db.host,
                "port": self.provisions_db.port,
                "database": self.provisions_db.database,
                "max_rows": self.provisions_db.max_rows,
                "statement_timeout_ms": self.provisions_db.statement_timeout_ms,
                "configured": self.provisions_db.is_configured(),
            },
            "cost_monitor": { "api_url": self.cost_monitor.api_url },
            "pricing": { "cache_path": self.pricing.cache_path, "max_age_hours": self.pricing.max_age_hours },
            "reports": { "dir": self.reports.dir },
            "auth": { "restricted": !self.auth.allowed_users.is_empty() },
        })
    }
}

// ── Server ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origin: String,
}

impl ServerConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            host: profiled_env_or(p, "HOST", "0.0.0.0"),
            port: profiled_env_u16(p, "PORT", 8000),
            cors_origin: profiled_env_or(p, "CORS_ORIGIN", "*"),
        }
    }
}

// ── LLM (Anthropic) ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl LlmConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            api_key: profiled_env_opt(p, "ANTHROPIC_API_KEY"),
            model: profiled_env_or(p, "ANTHROPIC_MODEL", "claude-sonnet-4-20250514"),
            base_url: profiled_env_or(p, "ANTHROPIC_BASE_URL", "https://api.anthropic.com"),
            temperature: profiled_env_or(p, "LLM_TEMPERATURE", "0.0")
                .parse()
                .unwrap_or(0.0),
            max_tokens: profiled_env_u32(p, "LLM_MAX_TOKENS", 4096),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.api_key.as_deref().ok_or(ConfigError::Missing("ANTHROPIC_API_KEY"))
    }
}

// ── Agent loop ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub max_rounds: usize,
    pub tool_timeout_secs: u64,
    pub heartbeat_secs: u64,
    /// Approximate token budget for the history sent to the model.
    pub history_token_budget: usize,
    pub system_prompt_path: Option<PathBuf>,
}

impl AgentConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            max_rounds: profiled_env_u32(p, "AGENT_MAX_ROUNDS", 10) as usize,
            tool_timeout_secs: profiled_env_u64(p, "AGENT_TOOL_TIMEOUT_SECS", 60),
            heartbeat_secs: profiled_env_u64(p, "AGENT_HEARTBEAT_SECS", 10),
            history_token_budget: profiled_env_u64(p, "AGENT_HISTORY_TOKEN_BUDGET", 150_000) as usize,
            system_prompt_path: profiled_env_opt(p, "AGENT_SYSTEM_PROMPT_PATH").map(PathBuf::from),
        }
    }
}

// ── Provisions DB (PostgreSQL) ────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionsDbConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl_mode: String,
    pub max_connections: u32,
    pub max_rows: usize,
    pub statement_timeout_ms: u64,
}

impl ProvisionsDbConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            host: profiled_env_or(p, "PG_HOST", "localhost"),
            port: profiled_env_u16(p, "PG_PORT", 5432),
            database: profiled_env_or(p, "PG_DATABASE", "provision_db"),
            username: profiled_env_opt(p, "PG_USERNAME"),
            password: profiled_env_opt(p, "PG_PASSWORD"),
            ssl_mode: profiled_env_or(p, "PG_SSL_MODE", "prefer"),
            max_connections: profiled_env_u32(p, "PG_MAX_CONNECTIONS", 10),
            max_rows: profiled_env_u32(p, "PG_MAX_ROWS", 500) as usize,
            statement_timeout_ms: profiled_env_u64(p, "PG_STATEMENT_TIMEOUT_MS", 30_000),
        }
    }

    pub fn connection_string(&self) -> String {
        let user = self.username.as_deref().unwrap_or("postgres");
        let pass = self.password.as_deref().unwrap_or("");
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            user, pass, self.host, self.port, self.database, self.ssl_mode
        )
    }

    pub fn is_configured(&self) -> bool {
        self.username.is_some()
    }
}

// ── Cost monitor dashboard API ────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostMonitorConfig {
    pub api_url: String,
    /// User-facing dashboard link included in tool results.
    pub dashboard_url: Option<String>,
}

impl CostMonitorConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            api_url: profiled_env_or(p, "COST_MONITOR_API_URL", "http://cost-data-service:8000"),
            dashboard_url: profiled_env_opt(p, "COST_MONITOR_DASHBOARD_URL"),
        }
    }
}

// ── Pricing cache ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    pub cache_path: Option<PathBuf>,
    pub max_age_hours: u64,
}

impl PricingConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            cache_path: profiled_env_opt(p, "PRICING_CACHE_PATH").map(PathBuf::from),
            max_age_hours: profiled_env_u64(p, "PRICING_MAX_AGE_HOURS", 168),
        }
    }
}

// ── Reports ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportsConfig {
    pub dir: PathBuf,
}

impl ReportsConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            dir: PathBuf::from(profiled_env_or(p, "REPORTS_DIR", "reports")),
        }
    }
}

// ── Auth ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Lowercased identities; empty means no restriction.
    pub allowed_users: Vec<String>,
}

impl AuthConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            allowed_users: parse_user_list(&profiled_env_or(p, "ALLOWED_USERS", "")),
        }
    }

    pub fn is_allowed(&self, user: Option<&str>) -> bool {
        if self.allowed_users.is_empty() {
            return true;
        }
        match user {
            Some(u) => {
                let u = u.trim().to_lowercase();
                self.allowed_users.iter().any(|a| *a == u)
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_user_list() {
        assert_eq!(
            parse_user_list(" Alice@Example.com, ,bob@example.com "),
            vec!["alice@example.com".to_string(), "bob@example.com".to_string()]
        );
        assert!(parse_user_list("").is_empty());
    }

    #[test]
    fn test_auth_unrestricted_when_empty() {
        let auth = AuthConfig::default();
        assert!(auth.is_allowed(None));
        assert!(auth.is_allowed(Some("anyone@example.com")));
    }

    #[test]
    fn test_auth_restricted() {
        let auth = AuthConfig {
            allowed_users: vec!["alice@example.com".to_string()],
        };
        assert!(auth.is_allowed(Some("ALICE@example.com")));
        assert!(!auth.is_allowed(Some("mallory@example.com")));
        assert!(!auth.is_allowed(None));
    }

    #[test]
    fn test_profiled_lookup_prefers_prefixed_key() {
        std::env::set_var("CFGTEST_PG_MAX_ROWS", "42");
        std::env::set_var("CFGTEST_AGENT_MAX_ROUNDS", "3");
        let config = Config::for_profile("cfgtest");
        assert_eq!(config.profile, "CFGTEST");
        assert_eq!(config.provisions_db.max_rows, 42);
        assert_eq!(config.agent.max_rounds, 3);
        std::env::remove_var("CFGTEST_PG_MAX_ROWS");
        std::env::remove_var("CFGTEST_AGENT_MAX_ROUNDS");
    }

    #[test]
    fn test_validate_rejects_zero_rounds() {
        let mut config = Config::for_profile("cfgtest_unused");
        config.llm.api_key = Some("sk-test".to_string());
        config.agent.max_rounds = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "AGENT_MAX_ROUNDS", .. })
        ));
    }

    #[test]
    fn test_validate_requires_api_key() {
        let mut config = Config::for_profile("cfgtest_unused");
        config.llm.api_key = None;
        config.agent.max_rounds = 10;
        config.provisions_db.max_rows = 500;
        assert!(matches!(config.validate(), Err(ConfigError::Missing("ANTHROPIC_API_KEY"))));
    }

    #[test]
    fn test_connection_string() {
        let mut config = Config::for_profile("cfgtest_unused");
        config.provisions_db.username = Some("reader".to_string());
        config.provisions_db.password = Some("pw".to_string());
        config.provisions_db.host = "db.internal".to_string();
        config.provisions_db.port = 5433;
        config.provisions_db.database = "provision_db".to_string();
        config.provisions_db.ssl_mode = "require".to_string();
        assert_eq!(
            config.provisions_db.connection_string(),
            "postgres://reader:pw@db.internal:5433/provision_db?sslmode=require"
        );
    }
}
