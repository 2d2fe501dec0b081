//! Read-only SQL against the provisioning database.
//!
//! The tool only hands a backend a [`BoundedQuery`], which can only be built
//! from text the validator allowed. The Postgres backend adds its own layer:
//! a read-only transaction, a transaction-local `statement_timeout`, and a
//! `LIMIT max_rows + 1` wrapper so truncation is detectable.

use async_trait::async_trait;
use parsec_core::config::ProvisionsDbConfig;
use serde_json::{json, Map, Value};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::sql_guard::{BoundedQuery, QueryLimits, QueryValidator};
use crate::tool::{required_str, Tool, ToolContext, ToolDefinition, ToolError, ToolProfile};

pub const TOOL_NAME: &str = "query_provisions_db";

/// Postgres error code for a cancelled statement (statement_timeout).
const QUERY_CANCELED: &str = "57014";

/// Rows returned by a backend, column order preserved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Map<String, Value>>,
}

/// Executes bounded queries. Implementations return at most
/// `max_rows + 1` rows and must enforce the statement timeout.
#[async_trait]
pub trait QueryBackend: Send + Sync {
    async fn fetch(&self, query: &BoundedQuery) -> Result<QueryRows, ToolError>;

    /// Cheap connectivity check.
    async fn ping(&self) -> Result<(), ToolError>;
}

pub struct PgQueryBackend {
    pool: PgPool,
}

impl PgQueryBackend {
    /// Build a pool that connects on first use.
    pub fn connect_lazy(config: &ProvisionsDbConfig) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect_lazy(&config.connection_string())?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn db_error(limits: QueryLimits) -> impl Fn(sqlx::Error) -> ToolError {
    move |e| match &e {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(QUERY_CANCELED) => {
            ToolError::Timeout(limits.statement_timeout)
        }
        _ => ToolError::ExecutionFailed(format!("query execution failed: {e}")),
    }
}

#[async_trait]
impl QueryBackend for PgQueryBackend {
    async fn fetch(&self, query: &BoundedQuery) -> Result<QueryRows, ToolError> {
        let limits = query.limits();
        let map_err = db_error(limits);

        let mut tx = self.pool.begin().await.map_err(&map_err)?;
        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(&map_err)?;
        let timeout = format!(
            "SET LOCAL statement_timeout = {}",
            limits.statement_timeout.as_millis()
        );
        sqlx::query(&timeout)
            .execute(&mut *tx)
            .await
            .map_err(&map_err)?;

        // Newlines keep a trailing line comment in the query from
        // swallowing the wrapper.
        let wrapped = format!(
            "SELECT row_to_json(parsec_bounded)::text FROM (\n{}\n) AS parsec_bounded LIMIT {}",
            query.sql(),
            limits.max_rows + 1
        );
        let raw: Vec<String> = sqlx::query_scalar::<_, String>(&wrapped)
            .fetch_all(&mut *tx)
            .await
            .map_err(&map_err)?;
        tx.rollback().await.map_err(&map_err)?;

        let mut rows = Vec::with_capacity(raw.len());
        for text in raw {
            match serde_json::from_str::<Value>(&text) {
                Ok(Value::Object(row)) => rows.push(row),
                Ok(other) => {
                    return Err(ToolError::ExecutionFailed(format!(
                        "unexpected row shape: {other}"
                    )))
                }
                Err(e) => {
                    return Err(ToolError::ExecutionFailed(format!("undecodable row: {e}")))
                }
            }
        }
        let columns = rows
            .first()
            .map(|row| row.keys().cloned().collect())
            .unwrap_or_default();
        Ok(QueryRows { columns, rows })
    }

    async fn ping(&self) -> Result<(), ToolError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| ToolError::ExecutionFailed(format!("database unreachable: {e}")))
    }
}

/// `query_provisions_db`: validated, bounded SQL against the provisioning DB.
pub struct ProvisionsDbTool {
    backend: Arc<dyn QueryBackend>,
    validator: Arc<dyn QueryValidator>,
    limits: QueryLimits,
}

impl ProvisionsDbTool {
    pub fn new(
        backend: Arc<dyn QueryBackend>,
        validator: Arc<dyn QueryValidator>,
        limits: QueryLimits,
    ) -> Self {
        Self {
            backend,
            validator,
            limits,
        }
    }
}

#[async_trait]
impl Tool for ProvisionsDbTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: TOOL_NAME.to_string(),
            description: format!(
                "Run one read-only SQL query (SELECT or WITH) against the provisioning \
                 database (PostgreSQL). At most {} rows are returned; `truncated` is true \
                 when more rows matched.",
                self.limits.max_rows
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "sql": {
                        "type": "string",
                        "description": "A single SELECT or WITH statement"
                    },
                    "purpose": {
                        "type": "string",
                        "description": "One line on what this query is meant to find"
                    }
                },
                "required": ["sql"],
                "additionalProperties": false
            }),
        }
    }

    fn profile(&self) -> ToolProfile {
        ToolProfile {
            query_input: Some("sql"),
            timeout: Some(self.limits.statement_timeout + Duration::from_secs(5)),
            status_label: Some("Querying provisions database".to_string()),
            ..ToolProfile::default()
        }
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<Value, ToolError> {
        let sql = required_str(&input, "sql")?;

        // Also enforced by the orchestrator; the tool never trusts its caller.
        let validated = self
            .validator
            .validate(sql)
            .into_result()
            .map_err(|reason| {
                warn!(request_id = %context.request_id, %reason, "rejected SQL");
                ToolError::Rejected(reason.to_string())
            })?;

        debug!(request_id = %context.request_id, sql = validated.sql(), "running provisions query");
        let QueryRows { columns, mut rows } =
            self.backend.fetch(&validated.bounded(self.limits)).await?;

        let truncated = rows.len() > self.limits.max_rows;
        rows.truncate(self.limits.max_rows);

        Ok(json!({
            "columns": columns,
            "row_count": rows.len(),
            "rows": rows,
            "truncated": truncated,
        }))
    }
}
