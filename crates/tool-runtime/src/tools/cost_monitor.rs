//! Aggregated spend from the cost-monitor data service.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use crate::tool::{required_str, Tool, ToolContext, ToolDefinition, ToolError, ToolProfile};

pub const TOOL_NAME: &str = "query_cost_monitor";

const DEFAULT_TOP_N: u64 = 25;

/// `query_cost_monitor`: summary, breakdown and drilldown of cloud spend.
pub struct CostMonitorTool {
    client: reqwest::Client,
    api_url: String,
    dashboard_url: Option<String>,
}

impl CostMonitorTool {
    pub fn new(api_url: impl Into<String>, dashboard_url: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            dashboard_url,
        }
    }
}

/// Resolve the endpoint URL and query parameters for one call.
fn build_request(base: &str, input: &Value) -> Result<(String, Vec<(String, String)>), ToolError> {
    let endpoint = required_str(input, "endpoint")?;
    let start = required_str(input, "start_date")?;
    let end = required_str(input, "end_date")?;
    let opt = |key: &str| input.get(key).and_then(|v| v.as_str()).filter(|s| !s.is_empty());

    let mut params = vec![
        ("start_date".to_string(), start.to_string()),
        ("end_date".to_string(), end.to_string()),
    ];

    let path = match endpoint {
        "summary" => "/api/v1/costs/summary",
        "breakdown" => {
            if let Some(group_by) = opt("group_by") {
                params.push(("group_by".into(), group_by.to_string()));
            }
            let top_n = input
                .get("top_n")
                .and_then(|v| v.as_u64())
                .unwrap_or(DEFAULT_TOP_N);
            params.push(("top_n".into(), top_n.to_string()));
            "/api/v1/costs/aws/breakdown"
        }
        "drilldown" => {
            for key in ["drilldown_type", "selected_key"] {
                if let Some(value) = opt(key) {
                    params.push((key.to_string(), value.to_string()));
                }
            }
            "/api/v1/costs/aws/drilldown"
        }
        "providers" => "/api/v1/providers",
        other => {
            return Err(ToolError::InvalidInput(format!(
                "unknown endpoint '{other}', expected one of: summary, breakdown, drilldown, providers"
            )))
        }
    };

    // The service expects repeated params: ?providers=aws&providers=gcp
    if let Some(providers) = opt("providers") {
        for provider in providers.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            params.push(("providers".into(), provider.to_string()));
        }
    }

    Ok((format!("{base}{path}"), params))
}

/// Attach the user-facing dashboard link to a response.
fn with_dashboard_link(data: Value, dashboard_url: Option<&str>) -> Value {
    let Some(link) = dashboard_url.filter(|l| !l.is_empty()) else {
        return data;
    };
    match data {
        Value::Object(mut map) => {
            map.insert("_dashboard_link".into(), Value::String(link.to_string()));
            Value::Object(map)
        }
        Value::Array(items) => json!({"results": items, "_dashboard_link": link}),
        other => other,
    }
}

#[async_trait]
impl Tool for CostMonitorTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: TOOL_NAME.to_string(),
            description: "Query the cost-monitor service for aggregated cloud spend across \
                          providers: totals (summary), top accounts or instance types \
                          (breakdown), one account or instance type in detail (drilldown), \
                          or the list of configured providers."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "endpoint": {
                        "type": "string",
                        "enum": ["summary", "breakdown", "drilldown", "providers"]
                    },
                    "start_date": {"type": "string", "description": "YYYY-MM-DD"},
                    "end_date": {"type": "string", "description": "YYYY-MM-DD"},
                    "providers": {
                        "type": "string",
                        "description": "Comma-separated provider filter, e.g. \"aws,azure\""
                    },
                    "group_by": {
                        "type": "string",
                        "enum": ["LINKED_ACCOUNT", "INSTANCE_TYPE"]
                    },
                    "top_n": {"type": "integer", "minimum": 1, "maximum": 500},
                    "drilldown_type": {
                        "type": "string",
                        "enum": ["account_services", "instance_details"]
                    },
                    "selected_key": {
                        "type": "string",
                        "description": "Account id or instance type to drill into"
                    }
                },
                "required": ["endpoint", "start_date", "end_date"]
            }),
        }
    }

    fn profile(&self) -> ToolProfile {
        ToolProfile {
            status_label: Some("Querying cost monitor".to_string()),
            ..ToolProfile::default()
        }
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<Value, ToolError> {
        let (url, params) = build_request(&self.api_url, &input)?;
        debug!(request_id = %context.request_id, %url, "querying cost monitor");

        let response = self
            .client
            .get(&url)
            .query(&params)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "cost monitor unreachable");
                if e.is_connect() {
                    ToolError::ExecutionFailed(
                        "cannot reach the cost-monitor service".to_string(),
                    )
                } else {
                    ToolError::ExecutionFailed(format!("cost-monitor request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let excerpt: String = body.chars().take(500).collect();
            return Err(ToolError::ExecutionFailed(format!(
                "cost-monitor API returned {}: {excerpt}",
                status.as_u16()
            )));
        }

        let data: Value = response.json().await.map_err(|e| {
            ToolError::ExecutionFailed(format!("cost-monitor returned invalid JSON: {e}"))
        })?;
        Ok(with_dashboard_link(data, self.dashboard_url.as_deref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_request() {
        let (url, params) = build_request(
            "http://cost:8000",
            &json!({"endpoint": "summary", "start_date": "2026-09-01", "end_date": "2026-09-30",
                    "providers": "aws, azure"}),
        )
        .unwrap();
        assert_eq!(url, "http://cost:8000/api/v1/costs/summary");
        assert_eq!(
            params,
            vec![
                ("start_date".to_string(), "2026-09-01".to_string()),
                ("end_date".to_string(), "2026-09-30".to_string()),
                ("providers".to_string(), "aws".to_string()),
                ("providers".to_string(), "azure".to_string()),
            ]
        );
    }

    #[test]
    fn test_breakdown_defaults_top_n() {
        let (url, params) = build_request(
            "http://cost:8000",
            &json!({"endpoint": "breakdown", "start_date": "a", "end_date": "b",
                    "group_by": "INSTANCE_TYPE"}),
        )
        .unwrap();
        assert!(url.ends_with("/api/v1/costs/aws/breakdown"));
        assert!(params.contains(&("group_by".to_string(), "INSTANCE_TYPE".to_string())));
        assert!(params.contains(&("top_n".to_string(), "25".to_string())));
    }

    #[test]
    fn test_drilldown_params() {
        let (_, params) = build_request(
            "http://cost:8000",
            &json!({"endpoint": "drilldown", "start_date": "a", "end_date": "b",
                    "drilldown_type": "account_services", "selected_key": "123456789012"}),
        )
        .unwrap();
        assert!(params.contains(&("selected_key".to_string(), "123456789012".to_string())));
    }

    #[test]
    fn test_unknown_endpoint() {
        let err = build_request(
            "http://cost:8000",
            &json!({"endpoint": "forecast", "start_date": "a", "end_date": "b"}),
        )
        .unwrap_err();
        assert!(matches!(err, ToolError::InvalidInput(m) if m.contains("forecast")));
    }

    #[test]
    fn test_dashboard_link() {
        let link = Some("https://costs.example.com");
        assert_eq!(
            with_dashboard_link(json!({"total": 3.5}), link),
            json!({"total": 3.5, "_dashboard_link": "https://costs.example.com"})
        );
        assert_eq!(
            with_dashboard_link(json!(["aws"]), link),
            json!({"results": ["aws"], "_dashboard_link": "https://costs.example.com"})
        );
        assert_eq!(with_dashboard_link(json!({"a": 1}), None), json!({"a": 1}));
    }
}
