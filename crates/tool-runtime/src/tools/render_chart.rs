use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{
    required_str, ArtifactKind, Tool, ToolContext, ToolDefinition, ToolError, ToolProfile,
};

pub const TOOL_NAME: &str = "render_chart";

const CHART_TYPES: &[&str] = &["bar", "line", "pie", "area", "scatter"];

/// `render_chart`: checks a chart spec and hands it back for the client to draw.
pub struct RenderChartTool;

#[async_trait]
impl Tool for RenderChartTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: TOOL_NAME.to_string(),
            description: "Display a chart to the user. Every dataset must have one value \
                          per label."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "chart_type": {"type": "string", "enum": CHART_TYPES},
                    "title": {"type": "string"},
                    "labels": {"type": "array", "items": {"type": "string"}},
                    "datasets": {
                        "type": "array",
                        "minItems": 1,
                        "items": {
                            "type": "object",
                            "properties": {
                                "label": {"type": "string"},
                                "data": {"type": "array", "items": {"type": "number"}}
                            },
                            "required": ["label", "data"]
                        }
                    },
                    "y_axis_label": {"type": "string"}
                },
                "required": ["chart_type", "labels", "datasets"]
            }),
        }
    }

    fn profile(&self) -> ToolProfile {
        ToolProfile {
            artifact: Some(ArtifactKind::Chart),
            ..ToolProfile::default()
        }
    }

    async fn execute(&self, input: Value, _context: &ToolContext) -> Result<Value, ToolError> {
        let chart_type = required_str(&input, "chart_type")?;
        let labels = input
            .get("labels")
            .and_then(|v| v.as_array())
            .ok_or_else(|| ToolError::InvalidInput("missing 'labels' array".to_string()))?;
        let datasets = input
            .get("datasets")
            .and_then(|v| v.as_array())
            .ok_or_else(|| ToolError::InvalidInput("missing 'datasets' array".to_string()))?;

        for dataset in datasets {
            let len = dataset
                .get("data")
                .and_then(|d| d.as_array())
                .map_or(0, |d| d.len());
            if len != labels.len() {
                let name = dataset.get("label").and_then(|l| l.as_str()).unwrap_or("?");
                return Err(ToolError::InvalidInput(format!(
                    "dataset '{name}' has {len} values for {} labels",
                    labels.len()
                )));
            }
        }

        let mut spec = json!({
            "type": chart_type,
            "labels": labels,
            "datasets": datasets,
        });
        for key in ["title", "y_axis_label"] {
            if let Some(value) = input.get(key).filter(|v| v.is_string()) {
                spec[key] = value.clone();
            }
        }
        Ok(spec)
    }
}
