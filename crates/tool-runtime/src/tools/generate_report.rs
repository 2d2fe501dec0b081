//! Report files written to the reports directory for download.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::info;

use crate::tool::{
    required_str, ArtifactKind, Tool, ToolContext, ToolDefinition, ToolError, ToolProfile,
};

pub const TOOL_NAME: &str = "generate_report";

const MAX_STEM_CHARS: usize = 100;

/// Report output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Markdown,
    AsciiDoc,
}

impl ReportFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "markdown" => Some(ReportFormat::Markdown),
            "asciidoc" => Some(ReportFormat::AsciiDoc),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReportFormat::Markdown => "markdown",
            ReportFormat::AsciiDoc => "asciidoc",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ReportFormat::Markdown => "md",
            ReportFormat::AsciiDoc => "adoc",
        }
    }

    /// MIME type used when serving the file.
    pub fn content_type(&self) -> &'static str {
        match self {
            ReportFormat::Markdown => "text/markdown; charset=utf-8",
            ReportFormat::AsciiDoc => "text/asciidoc; charset=utf-8",
        }
    }

    pub fn from_filename(name: &str) -> Option<Self> {
        match name.rsplit_once('.')?.1 {
            "md" => Some(ReportFormat::Markdown),
            "adoc" => Some(ReportFormat::AsciiDoc),
            _ => None,
        }
    }
}

/// Reduce a requested name to `[A-Za-z0-9_-]`, or `None` if nothing is left.
fn sanitize_stem(requested: &str) -> Option<String> {
    let stem: String = requested
        .trim()
        .trim_end_matches(".md")
        .trim_end_matches(".adoc")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_STEM_CHARS)
        .collect();
    let stem = stem.trim_matches('_').to_string();
    (!stem.is_empty()).then_some(stem)
}

/// True for names this service could have written: a sanitized stem plus a
/// report extension, with no path components.
pub fn is_servable_report_name(name: &str) -> bool {
    let Some((stem, _)) = name.rsplit_once('.') else {
        return false;
    };
    ReportFormat::from_filename(name).is_some()
        && !stem.is_empty()
        && stem.len() <= MAX_STEM_CHARS
        && stem
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// `generate_report`: writes Markdown or AsciiDoc for the user to download.
pub struct GenerateReportTool {
    dir: PathBuf,
}

impl GenerateReportTool {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl Tool for GenerateReportTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: TOOL_NAME.to_string(),
            description: "Save a formatted report (Markdown or AsciiDoc) that the user can \
                          download. Include an executive summary, findings and data tables."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "title": {"type": "string"},
                    "content": {"type": "string", "description": "Full report body"},
                    "format": {"type": "string", "enum": ["markdown", "asciidoc"]},
                    "filename": {
                        "type": "string",
                        "description": "Optional file name without extension"
                    }
                },
                "required": ["title", "content"]
            }),
        }
    }

    fn profile(&self) -> ToolProfile {
        ToolProfile {
            status_label: Some("Writing report".to_string()),
            artifact: Some(ArtifactKind::Report),
            ..ToolProfile::default()
        }
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<Value, ToolError> {
        let title = required_str(&input, "title")?;
        let content = required_str(&input, "content")?;
        let format_name = input
            .get("format")
            .and_then(|v| v.as_str())
            .unwrap_or("markdown");
        let format = ReportFormat::parse(format_name).ok_or_else(|| {
            ToolError::InvalidInput(format!(
                "unknown format '{format_name}', expected markdown or asciidoc"
            ))
        })?;

        let stem = input
            .get("filename")
            .and_then(|v| v.as_str())
            .and_then(sanitize_stem)
            .unwrap_or_else(|| format!("investigation_report_{}", Utc::now().format("%Y-%m-%d")));
        let filename = format!("{stem}.{}", format.extension());
        let path = self.dir.join(&filename);

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("cannot create reports dir: {e}")))?;
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("cannot write report: {e}")))?;

        info!(request_id = %context.request_id, path = %path.display(), "Report saved");

        Ok(json!({
            "filename": filename,
            "format": format.as_str(),
            "title": title,
            "path": path.display().to_string(),
            "size_bytes": content.len(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_stem() {
        assert_eq!(sanitize_stem("gpu abuse/q3"), Some("gpu_abuse_q3".to_string()));
        assert_eq!(sanitize_stem("../../etc/passwd"), Some("etc_passwd".to_string()));
        assert_eq!(sanitize_stem("summary.md"), Some("summary".to_string()));
        assert_eq!(sanitize_stem("///"), None);
        assert_eq!(sanitize_stem(""), None);
    }

    #[test]
    fn test_servable_names() {
        assert!(is_servable_report_name("investigation_report_2026-10-18.md"));
        assert!(is_servable_report_name("q3.adoc"));
        assert!(!is_servable_report_name("../secret.md"));
        assert!(!is_servable_report_name(".md"));
        assert!(!is_servable_report_name("notes.txt"));
        assert!(!is_servable_report_name("a/b.md"));
    }

    #[tokio::test]
    async fn test_writes_report() {
        let dir = tempfile::tempdir().unwrap();
        let tool = GenerateReportTool::new(dir.path().join("reports"));
        let out = tool
            .execute(
                json!({"title": "GPU usage", "content": "= GPU usage\n", "format": "asciidoc",
                       "filename": "gpu usage"}),
                &ToolContext::default(),
            )
            .await
            .unwrap();

        assert_eq!(out["filename"], "gpu_usage.adoc");
        assert_eq!(out["format"], "asciidoc");
        assert_eq!(out["size_bytes"], 12);
        let written = std::fs::read_to_string(dir.path().join("reports/gpu_usage.adoc")).unwrap();
        assert_eq!(written, "= GPU usage\n");
    }

    #[tokio::test]
    async fn test_default_filename() {
        let dir = tempfile::tempdir().unwrap();
        let tool = GenerateReportTool::new(dir.path());
        let out = tool
            .execute(json!({"title": "t", "content": "# t"}), &ToolContext::default())
            .await
            .unwrap();
        let name = out["filename"].as_str().unwrap();
        assert!(name.starts_with("investigation_report_"));
        assert!(name.ends_with(".md"));
        assert!(is_servable_report_name(name));
    }

    #[tokio::test]
    async fn test_rejects_unknown_format() {
        let dir = tempfile::tempdir().unwrap();
        let err = GenerateReportTool::new(dir.path())
            .execute(json!({"title": "t", "content": "c", "format": "pdf"}), &ToolContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidInput(_)));
    }
}
