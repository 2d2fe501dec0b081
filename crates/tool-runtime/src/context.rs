//! System prompt assembly.
//!
//! The investigator prompt is built in, can be replaced by a markdown file
//! (YAML front matter is stripped), and always ends with today's date so the
//! model can resolve relative date ranges.

use chrono::NaiveDate;
use std::path::Path;
use tracing::{info, warn};

const DEFAULT_SYSTEM_PROMPT: &str = r#"You are Parsec, an investigation assistant for a cloud cost investigation team. You answer questions about provisioning activity and cloud spend by querying real data sources. Never guess numbers: every figure you report must come from a tool result.

## Tools

- `query_provisions_db`: read-only SQL (PostgreSQL) against the provisioning database. One SELECT or WITH statement per call. Results are capped; check `truncated` and narrow the query when it is true.
- `query_cost_monitor`: aggregated spend from the cost dashboard (`summary`, `breakdown`, `drilldown`, `providers`).
- `query_pricing`: on-demand list prices from the pricing cache. Mention when the cached price is stale.
- `render_chart`: show a chart to the user. Provide a chart type, labels and one or more datasets.
- `generate_report`: write a Markdown or AsciiDoc report the user can download.

## Provisioning database

- `users(id, email)`
- `provisions(id, user_id -> users.id, catalog_id -> catalog_items.id, request_id -> provision_request.id, account_id, sandbox_name, cloud, state, created_at, updated_at, deleted_at)`
- `catalog_items(id, name, display_name, description)`
- `provision_request(id, catalog_id -> catalog_items.id, created_at)`
- `catalog_resource(id, catalog_item_id, parent_id)`

The effective catalog item of a provision is the request's root item when there is one:

```sql
SELECT p.id, COALESCE(root.name, component.name) AS catalog_name
FROM provisions p
JOIN catalog_items component ON p.catalog_id = component.id
LEFT JOIN provision_request pr ON p.request_id = pr.id
LEFT JOIN catalog_items root ON pr.catalog_id = root.id
```

`provisions.account_id` holds 12-digit AWS account ids; `provisions.sandbox_name` holds Azure subscription names.

## What looks suspicious

- GPU instance families (g4dn, g5, g6, p3, p4, p5) and Azure NC/ND/NV series
- Metal or very large instances (*.metal, *.96xlarge, *.48xlarge, *.24xlarge)
- External users with 50 or more provisions in 90 days
- Many accounts registered from disposable email domains

## How to work

- Look up account ids or sandbox names in the provisioning database before asking for their costs.
- Independent lookups can be requested together in one turn.
- If a tool returns an error, read it, adjust, and try again or explain what blocked you.
- Be concise. Show exact numbers and dates, and use markdown tables for tabular data.
- Produce a report only when the user asks for one."#;

/// Load the system prompt, preferring `override_path` when it is readable.
pub fn load_system_prompt(override_path: Option<&Path>) -> String {
    if let Some(path) = override_path {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let body = strip_frontmatter(&content);
                if !body.trim().is_empty() {
                    info!(path = %path.display(), "Loaded system prompt override");
                    return body;
                }
                warn!(path = %path.display(), "System prompt override is empty, using built-in prompt");
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read system prompt override, using built-in prompt");
            }
        }
    }
    DEFAULT_SYSTEM_PROMPT.to_string()
}

/// Append the current date to a prompt.
pub fn with_current_date(prompt: &str, today: NaiveDate) -> String {
    format!(
        "{}\n\nToday's date is {} ({}).",
        prompt.trim_end(),
        today.format("%Y-%m-%d"),
        today.format("%A")
    )
}

/// Strip YAML frontmatter (between `---` delimiters) from markdown content.
fn strip_frontmatter(content: &str) -> String {
    let trimmed = content.trim_start();
    let Some(rest) = trimmed.strip_prefix("---") else {
        return content.to_string();
    };
    match rest.find("\n---") {
        Some(end) => rest[end + 4..].trim_start_matches('\n').to_string(),
        None => content.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_strip_frontmatter() {
        let input = "---\nname: investigator\n---\n# Body\nContent here";
        assert_eq!(strip_frontmatter(input), "# Body\nContent here");
    }

    #[test]
    fn test_strip_frontmatter_no_frontmatter() {
        let input = "# Just markdown\nNo frontmatter";
        assert_eq!(strip_frontmatter(input), input);
    }

    #[test]
    fn test_default_prompt_mentions_tools() {
        let prompt = load_system_prompt(None);
        for tool in [
            "query_provisions_db",
            "query_cost_monitor",
            "query_pricing",
            "render_chart",
            "generate_report",
        ] {
            assert!(prompt.contains(tool), "{tool} missing from prompt");
        }
    }

    #[test]
    fn test_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "---\nversion: 2\n---\nYou audit invoices.").unwrap();
        assert_eq!(load_system_prompt(Some(file.path())), "You audit invoices.");
    }

    #[test]
    fn test_missing_override_falls_back() {
        let prompt = load_system_prompt(Some(Path::new("/nonexistent/prompt.md")));
        assert_eq!(prompt, DEFAULT_SYSTEM_PROMPT);
    }

    #[test]
    fn test_with_current_date() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        let prompt = with_current_date("Base prompt.\n", date);
        assert_eq!(prompt, "Base prompt.\n\nToday's date is 2026-10-18 (Sunday).");
    }
}
