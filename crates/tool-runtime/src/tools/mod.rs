//! Built-in tool adapters.
//!
//! Each adapter wraps one read-only backend behind the [`Tool`](crate::Tool)
//! trait. `render_chart` and `generate_report` produce client artifacts
//! instead of reading data.

pub mod cost_monitor;
pub mod generate_report;
pub mod pricing;
pub mod provisions_db;
pub mod render_chart;

pub use cost_monitor::CostMonitorTool;
pub use generate_report::{is_servable_report_name, GenerateReportTool, ReportFormat};
pub use pricing::{CachedEntry, InMemoryPricingCache, PricingCache, PricingLookupTool};
pub use provisions_db::{PgQueryBackend, ProvisionsDbTool, QueryBackend, QueryRows};
pub use render_chart::RenderChartTool;
