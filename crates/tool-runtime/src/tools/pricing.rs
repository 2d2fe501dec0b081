//! On-demand price lookups from a pricing cache.
//!
//! The cache is refreshed out of band; the tool only reads it and reports how
//! old each answer is.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

use crate::tool::{required_str, Tool, ToolContext, ToolDefinition, ToolError};

pub const TOOL_NAME: &str = "query_pricing";

const HOURS_PER_MONTH: f64 = 730.0;

/// A cached value and when it was fetched from its source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEntry {
    pub value: Value,
    pub fetched_at: DateTime<Utc>,
}

/// Pull contract for caches behind tools.
#[async_trait]
pub trait PricingCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<CachedEntry>;
}

#[derive(Debug, thiserror::Error)]
pub enum PricingCacheError {
    #[error("failed to read pricing cache: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid pricing cache file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Process-local cache, optionally seeded from a JSON file mapping keys to
/// `{value, fetched_at}` entries.
#[derive(Debug, Default)]
pub struct InMemoryPricingCache {
    entries: RwLock<HashMap<String, CachedEntry>>,
}

impl InMemoryPricingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_json(path: &Path) -> Result<Self, PricingCacheError> {
        let raw = std::fs::read_to_string(path)?;
        let entries: HashMap<String, CachedEntry> = serde_json::from_str(&raw)?;
        info!(path = %path.display(), entries = entries.len(), "Loaded pricing cache");
        Ok(Self {
            entries: RwLock::new(entries),
        })
    }

    pub fn insert(&self, key: impl Into<String>, value: Value, fetched_at: DateTime<Utc>) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), CachedEntry { value, fetched_at });
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PricingCache for InMemoryPricingCache {
    async fn get(&self, key: &str) -> Option<CachedEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

/// Cache key for an instance price.
pub fn pricing_key(region: &str, instance_type: &str, os: &str) -> String {
    format!(
        "aws/{}/{}/{}",
        region.trim().to_ascii_lowercase(),
        instance_type.trim().to_ascii_lowercase(),
        os.trim().to_ascii_lowercase()
    )
}

/// `query_pricing`: hourly, daily and monthly on-demand prices.
pub struct PricingLookupTool {
    cache: Arc<dyn PricingCache>,
    max_age: ChronoDuration,
}

impl PricingLookupTool {
    pub fn new(cache: Arc<dyn PricingCache>, max_age_hours: u64) -> Self {
        Self {
            cache,
            max_age: i64::try_from(max_age_hours)
                .ok()
                .and_then(ChronoDuration::try_hours)
                .unwrap_or(ChronoDuration::MAX),
        }
    }
}

fn round_cents(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[async_trait]
impl Tool for PricingLookupTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: TOOL_NAME.to_string(),
            description: "Look up the on-demand price of an AWS instance type from the \
                          pricing cache. Reports when the cached price was fetched and \
                          whether it is stale."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "instance_type": {"type": "string", "description": "e.g. g4dn.xlarge"},
                    "region": {"type": "string", "description": "Region code, default us-east-1"},
                    "os": {"type": "string", "description": "Operating system, default Linux"}
                },
                "required": ["instance_type"]
            }),
        }
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<Value, ToolError> {
        let instance_type = required_str(&input, "instance_type")?;
        let region = input
            .get("region")
            .and_then(|v| v.as_str())
            .unwrap_or("us-east-1");
        let os = input.get("os").and_then(|v| v.as_str()).unwrap_or("Linux");

        let key = pricing_key(region, instance_type, os);
        debug!(request_id = %context.request_id, %key, "pricing lookup");
        let entry = self.cache.get(&key).await.ok_or_else(|| {
            ToolError::ExecutionFailed(format!(
                "no cached pricing for {instance_type} ({os}) in {region}"
            ))
        })?;

        let mut pricing = entry.value;
        if let Some(hourly) = pricing.get("hourly_price_usd").and_then(|v| v.as_f64()) {
            if let Value::Object(map) = &mut pricing {
                map.insert("daily_price_usd".into(), json!(round_cents(hourly * 24.0)));
                map.insert(
                    "monthly_price_usd".into(),
                    json!(round_cents(hourly * HOURS_PER_MONTH)),
                );
            }
        }

        let age = Utc::now() - entry.fetched_at;
        Ok(json!({
            "instance_type": instance_type,
            "region": region,
            "os": os,
            "pricing": pricing,
            "fetched_at": entry.fetched_at.to_rfc3339(),
            "age_seconds": age.num_seconds().max(0),
            "stale": age > self.max_age,
        }))
    }
}
