use crate::tool::{Tool, ToolDefinition, ToolProfile};
use indexmap::IndexMap;
use serde_json::Value;
use std::sync::Arc;

struct RegisteredTool {
    tool: Arc<dyn Tool>,
    definition: ToolDefinition,
    profile: ToolProfile,
    validator: jsonschema::Validator,
}

/// Manages available tools, their schemas, and lookup.
///
/// Definitions are listed in registration order so the model sees a stable
/// tool list across rounds. Each input schema is compiled once at
/// registration.
pub struct ToolRegistry {
    tools: IndexMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: IndexMap::new(),
        }
    }

    /// Register a tool. Returns error if the name is taken or its schema does not compile.
    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), RegistryError> {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let definition = tool.definition();
        if self.tools.contains_key(&definition.name) {
            return Err(RegistryError::DuplicateName(definition.name));
        }
        let validator = jsonschema::validator_for(&definition.input_schema).map_err(|e| {
            RegistryError::InvalidSchema {
                name: definition.name.clone(),
                message: e.to_string(),
            }
        })?;
        let profile = tool.profile();
        tracing::debug!(tool = %definition.name, "registered tool");
        self.tools.insert(
            definition.name.clone(),
            RegisteredTool {
                tool,
                definition,
                profile,
                validator,
            },
        );
        Ok(())
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|t| t.tool.clone())
    }

    pub fn profile(&self, name: &str) -> Option<&ToolProfile> {
        self.tools.get(name).map(|t| &t.profile)
    }

    /// List all registered tool definitions (for sending to LLM).
    pub fn list(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition.clone()).collect()
    }

    /// Check `input` against the tool's declared schema.
    ///
    /// Every violation is reported, joined into one message the model can act on.
    pub fn validate_input(&self, name: &str, input: &Value) -> Result<(), String> {
        let Some(registered) = self.tools.get(name) else {
            return Err(format!("unknown tool '{name}'"));
        };
        let errors: Vec<String> = registered
            .validator
            .iter_errors(input)
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{path}: {e}")
                }
            })
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Tool with name '{0}' is already registered")]
    DuplicateName(String),
    #[error("Tool '{name}' has an invalid input schema: {message}")]
    InvalidSchema { name: String, message: String },
}
