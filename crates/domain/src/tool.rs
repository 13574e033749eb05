//! Tool catalog contract.
//!
//! Tools are registered explicitly at startup — there is no import-time
//! discovery. The runtime only needs the definitions (to hand the invoker)
//! and group resolution (to expand `group:<name>` entries in sub-agent
//! allow/deny lists); execution lives behind the invoker.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Tool definition exposed to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: serde_json::json!({ "type": "object", "properties": {} }),
        }
    }
}

/// Registry of the tools available to a workspace.
pub trait ToolCatalog: Send + Sync {
    /// All tool definitions, in stable registration order.
    fn all(&self) -> Vec<ToolDefinition>;

    /// Expand a group name (the part after `group:`) to member tool names.
    /// Returns `None` for unknown groups.
    fn resolve_group(&self, group: &str) -> Option<Vec<String>>;
}

/// Catalog populated once at startup from explicit registrations.
#[derive(Default)]
pub struct StaticToolCatalog {
    tools: Vec<ToolDefinition>,
    groups: BTreeMap<String, Vec<String>>,
}

impl StaticToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, optionally as a member of a group.
    pub fn register(&mut self, tool: ToolDefinition, group: Option<&str>) {
        if let Some(g) = group {
            self.groups
                .entry(g.to_owned())
                .or_default()
                .push(tool.name.clone());
        }
        self.tools.push(tool);
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl ToolCatalog for StaticToolCatalog {
    fn all(&self) -> Vec<ToolDefinition> {
        self.tools.clone()
    }

    fn resolve_group(&self, group: &str) -> Option<Vec<String>> {
        self.groups.get(group).cloned()
    }
}
