//! Tool registry port.
//!
//! The registry is a read-only shared handle: lookup plus invocation
//! dispatch. Construction-time injection is preferred; a lazy global
//! singleton remains as a safety net for components instantiated without
//! their dependencies.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::error::EngineResult;

/// Metadata describing a registered tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Operations the tool accepts.
    #[serde(default)]
    pub operations: Vec<String>,
    /// Names of tools that must run before this one.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            operations: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn with_operations(mut self, ops: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.operations = ops.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }
}

/// Result of a tool invocation, success or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result,
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: Value::Null,
            error: Some(error.into()),
        }
    }
}

/// Registry contract consumed by the engine.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    /// All registered tools.
    fn list_tools(&self) -> Vec<ToolDescriptor>;

    /// Look up one tool by name.
    fn get_tool(&self, name: &str) -> Option<ToolDescriptor>;

    /// Invoke a tool operation. Tool-level failures come back as an
    /// unsuccessful [`ToolOutcome`]; only infrastructure failures error.
    async fn invoke(
        &self,
        name: &str,
        operation: &str,
        params: &HashMap<String, Value>,
    ) -> EngineResult<ToolOutcome>;
}

static GLOBAL_REGISTRY: OnceCell<Arc<dyn ToolRegistry>> = OnceCell::new();

/// Install the process-wide fallback registry. First caller wins.
pub fn set_global_registry(registry: Arc<dyn ToolRegistry>) -> bool {
    GLOBAL_REGISTRY.set(registry).is_ok()
}

/// The process-wide fallback registry, if one was installed.
pub fn global_registry() -> Option<Arc<dyn ToolRegistry>> {
    GLOBAL_REGISTRY.get().cloned()
}
