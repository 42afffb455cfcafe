//! In-memory tool registry.
//!
//! The shared registry instance is threaded through construction; the
//! lazy global installed via `set_global_registry` is only a safety net
//! for components built without their dependencies.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::domain::error::{EngineError, EngineResult};
use crate::domain::ports::tool_registry::{ToolDescriptor, ToolOutcome, ToolRegistry};

/// Boxed async tool handler: `(operation, params) -> outcome`.
pub type ToolHandler = Arc<
    dyn Fn(
            String,
            HashMap<String, Value>,
        ) -> Pin<Box<dyn Future<Output = EngineResult<ToolOutcome>> + Send>>
        + Send
        + Sync,
>;

struct RegisteredTool {
    descriptor: ToolDescriptor,
    handler: ToolHandler,
}

/// Registry holding tool descriptors and their handlers.
#[derive(Default)]
pub struct InMemoryToolRegistry {
    tools: RwLock<HashMap<String, RegisteredTool>>,
}

impl InMemoryToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool with its async handler. Re-registering replaces the
    /// previous entry.
    pub fn register(&self, descriptor: ToolDescriptor, handler: ToolHandler) {
        debug!(tool = %descriptor.name, "tool registered");
        self.tools
            .write()
            .expect("registry lock")
            .insert(descriptor.name.clone(), RegisteredTool { descriptor, handler });
    }
}

#[async_trait]
impl ToolRegistry for InMemoryToolRegistry {
    fn list_tools(&self) -> Vec<ToolDescriptor> {
        let mut tools: Vec<ToolDescriptor> = self
            .tools
            .read()
            .expect("registry lock")
            .values()
            .map(|t| t.descriptor.clone())
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    fn get_tool(&self, name: &str) -> Option<ToolDescriptor> {
        self.tools
            .read()
            .expect("registry lock")
            .get(name)
            .map(|t| t.descriptor.clone())
    }

    async fn invoke(
        &self,
        name: &str,
        operation: &str,
        params: &HashMap<String, Value>,
    ) -> EngineResult<ToolOutcome> {
        let handler = {
            let tools = self.tools.read().expect("registry lock");
            let tool = tools
                .get(name)
                .ok_or_else(|| EngineError::ToolInvocation(format!("unknown tool: {name}")))?;
            if !tool.descriptor.operations.is_empty()
                && !tool.descriptor.operations.iter().any(|op| op == operation)
            {
                return Err(EngineError::ToolInvocation(format!(
                    "tool {name} does not support operation {operation}"
                )));
            }
            Arc::clone(&tool.handler)
        };

        handler(operation.to_string(), params.clone()).await
    }
}
