//! Tool trait and execution context
//!
//! Each tool is a self-contained unit registered under a unique name. A tool
//! that returns [`ToolResult::Deferred`] takes responsibility for its own
//! tool message later (the subagent spawn is the typical case).

use agentry_llm::ToolDef;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone, Debug)]
pub enum ToolResult {
    Text(String),
    Json(Value),
    /// No tool message this tick; the result arrives through another channel.
    Deferred,
    Error(String),
}

impl ToolResult {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    pub fn error(s: impl Into<String>) -> Self {
        Self::Error(s.into())
    }

    /// The string appended as the tool message. Non-string results are
    /// stringified as JSON; errors carry the `Error: ` prefix.
    pub fn to_content_string(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Json(v) => serde_json::to_string(v).unwrap_or_default(),
            Self::Deferred => String::new(),
            Self::Error(e) => format!("Error: {e}"),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred)
    }
}

/// Seam from the tool layer back into the runtime: registering a child agent
/// and the parent's wait slot. Implemented by the subagent coordinator.
#[async_trait::async_trait]
pub trait SubagentSpawner: Send + Sync {
    /// Spawn a child of `agent_type`, invoke it with `description`, and push
    /// a wait slot on the parent keyed by a fresh token. Returns the child
    /// thread id.
    async fn spawn_wait(
        &self,
        parent_thread_id: &str,
        tool_call_id: &str,
        agent_type: &str,
        description: &str,
    ) -> Result<String, String>;
}

/// Per-call execution context handed to every tool.
#[derive(Clone)]
pub struct ToolCtx {
    pub thread_id: String,
    pub agency: String,
    pub call_id: String,
    /// Ambient configuration (API keys etc.); plumbed explicitly, no globals.
    pub env: Arc<BTreeMap<String, String>>,
    pub spawner: Option<Arc<dyn SubagentSpawner>>,
}

/// The Tool trait — implement this to add a capability.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name (e.g. "task", "add").
    fn name(&self) -> &str;

    /// Human-readable description sent to the model.
    fn description(&self) -> &str {
        ""
    }

    /// JSON Schema for input parameters.
    fn parameters(&self) -> Value;

    /// Execute the tool with the given arguments.
    async fn execute(&self, args: Value, ctx: ToolCtx) -> ToolResult;

    /// Convert to the model-facing tool definition.
    fn definition(&self) -> ToolDef {
        ToolDef {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}
