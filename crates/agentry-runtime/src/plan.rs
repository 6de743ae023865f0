//! Per-tick model plan
//!
//! A transient builder collecting plugin contributions for one model call.
//! Building the plan never mutates persisted state; the system prompt is
//! rebuilt fresh every tick and any `system` rows in the stored history are
//! excluded from the request.

use agentry_core::{Message, Role};
use agentry_llm::{ModelRequest, ToolDef};
use agentry_tools::Tool;
use std::sync::Arc;

#[derive(Default)]
pub struct ModelPlan {
    system_parts: Vec<String>,
    extra_tools: Vec<Arc<dyn Tool>>,
    model_override: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl ModelPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a system prompt fragment; fragments concatenate in call order.
    pub fn add_system_prompt(&mut self, text: impl Into<String>) {
        let text = text.into();
        if !text.is_empty() {
            self.system_parts.push(text);
        }
    }

    /// Register a tool for this tick only.
    pub fn register_tool(&mut self, tool: Arc<dyn Tool>) {
        self.extra_tools.push(tool);
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        self.model_override = Some(model.into());
    }

    pub fn set_temperature(&mut self, temperature: f32) {
        self.temperature = Some(temperature);
    }

    pub fn set_max_tokens(&mut self, max_tokens: u32) {
        self.max_tokens = Some(max_tokens);
    }

    pub fn extra_tools(&self) -> &[Arc<dyn Tool>] {
        &self.extra_tools
    }

    /// Assemble the request: composite system prompt, the full non-system
    /// history, and the schemas of every tool on the agent this tick.
    pub fn into_request(
        self,
        default_model: &str,
        blueprint_model: Option<&str>,
        history: Vec<Message>,
        mut tool_defs: Vec<ToolDef>,
    ) -> ModelRequest {
        tool_defs.extend(self.extra_tools.iter().map(|t| t.definition()));
        let model = self
            .model_override
            .or_else(|| blueprint_model.map(String::from))
            .unwrap_or_else(|| default_model.to_string());
        let mut request = ModelRequest::new(model);
        if !self.system_parts.is_empty() {
            request.system_prompt = Some(self.system_parts.join("\n\n"));
        }
        request.messages = history
            .into_iter()
            .filter(|m| m.role != Role::System)
            .collect();
        request.tool_defs = tool_defs;
        request.temperature = self.temperature;
        request.max_tokens = self.max_tokens;
        request
    }
}
