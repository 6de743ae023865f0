//! Plugin lifecycle hooks and the ordered host
//!
//! A plugin is a bundle of optional hooks; the host iterates a fixed,
//! capability-resolved list and invokes each hook in plugin order. Hooks
//! request state changes (pause, dynamic tools, custom events) through the
//! context; the agent loop applies them at its checkpoints.

use crate::plan::ModelPlan;
use agentry_core::{Blueprint, Message, RunState, RunStatus, ToolCall, REASON_HITL};
use serde_json::Value;
use std::sync::Arc;

/// Mutable context handed to every lifecycle hook of one tick.
pub struct HookCtx {
    pub thread_id: String,
    pub blueprint: Blueprint,
    pause_reason: Option<String>,
    events: Vec<(String, Value)>,
}

impl HookCtx {
    pub fn new(thread_id: impl Into<String>, blueprint: Blueprint) -> Self {
        Self {
            thread_id: thread_id.into(),
            blueprint,
            pause_reason: None,
            events: Vec::new(),
        }
    }

    /// Request a pause; the loop applies it at the next checkpoint.
    pub fn pause(&mut self, reason: impl Into<String>) {
        self.pause_reason = Some(reason.into());
    }

    pub fn pause_requested(&self) -> Option<&str> {
        self.pause_reason.as_deref()
    }

    /// Queue a plugin-emitted event; flushed to the log by the loop.
    pub fn emit(&mut self, kind: impl Into<String>, data: Value) {
        self.events.push((kind.into(), data));
    }

    pub fn take_events(&mut self) -> Vec<(String, Value)> {
        std::mem::take(&mut self.events)
    }
}

/// Context for `POST /action` dispatch.
pub struct ActionCtx {
    pub run: RunState,
    resume_requested: bool,
    deny_pending: bool,
    events: Vec<(String, Value)>,
}

impl ActionCtx {
    pub fn new(run: RunState) -> Self {
        Self {
            run,
            resume_requested: false,
            deny_pending: false,
            events: Vec::new(),
        }
    }

    pub fn resume(&mut self) {
        self.resume_requested = true;
    }

    /// Drop every pending tool call, recording denial results instead.
    pub fn deny_pending(&mut self) {
        self.deny_pending = true;
    }

    pub fn emit(&mut self, kind: impl Into<String>, data: Value) {
        self.events.push((kind.into(), data));
    }

    pub fn resume_requested(&self) -> bool {
        self.resume_requested
    }

    pub fn deny_requested(&self) -> bool {
        self.deny_pending
    }

    pub fn take_events(&mut self) -> Vec<(String, Value)> {
        std::mem::take(&mut self.events)
    }
}

/// A bundle of lifecycle hooks. Every hook has a no-op default; implement
/// only what the plugin reacts to.
#[async_trait::async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    async fn on_tick(&self, _ctx: &mut HookCtx) {}

    /// Contribute to the model plan; may add system prompt fragments and
    /// register per-tick tools.
    async fn before_model(&self, _plan: &mut ModelPlan, _ctx: &mut HookCtx) {}

    /// Inspect the assistant message before its tool calls execute. This is
    /// where human-in-the-loop pauses happen.
    async fn on_model_result(&self, _message: &Message, _ctx: &mut HookCtx) {}

    async fn on_tool_start(&self, _call: &ToolCall, _ctx: &mut HookCtx) {}

    async fn on_tool_result(&self, _call: &ToolCall, _content: &str, _ctx: &mut HookCtx) {}

    async fn on_tool_error(&self, _call: &ToolCall, _error: &str, _ctx: &mut HookCtx) {}

    async fn on_run_complete(&self, _ctx: &mut HookCtx) {}

    /// Handle a `POST /action` dispatch. The first plugin returning `Some`
    /// wins; `None` passes to the next plugin.
    async fn on_action(&self, _action: &str, _payload: &Value, _ctx: &mut ActionCtx) -> Option<Value> {
        None
    }
}

/// Ordered dispatch over a fixed plugin list.
pub struct PluginHost {
    plugins: Vec<(String, Arc<dyn Plugin>)>,
}

impl PluginHost {
    pub fn new(plugins: Vec<(String, Arc<dyn Plugin>)>) -> Self {
        Self { plugins }
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub async fn on_tick(&self, ctx: &mut HookCtx) {
        for (_, plugin) in &self.plugins {
            plugin.on_tick(ctx).await;
        }
    }

    pub async fn before_model(&self, plan: &mut ModelPlan, ctx: &mut HookCtx) {
        for (_, plugin) in &self.plugins {
            plugin.before_model(plan, ctx).await;
        }
    }

    pub async fn on_model_result(&self, message: &Message, ctx: &mut HookCtx) {
        for (_, plugin) in &self.plugins {
            plugin.on_model_result(message, ctx).await;
        }
    }

    pub async fn on_tool_start(&self, call: &ToolCall, ctx: &mut HookCtx) {
        for (_, plugin) in &self.plugins {
            plugin.on_tool_start(call, ctx).await;
        }
    }

    pub async fn on_tool_result(&self, call: &ToolCall, content: &str, ctx: &mut HookCtx) {
        for (_, plugin) in &self.plugins {
            plugin.on_tool_result(call, content, ctx).await;
        }
    }

    pub async fn on_tool_error(&self, call: &ToolCall, error: &str, ctx: &mut HookCtx) {
        for (_, plugin) in &self.plugins {
            plugin.on_tool_error(call, error, ctx).await;
        }
    }

    pub async fn on_run_complete(&self, ctx: &mut HookCtx) {
        for (_, plugin) in &self.plugins {
            plugin.on_run_complete(ctx).await;
        }
    }

    pub async fn on_action(&self, action: &str, payload: &Value, ctx: &mut ActionCtx) -> Option<Value> {
        for (_, plugin) in &self.plugins {
            if let Some(result) = plugin.on_action(action, payload, ctx).await {
                return Some(result);
            }
        }
        None
    }
}

/// Human-in-the-loop plugin: pauses the run when the model requests a tool
/// listed in the blueprint's `config.hitl.tools`, and resumes on
/// `POST /action {type:"approve"}` (or records denials on `deny`).
pub struct HitlPlugin;

#[async_trait::async_trait]
impl Plugin for HitlPlugin {
    fn name(&self) -> &str {
        "hitl"
    }

    async fn on_model_result(&self, message: &Message, ctx: &mut HookCtx) {
        let risky = ctx.blueprint.hitl_tools();
        if risky.is_empty() {
            return;
        }
        let flagged: Vec<&str> = message
            .tool_calls
            .iter()
            .flatten()
            .filter(|c| risky.iter().any(|r| r == &c.name))
            .map(|c| c.name.as_str())
            .collect();
        if !flagged.is_empty() {
            ctx.emit(
                "hitl.flagged",
                serde_json::json!({ "tools": flagged }),
            );
            ctx.pause(REASON_HITL);
        }
    }

    async fn on_action(&self, action: &str, _payload: &Value, ctx: &mut ActionCtx) -> Option<Value> {
        match action {
            "approve" => {
                if ctx.run.status == RunStatus::Paused
                    && ctx.run.reason.as_deref() == Some(REASON_HITL)
                {
                    ctx.emit("hitl.approved", serde_json::json!({}));
                    ctx.resume();
                    Some(serde_json::json!({ "ok": true }))
                } else {
                    Some(serde_json::json!({ "ok": false, "error": "not paused for approval" }))
                }
            }
            "deny" => {
                if ctx.run.status == RunStatus::Paused
                    && ctx.run.reason.as_deref() == Some(REASON_HITL)
                {
                    ctx.emit("hitl.denied", serde_json::json!({}));
                    ctx.deny_pending();
                    ctx.resume();
                    Some(serde_json::json!({ "ok": true }))
                } else {
                    Some(serde_json::json!({ "ok": false, "error": "not paused for approval" }))
                }
            }
            _ => None,
        }
    }
}
