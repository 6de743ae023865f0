//! Task tool — spawn a subagent and wait for its report
//!
//! Returns `Deferred`: no tool message is appended this tick. The child's
//! report arrives through the parent's wait table and becomes the tool
//! message when the child completes.

use crate::tool::{Tool, ToolCtx, ToolResult};
use serde_json::Value;
use tracing::info;

pub struct TaskTool;

#[async_trait::async_trait]
impl Tool for TaskTool {
    fn name(&self) -> &str {
        "task"
    }

    fn description(&self) -> &str {
        "Spawn a subagent of the given type to work on a task. \
         The run pauses until the subagent reports back."
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "subagentType": {
                    "type": "string",
                    "description": "Blueprint name of the subagent to spawn"
                },
                "description": {
                    "type": "string",
                    "description": "Task description handed to the subagent"
                }
            },
            "required": ["subagentType", "description"]
        })
    }

    async fn execute(&self, args: Value, ctx: ToolCtx) -> ToolResult {
        let Some(agent_type) = args.get("subagentType").and_then(|v| v.as_str()) else {
            return ToolResult::error("task requires 'subagentType'");
        };
        let Some(description) = args.get("description").and_then(|v| v.as_str()) else {
            return ToolResult::error("task requires 'description'");
        };
        let Some(spawner) = ctx.spawner.as_ref() else {
            return ToolResult::error("subagent spawning is not available here");
        };

        match spawner
            .spawn_wait(&ctx.thread_id, &ctx.call_id, agent_type, description)
            .await
        {
            Ok(child_id) => {
                info!(parent = %ctx.thread_id, child = %child_id, agent_type, "subagent spawned");
                ToolResult::Deferred
            }
            Err(message) => ToolResult::Error(message),
        }
    }
}
