//! Agentry runtime — agencies, the per-agent execution engine, plugins and
//! subagent supervision.

mod agency;
mod hub;
mod plan;
mod plugin;
mod subagent;
mod thread;

pub use agency::Agency;
pub use hub::{Hub, HubBuilder, HubShared};
pub use plan::ModelPlan;
pub use plugin::{ActionCtx, HitlPlugin, HookCtx, Plugin, PluginHost};
pub use subagent::SubagentCoordinator;
pub use thread::{AgentHandle, TOOLS_PER_TICK};
