//! Agentry model layer — the provider trait and its adapters.

mod http;
mod provider;
mod scripted;
mod types;

pub use http::HttpProvider;
pub use provider::{ModelError, ModelProvider, ModelResult};
pub use scripted::{Behavior, ScriptedProvider};
pub use types::{ModelOutcome, ModelRequest, StreamDelta, ToolDef, Usage};
