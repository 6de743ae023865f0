//! ScriptedProvider — deterministic model responses for testing
//!
//! Each call to `invoke` pops the next behavior; an exhausted script falls
//! back to a default text reply. Used by the runtime and scheduler test
//! suites to drive agents without a network.

use crate::provider::{ModelError, ModelProvider, ModelResult};
use crate::types::{ModelOutcome, ModelRequest};
use agentry_core::{Message, ToolCall};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Scripted behavior for one model call.
#[derive(Clone, Debug)]
pub enum Behavior {
    /// Return a text-only assistant message.
    Reply(String),
    /// Return an assistant message with tool calls.
    ToolCalls(Vec<(&'static str, &'static str, serde_json::Value)>),
    /// Sleep before replying (for overlap/cancel tests).
    SlowReply { text: String, delay_ms: u64 },
    /// Fail the call.
    Fail(String),
}

impl Behavior {
    pub fn tool_call(id: &'static str, name: &'static str, args: serde_json::Value) -> Self {
        Self::ToolCalls(vec![(id, name, args)])
    }
}

pub struct ScriptedProvider {
    behaviors: Mutex<Vec<Behavior>>,
    default_behavior: Behavior,
    call_count: Mutex<usize>,
}

impl ScriptedProvider {
    /// Always respond with the same behavior.
    pub fn constant(behavior: Behavior) -> Self {
        Self {
            behaviors: Mutex::new(Vec::new()),
            default_behavior: behavior,
            call_count: Mutex::new(0),
        }
    }

    /// Consume behaviors in order; fall back to a canned reply when exhausted.
    pub fn sequence(behaviors: Vec<Behavior>) -> Self {
        Self {
            behaviors: Mutex::new(behaviors),
            default_behavior: Behavior::Reply("(scripted: sequence exhausted)".into()),
            call_count: Mutex::new(0),
        }
    }

    pub async fn call_count(&self) -> usize {
        *self.call_count.lock().await
    }

    async fn next_behavior(&self) -> Behavior {
        let mut count = self.call_count.lock().await;
        *count += 1;
        let mut behaviors = self.behaviors.lock().await;
        if behaviors.is_empty() {
            self.default_behavior.clone()
        } else {
            behaviors.remove(0)
        }
    }
}

#[async_trait::async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(
        &self,
        _request: ModelRequest,
        cancel: Option<CancellationToken>,
    ) -> ModelResult<ModelOutcome> {
        match self.next_behavior().await {
            Behavior::Reply(text) => Ok(ModelOutcome {
                message: Message::assistant(text),
                usage: None,
            }),
            Behavior::ToolCalls(calls) => {
                let calls = calls
                    .into_iter()
                    .map(|(id, name, args)| ToolCall {
                        id: id.to_string(),
                        name: name.to_string(),
                        args,
                    })
                    .collect();
                Ok(ModelOutcome {
                    message: Message::assistant_tool_calls(calls),
                    usage: None,
                })
            }
            Behavior::SlowReply { text, delay_ms } => {
                let sleep = tokio::time::sleep(std::time::Duration::from_millis(delay_ms));
                if let Some(cancel) = cancel {
                    tokio::select! {
                        _ = sleep => {}
                        _ = cancel.cancelled() => return Err(ModelError::Canceled),
                    }
                } else {
                    sleep.await;
                }
                Ok(ModelOutcome {
                    message: Message::assistant(text),
                    usage: None,
                })
            }
            Behavior::Fail(message) => Err(ModelError::RequestFailed(message)),
        }
    }
}
