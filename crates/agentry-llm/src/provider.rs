//! Model provider trait

use crate::types::{ModelOutcome, ModelRequest, StreamDelta};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub type ModelResult<T> = Result<T, ModelError>;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("rate limited: retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("canceled")]
    Canceled,

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

/// Model provider trait. The runtime consumes only this interface; concrete
/// wire formats are adapters behind it.
#[async_trait::async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;

    /// One complete request/response exchange. If `cancel` is provided and
    /// triggered, the call returns `ModelError::Canceled` as soon as possible.
    async fn invoke(
        &self,
        request: ModelRequest,
        cancel: Option<CancellationToken>,
    ) -> ModelResult<ModelOutcome>;

    /// Streaming variant: deltas are sent to `on_delta` as they arrive and
    /// the assembled outcome is returned. The default adapter turns a
    /// non-streaming `invoke` into one text delta plus `Done`.
    async fn stream(
        &self,
        request: ModelRequest,
        on_delta: mpsc::Sender<StreamDelta>,
    ) -> ModelResult<ModelOutcome> {
        let outcome = self.invoke(request, None).await?;
        if !outcome.message.content.is_empty() {
            let _ = on_delta
                .send(StreamDelta::Text(outcome.message.content.clone()))
                .await;
        }
        for call in outcome.message.tool_calls.iter().flatten() {
            let _ = on_delta
                .send(StreamDelta::ToolCallStart {
                    id: call.id.clone(),
                    name: call.name.clone(),
                })
                .await;
            let _ = on_delta
                .send(StreamDelta::ToolCallEnd { id: call.id.clone() })
                .await;
        }
        let _ = on_delta.send(StreamDelta::Done).await;
        Ok(outcome)
    }
}
