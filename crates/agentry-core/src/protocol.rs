//! Wire bodies for the per-agent and control-plane endpoints.
//!
//! Per-agent surface:
//!   POST /register      ThreadMetadata          -> { "ok": true }
//!   POST /invoke        InvokeBody              -> 202 InvokeAck
//!   POST /action        ActionBody              -> plugin-specific JSON
//!   POST /cancel        (empty)                 -> { "ok": true }
//!   GET  /state                                 -> StateSnapshot
//!   GET  /events                                -> EventLog
//!   POST /child_result  ChildResultBody         -> { "ok": true } | 400

use crate::types::{AgentStub, Event, Message, RunState, ThreadMetadata};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Body of `POST /invoke`: add messages and (re)start the run.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InvokeBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Message>>,
    /// Opaque blob-store keys; resolution is the blob store's concern.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vars: Option<BTreeMap<String, serde_json::Value>>,
}

impl InvokeBody {
    pub fn is_empty(&self) -> bool {
        self.messages.as_ref().map_or(true, |m| m.is_empty())
            && self.vars.as_ref().map_or(true, |v| v.is_empty())
    }
}

/// Immediate acknowledgement of `POST /invoke` (202; work progresses via ticks).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InvokeAck {
    pub status: String,
}

/// Body of `POST /action`: plugin-defined actions, dispatched by `type`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionBody {
    #[serde(rename = "type")]
    pub action: String,
    #[serde(flatten)]
    pub payload: serde_json::Value,
}

/// Body of `POST /child_result`: child→parent report-back.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChildResultBody {
    pub token: String,
    pub child_thread_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<String>,
}

/// Full per-agent snapshot for observers (`GET /state`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub state: ThreadMetadata,
    pub run: RunState,
}

/// `GET /events` response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventLog {
    pub events: Vec<Event>,
}

/// `GET /agents` response row set on the agency control plane.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentList {
    pub agents: Vec<AgentStub>,
}

/// Generic `{ "ok": true }` acknowledgement.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
}

impl Ack {
    pub fn ok() -> Self {
        Self { ok: true }
    }
}
