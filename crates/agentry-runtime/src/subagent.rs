//! Subagent supervision: spawn with a token-keyed wait slot, child→parent
//! report-back, and best-effort cancel sweeps.
//!
//! The token is the only cross-agent ordering primitive: a child resumes its
//! parent solely by presenting the token it was minted with.

use crate::agency::{Agency, AgencyInner};
use agentry_core::protocol::InvokeBody;
use agentry_core::{
    now_ms, EventKind, LinkStatus, Message, ParentRef, SubagentLink, WaitEntry,
};
use agentry_tools::SubagentSpawner;
use std::sync::Weak;
use tracing::{info, warn};

pub struct SubagentCoordinator {
    agency: Weak<AgencyInner>,
}

impl SubagentCoordinator {
    pub(crate) fn new(agency: Weak<AgencyInner>) -> Self {
        Self { agency }
    }

    fn agency(&self) -> Option<Agency> {
        self.agency.upgrade().map(|inner| Agency { inner })
    }

    /// Deliver a completed child's report to its parent. Fire-and-forget:
    /// the parent applies it under its own single-owner mailbox.
    pub(crate) fn report_to_parent(
        &self,
        parent: ParentRef,
        child_thread_id: String,
        report: Option<String>,
    ) {
        let Some(agency) = self.agency() else {
            return;
        };
        tokio::spawn(async move {
            let Some(handle) = agency.agent(&parent.thread_id) else {
                warn!(parent = %parent.thread_id, child = %child_thread_id, "parent is gone, report dropped");
                return;
            };
            if let Err(e) = handle
                .child_result(parent.token, child_thread_id.clone(), report)
                .await
            {
                warn!(parent = %parent.thread_id, child = %child_thread_id, error = %e, "report to parent failed");
            }
        });
    }

    /// Best-effort cancel of one child during a parent's cancel sweep.
    /// Failures are logged and the sweep continues.
    pub(crate) fn cancel_child(&self, child_thread_id: &str) {
        let Some(agency) = self.agency() else {
            return;
        };
        let Some(handle) = agency.agent(child_thread_id) else {
            warn!(child = %child_thread_id, "child to cancel is gone");
            return;
        };
        let child = child_thread_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = handle.cancel().await {
                warn!(child = %child, error = %e, "child cancel failed");
            }
        });
    }
}

#[async_trait::async_trait]
impl SubagentSpawner for SubagentCoordinator {
    async fn spawn_wait(
        &self,
        parent_thread_id: &str,
        tool_call_id: &str,
        agent_type: &str,
        description: &str,
    ) -> Result<String, String> {
        let Some(agency) = self.agency() else {
            return Err("Failed to initialize subagent".into());
        };

        let token = uuid::Uuid::new_v4().to_string();
        let child_id = uuid::Uuid::new_v4().to_string();
        let parent = ParentRef {
            thread_id: parent_thread_id.to_string(),
            token: token.clone(),
        };
        let input = InvokeBody {
            messages: Some(vec![Message::user(description)]),
            files: None,
            vars: None,
        };

        if let Err(e) = agency
            .spawn_with_id(child_id.clone(), agent_type, Some(parent), Some(input))
            .await
        {
            warn!(
                parent = %parent_thread_id,
                agent_type,
                error = %e,
                "subagent registration failed"
            );
            return Err("Failed to initialize subagent".into());
        }

        // The wait slot and link live on the parent; these writes run inside
        // the parent's tick, so they are serialized with the parent's state.
        let parent_store = agency.thread_store(parent_thread_id);
        parent_store
            .push_wait(WaitEntry {
                token: token.clone(),
                child_thread_id: child_id.clone(),
                tool_call_id: tool_call_id.to_string(),
            })
            .map_err(|e| e.to_string())?;
        parent_store
            .record_spawn(&SubagentLink {
                child_thread_id: child_id.clone(),
                token,
                status: LinkStatus::Waiting,
                created_at: now_ms(),
                completed_at: None,
                report: None,
                tool_call_id: Some(tool_call_id.to_string()),
            })
            .map_err(|e| e.to_string())?;
        agency
            .emit_on(
                parent_thread_id,
                EventKind::SubagentSpawned,
                serde_json::json!({ "childId": child_id, "agentType": agent_type }),
            )
            .map_err(|e| e.to_string())?;

        info!(parent = %parent_thread_id, child = %child_id, agent_type, "subagent spawned");
        Ok(child_id)
    }
}
