//! Agency: the namespace container owning blueprints, vars, schedules and
//! live agent handles.
//!
//! Catalogue reads by spawned children happen at register time only: each
//! child gets a snapshot of the blueprint and the agency vars, so there is
//! no cross-handle shared mutable state afterwards.

use crate::hub::HubShared;
use crate::subagent::SubagentCoordinator;
use crate::thread::{AgentHandle, AgentThread};
use agentry_core::protocol::InvokeBody;
use agentry_core::{
    now_ms, AgentStub, BlueprintStatus, Error, Event, EventKind, Message, ParentRef, Result,
    RunStatus, ThreadMetadata,
};
use agentry_scheduler::{AgentSpawner, Scheduler};
use agentry_store::{AgencyStore, Store, ThreadStore};
use dashmap::DashMap;
use std::sync::{Arc, OnceLock};
use tracing::{info, warn};

pub(crate) struct AgencyInner {
    pub(crate) name: String,
    pub(crate) store: Store,
    pub(crate) shared: Arc<HubShared>,
    pub(crate) handles: DashMap<String, AgentHandle>,
    pub(crate) coordinator: Arc<SubagentCoordinator>,
    scheduler: OnceLock<Scheduler>,
}

#[derive(Clone)]
pub struct Agency {
    pub(crate) inner: Arc<AgencyInner>,
}

impl Agency {
    pub(crate) fn new(name: String, store: Store, shared: Arc<HubShared>) -> Self {
        let inner = Arc::new_cyclic(|weak| AgencyInner {
            coordinator: Arc::new(SubagentCoordinator::new(weak.clone())),
            name,
            store,
            shared,
            handles: DashMap::new(),
            scheduler: OnceLock::new(),
        });
        let agency = Agency { inner };
        let scheduler = Scheduler::new(
            agency.catalog(),
            Arc::new(agency.clone()) as Arc<dyn AgentSpawner>,
        );
        let _ = agency.inner.scheduler.set(scheduler);
        agency
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Catalogue view: blueprints, vars, schedules, run history.
    pub fn catalog(&self) -> AgencyStore {
        self.inner.store.agency(&self.inner.name)
    }

    pub fn scheduler(&self) -> &Scheduler {
        self.inner
            .scheduler
            .get()
            .expect("scheduler initialized with the agency")
    }

    pub(crate) fn coordinator(&self) -> Arc<SubagentCoordinator> {
        self.inner.coordinator.clone()
    }

    pub(crate) fn thread_store(&self, thread_id: &str) -> ThreadStore {
        self.inner.store.thread(thread_id)
    }

    // -- agents ------------------------------------------------------------

    /// Spawn an agent of `agent_type` and optionally invoke it.
    pub async fn spawn(&self, agent_type: &str, input: Option<InvokeBody>) -> Result<String> {
        self.spawn_with_id(uuid::Uuid::new_v4().to_string(), agent_type, None, input)
            .await
    }

    /// Registration path shared by external spawns and subagent spawns. The
    /// blueprint and the agency vars are snapshotted into the child.
    pub(crate) async fn spawn_with_id(
        &self,
        id: String,
        agent_type: &str,
        parent: Option<ParentRef>,
        input: Option<InvokeBody>,
    ) -> Result<String> {
        let catalog = self.catalog();
        let blueprint = catalog
            .get_blueprint(agent_type)?
            .ok_or_else(|| Error::not_found(format!("blueprint '{agent_type}'")))?;
        if blueprint.status != BlueprintStatus::Active {
            return Err(Error::validation(format!(
                "blueprint '{agent_type}' is not active"
            )));
        }
        let metadata = ThreadMetadata {
            id: id.clone(),
            agency: self.inner.name.clone(),
            agent_type: agent_type.to_string(),
            created_at: now_ms(),
            parent,
            blueprint,
            vars: catalog.vars_all()?,
        };

        let handle = AgentThread::spawn(
            id.clone(),
            self.inner.store.thread(&id),
            self.inner.shared.clone(),
            self.clone(),
        );
        self.inner.handles.insert(id.clone(), handle.clone());

        if let Err(e) = handle.register(metadata).await {
            self.inner.handles.remove(&id);
            let _ = handle.purge().await;
            return Err(e);
        }
        catalog.put_agent(&AgentStub {
            id: id.clone(),
            agent_type: agent_type.to_string(),
            created_at: now_ms(),
        })?;

        if let Some(input) = input {
            handle.invoke(input).await?;
        }
        info!(agency = %self.inner.name, agent = %id, agent_type, "agent spawned");
        Ok(id)
    }

    pub fn agent(&self, id: &str) -> Option<AgentHandle> {
        self.inner.handles.get(id).map(|h| h.clone())
    }

    pub fn list_agents(&self) -> Result<Vec<AgentStub>> {
        self.catalog().list_agents()
    }

    /// Delete one agent: cancel it, stop its executor, purge its rows.
    pub async fn delete_agent(&self, id: &str) -> Result<()> {
        let handle = self
            .agent(id)
            .ok_or_else(|| Error::not_found(format!("agent '{id}'")))?;
        if let Err(e) = handle.cancel().await {
            warn!(agent = %id, error = %e, "cancel before delete failed");
        }
        handle.purge().await?;
        self.inner.handles.remove(id);
        self.catalog().remove_agent(id)?;
        Ok(())
    }

    /// Cascade delete of the whole agency.
    pub(crate) async fn delete(&self) -> Result<()> {
        self.scheduler().shutdown();
        let ids: Vec<String> = self.inner.handles.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.delete_agent(&id).await {
                warn!(agency = %self.inner.name, agent = %id, error = %e, "agent delete failed during cascade");
            }
        }
        self.catalog().delete_all()
    }

    /// Recreate executors for persisted agents after a restart. Runs that
    /// were mid-flight pick up where their log ends.
    pub(crate) async fn rehydrate(&self) -> Result<()> {
        for stub in self.catalog().list_agents()? {
            let handle = AgentThread::spawn(
                stub.id.clone(),
                self.inner.store.thread(&stub.id),
                self.inner.shared.clone(),
                self.clone(),
            );
            self.inner.handles.insert(stub.id.clone(), handle.clone());
            let run = self.inner.store.thread(&stub.id).run_state()?;
            if run.status == RunStatus::Running {
                info!(agency = %self.inner.name, agent = %stub.id, "resuming interrupted run");
                handle.send_tick().await;
            }
        }
        Ok(())
    }

    /// Read an agent's message log. Reads go through the log, not any cache.
    pub fn messages(&self, thread_id: &str) -> Result<Vec<Message>> {
        self.inner.store.thread(thread_id).list_messages()
    }

    pub fn subagent_links(&self, thread_id: &str) -> Result<Vec<agentry_core::SubagentLink>> {
        self.inner.store.thread(thread_id).list_links()
    }

    pub fn waits(&self, thread_id: &str) -> Result<Vec<agentry_core::WaitEntry>> {
        self.inner.store.thread(thread_id).list_waits()
    }

    /// Append + broadcast an event on an agent from outside its executor.
    /// Only used for parent-side bookkeeping performed within the parent's
    /// own tick (subagent spawn).
    pub(crate) fn emit_on(
        &self,
        thread_id: &str,
        kind: EventKind,
        data: serde_json::Value,
    ) -> Result<u64> {
        let store = self.inner.store.thread(thread_id);
        let mut event = Event::new(thread_id, kind, data);
        let seq = store.add_event(event.clone())?;
        event.seq = seq;
        if let Some(handle) = self.agent(thread_id) {
            handle.broadcast(event);
        }
        Ok(seq)
    }
}

#[async_trait::async_trait]
impl AgentSpawner for Agency {
    async fn spawn_agent(
        &self,
        agent_type: &str,
        input: Option<&serde_json::Value>,
    ) -> std::result::Result<String, String> {
        let body = input.map(invoke_body_from_input);
        self.spawn(agent_type, body).await.map_err(|e| e.to_string())
    }

    async fn agent_active(&self, agent_id: &str) -> bool {
        let Some(handle) = self.agent(agent_id) else {
            return false;
        };
        match handle.snapshot().await {
            Ok(snapshot) => !snapshot.run.status.is_terminal(),
            Err(_) => false,
        }
    }
}

/// Schedule inputs are opaque JSON: an `InvokeBody`-shaped object is used as
/// is, anything else becomes a single user message.
fn invoke_body_from_input(input: &serde_json::Value) -> InvokeBody {
    if input.is_object() {
        if let Ok(body) = serde_json::from_value::<InvokeBody>(input.clone()) {
            if !body.is_empty() {
                return body;
            }
        }
    }
    let content = input
        .as_str()
        .map(String::from)
        .unwrap_or_else(|| input.to_string());
    InvokeBody {
        messages: Some(vec![Message::user(content)]),
        files: None,
        vars: None,
    }
}
