//! The per-agent actor: mailbox, bounded tick loop, pending-tool queue,
//! pause/resume and cancel.
//!
//! Every operation against one agent goes through its mailbox and is handled
//! by a single consumer task, so at most one tick is ever in flight and all
//! writes to the agent's store are serialized. Long runs chain short ticks:
//! each tick does at most one model call plus one capped tool batch, then
//! reschedules itself.

use crate::agency::Agency;
use crate::hub::HubShared;
use crate::plan::ModelPlan;
use crate::plugin::{ActionCtx, HookCtx, PluginHost};
use agentry_core::protocol::{ActionBody, InvokeBody, StateSnapshot};
use agentry_core::{
    now_ms, Error, Event, EventKind, Result, RunState, RunStatus, ThreadMetadata, ToolCall,
    REASON_SUBAGENT, REASON_USER,
};
use agentry_store::ThreadStore;
use agentry_tools::{tool_definitions, SubagentSpawner, Tool, ToolCtx, ToolResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Cap on how many queued tool calls one tick executes.
pub const TOOLS_PER_TICK: usize = 25;

const MAILBOX_DEPTH: usize = 256;

pub(crate) enum Command {
    Register {
        metadata: Box<ThreadMetadata>,
        reply: oneshot::Sender<Result<()>>,
    },
    Invoke {
        body: Box<InvokeBody>,
        reply: oneshot::Sender<Result<RunStatus>>,
    },
    Action {
        body: ActionBody,
        reply: oneshot::Sender<Result<serde_json::Value>>,
    },
    Cancel {
        reply: oneshot::Sender<Result<()>>,
    },
    ChildResult {
        token: String,
        child_thread_id: String,
        report: Option<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<Result<StateSnapshot>>,
    },
    Events {
        reply: oneshot::Sender<Result<Vec<Event>>>,
    },
    Tick,
    Purge {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Cheap, cloneable address of one agent's executor.
#[derive(Clone)]
pub struct AgentHandle {
    id: String,
    tx: mpsc::Sender<Command>,
    events_tx: broadcast::Sender<Event>,
}

impl AgentHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Live event feed; persisted history comes from [`AgentHandle::events`].
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events_tx.subscribe()
    }

    pub(crate) fn broadcast(&self, event: Event) {
        let _ = self.events_tx.send(event);
    }

    pub async fn register(&self, metadata: ThreadMetadata) -> Result<()> {
        self.call(|reply| Command::Register {
            metadata: Box::new(metadata),
            reply,
        })
        .await
    }

    pub async fn invoke(&self, body: InvokeBody) -> Result<RunStatus> {
        self.call(|reply| Command::Invoke {
            body: Box::new(body),
            reply,
        })
        .await
    }

    pub async fn action(&self, body: ActionBody) -> Result<serde_json::Value> {
        self.call(|reply| Command::Action { body, reply }).await
    }

    pub async fn cancel(&self) -> Result<()> {
        self.call(|reply| Command::Cancel { reply }).await
    }

    pub async fn child_result(
        &self,
        token: String,
        child_thread_id: String,
        report: Option<String>,
    ) -> Result<()> {
        self.call(|reply| Command::ChildResult {
            token,
            child_thread_id,
            report,
            reply,
        })
        .await
    }

    pub async fn snapshot(&self) -> Result<StateSnapshot> {
        self.call(|reply| Command::Snapshot { reply }).await
    }

    pub async fn events(&self) -> Result<Vec<Event>> {
        self.call(|reply| Command::Events { reply }).await
    }

    /// Stop the executor and delete every stored row of this agent.
    pub async fn purge(&self) -> Result<()> {
        self.call(|reply| Command::Purge { reply }).await
    }

    pub(crate) async fn send_tick(&self) {
        let _ = self.tx.send(Command::Tick).await;
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| Error::Internal(format!("agent {} executor is gone", self.id)))?;
        reply_rx
            .await
            .map_err(|_| Error::Internal(format!("agent {} dropped the request", self.id)))?
    }
}

pub(crate) struct AgentThread {
    id: String,
    store: ThreadStore,
    shared: Arc<HubShared>,
    agency: Agency,
    metadata: Option<ThreadMetadata>,
    run: RunState,
    pending: Vec<ToolCall>,
    /// Blueprint-resolved tools, fixed at registration.
    tools: Vec<(String, Arc<dyn Tool>)>,
    /// Tools executable this tick: resolved plus per-tick plugin registrations.
    tick_tools: Vec<(String, Arc<dyn Tool>)>,
    plugins: PluginHost,
    events_tx: broadcast::Sender<Event>,
    self_tx: mpsc::Sender<Command>,
    rx: mpsc::Receiver<Command>,
}

impl AgentThread {
    pub(crate) fn spawn(
        id: String,
        store: ThreadStore,
        shared: Arc<HubShared>,
        agency: Agency,
    ) -> AgentHandle {
        let (tx, rx) = mpsc::channel(MAILBOX_DEPTH);
        let (events_tx, _) = broadcast::channel(MAILBOX_DEPTH);
        let actor = AgentThread {
            id: id.clone(),
            store,
            shared,
            agency,
            metadata: None,
            run: RunState::default(),
            pending: Vec::new(),
            tools: Vec::new(),
            tick_tools: Vec::new(),
            plugins: PluginHost::new(Vec::new()),
            events_tx: events_tx.clone(),
            self_tx: tx.clone(),
            rx,
        };
        tokio::spawn(actor.run());
        AgentHandle { id, tx, events_tx }
    }

    async fn run(mut self) {
        if let Err(e) = self.hydrate() {
            error!(thread = %self.id, error = %e, "failed to hydrate agent state");
        }
        while let Some(command) = self.rx.recv().await {
            match command {
                Command::Register { metadata, reply } => {
                    let _ = reply.send(self.handle_register(*metadata));
                }
                Command::Invoke { body, reply } => {
                    let _ = reply.send(self.handle_invoke(*body));
                }
                Command::Action { body, reply } => {
                    let _ = reply.send(self.handle_action(body).await);
                }
                Command::Cancel { reply } => {
                    let _ = reply.send(self.handle_cancel());
                }
                Command::ChildResult {
                    token,
                    child_thread_id,
                    report,
                    reply,
                } => {
                    let _ = reply.send(self.handle_child_result(token, child_thread_id, report));
                }
                Command::Snapshot { reply } => {
                    let _ = reply.send(self.handle_snapshot());
                }
                Command::Events { reply } => {
                    let _ = reply.send(self.store.list_events());
                }
                Command::Tick => {
                    if let Err(e) = self.handle_tick().await {
                        // Storage failures are fatal for the tick.
                        error!(thread = %self.id, error = %e, "tick aborted");
                        self.run.status = RunStatus::Error;
                        self.run.reason = Some(e.to_string());
                        self.run.next_alarm_at = None;
                        if let Err(persist) = self.store.put_run_state(&self.run) {
                            error!(thread = %self.id, error = %persist, "failed to persist error state");
                        }
                        let _ = self.emit(
                            EventKind::AgentError,
                            serde_json::json!({ "error": e.to_string() }),
                        );
                    }
                }
                Command::Purge { reply } => {
                    let _ = reply.send(self.store.purge());
                    break;
                }
            }
        }
        debug!(thread = %self.id, "agent executor stopped");
    }

    fn hydrate(&mut self) -> Result<()> {
        self.metadata = self.store.metadata()?;
        self.run = self.store.run_state()?;
        self.pending = self.store.pending_tool_calls()?;
        if self.metadata.is_some() {
            self.resolve_capabilities();
        }
        Ok(())
    }

    /// Resolve the blueprint's capability tokens against the hub registries.
    /// Missing tools warn; missing plugins stay silent, the same token may
    /// name a tool instead.
    fn resolve_capabilities(&mut self) {
        let Some(metadata) = &self.metadata else {
            return;
        };
        let capabilities = &metadata.blueprint.capabilities;
        self.tools = self
            .shared
            .tools
            .select_by_capabilities(capabilities, Some("tool"));
        self.tick_tools = self.tools.clone();
        let mut plugins: Vec<(String, Arc<dyn crate::plugin::Plugin>)> = self
            .shared
            .base_plugins
            .iter()
            .map(|p| (p.name().to_string(), p.clone()))
            .collect();
        plugins.extend(
            self.shared
                .plugins
                .select_by_capabilities(capabilities, None),
        );
        self.plugins = PluginHost::new(plugins);
    }

    fn emit(&self, kind: EventKind, data: serde_json::Value) -> Result<u64> {
        let mut event = Event::new(self.id.as_str(), kind, data);
        let seq = self.store.add_event(event.clone())?;
        event.seq = seq;
        let _ = self.events_tx.send(event);
        Ok(seq)
    }

    fn flush_hook_events(&self, ctx: &mut HookCtx) -> Result<()> {
        for (kind, data) in ctx.take_events() {
            self.emit(EventKind::from(kind.as_str()), data)?;
        }
        Ok(())
    }

    /// Enqueue the next tick. Zero delay chains immediately through the
    /// mailbox; anything else arms a one-shot alarm task.
    fn reschedule(&mut self, delay_ms: u64) {
        self.run.next_alarm_at = Some(now_ms() + delay_ms as i64);
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            let _ = tx.send(Command::Tick).await;
        });
    }

    // -- command handlers --------------------------------------------------

    /// One-time initialization. Idempotent under the same id: the thread id
    /// is set once and never overwritten.
    fn handle_register(&mut self, metadata: ThreadMetadata) -> Result<()> {
        if let Some(existing) = &self.metadata {
            if existing.id == metadata.id {
                return Ok(());
            }
            return Err(Error::validation(format!(
                "thread already registered as '{}'",
                existing.id
            )));
        }
        metadata.blueprint.validate().map_err(Error::validation)?;
        self.store.put_metadata(&metadata)?;
        for (key, value) in &metadata.vars {
            self.store.var_set(key, value)?;
        }
        self.store.put_run_state(&self.run)?;
        info!(thread = %self.id, agent_type = %metadata.agent_type, "agent registered");
        self.metadata = Some(metadata);
        self.resolve_capabilities();
        Ok(())
    }

    fn handle_invoke(&mut self, body: InvokeBody) -> Result<RunStatus> {
        let Some(metadata) = &self.metadata else {
            return Err(Error::validation("agent is not registered"));
        };
        // Terminal states stay terminal; an invoke is a no-op there.
        if self.run.status.is_terminal() {
            return Ok(self.run.status);
        }
        if let Some(vars) = &body.vars {
            for (key, value) in vars {
                self.store.var_set(key, value)?;
            }
        }
        if let Some(messages) = body.messages {
            if !messages.is_empty() {
                self.store.append_messages(messages)?;
            }
        }
        match self.run.status {
            RunStatus::Registered => {
                self.run.status = RunStatus::Running;
                self.run.reason = None;
                self.emit(
                    EventKind::RunStarted,
                    serde_json::json!({ "agentType": metadata.agent_type }),
                )?;
                self.reschedule(0);
                self.store.put_run_state(&self.run)?;
            }
            RunStatus::Running => {
                // New input is picked up by the already-chained ticks.
                self.reschedule(0);
                self.store.put_run_state(&self.run)?;
            }
            // Paused runs keep their messages for the resume.
            _ => {}
        }
        Ok(self.run.status)
    }

    async fn handle_action(&mut self, body: ActionBody) -> Result<serde_json::Value> {
        let mut ctx = ActionCtx::new(self.run.clone());
        let result = self
            .plugins
            .on_action(&body.action, &body.payload, &mut ctx)
            .await;
        for (kind, data) in ctx.take_events() {
            self.emit(EventKind::from(kind.as_str()), data)?;
        }
        if ctx.deny_requested() && !self.pending.is_empty() {
            let denied: Vec<ToolCall> = self.pending.drain(..).collect();
            self.store.put_pending_tool_calls(&self.pending)?;
            for call in denied {
                self.emit(
                    EventKind::ToolError,
                    serde_json::json!({ "id": call.id, "name": call.name, "error": "denied by operator" }),
                )?;
                self.store
                    .append_tool_result(&call.id, "Error: denied by operator")?;
            }
        }
        if ctx.resume_requested() && self.run.status == RunStatus::Paused {
            self.run.status = RunStatus::Running;
            self.run.reason = None;
            self.store.put_run_state(&self.run)?;
            self.emit(EventKind::RunResumed, serde_json::json!({}))?;
            self.reschedule(0);
        }
        result.ok_or_else(|| Error::not_found(format!("action '{}'", body.action)))
    }

    /// User-initiated cancel: best-effort cascade over outstanding child
    /// waits, then mark this run canceled. Cancel of a terminal agent is a
    /// no-op. An in-flight model call is not interrupted; the next tick
    /// observes the status and returns.
    fn handle_cancel(&mut self) -> Result<()> {
        if self.run.status.is_terminal() {
            return Ok(());
        }
        let waits = self.store.list_waits()?;
        let coordinator = self.agency.coordinator();
        for wait in &waits {
            coordinator.cancel_child(&wait.child_thread_id);
            if let Err(e) = self.store.mark_link_canceled(&wait.child_thread_id) {
                warn!(thread = %self.id, child = %wait.child_thread_id, error = %e, "link not marked canceled");
            }
        }
        self.store.clear_waits()?;
        self.run.status = RunStatus::Canceled;
        self.run.reason = Some(REASON_USER.to_string());
        self.run.next_alarm_at = None;
        self.store.put_run_state(&self.run)?;
        self.emit(EventKind::RunCanceled, serde_json::json!({}))?;
        info!(thread = %self.id, children = waits.len(), "run canceled");
        Ok(())
    }

    /// Child→parent report-back. Unknown tokens change nothing and surface
    /// as an error to the caller.
    fn handle_child_result(
        &mut self,
        token: String,
        child_thread_id: String,
        report: Option<String>,
    ) -> Result<()> {
        let Some(tool_call_id) = self.store.pop_wait(&token, &child_thread_id)? else {
            return Err(Error::validation("unknown token"));
        };
        let content = report
            .clone()
            .unwrap_or_else(|| "(subagent returned no report)".to_string());
        self.store.append_tool_result(&tool_call_id, &content)?;
        self.store.mark_link_completed(&child_thread_id, report)?;
        self.emit(
            EventKind::SubagentCompleted,
            serde_json::json!({ "childId": child_thread_id }),
        )?;

        let waits_left = self.store.list_waits()?.len();
        if waits_left == 0
            && self.run.status == RunStatus::Paused
            && self.run.reason.as_deref() == Some(REASON_SUBAGENT)
        {
            self.run.status = RunStatus::Running;
            self.run.reason = None;
            self.store.put_run_state(&self.run)?;
            self.emit(EventKind::RunResumed, serde_json::json!({}))?;
            self.reschedule(0);
        } else {
            debug!(thread = %self.id, waits_left, "subagent reported, still waiting");
        }
        Ok(())
    }

    fn handle_snapshot(&self) -> Result<StateSnapshot> {
        let metadata = self
            .metadata
            .clone()
            .ok_or_else(|| Error::not_found(format!("agent '{}' is not registered", self.id)))?;
        Ok(StateSnapshot {
            state: metadata,
            run: self.run.clone(),
        })
    }

    // -- the tick ----------------------------------------------------------

    /// One bounded step: at most one model call plus one capped tool batch.
    async fn handle_tick(&mut self) -> Result<()> {
        if self.run.status != RunStatus::Running {
            // A cancel or pause landed before this tick; nothing to do.
            return Ok(());
        }
        let metadata = self
            .metadata
            .clone()
            .ok_or_else(|| Error::Internal("tick before registration".into()))?;

        self.run.next_alarm_at = None;
        self.emit(EventKind::RunTick, serde_json::json!({ "step": self.run.step }))?;
        self.run.step += 1;
        self.store.put_run_state(&self.run)?;

        if self.pending.is_empty() {
            let mut ctx = HookCtx::new(self.id.as_str(), metadata.blueprint.clone());
            self.plugins.on_tick(&mut ctx).await;
            self.flush_hook_events(&mut ctx)?;

            let mut plan = ModelPlan::new();
            plan.add_system_prompt(&metadata.blueprint.prompt);
            self.plugins.before_model(&mut plan, &mut ctx).await;
            self.flush_hook_events(&mut ctx)?;
            if let Some(reason) = ctx.pause_requested() {
                return self.apply_pause(reason.to_string());
            }

            // Per-tick dynamic tools: executable alongside the resolved set.
            self.tick_tools = self.tools.clone();
            for tool in plan.extra_tools() {
                self.tick_tools.push((tool.name().to_string(), tool.clone()));
            }

            let history = self.store.list_messages()?;
            let request = plan.into_request(
                &self.shared.default_model,
                metadata.blueprint.model.as_deref(),
                history,
                tool_definitions(&self.tools),
            );

            self.emit(
                EventKind::ModelStarted,
                serde_json::json!({ "model": request.model }),
            )?;
            let outcome = match self.shared.provider.invoke(request, None).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    // Model-level failures stop the run; no retry.
                    self.run.status = RunStatus::Error;
                    self.run.reason = Some(e.to_string());
                    self.run.next_alarm_at = None;
                    self.store.put_run_state(&self.run)?;
                    self.emit(
                        EventKind::AgentError,
                        serde_json::json!({ "error": e.to_string() }),
                    )?;
                    return Ok(());
                }
            };
            self.emit(
                EventKind::ModelCompleted,
                serde_json::json!({
                    "usage": outcome.usage.as_ref().map(|u| {
                        serde_json::json!({ "input": u.input_tokens, "output": u.output_tokens })
                    })
                }),
            )?;

            self.plugins.on_model_result(&outcome.message, &mut ctx).await;
            self.flush_hook_events(&mut ctx)?;

            let appended = self.store.append_messages(vec![outcome.message])?;
            let message = appended.into_iter().next().expect("one message appended");
            self.pending = message.tool_calls.clone().unwrap_or_default();
            self.store.put_pending_tool_calls(&self.pending)?;

            // HITL pause lands here, before any flagged tool executes.
            if let Some(reason) = ctx.pause_requested() {
                return self.apply_pause(reason.to_string());
            }

            if message.is_final_assistant() {
                return self.complete(&metadata).await;
            }
        }

        if !self.pending.is_empty() {
            let take = self.pending.len().min(TOOLS_PER_TICK);
            let batch: Vec<ToolCall> = self.pending.drain(..take).collect();
            self.store.put_pending_tool_calls(&self.pending)?;

            let mut ctx = HookCtx::new(self.id.as_str(), metadata.blueprint.clone());
            for call in &batch {
                self.emit(
                    EventKind::ToolStarted,
                    serde_json::json!({ "id": call.id, "name": call.name }),
                )?;
                self.plugins.on_tool_start(call, &mut ctx).await;
            }
            self.flush_hook_events(&mut ctx)?;

            // Concurrent execution; observation below stays in batch order.
            let spawner: Arc<dyn SubagentSpawner> = self.agency.coordinator();
            let mut handles = Vec::with_capacity(batch.len());
            for call in &batch {
                let tool = self
                    .tick_tools
                    .iter()
                    .find(|(name, _)| name == &call.name)
                    .map(|(_, tool)| tool.clone());
                let tool_ctx = ToolCtx {
                    thread_id: self.id.clone(),
                    agency: metadata.agency.clone(),
                    call_id: call.id.clone(),
                    env: self.shared.env.clone(),
                    spawner: Some(spawner.clone()),
                };
                let args = call.args.clone();
                let name = call.name.clone();
                handles.push(tokio::spawn(async move {
                    match tool {
                        Some(tool) => tool.execute(args, tool_ctx).await,
                        None => ToolResult::Error(format!("Tool not found: {name}")),
                    }
                }));
            }

            let mut results = Vec::with_capacity(handles.len());
            for handle in handles {
                results.push(match handle.await {
                    Ok(result) => result,
                    Err(e) => ToolResult::Error(format!("tool crashed: {e}")),
                });
            }

            for (call, result) in batch.iter().zip(results) {
                match result {
                    ToolResult::Deferred => {
                        // The tool supplies its message later (subagent spawn).
                    }
                    ToolResult::Error(message) => {
                        self.emit(
                            EventKind::ToolError,
                            serde_json::json!({ "id": call.id, "name": call.name, "error": message }),
                        )?;
                        self.plugins.on_tool_error(call, &message, &mut ctx).await;
                        self.store
                            .append_tool_result(&call.id, format!("Error: {message}"))?;
                    }
                    other => {
                        let content = other.to_content_string();
                        self.emit(
                            EventKind::ToolOutput,
                            serde_json::json!({ "id": call.id, "name": call.name }),
                        )?;
                        self.plugins.on_tool_result(call, &content, &mut ctx).await;
                        self.store.append_tool_result(&call.id, &content)?;
                    }
                }
            }
            self.flush_hook_events(&mut ctx)?;
        }

        // A spawn during the batch leaves a wait outstanding; the run parks
        // until the last child reports.
        if !self.store.list_waits()?.is_empty() {
            return self.apply_pause(REASON_SUBAGENT.to_string());
        }

        if self.run.status == RunStatus::Running {
            // Remaining queue, fresh tool results, or the next model call:
            // chain the next tick immediately.
            self.reschedule(0);
            self.store.put_run_state(&self.run)?;
        }
        Ok(())
    }

    fn apply_pause(&mut self, reason: String) -> Result<()> {
        self.run.status = RunStatus::Paused;
        self.run.reason = Some(reason.clone());
        self.run.next_alarm_at = None;
        self.store.put_run_state(&self.run)?;
        self.emit(EventKind::RunPaused, serde_json::json!({ "reason": reason }))?;
        Ok(())
    }

    async fn complete(&mut self, metadata: &ThreadMetadata) -> Result<()> {
        self.run.status = RunStatus::Completed;
        self.run.reason = None;
        self.run.next_alarm_at = None;
        self.store.put_run_state(&self.run)?;

        let mut ctx = HookCtx::new(self.id.as_str(), metadata.blueprint.clone());
        self.plugins.on_run_complete(&mut ctx).await;
        self.flush_hook_events(&mut ctx)?;
        self.emit(EventKind::AgentCompleted, serde_json::json!({}))?;
        info!(thread = %self.id, steps = self.run.step, "run completed");

        if let Some(parent) = &metadata.parent {
            let report = self.store.last_assistant()?.map(|m| m.content);
            self.agency
                .coordinator()
                .report_to_parent(parent.clone(), self.id.clone(), report);
        }
        Ok(())
    }
}
