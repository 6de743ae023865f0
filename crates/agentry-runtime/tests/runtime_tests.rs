//! End-to-end runtime tests driven by the scripted provider: happy path,
//! tool loop, subagent pause/resume, HITL, batching, and failure isolation.

use agentry_core::protocol::{ActionBody, InvokeBody};
use agentry_core::{
    Blueprint, EventKind, HubConfig, LinkStatus, Message, Role, RunStatus, REASON_HITL,
    REASON_SUBAGENT, REASON_USER,
};
use agentry_llm::{Behavior, ScriptedProvider};
use agentry_runtime::{AgentHandle, Hub};
use agentry_tools::{Tool, ToolCtx, ToolResult};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

// ---------------------------------------------------------------------------
// Test tools
// ---------------------------------------------------------------------------

struct AddTool;

#[async_trait::async_trait]
impl Tool for AddTool {
    fn name(&self) -> &str {
        "add"
    }

    fn description(&self) -> &str {
        "Add two numbers"
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
            "required": ["a", "b"]
        })
    }

    async fn execute(&self, args: serde_json::Value, _ctx: ToolCtx) -> ToolResult {
        let (Some(a), Some(b)) = (args["a"].as_f64(), args["b"].as_f64()) else {
            return ToolResult::error("add requires numbers 'a' and 'b'");
        };
        let sum = a + b;
        if sum.fract() == 0.0 {
            ToolResult::text(format!("{}", sum as i64))
        } else {
            ToolResult::text(format!("{sum}"))
        }
    }
}

/// Records execution order; used for FIFO batching and HITL assertions.
#[derive(Default)]
struct RecordingTool {
    name: &'static str,
    executed: Arc<Mutex<Vec<String>>>,
}

#[async_trait::async_trait]
impl Tool for RecordingTool {
    fn name(&self) -> &str {
        self.name
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }

    async fn execute(&self, _args: serde_json::Value, ctx: ToolCtx) -> ToolResult {
        self.executed.lock().push(ctx.call_id.clone());
        ToolResult::text("ok")
    }
}

struct FailTool;

#[async_trait::async_trait]
impl Tool for FailTool {
    fn name(&self) -> &str {
        "boom"
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }

    async fn execute(&self, _args: serde_json::Value, _ctx: ToolCtx) -> ToolResult {
        ToolResult::error("boom")
    }
}

/// Returns null: the tool message is someone else's responsibility.
struct DeferTool;

#[async_trait::async_trait]
impl Tool for DeferTool {
    fn name(&self) -> &str {
        "defer"
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }

    async fn execute(&self, _args: serde_json::Value, _ctx: ToolCtx) -> ToolResult {
        ToolResult::Deferred
    }
}

/// Echoes one ambient env value back; probes the explicit env plumbing.
struct EnvProbeTool;

#[async_trait::async_trait]
impl Tool for EnvProbeTool {
    fn name(&self) -> &str {
        "env_probe"
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {"key": {"type": "string"}},
            "required": ["key"]
        })
    }

    async fn execute(&self, args: serde_json::Value, ctx: ToolCtx) -> ToolResult {
        let Some(key) = args["key"].as_str() else {
            return ToolResult::error("env_probe requires 'key'");
        };
        match ctx.env.get(key) {
            Some(value) => ToolResult::text(value.clone()),
            None => ToolResult::error(format!("env '{key}' is not set")),
        }
    }
}

/// Never finishes within a test's lifetime.
struct SpinTool;

#[async_trait::async_trait]
impl Tool for SpinTool {
    fn name(&self) -> &str {
        "spin"
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }

    async fn execute(&self, _args: serde_json::Value, _ctx: ToolCtx) -> ToolResult {
        tokio::time::sleep(Duration::from_secs(30)).await;
        ToolResult::text("spun")
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    hub: Hub,
    provider: Arc<ScriptedProvider>,
    _dir: tempfile::TempDir,
}

async fn harness(provider: ScriptedProvider) -> Harness {
    harness_with(provider, Vec::new()).await
}

async fn harness_with(provider: ScriptedProvider, tools: Vec<Arc<dyn Tool>>) -> Harness {
    let dir = tempdir().unwrap();
    let config = HubConfig {
        data_dir: dir.path().join("data").to_string_lossy().into_owned(),
        default_model: "scripted-model".into(),
        ..HubConfig::default()
    };
    let provider = Arc::new(provider);
    let mut builder = Hub::builder(config)
        .provider(provider.clone())
        .env("PROBE_KEY", "probe-value");
    for tool in tools {
        builder = builder.register_tool(&[], tool);
    }
    let hub = builder.build().await.unwrap();
    Harness {
        hub,
        provider,
        _dir: dir,
    }
}

async fn wait_for_status(handle: &AgentHandle, status: RunStatus) {
    for _ in 0..250 {
        if handle.snapshot().await.unwrap().run.status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let current = handle.snapshot().await.unwrap().run;
    panic!("timed out waiting for {status}; run state is {current:?}");
}

fn user_invoke(content: &str) -> InvokeBody {
    InvokeBody {
        messages: Some(vec![Message::user(content)]),
        files: None,
        vars: None,
    }
}

fn event_kinds(events: &[agentry_core::Event]) -> Vec<&str> {
    events.iter().map(|e| e.kind.as_str()).collect()
}

// ---------------------------------------------------------------------------
// Happy path, no tools
// ---------------------------------------------------------------------------

#[tokio::test]
async fn happy_path_completes_with_final_message() {
    let h = harness(ScriptedProvider::constant(Behavior::Reply("hello".into()))).await;
    let agency = h.hub.create_agency("acme").unwrap();
    agency
        .catalog()
        .put_blueprint(Blueprint::new("echo", "reply hello"))
        .unwrap();

    let id = agency.spawn("echo", Some(user_invoke("hi"))).await.unwrap();
    let handle = agency.agent(&id).unwrap();
    wait_for_status(&handle, RunStatus::Completed).await;

    let messages = agency.messages(&id).unwrap();
    let last = messages.last().unwrap();
    assert_eq!(last.role, Role::Assistant);
    assert_eq!(last.content, "hello");

    let events = handle.events().await.unwrap();
    let kinds = event_kinds(&events);
    for expected in [
        "run.started",
        "run.tick",
        "model.started",
        "model.completed",
        "agent.completed",
    ] {
        assert!(kinds.contains(&expected), "missing {expected} in {kinds:?}");
    }
    // seq strictly increasing, no duplicated tick step
    assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));
    let steps: Vec<_> = events
        .iter()
        .filter(|e| e.kind == EventKind::RunTick)
        .map(|e| e.data["step"].as_u64().unwrap())
        .collect();
    let mut deduped = steps.clone();
    deduped.dedup();
    assert_eq!(steps, deduped, "two ticks carried the same step");
    assert_eq!(h.provider.call_count().await, 1);
}

// ---------------------------------------------------------------------------
// Tool loop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tool_loop_feeds_result_back_to_model() {
    let provider = ScriptedProvider::sequence(vec![
        Behavior::tool_call("t1", "add", serde_json::json!({"a": 2, "b": 3})),
        Behavior::Reply("5".into()),
    ]);
    let h = harness_with(provider, vec![Arc::new(AddTool)]).await;
    let agency = h.hub.create_agency("acme").unwrap();
    let mut calc = Blueprint::new("calc", "you compute sums");
    calc.capabilities = vec!["add".into()];
    agency.catalog().put_blueprint(calc).unwrap();

    let id = agency.spawn("calc", Some(user_invoke("2+3?"))).await.unwrap();
    let handle = agency.agent(&id).unwrap();
    wait_for_status(&handle, RunStatus::Completed).await;

    let messages = agency.messages(&id).unwrap();
    assert_eq!(messages.last().unwrap().content, "5");
    let tool_row = messages
        .iter()
        .find(|m| m.role == Role::Tool)
        .expect("tool message appended");
    assert_eq!(tool_row.tool_call_id.as_deref(), Some("t1"));
    assert_eq!(tool_row.content, "5");
    assert_eq!(h.provider.call_count().await, 2);
}

// ---------------------------------------------------------------------------
// Subagent pause/resume
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subagent_spawn_pauses_parent_until_report() {
    let provider = ScriptedProvider::sequence(vec![
        // parent turn 1: delegate
        Behavior::tool_call(
            "t1",
            "task",
            serde_json::json!({"subagentType": "worker", "description": "do x"}),
        ),
        // child turn 1 (parent is paused, so ordering is deterministic)
        Behavior::Reply("done".into()),
        // parent turn 2 after resume
        Behavior::Reply("all done".into()),
    ]);
    let h = harness(provider).await;
    let agency = h.hub.create_agency("acme").unwrap();
    let mut boss = Blueprint::new("boss", "delegate work");
    boss.capabilities = vec!["task".into()];
    agency.catalog().put_blueprint(boss).unwrap();
    agency
        .catalog()
        .put_blueprint(Blueprint::new("worker", "do the work"))
        .unwrap();

    let id = agency.spawn("boss", Some(user_invoke("handle it"))).await.unwrap();
    let handle = agency.agent(&id).unwrap();
    wait_for_status(&handle, RunStatus::Completed).await;

    let events = handle.events().await.unwrap();
    let kinds = event_kinds(&events);
    assert_eq!(
        kinds.iter().filter(|k| **k == "subagent.spawned").count(),
        1
    );
    assert!(kinds.contains(&"subagent.completed"));
    // The pause carried the subagent reason.
    let paused = events
        .iter()
        .find(|e| e.kind == EventKind::RunPaused)
        .expect("parent paused");
    assert_eq!(paused.data["reason"], REASON_SUBAGENT);
    assert!(kinds.contains(&"run.resumed"));

    let messages = agency.messages(&id).unwrap();
    let tool_row = messages.iter().find(|m| m.role == Role::Tool).unwrap();
    assert_eq!(tool_row.tool_call_id.as_deref(), Some("t1"));
    assert_eq!(tool_row.content, "done");
    assert_eq!(messages.last().unwrap().content, "all done");

    let links = agency.subagent_links(&id).unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].status, LinkStatus::Completed);
    assert_eq!(links[0].report.as_deref(), Some("done"));
    assert!(agency.waits(&id).unwrap().is_empty());

    // The child saw the description as its user message and completed.
    let child_id = &links[0].child_thread_id;
    let child_messages = agency.messages(child_id).unwrap();
    assert_eq!(child_messages[0].role, Role::User);
    assert_eq!(child_messages[0].content, "do x");
    let child = agency.agent(child_id).unwrap();
    assert_eq!(
        child.snapshot().await.unwrap().run.status,
        RunStatus::Completed
    );
}

#[tokio::test]
async fn paused_parent_has_outstanding_waits() {
    let provider = ScriptedProvider::sequence(vec![
        Behavior::tool_call(
            "t1",
            "task",
            serde_json::json!({"subagentType": "worker", "description": "spin forever"}),
        ),
        // child turn: a tool that never finishes
        Behavior::tool_call("c1", "spin", serde_json::json!({})),
    ]);
    let h = harness_with(provider, vec![Arc::new(SpinTool)]).await;
    let agency = h.hub.create_agency("acme").unwrap();
    let mut boss = Blueprint::new("boss", "delegate");
    boss.capabilities = vec!["task".into()];
    agency.catalog().put_blueprint(boss).unwrap();
    let mut worker = Blueprint::new("worker", "spin");
    worker.capabilities = vec!["spin".into()];
    agency.catalog().put_blueprint(worker).unwrap();

    let id = agency.spawn("boss", Some(user_invoke("go"))).await.unwrap();
    let handle = agency.agent(&id).unwrap();
    wait_for_status(&handle, RunStatus::Paused).await;

    let run = handle.snapshot().await.unwrap().run;
    assert_eq!(run.reason.as_deref(), Some(REASON_SUBAGENT));
    assert!(!agency.waits(&id).unwrap().is_empty());

    // Cancel cascades: parent is canceled, link marked, waits cleared.
    handle.cancel().await.unwrap();
    let run = handle.snapshot().await.unwrap().run;
    assert_eq!(run.status, RunStatus::Canceled);
    assert_eq!(run.reason.as_deref(), Some(REASON_USER));
    assert!(agency.waits(&id).unwrap().is_empty());
    let links = agency.subagent_links(&id).unwrap();
    assert_eq!(links[0].status, LinkStatus::Canceled);
    let kinds: Vec<String> = handle
        .events()
        .await
        .unwrap()
        .iter()
        .map(|e| e.kind.as_str().to_string())
        .collect();
    assert!(kinds.iter().any(|k| k == "run.canceled"));

    // A late report with the now-cleared token is rejected.
    let child_id = links[0].child_thread_id.clone();
    let err = handle
        .child_result(links[0].token.clone(), child_id, Some("late".into()))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unknown token"));
}

// ---------------------------------------------------------------------------
// HITL pause on risky tool
// ---------------------------------------------------------------------------

#[tokio::test]
async fn hitl_pauses_before_risky_tool_and_approve_resumes() {
    let executed = Arc::new(Mutex::new(Vec::new()));
    let rm = Arc::new(RecordingTool {
        name: "rm",
        executed: executed.clone(),
    });
    let provider = ScriptedProvider::sequence(vec![
        Behavior::tool_call("t1", "rm", serde_json::json!({"path": "/tmp/x"})),
        Behavior::Reply("removed".into()),
    ]);
    let h = harness_with(provider, vec![rm]).await;
    let agency = h.hub.create_agency("acme").unwrap();
    let mut bp = Blueprint::new("janitor", "clean things up");
    bp.capabilities = vec!["rm".into()];
    bp.config = Some(serde_json::json!({"hitl": {"tools": ["rm"]}}));
    agency.catalog().put_blueprint(bp).unwrap();

    let id = agency.spawn("janitor", Some(user_invoke("rm /tmp/x"))).await.unwrap();
    let handle = agency.agent(&id).unwrap();
    wait_for_status(&handle, RunStatus::Paused).await;

    let run = handle.snapshot().await.unwrap().run;
    assert_eq!(run.reason.as_deref(), Some(REASON_HITL));
    assert!(executed.lock().is_empty(), "rm must not run before approval");

    let result = handle
        .action(ActionBody {
            action: "approve".into(),
            payload: serde_json::json!({}),
        })
        .await
        .unwrap();
    assert_eq!(result["ok"], true);

    wait_for_status(&handle, RunStatus::Completed).await;
    assert_eq!(executed.lock().as_slice(), ["t1"]);
    let messages = agency.messages(&id).unwrap();
    assert_eq!(messages.last().unwrap().content, "removed");
}

#[tokio::test]
async fn hitl_deny_records_denials_and_resumes() {
    let executed = Arc::new(Mutex::new(Vec::new()));
    let rm = Arc::new(RecordingTool {
        name: "rm",
        executed: executed.clone(),
    });
    let provider = ScriptedProvider::sequence(vec![
        Behavior::tool_call("t1", "rm", serde_json::json!({})),
        Behavior::Reply("understood".into()),
    ]);
    let h = harness_with(provider, vec![rm]).await;
    let agency = h.hub.create_agency("acme").unwrap();
    let mut bp = Blueprint::new("janitor", "clean");
    bp.capabilities = vec!["rm".into()];
    bp.config = Some(serde_json::json!({"hitl": {"tools": ["rm"]}}));
    agency.catalog().put_blueprint(bp).unwrap();

    let id = agency.spawn("janitor", Some(user_invoke("rm it"))).await.unwrap();
    let handle = agency.agent(&id).unwrap();
    wait_for_status(&handle, RunStatus::Paused).await;

    handle
        .action(ActionBody {
            action: "deny".into(),
            payload: serde_json::json!({}),
        })
        .await
        .unwrap();
    wait_for_status(&handle, RunStatus::Completed).await;

    assert!(executed.lock().is_empty());
    let messages = agency.messages(&id).unwrap();
    let denial = messages.iter().find(|m| m.role == Role::Tool).unwrap();
    assert_eq!(denial.tool_call_id.as_deref(), Some("t1"));
    assert!(denial.content.starts_with("Error: denied"));
}

// ---------------------------------------------------------------------------
// Batching, null tools, failure isolation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn thirty_tool_calls_split_fifo_across_two_ticks() {
    let executed = Arc::new(Mutex::new(Vec::new()));
    let probe = Arc::new(RecordingTool {
        name: "probe",
        executed: executed.clone(),
    });
    let calls: Vec<(&'static str, &'static str, serde_json::Value)> = (0..30)
        .map(|i| {
            let id: &'static str = Box::leak(format!("t{i:02}").into_boxed_str());
            (id, "probe", serde_json::json!({}))
        })
        .collect();
    let provider = ScriptedProvider::sequence(vec![
        Behavior::ToolCalls(calls),
        Behavior::Reply("done".into()),
    ]);
    let h = harness_with(provider, vec![probe]).await;
    let agency = h.hub.create_agency("acme").unwrap();
    let mut bp = Blueprint::new("fanout", "probe everything");
    bp.capabilities = vec!["probe".into()];
    agency.catalog().put_blueprint(bp).unwrap();

    let id = agency.spawn("fanout", Some(user_invoke("go"))).await.unwrap();
    let handle = agency.agent(&id).unwrap();
    wait_for_status(&handle, RunStatus::Completed).await;

    // Tool messages appended in FIFO order across both ticks.
    let messages = agency.messages(&id).unwrap();
    let tool_ids: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::Tool)
        .map(|m| m.tool_call_id.as_deref().unwrap())
        .collect();
    let expected: Vec<String> = (0..30).map(|i| format!("t{i:02}")).collect();
    assert_eq!(tool_ids, expected.iter().map(String::as_str).collect::<Vec<_>>());
    assert_eq!(executed.lock().len(), 30);

    // 25 + 5: the batch split takes at least three ticks in total.
    let events = handle.events().await.unwrap();
    let ticks = events
        .iter()
        .filter(|e| e.kind == EventKind::RunTick)
        .count();
    assert!(ticks >= 3, "expected batch split across ticks, got {ticks}");
    // Only two model calls: the fan-out and the final reply.
    assert_eq!(h.provider.call_count().await, 2);
}

#[tokio::test]
async fn null_returning_tool_appends_no_message() {
    let provider = ScriptedProvider::sequence(vec![
        Behavior::tool_call("d1", "defer", serde_json::json!({})),
        Behavior::Reply("moving on".into()),
    ]);
    let h = harness_with(provider, vec![Arc::new(DeferTool)]).await;
    let agency = h.hub.create_agency("acme").unwrap();
    let mut bp = Blueprint::new("patient", "wait for things");
    bp.capabilities = vec!["defer".into()];
    agency.catalog().put_blueprint(bp).unwrap();

    let id = agency.spawn("patient", Some(user_invoke("go"))).await.unwrap();
    let handle = agency.agent(&id).unwrap();
    wait_for_status(&handle, RunStatus::Completed).await;

    let messages = agency.messages(&id).unwrap();
    assert!(
        !messages
            .iter()
            .any(|m| m.tool_call_id.as_deref() == Some("d1")),
        "deferred tool must not produce a tool message in its tick"
    );
}

#[tokio::test]
async fn tool_failure_becomes_error_message_and_run_continues() {
    let provider = ScriptedProvider::sequence(vec![
        Behavior::tool_call("t1", "boom", serde_json::json!({})),
        Behavior::Reply("recovered".into()),
    ]);
    let h = harness_with(provider, vec![Arc::new(FailTool)]).await;
    let agency = h.hub.create_agency("acme").unwrap();
    let mut bp = Blueprint::new("fragile", "try things");
    bp.capabilities = vec!["boom".into()];
    agency.catalog().put_blueprint(bp).unwrap();

    let id = agency.spawn("fragile", Some(user_invoke("try"))).await.unwrap();
    let handle = agency.agent(&id).unwrap();
    wait_for_status(&handle, RunStatus::Completed).await;

    let messages = agency.messages(&id).unwrap();
    let tool_row = messages.iter().find(|m| m.role == Role::Tool).unwrap();
    assert!(tool_row.content.starts_with("Error: "));
    let kinds: Vec<String> = handle
        .events()
        .await
        .unwrap()
        .iter()
        .map(|e| e.kind.as_str().to_string())
        .collect();
    assert!(kinds.iter().any(|k| k == "tool.error"));
    assert_eq!(messages.last().unwrap().content, "recovered");
}

#[tokio::test]
async fn model_failure_stops_the_run() {
    let h = harness(ScriptedProvider::constant(Behavior::Fail("API down".into()))).await;
    let agency = h.hub.create_agency("acme").unwrap();
    agency
        .catalog()
        .put_blueprint(Blueprint::new("echo", "reply"))
        .unwrap();

    let id = agency.spawn("echo", Some(user_invoke("hi"))).await.unwrap();
    let handle = agency.agent(&id).unwrap();
    wait_for_status(&handle, RunStatus::Error).await;

    let run = handle.snapshot().await.unwrap().run;
    assert!(run.reason.as_deref().unwrap_or_default().contains("API down"));
    let kinds: Vec<String> = handle
        .events()
        .await
        .unwrap()
        .iter()
        .map(|e| e.kind.as_str().to_string())
        .collect();
    assert!(kinds.iter().any(|k| k == "agent.error"));
    // No retry: exactly one model call.
    assert_eq!(h.provider.call_count().await, 1);
}

// ---------------------------------------------------------------------------
// Idempotence and lifecycle edges
// ---------------------------------------------------------------------------

#[tokio::test]
async fn empty_invoke_on_completed_agent_is_a_noop() {
    let h = harness(ScriptedProvider::constant(Behavior::Reply("hello".into()))).await;
    let agency = h.hub.create_agency("acme").unwrap();
    agency
        .catalog()
        .put_blueprint(Blueprint::new("echo", "reply"))
        .unwrap();
    let id = agency.spawn("echo", Some(user_invoke("hi"))).await.unwrap();
    let handle = agency.agent(&id).unwrap();
    wait_for_status(&handle, RunStatus::Completed).await;

    let before = agency.messages(&id).unwrap().len();
    let status = handle.invoke(InvokeBody::default()).await.unwrap();
    assert_eq!(status, RunStatus::Completed);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(agency.messages(&id).unwrap().len(), before);
    assert_eq!(
        handle.snapshot().await.unwrap().run.status,
        RunStatus::Completed
    );
}

#[tokio::test]
async fn register_is_idempotent_under_the_same_id() {
    let h = harness(ScriptedProvider::constant(Behavior::Reply("hello".into()))).await;
    let agency = h.hub.create_agency("acme").unwrap();
    agency
        .catalog()
        .put_blueprint(Blueprint::new("echo", "reply"))
        .unwrap();
    let id = agency.spawn("echo", None).await.unwrap();
    let handle = agency.agent(&id).unwrap();

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.run.status, RunStatus::Registered);
    handle.register(snapshot.state.clone()).await.unwrap();
    let again = handle.snapshot().await.unwrap();
    assert_eq!(again.state.id, snapshot.state.id);
    assert_eq!(again.state.created_at, snapshot.state.created_at);
}

#[tokio::test]
async fn cancel_of_completed_agent_is_a_noop() {
    let h = harness(ScriptedProvider::constant(Behavior::Reply("hello".into()))).await;
    let agency = h.hub.create_agency("acme").unwrap();
    agency
        .catalog()
        .put_blueprint(Blueprint::new("echo", "reply"))
        .unwrap();
    let id = agency.spawn("echo", Some(user_invoke("hi"))).await.unwrap();
    let handle = agency.agent(&id).unwrap();
    wait_for_status(&handle, RunStatus::Completed).await;

    handle.cancel().await.unwrap();
    assert_eq!(
        handle.snapshot().await.unwrap().run.status,
        RunStatus::Completed
    );
}

#[tokio::test]
async fn children_inherit_the_agency_vars_snapshot() {
    let h = harness(ScriptedProvider::constant(Behavior::Reply("hello".into()))).await;
    let agency = h.hub.create_agency("acme").unwrap();
    agency
        .catalog()
        .var_set("region", &serde_json::json!("eu-1"))
        .unwrap();
    agency
        .catalog()
        .put_blueprint(Blueprint::new("echo", "reply"))
        .unwrap();
    let id = agency.spawn("echo", None).await.unwrap();
    let handle = agency.agent(&id).unwrap();
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state.vars["region"], "eu-1");

    // Later catalogue mutations do not reach the running agent.
    agency
        .catalog()
        .var_set("region", &serde_json::json!("us-2"))
        .unwrap();
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state.vars["region"], "eu-1");
}

#[tokio::test]
async fn blueprint_snapshot_is_frozen_at_registration() {
    let h = harness(ScriptedProvider::constant(Behavior::Reply("hello".into()))).await;
    let agency = h.hub.create_agency("acme").unwrap();
    agency
        .catalog()
        .put_blueprint(Blueprint::new("echo", "original prompt"))
        .unwrap();
    let id = agency.spawn("echo", None).await.unwrap();
    let handle = agency.agent(&id).unwrap();

    agency
        .catalog()
        .put_blueprint(Blueprint::new("echo", "mutated prompt"))
        .unwrap();
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state.blueprint.prompt, "original prompt");
}

#[tokio::test]
async fn spawn_rejects_missing_and_inactive_blueprints() {
    let h = harness(ScriptedProvider::constant(Behavior::Reply("x".into()))).await;
    let agency = h.hub.create_agency("acme").unwrap();
    assert!(matches!(
        agency.spawn("ghost", None).await.unwrap_err(),
        agentry_core::Error::NotFound(_)
    ));

    let mut draft = Blueprint::new("wip", "prompt");
    draft.status = agentry_core::BlueprintStatus::Draft;
    agency.catalog().put_blueprint(draft).unwrap();
    assert!(matches!(
        agency.spawn("wip", None).await.unwrap_err(),
        agentry_core::Error::Validation(_)
    ));
}

#[tokio::test]
async fn env_is_plumbed_into_tools() {
    let provider = ScriptedProvider::sequence(vec![
        Behavior::tool_call("t1", "env_probe", serde_json::json!({"key": "PROBE_KEY"})),
        Behavior::Reply("got it".into()),
    ]);
    let h = harness_with(provider, vec![Arc::new(EnvProbeTool)]).await;
    let agency = h.hub.create_agency("acme").unwrap();
    let mut bp = Blueprint::new("prober", "probe the env");
    bp.capabilities = vec!["env_probe".into()];
    agency.catalog().put_blueprint(bp).unwrap();

    let id = agency.spawn("prober", Some(user_invoke("go"))).await.unwrap();
    let handle = agency.agent(&id).unwrap();
    wait_for_status(&handle, RunStatus::Completed).await;

    let messages = agency.messages(&id).unwrap();
    let tool_row = messages.iter().find(|m| m.role == Role::Tool).unwrap();
    assert_eq!(tool_row.content, "probe-value");
}

#[tokio::test]
async fn live_subscribers_see_events_as_they_happen() {
    let h = harness(ScriptedProvider::constant(Behavior::Reply("hello".into()))).await;
    let agency = h.hub.create_agency("acme").unwrap();
    agency
        .catalog()
        .put_blueprint(Blueprint::new("echo", "reply"))
        .unwrap();
    let id = agency.spawn("echo", None).await.unwrap();
    let handle = agency.agent(&id).unwrap();
    let mut feed = handle.subscribe();

    handle.invoke(user_invoke("hi")).await.unwrap();
    wait_for_status(&handle, RunStatus::Completed).await;

    let mut seen = Vec::new();
    while let Ok(event) = feed.try_recv() {
        seen.push(event.kind.as_str().to_string());
    }
    assert!(seen.iter().any(|k| k == "run.started"));
    assert!(seen.iter().any(|k| k == "agent.completed"));
}

#[tokio::test]
async fn message_log_is_append_only_prefix() {
    let provider = ScriptedProvider::sequence(vec![
        Behavior::tool_call("t1", "add", serde_json::json!({"a": 1, "b": 1})),
        Behavior::Reply("2".into()),
    ]);
    let h = harness_with(provider, vec![Arc::new(AddTool)]).await;
    let agency = h.hub.create_agency("acme").unwrap();
    let mut bp = Blueprint::new("calc", "sum");
    bp.capabilities = vec!["add".into()];
    agency.catalog().put_blueprint(bp).unwrap();

    let id = agency.spawn("calc", Some(user_invoke("1+1"))).await.unwrap();
    let handle = agency.agent(&id).unwrap();

    let mut last: Vec<String> = Vec::new();
    for _ in 0..50 {
        let now: Vec<String> = agency
            .messages(&id)
            .unwrap()
            .iter()
            .map(|m| format!("{}:{}", m.seq, m.content))
            .collect();
        assert!(
            now.len() >= last.len() && now.starts_with(&last),
            "observation {now:?} is not an extension of {last:?}"
        );
        last = now;
        if handle.snapshot().await.unwrap().run.status == RunStatus::Completed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    wait_for_status(&handle, RunStatus::Completed).await;
}
