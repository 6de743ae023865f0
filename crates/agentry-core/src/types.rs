//! Core types for Agentry

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Epoch milliseconds, the timestamp unit used everywhere.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Names for agencies, blueprints and agent types share one shape:
/// URL-safe, `^[A-Za-z0-9_-]+$`.
pub fn is_valid_name(name: &str) -> bool {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = RE.get_or_init(|| regex::Regex::new("^[A-Za-z0-9_-]+$").expect("name regex"));
    re.is_match(name)
}

/// Message role
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool call emitted by the assistant
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// A message in an agent's conversation log.
///
/// `seq` is assigned by the store on append; callers construct messages
/// with `seq == 0` and never rely on it before the message is persisted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub seq: u64,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            seq: 0,
            role: Role::System,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            seq: 0,
            role: Role::User,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            seq: 0,
            role: Role::Assistant,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant_tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            seq: 0,
            role: Role::Assistant,
            content: String::new(),
            tool_calls: Some(calls),
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            seq: 0,
            role: Role::Tool,
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    /// Assistant message that ends a run: non-empty content, no tool calls.
    pub fn is_final_assistant(&self) -> bool {
        self.role == Role::Assistant
            && !self.content.is_empty()
            && self.tool_calls.as_ref().map_or(true, |c| c.is_empty())
    }
}

/// Run lifecycle status
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Registered,
    Running,
    Paused,
    Completed,
    Canceled,
    Error,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Canceled | Self::Error)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Registered => "registered",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Canceled => "canceled",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Mutable run state of one agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunState {
    pub status: RunStatus,
    pub step: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_alarm_at: Option<i64>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            status: RunStatus::Registered,
            step: 0,
            reason: None,
            next_alarm_at: None,
        }
    }
}

/// Pause reasons carried in `RunState.reason`.
pub const REASON_HITL: &str = "hitl";
pub const REASON_SUBAGENT: &str = "subagent";
pub const REASON_USER: &str = "user";

/// Event kind — the closed lifecycle set plus plugin-emitted types.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    RunStarted,
    RunTick,
    RunPaused,
    RunResumed,
    RunCanceled,
    AgentCompleted,
    AgentError,
    ModelStarted,
    ModelCompleted,
    ToolStarted,
    ToolOutput,
    ToolError,
    SubagentSpawned,
    SubagentCompleted,
    Custom(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::RunStarted => "run.started",
            Self::RunTick => "run.tick",
            Self::RunPaused => "run.paused",
            Self::RunResumed => "run.resumed",
            Self::RunCanceled => "run.canceled",
            Self::AgentCompleted => "agent.completed",
            Self::AgentError => "agent.error",
            Self::ModelStarted => "model.started",
            Self::ModelCompleted => "model.completed",
            Self::ToolStarted => "tool.started",
            Self::ToolOutput => "tool.output",
            Self::ToolError => "tool.error",
            Self::SubagentSpawned => "subagent.spawned",
            Self::SubagentCompleted => "subagent.completed",
            Self::Custom(s) => s,
        }
    }
}

impl From<&str> for EventKind {
    fn from(s: &str) -> Self {
        match s {
            "run.started" => Self::RunStarted,
            "run.tick" => Self::RunTick,
            "run.paused" => Self::RunPaused,
            "run.resumed" => Self::RunResumed,
            "run.canceled" => Self::RunCanceled,
            "agent.completed" => Self::AgentCompleted,
            "agent.error" => Self::AgentError,
            "model.started" => Self::ModelStarted,
            "model.completed" => Self::ModelCompleted,
            "tool.started" => Self::ToolStarted,
            "tool.output" => Self::ToolOutput,
            "tool.error" => Self::ToolError,
            "subagent.spawned" => Self::SubagentSpawned,
            "subagent.completed" => Self::SubagentCompleted,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for EventKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(EventKind::from(s.as_str()))
    }
}

/// One row of the append-only event trace.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub seq: u64,
    pub thread_id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub ts: i64,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(thread_id: impl Into<String>, kind: EventKind, data: serde_json::Value) -> Self {
        Self {
            seq: 0,
            thread_id: thread_id.into(),
            kind,
            ts: now_ms(),
            data,
        }
    }
}

/// Blueprint lifecycle status
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BlueprintStatus {
    #[default]
    Active,
    Draft,
    Disabled,
}

/// Declarative template for spawning agents of one type.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Blueprint {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub prompt: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
    #[serde(default)]
    pub status: BlueprintStatus,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl Blueprint {
    pub fn new(name: impl Into<String>, prompt: impl Into<String>) -> Self {
        let ts = now_ms();
        Self {
            name: name.into(),
            description: String::new(),
            prompt: prompt.into(),
            capabilities: Vec::new(),
            model: None,
            config: None,
            status: BlueprintStatus::Active,
            created_at: ts,
            updated_at: ts,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !is_valid_name(&self.name) {
            return Err(format!("invalid blueprint name '{}'", self.name));
        }
        if self.prompt.is_empty() {
            return Err(format!("blueprint '{}' has an empty prompt", self.name));
        }
        Ok(())
    }

    /// Tool names the HITL plugin treats as risky, from `config.hitl.tools`.
    pub fn hitl_tools(&self) -> Vec<String> {
        self.config
            .as_ref()
            .and_then(|c| c.get("hitl"))
            .and_then(|h| h.get("tools"))
            .and_then(|t| t.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Weak reference from a child back to its parent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParentRef {
    pub thread_id: String,
    pub token: String,
}

/// Identity + configuration handed to an agent at registration.
///
/// The blueprint is a snapshot: later blueprint mutations on the agency do
/// not alter running agents.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThreadMetadata {
    pub id: String,
    pub agency: String,
    pub agent_type: String,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentRef>,
    pub blueprint: Blueprint,
    #[serde(default)]
    pub vars: BTreeMap<String, serde_json::Value>,
}

/// Agency-side record of one spawned agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentStub {
    pub id: String,
    pub agent_type: String,
    pub created_at: i64,
}

/// Hub-side record of one agency.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgencyRecord {
    pub name: String,
    pub created_at: i64,
}

/// Status of one parent→child link.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Waiting,
    Completed,
    Canceled,
}

/// Parent's view of one spawned child.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubagentLink {
    pub child_thread_id: String,
    pub token: String,
    pub status: LinkStatus,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

/// One entry of the waiting-subagent index: "blocked on child X, keyed by token T".
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WaitEntry {
    pub token: String,
    pub child_thread_id: String,
    pub tool_call_id: String,
}

/// Schedule firing mode
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleType {
    Once,
    Cron,
    Interval,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    #[default]
    Active,
    Paused,
    Disabled,
}

/// What to do when a prior run of the same schedule is still active.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    #[default]
    Skip,
    Queue,
    Allow,
}

/// Time-triggered agent creation rule, owned by one agency.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub name: String,
    pub agent_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    #[serde(rename = "type")]
    pub schedule_type: ScheduleType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<i64>,
    #[serde(default)]
    pub status: ScheduleStatus,
    #[serde(default)]
    pub overlap_policy: OverlapPolicy,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<i64>,
}

impl Schedule {
    pub fn validate(&self) -> Result<(), String> {
        match self.schedule_type {
            ScheduleType::Once if self.run_at.is_none() => {
                Err("schedule type 'once' requires run_at".into())
            }
            ScheduleType::Cron if self.cron.is_none() => {
                Err("schedule type 'cron' requires a cron expression".into())
            }
            ScheduleType::Interval if self.interval_ms.is_none() => {
                Err("schedule type 'interval' requires interval_ms".into())
            }
            ScheduleType::Interval if self.interval_ms.is_some_and(|ms| ms <= 0) => {
                Err("interval_ms must be positive".into())
            }
            _ => Ok(()),
        }
    }
}

/// Status of one execution attempt of a schedule.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunRowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// One execution attempt of a schedule. `completed` means the spawn
/// completed; the agent itself keeps running autonomously.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScheduleRun {
    pub id: String,
    pub schedule_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub status: RunRowStatus,
    pub scheduled_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub retry_count: u32,
}

/// Hub configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub bind: BindMode,
    /// Shared secret for the `X-SECRET` header. None disables auth.
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_model")]
    pub default_model: String,
}

fn default_port() -> u16 {
    17717
}

fn default_data_dir() -> String {
    "agentry-data".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: BindMode::default(),
            secret: None,
            data_dir: default_data_dir(),
            default_model: default_model(),
        }
    }
}

/// Bind mode for the gateway
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindMode {
    #[default]
    Loopback,
    Lan,
}

impl BindMode {
    pub fn to_addr(&self) -> &str {
        match self {
            BindMode::Loopback => "127.0.0.1",
            BindMode::Lan => "0.0.0.0",
        }
    }
}
