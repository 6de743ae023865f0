//! Per-agency schedule dispatch
//!
//! Alarm-driven: one pending alarm task per active schedule, re-armed after
//! each firing. Dispatch applies the schedule's overlap policy, records a
//! run row per attempt, and hands the actual agent creation to the owning
//! agency through [`AgentSpawner`].

use crate::timing::{compute_next_run, parse_cron, parse_timezone};
use agentry_core::{
    now_ms, Error, OverlapPolicy, Result, RunRowStatus, Schedule, ScheduleRun, ScheduleStatus,
    ScheduleType,
};
use agentry_store::AgencyStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long the `queue` overlap policy waits between busy re-checks.
const QUEUE_RECHECK_MS: u64 = 250;

/// Seam to the owning agency: spawning agents and probing their liveness.
#[async_trait::async_trait]
pub trait AgentSpawner: Send + Sync {
    /// Spawn an agent of `agent_type` with the schedule's input. Returns the
    /// new agent id.
    async fn spawn_agent(
        &self,
        agent_type: &str,
        input: Option<&serde_json::Value>,
    ) -> std::result::Result<String, String>;

    /// Whether a previously spawned agent is still in a non-terminal state.
    async fn agent_active(&self, agent_id: &str) -> bool;
}

struct SchedulerInner {
    store: AgencyStore,
    spawner: Arc<dyn AgentSpawner>,
    alarms: Mutex<HashMap<String, JoinHandle<()>>>,
}

/// The per-agency scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(store: AgencyStore, spawner: Arc<dyn AgentSpawner>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                spawner,
                alarms: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Re-arm alarms for every active schedule. Called once on boot.
    pub fn start(&self) -> Result<()> {
        for schedule in self.inner.store.list_schedules()? {
            if schedule.status == ScheduleStatus::Active {
                let mut schedule = schedule;
                if schedule.next_run_at.is_none() {
                    schedule.next_run_at = compute_next_run(&schedule, now_ms());
                    self.inner.store.put_schedule(&schedule)?;
                }
                self.arm(&schedule, true);
            }
        }
        Ok(())
    }

    /// Abort every pending alarm.
    pub fn shutdown(&self) {
        let mut alarms = self.inner.alarms.lock();
        for (_, handle) in alarms.drain() {
            handle.abort();
        }
    }

    // -- CRUD --------------------------------------------------------------

    pub fn create(&self, mut schedule: Schedule) -> Result<Schedule> {
        if schedule.id.is_empty() {
            schedule.id = uuid::Uuid::new_v4().to_string();
        }
        let ts = now_ms();
        schedule.created_at = ts;
        schedule.updated_at = ts;
        schedule.last_run_at = None;
        validate_timing(&schedule)?;
        schedule.next_run_at = compute_next_run(&schedule, ts);
        self.inner.store.put_schedule(&schedule)?;
        self.arm(&schedule, true);
        info!(schedule = %schedule.id, name = %schedule.name, "schedule created");
        Ok(schedule)
    }

    /// Merge a JSON patch into the schedule, revalidate, and re-arm.
    pub fn update(&self, id: &str, patch: &serde_json::Value) -> Result<Schedule> {
        let existing = self.require(id)?;
        let mut merged = serde_json::to_value(&existing)?;
        let Some(patch_object) = patch.as_object() else {
            return Err(Error::validation("schedule patch must be an object"));
        };
        let Some(merged_object) = merged.as_object_mut() else {
            return Err(Error::Internal("schedule did not serialize to an object".into()));
        };
        for (key, value) in patch_object {
            if matches!(key.as_str(), "id" | "created_at" | "last_run_at" | "next_run_at") {
                continue;
            }
            merged_object.insert(key.clone(), value.clone());
        }
        let mut schedule: Schedule = serde_json::from_value(merged)
            .map_err(|e| Error::validation(format!("bad schedule patch: {e}")))?;
        schedule.id = existing.id;
        schedule.created_at = existing.created_at;
        schedule.last_run_at = existing.last_run_at;
        schedule.updated_at = now_ms();
        validate_timing(&schedule)?;
        schedule.next_run_at = if schedule.status == ScheduleStatus::Active {
            compute_next_run(&schedule, now_ms())
        } else {
            None
        };
        self.inner.store.put_schedule(&schedule)?;
        self.arm(&schedule, true);
        Ok(schedule)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        self.disarm(id);
        self.inner.store.delete_schedule(id)
    }

    pub fn get(&self, id: &str) -> Result<Option<Schedule>> {
        self.inner.store.get_schedule(id)
    }

    pub fn list(&self) -> Result<Vec<Schedule>> {
        self.inner.store.list_schedules()
    }

    pub fn runs(&self, id: &str) -> Result<Vec<ScheduleRun>> {
        self.require(id)?;
        self.inner.store.list_runs(id)
    }

    /// Pause: clear the pending alarm.
    pub fn pause(&self, id: &str) -> Result<Schedule> {
        let mut schedule = self.require(id)?;
        schedule.status = ScheduleStatus::Paused;
        schedule.next_run_at = None;
        schedule.updated_at = now_ms();
        self.inner.store.put_schedule(&schedule)?;
        self.disarm(id);
        Ok(schedule)
    }

    /// Resume: recompute the next firing and re-arm.
    pub fn resume(&self, id: &str) -> Result<Schedule> {
        let mut schedule = self.require(id)?;
        if schedule.status == ScheduleStatus::Disabled {
            return Err(Error::validation(format!("schedule '{id}' is disabled")));
        }
        schedule.status = ScheduleStatus::Active;
        schedule.next_run_at = compute_next_run(&schedule, now_ms());
        schedule.updated_at = now_ms();
        self.inner.store.put_schedule(&schedule)?;
        self.arm(&schedule, true);
        Ok(schedule)
    }

    /// Manual fire: bypasses the overlap policy and leaves the natural alarm
    /// chain untouched.
    pub async fn trigger(&self, id: &str) -> Result<ScheduleRun> {
        let mut schedule = self.require(id)?;
        let now = now_ms();
        let run = self.execute_run(&schedule, now).await?;
        schedule.last_run_at = Some(now);
        schedule.updated_at = now;
        self.inner.store.put_schedule(&schedule)?;
        Ok(run)
    }

    fn require(&self, id: &str) -> Result<Schedule> {
        self.inner
            .store
            .get_schedule(id)?
            .ok_or_else(|| Error::not_found(format!("schedule '{id}'")))
    }

    // -- dispatch ----------------------------------------------------------

    /// One alarm firing. Loads the schedule, applies the overlap policy,
    /// records the run, and re-arms for the next firing.
    pub async fn run_scheduled(&self, id: &str) {
        let schedule = match self.inner.store.get_schedule(id) {
            Ok(Some(schedule)) => schedule,
            Ok(None) => {
                debug!(schedule = %id, "alarm fired for a deleted schedule");
                return;
            }
            Err(e) => {
                error!(schedule = %id, error = %e, "failed to load schedule");
                return;
            }
        };
        if schedule.status != ScheduleStatus::Active {
            debug!(schedule = %id, "alarm fired for an inactive schedule");
            return;
        }

        let mut schedule = schedule;
        let now = now_ms();

        match schedule.overlap_policy {
            OverlapPolicy::Skip => {
                if self.busy(&schedule).await {
                    let skipped = ScheduleRun {
                        id: uuid::Uuid::new_v4().to_string(),
                        schedule_id: schedule.id.clone(),
                        agent_id: None,
                        status: RunRowStatus::Skipped,
                        scheduled_at: now,
                        started_at: None,
                        completed_at: Some(now),
                        error: None,
                        result: None,
                        retry_count: 0,
                    };
                    if let Err(e) = self.inner.store.insert_run(&skipped) {
                        error!(schedule = %id, error = %e, "failed to record skipped run");
                    }
                    info!(schedule = %id, "overlap policy skip: prior run still active");
                    schedule.last_run_at = Some(now);
                    self.finish_chain(schedule, now);
                    return;
                }
            }
            OverlapPolicy::Queue => {
                // The alarm stays pending until the busy condition clears.
                while self.busy(&schedule).await {
                    tokio::time::sleep(Duration::from_millis(QUEUE_RECHECK_MS)).await;
                    match self.inner.store.get_schedule(id) {
                        Ok(Some(current)) if current.status == ScheduleStatus::Active => {}
                        _ => return,
                    }
                }
            }
            OverlapPolicy::Allow => {}
        }

        if let Err(e) = self.execute_run(&schedule, now).await {
            error!(schedule = %id, error = %e, "failed to record schedule run");
        }
        schedule.last_run_at = Some(now);
        self.finish_chain(schedule, now);
    }

    /// Steps 3-4: insert the run row, spawn with instant retries, record the
    /// outcome. "completed" means the spawn completed; the agent keeps
    /// running autonomously.
    async fn execute_run(&self, schedule: &Schedule, scheduled_at: i64) -> Result<ScheduleRun> {
        let mut run = ScheduleRun {
            id: uuid::Uuid::new_v4().to_string(),
            schedule_id: schedule.id.clone(),
            agent_id: None,
            status: RunRowStatus::Running,
            scheduled_at,
            started_at: Some(now_ms()),
            completed_at: None,
            error: None,
            result: None,
            retry_count: 0,
        };
        let seq = self.inner.store.insert_run(&run)?;

        let mut attempts: u32 = 0;
        loop {
            match self
                .inner
                .spawner
                .spawn_agent(&schedule.agent_type, schedule.input.as_ref())
                .await
            {
                Ok(agent_id) => {
                    run.agent_id = Some(agent_id);
                    run.status = RunRowStatus::Completed;
                    run.completed_at = Some(now_ms());
                    break;
                }
                Err(message) => {
                    if attempts < schedule.max_retries {
                        attempts += 1;
                        run.retry_count = attempts;
                        warn!(
                            schedule = %schedule.id,
                            attempt = attempts,
                            error = %message,
                            "spawn failed, retrying"
                        );
                        continue;
                    }
                    run.status = RunRowStatus::Failed;
                    run.error = Some(message);
                    run.completed_at = Some(now_ms());
                    break;
                }
            }
        }
        self.inner.store.update_run(seq, &run)?;
        Ok(run)
    }

    /// Step 6: `once` schedules disable after firing; everything else
    /// computes the next firing and re-arms.
    fn finish_chain(&self, mut schedule: Schedule, now: i64) {
        if schedule.schedule_type == ScheduleType::Once {
            schedule.status = ScheduleStatus::Disabled;
            schedule.next_run_at = None;
            schedule.updated_at = now;
            if let Err(e) = self.inner.store.put_schedule(&schedule) {
                error!(schedule = %schedule.id, error = %e, "failed to disable once schedule");
            }
            self.inner.alarms.lock().remove(&schedule.id);
            return;
        }
        schedule.next_run_at = compute_next_run(&schedule, now_ms());
        schedule.updated_at = now;
        if let Err(e) = self.inner.store.put_schedule(&schedule) {
            error!(schedule = %schedule.id, error = %e, "failed to persist next run");
        }
        // Re-armed from inside the finishing alarm task: replace without
        // aborting, the current task is already past its dispatch.
        self.arm(&schedule, false);
    }

    /// A schedule is busy while a run row is `running` or its most recently
    /// spawned agent is still in a non-terminal state.
    async fn busy(&self, schedule: &Schedule) -> bool {
        let runs = match self.inner.store.list_runs(&schedule.id) {
            Ok(runs) => runs,
            Err(e) => {
                error!(schedule = %schedule.id, error = %e, "failed to load run history");
                return false;
            }
        };
        if runs
            .iter()
            .any(|r| matches!(r.status, RunRowStatus::Running | RunRowStatus::Pending))
        {
            return true;
        }
        if let Some(agent_id) = runs.iter().rev().find_map(|r| r.agent_id.as_deref()) {
            return self.inner.spawner.agent_active(agent_id).await;
        }
        false
    }

    fn arm(&self, schedule: &Schedule, abort_existing: bool) {
        let mut alarms = self.inner.alarms.lock();
        if let Some(handle) = alarms.remove(&schedule.id) {
            if abort_existing {
                handle.abort();
            }
        }
        if schedule.status != ScheduleStatus::Active {
            return;
        }
        let Some(next_run_at) = schedule.next_run_at else {
            return;
        };
        let delay = (next_run_at - now_ms()).max(0) as u64;
        let scheduler = self.clone();
        let id = schedule.id.clone();
        debug!(schedule = %id, delay_ms = delay, "alarm armed");
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            scheduler.run_scheduled(&id).await;
        });
        alarms.insert(schedule.id.clone(), handle);
    }

    fn disarm(&self, id: &str) {
        if let Some(handle) = self.inner.alarms.lock().remove(id) {
            handle.abort();
        }
    }
}

fn validate_timing(schedule: &Schedule) -> Result<()> {
    schedule.validate().map_err(Error::validation)?;
    if let Some(expression) = &schedule.cron {
        parse_cron(expression).map_err(Error::validation)?;
    }
    if let Some(timezone) = &schedule.timezone {
        parse_timezone(timezone).map_err(Error::validation)?;
    }
    Ok(())
}
