//! Per-agency catalogues: blueprints, vars, schedules, run history, and the
//! set of spawned agents. Hub-level agency records live here too.

use crate::Store;
use agentry_core::{
    AgencyRecord, AgentStub, Blueprint, Error, Result, Schedule, ScheduleRun, now_ms,
};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::collections::BTreeMap;
use std::sync::Arc;

const AGENCIES: TableDefinition<&str, &[u8]> = TableDefinition::new("agencies");
const BLUEPRINTS: TableDefinition<(&str, &str), &[u8]> = TableDefinition::new("blueprints");
const AGENCY_VARS: TableDefinition<(&str, &str), &[u8]> = TableDefinition::new("agency_vars");
const SCHEDULES: TableDefinition<(&str, &str), &[u8]> = TableDefinition::new("schedules");
const SCHEDULE_RUNS: TableDefinition<(&str, u64), &[u8]> = TableDefinition::new("schedule_runs");
const AGENTS: TableDefinition<(&str, &str), &[u8]> = TableDefinition::new("agents");

pub(crate) fn ensure_tables(db: &Database) -> Result<()> {
    let txn = db.begin_write().map_err(Error::storage)?;
    txn.open_table(AGENCIES).map_err(Error::storage)?;
    txn.open_table(BLUEPRINTS).map_err(Error::storage)?;
    txn.open_table(AGENCY_VARS).map_err(Error::storage)?;
    txn.open_table(SCHEDULES).map_err(Error::storage)?;
    txn.open_table(SCHEDULE_RUNS).map_err(Error::storage)?;
    txn.open_table(AGENTS).map_err(Error::storage)?;
    txn.commit().map_err(Error::storage)?;
    Ok(())
}

impl Store {
    /// Create an agency record; `Err(Conflict)` when the name is taken.
    pub fn create_agency(&self, name: &str) -> Result<AgencyRecord> {
        if !agentry_core::is_valid_name(name) {
            return Err(Error::validation(format!("invalid agency name '{name}'")));
        }
        let record = AgencyRecord {
            name: name.to_string(),
            created_at: now_ms(),
        };
        let txn = self.database().begin_write().map_err(Error::storage)?;
        {
            let mut table = txn.open_table(AGENCIES).map_err(Error::storage)?;
            if table.get(name).map_err(Error::storage)?.is_some() {
                return Err(Error::conflict(format!("agency '{name}' already exists")));
            }
            let bytes = serde_json::to_vec(&record)?;
            table.insert(name, bytes.as_slice()).map_err(Error::storage)?;
        }
        txn.commit().map_err(Error::storage)?;
        Ok(record)
    }

    pub fn get_agency(&self, name: &str) -> Result<Option<AgencyRecord>> {
        let txn = self.database().begin_read().map_err(Error::storage)?;
        let table = txn.open_table(AGENCIES).map_err(Error::storage)?;
        match table.get(name).map_err(Error::storage)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    pub fn list_agencies(&self) -> Result<Vec<AgencyRecord>> {
        let txn = self.database().begin_read().map_err(Error::storage)?;
        let table = txn.open_table(AGENCIES).map_err(Error::storage)?;
        let mut out = Vec::new();
        for item in table.iter().map_err(Error::storage)? {
            let (_, value) = item.map_err(Error::storage)?;
            out.push(serde_json::from_slice(value.value())?);
        }
        Ok(out)
    }
}

/// Store view bound to one agency.
pub struct AgencyStore {
    db: Arc<Database>,
    agency: String,
}

impl AgencyStore {
    pub(crate) fn new(db: Arc<Database>, agency: String) -> Self {
        Self { db, agency }
    }

    pub fn agency_name(&self) -> &str {
        &self.agency
    }

    // -- blueprints --------------------------------------------------------

    /// Upsert a blueprint. Validation runs first; an existing row keeps its
    /// `created_at`.
    pub fn put_blueprint(&self, mut blueprint: Blueprint) -> Result<Blueprint> {
        blueprint.validate().map_err(Error::validation)?;
        let txn = self.db.begin_write().map_err(Error::storage)?;
        {
            let mut table = txn.open_table(BLUEPRINTS).map_err(Error::storage)?;
            let key = (self.agency.as_str(), blueprint.name.as_str());
            if let Some(existing) = table.get(key).map_err(Error::storage)? {
                let existing: Blueprint = serde_json::from_slice(existing.value())?;
                blueprint.created_at = existing.created_at;
            }
            blueprint.updated_at = now_ms();
            let bytes = serde_json::to_vec(&blueprint)?;
            table.insert(key, bytes.as_slice()).map_err(Error::storage)?;
        }
        txn.commit().map_err(Error::storage)?;
        Ok(blueprint)
    }

    pub fn get_blueprint(&self, name: &str) -> Result<Option<Blueprint>> {
        let txn = self.db.begin_read().map_err(Error::storage)?;
        let table = txn.open_table(BLUEPRINTS).map_err(Error::storage)?;
        match table
            .get((self.agency.as_str(), name))
            .map_err(Error::storage)?
        {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    pub fn list_blueprints(&self) -> Result<Vec<Blueprint>> {
        self.list_prefixed(BLUEPRINTS)
    }

    pub fn delete_blueprint(&self, name: &str) -> Result<bool> {
        self.delete_prefixed(BLUEPRINTS, name)
    }

    // -- vars --------------------------------------------------------------

    pub fn var_get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let txn = self.db.begin_read().map_err(Error::storage)?;
        let table = txn.open_table(AGENCY_VARS).map_err(Error::storage)?;
        match table
            .get((self.agency.as_str(), key))
            .map_err(Error::storage)?
        {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    pub fn var_set(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let txn = self.db.begin_write().map_err(Error::storage)?;
        {
            let mut table = txn.open_table(AGENCY_VARS).map_err(Error::storage)?;
            let bytes = serde_json::to_vec(value)?;
            table
                .insert((self.agency.as_str(), key), bytes.as_slice())
                .map_err(Error::storage)?;
        }
        txn.commit().map_err(Error::storage)?;
        Ok(())
    }

    pub fn var_delete(&self, key: &str) -> Result<bool> {
        self.delete_prefixed(AGENCY_VARS, key)
    }

    pub fn vars_all(&self) -> Result<BTreeMap<String, serde_json::Value>> {
        let txn = self.db.begin_read().map_err(Error::storage)?;
        let table = txn.open_table(AGENCY_VARS).map_err(Error::storage)?;
        let agency = self.agency.as_str();
        let mut out = BTreeMap::new();
        for item in table
            .range((agency, "")..=(agency, "\u{10ffff}"))
            .map_err(Error::storage)?
        {
            let (key, value) = item.map_err(Error::storage)?;
            out.insert(
                key.value().1.to_string(),
                serde_json::from_slice(value.value())?,
            );
        }
        Ok(out)
    }

    // -- schedules ---------------------------------------------------------

    pub fn put_schedule(&self, schedule: &Schedule) -> Result<()> {
        schedule.validate().map_err(Error::validation)?;
        let txn = self.db.begin_write().map_err(Error::storage)?;
        {
            let mut table = txn.open_table(SCHEDULES).map_err(Error::storage)?;
            let bytes = serde_json::to_vec(schedule)?;
            table
                .insert((self.agency.as_str(), schedule.id.as_str()), bytes.as_slice())
                .map_err(Error::storage)?;
        }
        txn.commit().map_err(Error::storage)?;
        Ok(())
    }

    pub fn get_schedule(&self, id: &str) -> Result<Option<Schedule>> {
        let txn = self.db.begin_read().map_err(Error::storage)?;
        let table = txn.open_table(SCHEDULES).map_err(Error::storage)?;
        match table
            .get((self.agency.as_str(), id))
            .map_err(Error::storage)?
        {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    pub fn list_schedules(&self) -> Result<Vec<Schedule>> {
        self.list_prefixed(SCHEDULES)
    }

    pub fn delete_schedule(&self, id: &str) -> Result<bool> {
        let removed = self.delete_prefixed(SCHEDULES, id)?;
        if removed {
            self.delete_runs(id)?;
        }
        Ok(removed)
    }

    // -- schedule runs -----------------------------------------------------

    /// Append a run row; returns the row's position in the history.
    pub fn insert_run(&self, run: &ScheduleRun) -> Result<u64> {
        let txn = self.db.begin_write().map_err(Error::storage)?;
        let seq = {
            let mut counters = txn
                .open_table(crate::thread::COUNTERS)
                .map_err(Error::storage)?;
            let mut table = txn.open_table(SCHEDULE_RUNS).map_err(Error::storage)?;
            let key = run.schedule_id.as_str();
            let seq = counters
                .get((key, "runs"))
                .map_err(Error::storage)?
                .map(|g| g.value())
                .unwrap_or(0)
                + 1;
            let bytes = serde_json::to_vec(run)?;
            table
                .insert((key, seq), bytes.as_slice())
                .map_err(Error::storage)?;
            counters.insert((key, "runs"), seq).map_err(Error::storage)?;
            seq
        };
        txn.commit().map_err(Error::storage)?;
        Ok(seq)
    }

    pub fn update_run(&self, seq: u64, run: &ScheduleRun) -> Result<()> {
        let txn = self.db.begin_write().map_err(Error::storage)?;
        {
            let mut table = txn.open_table(SCHEDULE_RUNS).map_err(Error::storage)?;
            let bytes = serde_json::to_vec(run)?;
            table
                .insert((run.schedule_id.as_str(), seq), bytes.as_slice())
                .map_err(Error::storage)?;
        }
        txn.commit().map_err(Error::storage)?;
        Ok(())
    }

    pub fn list_runs(&self, schedule_id: &str) -> Result<Vec<ScheduleRun>> {
        let txn = self.db.begin_read().map_err(Error::storage)?;
        let table = txn.open_table(SCHEDULE_RUNS).map_err(Error::storage)?;
        let mut out = Vec::new();
        for item in table
            .range((schedule_id, 0u64)..=(schedule_id, u64::MAX))
            .map_err(Error::storage)?
        {
            let (_, value) = item.map_err(Error::storage)?;
            out.push(serde_json::from_slice(value.value())?);
        }
        Ok(out)
    }

    fn delete_runs(&self, schedule_id: &str) -> Result<()> {
        let txn = self.db.begin_write().map_err(Error::storage)?;
        {
            let mut table = txn.open_table(SCHEDULE_RUNS).map_err(Error::storage)?;
            let seqs: Vec<u64> = table
                .range((schedule_id, 0u64)..=(schedule_id, u64::MAX))
                .map_err(Error::storage)?
                .map(|item| item.map(|(k, _)| k.value().1))
                .collect::<std::result::Result<_, _>>()
                .map_err(Error::storage)?;
            for seq in seqs {
                table.remove((schedule_id, seq)).map_err(Error::storage)?;
            }
            let mut counters = txn
                .open_table(crate::thread::COUNTERS)
                .map_err(Error::storage)?;
            counters
                .remove((schedule_id, "runs"))
                .map_err(Error::storage)?;
        }
        txn.commit().map_err(Error::storage)?;
        Ok(())
    }

    // -- spawned agents ----------------------------------------------------

    pub fn put_agent(&self, stub: &AgentStub) -> Result<()> {
        let txn = self.db.begin_write().map_err(Error::storage)?;
        {
            let mut table = txn.open_table(AGENTS).map_err(Error::storage)?;
            let bytes = serde_json::to_vec(stub)?;
            table
                .insert((self.agency.as_str(), stub.id.as_str()), bytes.as_slice())
                .map_err(Error::storage)?;
        }
        txn.commit().map_err(Error::storage)?;
        Ok(())
    }

    pub fn remove_agent(&self, id: &str) -> Result<bool> {
        self.delete_prefixed(AGENTS, id)
    }

    pub fn list_agents(&self) -> Result<Vec<AgentStub>> {
        self.list_prefixed(AGENTS)
    }

    // -- cascade delete ----------------------------------------------------

    /// Remove this agency's record and every catalogue row. Thread logs are
    /// purged by the caller, which owns the agent handles.
    pub fn delete_all(&self) -> Result<()> {
        for schedule in self.list_schedules()? {
            self.delete_runs(&schedule.id)?;
        }
        let txn = self.db.begin_write().map_err(Error::storage)?;
        {
            let agency = self.agency.as_str();
            for def in [BLUEPRINTS, AGENCY_VARS, SCHEDULES, AGENTS] {
                let mut table = txn.open_table(def).map_err(Error::storage)?;
                let keys: Vec<String> = table
                    .range((agency, "")..=(agency, "\u{10ffff}"))
                    .map_err(Error::storage)?
                    .map(|item| item.map(|(k, _)| k.value().1.to_string()))
                    .collect::<std::result::Result<_, _>>()
                    .map_err(Error::storage)?;
                for key in keys {
                    table.remove((agency, key.as_str())).map_err(Error::storage)?;
                }
            }
            let mut agencies = txn.open_table(AGENCIES).map_err(Error::storage)?;
            agencies.remove(agency).map_err(Error::storage)?;
        }
        txn.commit().map_err(Error::storage)?;
        Ok(())
    }

    // -- helpers -----------------------------------------------------------

    fn list_prefixed<T: serde::de::DeserializeOwned>(
        &self,
        def: TableDefinition<'static, (&'static str, &'static str), &'static [u8]>,
    ) -> Result<Vec<T>> {
        let txn = self.db.begin_read().map_err(Error::storage)?;
        let table = txn.open_table(def).map_err(Error::storage)?;
        let agency = self.agency.as_str();
        let mut out = Vec::new();
        for item in table
            .range((agency, "")..=(agency, "\u{10ffff}"))
            .map_err(Error::storage)?
        {
            let (_, value) = item.map_err(Error::storage)?;
            out.push(serde_json::from_slice(value.value())?);
        }
        Ok(out)
    }

    fn delete_prefixed(
        &self,
        def: TableDefinition<'static, (&'static str, &'static str), &'static [u8]>,
        key: &str,
    ) -> Result<bool> {
        let txn = self.db.begin_write().map_err(Error::storage)?;
        let existed = {
            let mut table = txn.open_table(def).map_err(Error::storage)?;
            let removed = table
                .remove((self.agency.as_str(), key))
                .map_err(Error::storage)?
                .is_some();
            removed
        };
        txn.commit().map_err(Error::storage)?;
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentry_core::{OverlapPolicy, RunRowStatus, ScheduleStatus, ScheduleType};
    use tempfile::tempdir;

    fn store() -> (Store, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("test.redb")).unwrap();
        (store, dir)
    }

    fn interval_schedule(id: &str) -> Schedule {
        Schedule {
            id: id.into(),
            name: "poller".into(),
            agent_type: "checker".into(),
            input: None,
            schedule_type: ScheduleType::Interval,
            run_at: None,
            cron: None,
            interval_ms: Some(1000),
            status: ScheduleStatus::Active,
            overlap_policy: OverlapPolicy::Skip,
            max_retries: 0,
            timeout_ms: None,
            timezone: None,
            created_at: now_ms(),
            updated_at: now_ms(),
            last_run_at: None,
            next_run_at: None,
        }
    }

    #[test]
    fn agency_create_conflicts_on_duplicate() {
        let (store, _dir) = store();
        store.create_agency("acme").unwrap();
        let err = store.create_agency("acme").unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(store.list_agencies().unwrap().len(), 1);
    }

    #[test]
    fn agency_create_validates_name() {
        let (store, _dir) = store();
        assert!(matches!(
            store.create_agency("bad name").unwrap_err(),
            Error::Validation(_)
        ));
        assert!(store.create_agency("a-b_1").is_ok());
    }

    #[test]
    fn blueprint_upsert_preserves_created_at() {
        let (store, _dir) = store();
        let agency = store.agency("acme");
        let first = agency
            .put_blueprint(Blueprint::new("echo", "reply hello"))
            .unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        let mut second = Blueprint::new("echo", "reply goodbye");
        second.description = "updated".into();
        let second = agency.put_blueprint(second).unwrap();

        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);
        let listed = agency.list_blueprints().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].prompt, "reply goodbye");
    }

    #[test]
    fn blueprint_validation_rejected_before_persist() {
        let (store, _dir) = store();
        let agency = store.agency("acme");
        assert!(agency.put_blueprint(Blueprint::new("bad name", "p")).is_err());
        assert!(agency.put_blueprint(Blueprint::new("ok", "")).is_err());
        assert!(agency.list_blueprints().unwrap().is_empty());
    }

    #[test]
    fn vars_roundtrip_and_delete() {
        let (store, _dir) = store();
        let agency = store.agency("acme");
        agency.var_set("region", &serde_json::json!("eu-1")).unwrap();
        agency
            .var_set("limits", &serde_json::json!({"rpm": 40}))
            .unwrap();
        assert_eq!(
            agency.var_get("region").unwrap(),
            Some(serde_json::json!("eu-1"))
        );
        assert_eq!(agency.vars_all().unwrap().len(), 2);
        assert!(agency.var_delete("region").unwrap());
        assert!(!agency.var_delete("region").unwrap());
        assert!(agency.var_get("region").unwrap().is_none());
    }

    #[test]
    fn schedule_crud_and_run_history() {
        let (store, _dir) = store();
        let agency = store.agency("acme");
        agency.put_schedule(&interval_schedule("sch-1")).unwrap();
        assert!(agency.get_schedule("sch-1").unwrap().is_some());

        let mut run = ScheduleRun {
            id: "run-1".into(),
            schedule_id: "sch-1".into(),
            agent_id: None,
            status: RunRowStatus::Running,
            scheduled_at: now_ms(),
            started_at: Some(now_ms()),
            completed_at: None,
            error: None,
            result: None,
            retry_count: 0,
        };
        let seq = agency.insert_run(&run).unwrap();
        run.status = RunRowStatus::Completed;
        run.completed_at = Some(now_ms());
        agency.update_run(seq, &run).unwrap();

        let runs = agency.list_runs("sch-1").unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunRowStatus::Completed);

        assert!(agency.delete_schedule("sch-1").unwrap());
        assert!(agency.list_runs("sch-1").unwrap().is_empty());
    }

    #[test]
    fn invalid_schedule_rejected() {
        let (store, _dir) = store();
        let agency = store.agency("acme");
        let mut schedule = interval_schedule("sch-1");
        schedule.interval_ms = None;
        assert!(matches!(
            agency.put_schedule(&schedule).unwrap_err(),
            Error::Validation(_)
        ));
    }

    #[test]
    fn cascade_delete_clears_catalogues() {
        let (store, _dir) = store();
        store.create_agency("acme").unwrap();
        let agency = store.agency("acme");
        agency
            .put_blueprint(Blueprint::new("echo", "reply hello"))
            .unwrap();
        agency.var_set("k", &serde_json::json!(1)).unwrap();
        agency.put_schedule(&interval_schedule("sch-1")).unwrap();
        agency
            .put_agent(&AgentStub {
                id: "th-1".into(),
                agent_type: "echo".into(),
                created_at: now_ms(),
            })
            .unwrap();

        agency.delete_all().unwrap();
        assert!(store.get_agency("acme").unwrap().is_none());
        assert!(agency.list_blueprints().unwrap().is_empty());
        assert!(agency.vars_all().unwrap().is_empty());
        assert!(agency.list_schedules().unwrap().is_empty());
        assert!(agency.list_agents().unwrap().is_empty());
    }
}
