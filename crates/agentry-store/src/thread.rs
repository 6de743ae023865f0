//! Per-agent storage: append-only message/event logs, subagent links,
//! the waiting-subagent index, run state and vars.

use agentry_core::{
    Error, Event, LinkStatus, Message, Result, Role, RunState, SubagentLink, ThreadMetadata,
    ToolCall, WaitEntry, now_ms,
};
use parking_lot::Mutex;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::collections::BTreeMap;
use std::sync::Arc;

const MESSAGES: TableDefinition<(&str, u64), &[u8]> = TableDefinition::new("messages");
const EVENTS: TableDefinition<(&str, u64), &[u8]> = TableDefinition::new("events");
pub(crate) const COUNTERS: TableDefinition<(&str, &str), u64> = TableDefinition::new("counters");
const LINKS: TableDefinition<(&str, &str), &[u8]> = TableDefinition::new("subagent_links");
const WAITS: TableDefinition<&str, &[u8]> = TableDefinition::new("subagent_waits");
const RUN_STATE: TableDefinition<&str, &[u8]> = TableDefinition::new("run_state");
const THREAD_META: TableDefinition<&str, &[u8]> = TableDefinition::new("thread_meta");
const PENDING: TableDefinition<&str, &[u8]> = TableDefinition::new("pending_tool_calls");
const THREAD_VARS: TableDefinition<(&str, &str), &[u8]> = TableDefinition::new("thread_vars");

pub(crate) fn ensure_tables(db: &Database) -> Result<()> {
    let txn = db.begin_write().map_err(Error::storage)?;
    txn.open_table(MESSAGES).map_err(Error::storage)?;
    txn.open_table(EVENTS).map_err(Error::storage)?;
    txn.open_table(COUNTERS).map_err(Error::storage)?;
    txn.open_table(LINKS).map_err(Error::storage)?;
    txn.open_table(WAITS).map_err(Error::storage)?;
    txn.open_table(RUN_STATE).map_err(Error::storage)?;
    txn.open_table(THREAD_META).map_err(Error::storage)?;
    txn.open_table(PENDING).map_err(Error::storage)?;
    txn.open_table(THREAD_VARS).map_err(Error::storage)?;
    txn.commit().map_err(Error::storage)?;
    Ok(())
}

/// Store view bound to one agent instance.
///
/// All mutating calls run under the agent's single-owner actor, so they are
/// serialized; the message cache is a hint and is dropped on every mutation.
pub struct ThreadStore {
    db: Arc<Database>,
    thread_id: String,
    cache: Mutex<Option<Vec<Message>>>,
}

impl ThreadStore {
    pub(crate) fn new(db: Arc<Database>, thread_id: String) -> Self {
        Self {
            db,
            thread_id,
            cache: Mutex::new(None),
        }
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    // -- messages ----------------------------------------------------------

    /// Atomically append messages in order, assigning strictly increasing seq.
    pub fn append_messages(&self, messages: Vec<Message>) -> Result<Vec<Message>> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        let mut assigned = messages;
        let txn = self.db.begin_write().map_err(Error::storage)?;
        {
            let mut counters = txn.open_table(COUNTERS).map_err(Error::storage)?;
            let mut table = txn.open_table(MESSAGES).map_err(Error::storage)?;
            let id = self.thread_id.as_str();
            let mut seq = counters
                .get((id, "messages"))
                .map_err(Error::storage)?
                .map(|g| g.value())
                .unwrap_or(0);
            for message in assigned.iter_mut() {
                seq += 1;
                message.seq = seq;
                let bytes = serde_json::to_vec(message)?;
                table
                    .insert((id, seq), bytes.as_slice())
                    .map_err(Error::storage)?;
            }
            counters
                .insert((id, "messages"), seq)
                .map_err(Error::storage)?;
        }
        txn.commit().map_err(Error::storage)?;
        *self.cache.lock() = None;
        Ok(assigned)
    }

    /// Read every stored message in seq order. Serves from the cache when warm.
    pub fn list_messages(&self) -> Result<Vec<Message>> {
        if let Some(cached) = self.cache.lock().as_ref() {
            return Ok(cached.clone());
        }
        let txn = self.db.begin_read().map_err(Error::storage)?;
        let table = txn.open_table(MESSAGES).map_err(Error::storage)?;
        let id = self.thread_id.as_str();
        let mut out = Vec::new();
        for item in table
            .range((id, 0u64)..=(id, u64::MAX))
            .map_err(Error::storage)?
        {
            let (_, value) = item.map_err(Error::storage)?;
            out.push(serde_json::from_slice(value.value())?);
        }
        *self.cache.lock() = Some(out.clone());
        Ok(out)
    }

    /// Most recent assistant message, if any.
    pub fn last_assistant(&self) -> Result<Option<Message>> {
        Ok(self
            .list_messages()?
            .into_iter()
            .rev()
            .find(|m| m.role == Role::Assistant))
    }

    /// Shorthand for appending one `tool` message.
    pub fn append_tool_result(
        &self,
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<Message> {
        let appended = self.append_messages(vec![Message::tool_result(tool_call_id, content)])?;
        Ok(appended.into_iter().next().expect("one message appended"))
    }

    // -- events ------------------------------------------------------------

    /// Append one event, returning its assigned seq.
    pub fn add_event(&self, mut event: Event) -> Result<u64> {
        let txn = self.db.begin_write().map_err(Error::storage)?;
        let seq = {
            let mut counters = txn.open_table(COUNTERS).map_err(Error::storage)?;
            let mut table = txn.open_table(EVENTS).map_err(Error::storage)?;
            let id = self.thread_id.as_str();
            let seq = counters
                .get((id, "events"))
                .map_err(Error::storage)?
                .map(|g| g.value())
                .unwrap_or(0)
                + 1;
            event.seq = seq;
            let bytes = serde_json::to_vec(&event)?;
            table
                .insert((id, seq), bytes.as_slice())
                .map_err(Error::storage)?;
            counters.insert((id, "events"), seq).map_err(Error::storage)?;
            seq
        };
        txn.commit().map_err(Error::storage)?;
        Ok(seq)
    }

    pub fn list_events(&self) -> Result<Vec<Event>> {
        let txn = self.db.begin_read().map_err(Error::storage)?;
        let table = txn.open_table(EVENTS).map_err(Error::storage)?;
        let id = self.thread_id.as_str();
        let mut out = Vec::new();
        for item in table
            .range((id, 0u64)..=(id, u64::MAX))
            .map_err(Error::storage)?
        {
            let (_, value) = item.map_err(Error::storage)?;
            out.push(serde_json::from_slice(value.value())?);
        }
        Ok(out)
    }

    // -- subagent links ----------------------------------------------------

    pub fn record_spawn(&self, link: &SubagentLink) -> Result<()> {
        let txn = self.db.begin_write().map_err(Error::storage)?;
        {
            let mut table = txn.open_table(LINKS).map_err(Error::storage)?;
            let bytes = serde_json::to_vec(link)?;
            table
                .insert(
                    (self.thread_id.as_str(), link.child_thread_id.as_str()),
                    bytes.as_slice(),
                )
                .map_err(Error::storage)?;
        }
        txn.commit().map_err(Error::storage)?;
        Ok(())
    }

    pub fn mark_link_completed(&self, child_id: &str, report: Option<String>) -> Result<()> {
        self.update_link(child_id, |link| {
            link.status = LinkStatus::Completed;
            link.completed_at = Some(now_ms());
            link.report = report.clone();
        })
    }

    pub fn mark_link_canceled(&self, child_id: &str) -> Result<()> {
        self.update_link(child_id, |link| {
            link.status = LinkStatus::Canceled;
            link.completed_at = Some(now_ms());
        })
    }

    fn update_link(&self, child_id: &str, apply: impl Fn(&mut SubagentLink)) -> Result<()> {
        let txn = self.db.begin_write().map_err(Error::storage)?;
        {
            let mut table = txn.open_table(LINKS).map_err(Error::storage)?;
            let key = (self.thread_id.as_str(), child_id);
            let existing = table
                .get(key)
                .map_err(Error::storage)?
                .map(|g| g.value().to_vec());
            let Some(bytes) = existing else {
                return Err(Error::not_found(format!("subagent link {child_id}")));
            };
            let mut link: SubagentLink = serde_json::from_slice(&bytes)?;
            apply(&mut link);
            let bytes = serde_json::to_vec(&link)?;
            table.insert(key, bytes.as_slice()).map_err(Error::storage)?;
        }
        txn.commit().map_err(Error::storage)?;
        Ok(())
    }

    pub fn list_links(&self) -> Result<Vec<SubagentLink>> {
        let txn = self.db.begin_read().map_err(Error::storage)?;
        let table = txn.open_table(LINKS).map_err(Error::storage)?;
        let id = self.thread_id.as_str();
        let mut out = Vec::new();
        for item in table.range((id, "")..=(id, "\u{10ffff}")).map_err(Error::storage)? {
            let (_, value) = item.map_err(Error::storage)?;
            out.push(serde_json::from_slice(value.value())?);
        }
        Ok(out)
    }

    // -- waiting-subagent index --------------------------------------------

    /// Append a wait slot. Read-modify-write inside one transaction: tools
    /// in the same batch may push concurrently.
    pub fn push_wait(&self, entry: WaitEntry) -> Result<()> {
        let txn = self.db.begin_write().map_err(Error::storage)?;
        {
            let mut table = txn.open_table(WAITS).map_err(Error::storage)?;
            let id = self.thread_id.as_str();
            let mut waits: Vec<WaitEntry> = match table.get(id).map_err(Error::storage)? {
                Some(value) => serde_json::from_slice(value.value())?,
                None => Vec::new(),
            };
            waits.push(entry);
            let bytes = serde_json::to_vec(&waits)?;
            table.insert(id, bytes.as_slice()).map_err(Error::storage)?;
        }
        txn.commit().map_err(Error::storage)?;
        Ok(())
    }

    /// Atomically remove the wait slot matching `(token, child_id)`; returns
    /// its tool_call_id, or None when the token is unknown.
    pub fn pop_wait(&self, token: &str, child_id: &str) -> Result<Option<String>> {
        let txn = self.db.begin_write().map_err(Error::storage)?;
        let popped = {
            let mut table = txn.open_table(WAITS).map_err(Error::storage)?;
            let id = self.thread_id.as_str();
            let mut waits: Vec<WaitEntry> = match table.get(id).map_err(Error::storage)? {
                Some(value) => serde_json::from_slice(value.value())?,
                None => Vec::new(),
            };
            let position = waits
                .iter()
                .position(|w| w.token == token && w.child_thread_id == child_id);
            match position {
                Some(position) => {
                    let entry = waits.remove(position);
                    let bytes = serde_json::to_vec(&waits)?;
                    table.insert(id, bytes.as_slice()).map_err(Error::storage)?;
                    Some(entry.tool_call_id)
                }
                None => None,
            }
        };
        txn.commit().map_err(Error::storage)?;
        Ok(popped)
    }

    pub fn list_waits(&self) -> Result<Vec<WaitEntry>> {
        let txn = self.db.begin_read().map_err(Error::storage)?;
        let table = txn.open_table(WAITS).map_err(Error::storage)?;
        match table.get(self.thread_id.as_str()).map_err(Error::storage)? {
            Some(value) => Ok(serde_json::from_slice(value.value())?),
            None => Ok(Vec::new()),
        }
    }

    pub fn clear_waits(&self) -> Result<()> {
        self.put_waits(&[])
    }

    fn put_waits(&self, waits: &[WaitEntry]) -> Result<()> {
        let txn = self.db.begin_write().map_err(Error::storage)?;
        {
            let mut table = txn.open_table(WAITS).map_err(Error::storage)?;
            let bytes = serde_json::to_vec(waits)?;
            table
                .insert(self.thread_id.as_str(), bytes.as_slice())
                .map_err(Error::storage)?;
        }
        txn.commit().map_err(Error::storage)?;
        Ok(())
    }

    // -- run state / metadata / pending queue ------------------------------

    pub fn run_state(&self) -> Result<RunState> {
        let txn = self.db.begin_read().map_err(Error::storage)?;
        let table = txn.open_table(RUN_STATE).map_err(Error::storage)?;
        match table.get(self.thread_id.as_str()).map_err(Error::storage)? {
            Some(value) => Ok(serde_json::from_slice(value.value())?),
            None => Ok(RunState::default()),
        }
    }

    pub fn put_run_state(&self, state: &RunState) -> Result<()> {
        self.put_row(RUN_STATE, state)
    }

    pub fn metadata(&self) -> Result<Option<ThreadMetadata>> {
        let txn = self.db.begin_read().map_err(Error::storage)?;
        let table = txn.open_table(THREAD_META).map_err(Error::storage)?;
        match table.get(self.thread_id.as_str()).map_err(Error::storage)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    pub fn put_metadata(&self, metadata: &ThreadMetadata) -> Result<()> {
        self.put_row(THREAD_META, metadata)
    }

    pub fn pending_tool_calls(&self) -> Result<Vec<ToolCall>> {
        let txn = self.db.begin_read().map_err(Error::storage)?;
        let table = txn.open_table(PENDING).map_err(Error::storage)?;
        match table.get(self.thread_id.as_str()).map_err(Error::storage)? {
            Some(value) => Ok(serde_json::from_slice(value.value())?),
            None => Ok(Vec::new()),
        }
    }

    pub fn put_pending_tool_calls(&self, calls: &[ToolCall]) -> Result<()> {
        self.put_row(PENDING, &calls)
    }

    fn put_row<T: serde::Serialize>(
        &self,
        table_def: TableDefinition<'static, &'static str, &'static [u8]>,
        value: &T,
    ) -> Result<()> {
        let txn = self.db.begin_write().map_err(Error::storage)?;
        {
            let mut table = txn.open_table(table_def).map_err(Error::storage)?;
            let bytes = serde_json::to_vec(value)?;
            table
                .insert(self.thread_id.as_str(), bytes.as_slice())
                .map_err(Error::storage)?;
        }
        txn.commit().map_err(Error::storage)?;
        Ok(())
    }

    // -- vars --------------------------------------------------------------

    pub fn var_get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let txn = self.db.begin_read().map_err(Error::storage)?;
        let table = txn.open_table(THREAD_VARS).map_err(Error::storage)?;
        match table
            .get((self.thread_id.as_str(), key))
            .map_err(Error::storage)?
        {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    pub fn var_set(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let txn = self.db.begin_write().map_err(Error::storage)?;
        {
            let mut table = txn.open_table(THREAD_VARS).map_err(Error::storage)?;
            let bytes = serde_json::to_vec(value)?;
            table
                .insert((self.thread_id.as_str(), key), bytes.as_slice())
                .map_err(Error::storage)?;
        }
        txn.commit().map_err(Error::storage)?;
        Ok(())
    }

    pub fn vars_all(&self) -> Result<BTreeMap<String, serde_json::Value>> {
        let txn = self.db.begin_read().map_err(Error::storage)?;
        let table = txn.open_table(THREAD_VARS).map_err(Error::storage)?;
        let id = self.thread_id.as_str();
        let mut out = BTreeMap::new();
        for item in table.range((id, "")..=(id, "\u{10ffff}")).map_err(Error::storage)? {
            let (key, value) = item.map_err(Error::storage)?;
            out.insert(key.value().1.to_string(), serde_json::from_slice(value.value())?);
        }
        Ok(out)
    }

    // -- lifecycle ---------------------------------------------------------

    /// Delete every row owned by this thread. Used by agency cascade delete.
    pub fn purge(&self) -> Result<()> {
        let txn = self.db.begin_write().map_err(Error::storage)?;
        {
            let id = self.thread_id.as_str();
            let mut messages = txn.open_table(MESSAGES).map_err(Error::storage)?;
            remove_seq_range(&mut messages, id)?;
            let mut events = txn.open_table(EVENTS).map_err(Error::storage)?;
            remove_seq_range(&mut events, id)?;
            let mut links = txn.open_table(LINKS).map_err(Error::storage)?;
            remove_str_range(&mut links, id)?;
            let mut vars = txn.open_table(THREAD_VARS).map_err(Error::storage)?;
            remove_str_range(&mut vars, id)?;
            let mut counters = txn.open_table(COUNTERS).map_err(Error::storage)?;
            counters.remove((id, "messages")).map_err(Error::storage)?;
            counters.remove((id, "events")).map_err(Error::storage)?;
            for def in [WAITS, RUN_STATE, THREAD_META, PENDING] {
                let mut table = txn.open_table(def).map_err(Error::storage)?;
                table.remove(id).map_err(Error::storage)?;
            }
        }
        txn.commit().map_err(Error::storage)?;
        *self.cache.lock() = None;
        Ok(())
    }
}

fn remove_seq_range(
    table: &mut redb::Table<'_, (&'static str, u64), &'static [u8]>,
    id: &str,
) -> Result<()> {
    let seqs: Vec<u64> = table
        .range((id, 0u64)..=(id, u64::MAX))
        .map_err(Error::storage)?
        .map(|item| item.map(|(k, _)| k.value().1))
        .collect::<std::result::Result<_, _>>()
        .map_err(Error::storage)?;
    for seq in seqs {
        table.remove((id, seq)).map_err(Error::storage)?;
    }
    Ok(())
}

fn remove_str_range(
    table: &mut redb::Table<'_, (&'static str, &'static str), &'static [u8]>,
    id: &str,
) -> Result<()> {
    let keys: Vec<String> = table
        .range((id, "")..=(id, "\u{10ffff}"))
        .map_err(Error::storage)?
        .map(|item| item.map(|(k, _)| k.value().1.to_string()))
        .collect::<std::result::Result<_, _>>()
        .map_err(Error::storage)?;
    for key in keys {
        table.remove((id, key.as_str())).map_err(Error::storage)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentry_core::EventKind;
    use tempfile::tempdir;

    fn store() -> (crate::Store, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = crate::Store::open(dir.path().join("test.redb")).unwrap();
        (store, dir)
    }

    #[test]
    fn append_assigns_monotonic_seq() {
        let (store, _dir) = store();
        let thread = store.thread("th-1");
        let first = thread
            .append_messages(vec![Message::user("a"), Message::assistant("b")])
            .unwrap();
        assert_eq!(first[0].seq, 1);
        assert_eq!(first[1].seq, 2);
        let second = thread.append_messages(vec![Message::user("c")]).unwrap();
        assert_eq!(second[0].seq, 3);

        let all = thread.list_messages().unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[test]
    fn threads_do_not_share_logs() {
        let (store, _dir) = store();
        store
            .thread("th-1")
            .append_messages(vec![Message::user("one")])
            .unwrap();
        store
            .thread("th-2")
            .append_messages(vec![Message::user("two")])
            .unwrap();
        assert_eq!(store.thread("th-1").list_messages().unwrap().len(), 1);
        assert_eq!(store.thread("th-2").list_messages().unwrap().len(), 1);
        assert_eq!(store.thread("th-2").list_messages().unwrap()[0].seq, 1);
    }

    #[test]
    fn last_assistant_skips_tool_rows() {
        let (store, _dir) = store();
        let thread = store.thread("th-1");
        thread
            .append_messages(vec![
                Message::user("q"),
                Message::assistant("a1"),
                Message::tool_result("t1", "out"),
            ])
            .unwrap();
        assert_eq!(thread.last_assistant().unwrap().unwrap().content, "a1");
    }

    #[test]
    fn cache_invalidated_on_append() {
        let (store, _dir) = store();
        let thread = store.thread("th-1");
        thread.append_messages(vec![Message::user("a")]).unwrap();
        assert_eq!(thread.list_messages().unwrap().len(), 1);
        thread.append_tool_result("t1", "5").unwrap();
        assert_eq!(thread.list_messages().unwrap().len(), 2);
    }

    #[test]
    fn event_seq_strictly_increasing() {
        let (store, _dir) = store();
        let thread = store.thread("th-1");
        let s1 = thread
            .add_event(Event::new("th-1", EventKind::RunStarted, serde_json::json!({})))
            .unwrap();
        let s2 = thread
            .add_event(Event::new("th-1", EventKind::RunTick, serde_json::json!({"step": 1})))
            .unwrap();
        assert!(s2 > s1);
        let events = thread.list_events().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::RunStarted);
    }

    #[test]
    fn wait_push_pop_roundtrip() {
        let (store, _dir) = store();
        let thread = store.thread("parent");
        thread
            .push_wait(WaitEntry {
                token: "tok-1".into(),
                child_thread_id: "child-1".into(),
                tool_call_id: "t1".into(),
            })
            .unwrap();
        // Unknown token leaves the index untouched.
        assert!(thread.pop_wait("nope", "child-1").unwrap().is_none());
        assert_eq!(thread.list_waits().unwrap().len(), 1);

        let call = thread.pop_wait("tok-1", "child-1").unwrap();
        assert_eq!(call.as_deref(), Some("t1"));
        assert!(thread.list_waits().unwrap().is_empty());
    }

    #[test]
    fn link_lifecycle() {
        let (store, _dir) = store();
        let thread = store.thread("parent");
        thread
            .record_spawn(&SubagentLink {
                child_thread_id: "child-1".into(),
                token: "tok-1".into(),
                status: LinkStatus::Waiting,
                created_at: now_ms(),
                completed_at: None,
                report: None,
                tool_call_id: Some("t1".into()),
            })
            .unwrap();
        thread
            .mark_link_completed("child-1", Some("done".into()))
            .unwrap();
        let links = thread.list_links().unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].status, LinkStatus::Completed);
        assert_eq!(links[0].report.as_deref(), Some("done"));
    }

    #[test]
    fn run_state_roundtrip() {
        let (store, _dir) = store();
        let thread = store.thread("th-1");
        assert_eq!(
            thread.run_state().unwrap().status,
            agentry_core::RunStatus::Registered
        );
        let mut state = RunState::default();
        state.status = agentry_core::RunStatus::Paused;
        state.reason = Some("hitl".into());
        state.step = 3;
        thread.put_run_state(&state).unwrap();
        let back = thread.run_state().unwrap();
        assert_eq!(back.status, agentry_core::RunStatus::Paused);
        assert_eq!(back.reason.as_deref(), Some("hitl"));
        assert_eq!(back.step, 3);
    }

    #[test]
    fn purge_removes_all_rows() {
        let (store, _dir) = store();
        let thread = store.thread("th-1");
        thread.append_messages(vec![Message::user("a")]).unwrap();
        thread
            .add_event(Event::new("th-1", EventKind::RunStarted, serde_json::json!({})))
            .unwrap();
        thread.var_set("k", &serde_json::json!("v")).unwrap();
        thread.purge().unwrap();
        assert!(thread.list_messages().unwrap().is_empty());
        assert!(thread.list_events().unwrap().is_empty());
        assert!(thread.var_get("k").unwrap().is_none());
        // Seq restarts after a purge; the thread id is gone for good.
        let assigned = thread.append_messages(vec![Message::user("b")]).unwrap();
        assert_eq!(assigned[0].seq, 1);
    }
}
