use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection, TransactionBehavior};
use tracing::debug;

use flowd_core::error::{FlowdError, Result};
use flowd_core::traits::FlowStore;
use flowd_core::types::*;

use crate::record::{self, db_err, query_bodies, sql_offset, ts, Record};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS flows (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        parent TEXT NOT NULL,
        status TEXT,
        created_at TEXT NOT NULL,
        body TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_flows_account ON flows(parent, created_at);

    CREATE TABLE IF NOT EXISTS runs (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        parent TEXT NOT NULL,
        status TEXT,
        created_at TEXT NOT NULL,
        body TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_runs_flow ON runs(parent, created_at);
    CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);

    CREATE TABLE IF NOT EXISTS nodes (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        parent TEXT NOT NULL,
        status TEXT,
        created_at TEXT NOT NULL,
        body TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_nodes_run ON nodes(parent, created_at);

    CREATE TABLE IF NOT EXISTS threads (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        parent TEXT NOT NULL,
        status TEXT,
        created_at TEXT NOT NULL,
        body TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_threads_run ON threads(parent, created_at);

    CREATE TABLE IF NOT EXISTS message_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        flow_id TEXT NOT NULL,
        run_id TEXT,
        node_id TEXT,
        segment TEXT NOT NULL,
        created_at TEXT NOT NULL,
        messages TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_message_log_flow ON message_log(flow_id, segment, created_at);

    CREATE TABLE IF NOT EXISTS llm_calls (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        account_id TEXT,
        corr_key TEXT NOT NULL,
        corr_value TEXT NOT NULL,
        created_at TEXT NOT NULL,
        body TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_llm_calls_corr ON llm_calls(corr_key, corr_value);
    CREATE INDEX IF NOT EXISTS idx_llm_calls_account ON llm_calls(account_id, created_at);
";

/// Visible flows: not archived and not generated by another flow.
const VISIBLE_FLOW: &str = "COALESCE(json_extract(body, '$.metadata.archived'), 0) = 0
    AND json_extract(body, '$.metadata.generatedFlowId') IS NULL";

/// SQLite-backed store for flows, runs, nodes, threads, message logs and LLM call records.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                FlowdError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;",
        )
        .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(db_err)
    }

    /// Read-modify-write one row inside an immediate transaction.
    ///
    /// If `apply` fails the transaction is dropped and nothing is written.
    fn update<T: Record>(&self, id: &str, apply: &mut dyn FnMut(&mut T) -> Result<()>) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let mut row: T =
            record::fetch(&tx, id)?.ok_or_else(|| FlowdError::not_found(T::ENTITY, id))?;
        apply(&mut row)?;
        row.touch(Utc::now());
        record::write(&tx, &row)?;
        tx.commit().map_err(db_err)?;
        Ok(row)
    }

    fn get<T: Record>(&self, id: &str) -> Result<Option<T>> {
        let conn = self.lock()?;
        record::fetch(&conn, id)
    }

    fn put<T: Record>(&self, row: &T) -> Result<()> {
        let conn = self.lock()?;
        record::insert(&*conn, row)
    }
}

impl FlowStore for SqliteStore {
    fn insert_flow(&self, flow: &Flow) -> Result<()> {
        self.put(flow)
    }

    fn get_flow(&self, id: &FlowId) -> Result<Option<Flow>> {
        self.get(id.as_str())
    }

    fn update_flow(
        &self,
        id: &FlowId,
        apply: &mut dyn FnMut(&mut Flow) -> Result<()>,
    ) -> Result<Flow> {
        self.update(id.as_str(), apply)
    }

    fn list_flows(&self, account_id: &str, window: Window, limit: usize) -> Result<Vec<Flow>> {
        let conn = self.lock()?;
        let (cmp, at) = match window {
            Window::Before(at) => ("<", at),
            Window::After(at) => (">", at),
        };
        let sql = format!(
            "SELECT body FROM flows
             WHERE parent = ?1 AND created_at {} ?2 AND {}
             ORDER BY status ASC, created_at DESC, seq DESC
             LIMIT ?3",
            cmp, VISIBLE_FLOW
        );
        query_bodies(
            &conn,
            &sql,
            params![account_id, ts(&at), clamp_limit(limit) as i64],
        )
    }

    fn list_schedulable_flows(&self) -> Result<Vec<Flow>> {
        let conn = self.lock()?;
        query_bodies(
            &conn,
            "SELECT body FROM flows
             WHERE status = 'active'
               AND COALESCE(json_extract(body, '$.metadata.archived'), 0) = 0
             ORDER BY seq ASC",
            [],
        )
    }

    fn create_triggered_run(&self, run: &Run, spend_trigger: Option<usize>) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let Some(mut flow) = record::fetch::<Flow>(&tx, run.flow_id.as_str())? else {
            return Ok(false);
        };
        if !flow.is_schedulable() {
            return Ok(false);
        }
        if let Some(index) = spend_trigger {
            if !flow.spent_triggers.insert(index) {
                return Ok(false);
            }
            flow.touch(Utc::now());
            record::write(&tx, &flow)?;
        }

        record::insert(&*tx, run)?;
        tx.commit().map_err(db_err)?;
        Ok(true)
    }

    fn insert_run(&self, run: &Run) -> Result<()> {
        self.put(run)
    }

    fn get_run(&self, id: &RunId) -> Result<Option<Run>> {
        self.get(id.as_str())
    }

    fn update_run(&self, id: &RunId, apply: &mut dyn FnMut(&mut Run) -> Result<()>) -> Result<Run> {
        self.update(id.as_str(), apply)
    }

    fn first_active_run(&self, flow_id: &FlowId) -> Result<Option<Run>> {
        let conn = self.lock()?;
        let mut runs: Vec<Run> = query_bodies(
            &conn,
            "SELECT body FROM runs
             WHERE parent = ?1 AND status != 'completed'
             ORDER BY created_at ASC, seq ASC
             LIMIT 1",
            params![flow_id.as_str()],
        )?;
        Ok(runs.pop())
    }

    fn list_runs(&self, flow_id: &FlowId, page: PageRequest) -> Result<Page<Run>> {
        let conn = self.lock()?;
        let total: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM runs WHERE parent = ?1",
                params![flow_id.as_str()],
                |row| row.get(0),
            )
            .map_err(db_err)?;

        let dir = match page.sort() {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        let sql = format!(
            "SELECT body FROM runs WHERE parent = ?1
             ORDER BY created_at {dir}, seq {dir}
             LIMIT ?2 OFFSET ?3"
        );
        let items = query_bodies(
            &conn,
            &sql,
            params![flow_id.as_str(), page.page_size() as i64, sql_offset(&page)],
        )?;
        Ok(Page::new(items, total as usize, page))
    }

    fn list_run_results(&self, flow_id: &FlowId, window: Window, limit: usize) -> Result<Vec<Run>> {
        let conn = self.lock()?;
        let (cmp, dir, at) = match window {
            Window::Before(at) => ("<", "DESC", at),
            Window::After(at) => (">", "ASC", at),
        };
        let sql = format!(
            "SELECT body FROM runs
             WHERE parent = ?1 AND status IN ('completed', 'error') AND created_at {cmp} ?2
             ORDER BY created_at {dir}, seq {dir}
             LIMIT ?3"
        );
        query_bodies(
            &conn,
            &sql,
            params![flow_id.as_str(), ts(&at), clamp_limit(limit) as i64],
        )
    }

    fn list_runs_with_status(&self, statuses: &[Status]) -> Result<Vec<Run>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT body FROM runs WHERE status IN ({}) ORDER BY created_at ASC, seq ASC",
            placeholders
        );
        query_bodies(&conn, &sql, params_from_iter(statuses.iter().map(|s| s.as_str())))
    }

    fn insert_node(&self, node: &Node) -> Result<()> {
        self.put(node)
    }

    fn get_node(&self, id: &NodeId) -> Result<Option<Node>> {
        self.get(id.as_str())
    }

    fn update_node(
        &self,
        id: &NodeId,
        apply: &mut dyn FnMut(&mut Node) -> Result<()>,
    ) -> Result<Node> {
        self.update(id.as_str(), apply)
    }

    fn list_nodes(&self, run_id: &RunId, limit: usize) -> Result<Vec<Node>> {
        let conn = self.lock()?;
        query_bodies(
            &conn,
            "SELECT body FROM nodes WHERE parent = ?1 ORDER BY created_at ASC, seq ASC LIMIT ?2",
            params![run_id.as_str(), clamp_limit(limit) as i64],
        )
    }

    fn insert_thread(&self, thread: &Thread) -> Result<()> {
        self.put(thread)
    }

    fn list_threads(&self, run_id: &RunId, limit: usize) -> Result<Vec<Thread>> {
        let conn = self.lock()?;
        query_bodies(
            &conn,
            "SELECT body FROM threads WHERE parent = ?1 ORDER BY created_at ASC, seq ASC LIMIT ?2",
            params![run_id.as_str(), clamp_limit(limit) as i64],
        )
    }

    fn append_messages(
        &self,
        flow_id: &FlowId,
        run_id: Option<&RunId>,
        node_id: Option<&NodeId>,
        segment: Segment,
        messages: &[ChatMessage],
    ) -> Result<MessageLogEntry> {
        let conn = self.lock()?;
        let created_at = Utc::now();
        conn.execute(
            "INSERT INTO message_log (flow_id, run_id, node_id, segment, created_at, messages)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                flow_id.as_str(),
                run_id.map(|r| r.as_str()),
                node_id.map(|n| n.as_str()),
                segment.as_str(),
                ts(&created_at),
                serde_json::to_string(messages)?,
            ],
        )
        .map_err(db_err)?;

        Ok(MessageLogEntry {
            id: conn.last_insert_rowid(),
            flow_id: flow_id.clone(),
            run_id: run_id.cloned(),
            node_id: node_id.cloned(),
            segment,
            messages: messages.to_vec(),
            created_at,
        })
    }

    fn list_messages(
        &self,
        flow_id: &FlowId,
        segment: Segment,
        window: Window,
        limit: usize,
    ) -> Result<Vec<MessageLogEntry>> {
        let conn = self.lock()?;
        let (cmp, dir, at) = match window {
            Window::Before(at) => ("<", "DESC", at),
            Window::After(at) => (">", "ASC", at),
        };
        let sql = format!(
            "SELECT id, run_id, node_id, created_at, messages FROM message_log
             WHERE flow_id = ?1 AND segment = ?2 AND created_at {cmp} ?3
             ORDER BY created_at {dir}, id {dir}
             LIMIT ?4"
        );
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(
                params![flow_id.as_str(), segment.as_str(), ts(&at), clamp_limit(limit) as i64],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .map_err(db_err)?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, run_id, node_id, created_at, messages) = row.map_err(db_err)?;
            let created_at = chrono::DateTime::parse_from_rfc3339(&created_at)
                .map_err(db_err)?
                .with_timezone(&Utc);
            entries.push(MessageLogEntry {
                id,
                flow_id: flow_id.clone(),
                run_id: run_id.map(RunId),
                node_id: node_id.map(NodeId),
                segment,
                messages: serde_json::from_str(&messages)?,
                created_at,
            });
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use flowd_core::trigger::Trigger;
    use serde_json::json;

    fn at(minute: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 12, minute, 0).unwrap()
    }

    fn flow_at(account: &str, minute: u32) -> Flow {
        let mut flow = Flow::new(account, "user-1", "summarize my inbox", vec![]);
        flow.created_at = at(minute);
        flow
    }

    fn run_at(flow: &Flow, minute: u32, status: Status) -> Run {
        let mut run = Run::new(flow, None);
        run.created_at = at(minute);
        run.status = status;
        run
    }

    #[test]
    fn flow_insert_get_update() {
        let store = SqliteStore::in_memory().unwrap();
        let flow = Flow::new("acct", "user", "task", vec![Trigger::Crontab { expr: "0 3 * * 1".into() }]);
        store.insert_flow(&flow).unwrap();

        let loaded = store.get_flow(&flow.id).unwrap().unwrap();
        assert_eq!(loaded.triggers, flow.triggers);
        assert_eq!(loaded.status, FlowStatus::Active);

        let updated = store
            .update_flow(&flow.id, &mut |f| {
                f.previous_status = Some(f.status);
                f.status = FlowStatus::Inactive;
                Ok(())
            })
            .unwrap();
        assert_eq!(updated.status, FlowStatus::Inactive);
        assert!(updated.updated_at >= flow.updated_at);
        assert_eq!(
            store.get_flow(&flow.id).unwrap().unwrap().previous_status,
            Some(FlowStatus::Active)
        );
    }

    #[test]
    fn failed_update_writes_nothing() {
        let store = SqliteStore::in_memory().unwrap();
        let flow = Flow::new("acct", "user", "task", vec![]);
        store.insert_flow(&flow).unwrap();

        let err = store
            .update_flow(&flow.id, &mut |f| {
                f.status = FlowStatus::Error;
                Err(FlowdError::InvalidArgument("nope".into()))
            })
            .unwrap_err();
        assert!(matches!(err, FlowdError::InvalidArgument(_)));
        assert_eq!(store.get_flow(&flow.id).unwrap().unwrap().status, FlowStatus::Active);
    }

    #[test]
    fn update_missing_is_not_found() {
        let store = SqliteStore::in_memory().unwrap();
        let err = store
            .update_run(&RunId::from_string("missing"), &mut |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, FlowdError::NotFound { entity: "run", .. }));
    }

    #[test]
    fn list_flows_hides_archived_and_generated() {
        let store = SqliteStore::in_memory().unwrap();
        let visible = flow_at("acct", 1);
        let mut archived = flow_at("acct", 2);
        archived.metadata.archived = true;
        let mut generated = flow_at("acct", 3);
        generated.metadata.generated_flow_id = Some("parent".into());
        let other_account = flow_at("other", 4);
        for f in [&visible, &archived, &generated, &other_account] {
            store.insert_flow(f).unwrap();
        }

        let flows = store.list_flows("acct", Window::Before(at(59)), 50).unwrap();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].id, visible.id);
    }

    #[test]
    fn list_flows_orders_by_status_then_newest() {
        let store = SqliteStore::in_memory().unwrap();
        let old_active = flow_at("acct", 1);
        let mut inactive = flow_at("acct", 2);
        inactive.status = FlowStatus::Inactive;
        let new_active = flow_at("acct", 3);
        for f in [&old_active, &inactive, &new_active] {
            store.insert_flow(f).unwrap();
        }

        let ids: Vec<_> = store
            .list_flows("acct", Window::Before(at(59)), 50)
            .unwrap()
            .into_iter()
            .map(|f| f.id)
            .collect();
        assert_eq!(ids, vec![new_active.id.clone(), old_active.id.clone(), inactive.id.clone()]);

        let after = store.list_flows("acct", Window::After(at(2)), 50).unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].id, new_active.id);

        let limited = store.list_flows("acct", Window::Before(at(59)), 1).unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn triggered_run_rechecks_flow_status() {
        let store = SqliteStore::in_memory().unwrap();
        let flow = Flow::new("acct", "user", "task", vec![]);
        store.insert_flow(&flow).unwrap();

        let run = Run::new(&flow, None);
        assert!(store.create_triggered_run(&run, None).unwrap());

        store
            .update_flow(&flow.id, &mut |f| {
                f.status = FlowStatus::Inactive;
                Ok(())
            })
            .unwrap();
        let late = Run::new(&flow, None);
        assert!(!store.create_triggered_run(&late, None).unwrap());
        assert!(store.get_run(&late.id).unwrap().is_none());
    }

    #[test]
    fn triggered_run_skips_archived_and_missing_flows() {
        let store = SqliteStore::in_memory().unwrap();
        let mut flow = Flow::new("acct", "user", "task", vec![]);
        flow.metadata.archived = true;
        store.insert_flow(&flow).unwrap();
        assert!(!store.create_triggered_run(&Run::new(&flow, None), None).unwrap());

        let ghost = Flow::new("acct", "user", "task", vec![]);
        assert!(!store.create_triggered_run(&Run::new(&ghost, None), None).unwrap());
    }

    #[test]
    fn one_shot_trigger_is_spent_once() {
        let store = SqliteStore::in_memory().unwrap();
        let flow = Flow::new("acct", "user", "task", vec![]);
        store.insert_flow(&flow).unwrap();

        assert!(store.create_triggered_run(&Run::new(&flow, None), Some(0)).unwrap());
        assert!(!store.create_triggered_run(&Run::new(&flow, None), Some(0)).unwrap());
        let flow = store.get_flow(&flow.id).unwrap().unwrap();
        assert!(flow.spent_triggers.contains(&0));
        assert_eq!(store.list_runs(&flow.id, PageRequest::default()).unwrap().total_count, 1);
    }

    #[test]
    fn first_active_run_is_oldest_non_completed() {
        let store = SqliteStore::in_memory().unwrap();
        let flow = flow_at("acct", 0);
        store.insert_flow(&flow).unwrap();

        let done = run_at(&flow, 1, Status::Completed);
        let failed = run_at(&flow, 2, Status::Error);
        let running = run_at(&flow, 3, Status::Running);
        for r in [&running, &done, &failed] {
            store.insert_run(r).unwrap();
        }
        assert_eq!(store.first_active_run(&flow.id).unwrap().unwrap().id, failed.id);

        store
            .update_run(&failed.id, &mut |r| {
                r.status = Status::Completed;
                Ok(())
            })
            .unwrap();
        assert_eq!(store.first_active_run(&flow.id).unwrap().unwrap().id, running.id);
    }

    #[test]
    fn first_active_run_breaks_ties_by_insertion() {
        let store = SqliteStore::in_memory().unwrap();
        let flow = flow_at("acct", 0);
        store.insert_flow(&flow).unwrap();
        let first = run_at(&flow, 5, Status::Queued);
        let second = run_at(&flow, 5, Status::Queued);
        store.insert_run(&first).unwrap();
        store.insert_run(&second).unwrap();
        assert_eq!(store.first_active_run(&flow.id).unwrap().unwrap().id, first.id);
    }

    #[test]
    fn paged_runs() {
        let store = SqliteStore::in_memory().unwrap();
        let flow = flow_at("acct", 0);
        store.insert_flow(&flow).unwrap();
        let runs: Vec<Run> = (1..=5).map(|m| run_at(&flow, m, Status::Completed)).collect();
        for r in &runs {
            store.insert_run(r).unwrap();
        }

        let page = store.list_runs(&flow.id, PageRequest::new(1, 2)).unwrap();
        assert_eq!(page.total_count, 5);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.items[0].id, runs[4].id);

        let page = store
            .list_runs(&flow.id, PageRequest::new(3, 2).sorted(SortOrder::Asc))
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].id, runs[4].id);

        let page = store
            .list_runs(&flow.id, PageRequest::new(usize::MAX, 2))
            .unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.total_count, 5);
    }

    #[test]
    fn run_results_window() {
        let store = SqliteStore::in_memory().unwrap();
        let flow = flow_at("acct", 0);
        store.insert_flow(&flow).unwrap();
        let a = run_at(&flow, 1, Status::Completed);
        let b = run_at(&flow, 2, Status::Running);
        let c = run_at(&flow, 3, Status::Error);
        let d = run_at(&flow, 4, Status::Completed);
        for r in [&a, &b, &c, &d] {
            store.insert_run(r).unwrap();
        }

        let before: Vec<_> = store
            .list_run_results(&flow.id, Window::Before(at(4)), 10)
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(before, vec![c.id.clone(), a.id.clone()]);

        let after: Vec<_> = store
            .list_run_results(&flow.id, Window::After(at(1)), 10)
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(after, vec![c.id, d.id]);
    }

    #[test]
    fn runs_by_status() {
        let store = SqliteStore::in_memory().unwrap();
        let flow = flow_at("acct", 0);
        store.insert_flow(&flow).unwrap();
        store.insert_run(&run_at(&flow, 1, Status::Queued)).unwrap();
        store.insert_run(&run_at(&flow, 2, Status::Running)).unwrap();
        store.insert_run(&run_at(&flow, 3, Status::AskUserForInput)).unwrap();
        store.insert_run(&run_at(&flow, 4, Status::Completed)).unwrap();

        let live = store
            .list_runs_with_status(&[Status::Queued, Status::Running])
            .unwrap();
        assert_eq!(live.len(), 2);
        assert!(store.list_runs_with_status(&[]).unwrap().is_empty());
    }

    #[test]
    fn nodes_and_threads_in_creation_order() {
        let store = SqliteStore::in_memory().unwrap();
        let flow = flow_at("acct", 0);
        let run = run_at(&flow, 1, Status::Running);
        let mut first = Node::new(run.id.clone(), "plan", json!({}));
        first.created_at = at(2);
        let mut second = Node::new(run.id.clone(), "act", json!({"q": 1}));
        second.created_at = at(3);
        store.insert_node(&second).unwrap();
        store.insert_node(&first).unwrap();

        let names: Vec<_> = store
            .list_nodes(&run.id, 50)
            .unwrap()
            .into_iter()
            .map(|n| n.name)
            .collect();
        assert_eq!(names, vec!["plan", "act"]);

        let updated = store
            .update_node(&first.id, &mut |n| {
                n.status = Status::Completed;
                n.output = Some(json!("done"));
                Ok(())
            })
            .unwrap();
        assert_eq!(updated.status, Status::Completed);

        let mut thread = Thread::new(run.id.clone(), "main");
        thread.node_ids = vec![first.id.clone(), second.id.clone()];
        store.insert_thread(&thread).unwrap();
        let threads = store.list_threads(&run.id, 50).unwrap();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].node_ids.len(), 2);
    }

    #[test]
    fn message_log_segments_and_windows() {
        let store = SqliteStore::in_memory().unwrap();
        let flow = flow_at("acct", 0);
        let run = run_at(&flow, 1, Status::Running);

        let first = store
            .append_messages(&flow.id, Some(&run.id), None, Segment::User, &[ChatMessage::user("hi")])
            .unwrap();
        store
            .append_messages(&flow.id, None, None, Segment::Debug, &[ChatMessage::assistant("trace")])
            .unwrap();
        let second = store
            .append_messages(&flow.id, Some(&run.id), None, Segment::User, &[ChatMessage::user("again")])
            .unwrap();

        let later = Utc::now() + Duration::minutes(1);
        let user = store
            .list_messages(&flow.id, Segment::User, Window::Before(later), 50)
            .unwrap();
        assert_eq!(user.len(), 2);
        assert_eq!(user[0].id, second.id);
        assert_eq!(user[1].run_id.as_ref(), Some(&run.id));

        let debug = store
            .list_messages(&flow.id, Segment::Debug, Window::Before(later), 50)
            .unwrap();
        assert_eq!(debug.len(), 1);
        assert_eq!(debug[0].messages[0].content, "trace");

        let after = store
            .list_messages(
                &flow.id,
                Segment::User,
                Window::After(first.created_at - Duration::seconds(1)),
                1,
            )
            .unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].id, first.id);
    }

    #[test]
    fn open_persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("flowd.db");
        let flow = Flow::new("acct", "user", "task", vec![]);
        {
            let store = SqliteStore::open(&path).unwrap();
            store.insert_flow(&flow).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert!(store.get_flow(&flow.id).unwrap().is_some());
        assert_eq!(store.list_schedulable_flows().unwrap().len(), 1);
    }
}
