//! Load Scheduler.
//!
//! Mirrors the Dump Scheduler's worker-pool shape but over the inverse
//! direction: DDL must apply in dependency order before any chunk of a
//! table loads, and a still-running dump can be polled for newly
//! appeared chunks (`waitDumpTimeout`).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use futures::stream::{self, StreamExt, TryStreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::time::sleep;

use crate::ddl_rewrite::DdlKind;
use crate::metadata::SchemaObject;
use crate::rate_limit::RateLimiter;
use crate::session::Session;

/// What to do when applying a grant or `CREATE USER` statement fails
/// while loading accounts (`handleGrantErrors`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantErrorPolicy {
    Abort,
    /// Issues `DROP USER IF EXISTS` for the account the failing
    /// statement targeted, so a half-created account isn't left
    /// behind with whichever grants did apply before the failure.
    DropAccount,
    Ignore,
}

static STATEMENT_ACCOUNT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"('(?:[^']|'')*'|`[^`]*`)@('(?:[^']|'')*'|`[^`]*`|%)").unwrap());

/// Pulls the `'user'@'host'` (or backtick-quoted) account a `CREATE
/// USER`/`GRANT` statement targets, for use with `DROP USER`.
pub fn statement_account(statement: &str) -> Option<String> {
    let caps = STATEMENT_ACCOUNT.captures(statement)?;
    Some(format!("{}@{}", &caps[1], &caps[2]))
}

/// One DDL object plus the dependency edges the Load Scheduler needs to
/// topologically order `CREATE` statements (views before the routines
/// that reference them, tables before foreign keys that point at them).
#[derive(Debug, Clone)]
pub struct DdlNode {
    pub object: SchemaObject,
    pub kind: DdlKind,
}

/// Kahn's algorithm topological sort over `depends_on` edges. Returns
/// an error naming the cycle's first member if the graph isn't a DAG,
/// since a cyclic DDL dependency can only mean corrupt or hand-edited
/// dump metadata.
pub fn topological_ddl_order(nodes: Vec<DdlNode>) -> Result<Vec<DdlNode>> {
    let mut by_name: HashMap<String, usize> = HashMap::new();
    for (i, n) in nodes.iter().enumerate() {
        by_name.insert(n.object.qualified_name(), i);
    }

    let mut in_degree = vec![0usize; nodes.len()];
    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, n) in nodes.iter().enumerate() {
        for dep in &n.object.depends_on {
            if let Some(&dep_idx) = by_name.get(dep) {
                edges[dep_idx].push(i);
                in_degree[i] += 1;
            }
        }
    }

    let mut queue: VecDeque<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(i) = queue.pop_front() {
        order.push(i);
        for &next in &edges[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if order.len() != nodes.len() {
        let stuck = (0..nodes.len()).find(|&i| in_degree[i] > 0).unwrap();
        bail!(
            "DDL dependency cycle detected at {}",
            nodes[stuck].object.qualified_name()
        );
    }

    let mut slots: Vec<Option<DdlNode>> = nodes.into_iter().map(Some).collect();
    let mut out = Vec::with_capacity(slots.len());
    for idx in order {
        out.push(slots[idx].take().expect("each index appears once in a topo order"));
    }
    Ok(out)
}

/// A table chunk queued for loading. Index-deferred tables apply their
/// secondary indexes only after every chunk of that table has loaded
/// (`deferTableIndexes`).
#[derive(Debug, Clone)]
pub struct LoadChunkRef {
    pub schema: String,
    pub table: String,
    pub chunk_index: u64,
    pub path: String,
}

struct TableLoadState {
    ddl_applied: bool,
    chunks_total: Option<usize>,
    chunks_loaded: usize,
    indexes_applied: bool,
    deferred_indexes_ddl: Vec<String>,
}

pub struct LoadScheduler {
    tables: Mutex<HashMap<String, TableLoadState>>,
    ready_chunks: Mutex<VecDeque<LoadChunkRef>>,
    cancelled: AtomicBool,
    bytes_loaded: AtomicU64,
    rows_loaded: AtomicU64,
    defer_table_indexes: bool,
}

impl LoadScheduler {
    pub fn new(tables: &[(String, String)], defer_table_indexes: bool) -> Self {
        let mut map = HashMap::new();
        for (schema, table) in tables {
            map.insert(
                format!("{}.{}", schema, table),
                TableLoadState {
                    ddl_applied: false,
                    chunks_total: None,
                    chunks_loaded: 0,
                    indexes_applied: false,
                    deferred_indexes_ddl: Vec::new(),
                },
            );
        }
        Self {
            tables: Mutex::new(map),
            ready_chunks: Mutex::new(VecDeque::new()),
            cancelled: AtomicBool::new(false),
            bytes_loaded: AtomicU64::new(0),
            rows_loaded: AtomicU64::new(0),
            defer_table_indexes,
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn bytes_loaded(&self) -> u64 {
        self.bytes_loaded.load(Ordering::SeqCst)
    }

    pub fn rows_loaded(&self) -> u64 {
        self.rows_loaded.load(Ordering::SeqCst)
    }

    pub fn mark_ddl_applied(&self, schema: &str, table: &str) {
        let mut tables = self.tables.lock().expect("load scheduler mutex poisoned");
        if let Some(state) = tables.get_mut(&format!("{}.{}", schema, table)) {
            state.ddl_applied = true;
        }
    }

    pub fn set_expected_chunk_count(&self, schema: &str, table: &str, count: usize) {
        let mut tables = self.tables.lock().expect("load scheduler mutex poisoned");
        if let Some(state) = tables.get_mut(&format!("{}.{}", schema, table)) {
            state.chunks_total = Some(count);
        }
    }

    pub fn push_ready_chunk(&self, chunk: LoadChunkRef) {
        self.ready_chunks
            .lock()
            .expect("load scheduler mutex poisoned")
            .push_back(chunk);
    }

    fn pop_ready_chunk(&self) -> Option<LoadChunkRef> {
        self.ready_chunks
            .lock()
            .expect("load scheduler mutex poisoned")
            .pop_front()
    }

    /// Queues the DDL that creates a deferred table's secondary indexes,
    /// to be applied once [`Self::note_chunk_loaded`] observes the last
    /// expected chunk for that table.
    pub fn queue_deferred_index_ddl(&self, schema: &str, table: &str, ddl: String) {
        if !self.defer_table_indexes {
            return;
        }
        let mut tables = self.tables.lock().expect("load scheduler mutex poisoned");
        if let Some(state) = tables.get_mut(&format!("{}.{}", schema, table)) {
            state.deferred_indexes_ddl.push(ddl);
        }
    }

    /// Returns deferred index DDL ready to apply, or `None` if the
    /// table isn't complete yet or has no deferred work.
    pub fn note_chunk_loaded(&self, schema: &str, table: &str) -> Option<Vec<String>> {
        let mut tables = self.tables.lock().expect("load scheduler mutex poisoned");
        let state = tables.get_mut(&format!("{}.{}", schema, table))?;
        state.chunks_loaded += 1;
        if state.indexes_applied {
            return None;
        }
        if Some(state.chunks_loaded) == state.chunks_total && !state.deferred_indexes_ddl.is_empty() {
            state.indexes_applied = true;
            return Some(std::mem::take(&mut state.deferred_indexes_ddl));
        }
        None
    }

    /// Polls for ready chunks, waiting up to `wait_dump_timeout` between
    /// polls when a concurrent dump hasn't produced the next chunk yet
    /// (`waitDumpTimeout`: `0` means never wait, poll once and stop if
    /// nothing is ready).
    pub async fn run<F, Fut>(
        &self,
        threads: usize,
        wait_dump_timeout: Duration,
        dump_still_running: impl Fn() -> bool,
        load_chunk: F,
    ) -> Result<()>
    where
        F: Fn(LoadChunkRef) -> Fut + Send + Sync,
        Fut: std::future::Future<Output = Result<(u64, u64)>> + Send,
    {
        loop {
            if self.is_cancelled() {
                break;
            }

            let mut batch = Vec::new();
            while batch.len() < threads {
                match self.pop_ready_chunk() {
                    Some(c) => batch.push(c),
                    None => break,
                }
            }

            if batch.is_empty() {
                if !dump_still_running() {
                    break;
                }
                if wait_dump_timeout.is_zero() {
                    break;
                }
                sleep(wait_dump_timeout.min(Duration::from_secs(1))).await;
                continue;
            }

            let load_chunk = &load_chunk;
            stream::iter(batch.into_iter().map(|chunk| async move {
                let result = load_chunk(chunk).await?;
                self.bytes_loaded.fetch_add(result.0, Ordering::SeqCst);
                self.rows_loaded.fetch_add(result.1, Ordering::SeqCst);
                Ok::<(), anyhow::Error>(())
            }))
            .buffer_unordered(threads)
            .try_for_each(|_| futures::future::ok(()))
            .await?;
        }
        Ok(())
    }
}

/// Splits a chunk's row stream into sub-chunks of at most
/// `max_bytes_per_transaction` bytes, one `LOAD DATA LOCAL INFILE` per
/// sub-chunk, so a single oversized chunk file doesn't become one
/// unbounded transaction.
pub fn split_for_transactions(row_byte_sizes: &[usize], max_bytes_per_transaction: u64) -> Vec<(usize, usize)> {
    if max_bytes_per_transaction == 0 || row_byte_sizes.is_empty() {
        return vec![(0, row_byte_sizes.len())];
    }
    let mut ranges = Vec::new();
    let mut start = 0;
    let mut acc = 0u64;
    for (i, &size) in row_byte_sizes.iter().enumerate() {
        if acc > 0 && acc + size as u64 > max_bytes_per_transaction {
            ranges.push((start, i));
            start = i;
            acc = 0;
        }
        acc += size as u64;
    }
    ranges.push((start, row_byte_sizes.len()));
    ranges
}

/// Grant-error handling decision point used by the account-loading
/// phase. `statement` is the failing `CREATE USER`/`GRANT` text, used
/// under `DropAccount` to find the account to drop.
pub async fn handle_grant_error(
    policy: GrantErrorPolicy,
    session: &Arc<dyn Session>,
    statement: &str,
    message: &str,
) -> Result<()> {
    match policy {
        GrantErrorPolicy::Abort => bail!("grant error for statement {:?}: {}", statement, message),
        GrantErrorPolicy::DropAccount => {
            match statement_account(statement) {
                Some(account) => {
                    log::warn!("dropping account {} after grant error: {}", account, message);
                    session
                        .execute(&format!("DROP USER IF EXISTS {}", account))
                        .await?;
                }
                None => {
                    log::warn!(
                        "grant error for statement {:?} but no account could be identified to drop: {}",
                        statement,
                        message
                    );
                }
            }
            Ok(())
        }
        GrantErrorPolicy::Ignore => {
            log::warn!("ignoring grant error for statement {:?}: {}", statement, message);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ObjectKind;

    fn node(name: &str, deps: &[&str]) -> DdlNode {
        DdlNode {
            object: SchemaObject {
                schema: "s".into(),
                name: name.into(),
                kind: ObjectKind::Table,
                ddl: String::new(),
                depends_on: deps.iter().map(|d| format!("s.{}", d)).collect(),
            },
            kind: DdlKind::CreateTable,
        }
    }

    #[test]
    fn topological_order_respects_dependencies() {
        let nodes = vec![node("child", &["parent"]), node("parent", &[])];
        let ordered = topological_ddl_order(nodes).unwrap();
        assert_eq!(ordered[0].object.name, "parent");
        assert_eq!(ordered[1].object.name, "child");
    }

    #[test]
    fn cycle_is_rejected() {
        let nodes = vec![node("a", &["b"]), node("b", &["a"])];
        assert!(topological_ddl_order(nodes).is_err());
    }

    #[test]
    fn split_for_transactions_respects_byte_budget() {
        let sizes = vec![100usize; 25];
        let ranges = split_for_transactions(&sizes, 1000);
        assert!(ranges.len() > 1);
        for (start, end) in &ranges {
            let bytes: usize = sizes[*start..*end].iter().sum();
            assert!(bytes <= 1000 + 100);
        }
    }

    #[test]
    fn zero_budget_means_single_transaction() {
        let sizes = vec![100usize; 25];
        let ranges = split_for_transactions(&sizes, 0);
        assert_eq!(ranges, vec![(0, 25)]);
    }

    struct RecordingSession {
        executed: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl Session for RecordingSession {
        async fn execute(&self, statement: &str) -> Result<()> {
            self.executed.lock().unwrap().push(statement.to_string());
            Ok(())
        }

        async fn query_stream(
            &self,
            _statement: &str,
            _sink: &mut (dyn FnMut(crate::session::Row) -> Result<bool> + Send),
        ) -> Result<()> {
            Ok(())
        }

        async fn query_row(&self, _statement: &str) -> Result<Option<crate::session::Row>> {
            Ok(None)
        }

        fn connection_id(&self) -> u64 {
            1
        }
    }

    #[tokio::test]
    async fn grant_error_ignore_never_fails() {
        let session: Arc<dyn Session> = Arc::new(RecordingSession { executed: Mutex::new(Vec::new()) });
        assert!(handle_grant_error(GrantErrorPolicy::Ignore, &session, "GRANT SELECT ON *.* TO 'u'@'%'", "m")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn grant_error_abort_fails() {
        let session: Arc<dyn Session> = Arc::new(RecordingSession { executed: Mutex::new(Vec::new()) });
        assert!(handle_grant_error(GrantErrorPolicy::Abort, &session, "GRANT SELECT ON *.* TO 'u'@'%'", "m")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn grant_error_drop_account_issues_drop_user() {
        let session = Arc::new(RecordingSession { executed: Mutex::new(Vec::new()) });
        let session_dyn: Arc<dyn Session> = session.clone();
        handle_grant_error(
            GrantErrorPolicy::DropAccount,
            &session_dyn,
            "GRANT SELECT ON *.* TO 'app'@'%'",
            "m",
        )
        .await
        .unwrap();
        let executed = session.executed.lock().unwrap();
        assert_eq!(executed.len(), 1);
        assert!(executed[0].contains("DROP USER IF EXISTS 'app'@'%'"));
    }

    #[test]
    fn statement_account_extracts_user_and_host() {
        assert_eq!(
            statement_account("CREATE USER 'app'@'%' IDENTIFIED BY 'x'"),
            Some("'app'@'%'".to_string())
        );
    }

    #[test]
    fn deferred_indexes_apply_only_after_last_chunk() {
        let scheduler = LoadScheduler::new(&[("s".to_string(), "t".to_string())], true);
        scheduler.set_expected_chunk_count("s", "t", 2);
        scheduler.queue_deferred_index_ddl("s", "t", "CREATE INDEX ix ON s.t (c)".to_string());
        assert!(scheduler.note_chunk_loaded("s", "t").is_none());
        let ddl = scheduler.note_chunk_loaded("s", "t").unwrap();
        assert_eq!(ddl.len(), 1);
    }
}
