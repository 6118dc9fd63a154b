//! Consistency Coordinator.
//!
//! Establishes a single point-in-time view across every session used by
//! a dump, the way `FLUSH TABLES WITH READ LOCK` plus a barrier-gated
//! `START TRANSACTION WITH CONSISTENT SNAPSHOT` on each worker session
//! does in the server this crate talks to. Sessions that enter the
//! snapshot are marked [`crate::session::SessionGuard::mark_snapshot_bound`]
//! and never returned to the pool.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::sync::Barrier;

use crate::error::EngineError;
use crate::session::{Session, SessionGuard, SessionPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMethod {
    /// `FLUSH TABLES WITH READ LOCK`; blocks all writes instance-wide.
    FlushTablesWithReadLock,
    /// `LOCK TABLES ... READ` per table; used when the former is
    /// unavailable (no `RELOAD` privilege) and `consistency=lockTables`.
    LockTables,
    /// No locking at all; the caller accepts a non-atomic snapshot.
    None,
}

/// Binlog/GTID coordinates captured at the moment the lock is held,
/// recorded into the manifest for point-in-time documentation.
#[derive(Debug, Clone, Default)]
pub struct SnapshotPosition {
    pub binlog_file: Option<String>,
    pub binlog_position: Option<u64>,
    pub gtid_executed: Option<String>,
}

/// Coordinates bringing N worker sessions onto one consistent snapshot.
pub struct ConsistencyCoordinator {
    method: LockMethod,
}

impl ConsistencyCoordinator {
    pub fn new(method: LockMethod) -> Self {
        Self { method }
    }

    /// Acquires `worker_count` sessions from `pool`, establishes the
    /// instance-wide (or per-table) read lock on a dedicated locking
    /// session, starts a `REPEATABLE READ` consistent-snapshot
    /// transaction on every worker session while the lock is held, then
    /// releases the lock. The barrier guarantees no worker starts its
    /// transaction before every other worker is ready, and the lock is
    /// not released until every worker has started its transaction.
    ///
    /// Unless `skip_consistency_checks` is set, each worker's own
    /// `gtid_executed`/binlog position is captured right after it
    /// enters its consistent-snapshot transaction and compared against
    /// the position captured on the locking session; any divergence
    /// means the workers did not all land on the same point-in-time
    /// view and is fatal.
    pub async fn establish<'a>(
        &self,
        pool: &'a SessionPool,
        worker_count: usize,
        tables_for_lock: &[(String, String)],
        skip_consistency_checks: bool,
    ) -> Result<(Vec<SessionGuard<'a>>, SnapshotPosition)> {
        let mut guards = Vec::with_capacity(worker_count + 1);
        for _ in 0..worker_count + 1 {
            guards.push(pool.acquire().await);
        }
        let (lock_guard, worker_guards) = guards.split_first_mut().expect("at least one guard");

        match self.method {
            LockMethod::FlushTablesWithReadLock => {
                lock_guard
                    .session()
                    .execute("FLUSH TABLES WITH READ LOCK")
                    .await
                    .context("FLUSH TABLES WITH READ LOCK")?;
            }
            LockMethod::LockTables => {
                let clause = tables_for_lock
                    .iter()
                    .map(|(s, t)| format!("`{}`.`{}` READ", s, t))
                    .collect::<Vec<_>>()
                    .join(", ");
                if !clause.is_empty() {
                    lock_guard
                        .session()
                        .execute(&format!("LOCK TABLES {}", clause))
                        .await
                        .context("LOCK TABLES")?;
                }
            }
            LockMethod::None => {}
        }

        let position = Self::capture_position(lock_guard.session()).await?;

        let barrier = Arc::new(Barrier::new(worker_guards.len()));
        let worker_positions: Arc<Mutex<Vec<SnapshotPosition>>> =
            Arc::new(Mutex::new(Vec::with_capacity(worker_guards.len())));
        let mut starts = Vec::with_capacity(worker_guards.len());
        for guard in worker_guards.iter() {
            let session = guard.session().clone();
            let barrier = barrier.clone();
            let worker_positions = worker_positions.clone();
            starts.push(async move {
                session
                    .execute("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
                    .await?;
                session
                    .execute("START TRANSACTION WITH CONSISTENT SNAPSHOT")
                    .await?;
                if !skip_consistency_checks {
                    let position = Self::capture_position(&session).await?;
                    worker_positions
                        .lock()
                        .expect("worker position mutex poisoned")
                        .push(position);
                }
                barrier.wait().await;
                Ok::<(), anyhow::Error>(())
            });
        }
        futures::future::try_join_all(starts)
            .await
            .context("starting consistent-snapshot transactions")?;

        for guard in worker_guards.iter_mut() {
            guard.mark_snapshot_bound();
        }

        if !skip_consistency_checks {
            let worker_positions = worker_positions.lock().expect("worker position mutex poisoned");
            verify_worker_positions(&position, &worker_positions)?;
        }

        match self.method {
            LockMethod::FlushTablesWithReadLock => {
                lock_guard.session().execute("UNLOCK TABLES").await?;
            }
            LockMethod::LockTables => {
                lock_guard.session().execute("UNLOCK TABLES").await?;
            }
            LockMethod::None => {}
        }

        let mut workers = Vec::with_capacity(worker_guards.len());
        workers.extend(guards.drain(1..));
        Ok((workers, position))
    }

    async fn capture_position(session: &Arc<dyn Session>) -> Result<SnapshotPosition> {
        let mut pos = SnapshotPosition::default();
        if let Some(row) = session.query_row("SHOW MASTER STATUS").await? {
            pos.binlog_file = row
                .first()
                .and_then(|c| c.as_ref())
                .map(|b| String::from_utf8_lossy(b).into_owned());
            pos.binlog_position = row
                .get(1)
                .and_then(|c| c.as_ref())
                .and_then(|b| String::from_utf8_lossy(b).parse().ok());
        }
        if let Some(row) = session.query_row("SELECT @@GLOBAL.gtid_executed").await? {
            pos.gtid_executed = row
                .first()
                .and_then(|c| c.as_ref())
                .map(|b| String::from_utf8_lossy(b).into_owned());
        }
        Ok(pos)
    }
}

/// Fatal if any worker's `gtid_executed`/binlog position diverges from
/// the position captured on the locking session — it means the
/// workers did not all land on the same point-in-time snapshot.
fn verify_worker_positions(locked: &SnapshotPosition, workers: &[SnapshotPosition]) -> Result<()> {
    for worker in workers {
        if worker.gtid_executed.is_some()
            && locked.gtid_executed.is_some()
            && worker.gtid_executed != locked.gtid_executed
        {
            return Err(EngineError::Consistency(format!(
                "worker gtid_executed {:?} diverges from locked snapshot {:?}",
                worker.gtid_executed, locked.gtid_executed
            ))
            .into());
        }
        if worker.binlog_file.is_some()
            && (worker.binlog_file != locked.binlog_file || worker.binlog_position != locked.binlog_position)
        {
            return Err(EngineError::Consistency(format!(
                "worker binlog position {:?}:{:?} diverges from locked snapshot {:?}:{:?}",
                worker.binlog_file, worker.binlog_position, locked.binlog_file, locked.binlog_position
            ))
            .into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_methods_are_distinct() {
        assert_ne!(LockMethod::FlushTablesWithReadLock, LockMethod::LockTables);
        assert_ne!(LockMethod::LockTables, LockMethod::None);
    }

    #[test]
    fn matching_worker_positions_pass() {
        let locked = SnapshotPosition {
            binlog_file: Some("bin.000001".into()),
            binlog_position: Some(100),
            gtid_executed: Some("uuid:1-5".into()),
        };
        let workers = vec![locked.clone(), locked.clone()];
        assert!(verify_worker_positions(&locked, &workers).is_ok());
    }

    #[test]
    fn diverging_gtid_is_fatal() {
        let locked = SnapshotPosition {
            binlog_file: Some("bin.000001".into()),
            binlog_position: Some(100),
            gtid_executed: Some("uuid:1-5".into()),
        };
        let workers = vec![SnapshotPosition {
            gtid_executed: Some("uuid:1-6".into()),
            ..locked.clone()
        }];
        let err = verify_worker_positions(&locked, &workers).unwrap_err();
        assert!(err.to_string().contains("diverges"));
    }

    #[test]
    fn diverging_binlog_position_is_fatal() {
        let locked = SnapshotPosition {
            binlog_file: Some("bin.000001".into()),
            binlog_position: Some(100),
            gtid_executed: None,
        };
        let workers = vec![SnapshotPosition {
            binlog_position: Some(200),
            ..locked.clone()
        }];
        assert!(verify_worker_positions(&locked, &workers).is_err());
    }
}
