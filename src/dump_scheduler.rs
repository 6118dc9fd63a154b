//! Dump Scheduler.
//!
//! Drives a pool of worker sessions over a work-stealing queue of
//! chunks, largest-job-first, writing completed chunks through the
//! Dump Writer and recording each transition in the Progress Log.
//! Concurrency follows the same `try_buffer_unordered` shape a pulled
//! sync loop uses to bound in-flight chunk
//! transfers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use futures::stream::{self, StreamExt, TryStreamExt};

use crate::chunk::ChunkDescriptor;
use crate::rate_limit::RateLimiter;
use crate::session::SessionPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Queued,
    Running,
    Done,
    Retriable,
    Fatal,
}

struct WorkItem {
    chunk: ChunkDescriptor,
    state: ChunkState,
    attempts: u32,
}

/// Largest-predicted-byte-budget-first tie-break key: the chunk with
/// the largest estimated byte size runs first, with chunk index as a
/// deterministic tiebreak across chunks of equal predicted size.
fn ljf_key(item: &WorkItem) -> (u64, u64) {
    (item.chunk.predicted_bytes, item.chunk.index)
}

pub const MAX_ATTEMPTS: u32 = 5;

/// Shared queue plus bookkeeping the worker tasks poll against.
struct Queue {
    items: VecDeque<WorkItem>,
    in_flight: usize,
}

pub struct DumpScheduler {
    queue: Mutex<Queue>,
    cancelled: AtomicBool,
    bytes_written: AtomicU64,
    rows_written: AtomicU64,
}

/// Outcome of dumping one chunk, reported by the caller-supplied
/// `dump_chunk` closure.
pub struct ChunkResult {
    pub bytes: u64,
    pub rows: u64,
    pub retriable_failure: Option<String>,
}

impl DumpScheduler {
    pub fn new(chunks: Vec<ChunkDescriptor>) -> Self {
        let mut items: Vec<WorkItem> = chunks
            .into_iter()
            .map(|chunk| WorkItem {
                chunk,
                state: ChunkState::Queued,
                attempts: 0,
            })
            .collect();
        items.sort_by_key(|i| std::cmp::Reverse(ljf_key(i)));
        Self {
            queue: Mutex::new(Queue {
                items: items.into(),
                in_flight: 0,
            }),
            cancelled: AtomicBool::new(false),
            bytes_written: AtomicU64::new(0),
            rows_written: AtomicU64::new(0),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::SeqCst)
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written.load(Ordering::SeqCst)
    }

    fn next_queued(&self) -> Option<ChunkDescriptor> {
        let mut q = self.queue.lock().expect("scheduler queue mutex poisoned");
        let pos = q.items.iter().position(|i| i.state == ChunkState::Queued)?;
        q.items[pos].state = ChunkState::Running;
        q.items[pos].attempts += 1;
        q.in_flight += 1;
        Some(q.items[pos].chunk.clone())
    }

    fn mark_done(&self, index: u64, outcome: &Result<ChunkResult>) {
        let mut q = self.queue.lock().expect("scheduler queue mutex poisoned");
        q.in_flight -= 1;
        if let Some(item) = q.items.iter_mut().find(|i| i.chunk.index == index) {
            item.state = match outcome {
                Ok(result) if result.retriable_failure.is_none() => ChunkState::Done,
                Ok(_) if item.attempts < MAX_ATTEMPTS => {
                    ChunkState::Retriable
                }
                Ok(_) => ChunkState::Fatal,
                Err(_) if item.attempts < MAX_ATTEMPTS => ChunkState::Retriable,
                Err(_) => ChunkState::Fatal,
            };
            if item.state == ChunkState::Retriable {
                item.state = ChunkState::Queued;
            }
        }
    }

    fn pending_count(&self) -> usize {
        let q = self.queue.lock().expect("scheduler queue mutex poisoned");
        q.items
            .iter()
            .filter(|i| i.state == ChunkState::Queued || i.state == ChunkState::Running)
            .count()
    }

    fn fatal_chunks(&self) -> Vec<u64> {
        let q = self.queue.lock().expect("scheduler queue mutex poisoned");
        q.items
            .iter()
            .filter(|i| i.state == ChunkState::Fatal)
            .map(|i| i.chunk.index)
            .collect()
    }

    /// Runs the scheduler to completion (or until cancelled / a chunk
    /// goes fatal), calling `dump_chunk` for each chunk with a session
    /// borrowed from `pool`. `threads` bounds concurrent in-flight
    /// chunks exactly as `try_buffer_unordered` does for the pulled
    /// backup sync loop this is modeled on.
    pub async fn run<F, Fut>(
        &self,
        pool: &SessionPool,
        threads: usize,
        rate_limiter: &RateLimiter,
        dump_chunk: F,
    ) -> Result<()>
    where
        F: Fn(ChunkDescriptor, Arc<tokio::sync::Mutex<()>>) -> Fut + Send + Sync,
        Fut: std::future::Future<Output = Result<ChunkResult>> + Send,
    {
        let serialize_progress = Arc::new(tokio::sync::Mutex::new(()));

        loop {
            if self.is_cancelled() || self.pending_count() == 0 {
                break;
            }
            if !self.fatal_chunks().is_empty() {
                break;
            }

            let mut batch = Vec::new();
            while batch.len() < threads {
                match self.next_queued() {
                    Some(chunk) => batch.push(chunk),
                    None => break,
                }
            }
            if batch.is_empty() {
                // Nothing queued right now but chunks are still running
                // (e.g. retried and not yet re-polled); yield briefly.
                tokio::task::yield_now().await;
                continue;
            }

            let _ = pool.capacity();
            let progress = serialize_progress.clone();
            stream::iter(batch.into_iter().map(|chunk| {
                let progress = progress.clone();
                let dump_chunk = &dump_chunk;
                async move {
                    let index = chunk.index;
                    let outcome = dump_chunk(chunk, progress).await;
                    if let Ok(result) = &outcome {
                        self.bytes_written.fetch_add(result.bytes, Ordering::SeqCst);
                        self.rows_written.fetch_add(result.rows, Ordering::SeqCst);
                        rate_limiter.acquire(result.bytes).await;
                    }
                    self.mark_done(index, &outcome);
                    outcome
                }
            }))
            .buffer_unordered(threads)
            .try_for_each(|_| futures::future::ok(()))
            .await?;
        }

        if let Some(first_fatal) = self.fatal_chunks().first() {
            anyhow::bail!("chunk {} failed after {} attempts", first_fatal, MAX_ATTEMPTS);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(index: u64, predicted_bytes: u64) -> ChunkDescriptor {
        ChunkDescriptor {
            index,
            schema: "s".into(),
            table: "t".into(),
            partition: None,
            lower_bound: None,
            upper_bound: Some("x < 1".into()),
            order_by_columns: vec![],
            user_where: None,
            predicted_bytes,
        }
    }

    #[test]
    fn largest_predicted_byte_budget_sorts_first() {
        let scheduler = DumpScheduler::new(vec![chunk(0, 100), chunk(1, 900), chunk(2, 500)]);
        let q = scheduler.queue.lock().unwrap();
        assert_eq!(q.items[0].chunk.index, 1);
        assert_eq!(q.items[1].chunk.index, 2);
        assert_eq!(q.items[2].chunk.index, 0);
    }

    #[test]
    fn equal_byte_budget_breaks_tie_by_index() {
        let scheduler = DumpScheduler::new(vec![chunk(1, 500), chunk(0, 500)]);
        let q = scheduler.queue.lock().unwrap();
        assert_eq!(q.items[0].chunk.index, 1);
    }

    #[test]
    fn new_scheduler_has_all_chunks_queued() {
        let scheduler = DumpScheduler::new(vec![chunk(0, 100), chunk(1, 200)]);
        assert_eq!(scheduler.pending_count(), 2);
    }
}
