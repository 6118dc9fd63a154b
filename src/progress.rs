//! Progress Log.
//!
//! An append-only, length-prefixed sequence of JSON entries recording
//! every chunk/DDL state transition, so a crashed or interrupted dump
//! or load can resume by replaying the log instead of restarting from
//! scratch. Local and POSIX-like backends append in place; the HTTP
//! PAR backend has no append primitive, so writers there instead
//! buffer and overwrite the whole object on every flush.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::storage::StorageBackend;

pub const PROGRESS_LOG_NAME: &str = "@.progress.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ProgressEvent {
    ChunkStarted { table: String, chunk_index: u64 },
    ChunkDone { table: String, chunk_index: u64, bytes: u64, rows: u64 },
    ChunkFailed { table: String, chunk_index: u64, message: String, retriable: bool },
    DdlApplied { object: String },
    TableIndexesApplied { table: String },
    DumpComplete,
    LoadComplete,
}

/// Appends entries as `<u32 length><json bytes>`, so a reader can stop
/// at the first malformed/truncated record (a crash mid-write) instead
/// of failing the whole replay.
pub struct ProgressLog {
    backend: Arc<dyn StorageBackend>,
    append_in_place: bool,
    buffer: Mutex<Vec<u8>>,
}

impl ProgressLog {
    /// `append_in_place` is false for backends with no append
    /// primitive (HTTP PAR); those accumulate the whole log in memory
    /// and overwrite the remote object on each [`Self::flush`].
    pub fn new(backend: Arc<dyn StorageBackend>, append_in_place: bool) -> Self {
        Self {
            backend,
            append_in_place,
            buffer: Mutex::new(Vec::new()),
        }
    }

    pub async fn append(&self, event: &ProgressEvent) -> Result<()> {
        let encoded = encode_entry(event)?;
        let mut buffer = self.buffer.lock().await;
        buffer.extend_from_slice(&encoded);
        if self.append_in_place {
            self.flush_append(&encoded).await?;
        } else {
            self.flush_overwrite(&buffer).await?;
        }
        Ok(())
    }

    async fn flush_append(&self, new_bytes: &[u8]) -> Result<()> {
        // Only one writer appends at a time (the `buffer` mutex above
        // serializes callers); backends that support true append would
        // use it here. This engine's storage trait exposes only whole-
        // object writes, so appends are emulated by reading the current
        // object, concatenating, and rewriting it — acceptable because
        // the progress log is small relative to the data being moved.
        let mut existing = match self.backend.open_read(PROGRESS_LOG_NAME).await {
            Ok(mut reader) => {
                let mut buf = Vec::new();
                tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut buf).await?;
                buf
            }
            Err(_) => Vec::new(),
        };
        existing.extend_from_slice(new_bytes);
        self.write_whole(&existing).await
    }

    async fn flush_overwrite(&self, buffer: &[u8]) -> Result<()> {
        self.write_whole(buffer).await
    }

    async fn write_whole(&self, bytes: &[u8]) -> Result<()> {
        let mut stream = self.backend.open_write(PROGRESS_LOG_NAME).await?;
        stream.write_all(bytes).await?;
        stream.close().await
    }

    /// Replays every well-formed entry in the log, ignoring a truncated
    /// tail entry (a crash mid-append never corrupts earlier entries,
    /// since each is length-prefixed and checksummed independently).
    pub async fn replay(backend: &dyn StorageBackend) -> Result<Vec<ProgressEvent>> {
        let mut reader = match backend.open_read(PROGRESS_LOG_NAME).await {
            Ok(r) => r,
            Err(_) => return Ok(Vec::new()),
        };
        let mut bytes = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut bytes).await?;
        Ok(decode_entries(&bytes))
    }
}

fn encode_entry(event: &ProgressEvent) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(event).context("serializing progress event")?;
    let checksum = crc32fast::hash(&json);
    let mut out = Vec::with_capacity(json.len() + 8);
    out.extend_from_slice(&(json.len() as u32).to_le_bytes());
    out.extend_from_slice(&checksum.to_le_bytes());
    out.extend_from_slice(&json);
    Ok(out)
}

/// Decodes every complete `<len><crc><json>` record in `bytes`,
/// stopping silently at the first incomplete or checksum-mismatched
/// record rather than erroring the whole replay.
fn decode_entries(bytes: &[u8]) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    let mut offset = 0usize;
    while offset + 8 <= bytes.len() {
        let len = u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap()) as usize;
        let checksum = u32::from_le_bytes(bytes[offset + 4..offset + 8].try_into().unwrap());
        let body_start = offset + 8;
        let body_end = body_start + len;
        if body_end > bytes.len() {
            break;
        }
        let body = &bytes[body_start..body_end];
        if crc32fast::hash(body) != checksum {
            break;
        }
        match serde_json::from_slice::<ProgressEvent>(body) {
            Ok(event) => events.push(event),
            Err(_) => break,
        }
        offset = body_end;
    }
    events
}

/// Reduces a replayed log to the set of chunks still needing work and
/// the DDL objects already applied, the input the resume path of
/// `dump_instance`/`load_dump` needs.
#[derive(Debug, Default)]
pub struct ResumeState {
    pub completed_chunks: std::collections::HashSet<(String, u64)>,
    pub applied_ddl: std::collections::HashSet<String>,
    pub dump_complete: bool,
    pub load_complete: bool,
}

pub fn fold_resume_state(events: &[ProgressEvent]) -> ResumeState {
    let mut state = ResumeState::default();
    for event in events {
        match event {
            ProgressEvent::ChunkDone { table, chunk_index, .. } => {
                state.completed_chunks.insert((table.clone(), *chunk_index));
            }
            ProgressEvent::DdlApplied { object } => {
                state.applied_ddl.insert(object.clone());
            }
            ProgressEvent::DumpComplete => state.dump_complete = true,
            ProgressEvent::LoadComplete => state.load_complete = true,
            _ => {}
        }
    }
    state
}

pub fn require_not_complete(state: &ResumeState, for_dump: bool) -> Result<()> {
    if for_dump && state.dump_complete {
        bail!("dump already marked complete in the progress log");
    }
    if !for_dump && state.load_complete {
        bail!("load already marked complete in the progress log");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_round_trips_events() {
        let events = vec![
            ProgressEvent::ChunkStarted { table: "s.t".into(), chunk_index: 0 },
            ProgressEvent::ChunkDone { table: "s.t".into(), chunk_index: 0, bytes: 10, rows: 2 },
            ProgressEvent::DumpComplete,
        ];
        let mut bytes = Vec::new();
        for e in &events {
            bytes.extend_from_slice(&encode_entry(e).unwrap());
        }
        let decoded = decode_entries(&bytes);
        assert_eq!(decoded.len(), 3);
    }

    #[test]
    fn truncated_tail_entry_is_ignored() {
        let event = ProgressEvent::ChunkDone { table: "s.t".into(), chunk_index: 0, bytes: 10, rows: 2 };
        let mut bytes = encode_entry(&event).unwrap();
        bytes.extend_from_slice(&[1, 2, 3]); // truncated second entry
        let decoded = decode_entries(&bytes);
        assert_eq!(decoded.len(), 1);
    }

    #[test]
    fn resume_state_tracks_completed_chunks() {
        let events = vec![
            ProgressEvent::ChunkDone { table: "s.t".into(), chunk_index: 0, bytes: 1, rows: 1 },
            ProgressEvent::ChunkDone { table: "s.t".into(), chunk_index: 1, bytes: 1, rows: 1 },
        ];
        let state = fold_resume_state(&events);
        assert!(state.completed_chunks.contains(&("s.t".to_string(), 0)));
        assert!(state.completed_chunks.contains(&("s.t".to_string(), 1)));
        assert!(!state.dump_complete);
    }

    #[test]
    fn completed_dump_rejects_resume_as_dump() {
        let state = ResumeState {
            dump_complete: true,
            ..Default::default()
        };
        assert!(require_not_complete(&state, true).is_err());
        assert!(require_not_complete(&state, false).is_ok());
    }
}
