//! Operations façade.
//!
//! The six public entry points: `dump_instance`, `dump_schemas`,
//! `dump_tables`, `export_table`, `load_dump`, `import_table`. Each
//! wires the components above into one pipeline;
//! none contain pipeline logic of their own beyond sequencing.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};

use crate::chunk::{plan_chunks_filtered, resolve_boundaries, ChunkDescriptor};
use crate::codec::{decompress_blocking, Compression};
use crate::config::{DumpOptions, LoadOptions};
use crate::consistency::ConsistencyCoordinator;
use crate::ddl_rewrite::{DdlKind, DdlRewriter, RewriteOptions};
use crate::dump_scheduler::{ChunkResult, DumpScheduler};
use crate::load_scheduler::{
    handle_grant_error, split_for_transactions, topological_ddl_order, DdlNode, LoadChunkRef,
    LoadScheduler,
};
use crate::manifest::{Artifact, Manifest, TableManifestEntry};
use crate::metadata::{MetadataScanner, ObjectKind, SchemaObject};
use crate::progress::{fold_resume_state, require_not_complete, ProgressEvent, ProgressLog};
use crate::rate_limit::RateLimiter;
use crate::session::{loader_init_statements, Session, SessionPool};
use crate::storage::StorageBackend;
use crate::writer::{DumpWriter, FieldEncoding};

/// Summary returned by every dump-side operation.
#[derive(Debug, Clone, Default)]
pub struct DumpSummary {
    pub tables_dumped: usize,
    pub bytes_written: u64,
    pub rows_written: u64,
}

/// Summary returned by every load-side operation.
#[derive(Debug, Clone, Default)]
pub struct LoadSummary {
    pub tables_loaded: usize,
    pub bytes_loaded: u64,
    pub rows_loaded: u64,
}

/// Opens a session pool sized for a dump: `threads` workers plus one
/// dedicated locking session.
async fn open_dump_pool<F, Fut>(threads: usize, open: F) -> Result<SessionPool>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<Arc<dyn Session>>>,
{
    SessionPool::new(threads + 1, open).await
}

/// Opens a session pool sized for a load: `threads + backgroundThreads`,
/// with every session carrying the loader init SQL before it
/// re-enters the free list.
async fn open_load_pool<F, Fut>(
    threads: usize,
    background_threads: usize,
    open: F,
) -> Result<SessionPool>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<Arc<dyn Session>>>,
{
    let pool = SessionPool::new(threads + background_threads, open).await?;
    for _ in 0..pool.capacity() {
        let guard = pool.acquire().await;
        for stmt in loader_init_statements(None, &[]) {
            guard.session().execute(&stmt).await?;
        }
    }
    Ok(pool)
}

/// FIFO handed-out set of the consistency coordinator's snapshot-bound
/// worker sessions, so concurrent chunk dumps never share one
/// connection: the coordinator's sessions must never return to the
/// main `SessionPool`, but chunk workers still need mutual exclusion
/// over them.
struct SnapshotSessions {
    free: AsyncMutex<VecDeque<Arc<dyn Session>>>,
    permits: Semaphore,
}

impl SnapshotSessions {
    fn new(sessions: Vec<Arc<dyn Session>>) -> Self {
        let permits = Semaphore::new(sessions.len());
        Self {
            free: AsyncMutex::new(sessions.into()),
            permits,
        }
    }

    async fn acquire(self: &Arc<Self>) -> SnapshotSessionGuard {
        let permit = self.permits.acquire().await.expect("snapshot session semaphore never closes");
        permit.forget();
        let session = self
            .free
            .lock()
            .await
            .pop_front()
            .expect("permit acquired but free list empty");
        SnapshotSessionGuard {
            pool: self.clone(),
            session: Some(session),
        }
    }
}

struct SnapshotSessionGuard {
    pool: Arc<SnapshotSessions>,
    session: Option<Arc<dyn Session>>,
}

impl SnapshotSessionGuard {
    fn session(&self) -> &Arc<dyn Session> {
        self.session.as_ref().expect("session taken twice")
    }
}

impl Drop for SnapshotSessionGuard {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            if let Ok(mut free) = self.pool.free.try_lock() {
                free.push_back(session);
            }
            self.pool.permits.add_permits(1);
        }
    }
}

fn rewrite_options_from(dump_options: &DumpOptions) -> RewriteOptions {
    RewriteOptions {
        force_innodb: dump_options.force_innodb,
        strip_tablespaces: dump_options.ocimds,
        strip_definers: dump_options.strip_definers,
        strip_restricted_grants: dump_options.ocimds,
        strip_invalid_grants: dump_options.ocimds,
        ignore_wildcard_grants: false,
        skip_invalid_accounts: dump_options.ocimds,
        create_invisible_pks: dump_options.create_invisible_pks,
        ignore_missing_pks: false,
        oci_mds: dump_options.ocimds,
    }
}

/// File-extension suffix for a data-chunk artifact,
/// `<dialect-ext>.<codec-ext>` (e.g. `.tsv.zst`, `.csv.gz`).
fn artifact_extension(dialect: crate::writer::Dialect, compression: Compression) -> String {
    use crate::writer::Dialect;
    let dialect_ext = match dialect {
        Dialect::Csv | Dialect::CsvUnix => "csv",
        Dialect::Tsv => "tsv",
        Dialect::Json => "json",
        Dialect::Table => "txt",
    };
    format!("{}{}", dialect_ext, compression.extension())
}

/// `TIMESTAMP` (unlike `DATETIME`) stores an instant, not a wall-clock
/// reading, so `tzUtc` only ever rewrites columns of this type.
fn is_timestamp_type(mysql_type: &str) -> bool {
    mysql_type.to_ascii_lowercase().starts_with("timestamp")
}

/// Queries the scanning session's UTC offset so `tzUtc` can shift
/// `TIMESTAMP` text values without assuming a fixed server time zone.
async fn session_utc_offset(session: &Arc<dyn Session>) -> Result<chrono::FixedOffset> {
    let row = session
        .query_row("SELECT TIMESTAMPDIFF(SECOND, UTC_TIMESTAMP(), NOW())")
        .await?;
    let seconds: i32 = row
        .and_then(|r| r.into_iter().next())
        .flatten()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0);
    Ok(chrono::FixedOffset::east_opt(seconds).unwrap_or_else(|| chrono::FixedOffset::east_opt(0).unwrap()))
}

/// Rewrites every `TIMESTAMP` column's text value from the session's
/// local time zone to UTC, in place. Malformed or already-UTC text is
/// left untouched rather than failing the chunk.
fn shift_timestamps_to_utc(row: &mut crate::session::Row, timestamp_columns: &[bool], offset: chrono::FixedOffset) {
    for (i, value) in row.iter_mut().enumerate() {
        if !timestamp_columns.get(i).copied().unwrap_or(false) {
            continue;
        }
        let Some(bytes) = value.as_ref() else { continue };
        let Ok(text) = std::str::from_utf8(bytes) else { continue };
        let Ok(naive) = chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
            .or_else(|_| chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S"))
        else {
            continue;
        };
        let shifted = crate::writer::timestamp_to_utc_text(naive, offset);
        *value = Some(shifted.into_bytes());
    }
}

/// Binary-unsafe MySQL column types are base64-encoded rather than
/// escaped.
fn field_encoding(mysql_type: &str) -> FieldEncoding {
    let lower = mysql_type.to_ascii_lowercase();
    if lower.contains("blob") || lower.contains("binary") || lower.contains("bit") || lower.contains("geometry") {
        FieldEncoding::Base64Binary
    } else {
        FieldEncoding::PlainText
    }
}

/// A table with no unique key whose chunks were only partially marked
/// done before the process stopped can't distinguish "row already
/// loaded" from "row pending" on resume, so its whole data set has to
/// be truncated and reloaded rather than resumed chunk-by-chunk.
/// Fully-complete and never-started tables don't need this.
fn table_needs_truncate_before_resume(chunking: bool, completed_chunks: usize, total_chunks: usize) -> bool {
    !chunking && completed_chunks > 0 && completed_chunks < total_chunks
}

fn order_by_clause(columns: &[String]) -> String {
    if columns.is_empty() {
        return String::new();
    }
    let cols = columns
        .iter()
        .map(|c| format!("`{}`", c))
        .collect::<Vec<_>>()
        .join(", ");
    format!(" ORDER BY {}", cols)
}

async fn write_whole_artifact(backend: &dyn StorageBackend, path: &str, data: &[u8]) -> Result<()> {
    let mut stream = backend.open_write(path).await?;
    stream.write_all(data).await?;
    stream.close().await
}

async fn read_whole_artifact(backend: &dyn StorageBackend, path: &str) -> Result<Vec<u8>> {
    let mut reader = backend
        .open_read(path)
        .await
        .with_context(|| format!("reading artifact {}", path))?;
    let mut bytes = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut bytes).await?;
    Ok(bytes)
}

/// Dumps every schema (minus the always-excluded system schemas and any
/// `excludeSchemas`) plus users, routines, events and triggers.
pub async fn dump_instance<F, Fut>(
    options: DumpOptions,
    open_session: F,
    backend: Arc<dyn StorageBackend>,
) -> Result<DumpSummary>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<Arc<dyn Session>>>,
{
    let options = options.build()?;
    let pool = open_dump_pool(options.threads, open_session).await?;
    run_dump(&options, &pool, &backend, None).await
}

/// Dumps only the named schemas.
pub async fn dump_schemas<F, Fut>(
    options: DumpOptions,
    schemas: Vec<String>,
    open_session: F,
    backend: Arc<dyn StorageBackend>,
) -> Result<DumpSummary>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<Arc<dyn Session>>>,
{
    let options = options.build()?;
    let pool = open_dump_pool(options.threads, open_session).await?;
    run_dump(&options, &pool, &backend, Some(schemas)).await
}

/// Dumps only the named `schema.table` pairs, no schema DDL, no users.
pub async fn dump_tables<F, Fut>(
    options: DumpOptions,
    tables: Vec<(String, String)>,
    open_session: F,
    backend: Arc<dyn StorageBackend>,
) -> Result<DumpSummary>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<Arc<dyn Session>>>,
{
    let options = options.build()?;
    let pool = open_dump_pool(options.threads, open_session).await?;
    run_dump_tables(&options, &pool, &backend, tables).await
}

/// Dumps exactly one table with no manifest/progress-log overhead,
/// for scripted single-table extraction.
pub async fn export_table<F, Fut>(
    options: DumpOptions,
    schema: String,
    table: String,
    open_session: F,
    backend: Arc<dyn StorageBackend>,
) -> Result<DumpSummary>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<Arc<dyn Session>>>,
{
    let options = options.build()?;
    let pool = open_dump_pool(options.threads, open_session).await?;
    run_dump_tables(&options, &pool, &backend, vec![(schema, table)]).await
}

async fn run_dump(
    options: &DumpOptions,
    pool: &SessionPool,
    backend: &Arc<dyn StorageBackend>,
    only_schemas: Option<Vec<String>>,
) -> Result<DumpSummary> {
    let progress = ProgressLog::new(backend.clone(), true);
    let coordinator = ConsistencyCoordinator::new(
        options
            .consistency
            .resolve(/* has_reload_privilege */ true),
    );
    let (sessions, position) = coordinator
        .establish(pool, options.threads, &[], options.skip_consistency_checks)
        .await?;
    info!(
        "snapshot established at binlog {:?}:{:?}",
        position.binlog_file, position.binlog_position
    );
    let worker_sessions = Arc::new(SnapshotSessions::new(
        sessions.iter().map(|g| g.session().clone()).collect(),
    ));
    drop(sessions);
    let scan_guard = worker_sessions.acquire().await;
    let scanner = MetadataScanner::new(scan_guard.session());
    scanner.check_names_charset().await?;

    let schemas = match only_schemas {
        Some(explicit) => explicit,
        None => scanner.list_schemas(&options.schema_filter).await?,
    };

    let mut manifest = Manifest::new(String::new());
    manifest.binlog_file = position.binlog_file;
    manifest.binlog_position = position.binlog_position;
    manifest.gtid_executed = position.gtid_executed;
    manifest.ocimds = options.ocimds;

    write_whole_artifact(backend.as_ref(), "@.sql", global_preamble(options).as_bytes()).await?;

    let rewriter = DdlRewriter::new(rewrite_options_from(options));
    let mut summary = DumpSummary::default();
    // Routine names survive here regardless of `dumpRoutines`, since a
    // GRANT on a routine the dump doesn't carry must still be
    // recognized as invalid under `stripInvalidGrants`.
    let mut known_routines = std::collections::HashSet::new();

    for schema in &schemas {
        write_whole_artifact(
            backend.as_ref(),
            &format!("{}.sql", schema),
            format!("CREATE SCHEMA IF NOT EXISTS `{}`;\n", schema).as_bytes(),
        )
        .await?;

        let tables: Vec<(String, String)> = scanner
            .list_tables(schema, &options.table_filter)
            .await?
            .into_iter()
            .map(|t| (schema.clone(), t))
            .collect();
        summary = merge_summary(
            summary,
            dump_table_list(options, &scanner, pool, worker_sessions.clone(), backend, &progress, &rewriter, &mut manifest, tables).await?,
        );

        for (name, _kind) in scanner.list_routines(schema, &options.table_filter).await? {
            known_routines.insert(format!("{}.{}", schema, name));
        }
        if options.dump_routines {
            dump_routines(&scanner, backend, &rewriter, schema, &options.table_filter).await?;
        }
        if options.dump_triggers {
            dump_triggers(&scanner, backend, &rewriter, schema, &options.table_filter).await?;
        }
        if options.dump_events {
            dump_events(&scanner, backend, &rewriter, schema, &options.table_filter).await?;
        }
        dump_views(&scanner, backend, &rewriter, schema, &options.table_filter).await?;
    }

    if options.dump_users {
        manifest.users_path = Some(
            dump_users(&scanner, backend, &rewriter, &options.user_filter, &known_routines).await?,
        );
    }

    write_whole_artifact(backend.as_ref(), "@.post.sql", global_postamble().as_bytes()).await?;

    manifest.dump_complete = true;
    manifest.write(backend.as_ref()).await?;
    progress.append(&ProgressEvent::DumpComplete).await?;

    Ok(summary)
}

fn merge_summary(mut into: DumpSummary, other: DumpSummary) -> DumpSummary {
    into.tables_dumped += other.tables_dumped;
    into.bytes_written += other.bytes_written;
    into.rows_written += other.rows_written;
    into
}

fn global_preamble(options: &DumpOptions) -> String {
    format!(
        "-- global DDL preamble\nSET FOREIGN_KEY_CHECKS=0;\nSET UNIQUE_CHECKS=0;\nSET SQL_MODE='';\n-- compression={} dialect set for data chunks\n",
        options.compression
    )
}

fn global_postamble() -> String {
    "-- global DDL postamble\nSET FOREIGN_KEY_CHECKS=1;\nSET UNIQUE_CHECKS=1;\n".to_string()
}

async fn dump_views(
    scanner: &MetadataScanner<'_>,
    backend: &Arc<dyn StorageBackend>,
    rewriter: &DdlRewriter,
    schema: &str,
    filter: &crate::metadata::ObjectFilter,
) -> Result<()> {
    for view in scanner.list_views(schema, filter).await? {
        let ddl = scanner.view_ddl(schema, &view).await?;
        let rewritten = rewriter.rewrite_definer_bearing(&ddl)?;
        write_whole_artifact(
            backend.as_ref(),
            &format!("{}@{}.sql", schema, view),
            rewritten.as_bytes(),
        )
        .await?;
    }
    Ok(())
}

async fn dump_routines(
    scanner: &MetadataScanner<'_>,
    backend: &Arc<dyn StorageBackend>,
    rewriter: &DdlRewriter,
    schema: &str,
    filter: &crate::metadata::ObjectFilter,
) -> Result<()> {
    for (name, kind) in scanner.list_routines(schema, filter).await? {
        let ddl = scanner.routine_ddl(schema, &name, &kind).await?;
        let rewritten = rewriter.rewrite_definer_bearing(&ddl)?;
        write_whole_artifact(
            backend.as_ref(),
            &format!("{}.{}.sql", schema, name),
            rewritten.as_bytes(),
        )
        .await?;
    }
    Ok(())
}

async fn dump_triggers(
    scanner: &MetadataScanner<'_>,
    backend: &Arc<dyn StorageBackend>,
    rewriter: &DdlRewriter,
    schema: &str,
    filter: &crate::metadata::ObjectFilter,
) -> Result<()> {
    for trigger in scanner.list_triggers(schema, filter).await? {
        let ddl = scanner.trigger_ddl(schema, &trigger).await?;
        let rewritten = rewriter.rewrite_definer_bearing(&ddl)?;
        write_whole_artifact(
            backend.as_ref(),
            &format!("{}.{}.trigger.sql", schema, trigger),
            rewritten.as_bytes(),
        )
        .await?;
    }
    Ok(())
}

async fn dump_events(
    scanner: &MetadataScanner<'_>,
    backend: &Arc<dyn StorageBackend>,
    rewriter: &DdlRewriter,
    schema: &str,
    filter: &crate::metadata::ObjectFilter,
) -> Result<()> {
    for event in scanner.list_events(schema, filter).await? {
        let ddl = scanner.event_ddl(schema, &event).await?;
        let rewritten = rewriter.rewrite_definer_bearing(&ddl)?;
        write_whole_artifact(
            backend.as_ref(),
            &format!("{}.{}.sql", schema, event),
            rewritten.as_bytes(),
        )
        .await?;
    }
    Ok(())
}

async fn dump_users(
    scanner: &MetadataScanner<'_>,
    backend: &Arc<dyn StorageBackend>,
    rewriter: &DdlRewriter,
    filter: &crate::metadata::UserFilter,
    known_routines: &std::collections::HashSet<String>,
) -> Result<String> {
    let mut out = String::from("-- user accounts and grants\n");
    for account in scanner.list_users(filter).await? {
        if !rewriter.account_is_valid(&account) {
            continue;
        }
        for grant in scanner.user_grants(&account.user, &account.host).await? {
            if let Some(rewritten) = rewriter.rewrite_grant(&grant, known_routines)? {
                out.push_str(&rewritten);
                out.push_str(";\n");
            }
        }
    }
    let path = "@.users.sql".to_string();
    write_whole_artifact(backend.as_ref(), &path, out.as_bytes()).await?;
    Ok(path)
}

async fn run_dump_tables(
    options: &DumpOptions,
    pool: &SessionPool,
    backend: &Arc<dyn StorageBackend>,
    tables: Vec<(String, String)>,
) -> Result<DumpSummary> {
    let progress = ProgressLog::new(backend.clone(), true);
    let coordinator = ConsistencyCoordinator::new(
        options
            .consistency
            .resolve(/* has_reload_privilege */ true),
    );
    let (sessions, position) = coordinator
        .establish(pool, options.threads, &tables, options.skip_consistency_checks)
        .await?;
    let worker_sessions = Arc::new(SnapshotSessions::new(
        sessions.iter().map(|g| g.session().clone()).collect(),
    ));
    drop(sessions);
    let scan_guard = worker_sessions.acquire().await;
    let scanner = MetadataScanner::new(scan_guard.session());

    let mut manifest = Manifest::new(String::new());
    manifest.binlog_file = position.binlog_file;
    manifest.binlog_position = position.binlog_position;
    manifest.ocimds = options.ocimds;

    let rewriter = DdlRewriter::new(rewrite_options_from(options));
    let summary = dump_table_list(options, &scanner, pool, worker_sessions.clone(), backend, &progress, &rewriter, &mut manifest, tables).await?;

    manifest.dump_complete = true;
    manifest.write(backend.as_ref()).await?;
    progress.append(&ProgressEvent::DumpComplete).await?;
    Ok(summary)
}

/// Dumps each `(schema, table)` pair: writes the rewritten `CREATE
/// TABLE` DDL artifact, plans its chunks, and drives the Dump
/// Scheduler over them, handing each chunk's rows to a Dump Writer
/// before the compressed bytes reach storage.
async fn dump_table_list(
    options: &DumpOptions,
    scanner: &MetadataScanner<'_>,
    pool: &SessionPool,
    sessions: Arc<SnapshotSessions>,
    backend: &Arc<dyn StorageBackend>,
    progress: &ProgressLog,
    rewriter: &DdlRewriter,
    manifest: &mut Manifest,
    tables: Vec<(String, String)>,
) -> Result<DumpSummary> {
    let rate_limiter = if options.max_rate == 0 {
        RateLimiter::unlimited()
    } else {
        RateLimiter::new(options.max_rate)
    };

    let mut summary = DumpSummary::default();
    for (schema, table) in &tables {
        let descriptor = scanner.table_descriptor(schema, table).await?;
        let ddl_path = format!("{}@{}.sql", schema, table);
        if !options.data_only {
            let ddl = scanner.table_ddl(schema, table).await?;
            let rewritten_ddl = rewriter.rewrite_create_table(&ddl)?;
            write_whole_artifact(backend.as_ref(), &ddl_path, rewritten_ddl.as_bytes()).await?;
        }

        let chunking = descriptor.is_chunkable();
        let mut chunk_entries = Vec::new();
        let mut table_bytes = 0u64;
        let mut table_rows = 0u64;

        if !options.ddl_only {
            let user_where = options
                .table_where
                .get(&format!("{}.{}", schema, table))
                .map(String::as_str);
            let chunks =
                plan_chunks_filtered(&descriptor, options.bytes_per_chunk, options.threads, user_where)?;
            let chunks = {
                let probe_guard = sessions.acquire().await;
                resolve_boundaries(probe_guard.session(), &descriptor, chunks).await?
            };
            let scheduler = DumpScheduler::new(chunks);

            let column_names: Vec<String> = descriptor.columns.iter().map(|c| c.name.clone()).collect();
            let encodings: Vec<FieldEncoding> = descriptor
                .columns
                .iter()
                .map(|c| field_encoding(&c.mysql_type))
                .collect();
            let select_columns = column_names
                .iter()
                .map(|c| format!("`{}`", c))
                .collect::<Vec<_>>()
                .join(", ");
            let timestamp_columns: Vec<bool> = descriptor
                .columns
                .iter()
                .map(|c| is_timestamp_type(&c.mysql_type))
                .collect();

            let entries: Arc<AsyncMutex<Vec<Artifact>>> = Arc::new(AsyncMutex::new(Vec::new()));

            scheduler
                .run(pool, options.threads, &rate_limiter, |chunk, serialize| {
                    dump_one_chunk(
                        chunk,
                        serialize,
                        sessions.clone(),
                        backend,
                        progress,
                        entries.clone(),
                        select_columns.clone(),
                        column_names.clone(),
                        encodings.clone(),
                        options.dialect,
                        options.compression,
                        options.tz_utc,
                        timestamp_columns.clone(),
                    )
                })
                .await?;

            chunk_entries = Arc::try_unwrap(entries)
                .map_err(|_| anyhow::anyhow!("dump scheduler still holds a manifest reference"))?
                .into_inner();
            chunk_entries.sort_by_key(|a| a.chunk_index);
            table_bytes = chunk_entries.iter().map(|a| a.bytes).sum();
            table_rows = chunk_entries.iter().filter_map(|a| a.rows).sum();
        }

        manifest.tables.push(TableManifestEntry {
            schema: schema.clone(),
            table: table.clone(),
            ddl_path,
            chunks: chunk_entries,
            chunking,
        });

        summary.tables_dumped += 1;
        summary.bytes_written += table_bytes;
        summary.rows_written += table_rows;
    }
    Ok(summary)
}

#[allow(clippy::too_many_arguments)]
async fn dump_one_chunk(
    chunk: ChunkDescriptor,
    serialize: Arc<AsyncMutex<()>>,
    sessions: Arc<SnapshotSessions>,
    backend: &Arc<dyn StorageBackend>,
    progress: &ProgressLog,
    entries: Arc<AsyncMutex<Vec<Artifact>>>,
    select_columns: String,
    column_names: Vec<String>,
    encodings: Vec<FieldEncoding>,
    dialect: crate::writer::Dialect,
    compression: Compression,
    tz_utc: bool,
    timestamp_columns: Vec<bool>,
) -> Result<ChunkResult> {
    let guard = sessions.acquire().await;
    let session = guard.session().clone();

    let partition_sql = chunk.partition.clone().map(|p| format!(" {}", p)).unwrap_or_default();
    let where_sql = chunk
        .where_clause()
        .map(|w| format!(" WHERE {}", w))
        .unwrap_or_default();
    let order_sql = order_by_clause(&chunk.order_by_columns);
    let query = format!(
        "SELECT {} FROM `{}`.`{}`{}{}{}",
        select_columns, chunk.schema, chunk.table, partition_sql, where_sql, order_sql
    );

    let utc_offset = if tz_utc {
        Some(session_utc_offset(&session).await?)
    } else {
        None
    };

    let mut writer = DumpWriter::new(dialect, column_names, encodings, compression, None, None)?;
    let mut row_error: Option<anyhow::Error> = None;
    session
        .query_stream(&query, &mut |mut row| {
            if let Some(offset) = utc_offset {
                shift_timestamps_to_utc(&mut row, &timestamp_columns, offset);
            }
            match writer.write_row(&row) {
                Ok(_) => Ok(true),
                Err(e) => {
                    row_error = Some(e);
                    Ok(false)
                }
            }
        })
        .await?;
    if let Some(e) = row_error {
        return Ok(ChunkResult {
            bytes: 0,
            rows: 0,
            retriable_failure: Some(e.to_string()),
        });
    }
    drop(guard);

    let (data, rows, bytes) = writer.finish_chunk()?;
    let ext = artifact_extension(dialect, compression);
    let path = format!("{}@{}@{}.{}", chunk.schema, chunk.table, chunk.index, ext);
    write_whole_artifact(backend.as_ref(), &path, &data).await?;
    let crc32 = crc32fast::hash(&data);

    {
        let _serialized = serialize.lock().await;
        progress
            .append(&ProgressEvent::ChunkDone {
                table: format!("{}.{}", chunk.schema, chunk.table),
                chunk_index: chunk.index,
                bytes,
                rows,
            })
            .await?;
        entries.lock().await.push(Artifact {
            path,
            chunk_index: chunk.index,
            bytes,
            rows: Some(rows),
            compression,
            crc32,
            par_url: None,
            par_expiration: None,
        });
    }

    Ok(ChunkResult {
        bytes,
        rows,
        retriable_failure: None,
    })
}

/// Resumes or starts a full load from a previously written dump
/// directory.
pub async fn load_dump<F, Fut>(
    options: LoadOptions,
    open_session: F,
    backend: Arc<dyn StorageBackend>,
) -> Result<LoadSummary>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<Arc<dyn Session>>>,
{
    let options = options.build()?;
    let manifest = Manifest::read(backend.as_ref()).await?;
    if options.require_ocimds {
        manifest.require_ocimds()?;
    }

    if options.reset_progress {
        backend.remove(crate::progress::PROGRESS_LOG_NAME).await.ok();
    }
    let events = ProgressLog::replay(backend.as_ref()).await?;
    let resume_state = fold_resume_state(&events);
    require_not_complete(&resume_state, false)?;

    info!(
        "resuming load: {} tables already recorded, {} chunks previously completed",
        manifest.tables.len(),
        resume_state.completed_chunks.len()
    );

    let pool = open_load_pool(options.threads, options.background_threads, open_session).await?;
    let progress = ProgressLog::new(backend.clone(), true);

    let table_names: Vec<(String, String)> = manifest
        .tables
        .iter()
        .map(|t| (t.schema.clone(), t.table.clone()))
        .collect();
    let scheduler = LoadScheduler::new(&table_names, options.defer_table_indexes);

    let ddl_nodes: Vec<DdlNode> = manifest
        .tables
        .iter()
        .map(|t| DdlNode {
            object: SchemaObject {
                schema: t.schema.clone(),
                name: t.table.clone(),
                kind: ObjectKind::Table,
                ddl: t.ddl_path.clone(),
                depends_on: Vec::new(),
            },
            kind: DdlKind::CreateTable,
        })
        .collect();
    let ordered = topological_ddl_order(ddl_nodes)?;

    for node in &ordered {
        let key = format!("{}.{}", node.object.schema, node.object.name);
        let entry = manifest
            .table(&node.object.schema, &node.object.name)
            .with_context(|| format!("{} missing from manifest", key))?;

        if resume_state.applied_ddl.contains(&key) {
            scheduler.mark_ddl_applied(&node.object.schema, &node.object.name);
        } else {
            let ddl_bytes = read_whole_artifact(backend.as_ref(), &entry.ddl_path).await?;
            let ddl_text = String::from_utf8(ddl_bytes).context("DDL artifact is not valid UTF-8")?;
            let guard = pool.acquire().await;
            guard.session().execute(&ddl_text).await?;
            drop(guard);
            scheduler.mark_ddl_applied(&node.object.schema, &node.object.name);
            progress.append(&ProgressEvent::DdlApplied { object: key.clone() }).await?;
        }

        // A table with no primary key or non-nullable unique index
        // (`!entry.chunking`) has no way to tell a row already loaded
        // by an earlier, interrupted attempt apart from one `LOAD DATA`
        // is about to insert again. If some but not all of its chunks
        // were marked done before the interruption, resuming chunk-by-
        // chunk would re-run the still-pending chunk and silently
        // duplicate whatever of it already landed. Truncate and reload
        // every chunk for that table instead of trusting the partial
        // progress.
        let completed_for_table = entry
            .chunks
            .iter()
            .filter(|c| resume_state.completed_chunks.contains(&(key.clone(), c.chunk_index)))
            .count();
        let needs_truncate = table_needs_truncate_before_resume(entry.chunking, completed_for_table, entry.chunks.len());
        let trust_completed_chunks = if !needs_truncate {
            true
        } else {
            info!(
                "{} has no unique key and {} of {} chunks were left incomplete by a prior run; truncating before reload",
                key,
                completed_for_table,
                entry.chunks.len()
            );
            let guard = pool.acquire().await;
            guard
                .session()
                .execute(&format!("TRUNCATE TABLE `{}`.`{}`", node.object.schema, node.object.name))
                .await
                .with_context(|| format!("truncating {} before reloading its incomplete chunks", key))?;
            drop(guard);
            false
        };

        scheduler.set_expected_chunk_count(&node.object.schema, &node.object.name, entry.chunks.len());
        for chunk in &entry.chunks {
            if trust_completed_chunks
                && resume_state
                    .completed_chunks
                    .contains(&(key.clone(), chunk.chunk_index))
            {
                scheduler.note_chunk_loaded(&node.object.schema, &node.object.name);
                continue;
            }
            scheduler.push_ready_chunk(LoadChunkRef {
                schema: node.object.schema.clone(),
                table: node.object.name.clone(),
                chunk_index: chunk.chunk_index,
                path: chunk.path.clone(),
            });
        }
    }

    let dump_complete = manifest.dump_complete;
    let progress_ref = &progress;
    let scheduler_ref = &scheduler;
    let pool_ref = &pool;
    let backend_ref = &backend;
    let max_bytes_per_transaction = options.max_bytes_per_transaction;

    scheduler
        .run(
            options.threads,
            options.wait_dump_timeout,
            || dump_complete,
            move |chunk_ref| {
                load_one_chunk(
                    chunk_ref,
                    pool_ref,
                    backend_ref,
                    progress_ref,
                    scheduler_ref,
                    max_bytes_per_transaction,
                )
            },
        )
        .await?;

    let mut summary = LoadSummary::default();
    summary.tables_loaded = manifest.tables.len();
    summary.bytes_loaded = scheduler.bytes_loaded();
    summary.rows_loaded = scheduler.rows_loaded();

    if options.load_users {
        if let Some(users_path) = &manifest.users_path {
            load_users(&pool, backend.as_ref(), users_path, options.handle_grant_errors).await?;
        }
    }

    progress.append(&ProgressEvent::LoadComplete).await?;
    Ok(summary)
}

async fn load_one_chunk(
    chunk_ref: LoadChunkRef,
    pool: &SessionPool,
    backend: &Arc<dyn StorageBackend>,
    progress: &ProgressLog,
    scheduler: &LoadScheduler,
    max_bytes_per_transaction: u64,
) -> Result<(u64, u64)> {
    let compressed = read_whole_artifact(backend.as_ref(), &chunk_ref.path).await?;
    let codec = chunk_ref
        .path
        .rsplit('.')
        .next()
        .and_then(Compression::from_extension)
        .unwrap_or(Compression::None);
    let decompressed = decompress_blocking(codec, compressed).await?;

    let line_sizes: Vec<usize> = decompressed
        .split(|&b| b == b'\n')
        .filter(|l| !l.is_empty())
        .map(|l| l.len() + 1)
        .collect();
    let sub_ranges = split_for_transactions(&line_sizes, max_bytes_per_transaction);

    let tmp = tempfile::NamedTempFile::new().context("creating LOAD DATA staging file")?;
    tokio::fs::write(tmp.path(), &decompressed).await?;

    let guard = pool.acquire().await;
    let mut rows_loaded = 0u64;
    for _ in &sub_ranges {
        let stmt = format!(
            "LOAD DATA LOCAL INFILE '{}' INTO TABLE `{}`.`{}`",
            tmp.path().display(),
            chunk_ref.schema,
            chunk_ref.table
        );
        guard.session().execute(&stmt).await?;
    }
    rows_loaded += line_sizes.len() as u64;
    drop(guard);

    progress
        .append(&ProgressEvent::ChunkDone {
            table: format!("{}.{}", chunk_ref.schema, chunk_ref.table),
            chunk_index: chunk_ref.chunk_index,
            bytes: decompressed.len() as u64,
            rows: rows_loaded,
        })
        .await?;

    if let Some(deferred_ddl) = scheduler.note_chunk_loaded(&chunk_ref.schema, &chunk_ref.table) {
        let guard = pool.acquire().await;
        for ddl in deferred_ddl {
            guard.session().execute(&ddl).await?;
        }
        drop(guard);
        progress
            .append(&ProgressEvent::TableIndexesApplied {
                table: format!("{}.{}", chunk_ref.schema, chunk_ref.table),
            })
            .await?;
    }

    Ok((decompressed.len() as u64, rows_loaded))
}

async fn load_users(
    pool: &SessionPool,
    backend: &dyn StorageBackend,
    users_path: &str,
    policy: crate::load_scheduler::GrantErrorPolicy,
) -> Result<()> {
    let bytes = read_whole_artifact(backend, users_path).await?;
    let text = String::from_utf8(bytes).context("users artifact is not valid UTF-8")?;
    let guard = pool.acquire().await;
    for statement in text.lines().filter(|l| !l.is_empty() && !l.starts_with("--")) {
        if let Err(e) = guard.session().execute(statement).await {
            handle_grant_error(policy, guard.session(), statement, &e.to_string()).await?;
        }
    }
    Ok(())
}

/// Loads exactly one table from a dump directory, independent of the
/// rest of its manifest entries.
pub async fn import_table<F, Fut>(
    options: LoadOptions,
    schema: String,
    table: String,
    open_session: F,
    backend: Arc<dyn StorageBackend>,
) -> Result<LoadSummary>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<Arc<dyn Session>>>,
{
    let options = options.build()?;
    let manifest = Manifest::read(backend.as_ref()).await?;
    if options.require_ocimds {
        manifest.require_ocimds()?;
    }
    let entry = manifest
        .table(&schema, &table)
        .with_context(|| format!("{}.{} not present in manifest", schema, table))?
        .clone();

    let pool = open_load_pool(options.threads, options.background_threads, open_session).await?;
    let progress = ProgressLog::new(backend.clone(), true);

    let ddl_bytes = read_whole_artifact(backend.as_ref(), &entry.ddl_path).await?;
    let ddl_text = String::from_utf8(ddl_bytes).context("DDL artifact is not valid UTF-8")?;
    {
        let guard = pool.acquire().await;
        guard.session().execute(&ddl_text).await?;
    }
    progress
        .append(&ProgressEvent::DdlApplied {
            object: format!("{}.{}", schema, table),
        })
        .await?;

    let scheduler = LoadScheduler::new(&[(schema.clone(), table.clone())], options.defer_table_indexes);
    scheduler.set_expected_chunk_count(&schema, &table, entry.chunks.len());

    let mut summary = LoadSummary::default();
    for chunk in &entry.chunks {
        let (bytes, rows) = load_one_chunk(
            LoadChunkRef {
                schema: schema.clone(),
                table: table.clone(),
                chunk_index: chunk.chunk_index,
                path: chunk.path.clone(),
            },
            &pool,
            &backend,
            &progress,
            &scheduler,
            options.max_bytes_per_transaction,
        )
        .await?;
        summary.bytes_loaded += bytes;
        summary.rows_loaded += rows;
    }
    summary.tables_loaded = 1;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_options_inherit_ocimds_flags() {
        let dump_options = DumpOptions::new("/tmp/out").ocimds(true);
        let rewrite = rewrite_options_from(&dump_options);
        assert!(rewrite.force_innodb);
        assert!(rewrite.strip_definers);
        assert!(rewrite.oci_mds);
    }

    #[test]
    fn artifact_extension_combines_dialect_and_codec() {
        use crate::writer::Dialect;
        assert_eq!(artifact_extension(Dialect::Tsv, Compression::Zstd), "tsv.zst");
        assert_eq!(artifact_extension(Dialect::Csv, Compression::Gzip), "csv.gz");
        assert_eq!(artifact_extension(Dialect::CsvUnix, Compression::None), "csv");
    }

    #[test]
    fn binary_column_types_get_base64_encoding() {
        assert!(matches!(field_encoding("blob"), FieldEncoding::Base64Binary));
        assert!(matches!(field_encoding("varbinary(16)"), FieldEncoding::Base64Binary));
        assert!(matches!(field_encoding("int"), FieldEncoding::PlainText));
    }

    #[test]
    fn order_by_clause_empty_when_no_columns() {
        assert_eq!(order_by_clause(&[]), "");
        assert_eq!(order_by_clause(&["id".to_string()]), " ORDER BY `id`");
    }

    #[test]
    fn timestamp_type_detection_is_case_insensitive_and_specific() {
        assert!(is_timestamp_type("TIMESTAMP"));
        assert!(is_timestamp_type("timestamp(6)"));
        assert!(!is_timestamp_type("datetime"));
        assert!(!is_timestamp_type("int"));
    }

    #[test]
    fn shift_timestamps_to_utc_rewrites_only_flagged_columns() {
        let offset = chrono::FixedOffset::east_opt(3600).unwrap();
        let mut row: crate::session::Row = vec![
            Some(b"2024-01-01 12:00:00".to_vec()),
            Some(b"2024-01-01 12:00:00".to_vec()),
        ];
        shift_timestamps_to_utc(&mut row, &[true, false], offset);
        let shifted = String::from_utf8(row[0].clone().unwrap()).unwrap();
        assert!(shifted.starts_with("2024-01-01 11:00:00"));
        assert_eq!(row[1].as_ref().unwrap(), b"2024-01-01 12:00:00");
    }

    #[test]
    fn ddl_only_and_data_only_are_mutually_exclusive_at_build() {
        let opts = DumpOptions::new("/tmp/out").ddl_only(true).data_only(true);
        assert!(opts.build().is_err());
    }

    #[test]
    fn keyless_table_with_partial_chunks_needs_truncate() {
        assert!(table_needs_truncate_before_resume(false, 1, 3));
    }

    #[test]
    fn keyless_table_fully_complete_does_not_need_truncate() {
        assert!(!table_needs_truncate_before_resume(false, 3, 3));
    }

    #[test]
    fn keyless_table_never_started_does_not_need_truncate() {
        assert!(!table_needs_truncate_before_resume(false, 0, 3));
    }

    #[test]
    fn keyed_table_with_partial_chunks_resumes_normally() {
        assert!(!table_needs_truncate_before_resume(true, 1, 3));
    }
}
