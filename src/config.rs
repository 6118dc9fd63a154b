//! Configuration & Options.
//!
//! Consuming builders for each of the six public operations, following
//! the same self-returning builder shape `PruneOptions` uses: every
//! setter takes `self` by value and returns `Self`, and validation runs
//! once at `build()` rather than being re-checked on every access.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};

use crate::chunk::validate_bytes_per_chunk;
use crate::codec::Compression;
use crate::consistency::LockMethod;
use crate::load_scheduler::GrantErrorPolicy;
use crate::metadata::{ObjectFilter, UserFilter};
use crate::writer::Dialect;

pub const DEFAULT_BYTES_PER_CHUNK: u64 = 64 * 1024 * 1024;
pub const DEFAULT_THREADS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyChoice {
    Auto,
    FlushTablesWithReadLock,
    LockTables,
    None,
}

impl ConsistencyChoice {
    pub fn resolve(self, has_reload_privilege: bool) -> LockMethod {
        match self {
            ConsistencyChoice::FlushTablesWithReadLock => LockMethod::FlushTablesWithReadLock,
            ConsistencyChoice::LockTables => LockMethod::LockTables,
            ConsistencyChoice::None => LockMethod::None,
            ConsistencyChoice::Auto if has_reload_privilege => LockMethod::FlushTablesWithReadLock,
            ConsistencyChoice::Auto => LockMethod::LockTables,
        }
    }
}

/// Shared by `dump_instance`/`dump_schemas`/`dump_tables`/`export_table`.
#[derive(Debug, Clone)]
pub struct DumpOptions {
    pub output_root: PathBuf,
    pub threads: usize,
    pub bytes_per_chunk: u64,
    pub max_rate: u64,
    pub compression: Compression,
    pub dialect: Dialect,
    pub consistency: ConsistencyChoice,
    /// `skipConsistencyChecks`: skip the cross-worker `gtid_executed`/
    /// binlog position comparison after the consistent snapshot is
    /// established. The snapshot is still taken; only the fatal
    /// divergence check is skipped.
    pub skip_consistency_checks: bool,
    pub schema_filter: ObjectFilter,
    pub table_filter: ObjectFilter,
    pub user_filter: UserFilter,
    pub dump_users: bool,
    pub dump_events: bool,
    pub dump_routines: bool,
    pub dump_triggers: bool,
    pub ocimds: bool,
    pub force_innodb: bool,
    pub strip_definers: bool,
    pub create_invisible_pks: bool,
    /// `where`: per-`schema.table` user predicate ANDed into every
    /// chunk of that table.
    pub table_where: HashMap<String, String>,
    /// `ddlOnly`: write DDL artifacts only, no data chunks. Mutually
    /// exclusive with `data_only`.
    pub ddl_only: bool,
    /// `dataOnly`: write data chunks only, no DDL artifacts. Mutually
    /// exclusive with `ddl_only`.
    pub data_only: bool,
    /// `tzUtc`: shift `TIMESTAMP` column values to UTC before writing,
    /// using the scanning session's `time_zone` setting.
    pub tz_utc: bool,
}

impl DumpOptions {
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self {
            output_root: output_root.into(),
            threads: DEFAULT_THREADS,
            bytes_per_chunk: DEFAULT_BYTES_PER_CHUNK,
            max_rate: 0,
            compression: Compression::Zstd,
            dialect: Dialect::Csv,
            consistency: ConsistencyChoice::Auto,
            skip_consistency_checks: false,
            schema_filter: ObjectFilter::default(),
            table_filter: ObjectFilter::default(),
            user_filter: UserFilter::default(),
            dump_users: true,
            dump_events: true,
            dump_routines: true,
            dump_triggers: true,
            ocimds: false,
            force_innodb: false,
            strip_definers: false,
            create_invisible_pks: false,
            table_where: HashMap::new(),
            ddl_only: false,
            data_only: false,
            tz_utc: false,
        }
    }

    pub fn threads(mut self, value: usize) -> Self {
        self.threads = value;
        self
    }

    pub fn bytes_per_chunk(mut self, value: u64) -> Self {
        self.bytes_per_chunk = value;
        self
    }

    pub fn max_rate(mut self, value: u64) -> Self {
        self.max_rate = value;
        self
    }

    pub fn compression(mut self, value: Compression) -> Self {
        self.compression = value;
        self
    }

    pub fn dialect(mut self, value: Dialect) -> Self {
        self.dialect = value;
        self
    }

    pub fn consistency(mut self, value: ConsistencyChoice) -> Self {
        self.consistency = value;
        self
    }

    pub fn skip_consistency_checks(mut self, value: bool) -> Self {
        self.skip_consistency_checks = value;
        self
    }

    pub fn schema_filter(mut self, value: ObjectFilter) -> Self {
        self.schema_filter = value;
        self
    }

    pub fn table_filter(mut self, value: ObjectFilter) -> Self {
        self.table_filter = value;
        self
    }

    pub fn user_filter(mut self, value: UserFilter) -> Self {
        self.user_filter = value;
        self
    }

    pub fn table_where(mut self, value: HashMap<String, String>) -> Self {
        self.table_where = value;
        self
    }

    pub fn ddl_only(mut self, value: bool) -> Self {
        self.ddl_only = value;
        self
    }

    pub fn data_only(mut self, value: bool) -> Self {
        self.data_only = value;
        self
    }

    pub fn tz_utc(mut self, value: bool) -> Self {
        self.tz_utc = value;
        self
    }

    pub fn ocimds(mut self, value: bool) -> Self {
        self.ocimds = value;
        if value {
            self.force_innodb = true;
            self.strip_definers = true;
            self.create_invisible_pks = true;
        }
        self
    }

    /// Runs every cross-field and range check needed before any session
    /// is opened or output directory created.
    pub fn build(self) -> Result<Self> {
        validate_bytes_per_chunk(self.bytes_per_chunk)?;
        if self.threads == 0 {
            bail!("threads must be >= 1");
        }
        if matches!(self.dialect, Dialect::Table) {
            bail!("dialect 'table' cannot be used for chunked data files; it is preview-only");
        }
        if self.ddl_only && self.data_only {
            bail!("ddlOnly and dataOnly are mutually exclusive");
        }
        Ok(self)
    }
}

/// Shared by `load_dump`/`import_table`.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub input_root: PathBuf,
    pub threads: usize,
    pub background_threads: usize,
    pub defer_table_indexes: bool,
    pub handle_grant_errors: GrantErrorPolicy,
    pub skip_binlog: bool,
    pub wait_dump_timeout: Duration,
    pub max_bytes_per_transaction: u64,
    pub analyze_tables: bool,
    pub load_users: bool,
    /// `resetProgress`: delete the progress log before scheduling. The
    /// database itself is never rolled back — the caller is
    /// responsible for dropping previously-loaded objects.
    pub reset_progress: bool,
    /// Refuses to load a dump whose manifest lacks the `ocimds` flag;
    /// set when the load target is a managed MySQL service.
    pub require_ocimds: bool,
}

impl LoadOptions {
    pub fn new(input_root: impl Into<PathBuf>) -> Self {
        Self {
            input_root: input_root.into(),
            threads: DEFAULT_THREADS,
            background_threads: 4,
            defer_table_indexes: false,
            handle_grant_errors: GrantErrorPolicy::Abort,
            skip_binlog: true,
            wait_dump_timeout: Duration::from_secs(0),
            max_bytes_per_transaction: 0,
            analyze_tables: false,
            load_users: false,
            reset_progress: false,
            require_ocimds: false,
        }
    }

    pub fn require_ocimds(mut self, value: bool) -> Self {
        self.require_ocimds = value;
        self
    }

    pub fn reset_progress(mut self, value: bool) -> Self {
        self.reset_progress = value;
        self
    }

    pub fn threads(mut self, value: usize) -> Self {
        self.threads = value;
        self
    }

    pub fn background_threads(mut self, value: usize) -> Self {
        self.background_threads = value;
        self
    }

    pub fn defer_table_indexes(mut self, value: bool) -> Self {
        self.defer_table_indexes = value;
        self
    }

    pub fn handle_grant_errors(mut self, value: GrantErrorPolicy) -> Self {
        self.handle_grant_errors = value;
        self
    }

    pub fn wait_dump_timeout(mut self, value: Duration) -> Self {
        self.wait_dump_timeout = value;
        self
    }

    pub fn max_bytes_per_transaction(mut self, value: u64) -> Self {
        self.max_bytes_per_transaction = value;
        self
    }

    pub fn build(self) -> Result<Self> {
        if self.threads == 0 {
            bail!("threads must be >= 1");
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ocimds_forces_dependent_flags() {
        let opts = DumpOptions::new("/tmp/out").ocimds(true).build().unwrap();
        assert!(opts.force_innodb);
        assert!(opts.strip_definers);
        assert!(opts.create_invisible_pks);
    }

    #[test]
    fn rejects_tiny_bytes_per_chunk() {
        let opts = DumpOptions::new("/tmp/out").bytes_per_chunk(1024);
        assert!(opts.build().is_err());
    }

    #[test]
    fn rejects_table_dialect_for_chunked_data() {
        let opts = DumpOptions::new("/tmp/out").dialect(Dialect::Table);
        assert!(opts.build().is_err());
    }

    #[test]
    fn zero_threads_rejected_for_load() {
        let opts = LoadOptions::new("/tmp/in").threads(0);
        assert!(opts.build().is_err());
    }

    #[test]
    fn ddl_only_and_data_only_are_mutually_exclusive() {
        let opts = DumpOptions::new("/tmp/out").ddl_only(true).data_only(true);
        assert!(opts.build().is_err());
    }

    #[test]
    fn ddl_only_alone_is_accepted() {
        let opts = DumpOptions::new("/tmp/out").ddl_only(true);
        assert!(opts.build().is_ok());
    }

    #[test]
    fn consistency_auto_falls_back_without_reload_privilege() {
        assert_eq!(
            ConsistencyChoice::Auto.resolve(false),
            LockMethod::LockTables
        );
        assert_eq!(
            ConsistencyChoice::Auto.resolve(true),
            LockMethod::FlushTablesWithReadLock
        );
    }
}
