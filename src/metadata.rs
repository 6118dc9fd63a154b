//! Metadata Scanner.
//!
//! Enumerates, in a single snapshot-bound session, the schemas, tables,
//! views, routines, triggers, events and users to be dumped. DDL text
//! comes from `SHOW CREATE ...`; the `Session` trait is the opaque
//! capability this issues statements against.

use std::sync::Arc;

use anyhow::{bail, Result};

use crate::session::Session;
use crate::tools::split_dotted;

/// Schemas always excluded regardless of filters.
pub const ALWAYS_EXCLUDED_SCHEMAS: &[&str] = &[
    "information_schema",
    "mysql",
    "ndbinfo",
    "performance_schema",
    "sys",
];

/// Tables always excluded regardless of filters.
pub const ALWAYS_EXCLUDED_TABLES: &[&str] = &[
    "mysql.apply_status",
    "mysql.general_log",
    "mysql.schema",
    "mysql.slow_log",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Table,
    View,
    Routine,
    Trigger,
    Event,
    User,
    Grant,
}

/// Immutable once scanned.
#[derive(Debug, Clone)]
pub struct SchemaObject {
    pub schema: String,
    pub name: String,
    pub kind: ObjectKind,
    pub ddl: String,
    /// Other objects (by qualified name) this one references; used by
    /// the Load Scheduler to build the topological DDL order.
    pub depends_on: Vec<String>,
}

impl SchemaObject {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// Fixed at scan time.
#[derive(Debug, Clone)]
pub struct TableDescriptor {
    pub schema: String,
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
    pub primary_key: Vec<String>,
    pub unique_index_candidates: Vec<UniqueIndexCandidate>,
    pub approx_row_count: u64,
    pub approx_data_length: u64,
    pub partitions: Vec<String>,
    pub storage_engine: String,
    pub character_set: Option<String>,
}

impl TableDescriptor {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    /// Chunkable iff there is a primary key or a non-nullable unique
    /// index.
    pub fn is_chunkable(&self) -> bool {
        !self.primary_key.is_empty()
            || self.unique_index_candidates.iter().any(|c| !c.nullable)
    }
}

#[derive(Debug, Clone)]
pub struct ColumnDescriptor {
    pub name: String,
    pub mysql_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone)]
pub struct UniqueIndexCandidate {
    pub name: String,
    pub columns: Vec<String>,
    pub nullable: bool,
}

/// `includeX`/`excludeX` filter sets, dotted identifiers. Exclude is
/// stronger than include when both name the same object.
#[derive(Debug, Clone, Default)]
pub struct ObjectFilter {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl ObjectFilter {
    /// `qualified` is `schema` or `schema.object`.
    pub fn allows(&self, qualified: &str) -> bool {
        let (schema, obj) = split_dotted(qualified);

        let matches = |pattern: &str| -> bool {
            let (p_schema, p_obj) = split_dotted(pattern);
            if p_schema != schema {
                return false;
            }
            match (&p_obj, &obj) {
                (None, _) => true,
                (Some(po), Some(o)) => po == o,
                (Some(_), None) => false,
            }
        };

        if self.exclude.iter().any(|p| matches(p)) {
            return false;
        }
        if self.include.is_empty() {
            return true;
        }
        self.include.iter().any(|p| matches(p))
    }
}

/// Users filter: `user` or `'user'@'host'`; omitted host matches all
/// hosts.
#[derive(Debug, Clone, Default)]
pub struct UserFilter {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

/// One `mysql.user` row's identity and auth-eligibility facts.
#[derive(Debug, Clone)]
pub struct AccountInfo {
    pub user: String,
    pub host: String,
    pub has_password: bool,
    pub auth_plugin: Option<String>,
}

impl AccountInfo {
    pub fn qualified(&self) -> String {
        format!("'{}'@'{}'", self.user, self.host)
    }
}

fn parse_user_spec(spec: &str) -> (String, Option<String>) {
    if let Some((user, host)) = spec.split_once('@') {
        (
            user.trim_matches('\'').to_string(),
            Some(host.trim_matches('\'').to_string()),
        )
    } else {
        (spec.trim_matches('\'').to_string(), None)
    }
}

impl UserFilter {
    pub fn allows(&self, user: &str, host: &str) -> bool {
        let matches = |spec: &str| -> bool {
            let (u, h) = parse_user_spec(spec);
            u == user && h.map(|h| h == host).unwrap_or(true)
        };
        if self.exclude.iter().any(|s| matches(s)) {
            return false;
        }
        if self.include.is_empty() {
            return true;
        }
        self.include.iter().any(|s| matches(s))
    }
}

/// Scans a single snapshot-bound session for the objects to dump.
pub struct MetadataScanner<'a> {
    session: &'a Arc<dyn Session>,
}

impl<'a> MetadataScanner<'a> {
    pub fn new(session: &'a Arc<dyn Session>) -> Self {
        Self { session }
    }

    /// Object-name character set must be `latin1` or `utf8`, else the
    /// scan fails fatally.
    pub async fn check_names_charset(&self) -> Result<()> {
        let row = self
            .session
            .query_row("SHOW VARIABLES LIKE 'character_set_system'")
            .await?;
        if let Some(row) = row {
            if let Some(Some(bytes)) = row.get(1) {
                let value = String::from_utf8_lossy(bytes);
                if value != "latin1" && value != "utf8" {
                    bail!(
                        "unsupported character_set_system '{}': must be latin1 or utf8",
                        value
                    );
                }
            }
        }
        Ok(())
    }

    /// Returns the schema names visible under `filter`, excluding the
    /// always-excluded system schemas.
    pub async fn list_schemas(&self, filter: &ObjectFilter) -> Result<Vec<String>> {
        let mut names = Vec::new();
        self.session
            .query_stream("SELECT schema_name FROM information_schema.schemata", &mut |row| {
                if let Some(Some(bytes)) = row.first() {
                    let name = String::from_utf8_lossy(bytes).into_owned();
                    if !ALWAYS_EXCLUDED_SCHEMAS.contains(&name.as_str()) && filter.allows(&name) {
                        names.push(name);
                    }
                }
                Ok(true)
            })
            .await?;
        Ok(names)
    }

    /// Fetches `SHOW CREATE TABLE` DDL for `schema.table`.
    pub async fn table_ddl(&self, schema: &str, table: &str) -> Result<String> {
        let row = self
            .session
            .query_row(&format!("SHOW CREATE TABLE `{}`.`{}`", schema, table))
            .await?
            .ok_or_else(|| anyhow::anyhow!("SHOW CREATE TABLE returned no rows for {}.{}", schema, table))?;
        let ddl = row
            .get(1)
            .and_then(|c| c.as_ref())
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .ok_or_else(|| anyhow::anyhow!("SHOW CREATE TABLE missing DDL column"))?;
        Ok(ddl)
    }

    fn excluded_table(schema: &str, table: &str) -> bool {
        let qualified = format!("{}.{}", schema, table);
        ALWAYS_EXCLUDED_TABLES.contains(&qualified.as_str())
    }

    /// Enumerates base tables in `schema`, applying `filter` and the
    /// always-excluded table list.
    pub async fn list_tables(&self, schema: &str, filter: &ObjectFilter) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let query = format!(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = '{}' AND table_type = 'BASE TABLE'",
            schema
        );
        self.session
            .query_stream(&query, &mut |row| {
                if let Some(Some(bytes)) = row.first() {
                    let name = String::from_utf8_lossy(bytes).into_owned();
                    let qualified = format!("{}.{}", schema, name);
                    if !Self::excluded_table(schema, &name) && filter.allows(&qualified) {
                        names.push(name);
                    }
                }
                Ok(true)
            })
            .await?;
        Ok(names)
    }

    /// Builds the [`TableDescriptor`] the Chunk Planner needs: column
    /// shape, primary key, unique-index candidates, and the
    /// approximate row count/data length `information_schema` reports.
    pub async fn table_descriptor(&self, schema: &str, table: &str) -> Result<TableDescriptor> {
        let mut engine = String::from("InnoDB");
        let mut approx_row_count = 0u64;
        let mut approx_data_length = 0u64;
        let mut character_set = None;
        if let Some(row) = self
            .session
            .query_row(&format!(
                "SELECT engine, table_rows, data_length, \
                 (SELECT ccsa.character_set_name FROM information_schema.collation_character_set_applicability ccsa \
                  WHERE ccsa.collation_name = t.table_collation) \
                 FROM information_schema.tables t \
                 WHERE table_schema = '{}' AND table_name = '{}'",
                schema, table
            ))
            .await?
        {
            engine = col_text(&row, 0).unwrap_or_else(|| "InnoDB".to_string());
            approx_row_count = col_text(&row, 1).and_then(|s| s.parse().ok()).unwrap_or(0);
            approx_data_length = col_text(&row, 2).and_then(|s| s.parse().ok()).unwrap_or(0);
            character_set = col_text(&row, 3);
        }

        let mut columns = Vec::new();
        self.session
            .query_stream(
                &format!(
                    "SELECT column_name, column_type, is_nullable FROM information_schema.columns \
                     WHERE table_schema = '{}' AND table_name = '{}' ORDER BY ordinal_position",
                    schema, table
                ),
                &mut |row| {
                    if let Some(name) = col_text(&row, 0) {
                        columns.push(ColumnDescriptor {
                            name,
                            mysql_type: col_text(&row, 1).unwrap_or_default(),
                            nullable: col_text(&row, 2).as_deref() == Some("YES"),
                        });
                    }
                    Ok(true)
                },
            )
            .await?;

        let mut index_columns: Vec<(String, String, bool, bool)> = Vec::new();
        self.session
            .query_stream(
                &format!(
                    "SELECT s.index_name, s.column_name, s.non_unique, c.is_nullable \
                     FROM information_schema.statistics s \
                     JOIN information_schema.columns c \
                       ON c.table_schema = s.table_schema AND c.table_name = s.table_name AND c.column_name = s.column_name \
                     WHERE s.table_schema = '{}' AND s.table_name = '{}' \
                     ORDER BY s.index_name, s.seq_in_index",
                    schema, table
                ),
                &mut |row| {
                    if let Some(index_name) = col_text(&row, 0) {
                        index_columns.push((
                            index_name,
                            col_text(&row, 1).unwrap_or_default(),
                            col_text(&row, 2).as_deref() == Some("0"),
                            col_text(&row, 3).as_deref() == Some("YES"),
                        ));
                    }
                    Ok(true)
                },
            )
            .await?;

        let mut primary_key = Vec::new();
        let mut candidates: std::collections::BTreeMap<String, (Vec<String>, bool)> =
            std::collections::BTreeMap::new();
        for (index_name, column, is_unique, nullable) in index_columns {
            if !is_unique {
                continue;
            }
            if index_name.eq_ignore_ascii_case("PRIMARY") {
                primary_key.push(column);
                continue;
            }
            let entry = candidates.entry(index_name.clone()).or_insert((Vec::new(), false));
            entry.0.push(column);
            entry.1 |= nullable;
        }
        let unique_index_candidates = candidates
            .into_iter()
            .map(|(name, (columns, nullable))| UniqueIndexCandidate {
                name,
                columns,
                nullable,
            })
            .collect();

        let mut partitions = Vec::new();
        self.session
            .query_stream(
                &format!(
                    "SELECT partition_name FROM information_schema.partitions \
                     WHERE table_schema = '{}' AND table_name = '{}' AND partition_name IS NOT NULL",
                    schema, table
                ),
                &mut |row| {
                    if let Some(name) = col_text(&row, 0) {
                        partitions.push(name);
                    }
                    Ok(true)
                },
            )
            .await?;

        Ok(TableDescriptor {
            schema: schema.to_string(),
            name: table.to_string(),
            columns,
            primary_key,
            unique_index_candidates,
            approx_row_count,
            approx_data_length,
            partitions,
            storage_engine: engine,
            character_set,
        })
    }

    /// Enumerates views in `schema` (scanned after base tables so view
    /// DDL may reference them).
    pub async fn list_views(&self, schema: &str, filter: &ObjectFilter) -> Result<Vec<String>> {
        self.list_named(
            &format!(
                "SELECT table_name FROM information_schema.views WHERE table_schema = '{}'",
                schema
            ),
            schema,
            filter,
        )
        .await
    }

    pub async fn view_ddl(&self, schema: &str, view: &str) -> Result<String> {
        self.show_create(&format!("SHOW CREATE VIEW `{}`.`{}`", schema, view), 1)
            .await
    }

    /// Enumerates stored procedures and functions in `schema`.
    pub async fn list_routines(&self, schema: &str, filter: &ObjectFilter) -> Result<Vec<(String, String)>> {
        let mut out = Vec::new();
        self.session
            .query_stream(
                &format!(
                    "SELECT routine_name, routine_type FROM information_schema.routines \
                     WHERE routine_schema = '{}'",
                    schema
                ),
                &mut |row| {
                    if let Some(name) = col_text(&row, 0) {
                        let kind = col_text(&row, 1).unwrap_or_default();
                        let qualified = format!("{}.{}", schema, name);
                        if filter.allows(&qualified) {
                            out.push((name, kind));
                        }
                    }
                    Ok(true)
                },
            )
            .await?;
        Ok(out)
    }

    pub async fn routine_ddl(&self, schema: &str, routine: &str, routine_type: &str) -> Result<String> {
        self.show_create(
            &format!("SHOW CREATE {} `{}`.`{}`", routine_type, schema, routine),
            2,
        )
        .await
    }

    /// Enumerates triggers in `schema` (scanned after base tables).
    pub async fn list_triggers(&self, schema: &str, filter: &ObjectFilter) -> Result<Vec<String>> {
        self.list_named(
            &format!(
                "SELECT trigger_name FROM information_schema.triggers WHERE trigger_schema = '{}'",
                schema
            ),
            schema,
            filter,
        )
        .await
    }

    pub async fn trigger_ddl(&self, schema: &str, trigger: &str) -> Result<String> {
        self.show_create(&format!("SHOW CREATE TRIGGER `{}`.`{}`", schema, trigger), 2)
            .await
    }

    /// Enumerates scheduled events in `schema`.
    pub async fn list_events(&self, schema: &str, filter: &ObjectFilter) -> Result<Vec<String>> {
        self.list_named(
            &format!(
                "SELECT event_name FROM information_schema.events WHERE event_schema = '{}'",
                schema
            ),
            schema,
            filter,
        )
        .await
    }

    pub async fn event_ddl(&self, schema: &str, event: &str) -> Result<String> {
        self.show_create(&format!("SHOW CREATE EVENT `{}`.`{}`", schema, event), 3)
            .await
    }

    /// Enumerates accounts from `mysql.user`, applying `filter`, along
    /// with whether each has a password set and which auth plugin it
    /// uses — the facts `skipInvalidAccounts` needs to judge an
    /// account's validity.
    pub async fn list_users(&self, filter: &UserFilter) -> Result<Vec<AccountInfo>> {
        let mut out = Vec::new();
        self.session
            .query_stream(
                "SELECT user, host, authentication_string, plugin FROM mysql.user",
                &mut |row| {
                    if let (Some(user), Some(host)) = (col_text(&row, 0), col_text(&row, 1)) {
                        if filter.allows(&user, &host) {
                            let has_password = col_text(&row, 2).map(|s| !s.is_empty()).unwrap_or(false);
                            let auth_plugin = col_text(&row, 3);
                            out.push(AccountInfo {
                                user,
                                host,
                                has_password,
                                auth_plugin,
                            });
                        }
                    }
                    Ok(true)
                },
            )
            .await?;
        Ok(out)
    }

    pub async fn user_grants(&self, user: &str, host: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        self.session
            .query_stream(
                &format!("SHOW GRANTS FOR `{}`@`{}`", user, host),
                &mut |row| {
                    if let Some(grant) = col_text(&row, 0) {
                        out.push(grant);
                    }
                    Ok(true)
                },
            )
            .await?;
        Ok(out)
    }

    async fn list_named(&self, query: &str, schema: &str, filter: &ObjectFilter) -> Result<Vec<String>> {
        let mut names = Vec::new();
        self.session
            .query_stream(query, &mut |row| {
                if let Some(name) = col_text(&row, 0) {
                    let qualified = format!("{}.{}", schema, name);
                    if filter.allows(&qualified) {
                        names.push(name);
                    }
                }
                Ok(true)
            })
            .await?;
        Ok(names)
    }

    /// Runs a `SHOW CREATE ...` statement and returns the DDL column at
    /// `ddl_column_index` (its position varies by object kind: 1 for
    /// `VIEW`/`TABLE`, 2 for routines/triggers, 3 for `EVENT`).
    async fn show_create(&self, statement: &str, ddl_column_index: usize) -> Result<String> {
        let row = self
            .session
            .query_row(statement)
            .await?
            .ok_or_else(|| anyhow::anyhow!("{} returned no rows", statement))?;
        col_text(&row, ddl_column_index)
            .ok_or_else(|| anyhow::anyhow!("{} missing DDL column", statement))
    }
}

/// Decodes column `index` of `row` as UTF-8 text, or `None` for SQL
/// `NULL` or a missing column.
fn col_text(row: &crate::session::Row, index: usize) -> Option<String> {
    row.get(index)
        .and_then(|c| c.as_ref())
        .map(|b| String::from_utf8_lossy(b).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclude_is_stronger_than_include() {
        let filter = ObjectFilter {
            include: vec!["s1".to_string()],
            exclude: vec!["s1.t1".to_string()],
        };
        assert!(filter.allows("s1.t2"));
        assert!(!filter.allows("s1.t1"));
    }

    #[test]
    fn include_empty_means_allow_all() {
        let filter = ObjectFilter::default();
        assert!(filter.allows("any.thing"));
    }

    #[test]
    fn user_filter_defaults_host_to_any() {
        let filter = UserFilter {
            include: vec!["'app'".to_string()],
            exclude: vec![],
        };
        assert!(filter.allows("app", "10.0.0.1"));
        assert!(filter.allows("app", "%"));
        assert!(!filter.allows("root", "%"));
    }

    #[test]
    fn user_filter_host_specific() {
        let filter = UserFilter {
            include: vec!["'app'@'10.0.0.1'".to_string()],
            exclude: vec![],
        };
        assert!(filter.allows("app", "10.0.0.1"));
        assert!(!filter.allows("app", "10.0.0.2"));
    }

    #[test]
    fn chunkable_requires_pk_or_nonnullable_unique() {
        let mut t = TableDescriptor {
            schema: "s".into(),
            name: "t".into(),
            columns: vec![],
            primary_key: vec![],
            unique_index_candidates: vec![],
            approx_row_count: 0,
            approx_data_length: 0,
            partitions: vec![],
            storage_engine: "InnoDB".into(),
            character_set: None,
        };
        assert!(!t.is_chunkable());
        t.unique_index_candidates.push(UniqueIndexCandidate {
            name: "uq".into(),
            columns: vec!["v".into()],
            nullable: true,
        });
        assert!(!t.is_chunkable());
        t.unique_index_candidates[0].nullable = false;
        assert!(t.is_chunkable());
    }
}
