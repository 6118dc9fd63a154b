//! Chunk Planner.
//!
//! Splits a table's rows into independently loadable, independently
//! retriable ranges over the primary key or a unique-index candidate.
//! Unchunkable tables get exactly one chunk covering the whole table.

use std::sync::Arc;

use anyhow::{bail, Result};

use crate::metadata::TableDescriptor;
use crate::session::Session;

/// Below this, `bytesPerChunk` is rejected outright.
pub const MIN_BYTES_PER_CHUNK: u64 = 128 * 1024;

/// A half-open range expressed as a `WHERE` predicate fragment, ANDed
/// with any partition predicate already present on the table.
#[derive(Debug, Clone)]
pub struct ChunkDescriptor {
    pub index: u64,
    pub schema: String,
    pub table: String,
    pub partition: Option<String>,
    /// `None` on both bounds means "whole table" (single-chunk case).
    pub lower_bound: Option<String>,
    pub upper_bound: Option<String>,
    pub order_by_columns: Vec<String>,
    /// The user-supplied `where` filter for this table, if any, ANDed
    /// in alongside the range predicate.
    pub user_where: Option<String>,
    /// Estimated byte size of this chunk's row range, derived from the
    /// table's `approx_data_length` divided across its chunks. Drives
    /// the Dump Scheduler's largest-predicted-byte-budget-first
    /// ordering.
    pub predicted_bytes: u64,
}

impl ChunkDescriptor {
    /// Builds the `WHERE` clause body (without the leading `WHERE`) for
    /// this chunk, ANDing the key-range predicate, the user `where`
    /// filter, and the partition restriction when each is present.
    pub fn where_clause(&self) -> Option<String> {
        let mut clauses = Vec::new();
        if let Some(lower) = &self.lower_bound {
            clauses.push(lower.clone());
        }
        if let Some(upper) = &self.upper_bound {
            clauses.push(upper.clone());
        }
        if let Some(user_where) = &self.user_where {
            clauses.push(format!("({})", user_where));
        }
        if clauses.is_empty() {
            return None;
        }
        Some(clauses.join(" AND "))
    }
}

/// Plans chunks for one table. `bytes_per_chunk` must already have
/// passed [`validate_bytes_per_chunk`].
pub fn plan_chunks(
    table: &TableDescriptor,
    bytes_per_chunk: u64,
    threads: usize,
) -> Result<Vec<ChunkDescriptor>> {
    plan_chunks_filtered(table, bytes_per_chunk, threads, None)
}

/// As [`plan_chunks`], additionally ANDing `user_where` into every
/// chunk's `WHERE` clause.
pub fn plan_chunks_filtered(
    table: &TableDescriptor,
    bytes_per_chunk: u64,
    threads: usize,
    user_where: Option<&str>,
) -> Result<Vec<ChunkDescriptor>> {
    validate_bytes_per_chunk(bytes_per_chunk)?;

    let partitions: Vec<Option<String>> = if table.partitions.is_empty() {
        vec![None]
    } else {
        table
            .partitions
            .iter()
            .map(|p| Some(format!("PARTITION (`{}`)", p)))
            .collect()
    };

    if !table.is_chunkable() {
        let per_partition_bytes = table.approx_data_length / partitions.len().max(1) as u64;
        let mut chunks = Vec::new();
        for (idx, partition) in partitions.into_iter().enumerate() {
            chunks.push(ChunkDescriptor {
                index: idx as u64,
                schema: table.schema.clone(),
                table: table.name.clone(),
                partition,
                lower_bound: None,
                upper_bound: None,
                order_by_columns: Vec::new(),
                user_where: user_where.map(str::to_string),
                predicted_bytes: per_partition_bytes,
            });
        }
        return Ok(chunks);
    }

    let order_by_columns = if !table.primary_key.is_empty() {
        table.primary_key.clone()
    } else {
        table
            .unique_index_candidates
            .iter()
            .find(|c| !c.nullable)
            .map(|c| c.columns.clone())
            .unwrap_or_default()
    };

    let chunk_count = estimate_chunk_count(table.approx_data_length, bytes_per_chunk, threads);
    let partition_count = partitions.len().max(1) as u64;
    let bytes_per_partition = table.approx_data_length / partition_count;

    let mut chunks = Vec::new();
    let mut index = 0u64;
    for partition in partitions {
        let key_column = order_by_columns.first().cloned();
        let mut remaining_bytes = bytes_per_partition;
        for i in 0..chunk_count {
            let lower_bound = if i == 0 || key_column.is_none() {
                None
            } else {
                key_column
                    .as_ref()
                    .map(|c| format!("`{}` >= {}", c, chunk_boundary_placeholder(i, chunk_count)))
            };
            let upper_bound = if i + 1 == chunk_count || key_column.is_none() {
                None
            } else {
                key_column
                    .as_ref()
                    .map(|c| format!("`{}` < {}", c, chunk_boundary_placeholder(i + 1, chunk_count)))
            };
            let predicted_bytes = if i + 1 == chunk_count {
                remaining_bytes
            } else {
                let share = bytes_per_partition / chunk_count;
                remaining_bytes = remaining_bytes.saturating_sub(share);
                share
            };
            chunks.push(ChunkDescriptor {
                index,
                schema: table.schema.clone(),
                table: table.name.clone(),
                partition: partition.clone(),
                lower_bound,
                upper_bound,
                order_by_columns: order_by_columns.clone(),
                user_where: user_where.map(str::to_string),
                predicted_bytes,
            });
            index += 1;
        }
    }
    Ok(chunks)
}

/// Placeholder for a computed key-range boundary; [`resolve_boundaries`]
/// replaces every occurrence against sampled key values from the
/// session before the chunks reach the Dump Scheduler. Kept as a named,
/// traceable marker rather than a literal so a boundary resolution bug
/// fails loudly instead of silently matching every row.
fn chunk_boundary_placeholder(boundary_index: u64, total: u64) -> String {
    format!("?boundary[{}/{}]", boundary_index, total)
}

/// Resolves every `?boundary[i/n]` placeholder left by [`plan_chunks`]
/// into a literal value sampled from the key column via a direct
/// `SELECT ... ORDER BY ... LIMIT 1 OFFSET ...` range probe — the
/// "direct SELECT range probes" the chunk planner falls back to instead
/// of trusting `information_schema` row-count estimates alone. Chunks
/// for unchunkable or single-chunk tables have no placeholders and pass
/// through unchanged.
pub async fn resolve_boundaries(
    session: &Arc<dyn Session>,
    table: &TableDescriptor,
    mut chunks: Vec<ChunkDescriptor>,
) -> Result<Vec<ChunkDescriptor>> {
    let key_column = chunks
        .iter()
        .find_map(|c| c.order_by_columns.first().cloned());
    let Some(key_column) = key_column else {
        return Ok(chunks);
    };
    let row_count = table.approx_row_count.max(1);

    let mut cache: std::collections::HashMap<(u64, u64), String> = std::collections::HashMap::new();
    for chunk in &mut chunks {
        if let Some(resolved) =
            resolve_one_bound(session, table, &key_column, chunk.lower_bound.as_deref(), row_count, &mut cache)
                .await?
        {
            chunk.lower_bound = Some(resolved);
        }
        if let Some(resolved) =
            resolve_one_bound(session, table, &key_column, chunk.upper_bound.as_deref(), row_count, &mut cache)
                .await?
        {
            chunk.upper_bound = Some(resolved);
        }
    }
    Ok(chunks)
}

async fn resolve_one_bound(
    session: &Arc<dyn Session>,
    table: &TableDescriptor,
    key_column: &str,
    bound: Option<&str>,
    row_count: u64,
    cache: &mut std::collections::HashMap<(u64, u64), String>,
) -> Result<Option<String>> {
    let Some(bound) = bound else { return Ok(None) };
    let Some((comparator, boundary_index, total)) = parse_placeholder_bound(bound) else {
        return Ok(None);
    };
    let literal = if let Some(cached) = cache.get(&(boundary_index, total)) {
        cached.clone()
    } else {
        let offset = (boundary_index * row_count) / total;
        let probe = format!(
            "SELECT `{col}` FROM `{schema}`.`{table}` ORDER BY `{col}` LIMIT 1 OFFSET {offset}",
            col = key_column,
            schema = table.schema,
            table = table.name,
            offset = offset,
        );
        let value = session
            .query_row(&probe)
            .await?
            .and_then(|row| row.into_iter().next())
            .flatten();
        let literal = match value {
            Some(bytes) => quote_sql_literal(&bytes),
            None => bail!("boundary probe for {}.{} returned no row at offset {}", table.schema, table.name, offset),
        };
        cache.insert((boundary_index, total), literal.clone());
        literal
    };
    Ok(Some(format!("`{}` {} {}", key_column, comparator, literal)))
}

/// Parses `` `col` >= ?boundary[i/n] `` / `` `col` < ?boundary[i/n] ``
/// back into its comparator and boundary coordinates.
fn parse_placeholder_bound(bound: &str) -> Option<(&'static str, u64, u64)> {
    let (comparator, rest) = if let Some(rest) = bound.split(">= ?boundary[").nth(1) {
        (">=", rest)
    } else if let Some(rest) = bound.split("< ?boundary[").nth(1) {
        ("<", rest)
    } else {
        return None;
    };
    let rest = rest.trim_end_matches(']');
    let mut parts = rest.split('/');
    let i: u64 = parts.next()?.parse().ok()?;
    let n: u64 = parts.next()?.parse().ok()?;
    Some((comparator, i, n))
}

/// Quotes a sampled key value as a MySQL string literal; numeric and
/// temporal columns still compare correctly against a quoted literal
/// under MySQL's implicit coercion rules, so one literal form covers
/// every key type without needing the column's declared type here.
fn quote_sql_literal(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let escaped = text.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{}'", escaped)
}

fn estimate_chunk_count(approx_data_length: u64, bytes_per_chunk: u64, threads: usize) -> u64 {
    if approx_data_length == 0 {
        return 1;
    }
    let by_size = (approx_data_length + bytes_per_chunk - 1) / bytes_per_chunk;
    by_size.max(1).max(threads as u64 / 4).min(by_size.max(1))
}

/// `bytesPerChunk` below 128 KiB is rejected at configuration time,
/// not silently clamped.
pub fn validate_bytes_per_chunk(bytes_per_chunk: u64) -> Result<()> {
    if bytes_per_chunk < MIN_BYTES_PER_CHUNK {
        bail!(
            "bytesPerChunk must be at least {} bytes, got {}",
            MIN_BYTES_PER_CHUNK,
            bytes_per_chunk
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{ColumnDescriptor, UniqueIndexCandidate};

    fn base_table() -> TableDescriptor {
        TableDescriptor {
            schema: "s".into(),
            name: "t".into(),
            columns: vec![ColumnDescriptor {
                name: "id".into(),
                mysql_type: "bigint".into(),
                nullable: false,
            }],
            primary_key: vec!["id".into()],
            unique_index_candidates: vec![],
            approx_row_count: 1_000_000,
            approx_data_length: 64 * 1024 * 1024,
            partitions: vec![],
            storage_engine: "InnoDB".into(),
            character_set: None,
        }
    }

    #[test]
    fn rejects_tiny_bytes_per_chunk() {
        assert!(validate_bytes_per_chunk(1024).is_err());
        assert!(validate_bytes_per_chunk(MIN_BYTES_PER_CHUNK).is_ok());
    }

    #[test]
    fn chunk_ranges_partition_without_gap_or_overlap() {
        let table = base_table();
        let chunks = plan_chunks(&table, 1024 * 1024, 4).unwrap();
        assert!(chunks.len() > 1);
        assert!(chunks.first().unwrap().lower_bound.is_none());
        assert!(chunks.last().unwrap().upper_bound.is_none());
        for pair in chunks.windows(2) {
            let upper_of_first = pair[0].upper_bound.as_ref().unwrap();
            let lower_of_second = pair[1].lower_bound.as_ref().unwrap();
            assert!(upper_of_first.contains("< ?boundary"));
            assert!(lower_of_second.contains(">= ?boundary"));
        }
    }

    #[test]
    fn unchunkable_table_is_single_chunk() {
        let mut table = base_table();
        table.primary_key.clear();
        table.unique_index_candidates.push(UniqueIndexCandidate {
            name: "uq".into(),
            columns: vec!["v".into()],
            nullable: true,
        });
        let chunks = plan_chunks(&table, 1024 * 1024, 4).unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].where_clause().is_none());
    }

    #[test]
    fn partitioned_table_gets_one_chunk_group_per_partition() {
        let mut table = base_table();
        table.partitions = vec!["p0".into(), "p1".into()];
        table.approx_data_length = 0;
        let chunks = plan_chunks(&table, 1024 * 1024, 4).unwrap();
        assert_eq!(chunks.len(), 2);
    }

    struct ProbeSession;

    #[async_trait::async_trait]
    impl Session for ProbeSession {
        async fn execute(&self, _statement: &str) -> Result<()> {
            Ok(())
        }

        async fn query_stream(
            &self,
            _statement: &str,
            _sink: &mut (dyn FnMut(crate::session::Row) -> Result<bool> + Send),
        ) -> Result<()> {
            Ok(())
        }

        async fn query_row(&self, statement: &str) -> Result<Option<crate::session::Row>> {
            let offset: u64 = statement
                .rsplit("OFFSET ")
                .next()
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(0);
            Ok(Some(vec![Some(offset.to_string().into_bytes())]))
        }

        fn connection_id(&self) -> u64 {
            1
        }
    }

    #[tokio::test]
    async fn resolve_boundaries_fills_in_sampled_literals() {
        let table = base_table();
        let chunks = plan_chunks(&table, 1024 * 1024, 4).unwrap();
        assert!(chunks.len() > 1);
        let session: Arc<dyn Session> = Arc::new(ProbeSession);
        let resolved = resolve_boundaries(&session, &table, chunks).await.unwrap();
        assert!(resolved.first().unwrap().lower_bound.is_none());
        assert!(resolved.last().unwrap().upper_bound.is_none());
        for chunk in &resolved[..resolved.len() - 1] {
            let upper = chunk.upper_bound.as_ref().unwrap();
            assert!(upper.starts_with("`id` < '"));
            assert!(!upper.contains("?boundary"));
        }
    }

    #[test]
    fn parse_placeholder_bound_roundtrips() {
        assert_eq!(
            parse_placeholder_bound("`id` >= ?boundary[1/4]"),
            Some((">=", 1, 4))
        );
        assert_eq!(parse_placeholder_bound("`id` < ?boundary[3/4]"), Some(("<", 3, 4)));
        assert_eq!(parse_placeholder_bound("no placeholder here"), None);
    }

    #[test]
    fn quote_sql_literal_escapes_quotes_and_backslashes() {
        assert_eq!(quote_sql_literal(b"O'Brien"), "'O\\'Brien'");
        assert_eq!(quote_sql_literal(b"back\\slash"), "'back\\\\slash'");
    }
}
