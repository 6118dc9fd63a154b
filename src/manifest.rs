//! Manifest.
//!
//! The root descriptor of a dump: schema version, per-table chunk/DDL
//! artifact listing, completion flag, and (for `ociParManifest`) the
//! pre-authenticated-request URLs a loader needs instead of native
//! credentials.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::codec::Compression;
use crate::storage::StorageBackend;

pub const MANIFEST_NAME: &str = "@.manifest.json";

/// The only schema version this engine writes or accepts. Bumped when
/// the manifest's shape changes incompatibly; readers reject any other
/// value rather than guess at a migration: no forward/backward
/// migration is attempted, a version mismatch is simply fatal.
pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub path: String,
    pub chunk_index: u64,
    pub bytes: u64,
    pub rows: Option<u64>,
    pub compression: Compression,
    pub crc32: u32,
    /// Present only under `ociParManifest`; the pre-authenticated
    /// request URL a loader without native OCI credentials uses
    /// instead of `path`.
    pub par_url: Option<String>,
    pub par_expiration: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableManifestEntry {
    pub schema: String,
    pub table: String,
    pub ddl_path: String,
    pub chunks: Vec<Artifact>,
    pub chunking: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: u32,
    pub server_version: String,
    pub server_uuid: Option<String>,
    pub gtid_executed: Option<String>,
    pub binlog_file: Option<String>,
    pub binlog_position: Option<u64>,
    pub tables: Vec<TableManifestEntry>,
    pub users_path: Option<String>,
    pub dump_complete: bool,
    /// Set when the dump was produced with `ocimds=true`. A loader that
    /// requires MDS-compatible DDL refuses any dump where this is
    /// `false`.
    #[serde(default)]
    pub ocimds: bool,
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Manifest {
    pub fn new(server_version: String) -> Self {
        Self {
            schema_version: MANIFEST_SCHEMA_VERSION,
            server_version,
            server_uuid: None,
            gtid_executed: None,
            binlog_file: None,
            binlog_position: None,
            tables: Vec::new(),
            users_path: None,
            dump_complete: false,
            ocimds: false,
            extra: BTreeMap::new(),
        }
    }

    /// Fatal per §3: a loader that requires an MDS-compatible dump must
    /// refuse one whose manifest doesn't carry the `ocimds` flag.
    pub fn require_ocimds(&self) -> Result<()> {
        if !self.ocimds {
            bail!("dump was not produced with ocimds=true; refusing to load into a managed-service target");
        }
        Ok(())
    }

    pub fn validate_schema_version(&self) -> Result<()> {
        if self.schema_version != MANIFEST_SCHEMA_VERSION {
            bail!(
                "unsupported manifest schema version {} (this engine reads/writes version {} only)",
                self.schema_version,
                MANIFEST_SCHEMA_VERSION
            );
        }
        Ok(())
    }

    pub async fn write(&self, backend: &dyn StorageBackend) -> Result<()> {
        let json = serde_json::to_vec_pretty(self).context("serializing manifest")?;
        let mut stream = backend.open_write(MANIFEST_NAME).await?;
        stream.write_all(&json).await?;
        stream.close().await
    }

    pub async fn read(backend: &dyn StorageBackend) -> Result<Self> {
        let mut reader = backend
            .open_read(MANIFEST_NAME)
            .await
            .context("manifest missing or unreadable")?;
        let mut bytes = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut bytes).await?;
        let manifest: Manifest = serde_json::from_slice(&bytes).context("parsing manifest JSON")?;
        manifest.validate_schema_version()?;
        Ok(manifest)
    }

    pub fn table(&self, schema: &str, table: &str) -> Option<&TableManifestEntry> {
        self.tables
            .iter()
            .find(|t| t.schema == schema && t.table == table)
    }

    pub fn table_mut(&mut self, schema: &str, table: &str) -> Option<&mut TableManifestEntry> {
        self.tables
            .iter_mut()
            .find(|t| t.schema == schema && t.table == table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_manifest_is_not_complete() {
        let manifest = Manifest::new("8.0.34".to_string());
        assert!(!manifest.dump_complete);
        assert!(manifest.validate_schema_version().is_ok());
    }

    #[test]
    fn wrong_schema_version_is_rejected() {
        let mut manifest = Manifest::new("8.0.34".to_string());
        manifest.schema_version = 2;
        assert!(manifest.validate_schema_version().is_err());
    }

    #[test]
    fn require_ocimds_rejects_a_dump_without_the_flag() {
        let manifest = Manifest::new("8.0.34".to_string());
        assert!(manifest.require_ocimds().is_err());
        let mut flagged = manifest;
        flagged.ocimds = true;
        assert!(flagged.require_ocimds().is_ok());
    }

    #[test]
    fn table_lookup_by_qualified_name() {
        let mut manifest = Manifest::new("8.0.34".to_string());
        manifest.tables.push(TableManifestEntry {
            schema: "s".into(),
            table: "t".into(),
            ddl_path: "s/t.sql".into(),
            chunks: vec![],
            chunking: true,
        });
        assert!(manifest.table("s", "t").is_some());
        assert!(manifest.table("s", "missing").is_none());
    }
}
