//! Local filesystem storage backend.
//!
//! Files are created with mode `rw-r-----`, directories with
//! `rwxr-x---`. Follows the atomic write-then-rename pattern from
//! [`crate::tools`], adapted to async streaming rather than
//! whole-buffer writes.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use super::{BoxRead, ObjectInfo, StorageBackend, WriteStream};
use crate::tools::FILE_MODE;

pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn new(root: PathBuf) -> Result<Self> {
        Ok(Self { root })
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

struct FileWriteStream {
    file: tokio::fs::File,
}

#[async_trait]
impl WriteStream for FileWriteStream {
    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data).await.context("writing to local file")
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await.context("fsync on close")?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn open_read(&self, path: &str) -> Result<BoxRead> {
        let file = tokio::fs::File::open(self.resolve(path))
            .await
            .with_context(|| format!("opening {}", path))?;
        Ok(Box::pin(file))
    }

    async fn open_write(&self, path: &str) -> Result<Box<dyn WriteStream>> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&full)
            .await
            .with_context(|| format!("creating {:?}", full))?;
        file.set_permissions(std::fs::Permissions::from_mode(FILE_MODE))
            .await?;
        Ok(Box::new(FileWriteStream { file }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let base = self.resolve(prefix);
        let dir = base.parent().unwrap_or(&self.root);
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(
                base.file_name()
                    .map(|n| n.to_string_lossy())
                    .unwrap_or_default()
                    .as_ref(),
            ) {
                continue;
            }
            let meta = entry.metadata().await?;
            if meta.is_file() {
                out.push(ObjectInfo {
                    path: name,
                    size: meta.len(),
                });
            }
        }
        Ok(out)
    }

    async fn stat(&self, path: &str) -> Result<Option<ObjectInfo>> {
        let full = self.resolve(path);
        match tokio::fs::metadata(&full).await {
            Ok(meta) => Ok(Some(ObjectInfo {
                path: path.to_string(),
                size: meta.len(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let full = self.resolve(path);
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn supports_random_read(&self) -> bool {
        true
    }
}

/// Returns `true` when `dir` exists and has at least one entry, used by
/// [`crate::tools::create_empty_output_dir`]'s caller before starting a
/// dump.
pub fn dir_has_entries(dir: &Path) -> Result<bool> {
    match std::fs::read_dir(dir) {
        Ok(mut e) => Ok(e.next().is_some()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
