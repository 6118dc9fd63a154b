//! Storage Backend.
//!
//! A uniform object-I/O capability backing both the dump writer
//! and the load scheduler: open-read, open-write, list, stat,
//! remove, multipart finalize. Exactly one root backend is selected per
//! operation from [`StorageConfig`].
//!
//! Write streams are append-only and only durable after `close()`; read
//! streams are one-pass. Transient HTTP 5xx/throttling is retried with
//! bounded exponential backoff; 4xx and local `ENOSPC`/`EACCES` are
//! fatal.

use std::pin::Pin;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod azure;
pub mod file;
pub mod http;
pub mod oci;
pub mod s3;

/// Metadata about a stored object, as returned by `stat`/`list`.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub path: String,
    pub size: u64,
}

pub type BoxRead = Pin<Box<dyn AsyncRead + Send + Unpin>>;
pub type BoxWrite = Pin<Box<dyn AsyncWrite + Send + Unpin>>;

/// A write stream. Data is only guaranteed durable after [`close`] is
/// called; dropping without closing may discard buffered writes (e.g.
/// a PAR `PUT` or an unfinished multipart upload).
#[async_trait]
pub trait WriteStream: Send {
    async fn write_all(&mut self, data: &[u8]) -> Result<()>;
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Uniform object I/O capability. Implementations must be `Send + Sync`
/// so a single backend instance can be shared across worker tasks.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn open_read(&self, path: &str) -> Result<BoxRead>;
    async fn open_write(&self, path: &str) -> Result<Box<dyn WriteStream>>;
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;
    async fn stat(&self, path: &str) -> Result<Option<ObjectInfo>>;
    async fn remove(&self, path: &str) -> Result<()>;

    /// Whether `open_read` supports seeking to an arbitrary offset
    /// rather than only sequential one-pass reads. The loader only uses
    /// random reads when both this is true and the codec permits it.
    fn supports_random_read(&self) -> bool {
        false
    }
}

/// Which concrete backend an operation targets. Selected exactly once
/// per operation.
pub enum StorageConfig {
    File {
        root: std::path::PathBuf,
    },
    Http {
        url: url::Url,
        /// Set when the URL is itself a pre-authenticated request,
        /// enabling write via `PUT` (used by the loader reading a
        /// dumper-produced PAR manifest, and by dump targets that are
        /// themselves PARs).
        par_write: bool,
    },
    Oci(oci::OciConfig),
    S3(s3::S3Config),
    Azure(azure::AzureConfig),
}

impl StorageConfig {
    pub async fn build(self) -> Result<Box<dyn StorageBackend>> {
        match self {
            StorageConfig::File { root } => Ok(Box::new(file::FileBackend::new(root)?)),
            StorageConfig::Http { url, par_write } => {
                Ok(Box::new(http::HttpBackend::new(url, par_write)?))
            }
            StorageConfig::Oci(cfg) => Ok(Box::new(oci::OciBackend::new(cfg)?)),
            StorageConfig::S3(cfg) => Ok(Box::new(s3::S3Backend::new(cfg).await?)),
            StorageConfig::Azure(cfg) => Ok(Box::new(azure::AzureBackend::new(cfg)?)),
        }
    }
}

/// Bounded exponential backoff shared by every network-backed variant
/// for transient-I/O retries.
pub struct Backoff {
    attempt: u32,
    max_attempts: u32,
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            base: Duration::from_millis(200),
            max: Duration::from_secs(30),
        }
    }

    /// Returns the delay for the next retry, or `None` if attempts are
    /// exhausted (the caller should then surface the error as fatal).
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let exp = self.base.saturating_mul(1 << self.attempt.min(10));
        self.attempt += 1;
        Some(exp.min(self.max))
    }

    pub async fn sleep_next(&mut self) -> bool {
        match self.next_delay() {
            Some(d) => {
                tokio::time::sleep(d).await;
                true
            }
            None => false,
        }
    }
}

/// Classifies an HTTP status code the way every cloud backend's retry
/// loop does: 5xx and 429 are transient, everything else in the error
/// range is fatal.
pub fn is_transient_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_bounded() {
        let mut b = Backoff::new(3);
        assert!(b.next_delay().is_some());
        assert!(b.next_delay().is_some());
        assert!(b.next_delay().is_some());
        assert!(b.next_delay().is_none());
    }

    #[test]
    fn status_classification() {
        assert!(is_transient_status(503));
        assert!(is_transient_status(429));
        assert!(!is_transient_status(404));
        assert!(!is_transient_status(400));
    }
}
