//! Error taxonomy for the dump/restore engine.
//!
//! Internal components return [`EngineError`] so callers can match on
//! the taxonomy row (retry vs. fatal, grant-error policy, ...). Public
//! operations in [`crate::ops`] collapse everything into `anyhow::Error`
//! at the boundary, which is how the rest of the crate's dependents are
//! expected to consume it.

use thiserror::Error;

/// One variant per row of the error taxonomy table.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid option values, mutually exclusive flags, missing
    /// prerequisites. Always raised before any I/O.
    #[error("argument error: {0}")]
    Argument(String),

    /// No open session, missing privilege with no fallback, unsupported
    /// server version. Raised before opening the output root.
    #[error("precondition not met: {0}")]
    Precondition(String),

    /// Network hiccup or server-side throttling; the caller should retry
    /// with backoff.
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// Non-retriable I/O failure. Partial artifacts remain; the
    /// progress log preserves resumability.
    #[error("I/O error on {path}: {source}")]
    PersistentIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Server reported an error; `retriable` distinguishes deadlock /
    /// lock-wait-timeout (retry the chunk) from syntax / privilege
    /// errors (fatal).
    #[error("server error ({code}): {message}")]
    Server {
        code: String,
        message: String,
        retriable: bool,
    },

    /// Worker sessions observed diverging snapshots (`gtid_executed` or
    /// binlog position mismatch).
    #[error("consistency violation: {0}")]
    Consistency(String),

    /// `ocimds` found issues the `compatibility` flags cannot
    /// auto-fix. Carries every finding, not just the first.
    #[error("compatibility scan found {} issue(s): {}", .0.len(), .0.join("; "))]
    Compatibility(Vec<String>),

    /// A grant statement failed to apply; the caller's
    /// `handleGrantErrors` policy decides what happens next.
    #[error("grant error for account {account}: {message}")]
    LoadGrant { account: String, message: String },

    /// Manifest missing, corrupt, or its PAR expired.
    #[error("integrity error: {0}")]
    Integrity(String),
}

impl EngineError {
    /// Classifies the error as retriable at the chunk level. Used by
    /// the dump/load schedulers' `Running -> Retriable | Fatal`
    /// transition (spec §4.8/§4.9).
    pub fn is_retriable(&self) -> bool {
        match self {
            EngineError::TransientIo(_) => true,
            EngineError::Server { retriable, .. } => *retriable,
            _ => false,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
