use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Ledger file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("Ledger I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Ledger {path} is locked by another running writer")]
    Locked { path: PathBuf },
    #[error("Ledger {path} belongs to network {found}, expected {expected}")]
    NetworkMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },
    #[error("Failed to serialize ledger: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Ledger was opened read-only")]
    ReadOnly,
}

impl LedgerError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        LedgerError::Io {
            path: path.into(),
            source,
        }
    }
}
