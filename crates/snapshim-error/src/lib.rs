#![forbid(unsafe_code)]
//! Error types for snapshim.
//!
//! Defines `SnapError` and a `Result<T>` alias used throughout the workspace.
//! Request-level failures are reported back to the kernel through the dm-user
//! response code; only transport and startup failures propagate out of the
//! request loop.

use thiserror::Error;

/// Unified error type for all snapshim operations.
#[derive(Debug, Error)]
pub enum SnapError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid on-disk format: {0}")]
    Format(String),

    #[error("corrupt data at chunk {chunk}: {detail}")]
    Corruption { chunk: u64, detail: String },

    #[error("unknown COW operation kind: {kind}")]
    UnknownOp { kind: u16 },

    #[error("corrupted merge state in area {area}: {detail}")]
    MergeState { area: u64, detail: String },

    #[error("request exceeds staging capacity: {requested} bytes")]
    RequestTooLarge { requested: usize },
}

/// Result alias using `SnapError`.
pub type Result<T> = std::result::Result<T, SnapError>;
