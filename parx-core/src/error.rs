//! Error taxonomy for the erasure-coded object store.
//!
//! Mirrors the status surface consumed by the reader, writer and repair
//! tool: library code returns `Result<T, EcError>`; `parx-cli` converts to
//! `anyhow::Result` at the process boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EcError {
    #[error("data error: {0}")]
    DataError(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("invalid operation: {0}")]
    InvalidOp(String),

    #[error("no more replicas available")]
    NoMoreReplicas,

    #[error("corrupted header: {0}")]
    CorruptedHeader(String),

    #[error("redirected")]
    Redirect,

    #[error("timed out")]
    Timeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl EcError {
    pub fn data_error(msg: impl Into<String>) -> Self {
        EcError::DataError(msg.into())
    }
}

pub type EcResult<T> = Result<T, EcError>;
