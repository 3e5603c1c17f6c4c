// Error types for the mail relay

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Connection-level failure. Fatal to the session that hit it.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("no frame received within {0} seconds")]
    IdleTimeout(u64),

    #[error("peer did not accept data within {0} seconds")]
    WriteTimeout(u64),

    #[error("session cancelled")]
    Cancelled,
}

/// A frame or record that could not be decoded. Aborts only the current transfer.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame exceeds the maximum length of {0} bytes")]
    FrameTooLong(usize),

    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("expected a {expected} frame, got {found}")]
    UnexpectedFrame {
        expected: &'static str,
        found: &'static str,
    },
}

/// Filesystem failure on a single record or attachment.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("invalid identity for a mailbox: {0:?}")]
    InvalidIdentity(String),

    #[error("message has no recipients")]
    NoRecipients,

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to list mailbox {path}: {source}")]
    List {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not allocate a unique name for {0} after {1} attempts")]
    NameExhausted(String, u32),

    #[error("storage task failed: {0}")]
    Blocking(#[from] tokio::task::JoinError),
}

/// Anything that can end a session task. Decode and persistence failures
/// are reported to the peer instead.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<io::Error> for SessionError {
    fn from(err: io::Error) -> Self {
        SessionError::Transport(TransportError::Io(err))
    }
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;
