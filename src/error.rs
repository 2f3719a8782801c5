//! Error handling.
//!
//! One attempt of a job fails with exactly one [`RunError`]; the variant
//! decides both the retry policy and the bucket the host lands in inside
//! stats and `hosts.json`.

use thiserror::Error;

/// Raw failure reported by a session or file transport.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Protocol-level failure (handshake, channel, subsystem).
    #[error("{0}")]
    Protocol(String),
    /// The remote command finished with a non-zero exit status.
    #[error("remote command exited with status {0}")]
    ExitStatus(i32),
}

/// A file-transfer failure, tagging the step and path that broke.
#[derive(Error, Debug)]
#[error("{step} {path:?}: {source}")]
pub struct TransferError {
    pub step: &'static str,
    pub path: String,
    #[source]
    pub source: TransportError,
}

impl TransferError {
    pub fn new(step: &'static str, path: impl Into<String>, source: TransportError) -> Self {
        Self {
            step,
            path: path.into(),
            source,
        }
    }
}

/// Final error of one job attempt.
#[derive(Error, Debug)]
pub enum RunError {
    /// Unable to establish or reuse the session transport.
    #[error("connection failed: {0}")]
    Connection(#[source] TransportError),

    /// Upload, download or cleanup broke, or the file transport would not open.
    #[error("file transfer failed: {0}")]
    FileTransfer(#[source] TransferError),

    /// The exec session failed to open or the command exited non-zero.
    #[error("execution failed: {0}")]
    Execution(#[source] TransportError),

    /// The exec timeout fired while the remote command was still running.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The run was cancelled. Terminal; never retried.
    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] std::io::Error),
}

impl RunError {
    /// Whether the orchestrator may re-enqueue the job after this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RunError::Cancelled)
    }

    /// The error kind as recorded per host in `hosts.json`.
    ///
    /// A deadline hit counts as an execution failure; anything outside the
    /// three categories is `unknown`.
    pub fn history_label(&self) -> &'static str {
        match self {
            RunError::Connection(_) => "connection",
            RunError::FileTransfer(_) => "transfer",
            RunError::Execution(_) | RunError::DeadlineExceeded => "execution",
            RunError::Cancelled | RunError::Other(_) => "unknown",
        }
    }
}
