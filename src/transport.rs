//! Abstract transports the engine drives hosts through.
//!
//! The orchestrator and jobs only ever see these traits; the openssh-backed
//! production implementations live in [`crate::session`] and the tests plug
//! in mocks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::TransportError;
use crate::output::Output;

/// Kind of a remote file as reported by stat/lstat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Dir,
    Symlink,
    Other,
}

/// Metadata of a remote path.
#[derive(Debug, Clone, Copy)]
pub struct FileMeta {
    pub kind: FileKind,
    /// Permission bits (the low nine plus setuid/setgid/sticky).
    pub mode: u32,
    pub size: u64,
}

/// One entry of a remote tree walk.
///
/// Walks are pre-order and include the root itself. The walker consults
/// lstat and never descends a symlink pointing at a directory; the symlink
/// shows up as a single [`FileKind::Symlink`] entry instead.
#[derive(Debug, Clone)]
pub struct WalkEntry {
    pub path: String,
    pub meta: FileMeta,
}

/// Per-host connection parameters, assembled by the orchestrator from the
/// auth bundle and the host-key verifier.
#[derive(Debug, Clone)]
pub struct DialConfig {
    pub user: String,
    pub connect_timeout: Duration,
    /// Skip host-key verification (`--insecure`).
    pub accept_unknown: bool,
}

/// Opens session transports. The single seam between the engine and the
/// underlying secure-channel implementation.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connects to `addr` (`host:port`), respecting the connect timeout
    /// carried in `config`.
    async fn dial(
        &self,
        addr: &str,
        config: &DialConfig,
    ) -> Result<Box<dyn SessionTransport>, TransportError>;
}

/// An established connection able to run remote commands.
#[async_trait]
pub trait SessionTransport: Send {
    /// Runs `cmd` in a fresh exec session, routing its stdout and stderr to
    /// `out`. Fails if the session cannot be opened or the command exits
    /// non-zero.
    async fn run(&mut self, cmd: &str, out: Arc<Output>) -> Result<(), TransportError>;

    /// Opens a throwaway no-op session to probe whether the connection is
    /// still usable.
    async fn is_alive(&mut self) -> bool;

    /// Opens the file transport over this connection.
    async fn open_files(&mut self) -> Result<Box<dyn FileTransport>, TransportError>;

    /// Releases the connection.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Remote filesystem operations used by upload, download and cleanup.
#[async_trait]
pub trait FileTransport: Send {
    async fn mkdir_all(&mut self, path: &str) -> Result<(), TransportError>;
    /// Metadata following symlinks.
    async fn stat(&mut self, path: &str) -> Result<FileMeta, TransportError>;
    /// Metadata without following symlinks.
    async fn lstat(&mut self, path: &str) -> Result<FileMeta, TransportError>;
    async fn open(
        &mut self,
        path: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, TransportError>;
    async fn create(
        &mut self,
        path: &str,
    ) -> Result<Box<dyn AsyncWrite + Send + Unpin>, TransportError>;
    async fn chmod(&mut self, path: &str, mode: u32) -> Result<(), TransportError>;
    /// Atomic rename, replacing `to` if it exists.
    async fn posix_rename(&mut self, from: &str, to: &str) -> Result<(), TransportError>;
    async fn remove(&mut self, path: &str) -> Result<(), TransportError>;
    /// Expands a glob pattern remotely. A pattern without matches expands to
    /// an empty list, not an error.
    async fn glob(&mut self, pattern: &str) -> Result<Vec<String>, TransportError>;
    /// Pre-order walk rooted at `root`; see [`WalkEntry`] for the symlink
    /// rules.
    async fn walk(&mut self, root: &str) -> Result<Vec<WalkEntry>, TransportError>;
    /// Reads a symlink target verbatim.
    async fn read_link(&mut self, path: &str) -> Result<String, TransportError>;
    /// Working directory of the remote side; doubles as the liveness probe.
    async fn getwd(&mut self) -> Result<String, TransportError>;
    async fn close(&mut self) -> Result<(), TransportError>;
}
