//! Per-host jobs.
//!
//! A job holds one host's coordinates, its outstanding task set and its
//! transport handles while going through retries until completion or
//! exhaustion. The outstanding task set plus the presence of the transports
//! is all the state there is; [`Job::start`] advances the pipeline by one
//! attempt and the orchestrator decides whether to re-dispatch.

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{RunError, TransferError, TransportError};
use crate::host;
use crate::output::Output;
use crate::tasks::{self, Tasks};
use crate::transfer;
use crate::transport::{DialConfig, Dialer, FileTransport, SessionTransport};

pub struct Job {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) cmd: String,
    pub(crate) tries: u32,
    pub(crate) duration: Duration,
    pub(crate) dial_config: DialConfig,
    pub(crate) exec_timeout: Duration,
    pub(crate) max_retries: u32,
    pub(crate) files: Vec<String>,
    pub(crate) path: String,
    pub(crate) history_path: PathBuf,
    pub(crate) dialer: Arc<dyn Dialer>,

    // handles
    pub(crate) session: Option<Box<dyn SessionTransport>>,
    pub(crate) file_transport: Option<Box<dyn FileTransport>>,
    pub(crate) out: Option<Arc<Output>>,

    // what the job should do
    pub(crate) tasks: Tasks,
}

impl Job {
    pub fn hostname(&self) -> &str {
        host::hostname(&self.host)
    }

    pub fn tasks(&self) -> Tasks {
        self.tasks
    }

    pub fn tries(&self) -> u32 {
        self.tries
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Runs one attempt of the job's remaining tasks.
    ///
    /// On success, or once the try count exceeds the retry budget, the task
    /// set is forced empty and the job is retired; otherwise the remaining
    /// bits stay set for the orchestrator to re-dispatch.
    pub async fn start(&mut self, ctx: &CancellationToken) -> Result<(), RunError> {
        if self.tasks.done() {
            return Ok(());
        }
        if ctx.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        self.tries += 1;
        let out = Arc::new(Output::new(self.hostname()));
        self.out = Some(Arc::clone(&out));

        let started = Instant::now();
        let res = self.attempt(ctx, &out).await;
        self.duration += started.elapsed();

        if res.is_ok() || self.tries > self.max_retries {
            self.tasks.clear();
        }
        if let Err(err) = &res {
            let _ = out.write(format!("\nERROR: {err}\n").as_bytes());
        }
        out.flush();
        res
    }

    async fn attempt(&mut self, ctx: &CancellationToken, out: &Arc<Output>) -> Result<(), RunError> {
        if self.tasks.has(tasks::KEEP_HISTORY) {
            let filename = self
                .history_path
                .join(format!("{}_{}.log", self.hostname(), self.tries));
            let open = OpenOptions::new()
                .append(true)
                .create(true)
                .mode(0o600)
                .open(&filename);
            match open {
                Ok(f) => out.set_file(f),
                Err(err) => {
                    tracing::error!(host = %self.host, error = %err, "failed to open output log")
                }
            }
        }

        let alive = match self.session.as_mut() {
            Some(session) => session.is_alive().await,
            None => false,
        };
        if !alive {
            self.dial(ctx).await?;
        }

        if self.tasks.has(tasks::PING) {
            let session = self.session_mut()?;
            if !session.is_alive().await {
                return Err(RunError::Connection(TransportError::Protocol(
                    "liveness probe failed".into(),
                )));
            }
            let _ = out.write(b"pong\n");
        }

        if self.tasks.has(tasks::UPLOAD) {
            self.ensure_file_transport().await?;
            let make_exec = self.tasks.has(tasks::EXEC);
            let (path, files) = (self.path.clone(), self.files.clone());
            let ft = self.file_transport_mut()?;
            transfer::upload(ctx, ft.as_mut(), &path, &files, make_exec).await?;
            // Uploaded bytes are on the remote side for good; re-running
            // this task on a later try would redo the work and race the
            // cleanup task.
            self.tasks.unset(tasks::UPLOAD);
        }

        if self.tasks.has(tasks::EXEC) {
            self.exec(ctx, out).await?;
        }

        if self.tasks.has(tasks::DOWNLOAD) {
            self.ensure_file_transport().await?;
            let root = Path::new(&self.path).join(self.hostname());
            let files = self.files.clone();
            let out = Arc::clone(out);
            let ft = self.file_transport_mut()?;
            transfer::download(ctx, ft.as_mut(), &root, &files, &out).await?;
        }

        if self.tasks.has(tasks::CLEANUP) {
            // Only reached when every previous step of this attempt went
            // through; a failed attempt leaves the files in place for
            // inspection.
            self.ensure_file_transport().await?;
            let (path, files) = (self.path.clone(), self.files.clone());
            let ft = self.file_transport_mut()?;
            transfer::cleanup(ctx, ft.as_mut(), &path, &files).await?;
        }

        Ok(())
    }

    /// Connects to the remote host, replacing any dead session handle.
    async fn dial(&mut self, ctx: &CancellationToken) -> Result<(), RunError> {
        if ctx.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        let mut addr = self.host.clone();
        if !addr.contains(':') {
            addr = format!("{addr}:{}", self.port);
        }

        let dialer = Arc::clone(&self.dialer);
        let config = self.dial_config.clone();
        tokio::select! {
            _ = ctx.cancelled() => Err(RunError::Cancelled),
            res = dialer.dial(&addr, &config) => match res {
                Ok(session) => {
                    self.session = Some(session);
                    Ok(())
                }
                Err(err) => Err(RunError::Connection(err)),
            },
        }
    }

    /// Executes the job's command, teeing output into the sink, bounded by
    /// the exec timeout.
    async fn exec(&mut self, ctx: &CancellationToken, out: &Arc<Output>) -> Result<(), RunError> {
        if ctx.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        let cmd = format!("{}\n", self.cmd);
        let timeout = self.exec_timeout;
        let out = Arc::clone(out);
        let session = self.session_mut()?;
        tokio::select! {
            _ = ctx.cancelled() => Err(RunError::Cancelled),
            res = tokio::time::timeout(timeout, session.run(&cmd, out)) => match res {
                Err(_) => Err(RunError::DeadlineExceeded),
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(RunError::Execution(err)),
            },
        }
    }

    /// Opens the file transport over the current session unless a live one
    /// is already attached. Cleanup may land here without an upload ever
    /// having opened it.
    async fn ensure_file_transport(&mut self) -> Result<(), RunError> {
        let alive = match self.file_transport.as_mut() {
            Some(ft) => transfer::files_alive(ft.as_mut()).await,
            None => false,
        };
        if alive {
            return Ok(());
        }

        let host = self.host.clone();
        let session = self.session_mut()?;
        let ft = session.open_files().await.map_err(|err| {
            RunError::FileTransfer(TransferError::new("open file transport", host, err))
        })?;
        self.file_transport = Some(ft);
        Ok(())
    }

    fn session_mut(&mut self) -> Result<&mut Box<dyn SessionTransport>, RunError> {
        self.session.as_mut().ok_or_else(|| {
            RunError::Connection(TransportError::Protocol("session not connected".into()))
        })
    }

    fn file_transport_mut(&mut self) -> Result<&mut Box<dyn FileTransport>, RunError> {
        self.file_transport.as_mut().ok_or_else(|| {
            RunError::FileTransfer(TransferError::new(
                "open file transport",
                self.host.clone(),
                TransportError::Protocol("file transport not open".into()),
            ))
        })
    }

    /// Releases, in order, the file transport, the session transport and the
    /// output sink. Idempotent.
    pub async fn close(&mut self) -> Result<(), TransportError> {
        let mut first = None;
        if let Some(mut ft) = self.file_transport.take() {
            if let Err(err) = ft.close().await {
                first.get_or_insert(err);
            }
        }
        if let Some(mut session) = self.session.take() {
            if let Err(err) = session.close().await {
                first.get_or_insert(err);
            }
        }
        if let Some(out) = self.out.take() {
            out.flush();
            out.close();
        }
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
