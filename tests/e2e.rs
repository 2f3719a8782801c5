//! End-to-end tests for the orchestrator.
//!
//! Everything runs against mock transports: a scripted dialer hands out
//! sessions that record what they were asked to do, and the file transport
//! is backed by a local scratch directory standing in for the remote side.

use std::collections::HashSet;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use drover::tasks::{self, Tasks};
use drover::transport::{
    DialConfig, Dialer, FileKind, FileMeta, FileTransport, SessionTransport, WalkEntry,
};
use drover::{history, run, Opts, Output, TransportError};

fn io_err(e: std::io::Error) -> TransportError {
    TransportError::Io(e)
}

/// File transport backed by a local directory standing in for the remote
/// host's filesystem.
struct DirFs {
    root: PathBuf,
}

impl DirFs {
    fn abs(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn meta_of(m: &std::fs::Metadata) -> FileMeta {
        let kind = if m.file_type().is_symlink() {
            FileKind::Symlink
        } else if m.is_dir() {
            FileKind::Dir
        } else {
            FileKind::File
        };
        FileMeta {
            kind,
            mode: m.permissions().mode() & 0o7777,
            size: m.len(),
        }
    }

    fn walk_into(&self, dir: &Path, rel: &str, acc: &mut Vec<WalkEntry>) -> std::io::Result<()> {
        let meta = std::fs::symlink_metadata(dir)?;
        acc.push(WalkEntry {
            path: format!("/{rel}"),
            meta: Self::meta_of(&meta),
        });
        if !meta.is_dir() || meta.file_type().is_symlink() {
            return Ok(());
        }
        let mut names: Vec<String> = std::fs::read_dir(dir)?
            .map(|e| e.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<std::io::Result<_>>()?;
        names.sort();
        for name in names {
            let child = dir.join(&name);
            let child_rel = format!("{rel}/{name}");
            let child_meta = std::fs::symlink_metadata(&child)?;
            if child_meta.is_dir() && !child_meta.file_type().is_symlink() {
                self.walk_into(&child, &child_rel, acc)?;
            } else {
                acc.push(WalkEntry {
                    path: format!("/{child_rel}"),
                    meta: Self::meta_of(&child_meta),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl FileTransport for DirFs {
    async fn mkdir_all(&mut self, path: &str) -> Result<(), TransportError> {
        std::fs::create_dir_all(self.abs(path)).map_err(io_err)
    }

    async fn stat(&mut self, path: &str) -> Result<FileMeta, TransportError> {
        Ok(Self::meta_of(&std::fs::metadata(self.abs(path)).map_err(io_err)?))
    }

    async fn lstat(&mut self, path: &str) -> Result<FileMeta, TransportError> {
        Ok(Self::meta_of(
            &std::fs::symlink_metadata(self.abs(path)).map_err(io_err)?,
        ))
    }

    async fn open(
        &mut self,
        path: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, TransportError> {
        Ok(Box::new(
            tokio::fs::File::open(self.abs(path)).await.map_err(io_err)?,
        ))
    }

    async fn create(
        &mut self,
        path: &str,
    ) -> Result<Box<dyn AsyncWrite + Send + Unpin>, TransportError> {
        Ok(Box::new(
            tokio::fs::File::create(self.abs(path))
                .await
                .map_err(io_err)?,
        ))
    }

    async fn chmod(&mut self, path: &str, mode: u32) -> Result<(), TransportError> {
        std::fs::set_permissions(self.abs(path), std::fs::Permissions::from_mode(mode))
            .map_err(io_err)
    }

    async fn posix_rename(&mut self, from: &str, to: &str) -> Result<(), TransportError> {
        std::fs::rename(self.abs(from), self.abs(to)).map_err(io_err)
    }

    async fn remove(&mut self, path: &str) -> Result<(), TransportError> {
        std::fs::remove_file(self.abs(path)).map_err(io_err)
    }

    async fn glob(&mut self, pattern: &str) -> Result<Vec<String>, TransportError> {
        if !pattern.contains(['*', '?', '[']) {
            return Ok(match std::fs::symlink_metadata(self.abs(pattern)) {
                Ok(_) => vec![pattern.to_string()],
                Err(_) => vec![],
            });
        }

        // Wildcards in the last component only; plenty for these tests.
        let (dir, name_pat) = pattern.rsplit_once('/').unwrap_or(("", pattern));
        let pat = glob::Pattern::new(name_pat)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        let entries = match std::fs::read_dir(self.abs(dir)) {
            Ok(entries) => entries,
            Err(_) => return Ok(vec![]),
        };
        let mut matches: Vec<String> = entries
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| pat.matches(name))
            .map(|name| format!("{dir}/{name}"))
            .collect();
        matches.sort();
        Ok(matches)
    }

    async fn walk(&mut self, root: &str) -> Result<Vec<WalkEntry>, TransportError> {
        let mut acc = Vec::new();
        self.walk_into(&self.abs(root), root.trim_matches('/'), &mut acc)
            .map_err(io_err)?;
        Ok(acc)
    }

    async fn read_link(&mut self, path: &str) -> Result<String, TransportError> {
        Ok(std::fs::read_link(self.abs(path))
            .map_err(io_err)?
            .to_string_lossy()
            .into_owned())
    }

    async fn getwd(&mut self) -> Result<String, TransportError> {
        Ok("/".into())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Shared state observed by the test after the run finishes.
#[derive(Default)]
struct MockState {
    exit_status: i32,
    delay: Duration,
    refuse_hosts: HashSet<String>,
    remote_root: Option<PathBuf>,
    /// Remote paths whose mode is snapshotted while an exec is running.
    watch_paths: Vec<String>,

    dials: AtomicU32,
    runs: Mutex<Vec<String>>,
    snapshots: Mutex<Vec<(String, Option<u32>)>>,
    concurrent: AtomicI32,
    peak: AtomicI32,
}

struct MockDialer(Arc<MockState>);

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(
        &self,
        addr: &str,
        _config: &DialConfig,
    ) -> Result<Box<dyn SessionTransport>, TransportError> {
        self.0.dials.fetch_add(1, Ordering::SeqCst);
        let host = addr.split(':').next().unwrap_or(addr);
        if self.0.refuse_hosts.contains(host) {
            return Err(TransportError::Protocol("connection refused".into()));
        }
        Ok(Box::new(MockSession(Arc::clone(&self.0))))
    }
}

struct MockSession(Arc<MockState>);

#[async_trait]
impl SessionTransport for MockSession {
    async fn run(&mut self, cmd: &str, out: Arc<Output>) -> Result<(), TransportError> {
        let state = &self.0;
        let now = state.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        state.peak.fetch_max(now, Ordering::SeqCst);

        if !state.delay.is_zero() {
            tokio::time::sleep(state.delay).await;
        }
        if let Some(root) = &state.remote_root {
            for watched in &state.watch_paths {
                let mode = std::fs::metadata(root.join(watched))
                    .ok()
                    .map(|m| m.permissions().mode() & 0o7777);
                state.snapshots.lock().unwrap().push((watched.clone(), mode));
            }
        }

        state.runs.lock().unwrap().push(cmd.trim_end().to_string());
        let _ = out.write(b"ok\n");
        state.concurrent.fetch_sub(1, Ordering::SeqCst);

        if state.exit_status != 0 {
            return Err(TransportError::ExitStatus(state.exit_status));
        }
        Ok(())
    }

    async fn is_alive(&mut self) -> bool {
        true
    }

    async fn open_files(&mut self) -> Result<Box<dyn FileTransport>, TransportError> {
        match &self.0.remote_root {
            Some(root) => Ok(Box::new(DirFs { root: root.clone() })),
            None => Err(TransportError::Protocol("subsystem rejected".into())),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

fn opts(job_tasks: Tasks) -> Opts {
    Opts {
        user: "tester".into(),
        workers: 2,
        retries: 1,
        exec_timeout: Duration::from_secs(1),
        conn_timeout: Duration::from_secs(1),
        tasks: job_tasks,
        ..Opts::default()
    }
}

fn servers(hosts: &[&str]) -> Vec<String> {
    hosts.iter().map(|h| format!("{h}:22")).collect()
}

fn ctx() -> CancellationToken {
    CancellationToken::new()
}

#[tokio::test]
async fn fan_out_exec_success() {
    let state = Arc::new(MockState::default());
    let dialer = Arc::new(MockDialer(Arc::clone(&state)));

    run::run(
        &ctx(),
        &servers(&["h1", "h2", "h3"]),
        "true",
        opts(tasks::EXEC),
        dialer,
    )
    .await;

    let runs = state.runs.lock().unwrap();
    assert_eq!(runs.len(), 3, "each host executes exactly once");
    assert!(runs.iter().all(|cmd| cmd == "true"));
    assert_eq!(state.dials.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn worker_pool_bounds_concurrency() {
    let state = Arc::new(MockState {
        delay: Duration::from_millis(30),
        ..MockState::default()
    });
    let dialer = Arc::new(MockDialer(Arc::clone(&state)));

    run::run(
        &ctx(),
        &servers(&["h1", "h2", "h3", "h4", "h5"]),
        "true",
        opts(tasks::EXEC),
        dialer,
    )
    .await;

    assert_eq!(state.runs.lock().unwrap().len(), 5);
    assert!(
        state.peak.load(Ordering::SeqCst) <= 2,
        "no more than `workers` execs in flight"
    );
}

#[tokio::test]
async fn exec_failure_exhausts_retries() {
    let state = Arc::new(MockState {
        exit_status: 1,
        ..MockState::default()
    });
    let dialer = Arc::new(MockDialer(Arc::clone(&state)));

    run::run(&ctx(), &servers(&["h"]), "false", opts(tasks::EXEC), dialer).await;

    // retries=1 means two attempts, then the job is retired
    assert_eq!(state.runs.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn connection_refusal_never_reaches_exec() {
    let state = Arc::new(MockState {
        refuse_hosts: HashSet::from(["h".to_string()]),
        ..MockState::default()
    });
    let dialer = Arc::new(MockDialer(Arc::clone(&state)));

    let mut o = opts(tasks::EXEC);
    o.retries = 0;
    run::run(&ctx(), &servers(&["h"]), "true", o, dialer).await;

    assert_eq!(state.dials.load(Ordering::SeqCst), 1);
    assert!(state.runs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn upload_exec_cleanup_happy_path() {
    let local = tempfile::tempdir().unwrap();
    let remote = tempfile::tempdir().unwrap();
    let script = local.path().join("run.sh");
    std::fs::write(&script, "#!/bin/sh\nexit 0\n").unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o640)).unwrap();

    let state = Arc::new(MockState {
        remote_root: Some(remote.path().to_path_buf()),
        watch_paths: vec!["work/run.sh".into()],
        ..MockState::default()
    });
    let dialer = Arc::new(MockDialer(Arc::clone(&state)));

    let mut o = opts(tasks::UPLOAD | tasks::EXEC | tasks::CLEANUP);
    o.files = vec![script.to_string_lossy().into_owned()];
    o.upload_path = "work".into();
    run::run(&ctx(), &servers(&["h"]), "./work/run.sh", o, dialer).await;

    // During exec the file was present, with the exec bits added on top of
    // the local 0640.
    let snapshots = state.snapshots.lock().unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].1, Some(0o751));

    // After cleanup the remote counterpart is gone and no temp residue
    // survives anywhere.
    assert!(!remote.path().join("work/run.sh").exists());
    for entry in std::fs::read_dir(remote.path().join("work")).unwrap() {
        let name = entry.unwrap().file_name().to_string_lossy().into_owned();
        assert!(!name.ends_with(".tmp"), "temp residue: {name}");
    }
}

#[tokio::test]
async fn download_lands_under_per_host_root() {
    let remote = tempfile::tempdir().unwrap();
    let local = tempfile::tempdir().unwrap();
    let logs = remote.path().join("logs");
    std::fs::create_dir_all(&logs).unwrap();
    std::fs::write(logs.join("app.log"), "app").unwrap();
    std::fs::write(logs.join("error.log"), "err").unwrap();
    std::fs::write(logs.join("debug.txt"), "dbg").unwrap();

    let state = Arc::new(MockState {
        remote_root: Some(remote.path().to_path_buf()),
        ..MockState::default()
    });
    let dialer = Arc::new(MockDialer(Arc::clone(&state)));

    let mut o = opts(tasks::DOWNLOAD);
    o.files = vec!["/logs/*.log".into()];
    o.download_path = local.path().to_string_lossy().into_owned();
    run::run(&ctx(), &servers(&["h1"]), "", o, dialer).await;

    assert_eq!(
        std::fs::read_to_string(local.path().join("h1/logs/app.log")).unwrap(),
        "app"
    );
    assert_eq!(
        std::fs::read_to_string(local.path().join("h1/logs/error.log")).unwrap(),
        "err"
    );
    assert!(!local.path().join("h1/logs/debug.txt").exists());
}

#[tokio::test]
async fn ping_only_dials() {
    let state = Arc::new(MockState::default());
    let dialer = Arc::new(MockDialer(Arc::clone(&state)));

    run::run(&ctx(), &servers(&["h1", "h2"]), "", opts(tasks::PING), dialer).await;

    assert_eq!(state.dials.load(Ordering::SeqCst), 2);
    assert!(state.runs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn history_round_trip() {
    let root = tempfile::tempdir().unwrap();
    let state = Arc::new(MockState {
        refuse_hosts: HashSet::from(["h2".to_string()]),
        ..MockState::default()
    });
    let dialer = Arc::new(MockDialer(Arc::clone(&state)));

    let mut o = opts(tasks::EXEC | tasks::KEEP_HISTORY);
    o.retries = 2;
    o.history = true;
    o.history_path = root.path().to_path_buf();
    o.files = vec!["a.sh".into(), "b.txt".into()];
    run::run(&ctx(), &servers(&["h1", "h2"]), "uptime", o, dialer).await;

    let items = history::list_history(root.path()).unwrap();
    assert_eq!(items.len(), 1);
    let item = &items[0];

    assert_eq!(item.command, "uptime");
    assert_eq!(item.files, vec!["a.sh", "b.txt"]);
    assert_eq!(item.summary(), (1, 1));

    let h1 = &item.hosts["h1"];
    assert_eq!(h1.error, "");
    assert_eq!(h1.tries, 1);
    let h2 = &item.hosts["h2"];
    assert_eq!(h2.error, "connection");
    assert_eq!(h2.tries, 3);

    // one log per try: h1_1.log, h2_1.log .. h2_3.log
    assert_eq!(item.logs.len(), 4);
    let log_content = std::fs::read_to_string(
        item.logs
            .iter()
            .find(|l| l.ends_with("h1_1.log"))
            .expect("h1_1.log recorded"),
    )
    .unwrap();
    assert_eq!(log_content, "ok\n");
}

#[tokio::test]
async fn cancelled_run_still_writes_partial_history() {
    let root = tempfile::tempdir().unwrap();
    let state = Arc::new(MockState::default());
    let dialer = Arc::new(MockDialer(Arc::clone(&state)));

    let token = ctx();
    token.cancel();

    let mut o = opts(tasks::EXEC | tasks::KEEP_HISTORY);
    o.history = true;
    o.history_path = root.path().to_path_buf();
    run::run(&token, &servers(&["h1"]), "true", o, dialer).await;

    let items = history::list_history(root.path()).unwrap();
    assert_eq!(items.len(), 1, "cancelled runs still leave a record");
    // nothing succeeded, nothing executed
    assert!(state.runs.lock().unwrap().is_empty());
}
