//! The orchestrator.
//!
//! Builds one job per host, spawns a fixed-size worker pool over a
//! rendezvous dispatch channel and keeps re-feeding jobs until each is done
//! or out of retries. The main loop multiplexes cancellation, SIGUSR1 stats
//! dumps and result arrivals; nothing here blocks the draining of results.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::config::Opts;
use crate::error::RunError;
use crate::history::{self, HostResult, Recorder};
use crate::host;
use crate::job::Job;
use crate::stats;
use crate::tasks;
use crate::transport::{DialConfig, Dialer};

/// Last observed state of one host's job, as published by the workers.
#[derive(Debug, Default)]
pub struct ArchiveEntry {
    pub tries: u32,
    pub duration: Duration,
    pub tasks_done: bool,
    pub error: Option<RunError>,
}

fn host_results(archive: &HashMap<String, ArchiveEntry>) -> HashMap<String, HostResult> {
    archive
        .iter()
        .map(|(hostport, entry)| {
            let error = entry
                .error
                .as_ref()
                .map(|e| e.history_label().to_string())
                .unwrap_or_default();
            let result = HostResult {
                error,
                tries: entry.tries,
                duration: entry.duration,
            };
            (host::hostname(hostport).to_string(), result)
        })
        .collect()
}

/// Drives `cmd` across `servers`, honoring the task set and limits in
/// `opts`. Always runs to completion: per-host failures end up in the stats
/// and the history record, not in a return value.
pub async fn run(
    ctx: &CancellationToken,
    servers: &[String],
    cmd: &str,
    mut opts: Opts,
    dialer: Arc<dyn Dialer>,
) {
    let started = Instant::now();

    let recorder = if opts.history {
        match Recorder::create(&opts.history_path, &history::run_id(), cmd, &opts.files) {
            Ok(rec) => Some(rec),
            Err(err) => {
                tracing::error!(error = %err, "failed to initialize history");
                opts.tasks.unset(tasks::KEEP_HISTORY);
                None
            }
        }
    } else {
        None
    };
    let run_dir: PathBuf = recorder
        .as_ref()
        .map(|r| r.path().to_path_buf())
        .unwrap_or_default();

    let (job_tx, job_rx) = flume::bounded::<Job>(0);
    let (res_tx, res_rx) = flume::bounded::<(Job, Option<RunError>)>(0);

    let mut workers = Vec::with_capacity(opts.workers as usize);
    for _ in 0..opts.workers {
        let job_rx = job_rx.clone();
        let res_tx = res_tx.clone();
        let ctx = ctx.clone();
        workers.push(tokio::spawn(async move {
            while let Ok(mut job) = job_rx.recv_async().await {
                let err = job.start(&ctx).await.err();
                if res_tx.send_async((job, err)).await.is_err() {
                    break;
                }
            }
        }));
    }
    drop(job_rx);
    drop(res_tx);

    let path = if opts.tasks.has(tasks::UPLOAD) {
        opts.upload_path.clone()
    } else if opts.tasks.has(tasks::DOWNLOAD) {
        opts.download_path.clone()
    } else {
        String::new()
    };

    let mut active: HashSet<String> = HashSet::with_capacity(servers.len());
    let mut archive: HashMap<String, ArchiveEntry> = HashMap::with_capacity(servers.len());
    let mut initial = Vec::with_capacity(servers.len());
    for server in servers {
        let (inline_user, hostport) = host::split_user(server);
        let job = Job {
            host: hostport.to_string(),
            port: opts.port,
            cmd: cmd.to_string(),
            tries: 0,
            duration: Duration::ZERO,
            dial_config: DialConfig {
                user: inline_user.unwrap_or(&opts.user).to_string(),
                connect_timeout: opts.conn_timeout,
                accept_unknown: opts.insecure,
            },
            exec_timeout: opts.exec_timeout,
            max_retries: opts.retries,
            files: opts.files.clone(),
            path: path.clone(),
            history_path: run_dir.clone(),
            dialer: Arc::clone(&dialer),
            session: None,
            file_transport: None,
            out: None,
            tasks: opts.tasks,
        };
        active.insert(hostport.to_string());
        archive.insert(hostport.to_string(), ArchiveEntry::default());
        initial.push(job);
    }

    // The initial enqueue runs beside the main loop so result draining can
    // start while dispatch is still handing out jobs.
    let feeder = {
        let job_tx = job_tx.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            for job in initial {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    res = job_tx.send_async(job) => {
                        if res.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    };

    let mut sigusr1 = signal(SignalKind::user_defined1()).ok();
    let mut job_tx = Some(job_tx);
    let mut retired: Vec<Job> = Vec::with_capacity(servers.len());
    if active.is_empty() {
        job_tx = None;
    }

    loop {
        tokio::select! {
            _ = ctx.cancelled(), if job_tx.is_some() => {
                // Closing the dispatch side retires the pool; results still
                // in flight keep draining below.
                job_tx = None;
            }
            _ = async {
                match sigusr1.as_mut() {
                    Some(sig) => { sig.recv().await; }
                    None => std::future::pending().await,
                }
            } => {
                let _ = stats::write_stats(&mut io::stderr(), &archive);
            }
            res = res_rx.recv_async() => match res {
                Ok((job, err)) => {
                    let hostport = job.host.clone();
                    tracing::debug!(host = %hostport, tries = job.tries(), error = ?err, "job done");

                    let done = job.tasks().done();
                    archive.insert(
                        hostport.clone(),
                        ArchiveEntry {
                            tries: job.tries(),
                            duration: job.duration(),
                            tasks_done: done,
                            error: err,
                        },
                    );

                    let closing = ctx.is_cancelled();
                    if done {
                        active.remove(&hostport);
                        retired.push(job);
                    } else if !closing {
                        if let Some(entry) = archive.get_mut(&hostport) {
                            // this retry is pending again
                            entry.error = None;
                        }
                        match &job_tx {
                            Some(tx) => {
                                let tx = tx.clone();
                                tokio::spawn(async move {
                                    let _ = tx.send_async(job).await;
                                });
                            }
                            None => retired.push(job),
                        }
                    } else {
                        retired.push(job);
                    }

                    if active.is_empty() {
                        job_tx = None;
                    }
                }
                Err(_) => {
                    let _ = stats::write_stats(&mut io::stderr(), &archive);
                    break;
                }
            },
        }
    }

    let _ = feeder.await;
    futures::future::join_all(workers).await;
    for mut job in retired {
        if let Err(err) = job.close().await {
            tracing::debug!(host = %job.host, error = %err, "closing job");
        }
    }

    if let Some(rec) = recorder {
        rec.finish(started.elapsed(), &host_results(&archive));
    }
}
