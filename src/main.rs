use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use drover::config::{Cli, Command, Common, HistoryCommand, Opts};
use drover::tasks::{self, Tasks};
use drover::{history, host, run, SshDialer};

fn die(msg: String) -> ! {
    eprintln!("ERROR: {msg}");
    std::process::exit(1);
}

fn read_servers(path: &str, port: u16) -> Vec<String> {
    match host::read_hosts(path, port) {
        Ok(servers) => servers,
        Err(err) => die(format!("read servers: {err}")),
    }
}

/// Populates the engine options from CLI args. Takes the task set the
/// subcommand wants to perform and toggles the history task on top of it.
#[allow(clippy::too_many_arguments)]
fn engine_opts(
    common: &Common,
    history: bool,
    history_path: PathBuf,
    upload_path: String,
    download_path: String,
    files: Vec<String>,
    exec_timeout: Duration,
    mut t: Tasks,
) -> Opts {
    if history {
        t.set(tasks::KEEP_HISTORY);
    }
    Opts {
        user: common.user.clone(),
        port: common.port,
        retries: common.retries,
        workers: common.workers,
        files,
        conn_timeout: *common.conn_timeout,
        exec_timeout,
        history,
        history_path,
        upload_path,
        insecure: common.insecure,
        download_path,
        tasks: t,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::try_parse().unwrap_or_else(|err| {
        let _ = err.print();
        std::process::exit(1);
    });

    let filter = if cli.verbose {
        EnvFilter::new("drover=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("drover=info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let ctx = CancellationToken::new();
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                ctx.cancel();
            }
        });
    }

    let history_path = cli.history_path.clone();
    let upload_path = cli.upload_path.clone();

    match cli.command {
        Command::Shell {
            hosts,
            command,
            common,
            exec_timeout,
            history,
        } => {
            let servers = read_servers(&hosts, common.port);
            let opts = engine_opts(
                &common,
                history,
                history_path,
                upload_path,
                String::new(),
                vec![],
                *exec_timeout,
                tasks::EXEC,
            );
            run::run(&ctx, &servers, &command.join(" "), opts, Arc::new(SshDialer)).await;
        }

        Command::Exec {
            hosts,
            file,
            files,
            cleanup,
            common,
            exec_timeout,
            history,
        } => {
            let servers = read_servers(&hosts, common.port);
            let info = match std::fs::metadata(&file) {
                Ok(info) => info,
                Err(err) => die(format!("read executable: {err}")),
            };
            if info.is_dir() {
                die("can not execute directory".to_string());
            }

            let name = Path::new(&file)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| file.clone());
            let command = if upload_path.is_empty() {
                format!("./{name}")
            } else {
                format!("{}/{name}", upload_path.trim_end_matches('/'))
            };

            let mut all_files = vec![file];
            all_files.extend(files);

            let mut t = tasks::UPLOAD | tasks::EXEC;
            if cleanup {
                t.set(tasks::CLEANUP);
            }
            let opts = engine_opts(
                &common,
                history,
                history_path,
                upload_path,
                String::new(),
                all_files,
                *exec_timeout,
                t,
            );
            run::run(&ctx, &servers, &command, opts, Arc::new(SshDialer)).await;
        }

        Command::Upload {
            hosts,
            patterns,
            output,
            common,
            history,
        } => {
            let servers = read_servers(&hosts, common.port);
            let opts = engine_opts(
                &common,
                history,
                history_path,
                output,
                String::new(),
                patterns,
                Duration::from_secs(3600),
                tasks::UPLOAD,
            );
            run::run(&ctx, &servers, "", opts, Arc::new(SshDialer)).await;
        }

        Command::Download {
            hosts,
            patterns,
            output,
            common,
            history,
        } => {
            let servers = read_servers(&hosts, common.port);
            let opts = engine_opts(
                &common,
                history,
                history_path,
                upload_path,
                output,
                patterns,
                Duration::from_secs(3600),
                tasks::DOWNLOAD,
            );
            run::run(&ctx, &servers, "", opts, Arc::new(SshDialer)).await;
        }

        Command::Ping { hosts, common } => {
            let servers = read_servers(&hosts, common.port);
            let opts = engine_opts(
                &common,
                false,
                history_path,
                upload_path,
                String::new(),
                vec![],
                Duration::from_secs(3600),
                tasks::PING,
            );
            run::run(&ctx, &servers, "", opts, Arc::new(SshDialer)).await;
        }

        Command::History { action } => history_command(action, &history_path),
    }
}

fn list_or_die(root: &Path) -> Vec<history::HistoryItem> {
    match history::list_history(root) {
        Ok(items) => items,
        Err(err) => die(format!("{err}")),
    }
}

fn history_command(action: Option<HistoryCommand>, root: &Path) {
    match action {
        None => {
            let items = list_or_die(root);
            println!(
                "{:>4}  {:19}  {:>10}  {:>5}  {:>5}  {}",
                "ID", "Start Time", "Duration", "Hosts", "Files", "Command"
            );
            for (i, item) in items.iter().enumerate() {
                println!(
                    "{:>4}  {:19}  {:>10}  {:>5}  {:>5}  {}",
                    i + 1,
                    item.time.format("%Y-%m-%d %H:%M:%S").to_string(),
                    humantime::format_duration(item.duration).to_string(),
                    item.hosts.len(),
                    item.files.len(),
                    item.command
                );
            }
        }

        Some(HistoryCommand::Show { mut ids }) => {
            let items = list_or_die(root);
            if ids.is_empty() {
                ids.push(1);
            }
            for id in ids {
                if id == 0 || id > items.len() {
                    die(format!(
                        "failed to show execution {id} out of {}",
                        items.len()
                    ));
                }
                println!("---------------------------------------------------");
                if let Err(err) = items[id - 1].write_to(&mut std::io::stdout()) {
                    die(format!("{err}"));
                }
            }
        }

        Some(HistoryCommand::Purge {
            keep,
            older_than,
            all,
        }) => {
            if keep.is_none() && older_than.is_none() && !all {
                die("either --keep, --older-than or --all should be passed".to_string());
            }
            if all && (keep.is_some() || older_than.is_some()) {
                die("--all can not be combined with --keep or --older-than".to_string());
            }

            let items = list_or_die(root);
            let now = chrono::Local::now();
            for (i, item) in items.iter().enumerate() {
                let too_old = older_than.is_some_and(|d| {
                    now.signed_duration_since(item.time)
                        .to_std()
                        .is_ok_and(|age| age > *d)
                });
                if all || keep.is_some_and(|k| i >= k) || too_old {
                    tracing::info!(id = i + 1, from = %item.time, "deleting");
                    if let Err(err) = item.delete() {
                        eprintln!("ERROR: {err}");
                    }
                }
            }
        }
    }
}
