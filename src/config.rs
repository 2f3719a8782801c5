//! Configuration for Drover.
//!
//! Holds the clap structs for command line arguments and flags, plus the
//! [`Opts`] snapshot the orchestrator copies into every job at creation
//! time. Jobs never share this struct.

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand};

use crate::tasks::Tasks;

fn default_history_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
    PathBuf::from(home).join(".local/state/drover/history")
}

/// User to login as if `-u|--user` is not passed.
fn default_user() -> String {
    std::env::var("USER").unwrap_or_else(|_| {
        tracing::error!("failed to get current user, using 'root' as default user");
        "root".into()
    })
}

#[derive(Parser)]
#[command(name = "drover", version, about = "Parallel SSH execution across a herd of hosts")]
#[command(long_about = "drover - parallel SSH command execution across multiple servers.

Connect to multiple hosts via SSH, execute commands or upload scripts,
and aggregate output with per-host prefixes. A lightweight alternative
to configuration management for ad-hoc operations.

Authentication is handled by the system ssh: the agent and the usual
identity files in '~/.ssh'.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// enables debug output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// where to store history
    #[arg(long, global = true, default_value_os_t = default_history_path())]
    pub history_path: PathBuf,

    /// where to upload files on remote machines
    #[arg(long, global = true, default_value = "")]
    pub upload_path: String,
}

/// Arguments shared by every host-facing subcommand.
#[derive(Args, Clone)]
pub struct Common {
    /// user to login as
    #[arg(short, long, default_value_t = default_user())]
    pub user: String,

    /// SSH port to connect to
    #[arg(short, long, default_value_t = 22, value_parser = clap::value_parser!(u16).range(1..))]
    pub port: u16,

    /// how many retries to perform on failed executions
    #[arg(short, long, default_value_t = 5, value_parser = clap::value_parser!(u32).range(1..))]
    pub retries: u32,

    /// how many workers to execute in parallel
    #[arg(short, long, default_value_t = 10, value_parser = clap::value_parser!(u32).range(1..))]
    pub workers: u32,

    /// connection timeout
    #[arg(long, default_value = "30s")]
    pub conn_timeout: humantime::Duration,

    /// skip host key verification
    #[arg(short, long)]
    pub insecure: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a single command on multiple machines
    Shell {
        /// file listing the hosts to run on
        hosts: String,
        /// command to run
        #[arg(required = true, num_args = 1..)]
        command: Vec<String>,
        #[command(flatten)]
        common: Common,
        /// execution timeout
        #[arg(short = 't', long, default_value = "1h")]
        exec_timeout: humantime::Duration,
        /// write execution into history
        #[arg(long, default_value_t = true, action = ArgAction::Set)]
        history: bool,
    },

    /// Execute a given executable on multiple machines
    Exec {
        /// file listing the hosts to run on
        hosts: String,
        /// executable to upload and run
        file: String,
        /// additional files to be uploaded before execution
        #[arg(short, long)]
        files: Vec<String>,
        /// remove uploaded files after execution
        #[arg(short, long)]
        cleanup: bool,
        #[command(flatten)]
        common: Common,
        /// execution timeout
        #[arg(short = 't', long, default_value = "1h")]
        exec_timeout: humantime::Duration,
        /// write execution into history
        #[arg(long, default_value_t = true, action = ArgAction::Set)]
        history: bool,
    },

    /// Upload files matching patterns to multiple machines
    Upload {
        /// file listing the hosts to upload to
        hosts: String,
        /// local files to upload
        #[arg(required = true, num_args = 1..)]
        patterns: Vec<String>,
        /// remote directory to upload files to
        #[arg(short, long, default_value = "")]
        output: String,
        #[command(flatten)]
        common: Common,
        /// write execution into history
        #[arg(long, default_value_t = false, action = ArgAction::Set)]
        history: bool,
    },

    /// Download files matching patterns from multiple machines
    Download {
        /// file listing the hosts to download from
        hosts: String,
        /// remote glob patterns to download
        #[arg(required = true, num_args = 1..)]
        patterns: Vec<String>,
        /// local directory to download files to
        #[arg(short, long, default_value = ".")]
        output: String,
        #[command(flatten)]
        common: Common,
        /// write execution into history
        #[arg(long, default_value_t = false, action = ArgAction::Set)]
        history: bool,
    },

    /// Test SSH connectivity to multiple machines
    Ping {
        /// file listing the hosts to ping
        hosts: String,
        #[command(flatten)]
        common: Common,
    },

    /// List previous executions and their result
    History {
        #[command(subcommand)]
        action: Option<HistoryCommand>,
    },
}

#[derive(Subcommand)]
pub enum HistoryCommand {
    /// Show all the details of specific executions
    Show {
        /// execution ids as printed by `history` (defaults to the latest)
        ids: Vec<usize>,
    },
    /// Purge previous executions
    Purge {
        /// how many of the latest executions to keep
        #[arg(long)]
        keep: Option<usize>,
        /// older than how much time to purge
        #[arg(long)]
        older_than: Option<humantime::Duration>,
        /// delete all previous executions
        #[arg(short, long)]
        all: bool,
    },
}

/// Options snapshot carried from the CLI into the orchestrator. Values are
/// copied into each job at creation time.
#[derive(Debug, Clone)]
pub struct Opts {
    pub user: String,
    pub port: u16,
    pub retries: u32,
    pub workers: u32,
    pub files: Vec<String>,
    pub conn_timeout: Duration,
    pub exec_timeout: Duration,
    pub history: bool,
    pub history_path: PathBuf,
    pub upload_path: String,
    pub insecure: bool,
    pub download_path: String,
    pub tasks: Tasks,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            user: "root".into(),
            port: 22,
            retries: 5,
            workers: 10,
            files: vec![],
            conn_timeout: Duration::from_secs(30),
            exec_timeout: Duration::from_secs(3600),
            history: false,
            history_path: PathBuf::new(),
            upload_path: String::new(),
            insecure: false,
            download_path: ".".into(),
            tasks: Tasks::default(),
        }
    }
}
