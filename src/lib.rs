//! Drover: parallel SSH command execution across a herd of hosts.

// Serde helper module.
mod serde;
// Command line arguments and configuration.
pub mod config;
// Error handling.
pub mod error;
// Run history: the on-disk record and its reader.
pub mod history;
// How to parse and represent hosts.
pub mod host;
// Per-host jobs and their task pipeline.
pub mod job;
// Per-host line-buffered output sink.
pub mod output;
// The orchestrator.
pub mod run;
// SSH-backed production transports.
pub mod session;
// Run statistics.
pub mod stats;
// The set of things a job still has to do.
pub mod tasks;
// File-transfer operations.
pub mod transfer;
// Abstract transport seams.
pub mod transport;

pub use config::Opts;
pub use error::{RunError, TransferError, TransportError};
pub use history::{list_history, HistoryItem, HostResult, Recorder};
pub use job::Job;
pub use output::Output;
pub use run::run;
pub use session::SshDialer;
pub use tasks::Tasks;
pub use transport::{DialConfig, Dialer, FileTransport, SessionTransport};
