//! Hosts.
//!
//! A host is kept as the `[user@]host[:port]` string it appears as in the
//! hosts file, with the default port appended when missing. One job is
//! created per host and each connection runs in parallel with the others in
//! its own worker.

use std::fs;
use std::io;

use itertools::Itertools;

/// Reads `path` and returns all the hosts inside, sorted with duplicates
/// removed. Empty lines are ignored and `#` starts a comment through the end
/// of the line. Hosts without a port suffix get `:<default_port>` appended.
pub fn read_hosts(path: &str, default_port: u16) -> io::Result<Vec<String>> {
    let content = fs::read_to_string(path)?;

    let hosts = content
        .lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .map(|line| {
            if line.contains(':') {
                line.to_string()
            } else {
                format!("{line}:{default_port}")
            }
        })
        .sorted()
        .dedup()
        .collect();

    Ok(hosts)
}

/// Splits an optional inline `user@` prefix off a host entry.
pub fn split_user(server: &str) -> (Option<&str>, &str) {
    match server.split_once('@') {
        Some((user, rest)) => (Some(user), rest),
        None => (None, server),
    }
}

/// The bare hostname of a `host[:port]` entry, used for output prefixes,
/// log-file names and hosts.json keys.
pub fn hostname(host: &str) -> &str {
    host.split(':').next().unwrap_or(host)
}
