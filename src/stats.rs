//! Run statistics.

use std::collections::HashMap;
use std::io::{self, Write};

use crate::error::RunError;
use crate::run::ArchiveEntry;

/// Summarizes the archive into a counted report: a header carrying the
/// highest try count seen, one line per non-empty bucket, then the total.
pub fn write_stats(
    w: &mut dyn Write,
    archive: &HashMap<String, ArchiveEntry>,
) -> io::Result<()> {
    let mut max_try = 0;
    let (mut conn, mut file, mut exec, mut running, mut done) = (0, 0, 0, 0, 0);
    for (host, entry) in archive {
        max_try = max_try.max(entry.tries);
        match &entry.error {
            None if entry.tasks_done => done += 1,
            None => running += 1,
            Some(RunError::Connection(_)) => conn += 1,
            Some(RunError::FileTransfer(_)) => file += 1,
            Some(RunError::Execution(_)) | Some(RunError::DeadlineExceeded) => exec += 1,
            Some(err) => tracing::debug!(host = %host, error = %err, "job is in a bad state"),
        }
    }

    write!(w, "\n============== {max_try} =============\n")?;
    if conn > 0 {
        write!(w, " Connection failed:\t{conn}\n")?;
    }
    if file > 0 {
        write!(w, " File Transfer failed:\t{file}\n")?;
    }
    if exec > 0 {
        write!(w, " Execution failed:\t{exec}\n")?;
    }
    if running > 0 {
        write!(w, " Running:\t\t{running}\n")?;
    }
    if done > 0 {
        write!(w, " Done:\t\t\t{done}\n")?;
    }
    write!(w, "===============================\n")?;
    write!(w, " Total:\t{}\n", archive.len())?;
    write!(w, "===============================\n\n")?;
    Ok(())
}
