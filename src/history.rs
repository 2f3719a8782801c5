//! Run history.
//!
//! Every recorded run owns one directory, `<root>/<YYYY-MM-DD>/<HH-MM-SS>.<pid>/`,
//! holding small metadata files (`start`, `command`, `files`, `duration`,
//! `hosts.json`) next to the per-host per-try `*.log` streams. The
//! [`Recorder`] writes that layout while a run is in flight; [`list_history`]
//! parses it back, skipping anything malformed rather than giving up on the
//! whole root.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Final execution state of a single host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HostResult {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub tries: u32,
    #[serde(with = "crate::serde::nanos", default)]
    pub duration: Duration,
}

/// Identifier of one run: `<YYYY-MM-DD>/<HH-MM-SS>.<pid>`, doubling as the
/// run's subdirectory under the history root.
pub fn run_id() -> String {
    let now = Local::now();
    format!(
        "{}.{}",
        now.format("%Y-%m-%d/%H-%M-%S"),
        std::process::id()
    )
}

fn round_secs(d: Duration) -> Duration {
    let mut secs = d.as_secs();
    if d.subsec_nanos() >= 500_000_000 {
        secs += 1;
    }
    Duration::from_secs(secs)
}

/// Writes one run's directory while the run is in flight.
///
/// Metadata write failures after creation are logged and swallowed; a
/// history that is missing a field is still worth more than an aborted run.
pub struct Recorder {
    path: PathBuf,
}

impl Recorder {
    /// Creates the run directory (mode 0700) and stamps `command`, `files`
    /// and `start`.
    pub fn create(root: &Path, run_id: &str, cmd: &str, files: &[String]) -> io::Result<Self> {
        let path = root.join(run_id);
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&path)?;

        let rec = Self { path };
        rec.write_meta("command", cmd);
        rec.write_meta("files", &files.join("\n"));
        rec.write_meta(
            "start",
            &Local::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, false),
        );
        Ok(rec)
    }

    /// The run directory; per-host logs are opened inside it.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stamps `duration` and `hosts.json`. Runs even after cancellation, so
    /// an interrupted run leaves a partial but parseable record.
    pub fn finish(&self, elapsed: Duration, hosts: &HashMap<String, HostResult>) {
        self.write_meta("duration", &humantime::format_duration(elapsed).to_string());
        match serde_json::to_string_pretty(hosts) {
            Ok(json) => self.write_meta("hosts.json", &json),
            Err(err) => tracing::error!(error = %err, "failed to encode hosts.json"),
        }
    }

    fn write_meta(&self, name: &str, content: &str) {
        use std::os::unix::fs::PermissionsExt;

        let path = self.path.join(name);
        let res = fs::write(&path, content)
            .and_then(|_| fs::set_permissions(&path, fs::Permissions::from_mode(0o644)));
        if let Err(err) = res {
            tracing::error!(file = %path.display(), error = %err, "failed to write history metadata");
        }
    }
}

/// One recorded run, as parsed back from its directory.
#[derive(Debug, Clone)]
pub struct HistoryItem {
    pub path: PathBuf,
    pub time: DateTime<Local>,
    pub duration: Duration,
    pub hosts: HashMap<String, HostResult>,
    pub files: Vec<String>,
    pub logs: Vec<String>,
    pub command: String,
}

/// Human-readable status for a host result.
fn status_string(r: &HostResult) -> &'static str {
    match r.error.as_str() {
        "" => "OK",
        "connection" => "Connection Failed",
        "transfer" => "Transfer Failed",
        "execution" => "Execution Failed",
        _ => "Failed",
    }
}

impl HistoryItem {
    /// Counts of succeeded and failed hosts.
    pub fn summary(&self) -> (usize, usize) {
        let succeeded = self.hosts.values().filter(|r| r.error.is_empty()).count();
        (succeeded, self.hosts.len() - succeeded)
    }

    /// Renders the full record: header, the succeeded and failed buckets
    /// with per-host tries and rounded durations, then the log paths.
    pub fn write_to(&self, w: &mut dyn Write) -> io::Result<()> {
        writeln!(w, "Start Time:\t{}", self.time.format("%Y-%m-%d %H:%M:%S %:z"))?;
        writeln!(w, "Duration:\t{}", humantime::format_duration(self.duration))?;
        writeln!(w, "Command:\t{}", self.command)?;
        writeln!(w, "Files:\t\t{}\n", self.files.join("\n\t\t"))?;

        let mut hosts: Vec<&String> = self.hosts.keys().collect();
        hosts.sort();
        let mut ok_lines = Vec::with_capacity(hosts.len());
        let mut err_lines = Vec::with_capacity(hosts.len());
        for host in hosts {
            let r = &self.hosts[host];
            let rounded = humantime::format_duration(round_secs(r.duration));
            if r.error.is_empty() {
                ok_lines.push(format!("{host}:\t{} tries in {rounded}", r.tries));
            } else {
                err_lines.push(format!("{host}:\t{} in {rounded}", status_string(r)));
            }
        }

        writeln!(w, "Succeeded ({}):\n\t\t{}\n", ok_lines.len(), ok_lines.join("\n\t\t"))?;
        writeln!(w, "Failed ({}):\n\t\t{}\n", err_lines.len(), err_lines.join("\n\t\t"))?;
        writeln!(w, "Logs:\t\t{}\n", self.logs.join("\n\t\t"))?;
        Ok(())
    }

    /// Removes the underlying run directory. A directory already gone is
    /// not an error.
    pub fn delete(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }
}

/// Parses the time encoded in a `<date>/<time>.<pid>` entry name.
fn entry_time(date: &str, time_pid: &str) -> Option<DateTime<Local>> {
    let time = time_pid.split('.').next().unwrap_or(time_pid);
    let naive = chrono::NaiveDateTime::parse_from_str(
        &format!("{date}/{time}"),
        "%Y-%m-%d/%H-%M-%S",
    )
    .ok()?;
    naive.and_local_timezone(Local).earliest()
}

/// Walks the history root two levels deep and parses every run directory
/// into a [`HistoryItem`], newest first. Unparseable entries are skipped
/// with a log line; per-field I/O problems degrade the item instead of
/// aborting the listing.
pub fn list_history(root: &Path) -> io::Result<Vec<HistoryItem>> {
    let mut items = Vec::new();

    for date_entry in fs::read_dir(root)? {
        let date_entry = match date_entry {
            Ok(e) => e,
            Err(err) => {
                tracing::error!(error = %err, "failed to read history root entry");
                continue;
            }
        };
        if !date_entry.path().is_dir() {
            continue;
        }
        let date = date_entry.file_name().to_string_lossy().into_owned();

        let runs = match fs::read_dir(date_entry.path()) {
            Ok(r) => r,
            Err(err) => {
                tracing::error!(dir = %date, error = %err, "failed to read history date directory");
                continue;
            }
        };
        for run_entry in runs.flatten() {
            if !run_entry.path().is_dir() {
                continue;
            }
            let name = run_entry.file_name().to_string_lossy().into_owned();
            let Some(time) = entry_time(&date, &name) else {
                tracing::error!(name = format!("{date}/{name}"), "bad history entry");
                continue;
            };
            items.push(read_item(run_entry.path(), time));
        }
    }

    items.sort_by_key(|item| std::cmp::Reverse(item.time.timestamp_micros()));
    Ok(items)
}

fn read_item(path: PathBuf, name_time: DateTime<Local>) -> HistoryItem {
    let mut item = HistoryItem {
        path: path.clone(),
        time: name_time,
        duration: Duration::ZERO,
        hosts: HashMap::new(),
        files: vec![],
        logs: vec![],
        command: String::new(),
    };

    let entries = match fs::read_dir(&path) {
        Ok(e) => e,
        Err(err) => {
            tracing::error!(path = %path.display(), error = %err, "failed to read history entry");
            return item;
        }
    };

    for entry in entries.flatten() {
        // Anything deeper than the run directory itself is not ours.
        if entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        match name.as_str() {
            "start" => {
                if let Some(content) = read_meta(&entry.path()) {
                    match DateTime::parse_from_rfc3339(content.trim()) {
                        Ok(t) => item.time = t.with_timezone(&Local),
                        Err(err) => {
                            tracing::error!(path = %entry.path().display(), error = %err, "failed to parse start")
                        }
                    }
                }
            }
            "command" => {
                if let Some(content) = read_meta(&entry.path()) {
                    item.command = content.trim_end().to_string();
                }
            }
            "files" => {
                if let Some(content) = read_meta(&entry.path()) {
                    item.files = content
                        .lines()
                        .filter(|l| !l.is_empty())
                        .map(str::to_string)
                        .collect();
                }
            }
            "duration" => {
                if let Some(content) = read_meta(&entry.path()) {
                    match humantime::parse_duration(content.trim()) {
                        Ok(d) => item.duration = round_secs(d),
                        Err(err) => {
                            tracing::error!(path = %entry.path().display(), error = %err, "failed to parse duration")
                        }
                    }
                }
            }
            "hosts.json" => {
                if let Some(content) = read_meta(&entry.path()) {
                    match serde_json::from_str(&content) {
                        Ok(hosts) => item.hosts = hosts,
                        Err(err) => {
                            tracing::error!(path = %entry.path().display(), error = %err, "failed to parse hosts.json")
                        }
                    }
                }
            }
            _ => {
                if name.ends_with(".log") {
                    item.logs.push(entry.path().to_string_lossy().into_owned());
                }
            }
        }
    }

    item.logs.sort();
    item
}

fn read_meta(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(content) => Some(content),
        Err(err) => {
            tracing::error!(path = %path.display(), error = %err, "failed to read history file");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_entry(root: &Path, date: &str, time_pid: &str) -> PathBuf {
        let path = root.join(date).join(time_pid);
        fs::create_dir_all(&path).unwrap();
        path
    }

    #[test]
    fn recorder_round_trip() {
        let root = tempfile::tempdir().unwrap();
        let files = vec!["a.sh".to_string(), "b.txt".to_string()];
        let rec = Recorder::create(root.path(), &run_id(), "uptime", &files).unwrap();

        let mut hosts = HashMap::new();
        hosts.insert(
            "h1".to_string(),
            HostResult {
                error: String::new(),
                tries: 1,
                duration: Duration::from_secs(10),
            },
        );
        hosts.insert(
            "h2".to_string(),
            HostResult {
                error: "connection".to_string(),
                tries: 3,
                duration: Duration::from_secs(30),
            },
        );
        rec.finish(Duration::from_secs(42), &hosts);

        let items = list_history(root.path()).unwrap();
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(item.command, "uptime");
        assert_eq!(item.files, files);
        assert_eq!(item.duration, Duration::from_secs(42));
        assert_eq!(item.hosts, hosts);
        assert_eq!(item.summary(), (1, 1));
    }

    #[test]
    fn list_sorted_descending_by_time() {
        let root = tempfile::tempdir().unwrap();
        make_entry(root.path(), "2025-03-01", "10-00-00.42");
        make_entry(root.path(), "2025-03-02", "09-00-00.42");
        make_entry(root.path(), "2025-03-01", "11-30-00.42");

        let items = list_history(root.path()).unwrap();
        let names: Vec<String> = items
            .iter()
            .map(|i| i.time.format("%Y-%m-%d/%H-%M-%S").to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "2025-03-02/09-00-00",
                "2025-03-01/11-30-00",
                "2025-03-01/10-00-00"
            ]
        );
    }

    #[test]
    fn start_file_overrides_name_time() {
        let root = tempfile::tempdir().unwrap();
        let path = make_entry(root.path(), "2025-03-01", "10-00-00.42");
        fs::write(path.join("start"), "2025-06-15T08:30:00+00:00").unwrap();

        let items = list_history(root.path()).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(
            items[0].time.with_timezone(&chrono::Utc).to_rfc3339(),
            "2025-06-15T08:30:00+00:00"
        );
    }

    #[test]
    fn bad_entry_name_is_skipped() {
        let root = tempfile::tempdir().unwrap();
        make_entry(root.path(), "2025-03-01", "10-00-00.42");
        make_entry(root.path(), "not-a-date", "whatever");
        make_entry(root.path(), "2025-03-01", "not-a-time");

        let items = list_history(root.path()).unwrap();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn malformed_metadata_degrades_quietly() {
        let root = tempfile::tempdir().unwrap();
        let path = make_entry(root.path(), "2025-03-01", "10-00-00.42");
        fs::write(path.join("duration"), "not a duration").unwrap();
        fs::write(path.join("hosts.json"), "{ nope").unwrap();
        fs::write(path.join("start"), "whenever").unwrap();

        let items = list_history(root.path()).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].duration, Duration::ZERO);
        assert!(items[0].hosts.is_empty());
    }

    #[test]
    fn logs_are_collected() {
        let root = tempfile::tempdir().unwrap();
        let path = make_entry(root.path(), "2025-03-01", "10-00-00.42");
        fs::write(path.join("h1_1.log"), "stream").unwrap();
        fs::write(path.join("h1_2.log"), "stream").unwrap();
        fs::write(path.join("notes.txt"), "ignored").unwrap();

        let items = list_history(root.path()).unwrap();
        assert_eq!(items[0].logs.len(), 2);
        assert!(items[0].logs[0].ends_with("h1_1.log"));
    }

    #[test]
    fn nested_directories_are_ignored() {
        let root = tempfile::tempdir().unwrap();
        let path = make_entry(root.path(), "2025-03-01", "10-00-00.42");
        fs::create_dir_all(path.join("deeper/still")).unwrap();
        fs::write(path.join("deeper/rogue.log"), "x").unwrap();

        let items = list_history(root.path()).unwrap();
        assert_eq!(items.len(), 1);
        assert!(items[0].logs.is_empty());
    }

    #[test]
    fn delete_missing_directory_is_fine() {
        let item = HistoryItem {
            path: PathBuf::from("/definitely/not/there"),
            time: Local::now(),
            duration: Duration::ZERO,
            hosts: HashMap::new(),
            files: vec![],
            logs: vec![],
            command: String::new(),
        };
        item.delete().unwrap();
    }

    #[test]
    fn write_to_renders_buckets() {
        let mut hosts = HashMap::new();
        hosts.insert(
            "ok-host".to_string(),
            HostResult {
                error: String::new(),
                tries: 2,
                duration: Duration::from_millis(9_700),
            },
        );
        hosts.insert(
            "sad-host".to_string(),
            HostResult {
                error: "execution".to_string(),
                tries: 5,
                duration: Duration::from_secs(3),
            },
        );
        let item = HistoryItem {
            path: PathBuf::new(),
            time: Local::now(),
            duration: Duration::from_secs(12),
            hosts,
            files: vec!["a.sh".into()],
            logs: vec!["/x/h_1.log".into()],
            command: "uptime".into(),
        };

        let mut buf = Vec::new();
        item.write_to(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("Command:\tuptime"));
        assert!(text.contains("Succeeded (1):"));
        assert!(text.contains("Failed (1):"));
        assert!(text.contains("ok-host:\t2 tries in 10s"), "{text}");
        assert!(text.contains("sad-host:\tExecution Failed in 3s"), "{text}");
    }
}
