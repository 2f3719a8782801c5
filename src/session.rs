//! SSH transports.
//!
//! Production implementations of the transport traits: sessions ride on the
//! system ssh via `openssh` (one multiplexed master per host, agent and
//! identity files handled by ssh itself), the file transport on the sftp
//! subsystem via `openssh-sftp-client` over the same connection.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use openssh::{KnownHosts, Session, SessionBuilder, Stdio};
use openssh_sftp_client::file::TokioCompatFile;
use openssh_sftp_client::metadata::{MetaData, Permissions};
use openssh_sftp_client::{Sftp, SftpOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};

use crate::error::TransportError;
use crate::output::Output;
use crate::transport::{
    DialConfig, Dialer, FileKind, FileMeta, FileTransport, SessionTransport, WalkEntry,
};

fn protocol(err: impl std::fmt::Display) -> TransportError {
    TransportError::Protocol(err.to_string())
}

/// Dials hosts through the system ssh.
pub struct SshDialer;

#[async_trait]
impl Dialer for SshDialer {
    async fn dial(
        &self,
        addr: &str,
        config: &DialConfig,
    ) -> Result<Box<dyn SessionTransport>, TransportError> {
        let (host, port) = match addr.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>()
                    .map_err(|_| protocol(format!("bad port in {addr:?}")))?,
            ),
            None => (addr, 22),
        };

        let mut builder = SessionBuilder::default();
        builder
            .user(config.user.clone())
            .port(port)
            .connect_timeout(config.connect_timeout)
            .known_hosts_check(if config.accept_unknown {
                KnownHosts::Accept
            } else {
                KnownHosts::Strict
            });
        let session = builder.connect(host).await.map_err(protocol)?;

        Ok(Box::new(SshSession {
            session: Some(Arc::new(session)),
        }))
    }
}

struct SshSession {
    session: Option<Arc<Session>>,
}

impl SshSession {
    fn session(&self) -> Result<&Arc<Session>, TransportError> {
        self.session
            .as_ref()
            .ok_or_else(|| protocol("session closed"))
    }
}

async fn stream_into(reader: impl AsyncRead + Unpin, out: Arc<Output>) {
    let mut reader = BufReader::new(reader);
    loop {
        let n = {
            let Ok(buf) = reader.fill_buf().await else {
                break;
            };
            // An empty buffer means the stream has reached EOF.
            if buf.is_empty() {
                break;
            }
            let _ = out.write(buf);
            buf.len()
        };
        reader.consume(n);
    }
}

#[async_trait]
impl SessionTransport for SshSession {
    async fn run(&mut self, cmd: &str, out: Arc<Output>) -> Result<(), TransportError> {
        let session = self.session()?;
        let mut child = session
            .command("sh")
            .arg("-c")
            .arg(cmd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .await
            .map_err(protocol)?;

        let stdout = child.stdout().take().ok_or_else(|| protocol("no stdout"))?;
        let stderr = child.stderr().take().ok_or_else(|| protocol("no stderr"))?;
        tokio::join!(
            stream_into(stdout, Arc::clone(&out)),
            stream_into(stderr, Arc::clone(&out)),
        );

        let status = child.wait().await.map_err(protocol)?;
        if !status.success() {
            return Err(TransportError::ExitStatus(status.code().unwrap_or(-1)));
        }
        Ok(())
    }

    async fn is_alive(&mut self) -> bool {
        match self.session.as_ref() {
            Some(session) => session.check().await.is_ok(),
            None => false,
        }
    }

    async fn open_files(&mut self) -> Result<Box<dyn FileTransport>, TransportError> {
        let session = self.session()?;
        let sftp = Sftp::from_clonable_session(Arc::clone(session), SftpOptions::new())
            .await
            .map_err(protocol)?;
        Ok(Box::new(SftpTransport { sftp: Some(sftp) }))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // The sftp side may still hold a reference; the last drop tears the
        // master connection down.
        if let Some(session) = self.session.take() {
            if let Ok(session) = Arc::try_unwrap(session) {
                session.close().await.map_err(protocol)?;
            }
        }
        Ok(())
    }
}

fn mode_of(permissions: &Permissions) -> u32 {
    let bits = [
        (permissions.read_by_owner(), 0o400),
        (permissions.write_by_owner(), 0o200),
        (permissions.execute_by_owner(), 0o100),
        (permissions.read_by_group(), 0o040),
        (permissions.write_by_group(), 0o020),
        (permissions.execute_by_group(), 0o010),
        (permissions.read_by_other(), 0o004),
        (permissions.write_by_other(), 0o002),
        (permissions.execute_by_other(), 0o001),
    ];
    bits.iter().filter(|(set, _)| *set).map(|(_, bit)| bit).sum()
}

fn permissions_of(mode: u32) -> Permissions {
    let mut p = Permissions::new();
    p.set_read_by_owner(mode & 0o400 != 0);
    p.set_write_by_owner(mode & 0o200 != 0);
    p.set_execute_by_owner(mode & 0o100 != 0);
    p.set_read_by_group(mode & 0o040 != 0);
    p.set_write_by_group(mode & 0o020 != 0);
    p.set_execute_by_group(mode & 0o010 != 0);
    p.set_read_by_other(mode & 0o004 != 0);
    p.set_write_by_other(mode & 0o002 != 0);
    p.set_execute_by_other(mode & 0o001 != 0);
    p
}

fn meta_of(meta: &MetaData) -> FileMeta {
    let kind = match meta.file_type() {
        Some(t) if t.is_dir() => FileKind::Dir,
        Some(t) if t.is_symlink() => FileKind::Symlink,
        Some(t) if t.is_file() => FileKind::File,
        _ => FileKind::Other,
    };
    FileMeta {
        kind,
        mode: meta.permissions().as_ref().map(mode_of).unwrap_or(0o644),
        size: meta.len().unwrap_or(0),
    }
}

fn contains_meta(component: &str) -> bool {
    component.contains(['*', '?', '['])
}

struct SftpTransport {
    sftp: Option<Sftp>,
}

impl SftpTransport {
    fn sftp(&self) -> Result<&Sftp, TransportError> {
        self.sftp
            .as_ref()
            .ok_or_else(|| protocol("file transport closed"))
    }

    async fn read_dir_names(&self, dir: &str) -> Result<Vec<String>, TransportError> {
        let fs_dir = self
            .sftp()?
            .fs()
            .open_dir(Path::new(dir))
            .await
            .map_err(protocol)?;
        let entries: Vec<_> = fs_dir.read_dir().try_collect().await.map_err(protocol)?;
        let mut names: Vec<String> = entries
            .iter()
            .map(|e| e.filename().to_string_lossy().into_owned())
            .filter(|n| n != "." && n != "..")
            .collect();
        names.sort();
        Ok(names)
    }
}

#[async_trait]
impl FileTransport for SftpTransport {
    async fn mkdir_all(&mut self, path: &str) -> Result<(), TransportError> {
        let mut current = if path.starts_with('/') {
            String::from("/")
        } else {
            String::new()
        };
        for component in path.split('/').filter(|c| !c.is_empty()) {
            if !current.is_empty() && !current.ends_with('/') {
                current.push('/');
            }
            current.push_str(component);
            if self
                .sftp()?
                .fs()
                .metadata(Path::new(&current))
                .await
                .is_ok()
            {
                continue;
            }
            self.sftp()?
                .fs()
                .create_dir(Path::new(&current))
                .await
                .map_err(protocol)?;
        }
        Ok(())
    }

    async fn stat(&mut self, path: &str) -> Result<FileMeta, TransportError> {
        let meta = self
            .sftp()?
            .fs()
            .metadata(Path::new(path))
            .await
            .map_err(protocol)?;
        Ok(meta_of(&meta))
    }

    async fn lstat(&mut self, path: &str) -> Result<FileMeta, TransportError> {
        let meta = self
            .sftp()?
            .fs()
            .symlink_metadata(Path::new(path))
            .await
            .map_err(protocol)?;
        Ok(meta_of(&meta))
    }

    async fn open(
        &mut self,
        path: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, TransportError> {
        let file = self.sftp()?.open(Path::new(path)).await.map_err(protocol)?;
        Ok(Box::new(Box::pin(TokioCompatFile::from(file))))
    }

    async fn create(
        &mut self,
        path: &str,
    ) -> Result<Box<dyn AsyncWrite + Send + Unpin>, TransportError> {
        let file = self
            .sftp()?
            .create(Path::new(path))
            .await
            .map_err(protocol)?;
        Ok(Box::new(Box::pin(TokioCompatFile::from(file))))
    }

    async fn chmod(&mut self, path: &str, mode: u32) -> Result<(), TransportError> {
        self.sftp()?
            .fs()
            .set_permissions(Path::new(path), permissions_of(mode))
            .await
            .map_err(protocol)
    }

    async fn posix_rename(&mut self, from: &str, to: &str) -> Result<(), TransportError> {
        self.sftp()?
            .fs()
            .rename(Path::new(from), Path::new(to))
            .await
            .map_err(protocol)
    }

    async fn remove(&mut self, path: &str) -> Result<(), TransportError> {
        self.sftp()?
            .fs()
            .remove_file(Path::new(path))
            .await
            .map_err(protocol)
    }

    async fn glob(&mut self, pattern: &str) -> Result<Vec<String>, TransportError> {
        if !contains_meta(pattern) {
            return match self.lstat(pattern).await {
                Ok(_) => Ok(vec![pattern.to_string()]),
                Err(_) => Ok(vec![]),
            };
        }

        let absolute = pattern.starts_with('/');
        let mut bases = vec![if absolute {
            String::from("/")
        } else {
            String::new()
        }];
        for component in pattern.split('/').filter(|c| !c.is_empty()) {
            let mut expanded = Vec::new();
            for base in &bases {
                if !contains_meta(component) {
                    expanded.push(join_remote(base, component));
                    continue;
                }
                let pat = glob::Pattern::new(component).map_err(protocol)?;
                let dir = if base.is_empty() { "." } else { base.as_str() };
                let Ok(names) = self.read_dir_names(dir).await else {
                    continue;
                };
                for name in names {
                    if pat.matches(&name) {
                        expanded.push(join_remote(base, &name));
                    }
                }
            }
            bases = expanded;
        }

        let mut matches = Vec::new();
        for candidate in bases {
            if self.lstat(&candidate).await.is_ok() {
                matches.push(candidate);
            }
        }
        Ok(matches)
    }

    async fn walk(&mut self, root: &str) -> Result<Vec<WalkEntry>, TransportError> {
        let mut acc = Vec::new();
        let mut stack = vec![root.to_string()];
        while let Some(path) = stack.pop() {
            let meta = self.lstat(&path).await?;
            // Symlinked directories show up as a single entry; descending
            // them invites cycles and double fetches.
            if meta.kind == FileKind::Dir {
                let mut names = self.read_dir_names(&path).await?;
                names.reverse();
                for name in names {
                    stack.push(join_remote(&path, &name));
                }
            }
            acc.push(WalkEntry { path, meta });
        }
        Ok(acc)
    }

    async fn read_link(&mut self, path: &str) -> Result<String, TransportError> {
        let target = self
            .sftp()?
            .fs()
            .read_link(Path::new(path))
            .await
            .map_err(protocol)?;
        Ok(target.to_string_lossy().into_owned())
    }

    async fn getwd(&mut self) -> Result<String, TransportError> {
        let cwd = self
            .sftp()?
            .fs()
            .canonicalize(Path::new("."))
            .await
            .map_err(protocol)?;
        Ok(cwd.to_string_lossy().into_owned())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(sftp) = self.sftp.take() {
            sftp.close().await.map_err(protocol)?;
        }
        Ok(())
    }
}

fn join_remote(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else if base.ends_with('/') {
        format!("{base}{name}")
    } else {
        format!("{base}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_bits_round_trip() {
        for mode in [0o644, 0o755, 0o600, 0o751, 0o777, 0o000] {
            assert_eq!(mode_of(&permissions_of(mode)), mode, "mode {mode:o}");
        }
    }

    #[test]
    fn meta_detection() {
        assert!(contains_meta("*.log"));
        assert!(contains_meta("file?"));
        assert!(contains_meta("[ab]c"));
        assert!(!contains_meta("plain.txt"));
    }

    #[test]
    fn join_remote_handles_roots() {
        assert_eq!(join_remote("/", "logs"), "/logs");
        assert_eq!(join_remote("/logs", "app.log"), "/logs/app.log");
        assert_eq!(join_remote("", "rel"), "rel");
    }
}
