//! File-transfer operations, written against the abstract file transport.
//!
//! Uploads are atomic: bytes land in a `<final>_<random>.tmp` sibling first
//! and are renamed over the final name, so a consumer on the remote side
//! observes either the previous content or the complete new file. Downloads
//! preserve the full remote path under the local root and never overwrite an
//! existing local path, which keeps re-runs idempotent.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::RngCore;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::error::{RunError, TransferError, TransportError};
use crate::output::Output;
use crate::transport::{FileKind, FileMeta, FileTransport};

fn transfer(step: &'static str, path: impl Into<String>, source: TransportError) -> RunError {
    RunError::FileTransfer(TransferError::new(step, path, source))
}

fn rand_hex(n: usize) -> String {
    let mut b = vec![0u8; n.div_ceil(2)];
    rand::thread_rng().fill_bytes(&mut b);
    let mut s: String = b.iter().map(|x| format!("{x:02x}")).collect();
    s.truncate(n);
    s
}

/// Joins remote path components with a forward slash, whatever the local
/// platform separator is.
fn remote_join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}

fn base_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

/// Maps a remote path under the local root, preserving the full remote path.
fn local_target(root: &Path, remote: &str) -> PathBuf {
    root.join(remote.trim_start_matches('/'))
}

/// Creates the local parent directories of a download target with mode 0755,
/// whatever the umask says. Directories that already exist keep their mode;
/// the tree walk may have created them with the remote permissions.
fn create_parent(target: &Path) -> Result<(), RunError> {
    let Some(parent) = target.parent() else {
        return Ok(());
    };
    create_dir_0755(parent)
        .map_err(|e| transfer("create dir", parent.display().to_string(), e.into()))
}

fn create_dir_0755(dir: &Path) -> std::io::Result<()> {
    match dir.metadata() {
        Ok(meta) if meta.is_dir() => return Ok(()),
        // Something non-directory sits there; create_dir reports it.
        Ok(_) => {}
        Err(_) => {
            if let Some(up) = dir.parent() {
                create_dir_0755(up)?;
            }
        }
    }
    std::fs::create_dir(dir)?;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o755))
}

/// Uploads local `files` into the remote directory `dir`.
///
/// When `make_first_exec` is set, the first uploaded file gets the executable
/// bits added on top of its local permissions; it is the implicit entry point
/// a pending exec task will run.
pub async fn upload(
    ctx: &CancellationToken,
    ft: &mut dyn FileTransport,
    dir: &str,
    files: &[String],
    make_first_exec: bool,
) -> Result<(), RunError> {
    if ctx.is_cancelled() {
        return Err(RunError::Cancelled);
    }

    if !dir.is_empty() {
        ft.mkdir_all(dir)
            .await
            .map_err(|e| transfer("mkdir", dir, e))?;
    }

    for (i, file) in files.iter().enumerate() {
        if ctx.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        let exec = make_first_exec && i == 0;
        upload_file(ft, dir, file, exec).await?;
    }

    Ok(())
}

async fn upload_file(
    ft: &mut dyn FileTransport,
    dir: &str,
    file: &str,
    make_exec: bool,
) -> Result<(), RunError> {
    let mut local = tokio::fs::File::open(file)
        .await
        .map_err(|e| transfer("open", file, e.into()))?;
    let meta = local
        .metadata()
        .await
        .map_err(|e| transfer("stat", file, e.into()))?;
    let mut mode = meta.permissions().mode() & 0o7777;
    if make_exec {
        mode |= 0o111;
    }

    let filename = remote_join(dir, &base_name(file));
    let tempname = format!("{}_{}.tmp", filename, rand_hex(32));

    // Any failure past this point leaves a temp file behind; remove it
    // best-effort before reporting the error.
    let res = async {
        let mut temp = ft
            .create(&tempname)
            .await
            .map_err(|e| transfer("create", &tempname, e))?;
        ft.chmod(&tempname, mode)
            .await
            .map_err(|e| transfer("chmod", &tempname, e))?;
        tokio::io::copy(&mut local, &mut temp)
            .await
            .map_err(|e| transfer("copy", file, e.into()))?;
        temp.shutdown()
            .await
            .map_err(|e| transfer("close", &tempname, e.into()))?;
        ft.posix_rename(&tempname, &filename)
            .await
            .map_err(|e| transfer("rename", &filename, e))?;
        Ok(())
    }
    .await;

    if res.is_err() {
        let _ = ft.remove(&tempname).await;
    }
    res
}

/// Downloads every remote path matching `patterns` into `local_root`.
///
/// Patterns expand on the remote side; a pattern without matches is reported
/// through the sink rather than failing the attempt. Matches dispatch on the
/// lstat kind: regular files are fetched, directories are walked, symlinks
/// are recreated with their verbatim target.
pub async fn download(
    ctx: &CancellationToken,
    ft: &mut dyn FileTransport,
    local_root: &Path,
    patterns: &[String],
    out: &Arc<Output>,
) -> Result<(), RunError> {
    for pattern in patterns {
        if ctx.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        let matches = ft
            .glob(pattern)
            .await
            .map_err(|e| transfer("glob", pattern, e))?;
        if matches.is_empty() {
            let _ = out.write(format!("no remote match for {pattern:?}\n").as_bytes());
            continue;
        }

        for path in matches {
            if ctx.is_cancelled() {
                return Err(RunError::Cancelled);
            }
            download_path(ctx, ft, local_root, &path).await?;
        }
    }

    Ok(())
}

async fn download_path(
    ctx: &CancellationToken,
    ft: &mut dyn FileTransport,
    local_root: &Path,
    path: &str,
) -> Result<(), RunError> {
    let meta = ft
        .lstat(path)
        .await
        .map_err(|e| transfer("lstat", path, e))?;

    match meta.kind {
        FileKind::Dir => download_dir(ctx, ft, local_root, path).await,
        FileKind::Symlink => download_symlink(ft, local_root, path).await,
        _ => download_file(ft, local_root, path, meta).await,
    }
}

async fn download_file(
    ft: &mut dyn FileTransport,
    local_root: &Path,
    path: &str,
    meta: FileMeta,
) -> Result<(), RunError> {
    let target = local_target(local_root, path);
    if target.symlink_metadata().is_ok() {
        // Present from an earlier try; keep whatever is there.
        return Ok(());
    }

    create_parent(&target)?;

    let mut remote = ft.open(path).await.map_err(|e| transfer("open", path, e))?;

    let temp = target.with_file_name(format!(
        "{}_{}.tmp",
        target.file_name().unwrap_or_default().to_string_lossy(),
        rand_hex(32)
    ));
    let res = async {
        let mut local = tokio::fs::File::create(&temp)
            .await
            .map_err(|e| transfer("create", temp.display().to_string(), e.into()))?;
        std::fs::set_permissions(&temp, std::fs::Permissions::from_mode(meta.mode))
            .map_err(|e| transfer("chmod", temp.display().to_string(), e.into()))?;
        tokio::io::copy(&mut remote, &mut local)
            .await
            .map_err(|e| transfer("copy", path, e.into()))?;
        local
            .shutdown()
            .await
            .map_err(|e| transfer("close", temp.display().to_string(), e.into()))?;
        std::fs::rename(&temp, &target)
            .map_err(|e| transfer("rename", target.display().to_string(), e.into()))?;
        Ok(())
    }
    .await;

    if res.is_err() {
        let _ = std::fs::remove_file(&temp);
    }
    res
}

async fn download_dir(
    ctx: &CancellationToken,
    ft: &mut dyn FileTransport,
    local_root: &Path,
    dir: &str,
) -> Result<(), RunError> {
    let entries = ft.walk(dir).await.map_err(|e| transfer("walk", dir, e))?;

    for entry in entries {
        if ctx.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        match entry.meta.kind {
            FileKind::Dir => {
                let target = local_target(local_root, &entry.path);
                std::fs::create_dir_all(&target)
                    .map_err(|e| transfer("create dir", target.display().to_string(), e.into()))?;
                std::fs::set_permissions(
                    &target,
                    std::fs::Permissions::from_mode(entry.meta.mode),
                )
                .map_err(|e| transfer("chmod", target.display().to_string(), e.into()))?;
            }
            FileKind::Symlink => download_symlink(ft, local_root, &entry.path).await?,
            _ => download_file(ft, local_root, &entry.path, entry.meta).await?,
        }
    }

    Ok(())
}

async fn download_symlink(
    ft: &mut dyn FileTransport,
    local_root: &Path,
    path: &str,
) -> Result<(), RunError> {
    let link_target = ft
        .read_link(path)
        .await
        .map_err(|e| transfer("readlink", path, e))?;

    let target = local_target(local_root, path);
    if target.symlink_metadata().is_ok() {
        return Ok(());
    }

    create_parent(&target)?;

    std::os::unix::fs::symlink(&link_target, &target)
        .map_err(|e| transfer("symlink", target.display().to_string(), e.into()))?;

    Ok(())
}

/// Removes the remote counterpart of every uploaded file.
pub async fn cleanup(
    ctx: &CancellationToken,
    ft: &mut dyn FileTransport,
    dir: &str,
    files: &[String],
) -> Result<(), RunError> {
    for file in files {
        if ctx.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        let filename = remote_join(dir, &base_name(file));
        ft.remove(&filename)
            .await
            .map_err(|e| transfer("remove", &filename, e))?;
    }

    Ok(())
}

/// Whether the file transport still answers; failures are only interesting
/// at debug level.
pub async fn files_alive(ft: &mut dyn FileTransport) -> bool {
    match ft.getwd().await {
        Ok(_) => true,
        Err(err) => {
            tracing::debug!(error = %err, "file transport liveness probe failed");
            false
        }
    }
}
