// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Log Tailer (C2). Follows a growing log file across rotations, yielding
//! lines, and optionally triggering a server-side log re-open when the
//! file grows past a size ceiling.

use std::{
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use bytes::BytesMut;
use nix::{sys::signal::Signal, unistd::Pid};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TailerError;

/// Between read bursts, the tailer caps itself at this many lines before
/// re-checking rotation/cancellation, per spec §4.2.
const BURST_LINES: usize = 1024;

/// Rotation threshold: 1 GiB.
const ROTATE_AT_BYTES: u64 = 1024 * 1024 * 1024;

const CATCH_UP_SLEEP: Duration = Duration::from_secs(1);

/// Identity (owner uid/gid and mode) the HTTP server expects a freshly
/// recreated log file to carry after rotation.
#[derive(Debug, Clone, Copy)]
pub struct FileIdentity {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

pub struct Tailer {
    path: PathBuf,
    file: tokio::fs::File,
    inode: u64,
    buf: BytesMut,
    read_buf: [u8; 8192],
}

impl Tailer {
    /// Opens `path` and records its current inode.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("failed to open log file {path:?}"))?;
        let meta = file.metadata().await?;

        Ok(Tailer {
            path,
            file,
            inode: meta.ino(),
            buf: BytesMut::with_capacity(8192),
            read_buf: [0u8; 8192],
        })
    }

    /// Snapshots the current file's owning uid/gid/mode, used as the
    /// identity a freshly recreated file after rotation should carry.
    pub async fn identity(&self) -> Result<FileIdentity> {
        let meta = self.file.metadata().await?;
        Ok(FileIdentity {
            uid: meta.uid(),
            gid: meta.gid(),
            mode: meta.mode(),
        })
    }

    /// Reads lines to EOF and stops. Used by the reporting modes (A4),
    /// which only need a single pass over the historical log.
    pub async fn lines_once(&mut self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        loop {
            let n = self.file.read(&mut self.read_buf).await?;
            if n == 0 {
                break;
            }
            self.buf.extend_from_slice(&self.read_buf[..n]);
            out.extend(self.drain_complete_lines());
        }
        Ok(out)
    }

    /// Follows the file indefinitely, invoking `on_line` for each
    /// complete line, sleeping 1s when caught up, and handling rotation
    /// between bursts of up to 1024 lines. Returns when `cancel` fires.
    pub async fn tail<F, Fut>(
        &mut self,
        identity: FileIdentity,
        reopen_signal_pid: Option<i32>,
        cancel: &CancellationToken,
        mut on_line: F,
    ) -> Result<()>
    where
        F: FnMut(String) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let mut emitted_in_burst = 0usize;
            loop {
                if emitted_in_burst >= BURST_LINES {
                    break;
                }
                let n = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    res = self.file.read(&mut self.read_buf) => res?,
                };
                if n == 0 {
                    break;
                }
                self.buf.extend_from_slice(&self.read_buf[..n]);
                for line in self.drain_complete_lines() {
                    on_line(line).await;
                    emitted_in_burst += 1;
                    if emitted_in_burst >= BURST_LINES {
                        break;
                    }
                }
            }

            let rotated = self.check_rotation(identity, reopen_signal_pid).await?;

            // A rotation already slept one catch-up interval inside
            // `check_rotation`; sleeping again here would be a second,
            // redundant 1s pause for the same event (spec §4.2 describes
            // exactly one).
            if rotated {
                continue;
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(CATCH_UP_SLEEP) => {},
            }
        }
    }

    fn drain_complete_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line_bytes = self.buf.split_to(pos);
            self.buf.advance_past_newline();
            lines.push(String::from_utf8_lossy(&line_bytes).into_owned());
        }
        lines
    }

    /// Stats the current path; if its size exceeds the rotation ceiling,
    /// renames it to a sidecar archive, recreates an empty file with the
    /// HTTP server's expected identity, signals re-open, and sleeps 1s.
    /// If the inode changed without a size-triggered rotation (rotated by
    /// an external tool), reopens at the new file's start. Fatal if the
    /// path has disappeared.
    /// Returns whether a rotation happened (and was already slept out), so
    /// the caller's catch-up sleep isn't doubled up for the same event.
    async fn check_rotation(
        &mut self,
        identity: FileIdentity,
        reopen_signal_pid: Option<i32>,
    ) -> Result<bool> {
        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TailerError::Disappeared(self.path.display().to_string()).into());
            },
            Err(source) => {
                return Err(TailerError::Stat {
                    path: self.path.display().to_string(),
                    source,
                }
                .into());
            },
        };

        if meta.len() > ROTATE_AT_BYTES {
            self.rotate(identity, reopen_signal_pid).await?;
            tokio::time::sleep(CATCH_UP_SLEEP).await;
            return Ok(true);
        }

        if meta.ino() != self.inode {
            debug!(old_inode = self.inode, new_inode = meta.ino(), "log file inode changed, reopening");
            self.reopen().await?;
        }

        Ok(false)
    }

    async fn rotate(
        &mut self,
        identity: FileIdentity,
        reopen_signal_pid: Option<i32>,
    ) -> Result<()> {
        let archive = sidecar_archive_path(&self.path);
        tokio::fs::rename(&self.path, &archive)
            .await
            .map_err(|source| TailerError::Rotate {
                path: self.path.display().to_string(),
                source,
            })?;

        let new_file = tokio::fs::File::create(&self.path)
            .await
            .map_err(|source| TailerError::Rotate {
                path: self.path.display().to_string(),
                source,
            })?;

        restore_identity(&self.path, identity)?;

        if let Some(pid) = reopen_signal_pid {
            send_signal(pid, Signal::SIGUSR1);
        }

        let meta = new_file.metadata().await?;
        self.inode = meta.ino();
        self.file = new_file;
        self.buf.clear();

        Ok(())
    }

    async fn reopen(&mut self) -> Result<()> {
        let file = tokio::fs::File::open(&self.path)
            .await
            .with_context(|| format!("failed to reopen log file {:?}", self.path))?;
        let meta = file.metadata().await?;
        self.inode = meta.ino();
        self.file = file;
        self.buf.clear();
        Ok(())
    }
}

trait BytesMutExt {
    fn advance_past_newline(&mut self);
}

impl BytesMutExt for BytesMut {
    fn advance_past_newline(&mut self) {
        if !self.is_empty() {
            self.advance(1);
        }
    }
}

use bytes::Buf;

fn sidecar_archive_path(path: &Path) -> PathBuf {
    let mut archive = path.as_os_str().to_os_string();
    archive.push(".1");
    PathBuf::from(archive)
}

fn restore_identity(path: &Path, identity: FileIdentity) -> Result<()> {
    use nix::unistd::{Gid, Uid};
    nix::unistd::chown(
        path,
        Some(Uid::from_raw(identity.uid)),
        Some(Gid::from_raw(identity.gid)),
    )
    .with_context(|| format!("failed to chown {path:?} after rotation"))?;

    let perms = std::fs::Permissions::from_mode(identity.mode);
    std::fs::set_permissions(path, perms)
        .with_context(|| format!("failed to chmod {path:?} after rotation"))?;

    Ok(())
}

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Sends a signal to the HTTP server's pid. Missing process is handled by
/// the caller already having validated the pidfile; a send failure here
/// (ESRCH) is logged and otherwise ignored, per §7's "skip signal
/// silently" policy.
pub fn send_signal(pid: i32, signal: Signal) {
    match nix::sys::signal::kill(Pid::from_raw(pid), signal) {
        Ok(()) => {},
        Err(e) => warn!(pid, ?signal, error = %e, "failed to signal HTTP server"),
    }
}
