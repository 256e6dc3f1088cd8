// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Log Relay: copies a worker's stderr into the build's log file as it
//! arrives.
//!
//! Each chunk is written and flushed before the next read, so the file can
//! be tailed while the build runs. Relay failures are logged and reported
//! in [`RelayReport`]; they never change a build's outcome. After a write
//! failure the relay keeps draining the stream so the worker never blocks
//! on a full pipe.

use rbd_core::LogDestination;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;

const CHUNK: usize = 8 * 1024;

/// What the relay did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// First failure, if any
    pub error: Option<String>,
}

/// A running relay task.
pub struct LogRelay {
    path: PathBuf,
    handle: JoinHandle<RelayReport>,
}

impl LogRelay {
    /// Start draining `source` into `dest`.
    pub fn start<R>(source: R, dest: &LogDestination) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let path = dest.path().to_path_buf();
        let handle = tokio::spawn(relay(source, path.clone()));
        Self { path, handle }
    }

    /// Wait for the source to reach end of stream, at most `timeout`.
    pub async fn finish(self, timeout: Duration) -> RelayReport {
        let abort = self.handle.abort_handle();
        match tokio::time::timeout(timeout, self.handle).await {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => RelayReport { error: Some(format!("relay task failed: {}", e)), ..Default::default() },
            Err(_) => {
                abort.abort();
                tracing::warn!(path = %self.path.display(), "log relay did not drain in time");
                RelayReport {
                    error: Some(format!("log stream still open after {}ms", timeout.as_millis())),
                    ..Default::default()
                }
            }
        }
    }
}

async fn open_log(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    OpenOptions::new().create(true).append(true).open(path).await
}

async fn relay<R>(mut source: R, path: PathBuf) -> RelayReport
where
    R: AsyncRead + Unpin,
{
    let mut report = RelayReport::default();
    let mut file = match open_log(&path).await {
        Ok(file) => Some(file),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to open build log");
            report.error = Some(format!("open {}: {}", path.display(), e));
            None
        }
    };

    let mut buf = vec![0u8; CHUNK];
    loop {
        let n = match source.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "reading build output failed");
                report.error.get_or_insert_with(|| format!("read: {}", e));
                break;
            }
        };
        report.bytes_read += n as u64;

        let Some(out) = file.as_mut() else { continue };
        let written = async {
            out.write_all(&buf[..n]).await?;
            out.flush().await
        }
        .await;
        match written {
            Ok(()) => report.bytes_written += n as u64,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to write build log");
                report.error.get_or_insert_with(|| format!("write {}: {}", path.display(), e));
                file = None;
            }
        }
    }

    tracing::debug!(path = %path.display(), bytes = report.bytes_written, "build log closed");
    report
}

#[cfg(test)]
#[path = "relay_tests.rs"]
mod tests;
