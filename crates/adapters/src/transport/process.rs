// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Local child processes as `RemoteProcess`es.

use super::{ConnectionError, ProcessControl, RemoteProcess};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::{Child, Command};

/// [`ProcessControl`] over a tokio child process.
pub struct ChildControl {
    child: Child,
}

impl ChildControl {
    pub fn new(child: Child) -> Self {
        Self { child }
    }
}

#[async_trait]
impl ProcessControl for ChildControl {
    async fn wait(&mut self) -> Result<Option<i32>, ConnectionError> {
        Ok(self.child.wait().await?.code())
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!(error = %e, "kill of exited child ignored");
        }
    }
}

/// Spawn `command` with all three standard streams piped.
///
/// The child is killed if the returned process is dropped.
pub(crate) fn spawn_piped(mut command: Command, program: &str) -> Result<RemoteProcess, ConnectionError> {
    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ConnectionError::Spawn { program: program.to_string(), source })?;

    let closed = || std::io::Error::new(std::io::ErrorKind::BrokenPipe, "child stream not piped");
    let stdin = child.stdin.take().ok_or_else(closed)?;
    let stdout = child.stdout.take().ok_or_else(closed)?;
    let stderr = child.stderr.take().ok_or_else(closed)?;

    Ok(RemoteProcess {
        stdin: Box::new(stdin),
        stdout: Box::new(stdout),
        stderr: Box::new(stderr),
        control: Box::new(ChildControl::new(child)),
    })
}
