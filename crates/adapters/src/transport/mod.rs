// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Transport sessions to remote build workers.
//!
//! A [`Transport`] opens one authenticated [`Session`] per dispatch. A
//! session runs commands on the worker and hands back their byte streams as
//! a [`RemoteProcess`]. Closing a session is idempotent.

mod keys;
mod process;
mod ssh;

pub use keys::{KeyGuard, KeyLocks};
pub use process::ChildControl;
pub use ssh::{shell_quote, SshConfig, SshSession, SshTransport};

#[cfg(any(test, feature = "test-support"))]
#[cfg_attr(coverage_nightly, coverage(off))]
mod fake;
#[cfg(any(test, feature = "test-support"))]
pub use fake::{
    BuildBehavior, ConnectBehavior, FakeMachine, FakeSession, FakeTransport, MachineStats,
};

use async_trait::async_trait;
use rbd_core::MachineDescriptor;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Transport-level failures. Never a build outcome by themselves.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("authentication to {machine} failed: {detail}")]
    AuthFailed { machine: String, detail: String },
    #[error("cannot connect to {machine}: {detail}")]
    Unreachable { machine: String, detail: String },
    #[error("session to {0} is closed")]
    Closed(String),
    #[error("transport i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// A command to run on the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl RemoteCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into(), args: Vec::new(), env: Vec::new() }
    }

    rbd_core::setters! {
        set {
            args: Vec<String>,
            env: Vec<(String, String)>,
        }
    }

    /// Command line as words, prefixed with `env K=V ...` when the command
    /// carries environment variables.
    pub fn words(&self) -> Vec<String> {
        let mut words = Vec::with_capacity(self.args.len() + self.env.len() + 2);
        if !self.env.is_empty() {
            words.push("env".to_string());
            words.extend(self.env.iter().map(|(k, v)| format!("{}={}", k, v)));
        }
        words.push(self.program.clone());
        words.extend(self.args.iter().cloned());
        words
    }
}

/// Control over a running remote process.
#[async_trait]
pub trait ProcessControl: Send {
    /// Wait for the process to exit. `None` means it was killed by a signal.
    async fn wait(&mut self) -> Result<Option<i32>, ConnectionError>;

    /// Forcibly terminate the process. No-op if it already exited.
    async fn kill(&mut self);
}

/// Byte streams and lifecycle of one command running on a worker.
pub struct RemoteProcess {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: BoxedReader,
    pub control: Box<dyn ProcessControl>,
}

/// One authenticated connection to a worker.
#[async_trait]
pub trait Session: Send {
    /// Name of the machine this session is connected to
    fn machine(&self) -> &str;

    /// Start a command on the worker.
    async fn run_command(&mut self, command: &RemoteCommand)
        -> Result<RemoteProcess, ConnectionError>;

    /// Tear the connection down. Closing a closed session is a no-op.
    async fn close(&mut self) -> Result<(), ConnectionError>;

    fn is_open(&self) -> bool;
}

/// Opens sessions to workers.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Session: Session + 'static;

    /// Connect and authenticate with the machine's key.
    async fn open(&self, machine: &MachineDescriptor) -> Result<Self::Session, ConnectionError>;
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
