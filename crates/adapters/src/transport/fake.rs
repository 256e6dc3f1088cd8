// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process transport whose workers speak the real serve protocol.
//!
//! Each registered machine keeps a set of valid store paths that survives
//! across sessions, so a second dispatch to the same machine sees what the
//! first one imported or built.

use super::{
    ConnectionError, ProcessControl, RemoteCommand, RemoteProcess, Session, Transport,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rbd_core::{MachineDescriptor, StorePath};
use rbd_wire::{
    nar_regular, read_build_derivation, read_command, read_export, read_paths, read_query_valid_paths,
    worker_handshake, write_build_result, write_export_end, write_exported_path, write_paths,
    write_u64, BuildOptions, BuildResult, ExportedPath, ProtocolError, RemoteBuildStatus, ServeCommand,
    SERVE_PROTOCOL_VERSION,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
use tokio::task::{AbortHandle, JoinHandle};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Exit code ssh uses for a dropped connection
const SSH_CONNECTION_LOST: i32 = 255;

/// How a fake worker answers `open`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConnectBehavior {
    #[default]
    Accept,
    RefuseAuth,
    Unreachable,
    /// Never finishes connecting
    Hang,
    /// Panics inside `open`
    Panic,
}

/// How a fake worker answers `BuildDerivation`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum BuildBehavior {
    /// Report `Built` and register every declared output
    #[default]
    Succeed,
    /// Report `Built` without registering the outputs
    SucceedWithoutOutputs,
    Fail(RemoteBuildStatus, String),
    /// Never report a result
    Hang,
    /// Drop the connection mid-build
    Disconnect,
}

/// Behavior of one fake worker machine.
#[derive(Debug, Clone)]
pub struct FakeMachine {
    pub valid_paths: BTreeSet<StorePath>,
    pub connect: ConnectBehavior,
    pub build: BuildBehavior,
    /// Lines written to stderr once a build starts
    pub log_lines: Vec<String>,
    /// Accept `ImportPaths` but never acknowledge it
    pub hang_on_import: bool,
    pub protocol_version: u64,
}

impl Default for FakeMachine {
    fn default() -> Self {
        Self {
            valid_paths: BTreeSet::new(),
            connect: ConnectBehavior::Accept,
            build: BuildBehavior::Succeed,
            log_lines: Vec::new(),
            hang_on_import: false,
            protocol_version: SERVE_PROTOCOL_VERSION,
        }
    }
}

impl FakeMachine {
    pub fn new() -> Self {
        Self::default()
    }

    rbd_core::setters! {
        set {
            connect: ConnectBehavior,
            build: BuildBehavior,
            hang_on_import: bool,
            protocol_version: u64,
        }
    }

    pub fn valid_path(mut self, path: impl Into<StorePath>) -> Self {
        self.valid_paths.insert(path.into());
        self
    }

    pub fn log_line(mut self, line: impl Into<String>) -> Self {
        self.log_lines.push(line.into());
        self
    }
}

/// Counters recorded per fake machine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineStats {
    pub opens: usize,
    pub closes: usize,
    pub open_sessions: usize,
    pub commands: usize,
    pub import_calls: usize,
    pub imported_paths: Vec<StorePath>,
    pub bytes_imported: u64,
    pub builds: usize,
    /// Options carried by the last build request
    pub build_options: Option<BuildOptions>,
}

struct MachineState {
    config: FakeMachine,
    valid: BTreeSet<StorePath>,
    stats: MachineStats,
}

type Machines = Arc<Mutex<HashMap<String, MachineState>>>;

/// Fake transport for tests
#[derive(Clone, Default)]
pub struct FakeTransport {
    machines: Machines,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a worker under its ssh name.
    pub fn add_machine(&self, name: impl Into<String>, config: FakeMachine) {
        let valid = config.valid_paths.clone();
        self.machines
            .lock()
            .insert(name.into(), MachineState { config, valid, stats: MachineStats::default() });
    }

    /// Change a registered worker's build behavior, keeping its store.
    pub fn set_build(&self, name: &str, build: BuildBehavior) {
        if let Some(state) = self.machines.lock().get_mut(name) {
            state.config.build = build;
        }
    }

    /// Counters for `name`, zeroed if the machine is unknown
    pub fn stats(&self, name: &str) -> MachineStats {
        self.machines.lock().get(name).map(|m| m.stats.clone()).unwrap_or_default()
    }

    /// Paths currently valid on `name`
    pub fn valid_paths(&self, name: &str) -> BTreeSet<StorePath> {
        self.machines.lock().get(name).map(|m| m.valid.clone()).unwrap_or_default()
    }

    /// Sessions opened and not yet closed, over all machines
    pub fn open_sessions(&self) -> usize {
        self.machines.lock().values().map(|m| m.stats.open_sessions).sum()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    type Session = FakeSession;

    async fn open(&self, machine: &MachineDescriptor) -> Result<FakeSession, ConnectionError> {
        let name = machine.ssh_name.clone();
        let behavior = self.machines.lock().get(&name).map(|m| m.config.connect.clone());
        match behavior {
            None => Err(ConnectionError::Unreachable {
                machine: name,
                detail: "Could not resolve hostname".to_string(),
            }),
            Some(ConnectBehavior::RefuseAuth) => Err(ConnectionError::AuthFailed {
                machine: name,
                detail: "Permission denied (publickey)".to_string(),
            }),
            Some(ConnectBehavior::Unreachable) => Err(ConnectionError::Unreachable {
                machine: name,
                detail: "Connection refused".to_string(),
            }),
            Some(ConnectBehavior::Hang) => std::future::pending().await,
            #[allow(clippy::panic)]
            Some(ConnectBehavior::Panic) => panic!("fake transport panicked opening {}", name),
            Some(ConnectBehavior::Accept) => {
                if let Some(state) = self.machines.lock().get_mut(&name) {
                    state.stats.opens += 1;
                    state.stats.open_sessions += 1;
                }
                Ok(FakeSession {
                    machine: name,
                    machines: self.machines.clone(),
                    open: true,
                    workers: Vec::new(),
                })
            }
        }
    }
}

/// Session to a fake worker. Dropping it does not close it.
pub struct FakeSession {
    machine: String,
    machines: Machines,
    open: bool,
    workers: Vec<AbortHandle>,
}

#[async_trait]
impl Session for FakeSession {
    fn machine(&self) -> &str {
        &self.machine
    }

    async fn run_command(
        &mut self,
        _command: &RemoteCommand,
    ) -> Result<RemoteProcess, ConnectionError> {
        if !self.open {
            return Err(ConnectionError::Closed(self.machine.clone()));
        }
        if let Some(state) = self.machines.lock().get_mut(&self.machine) {
            state.stats.commands += 1;
        }

        let (stdin, worker_stdin) = duplex(PIPE_CAPACITY);
        let (stdout, worker_stdout) = duplex(PIPE_CAPACITY);
        let (stderr, worker_stderr) = duplex(PIPE_CAPACITY);
        let worker = Worker { machine: self.machine.clone(), machines: self.machines.clone() };
        let handle = tokio::spawn(worker.serve(worker_stdin, worker_stdout, worker_stderr));
        self.workers.push(handle.abort_handle());

        Ok(RemoteProcess {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            control: Box::new(FakeControl { handle: Some(handle), exit: None }),
        })
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        for worker in self.workers.drain(..) {
            worker.abort();
        }
        if let Some(state) = self.machines.lock().get_mut(&self.machine) {
            state.stats.closes += 1;
            state.stats.open_sessions = state.stats.open_sessions.saturating_sub(1);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

struct FakeControl {
    handle: Option<JoinHandle<i32>>,
    exit: Option<Option<i32>>,
}

#[async_trait]
impl ProcessControl for FakeControl {
    async fn wait(&mut self) -> Result<Option<i32>, ConnectionError> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        let exit = match self.handle.take() {
            Some(handle) => handle.await.ok(),
            None => None,
        };
        self.exit = Some(exit);
        Ok(exit)
    }

    async fn kill(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

impl Drop for FakeControl {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

/// Worker side of one `nix-store --serve` style command.
struct Worker {
    machine: String,
    machines: Machines,
}

impl Worker {
    fn with_state<R>(&self, f: impl FnOnce(&mut MachineState) -> R) -> Option<R> {
        self.machines.lock().get_mut(&self.machine).map(f)
    }

    /// Serve commands until stdin closes. Returns the exit code.
    async fn serve(
        self,
        mut stdin: DuplexStream,
        mut stdout: DuplexStream,
        mut stderr: DuplexStream,
    ) -> i32 {
        match self.serve_commands(&mut stdin, &mut stdout, &mut stderr).await {
            Ok(code) => code,
            Err(e) => {
                let _ = stderr.write_all(format!("error: {}\n", e).as_bytes()).await;
                1
            }
        }
    }

    async fn serve_commands(
        &self,
        stdin: &mut DuplexStream,
        stdout: &mut DuplexStream,
        stderr: &mut DuplexStream,
    ) -> Result<i32, ProtocolError> {
        let version =
            self.with_state(|m| m.config.protocol_version).unwrap_or(SERVE_PROTOCOL_VERSION);
        let client_version = worker_handshake(stdin, stdout, version).await?;

        while let Some(command) = read_command(stdin).await? {
            match command {
                ServeCommand::QueryValidPaths => {
                    let (_lock, _substitute, paths) = read_query_valid_paths(stdin).await?;
                    let valid: BTreeSet<StorePath> = self
                        .with_state(|m| paths.intersection(&m.valid).cloned().collect())
                        .unwrap_or_default();
                    write_paths(stdout, &valid).await?;
                    stdout.flush().await?;
                }
                ServeCommand::ImportPaths => {
                    let hang = self
                        .with_state(|m| {
                            m.stats.import_calls += 1;
                            m.config.hang_on_import
                        })
                        .unwrap_or(false);
                    if hang {
                        std::future::pending::<()>().await;
                    }
                    let imported = read_export(stdin).await?;
                    self.with_state(|m| {
                        for exported in imported {
                            m.stats.bytes_imported += exported.archive.len() as u64;
                            m.stats.imported_paths.push(exported.path.clone());
                            m.valid.insert(exported.path);
                        }
                    });
                    write_u64(stdout, 1).await?;
                    stdout.flush().await?;
                }
                ServeCommand::ExportPaths => {
                    let paths = read_paths(stdin).await?;
                    let valid = self.with_state(|m| m.valid.clone()).unwrap_or_default();
                    for path in paths {
                        if !valid.contains(&path) {
                            let message = format!("error: path '{}' is not valid\n", path);
                            stderr.write_all(message.as_bytes()).await?;
                            return Ok(1);
                        }
                        let archive = nar_regular(format!("built {}", path).as_bytes());
                        let exported = ExportedPath {
                            path,
                            archive,
                            references: BTreeSet::new(),
                            deriver: None,
                        };
                        write_exported_path(stdout, &exported).await?;
                    }
                    write_export_end(stdout).await?;
                }
                ServeCommand::BuildDerivation => {
                    let (_drv_path, drv, options) = read_build_derivation(stdin, client_version.min(version)).await?;
                    let (build, lines, missing) = self
                        .with_state(|m| {
                            m.stats.builds += 1;
                            m.stats.build_options = Some(options);
                            let missing: Vec<StorePath> =
                                drv.inputs.difference(&m.valid).cloned().collect();
                            (m.config.build.clone(), m.config.log_lines.clone(), missing)
                        })
                        .unwrap_or((BuildBehavior::Disconnect, Vec::new(), Vec::new()));

                    for line in &lines {
                        stderr.write_all(line.as_bytes()).await?;
                        stderr.write_all(b"\n").await?;
                    }
                    stderr.flush().await?;

                    let result = if let Some(path) = missing.first() {
                        BuildResult::new(
                            RemoteBuildStatus::MiscFailure,
                            format!("input '{}' is not valid on the worker", path),
                        )
                    } else {
                        match build {
                            BuildBehavior::Succeed => {
                                self.with_state(|m| {
                                    m.valid.extend(drv.outputs.values().map(|o| o.path.clone()));
                                });
                                built()
                            }
                            BuildBehavior::SucceedWithoutOutputs => built(),
                            BuildBehavior::Fail(status, message) => {
                                BuildResult::new(status, message)
                            }
                            BuildBehavior::Hang => std::future::pending().await,
                            BuildBehavior::Disconnect => return Ok(SSH_CONNECTION_LOST),
                        }
                    };
                    write_build_result(stdout, &result, client_version.min(version)).await?;
                }
            }
        }
        Ok(0)
    }
}

fn built() -> BuildResult {
    let mut result = BuildResult::new(RemoteBuildStatus::Built, "");
    result.times_built = 1;
    result.start_time = 1_700_000_000;
    result.stop_time = 1_700_000_042;
    result
}

#[cfg(test)]
#[path = "fake_tests.rs"]
mod tests;
