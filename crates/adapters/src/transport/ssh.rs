// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! OpenSSH transport using one control master per session.
//!
//! ```text
//! open   ssh -M -N -S <socket> -i <key> <host>        (kept running)
//!        ssh -S <socket> -O check <host>              (polled until ready)
//! run    ssh -S <socket> -x -a <host> -- <command>
//! close  ssh -S <socket> -O exit <host>
//! ```
//!
//! The machine named `localhost` skips ssh and runs commands directly.

use super::process::spawn_piped;
use super::{ConnectionError, KeyLocks, RemoteCommand, RemoteProcess, Session, Transport};
use async_trait::async_trait;
use rbd_core::MachineDescriptor;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

const READY_POLL: Duration = Duration::from_millis(100);

/// Settings for [`SshTransport`].
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// ssh binary
    pub program: String,
    /// Directory holding control sockets
    pub control_dir: PathBuf,
    pub connect_timeout: Duration,
    /// How long `ssh -O exit` may take before the master is killed outright
    pub exit_timeout: Duration,
    /// Extra `-o` style arguments passed before the destination
    pub extra_args: Vec<String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            control_dir: std::env::temp_dir(),
            connect_timeout: Duration::from_secs(30),
            exit_timeout: Duration::from_secs(5),
            extra_args: Vec::new(),
        }
    }
}

impl SshConfig {
    rbd_core::setters! {
        into {
            program: String,
            control_dir: PathBuf,
        }
        set {
            connect_timeout: Duration,
            exit_timeout: Duration,
            extra_args: Vec<String>,
        }
    }
}

/// Transport that reaches workers over OpenSSH.
#[derive(Clone)]
pub struct SshTransport {
    config: Arc<SshConfig>,
    key_locks: KeyLocks,
}

impl SshTransport {
    pub fn new(config: SshConfig) -> Self {
        Self { config: Arc::new(config), key_locks: KeyLocks::new() }
    }

    async fn open_master(&self, machine: &MachineDescriptor) -> Result<SshSession, ConnectionError> {
        let socket = self.config.control_dir.join(format!(
            "rbd-{}-{}.sock",
            sanitize(machine.host()),
            uuid::Uuid::new_v4().simple()
        ));

        // Authentication with a given key is serialized across dispatches
        let _key_guard = self.key_locks.acquire(&machine.ssh_key).await;

        let mut command = Command::new(&self.config.program);
        command
            .args(master_args(&self.config, machine, &socket))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = command.spawn().map_err(|source| ConnectionError::Spawn {
            program: self.config.program.clone(),
            source,
        })?;

        let mut session = SshSession {
            machine: machine.ssh_name.clone(),
            program: self.config.program.clone(),
            exit_timeout: self.config.exit_timeout,
            mode: Mode::Master { socket, child },
        };
        session.wait_ready(self.config.connect_timeout).await?;
        Ok(session)
    }
}

#[async_trait]
impl Transport for SshTransport {
    type Session = SshSession;

    async fn open(&self, machine: &MachineDescriptor) -> Result<SshSession, ConnectionError> {
        if machine.is_local() {
            return Ok(SshSession {
                machine: machine.ssh_name.clone(),
                program: self.config.program.clone(),
                exit_timeout: self.config.exit_timeout,
                mode: Mode::Local,
            });
        }

        let start = Instant::now();
        let result = self.open_master(machine).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => tracing::info!(machine = %machine.ssh_name, elapsed_ms, "ssh session opened"),
            Err(e) => {
                tracing::warn!(machine = %machine.ssh_name, elapsed_ms, error = %e, "ssh connect failed")
            }
        }
        result
    }
}

enum Mode {
    Local,
    Master { socket: PathBuf, child: Child },
    Closed,
}

/// Session over an ssh control master (or the local host).
pub struct SshSession {
    machine: String,
    program: String,
    exit_timeout: Duration,
    mode: Mode,
}

impl SshSession {
    /// Poll the control socket until the master is authenticated.
    async fn wait_ready(&mut self, timeout: Duration) -> Result<(), ConnectionError> {
        let start = Instant::now();
        loop {
            let Mode::Master { socket, child } = &mut self.mode else {
                return Ok(());
            };

            if let Some(status) = child.try_wait()? {
                let mut stderr = String::new();
                if let Some(mut pipe) = child.stderr.take() {
                    // Best effort; the diagnostic is optional
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                self.mode = Mode::Closed;
                return Err(classify_ssh_failure(&self.machine, &stderr, status.code()));
            }

            let remaining = timeout.saturating_sub(start.elapsed()).max(READY_POLL);
            let check = check_master(&self.program, socket, &self.machine);
            if tokio::time::timeout(remaining, check).await.unwrap_or(false) {
                return Ok(());
            }

            if start.elapsed() >= timeout {
                self.close_master().await;
                return Err(ConnectionError::Unreachable {
                    machine: self.machine.clone(),
                    detail: format!("no connection after {:?}", timeout),
                });
            }
            tokio::time::sleep(READY_POLL).await;
        }
    }

    async fn close_master(&mut self) {
        let mode = std::mem::replace(&mut self.mode, Mode::Closed);
        let Mode::Master { socket, mut child } = mode else {
            return;
        };

        let exit = Command::new(&self.program)
            .arg("-S")
            .arg(&socket)
            .args(["-O", "exit"])
            .arg(&self.machine)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();
        match tokio::time::timeout(self.exit_timeout, exit).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!(machine = %self.machine, error = %e, "ssh -O exit failed"),
            Err(_) => tracing::warn!(
                machine = %self.machine,
                timeout_ms = self.exit_timeout.as_millis() as u64,
                "ssh -O exit timed out, killing control master"
            ),
        }

        // The master is killed whether or not -O exit got through
        if let Err(e) = child.kill().await {
            tracing::debug!(machine = %self.machine, error = %e, "control master already gone");
        }
        remove_socket(&socket);
    }
}

#[async_trait]
impl Session for SshSession {
    fn machine(&self) -> &str {
        &self.machine
    }

    async fn run_command(&mut self, command: &RemoteCommand) -> Result<RemoteProcess, ConnectionError> {
        match &self.mode {
            Mode::Local => {
                let mut local = Command::new(&command.program);
                local.args(&command.args).envs(command.env.iter().cloned());
                spawn_piped(local, &command.program)
            }
            Mode::Master { socket, .. } => {
                let mut remote = Command::new(&self.program);
                remote.args(command_args(socket, &self.machine, command));
                spawn_piped(remote, &self.program)
            }
            Mode::Closed => Err(ConnectionError::Closed(self.machine.clone())),
        }
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        match self.mode {
            Mode::Closed => {}
            Mode::Local => self.mode = Mode::Closed,
            Mode::Master { .. } => {
                self.close_master().await;
                tracing::debug!(machine = %self.machine, "ssh session closed");
            }
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        !matches!(self.mode, Mode::Closed)
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        // The master child is killed on drop; only the socket file remains
        if let Mode::Master { socket, .. } = &self.mode {
            tracing::warn!(machine = %self.machine, "ssh session dropped without close");
            remove_socket(socket);
        }
    }
}

fn remove_socket(socket: &Path) {
    match std::fs::remove_file(socket) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(socket = %socket.display(), error = %e, "failed to remove control socket"),
    }
}

async fn check_master(program: &str, socket: &Path, machine: &str) -> bool {
    Command::new(program)
        .arg("-S")
        .arg(socket)
        .args(["-O", "check"])
        .arg(machine)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Arguments for the control master process.
pub(crate) fn master_args(config: &SshConfig, machine: &MachineDescriptor, socket: &Path) -> Vec<String> {
    let mut args = vec![
        "-M".to_string(),
        "-N".to_string(),
        "-S".to_string(),
        socket.display().to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", config.connect_timeout.as_secs().max(1)),
        "-o".to_string(),
        "ControlPersist=no".to_string(),
        "-x".to_string(),
        "-a".to_string(),
    ];
    if !machine.ssh_key.as_os_str().is_empty() {
        args.push("-i".to_string());
        args.push(machine.ssh_key.display().to_string());
    }
    args.extend(config.extra_args.iter().cloned());
    args.push(machine.ssh_name.clone());
    args
}

/// Arguments for running `command` through an existing master.
pub(crate) fn command_args(socket: &Path, machine: &str, command: &RemoteCommand) -> Vec<String> {
    let mut args = vec![
        "-S".to_string(),
        socket.display().to_string(),
        "-x".to_string(),
        "-a".to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        machine.to_string(),
        "--".to_string(),
    ];
    args.extend(command.words().iter().map(|w| shell_quote(w)));
    args
}

/// Quote a word for the remote shell that ssh hands the command line to.
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word.chars().all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

fn sanitize(host: &str) -> String {
    host.chars().map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' }).collect()
}

/// Map a failed master start to a connection error.
pub(crate) fn classify_ssh_failure(machine: &str, stderr: &str, code: Option<i32>) -> ConnectionError {
    let detail = stderr
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .next_back()
        .map(str::to_string)
        .unwrap_or_else(|| match code {
            Some(code) => format!("ssh exited with status {}", code),
            None => "ssh killed by signal".to_string(),
        });
    if stderr.contains("Permission denied") {
        ConnectionError::AuthFailed { machine: machine.to_string(), detail }
    } else {
        ConnectionError::Unreachable { machine: machine.to_string(), detail }
    }
}

#[cfg(test)]
#[path = "ssh_tests.rs"]
mod tests;
