// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Remote Build Protocol: drive one derivation to completion over the
//! stdio of a worker's serve command.
//!
//! ```text
//! sync inputs   QueryValidPaths(closure) → ImportPaths(missing)   (skipped if none missing)
//! submit        BuildDerivation
//! execute       ← status, message, timings
//! copy outputs  QueryValidPaths(outputs) → ExportPaths(not in local store)
//! ```
//!
//! Exactly one build attempt is made; nothing here retries.

use crate::classify::FailureKind;
use rbd_adapters::{ConnectionError, Store, StoreError};
use rbd_core::{BuildTask, DerivationError, RemoteTimings, StorePath};
use rbd_wire::{
    client_handshake, minor, read_build_result, read_export, read_paths, read_u64,
    write_build_derivation, write_export_end, write_exported_path, write_paths,
    write_query_valid_paths, write_u64, BuildOptions, BuildResult, ExportedPath, ProtocolError,
    RemoteBuildStatus, ServeCommand, SERVE_PROTOCOL_VERSION,
};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Step of a dispatch, used to tag failures and log transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Connect,
    SyncInputs,
    Submit,
    Execute,
    CopyOutputs,
}

rbd_core::simple_display! {
    Phase {
        Connect => "connect",
        SyncInputs => "sync inputs",
        Submit => "submit",
        Execute => "execute",
        CopyOutputs => "copy outputs",
    }
}

/// Exit code ssh reports when the connection itself failed
pub const SSH_CONNECTION_LOST: i32 = 255;

/// Why the protocol could not deliver a successful build.
#[derive(Debug, Error)]
pub enum ProtocolFailure {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("connection to worker lost")]
    ConnectionLost,
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("local store: {0}")]
    Store(#[from] StoreError),
    #[error("invalid derivation: {0}")]
    InvalidDerivation(#[from] DerivationError),
    #[error("input transfer failed: {0}")]
    InputTransfer(#[source] Box<ProtocolFailure>),
    #[error("worker rejected the derivation: {message}")]
    Rejected { message: String },
    #[error("build failed ({status}): {message}")]
    BuildFailed { status: RemoteBuildStatus, message: String },
    #[error("worker enforced a time limit: {message}")]
    RemoteTimedOut { message: String },
    #[error("worker reported {status}: {message}")]
    RemoteUnclassified { status: RemoteBuildStatus, message: String },
    #[error("outputs not valid on worker after build: {}", join_paths(.0))]
    MissingOutputs(Vec<StorePath>),
    #[error("remote command {}", exit_label(.0))]
    RemoteExit(Option<i32>),
}

impl ProtocolFailure {
    /// Failure for a non-success status reported by the worker.
    pub fn from_status(status: RemoteBuildStatus, message: String) -> Self {
        match FailureKind::of_status(status) {
            FailureKind::Rejection => ProtocolFailure::Rejected { message },
            FailureKind::BuildFailure => ProtocolFailure::BuildFailed { status, message },
            FailureKind::DeadlineExceeded => ProtocolFailure::RemoteTimedOut { message },
            FailureKind::Unclassified => ProtocolFailure::RemoteUnclassified { status, message },
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            ProtocolFailure::InvalidDerivation(_) | ProtocolFailure::Rejected { .. } => {
                FailureKind::Rejection
            }
            ProtocolFailure::BuildFailed { .. } => FailureKind::BuildFailure,
            ProtocolFailure::RemoteTimedOut { .. } => FailureKind::DeadlineExceeded,
            ProtocolFailure::Connection(_)
            | ProtocolFailure::ConnectionLost
            | ProtocolFailure::Protocol(_)
            | ProtocolFailure::Store(_)
            | ProtocolFailure::InputTransfer(_)
            | ProtocolFailure::RemoteUnclassified { .. }
            | ProtocolFailure::MissingOutputs(_)
            | ProtocolFailure::RemoteExit(_) => FailureKind::Unclassified,
        }
    }
}

fn join_paths(paths: &[StorePath]) -> String {
    paths.iter().map(StorePath::as_str).collect::<Vec<_>>().join(", ")
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exited with status {}", code),
        None => "was killed by a signal".to_string(),
    }
}

/// What a successful build hands back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildReport {
    /// Output name → store path, covering every declared output
    pub outputs: BTreeMap<String, StorePath>,
    pub timings: Option<RemoteTimings>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Dispatcher end of one serve session.
pub struct ServeClient<R, W> {
    reader: R,
    writer: W,
    remote_version: u64,
}

impl<R, W> ServeClient<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub async fn handshake(mut reader: R, mut writer: W) -> Result<Self, ProtocolFailure> {
        let remote_version = client_handshake(&mut reader, &mut writer).await?;
        tracing::debug!(remote_version, "handshake done");
        Ok(Self { reader, writer, remote_version })
    }

    pub fn remote_version(&self) -> u64 {
        self.remote_version
    }

    /// The subset of `paths` valid on the worker.
    pub async fn query_valid_paths(
        &mut self,
        paths: &BTreeSet<StorePath>,
    ) -> Result<BTreeSet<StorePath>, ProtocolFailure> {
        write_query_valid_paths(&mut self.writer, paths, false, false).await?;
        Ok(read_paths(&mut self.reader).await?)
    }

    /// Send `paths` (dependencies first) from the local store. Returns the
    /// archive bytes sent.
    pub async fn import_paths<S: Store>(
        &mut self,
        store: &S,
        paths: &[StorePath],
    ) -> Result<u64, ProtocolFailure> {
        write_u64(&mut self.writer, ServeCommand::ImportPaths.code()).await?;
        let mut bytes = 0;
        for path in paths {
            let exported = store.export_path(path).await?;
            bytes += write_exported_path(&mut self.writer, &exported).await?;
        }
        write_export_end(&mut self.writer).await?;

        match read_u64(&mut self.reader).await? {
            1 => Ok(bytes),
            got => Err(ProtocolError::Unexpected { what: "import acknowledgement", got }.into()),
        }
    }

    pub async fn submit(
        &mut self,
        task: &BuildTask,
        options: BuildOptions,
    ) -> Result<(), ProtocolFailure> {
        let version = SERVE_PROTOCOL_VERSION.min(self.remote_version);
        write_build_derivation(&mut self.writer, &task.drv_path, &task.drv, options, version)
            .await?;
        Ok(())
    }

    pub async fn await_result(&mut self) -> Result<BuildResult, ProtocolFailure> {
        Ok(read_build_result(&mut self.reader, self.remote_version).await?)
    }

    /// Fetch `paths` from the worker.
    pub async fn export_paths(
        &mut self,
        paths: &BTreeSet<StorePath>,
    ) -> Result<Vec<ExportedPath>, ProtocolFailure> {
        write_u64(&mut self.writer, ServeCommand::ExportPaths.code()).await?;
        write_paths(&mut self.writer, paths).await?;
        self.writer.flush().await.map_err(ProtocolError::from)?;
        Ok(read_export(&mut self.reader).await?)
    }

    /// Close the worker's stdin so its serve loop exits.
    pub async fn close(mut self) {
        if let Err(e) = self.writer.shutdown().await {
            tracing::debug!(error = %e, "closing worker stdin failed");
        }
    }
}

fn enter(phase: &mut Phase, next: Phase) {
    *phase = next;
    tracing::info!(phase = %next, "entering phase");
}

/// Run input sync, build and output retrieval for `task`.
///
/// `phase` tracks progress so a caller that abandons this future can tell
/// where it stopped.
pub async fn run_build<R, W, S>(
    client: &mut ServeClient<R, W>,
    store: &S,
    task: &BuildTask,
    options: BuildOptions,
    phase: &mut Phase,
) -> Result<BuildReport, ProtocolFailure>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
    S: Store,
{
    let mut report = BuildReport::default();

    enter(phase, Phase::SyncInputs);
    report.bytes_sent = sync_inputs(client, store, task)
        .await
        .map_err(|e| ProtocolFailure::InputTransfer(Box::new(e)))?;

    enter(phase, Phase::Submit);
    client.submit(task, options).await?;

    enter(phase, Phase::Execute);
    let result = client.await_result().await?;
    tracing::info!(status = %result.status, times_built = result.times_built, "worker finished");
    if !result.status.is_success() {
        return Err(ProtocolFailure::from_status(result.status, result.error_msg));
    }
    if minor(client.remote_version()) >= 3 {
        report.timings = Some(RemoteTimings {
            times_built: result.times_built,
            non_deterministic: result.non_deterministic,
            start_time: result.start_time,
            stop_time: result.stop_time,
        });
    }

    enter(phase, Phase::CopyOutputs);
    report.bytes_received = copy_outputs(client, store, task).await?;
    report.outputs =
        task.drv.outputs.iter().map(|(name, output)| (name.clone(), output.path.clone())).collect();
    Ok(report)
}

/// Returns archive bytes sent.
async fn sync_inputs<R, W, S>(
    client: &mut ServeClient<R, W>,
    store: &S,
    task: &BuildTask,
) -> Result<u64, ProtocolFailure>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
    S: Store,
{
    let closure = store.closure(&task.drv.inputs).await?;
    let wanted: BTreeSet<StorePath> = closure.iter().cloned().collect();
    let present = client.query_valid_paths(&wanted).await?;
    let missing: Vec<StorePath> = closure.into_iter().filter(|p| !present.contains(p)).collect();

    if missing.is_empty() {
        tracing::debug!(inputs = wanted.len(), "all inputs already on worker");
        return Ok(0);
    }
    let bytes = client.import_paths(store, &missing).await?;
    tracing::info!(paths = missing.len(), bytes, "copied inputs to worker");
    Ok(bytes)
}

/// Returns archive bytes received.
async fn copy_outputs<R, W, S>(
    client: &mut ServeClient<R, W>,
    store: &S,
    task: &BuildTask,
) -> Result<u64, ProtocolFailure>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
    S: Store,
{
    let declared = task.drv.output_paths();
    let on_worker = client.query_valid_paths(&declared).await?;
    let absent: Vec<StorePath> = declared.difference(&on_worker).cloned().collect();
    if !absent.is_empty() {
        return Err(ProtocolFailure::MissingOutputs(absent));
    }

    let mut needed = BTreeSet::new();
    for path in &declared {
        if !store.is_valid(path).await? {
            needed.insert(path.clone());
        }
    }
    if needed.is_empty() {
        return Ok(0);
    }

    let exported = client.export_paths(&needed).await?;
    let mut bytes = 0;
    for path in exported {
        needed.remove(&path.path);
        bytes += path.archive.len() as u64;
        store.import_path(path).await?;
    }
    if !needed.is_empty() {
        return Err(ProtocolFailure::MissingOutputs(needed.into_iter().collect()));
    }
    tracing::info!(paths = declared.len(), bytes, "copied outputs from worker");
    Ok(bytes)
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
