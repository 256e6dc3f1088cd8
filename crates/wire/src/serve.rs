// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Serve protocol messages, in both the dispatcher and worker direction.
//!
//! ```text
//! dispatcher                         worker
//!   MAGIC_1, version        ──▶
//!                           ◀──  MAGIC_2, version
//!   QueryValidPaths ...     ──▶
//!                           ◀──  [path]
//!   ImportPaths, export     ──▶
//!                           ◀──  1
//!   BuildDerivation ...     ──▶
//!                           ◀──  status, message, [timings]
//!   ExportPaths, [path]     ──▶
//!                           ◀──  export
//! ```

use crate::codec::{
    read_bool, read_paths, read_string, read_strings, read_u64, write_bool, write_paths,
    write_string, write_strings, write_u64, ProtocolError, MAX_ARCHIVE_LEN, MAX_LIST_LEN,
};
use crate::nar::read_nar;
use crate::status::RemoteBuildStatus;
use rbd_core::{Derivation, DerivationOutput, StorePath};
use std::collections::{BTreeMap, BTreeSet};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

pub const SERVE_MAGIC_1: u64 = 0x390c_9deb;
pub const SERVE_MAGIC_2: u64 = 0x5452_eecb;
pub const SERVE_PROTOCOL_VERSION: u64 = 0x204;
pub const EXPORT_MAGIC: u64 = 0x4558_494e;

/// Major part of a protocol version; peers must agree on it.
pub fn major(version: u64) -> u64 {
    version & 0xff00
}

pub fn minor(version: u64) -> u64 {
    version & 0x00ff
}

/// Command words understood by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeCommand {
    QueryValidPaths,
    ImportPaths,
    ExportPaths,
    BuildDerivation,
}

impl ServeCommand {
    pub fn code(self) -> u64 {
        match self {
            ServeCommand::QueryValidPaths => 1,
            ServeCommand::ImportPaths => 4,
            ServeCommand::ExportPaths => 5,
            ServeCommand::BuildDerivation => 8,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(ServeCommand::QueryValidPaths),
            4 => Some(ServeCommand::ImportPaths),
            5 => Some(ServeCommand::ExportPaths),
            8 => Some(ServeCommand::BuildDerivation),
            _ => None,
        }
    }
}

/// Limits the worker enforces on its own build (0 = unlimited).
///
/// `max_log_size` travels from minor version 2, `build_repeat` and
/// `enforce_determinism` from minor version 3.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildOptions {
    /// Seconds without output before the worker kills the build
    pub max_silent_time: u64,
    /// Seconds of wall time before the worker kills the build
    pub build_timeout: u64,
    /// Bytes of build log the worker keeps
    pub max_log_size: u64,
    /// Extra rounds to build for determinism checks
    pub build_repeat: u64,
    pub enforce_determinism: bool,
}

/// Worker reply to `BuildDerivation`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResult {
    pub status: RemoteBuildStatus,
    pub error_msg: String,
    pub times_built: u64,
    pub non_deterministic: bool,
    pub start_time: u64,
    pub stop_time: u64,
}

impl BuildResult {
    pub fn new(status: RemoteBuildStatus, error_msg: impl Into<String>) -> Self {
        Self {
            status,
            error_msg: error_msg.into(),
            times_built: 0,
            non_deterministic: false,
            start_time: 0,
            stop_time: 0,
        }
    }
}

/// One store object inside an export stream. `archive` is a complete NAR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedPath {
    pub path: StorePath,
    pub archive: Vec<u8>,
    pub references: BTreeSet<StorePath>,
    pub deriver: Option<StorePath>,
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Dispatcher side of the handshake. Returns the worker's version.
pub async fn client_handshake<R, W>(r: &mut R, w: &mut W) -> Result<u64, ProtocolError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    write_u64(w, SERVE_MAGIC_1).await?;
    write_u64(w, SERVE_PROTOCOL_VERSION).await?;
    w.flush().await?;

    let magic = read_u64(r).await?;
    if magic != SERVE_MAGIC_2 {
        return Err(ProtocolError::BadMagic { expected: SERVE_MAGIC_2, got: magic });
    }
    let version = read_u64(r).await?;
    if major(version) != major(SERVE_PROTOCOL_VERSION) {
        return Err(ProtocolError::UnsupportedVersion(version));
    }
    Ok(version)
}

/// Worker side of the handshake. Returns the dispatcher's version.
pub async fn worker_handshake<R, W>(
    r: &mut R,
    w: &mut W,
    version: u64,
) -> Result<u64, ProtocolError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let magic = read_u64(r).await?;
    if magic != SERVE_MAGIC_1 {
        return Err(ProtocolError::BadMagic { expected: SERVE_MAGIC_1, got: magic });
    }
    write_u64(w, SERVE_MAGIC_2).await?;
    write_u64(w, version).await?;
    w.flush().await?;

    let client_version = read_u64(r).await?;
    if major(client_version) != major(version) {
        return Err(ProtocolError::UnsupportedVersion(client_version));
    }
    Ok(client_version)
}

/// Read the next command word. A clean end of stream yields `None`.
pub async fn read_command<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<Option<ServeCommand>, ProtocolError> {
    let code = match read_u64(r).await {
        Ok(code) => code,
        Err(ProtocolError::ConnectionClosed) => return Ok(None),
        Err(e) => return Err(e),
    };
    ServeCommand::from_code(code)
        .map(Some)
        .ok_or(ProtocolError::Unexpected { what: "command", got: code })
}

// ---------------------------------------------------------------------------
// QueryValidPaths
// ---------------------------------------------------------------------------

pub async fn write_query_valid_paths<W: AsyncWrite + Unpin>(
    w: &mut W,
    paths: &BTreeSet<StorePath>,
    lock: bool,
    substitute: bool,
) -> Result<(), ProtocolError> {
    write_u64(w, ServeCommand::QueryValidPaths.code()).await?;
    write_bool(w, lock).await?;
    write_bool(w, substitute).await?;
    write_paths(w, paths).await?;
    w.flush().await?;
    Ok(())
}

/// Arguments of `QueryValidPaths`, read after the command word.
pub async fn read_query_valid_paths<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<(bool, bool, BTreeSet<StorePath>), ProtocolError> {
    let lock = read_bool(r).await?;
    let substitute = read_bool(r).await?;
    let paths = read_paths(r).await?;
    Ok((lock, substitute, paths))
}

// ---------------------------------------------------------------------------
// Export streams (ImportPaths / ExportPaths payload)
// ---------------------------------------------------------------------------

/// Write one object of an export stream. Returns the archive size.
pub async fn write_exported_path<W: AsyncWrite + Unpin>(
    w: &mut W,
    exported: &ExportedPath,
) -> Result<u64, ProtocolError> {
    write_u64(w, 1).await?;
    // self-delimiting, no length word
    w.write_all(&exported.archive).await?;
    write_u64(w, EXPORT_MAGIC).await?;
    write_string(w, exported.path.as_str()).await?;
    write_paths(w, &exported.references).await?;
    write_string(w, exported.deriver.as_ref().map(StorePath::as_str).unwrap_or("")).await?;
    // unsigned
    write_u64(w, 0).await?;
    Ok(exported.archive.len() as u64)
}

pub async fn write_export_end<W: AsyncWrite + Unpin>(w: &mut W) -> Result<(), ProtocolError> {
    write_u64(w, 0).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_export<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<Vec<ExportedPath>, ProtocolError> {
    let mut out = Vec::new();
    loop {
        match read_u64(r).await? {
            0 => return Ok(out),
            1 => {}
            got => return Err(ProtocolError::Unexpected { what: "export marker", got }),
        }
        if out.len() as u64 >= MAX_LIST_LEN {
            return Err(ProtocolError::TooLong {
                what: "export stream",
                len: out.len() as u64,
                limit: MAX_LIST_LEN,
            });
        }
        let archive = read_nar(r, MAX_ARCHIVE_LEN).await?;
        let magic = read_u64(r).await?;
        if magic != EXPORT_MAGIC {
            return Err(ProtocolError::BadMagic { expected: EXPORT_MAGIC, got: magic });
        }
        let path = StorePath::from(read_string(r, "store path").await?);
        let references = read_paths(r).await?;
        let deriver = read_string(r, "deriver").await?;
        let signed = read_u64(r).await?;
        if signed != 0 {
            return Err(ProtocolError::Unexpected { what: "signature marker", got: signed });
        }
        out.push(ExportedPath {
            path,
            archive,
            references,
            deriver: (!deriver.is_empty()).then(|| StorePath::from(deriver)),
        });
    }
}

// ---------------------------------------------------------------------------
// BuildDerivation
// ---------------------------------------------------------------------------

/// Write a build request for a peer speaking `peer_version`.
pub async fn write_build_derivation<W: AsyncWrite + Unpin>(
    w: &mut W,
    drv_path: &StorePath,
    drv: &Derivation,
    options: BuildOptions,
    peer_version: u64,
) -> Result<(), ProtocolError> {
    write_u64(w, ServeCommand::BuildDerivation.code()).await?;
    write_string(w, drv_path.as_str()).await?;

    write_u64(w, drv.outputs.len() as u64).await?;
    for (name, output) in &drv.outputs {
        write_string(w, name).await?;
        write_string(w, output.path.as_str()).await?;
        write_string(w, &output.hash_algo).await?;
        write_string(w, &output.hash).await?;
    }
    write_paths(w, &drv.inputs).await?;
    write_string(w, &drv.platform).await?;
    write_string(w, &drv.builder).await?;
    write_strings(w, &drv.args).await?;
    write_u64(w, drv.env.len() as u64).await?;
    for (key, value) in &drv.env {
        write_string(w, key).await?;
        write_string(w, value).await?;
    }

    write_u64(w, options.max_silent_time).await?;
    write_u64(w, options.build_timeout).await?;
    if minor(peer_version) >= 2 {
        write_u64(w, options.max_log_size).await?;
    }
    if minor(peer_version) >= 3 {
        write_u64(w, options.build_repeat).await?;
        write_bool(w, options.enforce_determinism).await?;
    }
    w.flush().await?;
    Ok(())
}

/// Arguments of `BuildDerivation` from a peer speaking `peer_version`,
/// read after the command word.
pub async fn read_build_derivation<R: AsyncRead + Unpin>(
    r: &mut R,
    peer_version: u64,
) -> Result<(StorePath, Derivation, BuildOptions), ProtocolError> {
    let drv_path = StorePath::from(read_string(r, "derivation path").await?);

    let output_count = read_u64(r).await?;
    if output_count > MAX_LIST_LEN {
        return Err(ProtocolError::TooLong { what: "outputs", len: output_count, limit: MAX_LIST_LEN });
    }
    let mut outputs = BTreeMap::new();
    for _ in 0..output_count {
        let name = read_string(r, "output name").await?;
        let path = read_string(r, "output path").await?;
        let hash_algo = read_string(r, "hash algorithm").await?;
        let hash = read_string(r, "hash").await?;
        outputs.insert(name, DerivationOutput { path: StorePath::from(path), hash_algo, hash });
    }
    let inputs = read_paths(r).await?;
    let platform = read_string(r, "platform").await?;
    let builder = read_string(r, "builder").await?;
    let args = read_strings(r, "argument").await?;

    let env_count = read_u64(r).await?;
    if env_count > MAX_LIST_LEN {
        return Err(ProtocolError::TooLong { what: "environment", len: env_count, limit: MAX_LIST_LEN });
    }
    let mut env = BTreeMap::new();
    for _ in 0..env_count {
        let key = read_string(r, "environment name").await?;
        let value = read_string(r, "environment value").await?;
        env.insert(key, value);
    }

    let mut options = BuildOptions {
        max_silent_time: read_u64(r).await?,
        build_timeout: read_u64(r).await?,
        ..BuildOptions::default()
    };
    if minor(peer_version) >= 2 {
        options.max_log_size = read_u64(r).await?;
    }
    if minor(peer_version) >= 3 {
        options.build_repeat = read_u64(r).await?;
        options.enforce_determinism = read_bool(r).await?;
    }
    let drv = Derivation { outputs, inputs, platform, builder, args, env };
    Ok((drv_path, drv, options))
}

/// Write a build result for a peer speaking `peer_version`.
pub async fn write_build_result<W: AsyncWrite + Unpin>(
    w: &mut W,
    result: &BuildResult,
    peer_version: u64,
) -> Result<(), ProtocolError> {
    write_u64(w, result.status.code()).await?;
    write_string(w, &result.error_msg).await?;
    if minor(peer_version) >= 3 {
        write_u64(w, result.times_built).await?;
        write_bool(w, result.non_deterministic).await?;
        write_u64(w, result.start_time).await?;
        write_u64(w, result.stop_time).await?;
    }
    w.flush().await?;
    Ok(())
}

/// Read a build result from a worker speaking `remote_version`.
pub async fn read_build_result<R: AsyncRead + Unpin>(
    r: &mut R,
    remote_version: u64,
) -> Result<BuildResult, ProtocolError> {
    let code = read_u64(r).await?;
    let status = RemoteBuildStatus::from_code(code).ok_or(ProtocolError::UnknownStatus(code))?;
    let mut result = BuildResult::new(status, read_string(r, "error message").await?);
    if minor(remote_version) >= 3 {
        result.times_built = read_u64(r).await?;
        result.non_deterministic = read_bool(r).await?;
        result.start_time = read_u64(r).await?;
        result.stop_time = read_u64(r).await?;
    }
    Ok(result)
}

#[cfg(test)]
#[path = "serve_tests.rs"]
mod tests;
