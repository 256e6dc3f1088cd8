// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Primitive encoding: 64-bit little-endian words and 8-byte padded strings.

use rbd_core::StorePath;
use std::collections::BTreeSet;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest text string accepted from a peer (paths, messages, env values)
pub const MAX_STRING_LEN: u64 = 64 * 1024 * 1024;

/// Longest archive accepted in an export stream
pub const MAX_ARCHIVE_LEN: u64 = 16 * 1024 * 1024 * 1024;

/// Longest list accepted from a peer
pub const MAX_LIST_LEN: u64 = 1 << 20;

/// Errors from reading or writing the serve protocol
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad magic number {got:#x} (expected {expected:#x})")]
    BadMagic { expected: u64, got: u64 },
    #[error("unsupported serve protocol version {0:#x}")]
    UnsupportedVersion(u64),
    #[error("{what} of length {len} exceeds limit {limit}")]
    TooLong { what: &'static str, len: u64, limit: u64 },
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("unexpected {what}: {got}")]
    Unexpected { what: &'static str, got: u64 },
    #[error("unknown remote build status {0}")]
    UnknownStatus(u64),
    #[error("malformed archive in export stream")]
    InvalidArchive,
}

pub(crate) fn map_eof(e: std::io::Error) -> ProtocolError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        ProtocolError::ConnectionClosed
    } else {
        ProtocolError::Io(e)
    }
}

pub(crate) fn padding(len: u64) -> usize {
    ((8 - len % 8) % 8) as usize
}

pub async fn write_u64<W: AsyncWrite + Unpin>(w: &mut W, n: u64) -> Result<(), ProtocolError> {
    w.write_all(&n.to_le_bytes()).await?;
    Ok(())
}

pub async fn read_u64<R: AsyncRead + Unpin>(r: &mut R) -> Result<u64, ProtocolError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).await.map_err(map_eof)?;
    Ok(u64::from_le_bytes(buf))
}

pub async fn write_bool<W: AsyncWrite + Unpin>(w: &mut W, b: bool) -> Result<(), ProtocolError> {
    write_u64(w, b as u64).await
}

pub async fn read_bool<R: AsyncRead + Unpin>(r: &mut R) -> Result<bool, ProtocolError> {
    Ok(read_u64(r).await? != 0)
}

/// Length word, bytes, then zero padding up to the next multiple of 8.
pub async fn write_bytes<W: AsyncWrite + Unpin>(w: &mut W, bytes: &[u8]) -> Result<(), ProtocolError> {
    let len = bytes.len() as u64;
    write_u64(w, len).await?;
    w.write_all(bytes).await?;
    let pad = padding(len);
    if pad > 0 {
        w.write_all(&[0u8; 8][..pad]).await?;
    }
    Ok(())
}

pub async fn read_bytes<R: AsyncRead + Unpin>(
    r: &mut R,
    what: &'static str,
    limit: u64,
) -> Result<Vec<u8>, ProtocolError> {
    let len = read_u64(r).await?;
    if len > limit {
        return Err(ProtocolError::TooLong { what, len, limit });
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await.map_err(map_eof)?;
    let pad = padding(len);
    if pad > 0 {
        let mut zeros = [0u8; 8];
        r.read_exact(&mut zeros[..pad]).await.map_err(map_eof)?;
    }
    Ok(buf)
}

pub async fn write_string<W: AsyncWrite + Unpin>(w: &mut W, s: &str) -> Result<(), ProtocolError> {
    write_bytes(w, s.as_bytes()).await
}

pub async fn read_string<R: AsyncRead + Unpin>(
    r: &mut R,
    what: &'static str,
) -> Result<String, ProtocolError> {
    let bytes = read_bytes(r, what, MAX_STRING_LEN).await?;
    String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8(what))
}

pub async fn write_strings<W, I, S>(w: &mut W, items: I) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    I: IntoIterator<Item = S>,
    I::IntoIter: ExactSizeIterator,
    S: AsRef<str>,
{
    let items = items.into_iter();
    write_u64(w, items.len() as u64).await?;
    for item in items {
        write_string(w, item.as_ref()).await?;
    }
    Ok(())
}

pub async fn read_strings<R: AsyncRead + Unpin>(
    r: &mut R,
    what: &'static str,
) -> Result<Vec<String>, ProtocolError> {
    let count = read_u64(r).await?;
    if count > MAX_LIST_LEN {
        return Err(ProtocolError::TooLong { what, len: count, limit: MAX_LIST_LEN });
    }
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        out.push(read_string(r, what).await?);
    }
    Ok(out)
}

pub async fn write_paths<W: AsyncWrite + Unpin>(
    w: &mut W,
    paths: &BTreeSet<StorePath>,
) -> Result<(), ProtocolError> {
    write_strings(w, paths.iter().map(StorePath::as_str)).await
}

pub async fn read_paths<R: AsyncRead + Unpin>(r: &mut R) -> Result<BTreeSet<StorePath>, ProtocolError> {
    Ok(read_strings(r, "store path").await?.into_iter().map(StorePath::from).collect())
}

#[cfg(test)]
#[path = "codec_tests.rs"]
mod tests;
