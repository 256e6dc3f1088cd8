// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Archive framing inside export streams.
//!
//! A NAR is a sequence of padded strings with no outer length, so the reader
//! walks its structure to find where it ends:
//!
//! ```text
//! "nix-archive-1" node
//! node  = "(" "type" ( regular | symlink | directory ) ")"
//! regular   = "regular" ["executable" ""] "contents" bytes
//! symlink   = "symlink" "target" string
//! directory = "directory" { "entry" "(" "name" string "node" node ")" }
//! ```

use crate::codec::{map_eof, padding, ProtocolError};
use tokio::io::{AsyncRead, AsyncReadExt};

pub const NAR_MAGIC: &str = "nix-archive-1";

/// Longest token (tag, file name, link target) accepted inside an archive
const MAX_TOKEN_LEN: u64 = 4096;

/// Nesting limit for directories
const MAX_DEPTH: usize = 256;

/// Read one archive, returning its raw bytes exactly as they were framed.
pub async fn read_nar<R: AsyncRead + Unpin>(r: &mut R, limit: u64) -> Result<Vec<u8>, ProtocolError> {
    let mut nar = NarReader { r, raw: Vec::new(), limit };
    nar.expect(NAR_MAGIC).await?;

    let mut dirs = 0usize;
    loop {
        nar.expect("(").await?;
        nar.expect("type").await?;
        let mut node_done = true;
        match nar.token().await?.as_slice() {
            b"regular" => {
                let mut tag = nar.token().await?;
                if tag == b"executable" {
                    nar.expect("").await?;
                    tag = nar.token().await?;
                }
                if tag != b"contents" {
                    return Err(ProtocolError::InvalidArchive);
                }
                nar.contents().await?;
                nar.expect(")").await?;
            }
            b"symlink" => {
                nar.expect("target").await?;
                nar.token().await?;
                nar.expect(")").await?;
            }
            b"directory" => {
                dirs += 1;
                if dirs > MAX_DEPTH {
                    return Err(ProtocolError::TooLong {
                        what: "archive nesting",
                        len: dirs as u64,
                        limit: MAX_DEPTH as u64,
                    });
                }
                node_done = false;
            }
            _ => return Err(ProtocolError::InvalidArchive),
        }

        // Walk directory listings until the next child node starts
        loop {
            if node_done {
                if dirs == 0 {
                    return Ok(nar.raw);
                }
                // close the entry holding the finished node
                nar.expect(")").await?;
                node_done = false;
            }
            match nar.token().await?.as_slice() {
                b"entry" => {
                    nar.expect("(").await?;
                    nar.expect("name").await?;
                    nar.token().await?;
                    nar.expect("node").await?;
                    break;
                }
                b")" => {
                    dirs -= 1;
                    node_done = true;
                }
                _ => return Err(ProtocolError::InvalidArchive),
            }
        }
    }
}

/// Archive of a single regular file.
pub fn nar_regular(contents: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    for token in [NAR_MAGIC, "(", "type", "regular", "contents"] {
        push_string(&mut out, token.as_bytes());
    }
    push_string(&mut out, contents);
    push_string(&mut out, b")");
    out
}

fn push_string(out: &mut Vec<u8>, bytes: &[u8]) {
    let len = bytes.len() as u64;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(bytes);
    out.resize(out.len() + padding(len), 0);
}

struct NarReader<'a, R> {
    r: &'a mut R,
    raw: Vec<u8>,
    limit: u64,
}

impl<R: AsyncRead + Unpin> NarReader<'_, R> {
    /// Read one padded string, keeping its framing in `raw`.
    async fn string(&mut self, what: &'static str, max: u64) -> Result<&[u8], ProtocolError> {
        let mut word = [0u8; 8];
        self.r.read_exact(&mut word).await.map_err(map_eof)?;
        let len = u64::from_le_bytes(word);
        if len > max {
            return Err(ProtocolError::TooLong { what, len, limit: max });
        }
        let total = self.raw.len() as u64 + 8 + len + padding(len) as u64;
        if total > self.limit {
            return Err(ProtocolError::TooLong { what: "archive", len: total, limit: self.limit });
        }
        self.raw.extend_from_slice(&word);
        let start = self.raw.len();
        self.raw.resize(start + len as usize + padding(len), 0);
        self.r.read_exact(&mut self.raw[start..]).await.map_err(map_eof)?;
        Ok(&self.raw[start..start + len as usize])
    }

    async fn token(&mut self) -> Result<Vec<u8>, ProtocolError> {
        Ok(self.string("archive token", MAX_TOKEN_LEN).await?.to_vec())
    }

    async fn expect(&mut self, tag: &str) -> Result<(), ProtocolError> {
        if self.string("archive token", MAX_TOKEN_LEN).await? != tag.as_bytes() {
            return Err(ProtocolError::InvalidArchive);
        }
        Ok(())
    }

    async fn contents(&mut self) -> Result<(), ProtocolError> {
        let limit = self.limit;
        self.string("file contents", limit).await.map(|_| ())
    }
}

#[cfg(test)]
#[path = "nar_tests.rs"]
mod tests;
