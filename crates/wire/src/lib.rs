// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker serve protocol.
//!
//! Wire format: 64-bit little-endian words; strings are a length word
//! followed by bytes zero-padded to a multiple of 8.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod codec;
mod nar;
mod serve;
mod status;

pub use codec::{
    read_bytes, read_paths, read_string, read_strings, read_u64, write_bytes, write_paths,
    write_string, write_strings, write_u64, ProtocolError, MAX_ARCHIVE_LEN, MAX_STRING_LEN,
};
pub use nar::{nar_regular, read_nar, NAR_MAGIC};
pub use serve::{
    client_handshake, major, minor, read_build_derivation, read_build_result, read_command,
    read_export, read_query_valid_paths, worker_handshake, write_build_derivation,
    write_build_result, write_export_end, write_exported_path, write_query_valid_paths,
    BuildOptions, BuildResult, ExportedPath, ServeCommand, EXPORT_MAGIC, SERVE_MAGIC_1,
    SERVE_MAGIC_2, SERVE_PROTOCOL_VERSION,
};
pub use status::RemoteBuildStatus;
