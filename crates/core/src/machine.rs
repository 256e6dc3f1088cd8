// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Remote worker identity and credentials.

use crate::store_path::StorePath;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Machine name that bypasses ssh and runs the worker command locally.
pub const LOCALHOST: &str = "localhost";

/// Identity of one remote build worker.
///
/// `ssh_name` is anything ssh accepts as a destination (`host`,
/// `user@host`). `ssh_key` references the private key used to authenticate;
/// the key material itself is never read by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MachineDescriptor {
    pub ssh_name: String,
    pub ssh_key: PathBuf,
}

impl MachineDescriptor {
    pub fn new(ssh_name: impl Into<String>, ssh_key: impl Into<PathBuf>) -> Self {
        Self { ssh_name: ssh_name.into(), ssh_key: ssh_key.into() }
    }

    /// Whether the worker is this host.
    pub fn is_local(&self) -> bool {
        self.ssh_name == LOCALHOST
    }

    /// Host part of `ssh_name`, without any `user@` prefix.
    pub fn host(&self) -> &str {
        self.ssh_name.rsplit('@').next().unwrap_or(&self.ssh_name)
    }
}

/// Where the Log Relay persists a build's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogDestination {
    path: PathBuf,
}

impl LogDestination {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<log_dir>/<drv base name>`, one file per derivation.
    pub fn for_derivation(log_dir: &Path, drv_path: &StorePath) -> Self {
        Self::new(log_dir.join(drv_path.base_name()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
#[path = "machine_tests.rs"]
mod tests;
