// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Dispatcher configuration.
//!
//! Loaded from TOML text or from `RBD_*` environment variables. Missing
//! fields and unparsable environment values fall back to the defaults.

use rbd_adapters::{RemoteCommand, SshConfig, SshTransport};
use rbd_wire::BuildOptions;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Worker-enforced limit on a build producing no output (0 = unlimited)
    pub max_silent_time_secs: u64,
    /// Worker-enforced limit on total build time (0 = unlimited)
    pub build_timeout_secs: u64,
    /// Worker-enforced cap on build log size (0 = unlimited)
    pub max_log_size_bytes: u64,
    /// Extra rounds the worker builds to check determinism
    pub build_repeat: u64,
    /// Fail the build when repeated rounds differ
    pub enforce_determinism: bool,
    pub connect_timeout_secs: u64,
    /// How long `ssh -O exit` may take before the master is killed
    pub ssh_exit_timeout_ms: u64,
    /// How long teardown waits for the log relay to drain
    pub log_drain_timeout_ms: u64,
    pub remote_program: String,
    pub remote_args: Vec<String>,
    pub ssh_program: String,
    pub control_dir: PathBuf,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_silent_time_secs: 3600,
            build_timeout_secs: 7200,
            max_log_size_bytes: 64 << 20,
            build_repeat: 0,
            enforce_determinism: false,
            connect_timeout_secs: 30,
            ssh_exit_timeout_ms: 5000,
            log_drain_timeout_ms: 5000,
            remote_program: "nix-store".to_string(),
            remote_args: vec!["--serve".to_string(), "--write".to_string()],
            ssh_program: "ssh".to_string(),
            control_dir: std::env::temp_dir(),
        }
    }
}

impl DispatchConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `RBD_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_silent_time_secs: env_u64("RBD_MAX_SILENT_TIME_SECS")
                .unwrap_or(defaults.max_silent_time_secs),
            build_timeout_secs: env_u64("RBD_BUILD_TIMEOUT_SECS").unwrap_or(defaults.build_timeout_secs),
            max_log_size_bytes: env_u64("RBD_MAX_LOG_SIZE_BYTES").unwrap_or(defaults.max_log_size_bytes),
            build_repeat: env_u64("RBD_BUILD_REPEAT").unwrap_or(defaults.build_repeat),
            enforce_determinism: env_bool("RBD_ENFORCE_DETERMINISM")
                .unwrap_or(defaults.enforce_determinism),
            connect_timeout_secs: env_u64("RBD_CONNECT_TIMEOUT_SECS")
                .unwrap_or(defaults.connect_timeout_secs),
            ssh_exit_timeout_ms: env_u64("RBD_SSH_EXIT_TIMEOUT_MS")
                .unwrap_or(defaults.ssh_exit_timeout_ms),
            log_drain_timeout_ms: env_u64("RBD_LOG_DRAIN_TIMEOUT_MS")
                .unwrap_or(defaults.log_drain_timeout_ms),
            remote_program: env_string("RBD_REMOTE_PROGRAM").unwrap_or(defaults.remote_program),
            remote_args: defaults.remote_args,
            ssh_program: env_string("RBD_SSH_PROGRAM").unwrap_or(defaults.ssh_program),
            control_dir: env_string("RBD_CONTROL_DIR").map(PathBuf::from).unwrap_or(defaults.control_dir),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remote_program.trim().is_empty() {
            return Err(ConfigError::Invalid("remote_program must not be empty".to_string()));
        }
        if self.ssh_program.trim().is_empty() {
            return Err(ConfigError::Invalid("ssh_program must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn build_options(&self) -> BuildOptions {
        BuildOptions {
            max_silent_time: self.max_silent_time_secs,
            build_timeout: self.build_timeout_secs,
            max_log_size: self.max_log_size_bytes,
            build_repeat: self.build_repeat,
            enforce_determinism: self.enforce_determinism,
        }
    }

    /// Command that starts the worker's serve loop.
    pub fn remote_command(&self) -> RemoteCommand {
        RemoteCommand::new(&self.remote_program).args(self.remote_args.clone())
    }

    pub fn log_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.log_drain_timeout_ms)
    }

    pub fn ssh_config(&self) -> SshConfig {
        SshConfig::default()
            .program(&self.ssh_program)
            .control_dir(&self.control_dir)
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .exit_timeout(Duration::from_millis(self.ssh_exit_timeout_ms))
    }

    pub fn ssh_transport(&self) -> SshTransport {
        SshTransport::new(self.ssh_config())
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_bool(name: &str) -> Option<bool> {
    match std::env::var(name).ok()?.trim() {
        "1" | "true" => Some(true),
        "0" | "false" => Some(false),
        _ => None,
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
