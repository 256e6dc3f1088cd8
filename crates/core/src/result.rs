// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Build outcome classification and the per-dispatch result record.
//!
//! A [`ResultBuilder`] is created when a dispatch starts and is the only
//! mutable form of a result. [`ResultBuilder::finish`] consumes it and
//! returns the immutable [`ResultRecord`] handed to the caller.

use crate::store_path::StorePath;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Message used when a dispatch ends without anything classifying it.
pub const UNCLASSIFIED_MESSAGE: &str = "internal error: dispatch ended before its outcome was classified";

/// Terminal outcome of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildOutcome {
    Success,
    /// Deterministic failure; retrying on another machine will not help
    PermanentFailure,
    TimedOut,
    /// Connection loss, transport errors and anything unclassified
    MiscFailure,
}

impl BuildOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, BuildOutcome::Success)
    }
}

crate::simple_display! {
    BuildOutcome {
        Success => "success",
        PermanentFailure => "permanent failure",
        TimedOut => "timed out",
        MiscFailure => "misc failure",
    }
}

/// Timing metadata reported by the worker itself (seconds since epoch).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RemoteTimings {
    pub times_built: u64,
    pub non_deterministic: bool,
    pub start_time: u64,
    pub stop_time: u64,
}

/// Immutable outcome of a dispatch.
///
/// Invariants (enforced by [`ResultBuilder::finish`]):
/// - `stop_time >= start_time`
/// - `error_msg` is empty iff `outcome` is `Success`
/// - `outputs` is empty unless `outcome` is `Success`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultRecord {
    outcome: BuildOutcome,
    error_msg: String,
    start_time: u64,
    stop_time: u64,
    outputs: BTreeMap<String, StorePath>,
    log_file: Option<PathBuf>,
    remote: Option<RemoteTimings>,
}

impl ResultRecord {
    pub fn outcome(&self) -> BuildOutcome {
        self.outcome
    }

    pub fn error_msg(&self) -> &str {
        &self.error_msg
    }

    /// Epoch milliseconds at dispatch entry
    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    /// Epoch milliseconds at dispatch exit
    pub fn stop_time(&self) -> u64 {
        self.stop_time
    }

    pub fn duration_ms(&self) -> u64 {
        self.stop_time - self.start_time
    }

    /// Output name → store path, for every declared output on success.
    pub fn outputs(&self) -> &BTreeMap<String, StorePath> {
        &self.outputs
    }

    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }

    pub fn remote_timings(&self) -> Option<&RemoteTimings> {
        self.remote.as_ref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Verdict {
    Unclassified,
    Classified { outcome: BuildOutcome, message: String },
}

/// In-progress result, owned by a single dispatch.
#[derive(Debug)]
pub struct ResultBuilder {
    start_time: u64,
    verdict: Verdict,
    outputs: BTreeMap<String, StorePath>,
    log_file: Option<PathBuf>,
    remote: Option<RemoteTimings>,
}

impl ResultBuilder {
    /// Start a result at `start_time` (epoch ms), explicitly unclassified.
    pub fn start(start_time: u64) -> Self {
        Self {
            start_time,
            verdict: Verdict::Unclassified,
            outputs: BTreeMap::new(),
            log_file: None,
            remote: None,
        }
    }

    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    /// Record the outcome. A later call replaces an earlier one.
    pub fn classify(&mut self, outcome: BuildOutcome, message: impl Into<String>) -> &mut Self {
        self.verdict = Verdict::Classified { outcome, message: message.into() };
        self
    }

    pub fn outcome(&self) -> Option<BuildOutcome> {
        match &self.verdict {
            Verdict::Unclassified => None,
            Verdict::Classified { outcome, .. } => Some(*outcome),
        }
    }

    pub fn outputs(&mut self, outputs: BTreeMap<String, StorePath>) -> &mut Self {
        self.outputs = outputs;
        self
    }

    pub fn log_file(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.log_file = Some(path.into());
        self
    }

    pub fn remote_timings(&mut self, timings: RemoteTimings) -> &mut Self {
        self.remote = Some(timings);
        self
    }

    /// Seal the record at `stop_time` (epoch ms).
    ///
    /// A stop time earlier than the start (wall clock stepped back) is
    /// clamped to the start time.
    pub fn finish(self, stop_time: u64) -> ResultRecord {
        let (outcome, message) = match self.verdict {
            Verdict::Classified { outcome, message } => (outcome, message),
            Verdict::Unclassified => {
                tracing::error!(start_time = self.start_time, "{}", UNCLASSIFIED_MESSAGE);
                (BuildOutcome::MiscFailure, UNCLASSIFIED_MESSAGE.to_string())
            }
        };

        let (error_msg, outputs) = if outcome.is_success() {
            (String::new(), self.outputs)
        } else if message.trim().is_empty() {
            (format!("{} (no diagnostic reported)", outcome), BTreeMap::new())
        } else {
            (message, BTreeMap::new())
        };

        ResultRecord {
            outcome,
            error_msg,
            start_time: self.start_time,
            stop_time: stop_time.max(self.start_time),
            outputs,
            log_file: self.log_file,
            remote: self.remote,
        }
    }
}

#[cfg(test)]
#[path = "result_tests.rs"]
mod tests;
