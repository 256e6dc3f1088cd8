// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Result Classifier.
//!
//! | Attempt                                   | Outcome                    |
//! |-------------------------------------------|----------------------------|
//! | completed with a report, before deadline  | Success                    |
//! | rejection or deterministic build failure  | PermanentFailure           |
//! | deadline passed (locally or on worker)    | TimedOut                   |
//! | anything else, cancellation, crash        | MiscFailure                |
//!
//! An attempt that completed after the deadline is TimedOut whatever it
//! reported. One that completed at or before the deadline keeps its own
//! classification. Elapsed time is measured on the monotonic clock.

use crate::protocol::{BuildReport, Phase, ProtocolFailure};
use rbd_core::BuildOutcome;
use rbd_wire::RemoteBuildStatus;
use std::time::Duration;

/// Failure taxonomy that outcomes are derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Derivation malformed or refused
    Rejection,
    /// The build ran and failed
    BuildFailure,
    DeadlineExceeded,
    Unclassified,
}

impl FailureKind {
    /// Kind of a non-success worker status.
    pub fn of_status(status: RemoteBuildStatus) -> Self {
        match status {
            RemoteBuildStatus::InputRejected => FailureKind::Rejection,
            RemoteBuildStatus::PermanentFailure
            | RemoteBuildStatus::OutputRejected
            | RemoteBuildStatus::CachedFailure
            | RemoteBuildStatus::DependencyFailed
            | RemoteBuildStatus::LogLimitExceeded
            | RemoteBuildStatus::NotDeterministic => FailureKind::BuildFailure,
            RemoteBuildStatus::TimedOut => FailureKind::DeadlineExceeded,
            RemoteBuildStatus::Built
            | RemoteBuildStatus::Substituted
            | RemoteBuildStatus::AlreadyValid
            | RemoteBuildStatus::TransientFailure
            | RemoteBuildStatus::MiscFailure => FailureKind::Unclassified,
        }
    }

    pub fn outcome(self) -> BuildOutcome {
        match self {
            FailureKind::Rejection | FailureKind::BuildFailure => BuildOutcome::PermanentFailure,
            FailureKind::DeadlineExceeded => BuildOutcome::TimedOut,
            FailureKind::Unclassified => BuildOutcome::MiscFailure,
        }
    }
}

/// How one dispatch attempt ended, as seen by the dispatcher.
#[derive(Debug)]
pub enum Attempt {
    /// The protocol returned, `elapsed` after dispatch start
    Completed { phase: Phase, result: Result<BuildReport, ProtocolFailure>, elapsed: Duration },
    /// The deadline fired first
    DeadlineExceeded { phase: Phase, elapsed: Duration },
    Cancelled { phase: Phase },
    /// The protocol layer panicked
    Crashed { phase: Phase, message: String },
}

impl Attempt {
    pub fn phase(&self) -> Phase {
        match self {
            Attempt::Completed { phase, .. }
            | Attempt::DeadlineExceeded { phase, .. }
            | Attempt::Cancelled { phase }
            | Attempt::Crashed { phase, .. } => *phase,
        }
    }

    /// The report of an attempt that completed successfully.
    pub fn report(&self) -> Option<&BuildReport> {
        match self {
            Attempt::Completed { result: Ok(report), .. } => Some(report),
            _ => None,
        }
    }
}

/// Map an attempt to its outcome and operator-facing message.
///
/// The message is empty exactly when the outcome is Success, and always
/// names the phase otherwise.
pub fn classify(attempt: &Attempt, deadline: Duration) -> (BuildOutcome, String) {
    match attempt {
        Attempt::Completed { phase, elapsed, .. } if *elapsed > deadline => (
            BuildOutcome::TimedOut,
            format!(
                "{}: deadline of {}ms exceeded after {}ms, before the worker's result arrived",
                phase,
                deadline.as_millis(),
                elapsed.as_millis()
            ),
        ),
        Attempt::Completed { result: Ok(_), .. } => (BuildOutcome::Success, String::new()),
        Attempt::Completed { phase, result: Err(failure), .. } => {
            (failure.kind().outcome(), format!("{}: {}", phase, failure))
        }
        Attempt::DeadlineExceeded { phase, elapsed } => (
            BuildOutcome::TimedOut,
            format!(
                "{}: timed out after {}ms (deadline {}ms)",
                phase,
                elapsed.as_millis(),
                deadline.as_millis()
            ),
        ),
        Attempt::Cancelled { phase } => {
            (BuildOutcome::MiscFailure, format!("{}: dispatch cancelled", phase))
        }
        Attempt::Crashed { phase, message } => {
            (BuildOutcome::MiscFailure, format!("{}: internal error: {}", phase, message))
        }
    }
}

#[cfg(test)]
#[path = "classify_tests.rs"]
mod tests;
