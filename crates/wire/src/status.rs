// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Build status codes reported by a worker.

/// Status word returned by `BuildDerivation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteBuildStatus {
    Built,
    Substituted,
    AlreadyValid,
    PermanentFailure,
    InputRejected,
    OutputRejected,
    TransientFailure,
    CachedFailure,
    TimedOut,
    MiscFailure,
    DependencyFailed,
    LogLimitExceeded,
    NotDeterministic,
}

const ALL: [RemoteBuildStatus; 13] = [
    RemoteBuildStatus::Built,
    RemoteBuildStatus::Substituted,
    RemoteBuildStatus::AlreadyValid,
    RemoteBuildStatus::PermanentFailure,
    RemoteBuildStatus::InputRejected,
    RemoteBuildStatus::OutputRejected,
    RemoteBuildStatus::TransientFailure,
    RemoteBuildStatus::CachedFailure,
    RemoteBuildStatus::TimedOut,
    RemoteBuildStatus::MiscFailure,
    RemoteBuildStatus::DependencyFailed,
    RemoteBuildStatus::LogLimitExceeded,
    RemoteBuildStatus::NotDeterministic,
];

impl RemoteBuildStatus {
    pub fn from_code(code: u64) -> Option<Self> {
        ALL.get(usize::try_from(code).ok()?).copied()
    }

    pub fn code(self) -> u64 {
        self as u64
    }

    /// Whether the outputs are valid on the worker after this status.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            RemoteBuildStatus::Built | RemoteBuildStatus::Substituted | RemoteBuildStatus::AlreadyValid
        )
    }
}

rbd_core::simple_display! {
    RemoteBuildStatus {
        Built => "built",
        Substituted => "substituted",
        AlreadyValid => "already valid",
        PermanentFailure => "permanent failure",
        InputRejected => "input rejected",
        OutputRejected => "output rejected",
        TransientFailure => "transient failure",
        CachedFailure => "cached failure",
        TimedOut => "timed out",
        MiscFailure => "misc failure",
        DependencyFailed => "dependency failed",
        LogLimitExceeded => "log limit exceeded",
        NotDeterministic => "not deterministic",
    }
}
