// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! rbd-adapters: transport sessions and the local store seam

pub mod store;
pub mod transport;

pub use store::{Store, StoreError};
pub use transport::{
    shell_quote, BoxedReader, BoxedWriter, ChildControl, ConnectionError, KeyLocks,
    ProcessControl, RemoteCommand, RemoteProcess, Session, SshConfig, SshSession, SshTransport,
    Transport,
};

#[cfg(any(test, feature = "test-support"))]
pub use store::FakeStore;
#[cfg(any(test, feature = "test-support"))]
pub use transport::{
    BuildBehavior, ConnectBehavior, FakeMachine, FakeSession, FakeTransport, MachineStats,
};
