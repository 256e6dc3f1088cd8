// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! rbd-engine: remote build protocol, result classification, log relay
//! and the dispatcher that ties them together

pub mod classify;
pub mod config;
pub mod dispatcher;
pub mod protocol;
pub mod relay;

pub use classify::{classify, Attempt, FailureKind};
pub use config::{ConfigError, DispatchConfig};
pub use dispatcher::Dispatcher;
pub use protocol::{run_build, BuildReport, Phase, ProtocolFailure, ServeClient};
pub use relay::{LogRelay, RelayReport};
