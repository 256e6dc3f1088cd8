// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! rbd-core: data model for the remote build dispatcher

pub mod macros;

pub mod clock;
pub mod derivation;
pub mod machine;
pub mod result;
pub mod store_path;

pub use clock::{Clock, FakeClock, SystemClock};
pub use derivation::{BuildTask, Derivation, DerivationError, DerivationOutput};
pub use machine::{LogDestination, MachineDescriptor, LOCALHOST};
pub use result::{BuildOutcome, RemoteTimings, ResultBuilder, ResultRecord, UNCLASSIFIED_MESSAGE};
pub use store_path::StorePath;
