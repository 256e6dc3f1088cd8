// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared fixtures for dispatcher specs.

pub use rbd_adapters::{BuildBehavior, ConnectBehavior, FakeMachine, FakeStore, FakeTransport};
pub use rbd_core::{
    BuildOutcome, BuildTask, Derivation, FakeClock, LogDestination, MachineDescriptor,
    ResultRecord,
};
pub use rbd_engine::{DispatchConfig, Dispatcher};
pub use std::time::Duration;
pub use tokio_util::sync::CancellationToken;

use tempfile::TempDir;

pub const GLIBC: &str = "/nix/store/1111-glibc";
pub const SRC: &str = "/nix/store/2222-hello-src";
pub const OUT: &str = "/nix/store/3333-hello";
pub const DOC: &str = "/nix/store/4444-hello-doc";
pub const DRV: &str = "/nix/store/5555-hello.drv";

pub const DEADLINE: Duration = Duration::from_secs(3600);

/// A local store with the hello inputs plus any number of fake workers.
pub struct Farm {
    pub transport: FakeTransport,
    pub store: FakeStore,
    logs: TempDir,
}

impl Farm {
    pub fn new() -> Self {
        let store = FakeStore::new();
        store.add(GLIBC, &[], b"glibc archive");
        store.add(SRC, &[GLIBC], b"hello source");
        Self { transport: FakeTransport::new(), store, logs: TempDir::new().unwrap() }
    }

    pub fn worker(self, name: &str, machine: FakeMachine) -> Self {
        self.transport.add_machine(name, machine);
        self
    }

    pub fn dispatcher(&self) -> Dispatcher<FakeTransport, FakeStore, FakeClock> {
        Dispatcher::with_clock(
            self.transport.clone(),
            self.store.clone(),
            FakeClock::new(1_700_000_000_000),
            DispatchConfig::default(),
        )
    }

    pub fn log(&self, name: &str) -> LogDestination {
        LogDestination::new(self.logs.path().join(name))
    }

    pub fn log_contents(&self, name: &str) -> String {
        std::fs::read_to_string(self.log(name).path()).unwrap_or_default()
    }

    pub async fn dispatch(&self, machine: &str, task: &BuildTask, deadline: Duration) -> ResultRecord {
        self.dispatcher()
            .dispatch(&machine_named(machine), task, &self.log(machine), deadline)
            .await
    }
}

pub fn machine_named(name: &str) -> MachineDescriptor {
    MachineDescriptor::new(name, format!("/etc/nix/keys/{}", name))
}

/// hello with two outputs and one source input
pub fn hello() -> BuildTask {
    let drv = Derivation::new("x86_64-linux", "/bin/sh")
        .output("out", OUT)
        .output("doc", DOC)
        .input(SRC);
    BuildTask::new(DRV, drv)
}

/// Record-level invariants that hold for every dispatch.
pub fn assert_well_formed(record: &ResultRecord) {
    assert!(record.stop_time() >= record.start_time(), "{:?}", record);
    assert_eq!(record.error_msg().is_empty(), record.outcome() == BuildOutcome::Success, "{:?}", record);
    if record.outcome() != BuildOutcome::Success {
        assert!(record.outputs().is_empty(), "{:?}", record);
    }
}
