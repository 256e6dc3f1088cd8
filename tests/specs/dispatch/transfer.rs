// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Input transfer specs
//!
//! Workers only receive what they lack.

use crate::prelude::*;

#[tokio::test]
async fn redispatch_sends_no_inputs_twice() {
    let farm = Farm::new().worker("b1", FakeMachine::new());

    let first = farm.dispatch("b1", &hello(), DEADLINE).await;
    assert_eq!(first.outcome(), BuildOutcome::Success);
    let after_first = farm.transport.stats("b1");
    assert_eq!(after_first.import_calls, 1);
    assert_eq!(after_first.imported_paths.len(), 2);

    let second = farm.dispatch("b1", &hello(), DEADLINE).await;
    assert_eq!(second.outcome(), BuildOutcome::Success);
    let after_second = farm.transport.stats("b1");
    assert_eq!(after_second.import_calls, 1);
    assert_eq!(after_second.bytes_imported, after_first.bytes_imported);
    assert_eq!(after_second.builds, 2);
}

#[tokio::test]
async fn inputs_already_on_the_worker_are_not_sent() {
    let farm = Farm::new().worker("b1", FakeMachine::new().valid_path(GLIBC).valid_path(SRC));

    let record = farm.dispatch("b1", &hello(), DEADLINE).await;

    assert_eq!(record.outcome(), BuildOutcome::Success);
    let stats = farm.transport.stats("b1");
    assert_eq!((stats.import_calls, stats.bytes_imported), (0, 0));
    assert!(farm.store.exported().is_empty());
}

#[tokio::test]
async fn missing_local_inputs_fail_before_the_build() {
    let farm = Farm::new().worker("b1", FakeMachine::new());
    let task = BuildTask::new(
        DRV,
        Derivation::new("x86_64-linux", "/bin/sh").output("out", OUT).input("/nix/store/6666-absent"),
    );

    let record = farm.dispatch("b1", &task, DEADLINE).await;

    assert_well_formed(&record);
    assert_eq!(record.outcome(), BuildOutcome::MiscFailure);
    assert!(record.error_msg().starts_with("sync inputs: input transfer failed"), "{}", record.error_msg());
    assert_eq!(farm.transport.stats("b1").builds, 0);
}
