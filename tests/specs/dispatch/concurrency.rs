// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Concurrency specs
//!
//! Dispatches of one task to two workers run side by side without sharing
//! results or logs.

use crate::prelude::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn parallel_dispatches_stay_independent() {
    let farm = Farm::new()
        .worker("b1", FakeMachine::new().log_line("b1: building"))
        .worker("b2", FakeMachine::new().build(BuildBehavior::Fail(
            rbd_wire::RemoteBuildStatus::PermanentFailure,
            "b2 refuses".into(),
        )).log_line("b2: building"));
    let dispatcher = farm.dispatcher();
    let task = hello();
    let (m1, m2) = (machine_named("b1"), machine_named("b2"));
    let (l1, l2) = (farm.log("b1"), farm.log("b2"));

    let (r1, r2) = tokio::join!(
        dispatcher.dispatch(&m1, &task, &l1, DEADLINE),
        dispatcher.dispatch(&m2, &task, &l2, DEADLINE),
    );

    assert_well_formed(&r1);
    assert_well_formed(&r2);
    assert_eq!(r1.outcome(), BuildOutcome::Success);
    assert_eq!(r2.outcome(), BuildOutcome::PermanentFailure);
    assert!(r2.error_msg().contains("b2 refuses"));
    assert_eq!(farm.log_contents("b1"), "b1: building\n");
    assert_eq!(farm.log_contents("b2"), "b2: building\n");
    assert_eq!(farm.transport.stats("b1").builds, 1);
    assert_eq!(farm.transport.stats("b2").builds, 1);
    assert_eq!(farm.transport.open_sessions(), 0);
}
