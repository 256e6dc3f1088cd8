// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Deadline specs
//!
//! A silent worker is cut off at the deadline and its session closed.

use crate::prelude::*;

#[tokio::test(start_paused = true)]
async fn silent_worker_times_out_and_the_session_is_closed() {
    let farm = Farm::new().worker("b1", FakeMachine::new().build(BuildBehavior::Hang));

    let record = farm.dispatch("b1", &hello(), Duration::from_secs(120)).await;

    assert_well_formed(&record);
    assert_eq!(record.outcome(), BuildOutcome::TimedOut);
    assert!(record.error_msg().starts_with("execute: timed out"), "{}", record.error_msg());
    let stats = farm.transport.stats("b1");
    assert_eq!(stats.opens, stats.closes);
    assert_eq!(farm.transport.open_sessions(), 0);
}

#[tokio::test(start_paused = true)]
async fn the_deadline_covers_input_transfer() {
    let farm = Farm::new().worker("b1", FakeMachine::new().hang_on_import(true));

    let record = farm.dispatch("b1", &hello(), Duration::from_secs(5)).await;

    assert_eq!(record.outcome(), BuildOutcome::TimedOut);
    assert!(record.error_msg().starts_with("sync inputs: "), "{}", record.error_msg());
    assert_eq!(farm.transport.stats("b1").builds, 0);
    assert_eq!(farm.transport.open_sessions(), 0);
}

#[tokio::test(start_paused = true)]
async fn the_deadline_covers_connecting() {
    let farm = Farm::new().worker("b1", FakeMachine::new().connect(ConnectBehavior::Hang));

    let record = farm.dispatch("b1", &hello(), Duration::from_secs(5)).await;

    assert_eq!(record.outcome(), BuildOutcome::TimedOut);
    assert!(record.error_msg().starts_with("connect: "), "{}", record.error_msg());
}
