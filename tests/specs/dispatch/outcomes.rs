// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Outcome specs
//!
//! Every dispatch ends in one well-formed record, whatever went wrong.

use rbd_wire::RemoteBuildStatus;

use crate::prelude::*;

#[tokio::test]
async fn successful_build_reports_every_declared_output() {
    let farm = Farm::new().worker("b1", FakeMachine::new().log_line("building hello"));

    let record = farm.dispatch("b1", &hello(), DEADLINE).await;

    assert_well_formed(&record);
    assert_eq!(record.outcome(), BuildOutcome::Success);
    assert_eq!(record.error_msg(), "");
    let names: Vec<&str> = record.outputs().keys().map(String::as_str).collect();
    assert_eq!(names, ["doc", "out"]);
    assert!(farm.store.contains(OUT) && farm.store.contains(DOC));
    assert_eq!(farm.log_contents("b1"), "building hello\n");
}

#[tokio::test]
async fn records_serialize_with_snake_case_outcomes() {
    let farm = Farm::new().worker("b1", FakeMachine::new());

    let record = farm.dispatch("b1", &hello(), DEADLINE).await;

    let json = serde_json::to_value(&record).unwrap();
    assert_eq!(json["outcome"], "success");
    assert_eq!(json["outputs"]["out"], OUT);
}

#[tokio::test]
async fn malformed_command_is_a_permanent_failure() {
    let farm = Farm::new().worker("b1", FakeMachine::new());
    let task = BuildTask::new(DRV, Derivation::new("x86_64-linux", "").output("out", OUT));

    let record = farm.dispatch("b1", &task, DEADLINE).await;

    assert_well_formed(&record);
    assert_eq!(record.outcome(), BuildOutcome::PermanentFailure);
    assert!(record.error_msg().contains("empty builder"), "{}", record.error_msg());
    assert_eq!(farm.transport.stats("b1").opens, 0);
}

#[tokio::test]
async fn every_failure_carries_a_phase_and_a_message() {
    let farm = Farm::new()
        .worker("refused", FakeMachine::new().connect(ConnectBehavior::RefuseAuth))
        .worker("broken", FakeMachine::new().build(BuildBehavior::Disconnect))
        .worker("failing", FakeMachine::new().build(BuildBehavior::Fail(
            RemoteBuildStatus::PermanentFailure,
            "builder for hello failed with exit code 1".into(),
        )))
        .worker("crashing", FakeMachine::new().connect(ConnectBehavior::Panic));

    let cases = [
        ("refused", BuildOutcome::MiscFailure, "connect: "),
        ("broken", BuildOutcome::MiscFailure, "execute: "),
        ("failing", BuildOutcome::PermanentFailure, "execute: "),
        ("crashing", BuildOutcome::MiscFailure, "connect: internal error"),
        ("unknown", BuildOutcome::MiscFailure, "connect: "),
    ];
    for (machine, outcome, prefix) in cases {
        let record = farm.dispatch(machine, &hello(), DEADLINE).await;
        assert_well_formed(&record);
        assert_eq!(record.outcome(), outcome, "{}: {}", machine, record.error_msg());
        assert!(record.error_msg().starts_with(prefix), "{}: {}", machine, record.error_msg());
    }
    assert_eq!(farm.transport.open_sessions(), 0);
}
