// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cancellation specs

use crate::prelude::*;

#[tokio::test]
async fn cancelling_mid_transfer_leaves_no_open_session() {
    let farm = Farm::new().worker("b1", FakeMachine::new().hang_on_import(true));
    let cancel = CancellationToken::new();

    let trigger = {
        let transport = farm.transport.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            while transport.stats("b1").import_calls == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            cancel.cancel();
        })
    };

    let record = farm
        .dispatcher()
        .dispatch_with_cancel(&machine_named("b1"), &hello(), &farm.log("b1"), DEADLINE, &cancel)
        .await;
    trigger.await.unwrap();

    assert_well_formed(&record);
    assert_ne!(record.outcome(), BuildOutcome::Success);
    assert!(record.error_msg().contains("cancelled"), "{}", record.error_msg());
    let stats = farm.transport.stats("b1");
    assert_eq!((stats.opens, stats.closes, stats.open_sessions), (1, 1, 0));
}
