// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use rbd_core::Derivation;
use rbd_wire::{
    client_handshake, nar_regular, read_build_result, read_export, read_u64,
    write_build_derivation, write_query_valid_paths, BuildOptions,
};
use tokio::io::AsyncReadExt;

const SRC: &str = "/nix/store/aaa-src";
const OUT: &str = "/nix/store/bbb-hello";

fn machine(name: &str) -> MachineDescriptor {
    MachineDescriptor::new(name, "/keys/id")
}

fn hello() -> Derivation {
    Derivation::new("x86_64-linux", "/bin/sh").output("out", OUT).input(SRC)
}

fn set(items: &[&str]) -> BTreeSet<StorePath> {
    items.iter().map(|p| StorePath::from(*p)).collect()
}

#[tokio::test]
async fn unknown_machine_is_unreachable() {
    let transport = FakeTransport::new();
    let err = transport.open(&machine("nowhere")).await.err().unwrap();
    assert!(matches!(err, ConnectionError::Unreachable { .. }));
}

#[tokio::test]
async fn refused_auth_is_reported() {
    let transport = FakeTransport::new();
    transport.add_machine("b1", FakeMachine::new().connect(ConnectBehavior::RefuseAuth));
    let err = transport.open(&machine("b1")).await.err().unwrap();
    assert!(matches!(err, ConnectionError::AuthFailed { .. }));
    assert_eq!(transport.stats("b1").opens, 0);
}

#[tokio::test]
async fn close_is_idempotent_and_counted() {
    let transport = FakeTransport::new();
    transport.add_machine("b1", FakeMachine::new());

    let mut session = transport.open(&machine("b1")).await.unwrap();
    assert_eq!(transport.open_sessions(), 1);
    session.close().await.unwrap();
    session.close().await.unwrap();

    let stats = transport.stats("b1");
    assert_eq!((stats.opens, stats.closes, stats.open_sessions), (1, 1, 0));
    assert!(!session.is_open());
}

#[tokio::test]
async fn dropping_a_session_leaves_it_open() {
    let transport = FakeTransport::new();
    transport.add_machine("b1", FakeMachine::new());
    drop(transport.open(&machine("b1")).await.unwrap());
    assert_eq!(transport.open_sessions(), 1);
}

#[tokio::test]
async fn worker_serves_a_full_build() {
    let transport = FakeTransport::new();
    transport.add_machine("b1", FakeMachine::new().log_line("building hello"));
    let mut session = transport.open(&machine("b1")).await.unwrap();
    let mut process = session.run_command(&RemoteCommand::new("nix-store")).await.unwrap();
    let (w, r) = (&mut process.stdin, &mut process.stdout);

    let version = client_handshake(r, w).await.unwrap();
    assert_eq!(version, SERVE_PROTOCOL_VERSION);

    write_query_valid_paths(w, &set(&[SRC]), false, false).await.unwrap();
    assert!(read_paths(r).await.unwrap().is_empty());

    write_u64(w, ServeCommand::ImportPaths.code()).await.unwrap();
    let exported = ExportedPath {
        path: StorePath::from(SRC),
        archive: nar_regular(b"source"),
        references: BTreeSet::new(),
        deriver: None,
    };
    write_exported_path(w, &exported).await.unwrap();
    write_export_end(w).await.unwrap();
    assert_eq!(read_u64(r).await.unwrap(), 1);

    write_build_derivation(w, &StorePath::from("/nix/store/ccc-hello.drv"), &hello(), BuildOptions::default(), version)
        .await
        .unwrap();
    let result = read_build_result(r, version).await.unwrap();
    assert_eq!(result.status, RemoteBuildStatus::Built);
    assert_eq!(result.times_built, 1);

    drop(process.stdin);
    assert_eq!(process.control.wait().await.unwrap(), Some(0));

    let mut log = String::new();
    process.stderr.read_to_string(&mut log).await.unwrap();
    assert_eq!(log, "building hello\n");

    let stats = transport.stats("b1");
    assert_eq!(stats.import_calls, 1);
    assert_eq!(stats.bytes_imported, nar_regular(b"source").len() as u64);
    assert_eq!(stats.builds, 1);
    assert!(transport.valid_paths("b1").contains(OUT));
}

#[yare::parameterized(
    limits_only = { 0x201 },
    log_size = { 0x202 },
    repeat = { 0x204 },
)]
#[test_macro(tokio::test)]
async fn worker_reads_build_options_for_the_negotiated_version(worker_version: u64) {
    let transport = FakeTransport::new();
    transport.add_machine("b1", FakeMachine::new().valid_path(SRC).protocol_version(worker_version));
    let mut session = transport.open(&machine("b1")).await.unwrap();
    let mut process = session.run_command(&RemoteCommand::new("nix-store")).await.unwrap();
    let (w, r) = (&mut process.stdin, &mut process.stdout);

    let version = client_handshake(r, w).await.unwrap();
    let options = BuildOptions {
        max_silent_time: 60,
        build_timeout: 600,
        max_log_size: 1024,
        build_repeat: 2,
        enforce_determinism: true,
    };
    write_build_derivation(w, &StorePath::from("/nix/store/ccc-hello.drv"), &hello(), options, version)
        .await
        .unwrap();
    assert_eq!(read_build_result(r, version).await.unwrap().status, RemoteBuildStatus::Built);

    // the stream stays in step for the next command
    write_u64(w, ServeCommand::ExportPaths.code()).await.unwrap();
    write_paths(w, &set(&[OUT])).await.unwrap();
    w.flush().await.unwrap();
    let outputs = read_export(r).await.unwrap();
    assert_eq!(outputs.len(), 1);

    let received = transport.stats("b1").build_options.unwrap();
    assert_eq!((received.max_silent_time, received.build_timeout), (60, 600));
    assert_eq!(received.max_log_size, if worker_version >= 0x202 { 1024 } else { 0 });
    assert_eq!(received.enforce_determinism, worker_version >= 0x203);
}

#[tokio::test]
async fn build_with_missing_inputs_fails_on_the_worker() {
    let transport = FakeTransport::new();
    transport.add_machine("b1", FakeMachine::new());
    let mut session = transport.open(&machine("b1")).await.unwrap();
    let mut process = session.run_command(&RemoteCommand::new("nix-store")).await.unwrap();
    let (w, r) = (&mut process.stdin, &mut process.stdout);

    let version = client_handshake(r, w).await.unwrap();
    write_build_derivation(w, &StorePath::from("/nix/store/ccc-hello.drv"), &hello(), BuildOptions::default(), version)
        .await
        .unwrap();
    let result = read_build_result(r, version).await.unwrap();
    assert_eq!(result.status, RemoteBuildStatus::MiscFailure);
    assert!(result.error_msg.contains(SRC));
}

#[tokio::test]
async fn disconnect_exits_like_ssh() {
    let transport = FakeTransport::new();
    transport.add_machine(
        "b1",
        FakeMachine::new().valid_path(SRC).build(BuildBehavior::Disconnect),
    );
    let mut session = transport.open(&machine("b1")).await.unwrap();
    let mut process = session.run_command(&RemoteCommand::new("nix-store")).await.unwrap();
    let (w, r) = (&mut process.stdin, &mut process.stdout);

    let version = client_handshake(r, w).await.unwrap();
    write_build_derivation(w, &StorePath::from("/nix/store/ccc-hello.drv"), &hello(), BuildOptions::default(), version)
        .await
        .unwrap();
    let err = read_build_result(r, version).await.unwrap_err();
    assert!(matches!(err, ProtocolError::ConnectionClosed));
    assert_eq!(process.control.wait().await.unwrap(), Some(255));
}

#[tokio::test]
async fn killed_worker_has_no_exit_code() {
    let transport = FakeTransport::new();
    transport.add_machine("b1", FakeMachine::new());
    let mut session = transport.open(&machine("b1")).await.unwrap();
    let mut process = session.run_command(&RemoteCommand::new("nix-store")).await.unwrap();

    process.control.kill().await;
    assert_eq!(process.control.wait().await.unwrap(), None);
    assert_eq!(process.control.wait().await.unwrap(), None);
}

#[tokio::test]
async fn closed_session_refuses_commands() {
    let transport = FakeTransport::new();
    transport.add_machine("b1", FakeMachine::new());
    let mut session = transport.open(&machine("b1")).await.unwrap();
    session.close().await.unwrap();
    let err = session.run_command(&RemoteCommand::new("nix-store")).await.err().unwrap();
    assert!(matches!(err, ConnectionError::Closed(_)));
}
