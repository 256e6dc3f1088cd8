// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn machine() -> MachineDescriptor {
    MachineDescriptor::new("root@builder1", "/etc/rbd/id_ed25519")
}

#[test]
fn master_args_authenticate_with_the_key_only() {
    let config = SshConfig::default().connect_timeout(Duration::from_secs(10));
    let args = master_args(&config, &machine(), Path::new("/tmp/m.sock"));

    assert_eq!(&args[..4], &["-M", "-N", "-S", "/tmp/m.sock"]);
    assert!(args.contains(&"BatchMode=yes".to_string()));
    assert!(args.contains(&"ConnectTimeout=10".to_string()));
    let key = args.iter().position(|a| a == "-i").unwrap();
    assert_eq!(args[key + 1], "/etc/rbd/id_ed25519");
    assert_eq!(args.last().map(String::as_str), Some("root@builder1"));
}

#[test]
fn master_args_without_key_use_ssh_defaults() {
    let config = SshConfig::default().extra_args(vec!["-p".into(), "2222".into()]);
    let machine = MachineDescriptor::new("builder1", "");
    let args = master_args(&config, &machine, Path::new("/tmp/m.sock"));

    assert!(!args.contains(&"-i".to_string()));
    let n = args.len();
    assert_eq!(&args[n - 3..], &["-p", "2222", "builder1"]);
}

#[test]
fn command_args_quote_remote_words() {
    let command = RemoteCommand::new("nix-store")
        .args(vec!["--serve".into(), "--write".into()])
        .env(vec![("GREETING".into(), "hello world".into())]);
    let args = command_args(Path::new("/tmp/m.sock"), "builder1", &command);

    let dashdash = args.iter().position(|a| a == "--").unwrap();
    assert_eq!(args[dashdash - 1], "builder1");
    assert_eq!(&args[dashdash + 1..], &["env", "'GREETING=hello world'", "nix-store", "--serve", "--write"]);
}

#[yare::parameterized(
    plain = { "nix-store", "nix-store" },
    path = { "/nix/store/abc-foo.drv", "/nix/store/abc-foo.drv" },
    space = { "a b", "'a b'" },
    quote = { "it's", r"'it'\''s'" },
    empty = { "", "''" },
    dollar = { "$HOME", "'$HOME'" },
)]
fn shell_quote_cases(word: &str, expected: &str) {
    assert_eq!(shell_quote(word), expected);
}

#[test]
fn permission_denied_is_an_auth_failure() {
    let stderr = "Warning: Permanently added 'builder1' to known hosts.\nroot@builder1: Permission denied (publickey).\n";
    let err = classify_ssh_failure("builder1", stderr, Some(255));
    assert!(matches!(err, ConnectionError::AuthFailed { .. }));
    assert!(err.to_string().contains("Permission denied (publickey)"));
}

#[test]
fn other_failures_are_unreachable() {
    let err = classify_ssh_failure("builder1", "ssh: connect to host builder1 port 22: Connection refused\n", Some(255));
    assert!(matches!(err, ConnectionError::Unreachable { ref detail, .. } if detail.contains("Connection refused")));

    let err = classify_ssh_failure("builder1", "", Some(255));
    assert!(err.to_string().contains("ssh exited with status 255"));
}

#[test]
fn sanitize_keeps_socket_names_simple() {
    assert_eq!(sanitize("build-1.example.org"), "build-1.example.org");
    assert_eq!(sanitize("[::1]:22"), "___1__22");
}

#[tokio::test]
async fn localhost_runs_commands_directly() {
    let transport = SshTransport::new(SshConfig::default());
    let mut session = transport.open(&MachineDescriptor::new("localhost", "")).await.unwrap();
    assert!(session.is_open());

    let command = RemoteCommand::new("sh").args(vec!["-c".into(), "cat; echo oops >&2".into()]);
    let mut process = session.run_command(&command).await.unwrap();
    process.stdin.write_all(b"ping").await.unwrap();
    drop(process.stdin);

    let mut out = String::new();
    process.stdout.read_to_string(&mut out).await.unwrap();
    let mut err = String::new();
    process.stderr.read_to_string(&mut err).await.unwrap();
    assert_eq!(out, "ping");
    assert_eq!(err, "oops\n");
    assert_eq!(process.control.wait().await.unwrap(), Some(0));

    session.close().await.unwrap();
    session.close().await.unwrap();
    assert!(!session.is_open());
}

#[tokio::test]
async fn closed_session_refuses_commands() {
    let transport = SshTransport::new(SshConfig::default());
    let mut session = transport.open(&MachineDescriptor::new("localhost", "")).await.unwrap();
    session.close().await.unwrap();

    let err = session.run_command(&RemoteCommand::new("true")).await.err().unwrap();
    assert!(matches!(err, ConnectionError::Closed(ref m) if m == "localhost"));
}

#[tokio::test]
async fn missing_ssh_binary_is_a_spawn_error() {
    let dir = tempfile::tempdir().unwrap();
    let transport = SshTransport::new(
        SshConfig::default().program("/nonexistent/ssh").control_dir(dir.path()),
    );
    let err = transport.open(&machine()).await.err().unwrap();
    assert!(matches!(err, ConnectionError::Spawn { .. }));
}

/// Write an `ssh` stand-in. `master` runs for `ssh -M`, `exit` for
/// `ssh -O exit`; `-O check` succeeds once the socket file exists.
fn stub_ssh(dir: &Path, master: &str, exit: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let script = format!(
        r#"#!/bin/sh
sock=""
prev=""
for arg in "$@"; do
    if [ "$prev" = "-S" ]; then sock="$arg"; fi
    prev="$arg"
done
case " $* " in
    *" -O check "*) [ -e "$sock" ] ;;
    *" -O exit "*) {exit} ;;
    *" -M "*) {master} ;;
    *) exit 2 ;;
esac
"#
    );
    let path = dir.join("ssh");
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

const READY_MASTER: &str = r#"touch "$sock"; exec sleep 30"#;

struct Stub {
    _bin: tempfile::TempDir,
    control: tempfile::TempDir,
    transport: SshTransport,
}

impl Stub {
    fn new(master: &str, exit: &str, configure: impl FnOnce(SshConfig) -> SshConfig) -> Self {
        let bin = tempfile::tempdir().unwrap();
        let control = tempfile::tempdir().unwrap();
        let program = stub_ssh(bin.path(), master, exit);
        let config = configure(
            SshConfig::default().program(program.display().to_string()).control_dir(control.path()),
        );
        Self { _bin: bin, control, transport: SshTransport::new(config) }
    }

    fn sockets(&self) -> usize {
        std::fs::read_dir(self.control.path()).unwrap().count()
    }
}

#[tokio::test]
#[serial_test::serial(ssh_stub)]
async fn master_session_opens_and_closes_twice() {
    let stub = Stub::new(READY_MASTER, r#"rm -f "$sock""#, |c| c);

    for _ in 0..2 {
        let mut session = stub.transport.open(&machine()).await.unwrap();
        assert!(session.is_open());
        assert_eq!(session.machine(), "root@builder1");
        assert_eq!(stub.sockets(), 1);

        session.close().await.unwrap();
        session.close().await.unwrap();
        assert!(!session.is_open());
        assert_eq!(stub.sockets(), 0);
    }
}

#[tokio::test]
#[serial_test::serial(ssh_stub)]
async fn close_removes_the_socket_left_by_the_master() {
    // -O exit reports success but leaves the socket file behind
    let stub = Stub::new(READY_MASTER, "exit 0", |c| c);

    let mut session = stub.transport.open(&machine()).await.unwrap();
    session.close().await.unwrap();

    assert_eq!(stub.sockets(), 0);
}

#[tokio::test]
#[serial_test::serial(ssh_stub)]
async fn wedged_exit_does_not_block_close() {
    let stub = Stub::new(READY_MASTER, "exec sleep 30", |c| c.exit_timeout(Duration::from_millis(200)));

    let mut session = stub.transport.open(&machine()).await.unwrap();
    let closed = tokio::time::timeout(Duration::from_secs(10), session.close()).await;

    assert!(closed.is_ok(), "close blocked on ssh -O exit");
    assert!(!session.is_open());
    assert_eq!(stub.sockets(), 0);
}

#[tokio::test]
#[serial_test::serial(ssh_stub)]
async fn refused_key_is_an_auth_failure() {
    let master = r#"echo "root@builder1: Permission denied (publickey)." >&2; exit 255"#;
    let stub = Stub::new(master, "exit 0", |c| c);

    let err = stub.transport.open(&machine()).await.err().unwrap();

    assert!(matches!(err, ConnectionError::AuthFailed { ref detail, .. } if detail.contains("publickey")));
    assert_eq!(stub.sockets(), 0);
}

#[tokio::test]
#[serial_test::serial(ssh_stub)]
async fn master_that_never_authenticates_is_unreachable() {
    let stub = Stub::new("exec sleep 30", "exit 0", |c| c.connect_timeout(Duration::from_millis(300)));

    let started = Instant::now();
    let err = stub.transport.open(&machine()).await.err().unwrap();

    assert!(matches!(err, ConnectionError::Unreachable { ref detail, .. } if detail.starts_with("no connection after")));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(stub.sockets(), 0);
}

#[tokio::test]
#[serial_test::serial(ssh_stub)]
async fn dropped_session_removes_its_socket() {
    let stub = Stub::new(READY_MASTER, "exit 0", |c| c);

    let session = stub.transport.open(&machine()).await.unwrap();
    assert_eq!(stub.sockets(), 1);
    drop(session);

    assert_eq!(stub.sockets(), 0);
}
