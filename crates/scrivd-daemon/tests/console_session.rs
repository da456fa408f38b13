//! End-to-end console protocol tests over a real Unix socket.
//!
//! Each test spawns the reactor on its own thread with a socket in a
//! temp directory, connects as a console client, and drives the text
//! protocol exactly as an admin frontend would.

use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use scrivd_core::broker::{DocumentBroker, NullBroker};
use scrivd_core::config::AdminConfig;
use scrivd_core::process::{ProcessControl, SystemProcessControl};
use scrivd_daemon::protocol::auth::TokenVerifier;
use scrivd_daemon::reactor;
use scrivd_daemon::state::AdminHandle;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

const SECRET: &str = "integration-secret";

struct Daemon {
    // Keeps the socket directory alive for the daemon's lifetime.
    _dir: tempfile::TempDir,
    handle: AdminHandle,
    thread: std::thread::JoinHandle<()>,
    socket: PathBuf,
}

impl Daemon {
    fn start() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket = dir.path().join("admin.sock");
        let mut config = AdminConfig::default();
        config.server.console_socket.clone_from(&socket);
        config.admin.secret = SECRET.to_string();

        let (handle, thread) = reactor::spawn(
            config,
            Box::new(|| Rc::new(NullBroker) as Rc<dyn DocumentBroker>),
            Box::new(|| Rc::new(SystemProcessControl) as Rc<dyn ProcessControl>),
        )
        .expect("spawn reactor");

        for _ in 0..200 {
            if socket.exists() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(socket.exists(), "console socket never appeared");

        Self {
            _dir: dir,
            handle,
            thread,
            socket,
        }
    }

    fn stop(self) {
        self.handle.request_shutdown();
        self.thread.join().expect("reactor thread join");
    }
}

async fn connect(daemon: &Daemon) -> (tokio::net::unix::OwnedWriteHalf, tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>) {
    let stream = UnixStream::connect(&daemon.socket).await.expect("connect");
    let (read_half, write_half) = stream.into_split();
    (write_half, BufReader::new(read_half).lines())
}

async fn send(writer: &mut tokio::net::unix::OwnedWriteHalf, line: &str) {
    writer.write_all(line.as_bytes()).await.expect("write");
    writer.write_all(b"\n").await.expect("write newline");
}

async fn recv(
    lines: &mut tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>,
) -> Option<String> {
    tokio::time::timeout(Duration::from_secs(5), lines.next_line())
        .await
        .expect("read timed out")
        .expect("read failed")
}

fn admin_token() -> String {
    TokenVerifier::new(SECRET).issue(60)
}

#[tokio::test]
async fn authenticated_session_answers_queries() {
    let daemon = Daemon::start();
    let (mut writer, mut lines) = connect(&daemon).await;

    send(&mut writer, &format!("auth jwt={}", admin_token())).await;
    // Successful auth is silent; the next reply belongs to the query.
    send(&mut writer, "uptime").await;
    let reply = recv(&mut lines).await.expect("uptime reply");
    assert!(reply.starts_with("uptime "), "got: {reply}");

    send(&mut writer, "total_avail_mem").await;
    let reply = recv(&mut lines).await.expect("total_avail_mem reply");
    assert!(reply.starts_with("total_avail_mem "), "got: {reply}");

    send(&mut writer, "version").await;
    let first = recv(&mut lines).await.expect("version reply");
    assert!(first.starts_with("scrivdversion "), "got: {first}");
    let second = recv(&mut lines).await.expect("kitversion reply");
    assert!(second.starts_with("kitversion"), "got: {second}");

    send(&mut writer, "settings").await;
    let settings = recv(&mut lines).await.expect("settings reply");
    assert!(settings.contains("mem_stats_interval="), "got: {settings}");

    daemon.stop();
}

#[tokio::test]
async fn invalid_token_terminates_connection() {
    let daemon = Daemon::start();
    let (mut writer, mut lines) = connect(&daemon).await;

    send(&mut writer, "auth jwt=bogus").await;
    assert_eq!(recv(&mut lines).await.as_deref(), Some("InvalidAuthToken"));
    // The server closed the connection; further input is discarded.
    assert_eq!(recv(&mut lines).await, None);

    daemon.stop();
}

#[tokio::test]
async fn command_before_auth_is_rejected() {
    let daemon = Daemon::start();
    let (mut writer, mut lines) = connect(&daemon).await;

    send(&mut writer, "documents").await;
    assert_eq!(recv(&mut lines).await.as_deref(), Some("NotAuthenticated"));
    assert_eq!(recv(&mut lines).await, None);

    daemon.stop();
}

#[tokio::test]
async fn subscription_receives_pushed_samples() {
    let daemon = Daemon::start();
    let (mut writer, mut lines) = connect(&daemon).await;

    send(&mut writer, &format!("auth jwt={}", admin_token())).await;
    send(&mut writer, "subscribe mem_stats").await;
    // A replied query after the subscribe proves the subscription was
    // processed before the sample below is pushed.
    send(&mut writer, "uptime").await;
    let reply = recv(&mut lines).await.expect("uptime reply");
    assert!(reply.starts_with("uptime "), "got: {reply}");

    // Push a sample through the registry from "another thread", the way
    // collaborators do.
    daemon
        .handle
        .post(|admin| admin.registry.add_mem_stats(12_345));

    let reply = recv(&mut lines).await.expect("pushed sample");
    assert_eq!(reply, "mem_stats 12345");

    send(&mut writer, "unsubscribe mem_stats").await;
    daemon.stop();
}

#[tokio::test]
async fn console_shutdown_command_stops_the_reactor() {
    let daemon = Daemon::start();
    let (mut writer, mut lines) = connect(&daemon).await;

    send(&mut writer, &format!("auth jwt={}", admin_token())).await;
    send(&mut writer, "shutdown").await;

    // The reactor exits on its own; give it a moment, then join.
    let _ = recv(&mut lines).await;
    daemon.thread.join().expect("reactor stopped by console command");
}
