//! The admin console protocol.
//!
//! Per connection, a two-state machine: `Unauthenticated → Authenticated`,
//! both non-terminal until the connection closes. Authentication is
//! monotonic; nothing reverts it. Protocol violations reply with a fixed
//! error token, terminate the connection and discard all further input;
//! they never crash the process.
//!
//! Frames are newline-delimited text lines; the first line is
//! space-tokenized and the first token dispatches through the closed
//! [`commands::AdminCommand`] grammar. Unrecognized commands are dropped
//! silently.

pub mod auth;
pub mod commands;
pub mod error;

use std::cell::RefCell;
use std::rc::Rc;

use scrivd_core::model::Notifier;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, trace, warn};

use self::commands::{AdminCommand, QueryKind};
use self::error::MAX_LINE_LEN;
use crate::state::Admin;

/// Fixed error token for authentication failures.
pub const INVALID_AUTH_TOKEN: &str = "InvalidAuthToken";

/// Fixed error token for commands before authentication.
pub const NOT_AUTHENTICATED: &str = "NotAuthenticated";

/// What the connection loop should do after a line was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep reading.
    Continue,
    /// Close the connection and discard further input.
    Terminate,
}

/// One console (or monitor) session.
pub struct AdminSession {
    /// Monotonic session id, shared with the registry subscriber table.
    pub id: u64,
    /// One-way authentication flag; never reset.
    pub authenticated: bool,
    /// Peer address, for audit logging.
    pub client_address: String,
    tx: UnboundedSender<String>,
}

impl AdminSession {
    /// A fresh unauthenticated session writing frames into `tx`.
    #[must_use]
    pub fn new(id: u64, client_address: String, tx: UnboundedSender<String>) -> Self {
        Self {
            id,
            authenticated: false,
            client_address,
            tx,
        }
    }

    /// A session born authenticated (outbound monitor channels).
    #[must_use]
    pub fn new_authenticated(id: u64, client_address: String, tx: UnboundedSender<String>) -> Self {
        Self {
            authenticated: true,
            ..Self::new(id, client_address, tx)
        }
    }

    /// Send a frame regardless of authentication state (error tokens).
    fn send_raw(&self, message: &str) {
        let _ = self.tx.send(message.to_string());
    }

    /// Send a text frame; withheld from non-authenticated peers.
    pub fn send(&self, message: &str) {
        if self.authenticated {
            trace!(session_id = self.id, message, "send admin text frame");
            self.send_raw(message);
        } else {
            trace!(
                session_id = self.id,
                "skip sending to non-authenticated client"
            );
        }
    }
}

/// Subscriber sink pushing registry notifications into a session writer.
pub struct ConsoleNotifier {
    tx: UnboundedSender<String>,
}

impl ConsoleNotifier {
    /// Wrap a session writer.
    #[must_use]
    pub fn new(tx: UnboundedSender<String>) -> Self {
        Self { tx }
    }
}

impl Notifier for ConsoleNotifier {
    fn notify(&self, message: &str) -> bool {
        self.tx.send(message.to_string()).is_ok()
    }
}

/// Handle one received line against the session state machine.
pub fn dispatch_line(admin: &mut Admin, session: &mut AdminSession, line: &str) -> Disposition {
    let Some(command) = AdminCommand::parse(line) else {
        if session.authenticated {
            // Unrecognized commands are dropped without feedback.
            trace!(session_id = session.id, "dropping unrecognized command");
            return Disposition::Continue;
        }
        session.send_raw(NOT_AUTHENTICATED);
        return Disposition::Terminate;
    };

    if let AdminCommand::Auth { token } = &command {
        let verified = token
            .as_deref()
            .is_some_and(|t| admin.verifier.verify_encoded(t));
        if verified {
            info!(
                session_id = session.id,
                client = %session.client_address,
                "admin session authenticated"
            );
            session.authenticated = true;
            return Disposition::Continue;
        }
        debug!(session_id = session.id, "invalid auth token");
        session.send_raw(INVALID_AUTH_TOKEN);
        return Disposition::Terminate;
    }

    if !session.authenticated {
        debug!(
            session_id = session.id,
            line, "command before authentication"
        );
        session.send_raw(NOT_AUTHENTICATED);
        return Disposition::Terminate;
    }

    dispatch_authenticated(admin, session, command);
    Disposition::Continue
}

fn dispatch_authenticated(admin: &mut Admin, session: &AdminSession, command: AdminCommand) {
    match command {
        // Handled by the state machine above.
        AdminCommand::Auth { .. } => {},

        AdminCommand::Query(kind) => handle_query(admin, session, kind),

        AdminCommand::History => {
            session.send(&format!("{{ \"History\": {}}}", admin.registry.history_json()));
        },

        AdminCommand::Version => {
            let version = serde_json::json!({
                "Version": env!("CARGO_PKG_VERSION"),
                "Protocol": "1.0",
            });
            session.send(&format!("scrivdversion {version}"));
            session.send(&format!("kitversion {}", admin.broker.engine_version()));
        },

        AdminCommand::Subscribe(channels) => {
            for channel in channels {
                admin.registry.subscribe(session.id, &channel);
            }
        },

        AdminCommand::Unsubscribe(channels) => {
            for channel in channels {
                admin.registry.unsubscribe(session.id, &channel);
            }
        },

        AdminCommand::MemConsumed => {
            session.send(&format!("mem_consumed {}", admin.total_memory_usage_kb()));
        },

        AdminCommand::TotalAvailMem => {
            session.send(&format!("total_avail_mem {}", admin.budget.available_kb()));
        },

        AdminCommand::SentBytes => {
            session.send(&format!(
                "sent_bytes {}",
                admin.registry.sent_bytes_total() / 1024
            ));
        },

        AdminCommand::RecvBytes => {
            session.send(&format!(
                "recv_bytes {}",
                admin.registry.recv_bytes_total() / 1024
            ));
        },

        AdminCommand::Uptime => {
            session.send(&format!("uptime {}", admin.registry.uptime_secs()));
        },

        AdminCommand::LogLines => {
            session.send(&format!("log_lines {}", admin.log_lines()));
        },

        AdminCommand::Kill { pid } => handle_kill(admin, session, &pid),

        AdminCommand::Settings => session.send(&settings_dump(admin)),

        AdminCommand::ChannelList => {
            session.send(&format!("channel_list {}", admin.channel_log_levels()));
        },

        AdminCommand::Shutdown => admin.request_shutdown(),

        AdminCommand::Set(pairs) => handle_set(admin, pairs),

        AdminCommand::UpdateLogLevels(pairs) => {
            for (channel, level) in pairs {
                let channel = if channel == "?" { "" } else { channel.as_str() };
                admin.set_channel_log_level(channel, &level);
            }
            // Echo the resulting levels so the caller can be sure.
            session.send(&format!("channel_list {}", admin.channel_log_levels()));
        },

        AdminCommand::UpdateRouteToken { json } => handle_update_route_token(admin, &json),

        AdminCommand::Migrate {
            status,
            doc_key,
            route_token,
            server_id,
        } => handle_migrate(admin, &status, &doc_key, &route_token, &server_id),

        AdminCommand::WopiSrcMap => {
            session.send(&format!("wopiSrcMap {}", admin.registry.wopi_src_map_json()));
        },

        AdminCommand::VerifyAuth { token, id } => {
            // Stateless: never touches this session's own auth state.
            let valid = token
                .as_deref()
                .is_some_and(|t| admin.verifier.verify_encoded(t));
            if valid {
                session.send(&format!("ValidAuthToken {id}"));
            } else {
                session.send(&format!("{INVALID_AUTH_TOKEN} {id}"));
            }
        },

        AdminCommand::CloseMonitor => {
            admin.close_monitor = true;
        },
    }
}

fn handle_query(admin: &mut Admin, session: &AdminSession, kind: QueryKind) {
    let name = kind.name();
    if let Some(result) = admin.registry.query(name) {
        if !result.is_empty() {
            session.send(&format!("{name} {result}"));
        }
    }
}

fn handle_kill(admin: &mut Admin, session: &AdminSession, pid_text: &str) {
    let Ok(pid) = pid_text.parse::<i32>() else {
        error!(pid = pid_text, "invalid PID to kill");
        return;
    };
    if admin.registry.document_pids().contains(&pid) {
        info!(
            pid,
            filename = admin.registry.filename_for_pid(pid).unwrap_or(""),
            client = %session.client_address,
            "admin request to kill document kit"
        );
        if let Err(e) = admin.process_control.terminate(pid) {
            error!(pid, error = %e, "failed to kill document kit");
        }
    } else {
        error!(pid, "invalid PID to kill (not a document pid)");
    }
}

fn settings_dump(admin: &Admin) -> String {
    format!(
        "settings mem_stats_size={} mem_stats_interval={} cpu_stats_size={} \
         cpu_stats_interval={} net_stats_size={} net_stats_interval={} \
         connection_stats_size={} global_host_tcp_connections={} \
         limit_virt_mem_mb={} limit_stack_mem_kb={} limit_file_size_mb={} \
         limit_num_open_files={}",
        admin.registry.query("mem_stats_size").unwrap_or_default(),
        admin.mem_stats_interval(),
        admin.registry.query("cpu_stats_size").unwrap_or_default(),
        admin.cpu_stats_interval(),
        admin.registry.query("net_stats_size").unwrap_or_default(),
        admin.net_stats_interval(),
        admin
            .registry
            .query("connection_stats_size")
            .unwrap_or_default(),
        admin.server.max_connections,
        admin.limits.limit_virt_mem_mb,
        admin.limits.limit_stack_mem_kb,
        admin.limits.limit_file_size_mb,
        admin.limits.limit_num_open_files,
    )
}

fn handle_set(admin: &mut Admin, pairs: Vec<(String, String)>) {
    for (key, value) in pairs {
        // A malformed value skips this single pair; the rest still apply.
        let Ok(parsed) = value.parse::<u64>() else {
            error!(key, value, "invalid setting value");
            continue;
        };
        match key.as_str() {
            "mem_stats_size" => admin.registry.set_mem_stats_size(parsed as usize),
            "cpu_stats_size" => admin.registry.set_cpu_stats_size(parsed as usize),
            "mem_stats_interval" => {
                if parsed != admin.mem_stats_interval() {
                    admin.reschedule_mem_timer(parsed);
                    admin.registry.clear_mem_stats();
                    let applied = admin.mem_stats_interval();
                    admin
                        .registry
                        .notify(&format!("settings mem_stats_interval={applied}"));
                }
            },
            "cpu_stats_interval" => {
                if parsed != admin.cpu_stats_interval() {
                    admin.reschedule_cpu_timer(parsed);
                    admin.registry.clear_cpu_stats();
                    let applied = admin.cpu_stats_interval();
                    admin
                        .registry
                        .notify(&format!("settings cpu_stats_interval={applied}"));
                }
            },
            _ if key.starts_with("limit_") => {
                match key.as_str() {
                    "limit_virt_mem_mb" => admin.limits.limit_virt_mem_mb = parsed,
                    "limit_stack_mem_kb" => admin.limits.limit_stack_mem_kb = parsed,
                    "limit_file_size_mb" => admin.limits.limit_file_size_mb = parsed,
                    "limit_num_open_files" => admin.limits.limit_num_open_files = parsed,
                    _ => {
                        error!(key, "unknown limit");
                        continue;
                    },
                }
                admin.registry.notify(&format!("settings {key}={parsed}"));
                admin.broker.forward_kit_limits(&admin.limits);
            },
            _ => debug!(key, "ignoring unknown setting"),
        }
    }
}

fn handle_update_route_token(admin: &mut Admin, json: &str) {
    let Ok(map) = serde_json::from_str::<serde_json::Value>(json) else {
        error!(json, "failed to update the route token, invalid JSON");
        return;
    };
    let server_id = admin.broker.server_id();
    let token = map
        .get(&server_id)
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    if token.is_empty() {
        error!(
            json,
            server_id, "failed to update the route token, no entry for this server"
        );
        return;
    }
    admin
        .broker
        .alert_all_users(&format!("updateroutetoken {token}"));
    admin.broker.set_route_token(token);
}

fn handle_migrate(
    admin: &mut Admin,
    status: &str,
    doc_key: &str,
    route_token: &str,
    server_id: &str,
) {
    if doc_key.is_empty() || route_token.is_empty() || server_id.is_empty() {
        warn!(doc_key, "document migration failed, incomplete request");
        return;
    }
    admin
        .registry
        .set_migrating_info(doc_key, route_token, server_id);

    let mut saved_field = None;
    if status == "unsaved" && !admin.registry.is_doc_saved(doc_key) {
        admin.broker.auto_save(doc_key);
        saved_field = Some(false);
    } else if (status == "readonly" && admin.registry.is_doc_read_only(doc_key))
        || (status == "saved" && admin.registry.is_doc_saved(doc_key))
    {
        saved_field = Some(true);
    }

    let mut payload = String::from("migrate: {\"afterSave\":false,");
    if let Some(saved) = saved_field {
        payload.push_str(&format!("\"saved\":{saved},"));
    }
    payload.push_str(&format!(
        "\"routeToken\":\"{route_token}\",\"serverId\":\"{server_id}\"}}"
    ));
    admin.broker.alert_user(doc_key, &payload);

    if admin.broker.shutdown_requested() {
        admin.broker.set_migration_acknowledged(doc_key);
    }
}

/// Serve one inbound console connection on the reactor's local set.
///
/// The writer half is owned by a local task fed from an unbounded
/// channel; the same sender backs the session's registry subscription.
pub async fn serve_connection(admin_rc: Rc<RefCell<Admin>>, stream: UnixStream, peer: String) {
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel::<String>();

    let session_id = {
        let mut admin = admin_rc.borrow_mut();
        let id = admin.next_session_id();
        admin
            .registry
            .add_subscriber(id, Box::new(ConsoleNotifier::new(tx.clone())));
        admin.external_connections += 1;
        id
    };
    debug!(session_id, peer = %peer, "admin console connected");

    let writer = tokio::task::spawn_local(write_frames(write_half, rx));
    let mut session = AdminSession::new(session_id, peer, tx);

    read_loop(&admin_rc, &mut session, read_half).await;

    {
        let mut admin = admin_rc.borrow_mut();
        admin.registry.remove_subscriber(session_id);
        admin.external_connections = admin.external_connections.saturating_sub(1);
    }
    debug!(session_id, "admin console disconnected");
    // Dropping the session releases the last sender; the writer drains
    // whatever is queued (error tokens included) and exits.
    drop(session);
    let _ = writer.await;
}

/// Writer task: drains queued frames onto the connection, one per line.
pub async fn write_frames<W>(mut writer: W, mut rx: UnboundedReceiver<String>)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        if writer.write_all(message.as_bytes()).await.is_err() {
            break;
        }
        if writer.write_all(b"\n").await.is_err() {
            break;
        }
    }
}

/// Read loop shared by console and monitor connections: lines in,
/// dispatch on the reactor thread, stop on termination or EOF.
pub(crate) async fn read_loop<R>(
    admin_rc: &Rc<RefCell<Admin>>,
    session: &mut AdminSession,
    read_half: R,
)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if line.len() > MAX_LINE_LEN {
                    let err = error::ProtocolError::LineTooLong {
                        len: line.len(),
                        max: MAX_LINE_LEN,
                    };
                    warn!(session_id = session.id, error = %err, "closing connection");
                    break;
                }
                let trimmed = line.trim_end_matches(['\r', '\n']);
                if trimmed.is_empty() {
                    continue;
                }
                let disposition = {
                    let mut admin = admin_rc.borrow_mut();
                    dispatch_line(&mut admin, session, trimmed)
                };
                if disposition == Disposition::Terminate {
                    break;
                }
            },
            Err(e) => {
                debug!(session_id = session.id, error = %e, "console read error");
                break;
            },
        }
    }
}
