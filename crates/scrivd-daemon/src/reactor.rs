//! The reactor: one dedicated thread multiplexing every periodic task and
//! all socket I/O for the control plane.
//!
//! Each tick computes, for every periodic task, `remaining = interval −
//! (now − last_fire)`. A task within half the minimum interval of its
//! deadline is "close enough" and fires; the tolerance avoids
//! busy-spinning on clock jitter; drift is bounded to one tolerance
//! window per cycle rather than corrected against a fixed origin. The
//! blocking wait handed to the socket poll is the minimum of all
//! remaining times, capped to the interval bounds, so one wait primitive
//! serves N periodic tasks plus all socket readiness without per-task
//! threads.
//!
//! Cooperative scheduling, no preemption: a slow task body delays every
//! other timer and all socket responsiveness for that tick. That is the
//! accepted price for eliminating internal locking: shared state is
//! `Rc<RefCell<Admin>>` on this thread, and the only inter-thread path is
//! the callback queue drained here.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use scrivd_core::broker::DocumentBroker;
use scrivd_core::config::AdminConfig;
use scrivd_core::process::ProcessControl;
use scrivd_core::procinfo;
use tokio::net::UnixListener;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::LocalSet;
use tracing::{debug, error, info, trace, warn};

use crate::monitor::{self, MonitorChannel};
use crate::protocol::{self, ConsoleNotifier};
use crate::shutdown;
use crate::state::{Admin, AdminCallback, AdminHandle};

/// Lower bound for sampling intervals and the poll wait, ms.
pub const MIN_STATS_INTERVAL_MS: u64 = 50;

/// Upper bound for sampling intervals and the poll wait, ms.
pub const MAX_STATS_INTERVAL_MS: u64 = 100_000;

/// Clamp an interval to `[MIN_STATS_INTERVAL_MS, MAX_STATS_INTERVAL_MS]`.
#[must_use]
pub const fn clamp_interval(interval_ms: u64) -> u64 {
    if interval_ms < MIN_STATS_INTERVAL_MS {
        MIN_STATS_INTERVAL_MS
    } else if interval_ms > MAX_STATS_INTERVAL_MS {
        MAX_STATS_INTERVAL_MS
    } else {
        interval_ms
    }
}

/// Milliseconds until a periodic task is next due; negative when overdue.
fn remaining_ms(interval_ms: u64, last_fire: Instant, now: Instant) -> i64 {
    interval_ms as i64 - now.duration_since(last_fire).as_millis() as i64
}

/// The "close enough" tolerance: fire when within half the minimum
/// interval of the deadline.
const fn due(remaining: i64) -> bool {
    remaining <= (MIN_STATS_INTERVAL_MS / 2) as i64
}

/// Factory for the broker capability, run on the reactor thread so the
/// resulting `Rc` never crosses threads.
pub type BrokerFactory = Box<dyn FnOnce() -> Rc<dyn DocumentBroker> + Send>;

/// Factory for the process-control capability.
pub type ControlFactory = Box<dyn FnOnce() -> Rc<dyn ProcessControl> + Send>;

/// Spawn the reactor on its dedicated thread.
///
/// Returns the cross-thread handle and the join handle; the thread runs
/// until shutdown is requested and the migration coordinator has
/// finished.
pub fn spawn(
    config: AdminConfig,
    broker_factory: BrokerFactory,
    control_factory: ControlFactory,
) -> std::io::Result<(AdminHandle, std::thread::JoinHandle<()>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = AdminHandle::new(tx);

    let thread = std::thread::Builder::new()
        .name("scrivd-admin".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!(error = %e, "failed to build reactor runtime");
                    return;
                },
            };
            let local = LocalSet::new();
            local.block_on(&runtime, run(config, rx, broker_factory(), control_factory()));
        })?;

    Ok((handle, thread))
}

/// Bind the console listener, clearing any stale socket file first.
fn bind_console(config: &AdminConfig) -> std::io::Result<UnixListener> {
    let path = &config.server.console_socket;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    info!(socket = %path.display(), "admin console listening");
    Ok(listener)
}

/// The reactor main loop; runs on the dedicated thread's local set.
async fn run(
    config: AdminConfig,
    mut rx: UnboundedReceiver<AdminCallback>,
    broker: Rc<dyn DocumentBroker>,
    control: Rc<dyn ProcessControl>,
) {
    let mut admin = Admin::new(&config, broker, control);

    // Prime the memory history so the console is never empty.
    let used = admin.total_memory_usage_kb();
    admin.registry.add_mem_stats(used);

    let server_id = admin.broker.server_id();
    admin.monitors.start_all(&server_id, Instant::now());

    let admin_rc = Rc::new(RefCell::new(admin));

    let listener = match bind_console(&config) {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "failed to bind admin console socket");
            return;
        },
    };

    let start = Instant::now();
    let mut last_cpu = start;
    let mut last_mem = start;
    let mut last_net = start;
    let mut last_cleanup = start;

    loop {
        // Drain deferred mutations FIFO before computing deadlines.
        while let Ok(callback) = rx.try_recv() {
            callback(&mut admin_rc.borrow_mut());
        }

        {
            let admin = admin_rc.borrow();
            if admin.shutdown_requested || admin.broker.shutdown_requested() {
                break;
            }
        }

        let now = Instant::now();
        let (cpu_interval, mem_interval, net_interval, cleanup_enabled, cleanup_interval) = {
            let admin = admin_rc.borrow();
            (
                admin.cpu_stats_interval(),
                admin.mem_stats_interval(),
                admin.net_stats_interval(),
                admin.cleanup.enable,
                admin.cleanup.interval_ms,
            )
        };

        let mut cpu_wait = remaining_ms(cpu_interval, last_cpu, now);
        if due(cpu_wait) {
            sample_cpu(&mut admin_rc.borrow_mut());
            cpu_wait += cpu_interval as i64;
            last_cpu = now;
        }

        let mut mem_wait = remaining_ms(mem_interval, last_mem, now);
        if due(mem_wait) {
            sample_mem(&mut admin_rc.borrow_mut());
            mem_wait += mem_interval as i64;
            last_mem = now;
        }

        let mut net_wait = remaining_ms(net_interval, last_net, now);
        if due(net_wait) {
            sample_net(&mut admin_rc.borrow_mut());
            net_wait += net_interval as i64;
            last_net = now;
        }

        let mut cleanup_wait = cleanup_interval as i64;
        if cleanup_enabled {
            cleanup_wait = remaining_ms(cleanup_interval, last_cleanup, now);
            if due(cleanup_wait) {
                cleanup_pass(&mut admin_rc.borrow_mut());
                cleanup_wait += cleanup_interval as i64;
                last_cleanup = now;
            }
        }

        // (Re-)connect to at most one monitor per tick, synchronously.
        process_pending_connect(&admin_rc, now);

        let wait_ms = clamp_interval(
            cpu_wait
                .min(mem_wait)
                .min(net_wait)
                .min(cleanup_wait)
                .max(0) as u64,
        );
        trace!(wait_ms, "admin poll");

        let wake = admin_rc.borrow().wake_handle();
        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(wait_ms)) => {},
            // Inline dispatch (console commands run as local tasks during
            // this await) signals here so interval changes and shutdown
            // are observed promptly.
            () = wake.notified() => {},
            maybe_callback = rx.recv() => {
                match maybe_callback {
                    // A posted callback is also the wake signal, so an
                    // interval change is observed promptly.
                    Some(callback) => callback(&mut admin_rc.borrow_mut()),
                    None => {
                        debug!("callback queue closed, shutting down reactor");
                        admin_rc.borrow_mut().shutdown_requested = true;
                    },
                }
            },
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        tokio::task::spawn_local(protocol::serve_connection(
                            admin_rc.clone(),
                            stream,
                            "unix-local".to_string(),
                        ));
                    },
                    Err(e) => warn!(error = %e, "console accept failed"),
                }
            },
        }
    }

    shutdown::run_migration_wait(&admin_rc, &mut rx).await;
    info!("admin reactor stopped");
}

/// CPU sample: jiffies delta converted to percent over the interval.
fn sample_cpu(admin: &mut Admin) {
    let delta = admin.total_cpu_jiffies_delta();
    let interval_ms = admin.cpu_stats_interval();
    let ticks = procinfo::clock_ticks_per_sec();
    let denominator = ticks * interval_ms;
    let percent = if denominator == 0 {
        0
    } else {
        100 * 1000 * delta / denominator
    };
    admin.registry.add_cpu_stats(percent);
}

/// Memory sample: refresh kit dirty pages, push the aggregate, and invoke
/// the governor exactly when the sample changed.
fn sample_mem(admin: &mut Admin) {
    for pid in admin.registry.document_pids() {
        let kb = procinfo::memory_dirty_kb(pid).unwrap_or(0);
        admin.registry.set_kit_memory(pid, kb);
    }

    let total = admin.total_memory_usage_kb();
    apply_mem_sample(admin, total);
}

/// The sample-dependent part of the memory tick, split out so the
/// changed-sample condition is testable with controlled totals.
pub(crate) fn apply_mem_sample(admin: &mut Admin, total: u64) {
    admin.registry.add_mem_stats(total);

    if total != admin.last_total_memory_kb {
        let docs = admin.registry.documents_sorted_by_idle();
        crate::governor::trigger_memory_cleanup(
            admin.budget.total_system_kb,
            admin.budget.configured_proportion_percent,
            total,
            &docs,
            &*admin.broker,
        );
        admin.last_total_memory_kb = total;
    }

    admin.registry.notify_docs_memory_changed();
}

/// Network sample: deltas of the aggregate byte counters plus the current
/// external connection count.
fn sample_net(admin: &mut Admin) {
    let sent = admin.registry.sent_bytes_total();
    let recv = admin.registry.recv_bytes_total();

    admin
        .registry
        .add_sent_stats(sent.saturating_sub(admin.last_sent_bytes));
    admin
        .registry
        .add_recv_stats(recv.saturating_sub(admin.last_recv_bytes));
    let connections = admin.external_connections;
    admin.registry.add_connection_stats(connections);

    if sent != admin.last_sent_bytes || recv != admin.last_recv_bytes {
        trace!(sent, recv, "total data transferred");
        admin.last_sent_bytes = sent;
        admin.last_recv_bytes = recv;
    }
}

/// Cleanup pass: resource-hog documents, then the lost-kit reaper.
fn cleanup_pass(admin: &mut Admin) {
    let limit_kb = admin.cleanup.limit_dirty_mem_mb * 1024;
    if limit_kb > 0 {
        for doc_key in admin.registry.resource_hog_docs(limit_kb) {
            warn!(doc_key = %doc_key, limit_kb, "closing resource-consuming document");
            admin.broker.close_document(&doc_key, "resource-exhausted");
        }
    }

    if admin.cleanup.lost_kit_grace_period_secs == 0 {
        return;
    }
    // Never reap when we are ourselves a kit; we might look lost.
    if admin.broker.is_kit_process() {
        return;
    }
    let Some(spawner_pid) = admin.broker.spawner_pid() else {
        return;
    };
    let tracked = admin.broker.kit_pids();
    let reaped = admin.reaper.scan(
        &tracked,
        spawner_pid,
        &*admin.process_control,
        Instant::now(),
    );
    if reaped > 0 {
        admin.registry.add_lost_kits_terminated(reaped);
    }
}

/// Examine the head of the pending-connect queue; pop and dial it when
/// due. Only the head is ever inspected per tick, which is safe because
/// the queue is kept sorted by due time.
fn process_pending_connect(admin_rc: &Rc<RefCell<Admin>>, now: Instant) {
    let pending = admin_rc.borrow_mut().monitors.take_due(now);
    let Some(pending) = pending else {
        return;
    };
    if admin_rc.borrow().monitors.has_channel(&pending.uri) {
        trace!(uri = %pending.uri, "monitor connection already exists");
        return;
    }
    connect_monitor_sync(admin_rc, pending.uri);
}

/// Dial one monitor endpoint. DNS resolution and the TCP handshake run
/// synchronously on the reactor thread: an explicit, accepted stall.
fn connect_monitor_sync(admin_rc: &Rc<RefCell<Admin>>, uri: String) {
    let Some(address) = monitor::dial_address(&uri) else {
        error!(uri = %uri, "unhandled monitor URI, expected \"tcp://host:port/path\"");
        return;
    };

    let stream = std::net::TcpStream::connect(address.as_str()).and_then(|stream| {
        stream.set_nonblocking(true)?;
        tokio::net::TcpStream::from_std(stream)
    });
    match stream {
        Ok(stream) => {
            let (tx, rx) = mpsc::unbounded_channel::<String>();
            {
                let mut admin = admin_rc.borrow_mut();
                let mut channel = MonitorChannel::connecting(uri.clone(), tx.clone());
                // The synchronous connect is the handshake: the channel
                // transitions connecting -> writable before registration.
                channel.mark_writable();
                admin.monitors.register(channel);
                admin.external_connections += 1;
            }
            tokio::task::spawn_local(run_monitor_connection(
                admin_rc.clone(),
                stream,
                uri,
                tx,
                rx,
            ));
        },
        Err(e) => {
            error!(uri = %uri, error = %e, "monitor connect failed");
            admin_rc
                .borrow_mut()
                .monitors
                .on_disconnect(&uri, Instant::now());
        },
    }
}

/// Serve one outbound monitor connection. Monitor sessions are born
/// authenticated and dispatch through the same console grammar.
async fn run_monitor_connection(
    admin_rc: Rc<RefCell<Admin>>,
    stream: tokio::net::TcpStream,
    uri: String,
    tx: mpsc::UnboundedSender<String>,
    rx: UnboundedReceiver<String>,
) {
    let (read_half, write_half) = stream.into_split();
    let writer = tokio::task::spawn_local(protocol::write_frames(write_half, rx));

    let session_id = {
        let mut admin = admin_rc.borrow_mut();
        let id = admin.next_session_id();
        admin
            .registry
            .add_subscriber(id, Box::new(ConsoleNotifier::new(tx.clone())));
        id
    };
    let mut session = protocol::AdminSession::new_authenticated(session_id, uri.clone(), tx);

    protocol::read_loop(&admin_rc, &mut session, read_half).await;

    {
        let mut admin = admin_rc.borrow_mut();
        admin.registry.remove_subscriber(session_id);
        admin.external_connections = admin.external_connections.saturating_sub(1);
        admin.monitors.on_disconnect(&uri, Instant::now());
    }
    // All senders are gone once the session drops; let the writer drain.
    drop(session);
    let _ = writer.await;
}
