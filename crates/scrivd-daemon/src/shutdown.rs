//! Shutdown migration coordinator.
//!
//! When a migration-capable (indirection) deployment shuts down, the
//! reactor gives an external controller a bounded chance to migrate
//! in-flight documents before the process exits. Acknowledgement is
//! advisory: it can speed shutdown up, it can never block it forever.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, warn};

use crate::state::{Admin, AdminCallback};

/// Poll slice while waiting for the acknowledgement.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Block (bounded) until the controller acknowledges migration.
///
/// - Indirection disabled: returns immediately.
/// - No live controller channel: every document is marked acknowledged
///   and shutdown proceeds without blocking.
/// - Otherwise: the shutdown notice goes out and the reactor keeps
///   servicing socket input and callbacks until `closemonitor` arrives or
///   the configured timeout elapses. Either way the documents end up
///   acknowledged; a timeout is logged and treated as acknowledgement.
pub async fn run_migration_wait(
    admin_rc: &Rc<RefCell<Admin>>,
    rx: &mut UnboundedReceiver<AdminCallback>,
) {
    let (enabled, timeout) = {
        let admin = admin_rc.borrow();
        (
            admin.indirection.enable,
            Duration::from_secs(admin.indirection.migration_timeout_secs),
        )
    };
    if !enabled {
        return;
    }

    if !admin_rc.borrow().monitors.has_controller_connection() {
        warn!("no controller monitor connection, skipping shutdown migration");
        admin_rc.borrow().broker.set_all_migration_acknowledged();
        return;
    }

    admin_rc.borrow_mut().monitors.broadcast("shutdownreceived");

    let deadline = Instant::now() + timeout;
    loop {
        if admin_rc.borrow().close_monitor {
            debug!("migration acknowledged by controller");
            break;
        }
        let now = Instant::now();
        if now >= deadline {
            warn!(
                timeout_secs = timeout.as_secs(),
                "timed out waiting for the migration controller to respond"
            );
            break;
        }
        let slice = POLL_INTERVAL.min(deadline - now);
        tokio::select! {
            () = tokio::time::sleep(slice) => {},
            maybe_callback = rx.recv() => {
                if let Some(callback) = maybe_callback {
                    callback(&mut admin_rc.borrow_mut());
                }
            },
        }
    }

    admin_rc.borrow().broker.set_all_migration_acknowledged();
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;

    use scrivd_core::broker::DocumentBroker;
    use scrivd_core::config::{AdminConfig, KitLimits};
    use scrivd_core::process::{ProcessControl, ProcessResult};
    use tokio::sync::mpsc::unbounded_channel;

    use super::*;
    use crate::monitor::MonitorChannel;

    #[derive(Default)]
    struct AckBroker {
        all_acked: AtomicU64,
        shutdown: AtomicBool,
    }

    impl DocumentBroker for AckBroker {
        fn close_document(&self, _doc_key: &str, _reason: &str) {}
        fn auto_save(&self, _doc_key: &str) {}
        fn alert_user(&self, _doc_key: &str, _message: &str) {}
        fn alert_all_users(&self, _message: &str) {}
        fn kit_pids(&self) -> HashSet<i32> {
            HashSet::new()
        }
        fn spawner_pid(&self) -> Option<i32> {
            None
        }
        fn is_kit_process(&self) -> bool {
            false
        }
        fn engine_version(&self) -> String {
            String::new()
        }
        fn server_id(&self) -> String {
            "srv1".to_string()
        }
        fn set_route_token(&self, _token: &str) {}
        fn forward_kit_log_level(&self, _level: &str) {}
        fn forward_kit_limits(&self, _limits: &KitLimits) {}
        fn set_migration_acknowledged(&self, _doc_key: &str) {}
        fn set_all_migration_acknowledged(&self) {
            self.all_acked.fetch_add(1, Ordering::SeqCst);
        }
        fn request_shutdown(&self) {
            self.shutdown.store(true, Ordering::SeqCst);
        }
        fn shutdown_requested(&self) -> bool {
            self.shutdown.load(Ordering::SeqCst)
        }
    }

    struct NoopProcesses;

    impl ProcessControl for NoopProcesses {
        fn is_alive(&self, _pid: i32) -> bool {
            false
        }
        fn terminate(&self, _pid: i32) -> ProcessResult<()> {
            Ok(())
        }
        fn pids_with_parent(&self, _parent: i32) -> Vec<i32> {
            Vec::new()
        }
    }

    fn admin_with(broker: Arc<AckBroker>, enable: bool, timeout_secs: u64) -> Admin {
        let mut config = AdminConfig::default();
        config.indirection.enable = enable;
        config.indirection.migration_timeout_secs = timeout_secs;
        Admin::new(&config, Rc::new(broker), Rc::new(NoopProcesses))
    }

    fn controller_channel() -> (MonitorChannel, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = unbounded_channel();
        (
            MonitorChannel::connecting("tcp://controller.example:1/feed?ServerId=x".to_string(), tx),
            rx,
        )
    }

    #[tokio::test]
    async fn disabled_indirection_returns_without_acking() {
        let broker = Arc::new(AckBroker::default());
        let admin = admin_with(broker.clone(), false, 180);
        let admin_rc = Rc::new(RefCell::new(admin));
        let (_tx, mut rx) = unbounded_channel();

        run_migration_wait(&admin_rc, &mut rx).await;
        assert_eq!(broker.all_acked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn no_controller_acks_immediately() {
        let broker = Arc::new(AckBroker::default());
        let admin = admin_with(broker.clone(), true, 180);
        let admin_rc = Rc::new(RefCell::new(admin));
        let (_tx, mut rx) = unbounded_channel();

        let start = Instant::now();
        run_migration_wait(&admin_rc, &mut rx).await;
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(broker.all_acked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn acknowledgement_stops_the_wait() {
        let broker = Arc::new(AckBroker::default());
        let mut admin = admin_with(broker.clone(), true, 180);
        let (mut channel, mut feed_rx) = controller_channel();
        channel.mark_writable();
        admin.monitors.register(channel);
        let admin_rc = Rc::new(RefCell::new(admin));
        let (_tx, mut rx) = unbounded_channel();

        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let flipper = {
                    let admin_rc = admin_rc.clone();
                    tokio::task::spawn_local(async move {
                        tokio::time::sleep(Duration::from_millis(150)).await;
                        admin_rc.borrow_mut().close_monitor = true;
                    })
                };
                let start = Instant::now();
                run_migration_wait(&admin_rc, &mut rx).await;
                assert!(start.elapsed() < Duration::from_secs(5));
                flipper.await.unwrap();
            })
            .await;

        assert_eq!(broker.all_acked.load(Ordering::SeqCst), 1);
        // The shutdown notice went out to the controller channel.
        assert_eq!(feed_rx.try_recv().unwrap(), "shutdownreceived");
    }

    #[tokio::test]
    async fn timeout_proceeds_and_acks_by_default() {
        let broker = Arc::new(AckBroker::default());
        let mut admin = admin_with(broker.clone(), true, 0);
        let (mut channel, _feed_rx) = controller_channel();
        channel.mark_writable();
        admin.monitors.register(channel);
        let admin_rc = Rc::new(RefCell::new(admin));
        let (_tx, mut rx) = unbounded_channel();

        run_migration_wait(&admin_rc, &mut rx).await;
        assert_eq!(broker.all_acked.load(Ordering::SeqCst), 1);
    }
}
