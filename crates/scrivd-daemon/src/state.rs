//! The admin context object and its cross-thread handle.
//!
//! One [`Admin`] exists per process, constructed on the reactor thread
//! and owned by it for the process lifetime (the original one-global-admin
//! pattern made explicit). Collaborators on other threads never touch it
//! directly: they post `FnOnce(&mut Admin)` closures through
//! [`AdminHandle`], which the reactor drains FIFO on its own turn. Posting
//! a callback doubles as the reactor wake signal.

use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

use scrivd_core::broker::DocumentBroker;
use scrivd_core::budget::MemoryBudget;
use scrivd_core::config::{AdminConfig, CleanupSection, IndirectionSection, KitLimits, ServerSection};
use scrivd_core::model::AdminRegistry;
use scrivd_core::process::ProcessControl;
use scrivd_core::procinfo;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::monitor::MonitorManager;
use crate::protocol::auth::TokenVerifier;
use crate::reactor::clamp_interval;
use crate::reaper::LostKitTracker;

/// Deferred mutation executed on the reactor thread.
pub type AdminCallback = Box<dyn FnOnce(&mut Admin) + Send>;

/// Runtime-tunable logging verbosity per channel.
///
/// The `srv` channel is this daemon's own subscriber filter, retuned
/// through an applier closure installed at startup; the `kit` channel is
/// remembered here and forwarded to the spawner.
pub struct LogLevels {
    channels: HashMap<String, String>,
    applier: Option<Box<dyn Fn(&str)>>,
}

impl LogLevels {
    /// The channel naming this daemon's own log filter.
    pub const DEFAULT_CHANNEL: &'static str = "srv";

    /// Start from the configured base level.
    #[must_use]
    pub fn new(base_level: &str) -> Self {
        let mut channels = HashMap::new();
        channels.insert(Self::DEFAULT_CHANNEL.to_string(), base_level.to_string());
        channels.insert("kit".to_string(), base_level.to_string());
        Self {
            channels,
            applier: None,
        }
    }

    /// Install the closure that retunes the live subscriber filter.
    pub fn set_applier(&mut self, applier: Box<dyn Fn(&str)>) {
        self.applier = Some(applier);
    }

    fn set(&mut self, channel: &str, level: &str) {
        self.channels
            .insert(channel.to_string(), level.to_string());
        if channel == Self::DEFAULT_CHANNEL {
            if let Some(applier) = &self.applier {
                applier(level);
            }
        }
    }

    fn dump(&self) -> String {
        let mut names: Vec<&String> = self.channels.keys().collect();
        names.sort();
        names
            .iter()
            .map(|name| format!("{name}={}", self.channels[*name]))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// The admin control-plane context: registry, budget, tunables, monitors
/// and collaborator capabilities. Reactor-thread-only.
pub struct Admin {
    /// The aggregate document/session registry.
    pub registry: AdminRegistry,
    /// The memory envelope computed at startup.
    pub budget: MemoryBudget,
    /// Seam to the document broker and kit machinery.
    pub broker: Rc<dyn DocumentBroker>,
    /// Seam to OS process control.
    pub process_control: Rc<dyn ProcessControl>,
    /// Admin bearer-token verifier.
    pub verifier: TokenVerifier,
    /// Current per-kit resource limits.
    pub limits: KitLimits,
    /// Cleanup task settings.
    pub cleanup: CleanupSection,
    /// Migration-capable deployment settings.
    pub indirection: IndirectionSection,
    /// Listener settings.
    pub server: ServerSection,
    /// Per-channel logging verbosity.
    pub log_levels: LogLevels,
    /// Outbound monitor channels.
    pub monitors: MonitorManager,
    /// Lost-kit candidates.
    pub reaper: LostKitTracker,
    /// Path of the log file served by `log_lines`, when logging to a file.
    pub log_file: Option<PathBuf>,
    /// External connection gauge (console + monitor channels).
    pub external_connections: u64,
    /// Aggregate memory observed by the previous sample, KB.
    pub last_total_memory_kb: u64,
    /// Sent-bytes counter observed by the previous net sample.
    pub last_sent_bytes: u64,
    /// Received-bytes counter observed by the previous net sample.
    pub last_recv_bytes: u64,
    /// Set by `closemonitor` during the migration handshake.
    pub close_monitor: bool,
    /// Set when an orderly shutdown has been requested.
    pub shutdown_requested: bool,
    cpu_interval_ms: u64,
    mem_interval_ms: u64,
    net_interval_ms: u64,
    last_jiffies: u64,
    next_session_id: u64,
    wake: Rc<tokio::sync::Notify>,
}

impl Admin {
    /// Build the context from configuration and collaborator capabilities.
    pub fn new(
        config: &AdminConfig,
        broker: Rc<dyn DocumentBroker>,
        process_control: Rc<dyn ProcessControl>,
    ) -> Self {
        let budget = MemoryBudget::from_system(config.memory.proportion_percent);
        let mut registry = AdminRegistry::new(config.stats.mem_stats_size);
        registry.set_thread_owner();
        registry.configure_sizes(
            config.stats.mem_stats_size,
            config.stats.cpu_stats_size,
            config.stats.net_stats_size,
            config.stats.connection_stats_size,
        );

        let admin = Self {
            registry,
            budget,
            broker,
            process_control,
            verifier: TokenVerifier::new(&config.admin.secret),
            limits: config.limits,
            cleanup: config.cleanup.clone(),
            indirection: config.indirection.clone(),
            server: config.server.clone(),
            log_levels: LogLevels::new("info"),
            monitors: MonitorManager::new(config.monitors.clone()),
            reaper: LostKitTracker::new(std::time::Duration::from_secs(
                config.cleanup.lost_kit_grace_period_secs,
            )),
            log_file: None,
            external_connections: 0,
            last_total_memory_kb: 0,
            last_sent_bytes: 0,
            last_recv_bytes: 0,
            close_monitor: false,
            shutdown_requested: false,
            cpu_interval_ms: clamp_interval(config.stats.cpu_interval_ms),
            mem_interval_ms: clamp_interval(config.stats.mem_interval_ms),
            net_interval_ms: clamp_interval(config.stats.net_interval_ms),
            last_jiffies: 0,
            next_session_id: 0,
            wake: Rc::new(tokio::sync::Notify::new()),
        };
        info!(
            cpu_interval_ms = admin.cpu_interval_ms,
            mem_interval_ms = admin.mem_interval_ms,
            net_interval_ms = admin.net_interval_ms,
            "admin context constructed"
        );
        admin
    }

    /// Allocate the next monotonic console session id.
    pub fn next_session_id(&mut self) -> u64 {
        self.next_session_id += 1;
        self.next_session_id
    }

    /// Current CPU sampling interval, ms.
    #[must_use]
    pub const fn cpu_stats_interval(&self) -> u64 {
        self.cpu_interval_ms
    }

    /// Current memory sampling interval, ms.
    #[must_use]
    pub const fn mem_stats_interval(&self) -> u64 {
        self.mem_interval_ms
    }

    /// Current network sampling interval, ms.
    #[must_use]
    pub const fn net_stats_interval(&self) -> u64 {
        self.net_interval_ms
    }

    /// The reactor wake signal; the loop re-arms it every tick so timer
    /// changes and shutdown requests are observed promptly.
    #[must_use]
    pub fn wake_handle(&self) -> Rc<tokio::sync::Notify> {
        Rc::clone(&self.wake)
    }

    /// Retune the CPU sampling interval; takes effect at the next
    /// wake-up, which the wake signal makes prompt.
    pub fn reschedule_cpu_timer(&mut self, interval_ms: u64) {
        self.cpu_interval_ms = clamp_interval(interval_ms);
        info!(interval_ms = self.cpu_interval_ms, "cpu stats interval changed");
        self.wake.notify_one();
    }

    /// Retune the memory sampling interval; takes effect at the next
    /// wake-up, which the wake signal makes prompt.
    pub fn reschedule_mem_timer(&mut self, interval_ms: u64) {
        self.mem_interval_ms = clamp_interval(interval_ms);
        info!(interval_ms = self.mem_interval_ms, "memory stats interval changed");
        self.wake.notify_one();
    }

    /// Retune the network sampling interval; takes effect at the next
    /// wake-up, which the wake signal makes prompt.
    pub fn reschedule_net_timer(&mut self, interval_ms: u64) {
        self.net_interval_ms = clamp_interval(interval_ms);
        info!(interval_ms = self.net_interval_ms, "network stats interval changed");
        self.wake.notify_one();
    }

    /// Aggregate memory usage in KB: own PSS plus spawner RSS plus the
    /// dirty pages attributed to kits. Accounting failures degrade to 0.
    #[must_use]
    pub fn total_memory_usage_kb(&self) -> u64 {
        let own_pid = std::process::id() as i32;
        let own_pss = procinfo::memory_pss_kb(own_pid).unwrap_or_else(|e| {
            debug!(error = %e, "own PSS unavailable");
            0
        });
        let spawner_rss = self
            .broker
            .spawner_pid()
            .map(|pid| procinfo::memory_rss_kb(pid).unwrap_or(0))
            .unwrap_or(0);
        own_pss + spawner_rss + self.registry.kits_memory_usage_kb()
    }

    /// Jiffies consumed since the previous CPU sample across the server,
    /// the spawner and all kits. The first call primes the baseline and
    /// returns 0.
    pub fn total_cpu_jiffies_delta(&mut self) -> u64 {
        let own_pid = std::process::id() as i32;
        let own = procinfo::cpu_jiffies(own_pid).unwrap_or(0);
        let spawner = self
            .broker
            .spawner_pid()
            .map(|pid| procinfo::cpu_jiffies(pid).unwrap_or(0))
            .unwrap_or(0);

        if self.last_jiffies == 0 {
            self.last_jiffies = own + spawner;
            return 0;
        }

        let mut kits = 0;
        for pid in self.registry.document_pids() {
            let current = procinfo::cpu_jiffies(pid).unwrap_or(0);
            kits += self.registry.kit_jiffies_delta(pid, current);
        }

        let total = (own + spawner).saturating_sub(self.last_jiffies) + kits;
        self.last_jiffies = own + spawner;
        total
    }

    /// `channel=level` dump for `channel_list`.
    #[must_use]
    pub fn channel_log_levels(&self) -> String {
        self.log_levels.dump()
    }

    /// Retune one logging channel. The kit channel is forwarded to the
    /// spawner; the empty channel name means the default channel.
    pub fn set_channel_log_level(&mut self, channel: &str, level: &str) {
        let channel = if channel.is_empty() {
            LogLevels::DEFAULT_CHANNEL
        } else {
            channel
        };
        if channel == "kit" {
            self.broker.forward_kit_log_level(level);
        }
        self.log_levels.set(channel, level);
    }

    /// Last 500 lines of the configured log file, newest first.
    #[must_use]
    pub fn log_lines(&self) -> String {
        const MAX_LINES: usize = 500;
        let Some(path) = &self.log_file else {
            return "Could not read the log file.".to_string();
        };
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let lines: Vec<&str> = content.lines().collect();
                let tail = lines.len().saturating_sub(MAX_LINES);
                let mut out = String::new();
                for line in lines[tail..].iter().rev() {
                    out.push('\n');
                    out.push_str(line);
                }
                out
            },
            Err(_) => "Could not read the log file.".to_string(),
        }
    }

    /// Request an orderly shutdown of the process.
    pub fn request_shutdown(&mut self) {
        info!("shutdown requested by admin");
        self.shutdown_requested = true;
        self.broker.request_shutdown();
        self.wake.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use scrivd_core::broker::NullBroker;
    use scrivd_core::config::AdminConfig;
    use scrivd_core::process::SystemProcessControl;

    use super::*;
    use crate::reactor::{MAX_STATS_INTERVAL_MS, MIN_STATS_INTERVAL_MS};

    fn admin() -> Admin {
        Admin::new(
            &AdminConfig::default(),
            Rc::new(NullBroker),
            Rc::new(SystemProcessControl),
        )
    }

    #[test]
    fn reschedule_clamps_and_reads_back() {
        let mut admin = admin();
        for (value, expected) in [
            (0, MIN_STATS_INTERVAL_MS),
            (MIN_STATS_INTERVAL_MS, MIN_STATS_INTERVAL_MS),
            (777, 777),
            (u64::MAX, MAX_STATS_INTERVAL_MS),
        ] {
            admin.reschedule_cpu_timer(value);
            assert_eq!(admin.cpu_stats_interval(), expected);
            admin.reschedule_mem_timer(value);
            assert_eq!(admin.mem_stats_interval(), expected);
            admin.reschedule_net_timer(value);
            assert_eq!(admin.net_stats_interval(), expected);
        }
    }

    #[test]
    fn channel_log_levels_roundtrip() {
        let mut admin = admin();
        admin.set_channel_log_level("kit", "trace");
        assert!(admin.channel_log_levels().contains("kit=trace"));
        // Empty channel name addresses the default channel.
        admin.set_channel_log_level("", "debug");
        assert!(admin.channel_log_levels().contains("srv=debug"));
    }

    #[test]
    fn log_level_applier_receives_default_channel_changes() {
        use std::cell::RefCell;

        let applied = Rc::new(RefCell::new(Vec::new()));
        let mut admin = admin();
        let sink = Rc::clone(&applied);
        admin
            .log_levels
            .set_applier(Box::new(move |level| sink.borrow_mut().push(level.to_string())));

        admin.set_channel_log_level("srv", "warn");
        admin.set_channel_log_level("kit", "trace");
        assert_eq!(applied.borrow().as_slice(), ["warn".to_string()]);
    }

    #[test]
    fn log_lines_without_file_reports_failure() {
        let admin = admin();
        assert_eq!(admin.log_lines(), "Could not read the log file.");
    }

    #[test]
    fn log_lines_returns_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scrivd.log");
        std::fs::write(&path, "first\nsecond\nthird\n").unwrap();

        let mut admin = admin();
        admin.log_file = Some(path);
        assert_eq!(admin.log_lines(), "\nthird\nsecond\nfirst");
    }

    #[test]
    fn session_ids_are_monotonic() {
        let mut admin = admin();
        let a = admin.next_session_id();
        let b = admin.next_session_id();
        assert!(b > a);
    }
}

/// Cloneable cross-thread handle to the reactor's callback queue.
///
/// This is the sole inter-thread mutation path into [`Admin`]; callbacks
/// run FIFO on the reactor thread.
#[derive(Clone)]
pub struct AdminHandle {
    tx: mpsc::UnboundedSender<AdminCallback>,
}

impl AdminHandle {
    /// Wrap a callback-queue sender.
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<AdminCallback>) -> Self {
        Self { tx }
    }

    /// Post a deferred mutation; also wakes the reactor.
    pub fn post(&self, callback: impl FnOnce(&mut Admin) + Send + 'static) {
        let _ = self.tx.send(Box::new(callback));
    }

    /// Run a read on the reactor thread and await its result.
    ///
    /// `None` when the reactor has already shut down.
    pub async fn with_admin<T: Send + 'static>(
        &self,
        f: impl FnOnce(&mut Admin) -> T + Send + 'static,
    ) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.post(move |admin| {
            let _ = tx.send(f(admin));
        });
        rx.await.ok()
    }

    /// Register a document view in the registry.
    #[allow(clippy::too_many_arguments)]
    pub fn add_document(
        &self,
        doc_key: String,
        pid: i32,
        filename: String,
        source_uri: String,
        session_id: String,
        user_name: String,
        user_id: String,
        read_only: bool,
    ) {
        self.post(move |admin| {
            admin.registry.add_document(
                &doc_key,
                pid,
                &filename,
                &source_uri,
                &session_id,
                &user_name,
                &user_id,
                read_only,
            );
        });
    }

    /// Drop one document view.
    pub fn remove_document_session(&self, doc_key: String, session_id: String) {
        self.post(move |admin| admin.registry.remove_document_session(&doc_key, &session_id));
    }

    /// Drop a document entirely.
    pub fn remove_document(&self, doc_key: String) {
        self.post(move |admin| admin.registry.remove_document(&doc_key));
    }

    /// Flag a document modified or clean.
    pub fn modification_alert(&self, doc_key: String, modified: bool) {
        self.post(move |admin| admin.registry.modification_alert(&doc_key, modified));
    }

    /// Record a storage upload outcome.
    pub fn uploaded_alert(&self, doc_key: String, success: bool) {
        self.post(move |admin| admin.registry.uploaded_alert(&doc_key, success));
    }

    /// Account transferred bytes.
    pub fn add_bytes(&self, doc_key: String, sent: u64, recv: u64) {
        self.post(move |admin| admin.registry.add_bytes(&doc_key, sent, recv));
    }

    /// Refresh a document's activity timestamp.
    pub fn update_last_activity(&self, doc_key: String) {
        self.post(move |admin| admin.registry.update_last_activity(&doc_key));
    }

    /// Record a view load duration.
    pub fn set_view_load_duration(&self, doc_key: String, session_id: String, ms: u64) {
        self.post(move |admin| {
            admin
                .registry
                .set_view_load_duration(&doc_key, &session_id, ms);
        });
    }

    /// Record abnormal kit exits.
    pub fn add_error_exit_counters(&self, segfault: u64, killed: u64, oom_killed: u64) {
        self.post(move |admin| {
            admin
                .registry
                .add_error_exit_counters(segfault, killed, oom_killed);
        });
    }

    /// Record lost kits terminated by the reaper.
    pub fn add_lost_kits_terminated(&self, count: u64) {
        self.post(move |admin| admin.registry.add_lost_kits_terminated(count));
    }

    /// Retune the memory sampling interval.
    pub fn reschedule_mem_timer(&self, interval_ms: u64) {
        self.post(move |admin| admin.reschedule_mem_timer(interval_ms));
    }

    /// Retune the CPU sampling interval.
    pub fn reschedule_cpu_timer(&self, interval_ms: u64) {
        self.post(move |admin| admin.reschedule_cpu_timer(interval_ms));
    }

    /// Request orderly shutdown.
    pub fn request_shutdown(&self) {
        self.post(Admin::request_shutdown);
    }
}
