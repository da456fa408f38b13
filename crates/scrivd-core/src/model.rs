//! Aggregate document/session registry behind the admin console.
//!
//! One instance lives on the reactor thread and is mutated only there;
//! collaborators on other threads reach it through the reactor's callback
//! queue. Accessors assert thread identity defensively.
//!
//! The registry holds ring-buffer histories of the sampled telemetry,
//! per-document records used for eviction ordering and console queries,
//! and the subscriber set for push notifications.

use std::collections::{HashMap, HashSet, VecDeque};
use std::thread::{self, ThreadId};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::debug;

/// Sink for push notifications to one console session.
///
/// Returns `false` when the session is gone; the registry then drops the
/// subscriber.
pub trait Notifier {
    /// Deliver one text frame.
    fn notify(&self, message: &str) -> bool;
}

/// Snapshot used by the resource governor for eviction ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentIdleRecord {
    /// Stable document identifier.
    pub doc_key: String,
    /// Milliseconds since the document last saw activity.
    pub idle_time_ms: u64,
    /// Whether the document has no unsaved edits.
    pub saved: bool,
    /// Attributed dirty memory in KB.
    pub memory_kb: u64,
}

/// One editing view (session) on a document.
#[derive(Debug, Clone)]
struct View {
    user_name: String,
    user_id: String,
    load_duration_ms: Option<u64>,
}

/// Migration routing info installed by the `migrate` command.
#[derive(Debug, Clone)]
pub struct MigrationInfo {
    /// Routing token for the target instance.
    pub route_token: String,
    /// Target server identifier.
    pub server_id: String,
}

/// Per-document record.
#[derive(Debug)]
struct DocumentEntry {
    pid: i32,
    filename: String,
    source_uri: String,
    read_only: bool,
    saved: bool,
    memory_kb: u64,
    mem_changed: bool,
    last_jiffies: u64,
    sent_bytes: u64,
    recv_bytes: u64,
    opened_at: Instant,
    last_activity: Instant,
    views: HashMap<String, View>,
    migration: Option<MigrationInfo>,
}

/// Fixed-capacity sample history.
#[derive(Debug, Default)]
struct StatsHistory {
    samples: VecDeque<u64>,
    size: usize,
}

impl StatsHistory {
    fn new(size: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(size),
            size,
        }
    }

    fn push(&mut self, sample: u64) {
        while self.samples.len() >= self.size.max(1) {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    fn set_size(&mut self, size: usize) {
        self.size = size;
        while self.samples.len() > self.size.max(1) {
            self.samples.pop_front();
        }
    }

    fn clear(&mut self) {
        self.samples.clear();
    }

    fn to_csv(&self) -> String {
        self.samples
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    fn to_vec(&self) -> Vec<u64> {
        self.samples.iter().copied().collect()
    }
}

struct Subscriber {
    notifier: Box<dyn Notifier>,
    channels: HashSet<String>,
}

/// The aggregate registry. Single-writer: the reactor thread.
pub struct AdminRegistry {
    owner: ThreadId,
    docs: HashMap<String, DocumentEntry>,
    mem_stats: StatsHistory,
    cpu_stats: StatsHistory,
    sent_stats: StatsHistory,
    recv_stats: StatsHistory,
    connection_stats: StatsHistory,
    subscribers: HashMap<u64, Subscriber>,
    sent_bytes_total: u64,
    recv_bytes_total: u64,
    segfault_count: u64,
    killed_count: u64,
    oom_killed_count: u64,
    lost_kits_terminated: u64,
    started_at: DateTime<Utc>,
}

impl AdminRegistry {
    /// Create a registry owned by the calling thread.
    #[must_use]
    pub fn new(stats_size: usize) -> Self {
        Self {
            owner: thread::current().id(),
            docs: HashMap::new(),
            mem_stats: StatsHistory::new(stats_size),
            cpu_stats: StatsHistory::new(stats_size),
            sent_stats: StatsHistory::new(stats_size),
            recv_stats: StatsHistory::new(stats_size),
            connection_stats: StatsHistory::new(stats_size),
            subscribers: HashMap::new(),
            sent_bytes_total: 0,
            recv_bytes_total: 0,
            segfault_count: 0,
            killed_count: 0,
            oom_killed_count: 0,
            lost_kits_terminated: 0,
            started_at: Utc::now(),
        }
    }

    /// Transfer ownership to the calling thread (done once, when the
    /// reactor thread starts).
    pub fn set_thread_owner(&mut self) {
        self.owner = thread::current().id();
    }

    fn assert_correct_thread(&self) {
        debug_assert_eq!(
            thread::current().id(),
            self.owner,
            "registry accessed off the reactor thread"
        );
    }

    // ------------------------------------------------------------------
    // Documents
    // ------------------------------------------------------------------

    /// Register a document view; creates the document on first sight.
    #[allow(clippy::too_many_arguments)]
    pub fn add_document(
        &mut self,
        doc_key: &str,
        pid: i32,
        filename: &str,
        source_uri: &str,
        session_id: &str,
        user_name: &str,
        user_id: &str,
        read_only: bool,
    ) {
        self.assert_correct_thread();
        let entry = self
            .docs
            .entry(doc_key.to_string())
            .or_insert_with(|| DocumentEntry {
                pid,
                filename: filename.to_string(),
                source_uri: source_uri.to_string(),
                read_only,
                saved: true,
                memory_kb: 0,
                mem_changed: false,
                last_jiffies: 0,
                sent_bytes: 0,
                recv_bytes: 0,
                opened_at: Instant::now(),
                last_activity: Instant::now(),
                views: HashMap::new(),
                migration: None,
            });
        entry.views.insert(
            session_id.to_string(),
            View {
                user_name: user_name.to_string(),
                user_id: user_id.to_string(),
                load_duration_ms: None,
            },
        );
        entry.last_activity = Instant::now();
        self.notify(&format!("adddoc {pid} {filename} {session_id} {user_name}"));
    }

    /// Drop one view; drops the document when the last view goes.
    pub fn remove_document_session(&mut self, doc_key: &str, session_id: &str) {
        self.assert_correct_thread();
        let mut gone = false;
        if let Some(entry) = self.docs.get_mut(doc_key) {
            entry.views.remove(session_id);
            gone = entry.views.is_empty();
            let pid = entry.pid;
            self.notify(&format!("rmdoc {pid} {session_id}"));
        }
        if gone {
            self.docs.remove(doc_key);
        }
    }

    /// Drop a document and all of its views.
    pub fn remove_document(&mut self, doc_key: &str) {
        self.assert_correct_thread();
        if let Some(entry) = self.docs.remove(doc_key) {
            self.notify(&format!("rmdoc {} all", entry.pid));
        }
    }

    /// Flag a document modified (unsaved) or back to clean.
    pub fn modification_alert(&mut self, doc_key: &str, modified: bool) {
        self.assert_correct_thread();
        if let Some(entry) = self.docs.get_mut(doc_key) {
            entry.saved = !modified;
            entry.last_activity = Instant::now();
            let pid = entry.pid;
            self.notify(&format!("modifications {pid} {modified}"));
        }
    }

    /// Record the outcome of a storage upload.
    pub fn uploaded_alert(&mut self, doc_key: &str, success: bool) {
        self.assert_correct_thread();
        if let Some(entry) = self.docs.get_mut(doc_key) {
            if success {
                entry.saved = true;
            }
        }
    }

    /// Refresh a document's last-activity timestamp.
    pub fn update_last_activity(&mut self, doc_key: &str) {
        self.assert_correct_thread();
        if let Some(entry) = self.docs.get_mut(doc_key) {
            entry.last_activity = Instant::now();
        }
    }

    /// Account transferred bytes against a document and the global totals.
    pub fn add_bytes(&mut self, doc_key: &str, sent: u64, recv: u64) {
        self.assert_correct_thread();
        self.sent_bytes_total = self.sent_bytes_total.saturating_add(sent);
        self.recv_bytes_total = self.recv_bytes_total.saturating_add(recv);
        if let Some(entry) = self.docs.get_mut(doc_key) {
            entry.sent_bytes = entry.sent_bytes.saturating_add(sent);
            entry.recv_bytes = entry.recv_bytes.saturating_add(recv);
        }
    }

    /// Record how long a view took to load.
    pub fn set_view_load_duration(&mut self, doc_key: &str, session_id: &str, ms: u64) {
        self.assert_correct_thread();
        if let Some(view) = self
            .docs
            .get_mut(doc_key)
            .and_then(|d| d.views.get_mut(session_id))
        {
            view.load_duration_ms = Some(ms);
        }
    }

    /// Update a kit's attributed dirty memory, flagging changes for the
    /// next subscriber notification round.
    pub fn set_kit_memory(&mut self, pid: i32, memory_kb: u64) {
        self.assert_correct_thread();
        for entry in self.docs.values_mut().filter(|d| d.pid == pid) {
            if entry.memory_kb != memory_kb {
                entry.memory_kb = memory_kb;
                entry.mem_changed = true;
            }
        }
    }

    /// Notify subscribers of every document whose memory changed since the
    /// previous round.
    pub fn notify_docs_memory_changed(&mut self) {
        self.assert_correct_thread();
        let changed: Vec<(i32, u64)> = self
            .docs
            .values_mut()
            .filter(|d| d.mem_changed)
            .map(|d| {
                d.mem_changed = false;
                (d.pid, d.memory_kb)
            })
            .collect();
        for (pid, kb) in changed {
            self.notify(&format!("propchange {pid} mem {kb}"));
        }
    }

    /// Per-kit jiffies delta since the previous sample; primes on first use.
    pub fn kit_jiffies_delta(&mut self, pid: i32, current: u64) -> u64 {
        self.assert_correct_thread();
        let mut delta = 0;
        for entry in self.docs.values_mut().filter(|d| d.pid == pid) {
            if entry.last_jiffies != 0 {
                delta = current.saturating_sub(entry.last_jiffies);
            }
            entry.last_jiffies = current;
        }
        delta
    }

    /// Install migration routing info on a document.
    pub fn set_migrating_info(&mut self, doc_key: &str, route_token: &str, server_id: &str) {
        self.assert_correct_thread();
        if let Some(entry) = self.docs.get_mut(doc_key) {
            entry.migration = Some(MigrationInfo {
                route_token: route_token.to_string(),
                server_id: server_id.to_string(),
            });
        }
    }

    /// Whether a document has no unsaved edits. Unknown documents count as
    /// saved.
    #[must_use]
    pub fn is_doc_saved(&self, doc_key: &str) -> bool {
        self.assert_correct_thread();
        self.docs.get(doc_key).map_or(true, |d| d.saved)
    }

    /// Whether a document is open read-only.
    #[must_use]
    pub fn is_doc_read_only(&self, doc_key: &str) -> bool {
        self.assert_correct_thread();
        self.docs.get(doc_key).is_some_and(|d| d.read_only)
    }

    /// Pids of kits currently bound to documents.
    #[must_use]
    pub fn document_pids(&self) -> HashSet<i32> {
        self.assert_correct_thread();
        self.docs.values().map(|d| d.pid).collect()
    }

    /// Filename served by a kit pid, for kill-audit logging.
    #[must_use]
    pub fn filename_for_pid(&self, pid: i32) -> Option<&str> {
        self.assert_correct_thread();
        self.docs
            .values()
            .find(|d| d.pid == pid)
            .map(|d| d.filename.as_str())
    }

    /// Aggregate dirty memory attributed to kits, KB.
    #[must_use]
    pub fn kits_memory_usage_kb(&self) -> u64 {
        self.assert_correct_thread();
        self.docs.values().map(|d| d.memory_kb).sum()
    }

    /// Documents ordered most-idle-first for the governor.
    #[must_use]
    pub fn documents_sorted_by_idle(&self) -> Vec<DocumentIdleRecord> {
        self.assert_correct_thread();
        let mut records: Vec<DocumentIdleRecord> = self
            .docs
            .iter()
            .map(|(key, d)| DocumentIdleRecord {
                doc_key: key.clone(),
                idle_time_ms: d.last_activity.elapsed().as_millis() as u64,
                saved: d.saved,
                memory_kb: d.memory_kb,
            })
            .collect();
        records.sort_by(|a, b| b.idle_time_ms.cmp(&a.idle_time_ms));
        records
    }

    /// Documents whose dirty memory exceeds `limit_kb` (resource hogs).
    #[must_use]
    pub fn resource_hog_docs(&self, limit_kb: u64) -> Vec<String> {
        self.assert_correct_thread();
        if limit_kb == 0 {
            return Vec::new();
        }
        self.docs
            .iter()
            .filter(|(_, d)| d.memory_kb > limit_kb)
            .map(|(key, _)| key.clone())
            .collect()
    }

    // ------------------------------------------------------------------
    // Histories and counters
    // ------------------------------------------------------------------

    /// Push a memory sample (KB).
    pub fn add_mem_stats(&mut self, sample: u64) {
        self.assert_correct_thread();
        self.mem_stats.push(sample);
        self.notify(&format!("mem_stats {sample}"));
    }

    /// Push a CPU sample (percent).
    pub fn add_cpu_stats(&mut self, sample: u64) {
        self.assert_correct_thread();
        self.cpu_stats.push(sample);
        self.notify(&format!("cpu_stats {sample}"));
    }

    /// Push a sent-bytes activity sample.
    pub fn add_sent_stats(&mut self, sample: u64) {
        self.assert_correct_thread();
        self.sent_stats.push(sample);
        self.notify(&format!("sent_activity {sample}"));
    }

    /// Push a received-bytes activity sample.
    pub fn add_recv_stats(&mut self, sample: u64) {
        self.assert_correct_thread();
        self.recv_stats.push(sample);
        self.notify(&format!("recv_activity {sample}"));
    }

    /// Push a connection-count sample.
    pub fn add_connection_stats(&mut self, sample: u64) {
        self.assert_correct_thread();
        self.connection_stats.push(sample);
        self.notify(&format!("connection_activity {sample}"));
    }

    /// Apply configured history capacities in one shot (startup).
    pub fn configure_sizes(&mut self, mem: usize, cpu: usize, net: usize, connection: usize) {
        self.assert_correct_thread();
        self.mem_stats.set_size(mem);
        self.cpu_stats.set_size(cpu);
        self.sent_stats.set_size(net);
        self.recv_stats.set_size(net);
        self.connection_stats.set_size(connection);
    }

    /// Resize the memory history.
    pub fn set_mem_stats_size(&mut self, size: usize) {
        self.assert_correct_thread();
        self.mem_stats.set_size(size);
    }

    /// Resize the CPU history.
    pub fn set_cpu_stats_size(&mut self, size: usize) {
        self.assert_correct_thread();
        self.cpu_stats.set_size(size);
    }

    /// Drop all memory samples (after an interval change).
    pub fn clear_mem_stats(&mut self) {
        self.assert_correct_thread();
        self.mem_stats.clear();
    }

    /// Drop all CPU samples (after an interval change).
    pub fn clear_cpu_stats(&mut self) {
        self.assert_correct_thread();
        self.cpu_stats.clear();
    }

    /// Total bytes sent to editing clients.
    #[must_use]
    pub fn sent_bytes_total(&self) -> u64 {
        self.assert_correct_thread();
        self.sent_bytes_total
    }

    /// Total bytes received from editing clients.
    #[must_use]
    pub fn recv_bytes_total(&self) -> u64 {
        self.assert_correct_thread();
        self.recv_bytes_total
    }

    /// Seconds since the registry (server) started.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.assert_correct_thread();
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }

    /// Record abnormal kit exits reported by the broker.
    pub fn add_error_exit_counters(&mut self, segfault: u64, killed: u64, oom_killed: u64) {
        self.assert_correct_thread();
        self.segfault_count += segfault;
        self.killed_count += killed;
        self.oom_killed_count += oom_killed;
    }

    /// Record lost kits terminated by the reaper.
    pub fn add_lost_kits_terminated(&mut self, count: u64) {
        self.assert_correct_thread();
        self.lost_kits_terminated += count;
    }

    // ------------------------------------------------------------------
    // Subscribers
    // ------------------------------------------------------------------

    /// Register the notification sink for a console session.
    pub fn add_subscriber(&mut self, session_id: u64, notifier: Box<dyn Notifier>) {
        self.assert_correct_thread();
        self.subscribers.insert(
            session_id,
            Subscriber {
                notifier,
                channels: HashSet::new(),
            },
        );
    }

    /// Remove a console session entirely.
    pub fn remove_subscriber(&mut self, session_id: u64) {
        self.assert_correct_thread();
        self.subscribers.remove(&session_id);
    }

    /// Subscribe a session to a named channel.
    pub fn subscribe(&mut self, session_id: u64, channel: &str) {
        self.assert_correct_thread();
        if let Some(sub) = self.subscribers.get_mut(&session_id) {
            sub.channels.insert(channel.to_string());
        }
    }

    /// Unsubscribe a session from a named channel.
    pub fn unsubscribe(&mut self, session_id: u64, channel: &str) {
        self.assert_correct_thread();
        if let Some(sub) = self.subscribers.get_mut(&session_id) {
            sub.channels.remove(channel);
        }
    }

    /// Push `message` to every subscriber of its first token's channel.
    /// Dead sinks are dropped.
    pub fn notify(&mut self, message: &str) {
        self.assert_correct_thread();
        let Some(channel) = message.split_whitespace().next() else {
            return;
        };
        let mut dead = Vec::new();
        for (&id, sub) in &self.subscribers {
            if sub.channels.contains(channel) && !sub.notifier.notify(message) {
                dead.push(id);
            }
        }
        for id in dead {
            debug!(session_id = id, "dropping dead subscriber");
            self.subscribers.remove(&id);
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Console query dispatch; `None` for unknown names.
    #[must_use]
    pub fn query(&self, name: &str) -> Option<String> {
        self.assert_correct_thread();
        match name {
            "documents" => Some(self.documents_list()),
            "active_users_count" => Some(self.active_users_count().to_string()),
            "active_docs_count" => Some(self.docs.len().to_string()),
            "mem_stats" => Some(self.mem_stats.to_csv()),
            "cpu_stats" => Some(self.cpu_stats.to_csv()),
            "sent_activity" => Some(self.sent_stats.to_csv()),
            "recv_activity" => Some(self.recv_stats.to_csv()),
            "connection_activity" => Some(self.connection_stats.to_csv()),
            "mem_stats_size" => Some(self.mem_stats.size.to_string()),
            "cpu_stats_size" => Some(self.cpu_stats.size.to_string()),
            "net_stats_size" => Some(self.sent_stats.size.to_string()),
            "connection_stats_size" => Some(self.connection_stats.size.to_string()),
            _ => None,
        }
    }

    fn active_users_count(&self) -> usize {
        self.docs.values().map(|d| d.views.len()).sum()
    }

    fn documents_list(&self) -> String {
        self.docs
            .iter()
            .map(|(key, d)| {
                format!(
                    "{} {} {} {} {} {} {}",
                    d.pid,
                    key,
                    d.filename,
                    d.views.len(),
                    d.memory_kb,
                    d.opened_at.elapsed().as_millis(),
                    d.last_activity.elapsed().as_millis(),
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Full history snapshot as a JSON object.
    #[must_use]
    pub fn history_json(&self) -> String {
        self.assert_correct_thread();
        let documents: Vec<serde_json::Value> = self
            .docs
            .iter()
            .map(|(key, d)| {
                json!({
                    "docKey": key,
                    "pid": d.pid,
                    "filename": d.filename,
                    "activeViews": d.views.len(),
                    "memoryKb": d.memory_kb,
                    "saved": d.saved,
                    "readOnly": d.read_only,
                    "sentBytes": d.sent_bytes,
                    "recvBytes": d.recv_bytes,
                    "elapsedMs": d.opened_at.elapsed().as_millis() as u64,
                    "idleMs": d.last_activity.elapsed().as_millis() as u64,
                })
            })
            .collect();
        json!({
            "memStats": self.mem_stats.to_vec(),
            "cpuStats": self.cpu_stats.to_vec(),
            "sentStats": self.sent_stats.to_vec(),
            "recvStats": self.recv_stats.to_vec(),
            "connectionStats": self.connection_stats.to_vec(),
            "documents": documents,
        })
        .to_string()
    }

    /// JSON map of docKey to source URI.
    #[must_use]
    pub fn wopi_src_map_json(&self) -> String {
        self.assert_correct_thread();
        let map: serde_json::Map<String, serde_json::Value> = self
            .docs
            .iter()
            .map(|(key, d)| (key.clone(), json!(d.source_uri)))
            .collect();
        serde_json::Value::Object(map).to_string()
    }

    /// Append registry-level metrics as `key value` lines.
    pub fn write_metrics(&self, out: &mut String) {
        self.assert_correct_thread();
        use std::fmt::Write;
        let _ = writeln!(out, "document_all_count {}", self.docs.len());
        let _ = writeln!(
            out,
            "document_active_count {}",
            self.docs.values().filter(|d| !d.views.is_empty()).count()
        );
        let _ = writeln!(out, "users_active_count {}", self.active_users_count());
        let _ = writeln!(
            out,
            "kit_memory_used_total_kb {}",
            self.kits_memory_usage_kb()
        );
        let _ = writeln!(out, "error_segfault_count {}", self.segfault_count);
        let _ = writeln!(out, "error_killed_count {}", self.killed_count);
        let _ = writeln!(out, "error_oom_killed_count {}", self.oom_killed_count);
        let _ = writeln!(
            out,
            "lost_kits_terminated_count {}",
            self.lost_kits_terminated
        );
    }

    /// Push the shutdown notice to monitor subscribers before migration.
    pub fn send_shutdown_received(&mut self) {
        self.assert_correct_thread();
        self.notify("shutdown received");
    }

    #[cfg(test)]
    pub(crate) fn backdate_activity_for_test(&mut self, doc_key: &str, idle: std::time::Duration) {
        if let Some(entry) = self.docs.get_mut(doc_key) {
            if let Some(past) = Instant::now().checked_sub(idle) {
                entry.last_activity = past;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    use super::*;

    struct RecordingNotifier {
        messages: Rc<RefCell<Vec<String>>>,
        alive: bool,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, message: &str) -> bool {
            self.messages.borrow_mut().push(message.to_string());
            self.alive
        }
    }

    fn registry_with_doc(doc_key: &str, pid: i32) -> AdminRegistry {
        let mut registry = AdminRegistry::new(10);
        registry.add_document(doc_key, pid, "report.odt", "tcp://src", "s1", "ada", "u1", false);
        registry
    }

    #[test]
    fn document_lifecycle_counts_views() {
        let mut registry = registry_with_doc("doc1", 101);
        registry.add_document("doc1", 101, "report.odt", "tcp://src", "s2", "bob", "u2", false);
        assert_eq!(registry.query("active_docs_count").unwrap(), "1");
        assert_eq!(registry.query("active_users_count").unwrap(), "2");

        registry.remove_document_session("doc1", "s1");
        assert_eq!(registry.query("active_users_count").unwrap(), "1");
        registry.remove_document_session("doc1", "s2");
        assert_eq!(registry.query("active_docs_count").unwrap(), "0");
    }

    #[test]
    fn histories_cap_and_resize() {
        let mut registry = AdminRegistry::new(3);
        for sample in 1..=5 {
            registry.add_mem_stats(sample);
        }
        assert_eq!(registry.query("mem_stats").unwrap(), "3,4,5");

        registry.set_mem_stats_size(2);
        assert_eq!(registry.query("mem_stats").unwrap(), "4,5");
        assert_eq!(registry.query("mem_stats_size").unwrap(), "2");

        registry.clear_mem_stats();
        assert_eq!(registry.query("mem_stats").unwrap(), "");
    }

    #[test]
    fn idle_ordering_is_descending() {
        let mut registry = registry_with_doc("young", 1);
        registry.add_document("old", 2, "old.odt", "tcp://src", "s9", "eve", "u9", false);
        registry.backdate_activity_for_test("old", Duration::from_secs(300));
        registry.backdate_activity_for_test("young", Duration::from_secs(10));

        let records = registry.documents_sorted_by_idle();
        assert_eq!(records[0].doc_key, "old");
        assert_eq!(records[1].doc_key, "young");
        assert!(records[0].idle_time_ms >= records[1].idle_time_ms);
    }

    #[test]
    fn modification_alert_flips_saved_flag() {
        let mut registry = registry_with_doc("doc1", 101);
        assert!(registry.is_doc_saved("doc1"));
        registry.modification_alert("doc1", true);
        assert!(!registry.is_doc_saved("doc1"));
        registry.uploaded_alert("doc1", true);
        assert!(registry.is_doc_saved("doc1"));
    }

    #[test]
    fn notify_reaches_only_subscribed_channels() {
        let mut registry = AdminRegistry::new(10);
        let seen = Rc::new(RefCell::new(Vec::new()));
        registry.add_subscriber(
            7,
            Box::new(RecordingNotifier {
                messages: Rc::clone(&seen),
                alive: true,
            }),
        );
        registry.subscribe(7, "mem_stats");

        registry.add_mem_stats(42);
        registry.add_cpu_stats(13);

        let seen = seen.borrow();
        assert_eq!(seen.as_slice(), ["mem_stats 42"]);
    }

    #[test]
    fn dead_subscriber_is_dropped() {
        let mut registry = AdminRegistry::new(10);
        let seen = Rc::new(RefCell::new(Vec::new()));
        registry.add_subscriber(
            7,
            Box::new(RecordingNotifier {
                messages: Rc::clone(&seen),
                alive: false,
            }),
        );
        registry.subscribe(7, "cpu_stats");

        registry.add_cpu_stats(1);
        registry.add_cpu_stats(2);

        // Second sample never reached the dead sink.
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn unsubscribe_stops_notifications() {
        let mut registry = AdminRegistry::new(10);
        let seen = Rc::new(RefCell::new(Vec::new()));
        registry.add_subscriber(
            3,
            Box::new(RecordingNotifier {
                messages: Rc::clone(&seen),
                alive: true,
            }),
        );
        registry.subscribe(3, "mem_stats");
        registry.add_mem_stats(1);
        registry.unsubscribe(3, "mem_stats");
        registry.add_mem_stats(2);
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn bytes_accumulate_per_doc_and_globally() {
        let mut registry = registry_with_doc("doc1", 101);
        registry.add_bytes("doc1", 1000, 500);
        registry.add_bytes("doc1", 24, 12);
        registry.add_bytes("other", 5, 5);
        assert_eq!(registry.sent_bytes_total(), 1029);
        assert_eq!(registry.recv_bytes_total(), 517);
    }

    #[test]
    fn kit_jiffies_delta_primes_then_diffs() {
        let mut registry = registry_with_doc("doc1", 101);
        assert_eq!(registry.kit_jiffies_delta(101, 1000), 0);
        assert_eq!(registry.kit_jiffies_delta(101, 1070), 70);
    }

    #[test]
    fn history_json_is_valid_json() {
        let mut registry = registry_with_doc("doc1", 101);
        registry.add_mem_stats(10);
        let value: serde_json::Value =
            serde_json::from_str(&registry.history_json()).expect("valid json");
        assert_eq!(value["memStats"][0], 10);
        assert_eq!(value["documents"][0]["pid"], 101);
    }

    #[test]
    fn wopi_src_map_lists_sources() {
        let registry = registry_with_doc("doc1", 101);
        let value: serde_json::Value =
            serde_json::from_str(&registry.wopi_src_map_json()).unwrap();
        assert_eq!(value["doc1"], "tcp://src");
    }

    #[test]
    fn resource_hogs_respect_limit() {
        let mut registry = registry_with_doc("doc1", 101);
        registry.set_kit_memory(101, 4096);
        assert!(registry.resource_hog_docs(0).is_empty());
        assert_eq!(registry.resource_hog_docs(1024), vec!["doc1".to_string()]);
        assert!(registry.resource_hog_docs(8192).is_empty());
    }

    #[test]
    fn unknown_query_is_none() {
        let registry = AdminRegistry::new(10);
        assert!(registry.query("no_such_query").is_none());
    }
}
