//! OOM-avoidance policy: force-save or force-close idle documents when
//! aggregate memory consumption exceeds the configured proportion.
//!
//! The policy is greedy by idleness and prefers closing already-persisted
//! state over destroying unsaved edits: saved documents are force-closed
//! most-idle-first until enough memory is reclaimed; unsaved documents
//! only ever receive an autosave request, which frees nothing this cycle
//! and is re-evaluated on the next sample.

use scrivd_core::broker::DocumentBroker;
use scrivd_core::model::DocumentIdleRecord;
use tracing::{debug, trace, warn};

/// Never evict to reclaim a negligible amount, in KB.
pub const MIN_MEM_TO_FREE_KB: i64 = 1024;

/// Memory that must be freed to get back under the configured proportion.
///
/// Zero when no proportion is configured, the system size is unknown, or
/// usage is within bounds.
#[must_use]
pub fn required_free_kb(total_system_kb: u64, proportion_percent: f64, used_kb: u64) -> i64 {
    if proportion_percent == 0.0 || total_system_kb == 0 {
        return 0;
    }
    let over = used_kb as f64 / total_system_kb as f64 - proportion_percent / 100.0;
    (over * total_system_kb as f64).clamp(0.0, i64::MAX as f64) as i64
}

/// Walk the idle-descending document list, closing saved documents until
/// the remaining requirement drops to or below [`MIN_MEM_TO_FREE_KB`].
/// Returns the number of forced closes.
pub fn evict(mut mem_to_free_kb: i64, docs: &[DocumentIdleRecord], broker: &dyn DocumentBroker) -> usize {
    let mut closed = 0;
    for doc in docs {
        trace!(
            doc_key = %doc.doc_key,
            idle_ms = doc.idle_time_ms,
            saved = doc.saved,
            memory_kb = doc.memory_kb,
            "memory cleanup candidate"
        );
        if doc.saved {
            // Policy action, not an error: the document is persisted and
            // the most idle of what remains.
            warn!(
                doc_key = %doc.doc_key,
                idle_ms = doc.idle_time_ms,
                memory_kb = doc.memory_kb,
                "closing saved document under memory pressure"
            );
            broker.close_document(&doc.doc_key, "oom");
            closed += 1;
            mem_to_free_kb -= doc.memory_kb as i64;
            if mem_to_free_kb <= MIN_MEM_TO_FREE_KB {
                break;
            }
        } else {
            debug!(doc_key = %doc.doc_key, "requesting autosave under memory pressure");
            broker.auto_save(&doc.doc_key);
        }
    }
    closed
}

/// One governor pass over the current sample.
pub fn trigger_memory_cleanup(
    total_system_kb: u64,
    proportion_percent: f64,
    used_kb: u64,
    docs: &[DocumentIdleRecord],
    broker: &dyn DocumentBroker,
) {
    let mem_to_free_kb = required_free_kb(total_system_kb, proportion_percent, used_kb);
    if proportion_percent == 0.0 || total_system_kb == 0 {
        trace!(used_kb, "memory cleanup not configured, skipping");
        return;
    }
    if mem_to_free_kb <= MIN_MEM_TO_FREE_KB {
        return;
    }
    trace!(
        mem_to_free_kb,
        candidates = docs.len(),
        "memory over proportion, starting cleanup"
    );
    evict(mem_to_free_kb, docs, broker);
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::HashSet;

    use scrivd_core::config::KitLimits;

    use super::*;

    #[derive(Default)]
    struct RecordingBroker {
        closed: RefCell<Vec<(String, String)>>,
        saved: RefCell<Vec<String>>,
    }

    impl DocumentBroker for RecordingBroker {
        fn close_document(&self, doc_key: &str, reason: &str) {
            self.closed
                .borrow_mut()
                .push((doc_key.to_string(), reason.to_string()));
        }
        fn auto_save(&self, doc_key: &str) {
            self.saved.borrow_mut().push(doc_key.to_string());
        }
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
            String::new()
        }
        fn set_route_token(&self, _token: &str) {}
        fn forward_kit_log_level(&self, _level: &str) {}
        fn forward_kit_limits(&self, _limits: &KitLimits) {}
        fn set_migration_acknowledged(&self, _doc_key: &str) {}
        fn set_all_migration_acknowledged(&self) {}
        fn request_shutdown(&self) {}
        fn shutdown_requested(&self) -> bool {
            false
        }
    }

    fn record(key: &str, idle: u64, saved: bool, mem: u64) -> DocumentIdleRecord {
        DocumentIdleRecord {
            doc_key: key.to_string(),
            idle_time_ms: idle,
            saved,
            memory_kb: mem,
        }
    }

    #[test]
    fn required_free_is_zero_within_bounds() {
        assert_eq!(required_free_kb(1_000_000, 50.0, 400_000), 0);
        assert_eq!(required_free_kb(1_000_000, 0.0, 999_999), 0);
        assert_eq!(required_free_kb(0, 50.0, 999_999), 0);
    }

    #[test]
    fn required_free_is_the_overage() {
        // 70% used against a 50% proportion on 1 GB: 20% = ~209715 KB over.
        let free = required_free_kb(1_048_576, 50.0, 734_003);
        assert!((free - 209_715).abs() <= 1, "got {free}");
    }

    #[test]
    fn saved_docs_close_idle_first_unsaved_only_autosave() {
        // Most idle first: doc3 (saved), doc2 (unsaved), doc1 (saved).
        let docs = vec![
            record("doc3", 300, true, 4000),
            record("doc2", 200, false, 8000),
            record("doc1", 100, true, 5000),
        ];
        let broker = RecordingBroker::default();

        // 6000 KB needed: doc3 frees 4000 (2000 > 1024 still required),
        // doc2 is unsaved and only autosaved, doc1 closes and finishes.
        evict(6000, &docs, &broker);

        let closed = broker.closed.borrow();
        assert_eq!(
            closed.as_slice(),
            [
                ("doc3".to_string(), "oom".to_string()),
                ("doc1".to_string(), "oom".to_string())
            ]
        );
        assert_eq!(broker.saved.borrow().as_slice(), ["doc2".to_string()]);
    }

    #[test]
    fn eviction_stops_once_remaining_drops_below_threshold() {
        let docs = vec![
            record("doc3", 300, true, 5000),
            record("doc1", 100, true, 5000),
        ];
        let broker = RecordingBroker::default();

        // First close leaves 1000 <= MIN_MEM_TO_FREE_KB: stop.
        evict(6000, &docs, &broker);
        assert_eq!(broker.closed.borrow().len(), 1);
        assert_eq!(broker.closed.borrow()[0].0, "doc3");
    }

    #[test]
    fn unsaved_documents_are_never_force_closed() {
        let docs = vec![
            record("doc2", 200, false, 8000),
            record("doc1", 100, false, 9000),
        ];
        let broker = RecordingBroker::default();

        evict(100_000, &docs, &broker);
        assert!(broker.closed.borrow().is_empty());
        assert_eq!(
            broker.saved.borrow().as_slice(),
            ["doc2".to_string(), "doc1".to_string()]
        );
    }

    #[test]
    fn negligible_requirement_does_nothing() {
        let docs = vec![record("doc1", 100, true, 5000)];
        let broker = RecordingBroker::default();

        // Within MIN_MEM_TO_FREE_KB: the trigger declines to evict.
        trigger_memory_cleanup(1_048_576, 50.0, 524_288 + 900, &docs, &broker);
        assert!(broker.closed.borrow().is_empty());
        assert!(broker.saved.borrow().is_empty());
    }

    #[test]
    fn unchanged_configuration_disables_governor() {
        let docs = vec![record("doc1", 100, true, 50_000)];
        let broker = RecordingBroker::default();
        trigger_memory_cleanup(1_048_576, 0.0, 1_048_576, &docs, &broker);
        assert!(broker.closed.borrow().is_empty());
    }
}
