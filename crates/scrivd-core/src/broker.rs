//! Seam to the document broker and kit-process machinery.
//!
//! The control plane never forks or jails kits itself; it drives the
//! broker through this capability. Policy code (governor, reaper, console
//! dispatch) takes `&dyn DocumentBroker` so tests substitute a recording
//! fake.

use std::collections::HashSet;

use crate::config::KitLimits;

/// Capability over the document broker and kit lifecycle machinery.
pub trait DocumentBroker {
    /// Force-close a document; `reason` is surfaced to its sessions.
    fn close_document(&self, doc_key: &str, reason: &str);

    /// Request an asynchronous autosave of a document.
    fn auto_save(&self, doc_key: &str);

    /// Push a message to every session editing one document.
    fn alert_user(&self, doc_key: &str, message: &str);

    /// Push a message to every connected session.
    fn alert_all_users(&self, message: &str);

    /// Pids of the kit processes the broker currently tracks.
    fn kit_pids(&self) -> HashSet<i32>;

    /// Pid of the kit spawner process, if running.
    fn spawner_pid(&self) -> Option<i32>;

    /// Whether the calling process is itself a kit (in-process mode).
    fn is_kit_process(&self) -> bool;

    /// Version string of the rendering engine.
    fn engine_version(&self) -> String;

    /// Stable identifier of this server instance.
    fn server_id(&self) -> String;

    /// Install a new routing token for this instance.
    fn set_route_token(&self, token: &str);

    /// Forward a kit log-level change to the spawner and current kits.
    fn forward_kit_log_level(&self, level: &str);

    /// Forward changed per-kit resource limits to the spawner.
    fn forward_kit_limits(&self, limits: &KitLimits);

    /// Mark one in-flight document migration-acknowledged.
    fn set_migration_acknowledged(&self, doc_key: &str);

    /// Mark every in-flight document migration-acknowledged.
    fn set_all_migration_acknowledged(&self);

    /// Ask the process to shut down in an orderly fashion.
    fn request_shutdown(&self);

    /// Whether an orderly shutdown has been requested.
    fn shutdown_requested(&self) -> bool;
}

impl<T: DocumentBroker + ?Sized> DocumentBroker for std::sync::Arc<T> {
    fn close_document(&self, doc_key: &str, reason: &str) {
        (**self).close_document(doc_key, reason);
    }
    fn auto_save(&self, doc_key: &str) {
        (**self).auto_save(doc_key);
    }
    fn alert_user(&self, doc_key: &str, message: &str) {
        (**self).alert_user(doc_key, message);
    }
    fn alert_all_users(&self, message: &str) {
        (**self).alert_all_users(message);
    }
    fn kit_pids(&self) -> HashSet<i32> {
        (**self).kit_pids()
    }
    fn spawner_pid(&self) -> Option<i32> {
        (**self).spawner_pid()
    }
    fn is_kit_process(&self) -> bool {
        (**self).is_kit_process()
    }
    fn engine_version(&self) -> String {
        (**self).engine_version()
    }
    fn server_id(&self) -> String {
        (**self).server_id()
    }
    fn set_route_token(&self, token: &str) {
        (**self).set_route_token(token);
    }
    fn forward_kit_log_level(&self, level: &str) {
        (**self).forward_kit_log_level(level);
    }
    fn forward_kit_limits(&self, limits: &KitLimits) {
        (**self).forward_kit_limits(limits);
    }
    fn set_migration_acknowledged(&self, doc_key: &str) {
        (**self).set_migration_acknowledged(doc_key);
    }
    fn set_all_migration_acknowledged(&self) {
        (**self).set_all_migration_acknowledged();
    }
    fn request_shutdown(&self) {
        (**self).request_shutdown();
    }
    fn shutdown_requested(&self) -> bool {
        (**self).shutdown_requested()
    }
}

/// Broker that ignores everything; placeholder for tests and tooling.
#[derive(Debug, Default)]
pub struct NullBroker;

impl DocumentBroker for NullBroker {
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
