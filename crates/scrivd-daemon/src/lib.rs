//! scrivd-daemon: the admin control plane of the scrivd document server.
//!
//! A pool of kit worker processes renders documents; this daemon
//! supervises that fleet. One dedicated reactor thread samples aggregate
//! CPU/memory/network usage, enforces the memory budget by evicting or
//! force-saving idle documents, reaps orphaned kit processes, maintains
//! push channels to external monitors, and serves the authenticated
//! console protocol plus a plain-text metrics feed.
//!
//! # Threading model
//!
//! Everything stateful lives on the reactor thread
//! ([`reactor`]): periodic task bodies, socket callbacks and protocol
//! dispatch all execute inline there, cooperatively. Other threads
//! interact exclusively through [`state::AdminHandle`], a queue of
//! deferred closures drained FIFO by the reactor, so the shared model has
//! single-writer semantics without a single mutex.

pub mod governor;
pub mod metrics;
pub mod monitor;
pub mod protocol;
pub mod reactor;
pub mod reaper;
pub mod shutdown;
pub mod state;
