//! Core logic for the scrivd document-server admin control plane.
//!
//! This crate carries the transport-free parts of the control plane: OS
//! process accounting, the memory budget, the aggregate document registry,
//! the broker/process capabilities, and configuration. The daemon crate
//! owns sockets, the reactor and the binary.

pub mod broker;
pub mod budget;
pub mod config;
pub mod model;
pub mod process;
pub mod procinfo;
