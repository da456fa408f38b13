//! Process-control capability for the reaper and the console `kill` command.
//!
//! Raw signal delivery is abstracted behind [`ProcessControl`] so policy
//! code (lost-kit reaping, admin-requested kills) is testable against fake
//! process tables instead of real pids.

use thiserror::Error;

use crate::procinfo;

/// Errors from process control operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProcessError {
    /// Signal delivery failed.
    #[error("failed to signal pid {pid}: {source}")]
    SignalFailed {
        /// Target process id.
        pid: i32,
        /// The underlying errno.
        #[source]
        source: nix::Error,
    },
}

/// Result type for process control operations.
pub type ProcessResult<T> = Result<T, ProcessError>;

/// Capability over OS process control.
///
/// `terminate` is a hard kill; there is no graceful variant here because
/// the callers (reaper, admin `kill`) are by definition past the point of
/// cooperation with the target.
pub trait ProcessControl {
    /// Whether a process with this pid currently exists.
    fn is_alive(&self, pid: i32) -> bool;

    /// Deliver a hard kill signal.
    fn terminate(&self, pid: i32) -> ProcessResult<()>;

    /// Pids of OS-visible processes whose parent is `parent`.
    fn pids_with_parent(&self, parent: i32) -> Vec<i32>;
}

/// Real implementation over `/proc` and `kill(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessControl;

impl ProcessControl for SystemProcessControl {
    fn is_alive(&self, pid: i32) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        // Signal 0 probes existence without delivering anything.
        kill(Pid::from_raw(pid), None).is_ok()
    }

    fn terminate(&self, pid: i32) -> ProcessResult<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        kill(Pid::from_raw(pid), Signal::SIGKILL)
            .map_err(|source| ProcessError::SignalFailed { pid, source })
    }

    fn pids_with_parent(&self, parent: i32) -> Vec<i32> {
        procinfo::pids_with_parent(parent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        let control = SystemProcessControl;
        assert!(control.is_alive(std::process::id() as i32));
    }

    #[test]
    fn nonexistent_pid_is_not_alive() {
        let control = SystemProcessControl;
        // Pids beyond the default pid_max are never allocated.
        assert!(!control.is_alive(9_999_999));
    }
}
