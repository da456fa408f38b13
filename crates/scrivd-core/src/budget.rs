//! Memory budget derivation for the resource governor.
//!
//! The budget is computed once at startup from total system memory, any
//! cgroup ceilings, and the configured memory proportion. It never
//! increases afterwards: headroom growth only shrinks it.

use tracing::{info, warn};

use crate::procinfo;

/// Minimum headroom reserved for the server itself, in KB.
///
/// Enough to update broker containers, take locks and write logs while
/// cleaning up kits under memory pressure; without it the cleanup path
/// itself can be the thing that dies.
pub const MIN_HEADROOM_KB: u64 = 1024;

/// The memory envelope the governor enforces.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryBudget {
    /// Total physical memory reported by the host, in KB.
    pub total_system_kb: u64,
    /// Cgroup hard limit in KB (0 = none).
    pub cgroup_limit_kb: u64,
    /// Cgroup soft limit in KB (0 = none).
    pub cgroup_soft_limit_kb: u64,
    /// Configured proportion of system memory the server may use, percent.
    pub configured_proportion_percent: f64,
    /// Derived usable memory in KB after limits and headroom.
    available_kb: u64,
}

impl MemoryBudget {
    /// Derive a budget from explicit figures.
    ///
    /// `available = min(total, cgroup, cgroup_soft) − headroom`, where a
    /// zero cgroup figure means "no limit" and headroom is at least
    /// [`MIN_HEADROOM_KB`], widened to `(1 − proportion) × available` when a
    /// proportion cap is configured.
    #[must_use]
    pub fn derive(
        total_system_kb: u64,
        cgroup_limit_kb: u64,
        cgroup_soft_limit_kb: u64,
        configured_proportion_percent: f64,
    ) -> Self {
        let mut available_kb = total_system_kb;

        if cgroup_limit_kb > 0 && cgroup_limit_kb < available_kb {
            available_kb = cgroup_limit_kb;
        }
        if cgroup_soft_limit_kb > 0 && cgroup_soft_limit_kb < available_kb {
            available_kb = cgroup_soft_limit_kb;
        }

        let mut min_headroom_kb = MIN_HEADROOM_KB;
        if configured_proportion_percent > 0.0 {
            let headroom =
                available_kb as f64 * (100.0 - configured_proportion_percent) / 100.0;
            if (min_headroom_kb as f64) < headroom {
                min_headroom_kb = headroom as u64;
            }
        }

        if available_kb > min_headroom_kb {
            available_kb -= min_headroom_kb;
        }

        Self {
            total_system_kb,
            cgroup_limit_kb,
            cgroup_soft_limit_kb,
            configured_proportion_percent,
            available_kb,
        }
    }

    /// Derive the budget from the running system.
    ///
    /// Accounting failures degrade to zero (no limit / no memory) rather
    /// than failing startup.
    #[must_use]
    pub fn from_system(configured_proportion_percent: f64) -> Self {
        let total_system_kb = procinfo::total_system_memory_kb().unwrap_or_else(|e| {
            warn!(error = %e, "could not read total system memory");
            0
        });
        let cgroup_limit_kb = procinfo::cgroup_memory_limit_bytes() / 1024;
        let cgroup_soft_limit_kb = procinfo::cgroup_memory_soft_limit_bytes() / 1024;
        let budget = Self::derive(
            total_system_kb,
            cgroup_limit_kb,
            cgroup_soft_limit_kb,
            configured_proportion_percent,
        );
        budget.log_summary();
        budget
    }

    /// Usable memory in KB. Never increases after derivation.
    #[must_use]
    pub const fn available_kb(&self) -> u64 {
        self.available_kb
    }

    fn log_summary(&self) {
        info!(
            available_kb = self.available_kb,
            total_system_kb = self.total_system_kb,
            cgroup_limit_kb = self.cgroup_limit_kb,
            cgroup_soft_limit_kb = self.cgroup_soft_limit_kb,
            proportion_percent = self.configured_proportion_percent,
            "memory budget derived"
        );
        if self.available_kb < 1000 * 1024 {
            warn!(
                available_mb = self.available_kb / 1024,
                "low memory condition detected"
            );
        }
    }
}
