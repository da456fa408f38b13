//! Lost-kit detection and reaping.
//!
//! A kit-lineage OS process that the broker no longer tracks is either a
//! bookkeeping race or an actual orphan. The tracker gives every candidate
//! a grace period to reappear in the tracked set before it is terminated
//! with a hard kill.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use scrivd_core::process::ProcessControl;
use tracing::{debug, error};

/// Tracks first-sighting times of lost-kit candidates.
pub struct LostKitTracker {
    candidates: HashMap<i32, Instant>,
    grace_period: Duration,
}

impl LostKitTracker {
    /// Create a tracker with the configured grace period.
    #[must_use]
    pub fn new(grace_period: Duration) -> Self {
        Self {
            candidates: HashMap::new(),
            grace_period,
        }
    }

    /// Change the grace period (config reload).
    pub fn set_grace_period(&mut self, grace_period: Duration) {
        self.grace_period = grace_period;
    }

    /// Number of current candidates, for state dumps.
    #[must_use]
    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    /// One reaping pass. Returns the number of kits terminated.
    ///
    /// `tracked` is the broker's own pid set; `spawner_pid` anchors the
    /// OS scan ("is this pid one of ours"). A pid seen in the scan but not
    /// in `tracked` becomes a candidate at `now`; a candidate that shows
    /// up tracked again is a resolved false positive; a candidate older
    /// than the grace period is killed and removed.
    pub fn scan(
        &mut self,
        tracked: &HashSet<i32>,
        spawner_pid: i32,
        control: &dyn ProcessControl,
        now: Instant,
    ) -> u64 {
        for pid in control.pids_with_parent(spawner_pid) {
            if tracked.contains(&pid) {
                if self.candidates.remove(&pid).is_some() {
                    debug!(pid, "lost-kit candidate reappeared in tracked set");
                }
            } else {
                self.candidates.entry(pid).or_insert(now);
            }
        }
        // A tracked pid that never shows up in the scan any more is also
        // resolved; without this, a recycled candidate pid would inherit
        // the stale first-seen time.
        for pid in tracked {
            self.candidates.remove(pid);
        }

        let mut terminated = 0;
        let expired: Vec<i32> = self
            .candidates
            .iter()
            .filter(|(_, &first_seen)| now.duration_since(first_seen) > self.grace_period)
            .map(|(&pid, _)| pid)
            .collect();
        for pid in expired {
            if control.is_alive(pid) {
                match control.terminate(pid) {
                    Ok(()) => {
                        terminated += 1;
                        error!(pid, "detected lost kit, sent kill for termination");
                    },
                    Err(e) => error!(pid, error = %e, "detected lost kit, failed to kill"),
                }
            }
            self.candidates.remove(&pid);
        }
        terminated
    }
}
