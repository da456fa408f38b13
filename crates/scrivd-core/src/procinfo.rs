//! Process and cgroup accounting from `/proc` and `/sys/fs/cgroup`.
//!
//! The control plane reconstructs per-process memory and CPU usage from OS
//! facilities. All reads are bounded and fail-soft: an unreadable or
//! malformed file yields an error that callers downgrade to zero, degrading
//! monitoring fidelity without ever becoming fatal.
//!
//! # Sources
//!
//! | File | Parsed field(s) |
//! |------|-----------------|
//! | `/proc/meminfo` | `MemTotal` |
//! | `/proc/<pid>/status` | `VmRSS` |
//! | `/proc/<pid>/smaps_rollup` | `Pss`, `Private_Dirty` |
//! | `/proc/<pid>/stat` | `utime` + `stime` (jiffies), `ppid` |
//! | `/sys/fs/cgroup/memory.max` / `memory.high` | cgroup v2 limits |
//! | `/sys/fs/cgroup/memory/memory.limit_in_bytes` | cgroup v1 fallback |

use std::fs::File;
use std::io::Read;
use std::path::Path;

use thiserror::Error;

/// Maximum bytes read from any single proc/cgroup file.
///
/// Stat files are typically well under 1 KiB; smaps_rollup is a few KiB.
/// The cap bounds memory use on crafted or runaway pseudo-files.
pub const MAX_PROC_FILE_SIZE: usize = 64 * 1024;

/// Cgroup v2 mount point.
const CGROUP_V2_MOUNT: &str = "/sys/fs/cgroup";

/// Errors from process accounting reads.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProcError {
    /// Failed to read a proc or cgroup file.
    #[error("failed to read '{path}': {source}")]
    ReadFailed {
        /// The file that failed to read.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse file content.
    #[error("failed to parse '{path}': {reason}")]
    ParseFailed {
        /// The file that failed to parse.
        path: String,
        /// Reason for parse failure.
        reason: String,
    },
}

/// Result type for process accounting operations.
pub type ProcResult<T> = Result<T, ProcError>;

/// Read a file with a size bound.
fn read_bounded(path: &Path) -> ProcResult<String> {
    let file = File::open(path).map_err(|source| ProcError::ReadFailed {
        path: path.display().to_string(),
        source,
    })?;
    let mut content = String::new();
    file.take(MAX_PROC_FILE_SIZE as u64)
        .read_to_string(&mut content)
        .map_err(|source| ProcError::ReadFailed {
            path: path.display().to_string(),
            source,
        })?;
    Ok(content)
}

fn parse_failed(path: &Path, reason: impl Into<String>) -> ProcError {
    ProcError::ParseFailed {
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

/// Extract the numeric KB value from a `Key: 1234 kB` meminfo/status line.
fn kb_field(content: &str, key: &str) -> Option<u64> {
    content
        .lines()
        .find(|line| line.starts_with(key))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|v| v.parse().ok())
}

/// Sum every occurrence of a `Key: 1234 kB` field across a smaps-style file.
fn kb_field_sum(content: &str, key: &str) -> u64 {
    content
        .lines()
        .filter(|line| line.starts_with(key))
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter_map(|v| v.parse::<u64>().ok())
        .sum()
}

/// Total system memory in KB from `/proc/meminfo`.
pub fn total_system_memory_kb() -> ProcResult<u64> {
    let path = Path::new("/proc/meminfo");
    let content = read_bounded(path)?;
    kb_field(&content, "MemTotal:").ok_or_else(|| parse_failed(path, "missing MemTotal"))
}

/// Parse a cgroup byte-limit file, returning 0 for "no limit".
///
/// Cgroup v2 writes the literal `max` when unconstrained; v1 writes a
/// number close to `u64::MAX`. Both are normalized to 0.
fn parse_cgroup_limit(path: &Path) -> ProcResult<u64> {
    let content = read_bounded(path)?;
    let value = content.trim();
    if value == "max" {
        return Ok(0);
    }
    let bytes: u64 = value
        .parse()
        .map_err(|_| parse_failed(path, format!("not a byte count: '{value}'")))?;
    // v1 reports an effectively-unlimited sentinel near u64::MAX.
    if bytes >= u64::MAX / 2 {
        return Ok(0);
    }
    Ok(bytes)
}

fn first_readable_limit(candidates: &[&str]) -> u64 {
    for candidate in candidates {
        let path = Path::new(CGROUP_V2_MOUNT).join(candidate);
        if let Ok(bytes) = parse_cgroup_limit(&path) {
            return bytes;
        }
    }
    0
}

/// Cgroup memory limit in bytes applied to this process group (0 = none).
pub fn cgroup_memory_limit_bytes() -> u64 {
    first_readable_limit(&["memory.max", "memory/memory.limit_in_bytes"])
}

/// Cgroup memory soft limit in bytes (0 = none).
pub fn cgroup_memory_soft_limit_bytes() -> u64 {
    first_readable_limit(&["memory.high", "memory/memory.soft_limit_in_bytes"])
}

/// Resident set size of a process in KB from `/proc/<pid>/status`.
pub fn memory_rss_kb(pid: i32) -> ProcResult<u64> {
    let path = format!("/proc/{pid}/status");
    let path = Path::new(&path);
    let content = read_bounded(path)?;
    kb_field(&content, "VmRSS:").ok_or_else(|| parse_failed(path, "missing VmRSS"))
}

/// Proportional set size of a process in KB from `/proc/<pid>/smaps_rollup`.
///
/// PSS attributes shared pages fairly across the processes sharing them,
/// which is what makes the aggregate across a fork-heavy kit fleet add up
/// to something meaningful.
pub fn memory_pss_kb(pid: i32) -> ProcResult<u64> {
    let path = format!("/proc/{pid}/smaps_rollup");
    let path = Path::new(&path);
    let content = read_bounded(path)?;
    Ok(kb_field_sum(&content, "Pss:"))
}

/// Private dirty memory of a process in KB from `/proc/<pid>/smaps_rollup`.
///
/// Kits share everything read-only with their spawner; only dirty pages
/// are attributable to the individual kit.
pub fn memory_dirty_kb(pid: i32) -> ProcResult<u64> {
    let path = format!("/proc/{pid}/smaps_rollup");
    let path = Path::new(&path);
    let content = read_bounded(path)?;
    Ok(kb_field_sum(&content, "Private_Dirty:"))
}

/// Fields of `/proc/<pid>/stat` after the comm field.
///
/// The comm field (2) is parenthesized and may contain spaces or parens;
/// the safe parse splits on the LAST `)` in the line.
fn stat_fields(pid: i32) -> ProcResult<Vec<String>> {
    let path = format!("/proc/{pid}/stat");
    let path = Path::new(&path);
    let content = read_bounded(path)?;
    let after_comm = content
        .rsplit_once(')')
        .ok_or_else(|| parse_failed(path, "no comm terminator"))?
        .1;
    Ok(after_comm.split_whitespace().map(str::to_owned).collect())
}

/// CPU jiffies (utime + stime) consumed by a process.
///
/// Fields 14 and 15 of `/proc/<pid>/stat`, which are indexes 11 and 12 in
/// the post-comm token list.
pub fn cpu_jiffies(pid: i32) -> ProcResult<u64> {
    let fields = stat_fields(pid)?;
    let utime: u64 = fields.get(11).and_then(|f| f.parse().ok()).unwrap_or(0);
    let stime: u64 = fields.get(12).and_then(|f| f.parse().ok()).unwrap_or(0);
    Ok(utime + stime)
}

/// Parent pid of a process (field 4 of `/proc/<pid>/stat`).
pub fn parent_pid(pid: i32) -> ProcResult<i32> {
    let fields = stat_fields(pid)?;
    fields
        .first()
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| ProcError::ParseFailed {
            path: format!("/proc/{pid}/stat"),
            reason: "missing ppid field".to_string(),
        })
}

/// Scan `/proc` for pids whose parent matches `parent`.
///
/// Unreadable entries are skipped; a process that exits mid-scan simply
/// does not appear.
pub fn pids_with_parent(parent: i32) -> Vec<i32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str().and_then(|n| n.parse().ok()))
        .filter(|&pid| parent_pid(pid).is_ok_and(|ppid| ppid == parent))
        .collect()
}

/// Kernel clock ticks per second, for jiffies-to-time conversion.
pub fn clock_ticks_per_sec() -> u64 {
    use nix::unistd::{sysconf, SysconfVar};
    match sysconf(SysconfVar::CLK_TCK) {
        Ok(Some(ticks)) if ticks > 0 => ticks as u64,
        _ => 100,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kb_field_parses_meminfo_line() {
        let content = "MemTotal:       16318424 kB\nMemFree:         1318424 kB\n";
        assert_eq!(kb_field(content, "MemTotal:"), Some(16_318_424));
        assert_eq!(kb_field(content, "MemFree:"), Some(1_318_424));
        assert_eq!(kb_field(content, "MemAvailable:"), None);
    }

    #[test]
    fn kb_field_sum_adds_repeated_keys() {
        let content = "Pss:        100 kB\nPss:        250 kB\nPrivate_Dirty:  7 kB\n";
        assert_eq!(kb_field_sum(content, "Pss:"), 350);
        assert_eq!(kb_field_sum(content, "Private_Dirty:"), 7);
        assert_eq!(kb_field_sum(content, "Swap:"), 0);
    }

    #[test]
    fn cgroup_limit_normalizes_unlimited() {
        let dir = tempfile::tempdir().unwrap();
        let max_file = dir.path().join("memory.max");
        std::fs::write(&max_file, "max\n").unwrap();
        assert_eq!(parse_cgroup_limit(&max_file).unwrap(), 0);

        let v1_file = dir.path().join("memory.limit_in_bytes");
        std::fs::write(&v1_file, format!("{}\n", u64::MAX / 2 + 1)).unwrap();
        assert_eq!(parse_cgroup_limit(&v1_file).unwrap(), 0);

        let bounded = dir.path().join("memory.high");
        std::fs::write(&bounded, "536870912\n").unwrap();
        assert_eq!(parse_cgroup_limit(&bounded).unwrap(), 536_870_912);
    }

    #[test]
    fn cgroup_limit_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("memory.max");
        std::fs::write(&bad, "not-a-number\n").unwrap();
        assert!(matches!(
            parse_cgroup_limit(&bad),
            Err(ProcError::ParseFailed { .. })
        ));
    }

    #[test]
    fn own_stat_is_parseable() {
        let pid = std::process::id() as i32;
        // utime + stime of this very test process.
        let jiffies = cpu_jiffies(pid).expect("own stat should parse");
        let _ = jiffies;
        let ppid = parent_pid(pid).expect("own ppid should parse");
        assert!(ppid >= 0);
    }

    #[test]
    fn missing_pid_reports_read_failure() {
        // Pid 0 has no /proc entry on Linux.
        assert!(matches!(
            memory_rss_kb(-1),
            Err(ProcError::ReadFailed { .. })
        ));
    }

    #[test]
    fn clock_ticks_is_positive() {
        assert!(clock_ticks_per_sec() > 0);
    }
}
