//! Cgroup manager trait — one implementation each for v1 and v2.
//!
//! The dispatch boundary is kept even though there are exactly two
//! variants: callers hold a `Box<dyn Manager>` obtained once via
//! [`detect`].

use std::path::PathBuf;

use sudocker_shared::{SudockerError, SudockerResult};

use crate::types::Resources;

pub trait Manager: Send + Sync {
    /// Creates the cgroup directory tree for `container_id` and writes
    /// every knob present in `resources`. Does not attach a pid.
    fn create(&self, container_id: &str, resources: &Resources) -> SudockerResult<()>;

    /// Writes `pid` into the leaf's `cgroup.procs`. Must be called after
    /// [`Manager::create`] and before the child proceeds past `procRun`.
    fn apply(&self, container_id: &str, pid: i32) -> SudockerResult<()>;

    /// Validates a resource update against the memory-usage safety check
    /// and rewrites changed knobs in place. Does not re-attach.
    fn update(&self, container_id: &str, resources: &Resources) -> SudockerResult<()>;

    /// Removes the cgroup directory tree, retrying on `EBUSY`.
    fn destroy(&self, container_id: &str) -> SudockerResult<()>;

    /// Leaf path for `container_id`, used by diagnostics and tests.
    fn path(&self, container_id: &str) -> PathBuf;
}

/// Detects cgroup v1 vs v2 by checking whether `/sys/fs/cgroup` itself is
/// mounted as `cgroup2` (statfs magic `CGROUP2_SUPER_MAGIC`).
pub fn detect(cgroup_root: PathBuf) -> SudockerResult<Box<dyn Manager>> {
    if is_unified_mode(&cgroup_root)? {
        Ok(Box::new(super::v2::CgroupV2::new(cgroup_root)))
    } else {
        Ok(Box::new(super::v1::CgroupV1::new(cgroup_root)))
    }
}

fn is_unified_mode(cgroup_root: &std::path::Path) -> SudockerResult<bool> {
    use nix::sys::statfs::statfs;

    const CGROUP2_SUPER_MAGIC: i64 = 0x6367_7270;

    match statfs(cgroup_root) {
        Ok(st) => Ok(i64::from(st.filesystem_type().0) == CGROUP2_SUPER_MAGIC),
        Err(nix::errno::Errno::ENOENT) => Ok(false),
        Err(e) => Err(SudockerError::syscall("statfs", e)),
    }
}

/// Shared memory-safety precondition for both v1 and v2 managers: refuse
/// to lower a limit below what is already resident.
pub(super) fn check_memory_usage(current_usage: i64, new_limit: i64) -> SudockerResult<()> {
    if new_limit > 0 && current_usage > new_limit {
        return Err(SudockerError::PreconditionFailed(format!(
            "memory.current ({current_usage}) exceeds new limit ({new_limit})"
        )));
    }
    Ok(())
}

/// Removes a cgroup directory recursively, retrying `EBUSY` with bounded
/// exponential backoff (10 tries starting at 1ms, doubling).
pub(super) fn remove_path_retrying(path: &std::path::Path) -> SudockerResult<()> {
    if !path.exists() {
        return Ok(());
    }

    // Remove children first: a non-empty cgroup directory cannot be rmdir'd.
    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                remove_path_retrying(&entry.path())?;
            }
        }
    }

    let mut delay = std::time::Duration::from_millis(1);
    for attempt in 0..10 {
        match std::fs::remove_dir(path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) if is_ebusy(&e) && attempt < 9 => {
                std::thread::sleep(delay);
                delay *= 2;
            }
            Err(e) => return Err(SudockerError::syscall("rmdir", e)),
        }
    }
    Ok(())
}

fn is_ebusy(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::EBUSY)
}

/// Writes a pid into `cgroup.procs`, retrying on `EINVAL` (the task may
/// not be fully created yet), matching `WriteCgroupProc`.
pub(super) fn write_cgroup_procs(dir: &std::path::Path, pid: i32) -> SudockerResult<()> {
    use std::io::Write;

    let path = dir.join("cgroup.procs");
    for _ in 0..5 {
        let mut file = std::fs::OpenOptions::new().write(true).open(&path)?;
        match file.write_all(pid.to_string().as_bytes()) {
            Ok(()) => return Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                std::thread::sleep(std::time::Duration::from_millis(30));
            }
            Err(e) => return Err(SudockerError::syscall("write cgroup.procs", e)),
        }
    }
    Err(SudockerError::syscall(
        "write cgroup.procs",
        "gave up after 5 attempts (EINVAL)",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_usage_check_rejects_lowering_below_current() {
        assert!(check_memory_usage(200, 100).is_err());
        assert!(check_memory_usage(50, 100).is_ok());
        assert!(check_memory_usage(200, 0).is_ok(), "0 means no limit, not rejected");
    }
}
