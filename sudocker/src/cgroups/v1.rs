//! cgroup v1: one directory tree per subsystem, mounted separately under
//! the cgroup root (`/sys/fs/cgroup/<subsystem>/...`).

use std::path::{Path, PathBuf};

use sudocker_shared::{SudockerError, SudockerResult};
use tracing::warn;

use super::manager::{check_memory_usage, remove_path_retrying, write_cgroup_procs, Manager};
use crate::types::Resources;

const SUBSYSTEMS: &[&str] = &["cpu", "cpuset", "memory", "pids", "blkio", "hugetlb"];
const GROUP_PARENT: &str = "sudocker";

pub struct CgroupV1 {
    root: PathBuf,
}

impl CgroupV1 {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn subsystem_path(&self, subsystem: &str, container_id: &str) -> PathBuf {
        self.root.join(subsystem).join(GROUP_PARENT).join(container_id)
    }

    fn parent_path(&self, subsystem: &str) -> PathBuf {
        self.root.join(subsystem).join(GROUP_PARENT)
    }

    fn apply_cpu(&self, dir: &Path, r: &Resources) -> SudockerResult<()> {
        let tolerate_eperm = r.cgroup_parent.is_none();
        if let Some(v) = r.cpu_shares {
            write_knob(dir, "cpu.shares", v, tolerate_eperm)?;
        }
        if let Some(v) = r.cpu_period_us {
            write_knob(dir, "cpu.cfs_period_us", v, tolerate_eperm)?;
        }
        if let Some(v) = r.cpu_quota_us {
            write_knob(dir, "cpu.cfs_quota_us", v, tolerate_eperm)?;
        }
        if let Some(v) = r.cpu_rt_period_us {
            write_knob(dir, "cpu.rt_period_us", v, tolerate_eperm)?;
        }
        if let Some(v) = r.cpu_rt_runtime_us {
            write_knob(dir, "cpu.rt_runtime_us", v, tolerate_eperm)?;
        }
        if let Some(v) = r.cpu_idle {
            write_knob(dir, "cpu.idle", v as u8, tolerate_eperm)?;
        }
        Ok(())
    }

    /// Parent cpuset must have non-empty `cpus`/`mems` before a child can
    /// join; copy down from the immediate parent only (not a full walk to
    /// the cgroup root — the immediate parent is always populated first
    /// since containers are created in that order).
    fn ensure_cpuset_parent_populated(&self, parent: &Path) -> SudockerResult<()> {
        for knob in ["cpuset.cpus", "cpuset.mems"] {
            let path = parent.join(knob);
            let current = std::fs::read_to_string(&path).unwrap_or_default();
            if current.trim().is_empty() {
                let grandparent = parent
                    .parent()
                    .ok_or_else(|| SudockerError::PreconditionFailed("cpuset parent empty".into()))?;
                let inherited = std::fs::read_to_string(grandparent.join(knob)).map_err(|_| {
                    SudockerError::PreconditionFailed(format!("cpuset parent {knob} empty"))
                })?;
                if inherited.trim().is_empty() {
                    return Err(SudockerError::PreconditionFailed(format!(
                        "cpuset parent {knob} empty"
                    )));
                }
                std::fs::write(&path, inherited.trim())?;
            }
        }
        Ok(())
    }

    fn apply_cpuset(&self, dir: &Path, parent: &Path, r: &Resources) -> SudockerResult<()> {
        if r.cpuset_cpus.is_none() && r.cpuset_mems.is_none() {
            return Ok(());
        }
        let tolerate_eperm = r.cgroup_parent.is_none();
        self.ensure_cpuset_parent_populated(parent)?;
        if let Some(v) = &r.cpuset_cpus {
            write_knob(dir, "cpuset.cpus", v, tolerate_eperm)?;
        }
        if let Some(v) = &r.cpuset_mems {
            write_knob(dir, "cpuset.mems", v, tolerate_eperm)?;
        }
        Ok(())
    }

    fn apply_memory(&self, dir: &Path, r: &Resources, current_usage: i64) -> SudockerResult<()> {
        let tolerate_eperm = r.cgroup_parent.is_none();
        if let Some(limit) = r.memory_limit_bytes {
            if limit > 0 {
                check_memory_usage(current_usage, limit)?;
            }
            write_knob(dir, "memory.limit_in_bytes", limit, tolerate_eperm)?;
        }
        if let Some(swap) = r.memory_swap_bytes {
            if let Some(mem) = r.memory_limit_bytes {
                if swap > 0 && mem > 0 && swap < mem {
                    return Err(SudockerError::InvalidArgument(
                        "memory+swap limit should be >= memory limit".into(),
                    ));
                }
            }
            write_knob(dir, "memory.memsw.limit_in_bytes", swap, tolerate_eperm)?;
        }
        if let Some(v) = r.memory_soft_limit_bytes {
            write_knob(dir, "memory.soft_limit_in_bytes", v, tolerate_eperm)?;
        }
        if let Some(v) = r.memory_swappiness {
            write_knob(dir, "memory.swappiness", v, tolerate_eperm)?;
        }
        Ok(())
    }

    fn apply_pids(&self, dir: &Path, r: &Resources) -> SudockerResult<()> {
        if let Some(v) = r.pids_limit {
            let value = if v <= 0 { "max".to_string() } else { v.to_string() };
            write_knob(dir, "pids.max", value, r.cgroup_parent.is_none())?;
        }
        Ok(())
    }

    fn apply_blkio(&self, dir: &Path, r: &Resources) -> SudockerResult<()> {
        let tolerate_eperm = r.cgroup_parent.is_none();
        if let Some(v) = r.blkio_weight {
            write_knob(dir, "blkio.weight", v, tolerate_eperm)?;
        }
        for dev in &r.blkio_devices {
            if let Some(bps) = dev.read_bps {
                write_knob(
                    dir,
                    "blkio.throttle.read_bps_device",
                    format!("{}:{} {}", dev.major, dev.minor, bps),
                    tolerate_eperm,
                )?;
            }
            if let Some(bps) = dev.write_bps {
                write_knob(
                    dir,
                    "blkio.throttle.write_bps_device",
                    format!("{}:{} {}", dev.major, dev.minor, bps),
                    tolerate_eperm,
                )?;
            }
            if let Some(iops) = dev.read_iops {
                write_knob(
                    dir,
                    "blkio.throttle.read_iops_device",
                    format!("{}:{} {}", dev.major, dev.minor, iops),
                    tolerate_eperm,
                )?;
            }
            if let Some(iops) = dev.write_iops {
                write_knob(
                    dir,
                    "blkio.throttle.write_iops_device",
                    format!("{}:{} {}", dev.major, dev.minor, iops),
                    tolerate_eperm,
                )?;
            }
        }
        Ok(())
    }

    fn apply_hugetlb(&self, dir: &Path, r: &Resources) -> SudockerResult<()> {
        let tolerate_eperm = r.cgroup_parent.is_none();
        for (page_size, limit) in &r.hugetlb_limits {
            write_knob(dir, &format!("hugetlb.{page_size}.limit_in_bytes"), limit, tolerate_eperm)?;
        }
        Ok(())
    }

    fn current_memory_usage(&self, container_id: &str) -> i64 {
        let path = self.subsystem_path("memory", container_id).join("memory.usage_in_bytes");
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }
}

impl Manager for CgroupV1 {
    fn create(&self, container_id: &str, resources: &Resources) -> SudockerResult<()> {
        for subsystem in SUBSYSTEMS {
            let dir = self.subsystem_path(subsystem, container_id);
            std::fs::create_dir_all(&dir)?;
        }

        self.apply_cpu(&self.subsystem_path("cpu", container_id), resources)?;
        self.apply_cpuset(
            &self.subsystem_path("cpuset", container_id),
            &self.parent_path("cpuset"),
            resources,
        )?;
        self.apply_memory(&self.subsystem_path("memory", container_id), resources, 0)?;
        self.apply_pids(&self.subsystem_path("pids", container_id), resources)?;
        self.apply_blkio(&self.subsystem_path("blkio", container_id), resources)?;
        self.apply_hugetlb(&self.subsystem_path("hugetlb", container_id), resources)?;
        Ok(())
    }

    fn apply(&self, container_id: &str, pid: i32) -> SudockerResult<()> {
        for subsystem in SUBSYSTEMS {
            write_cgroup_procs(&self.subsystem_path(subsystem, container_id), pid)?;
        }
        Ok(())
    }

    fn update(&self, container_id: &str, resources: &Resources) -> SudockerResult<()> {
        let usage = self.current_memory_usage(container_id);
        self.apply_cpu(&self.subsystem_path("cpu", container_id), resources)?;
        self.apply_cpuset(
            &self.subsystem_path("cpuset", container_id),
            &self.parent_path("cpuset"),
            resources,
        )?;
        self.apply_memory(&self.subsystem_path("memory", container_id), resources, usage)?;
        self.apply_pids(&self.subsystem_path("pids", container_id), resources)?;
        self.apply_blkio(&self.subsystem_path("blkio", container_id), resources)?;
        self.apply_hugetlb(&self.subsystem_path("hugetlb", container_id), resources)?;
        Ok(())
    }

    fn destroy(&self, container_id: &str) -> SudockerResult<()> {
        for subsystem in SUBSYSTEMS {
            remove_path_retrying(&self.subsystem_path(subsystem, container_id))?;
        }
        Ok(())
    }

    fn path(&self, container_id: &str) -> PathBuf {
        self.subsystem_path("cpu", container_id)
    }
}

/// Writes one cgroup knob. `tolerate_eperm` is true when the caller
/// requested no explicit `--cgroup-parent`, in which case a rootless
/// `EPERM` is logged and swallowed rather than treated as fatal.
fn write_knob(dir: &Path, knob: &str, value: impl std::fmt::Display, tolerate_eperm: bool) -> SudockerResult<()> {
    let path = dir.join(knob);
    match std::fs::write(&path, value.to_string()) {
        Ok(()) => Ok(()),
        Err(e) if tolerate_eperm && e.raw_os_error() == Some(libc::EPERM) => {
            warn!(path = %path.display(), "EPERM writing cgroup knob, tolerated (no explicit cgroup-parent)");
            Ok(())
        }
        Err(e) => Err(SudockerError::syscall("write", format!("{}: {e}", path.display()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_knob_succeeds_against_a_writable_file() {
        let dir = tempfile::tempdir().unwrap();
        write_knob(dir.path(), "cpu.shares", 512, true).unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("cpu.shares")).unwrap(), "512");
    }

    #[test]
    fn write_knob_propagates_non_eperm_errors_regardless_of_tolerance() {
        // Parent directory does not exist: ENOENT, not EPERM, must not
        // be swallowed even with tolerate_eperm = true.
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        assert!(write_knob(&missing, "cpu.shares", 512, true).is_err());
        assert!(write_knob(&missing, "cpu.shares", 512, false).is_err());
    }
}
