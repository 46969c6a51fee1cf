//! cgroup v2: a single unified hierarchy rooted at `/sys/fs/cgroup`.

use std::path::{Path, PathBuf};

use sudocker_shared::{SudockerError, SudockerResult};
use tracing::warn;

use super::convert::{blkio_weight_to_io_weight, cpu_shares_to_cpu_weight, memory_swap_to_v2_value};
use super::manager::{check_memory_usage, remove_path_retrying, write_cgroup_procs, Manager};
use crate::types::Resources;

const GROUP_PARENT: &str = "sudocker";
const CONTROLLERS: &[&str] = &["cpu", "cpuset", "memory", "pids", "io", "hugetlb"];

pub struct CgroupV2 {
    root: PathBuf,
}

impl CgroupV2 {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn leaf_path(&self, container_id: &str) -> PathBuf {
        self.root.join(GROUP_PARENT).join(container_id)
    }

    /// Enables every controller on `cgroup.subtree_control` along the
    /// ancestor chain from the root to the leaf's parent, since a v2
    /// controller must be delegated by each ancestor before a descendant
    /// can use it.
    fn enable_controllers_on_ancestors(&self, container_id: &str) -> SudockerResult<()> {
        let directive: String = CONTROLLERS.iter().map(|c| format!("+{c} ")).collect();
        let directive = directive.trim_end().to_string();

        let mut ancestor = self.root.clone();
        std::fs::create_dir_all(&ancestor)?;
        write_best_effort(&ancestor.join("cgroup.subtree_control"), &directive);

        ancestor = ancestor.join(GROUP_PARENT);
        std::fs::create_dir_all(&ancestor)?;
        write_best_effort(&ancestor.join("cgroup.subtree_control"), &directive);

        let _ = container_id;
        Ok(())
    }

    fn current_memory_usage(&self, container_id: &str) -> i64 {
        std::fs::read_to_string(self.leaf_path(container_id).join("memory.current"))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    fn apply_cpu(&self, dir: &Path, r: &Resources) -> SudockerResult<()> {
        let tolerate_eperm = r.cgroup_parent.is_none();
        if r.cpu_quota_us.is_some() || r.cpu_period_us.is_some() {
            let period = r.cpu_period_us.unwrap_or(100_000);
            let quota_str = match r.cpu_quota_us {
                Some(q) if q > 0 => q.to_string(),
                _ => "max".to_string(),
            };
            write_knob(dir, "cpu.max", format!("{quota_str} {period}"), tolerate_eperm)?;
        }
        if let Some(shares) = r.cpu_shares {
            write_knob(dir, "cpu.weight", cpu_shares_to_cpu_weight(shares), tolerate_eperm)?;
        }
        if let Some(idle) = r.cpu_idle {
            write_knob(dir, "cpu.idle", idle as u8, tolerate_eperm)?;
        }
        Ok(())
    }

    fn apply_cpuset(&self, dir: &Path, r: &Resources) -> SudockerResult<()> {
        let tolerate_eperm = r.cgroup_parent.is_none();
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
                write_knob(dir, "memory.max", limit, tolerate_eperm)?;
            } else {
                write_knob(dir, "memory.max", "max", tolerate_eperm)?;
            }
        }
        if let Some(soft) = r.memory_soft_limit_bytes {
            write_knob(dir, "memory.low", soft, tolerate_eperm)?;
        }
        if let Some(swap) = r.memory_swap_bytes {
            let memory = r.memory_limit_bytes.unwrap_or(0);
            let delta = memory_swap_to_v2_value(swap, memory)
                .map_err(SudockerError::InvalidArgument)?;
            let value = if delta < 0 { "max".to_string() } else { delta.to_string() };
            write_knob(dir, "memory.swap.max", value, tolerate_eperm)?;
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

    fn apply_io(&self, dir: &Path, r: &Resources) -> SudockerResult<()> {
        let tolerate_eperm = r.cgroup_parent.is_none();
        if let Some(weight) = r.blkio_weight {
            write_knob(dir, "io.weight", blkio_weight_to_io_weight(weight), tolerate_eperm)?;
        }
        for dev in &r.blkio_devices {
            let mut parts = Vec::new();
            if let Some(v) = dev.read_bps {
                parts.push(format!("rbps={v}"));
            }
            if let Some(v) = dev.write_bps {
                parts.push(format!("wbps={v}"));
            }
            if let Some(v) = dev.read_iops {
                parts.push(format!("riops={v}"));
            }
            if let Some(v) = dev.write_iops {
                parts.push(format!("wiops={v}"));
            }
            if parts.is_empty() {
                continue;
            }
            write_knob(
                dir,
                "io.max",
                format!("{}:{} {}", dev.major, dev.minor, parts.join(" ")),
                tolerate_eperm,
            )?;
        }
        Ok(())
    }

    fn apply_hugetlb(&self, dir: &Path, r: &Resources) -> SudockerResult<()> {
        let tolerate_eperm = r.cgroup_parent.is_none();
        for (page_size, limit) in &r.hugetlb_limits {
            write_knob(dir, &format!("hugetlb.{page_size}.max"), limit, tolerate_eperm)?;
        }
        Ok(())
    }
}

impl Manager for CgroupV2 {
    fn create(&self, container_id: &str, resources: &Resources) -> SudockerResult<()> {
        self.enable_controllers_on_ancestors(container_id)?;
        let dir = self.leaf_path(container_id);
        std::fs::create_dir_all(&dir)?;

        self.apply_cpu(&dir, resources)?;
        self.apply_cpuset(&dir, resources)?;
        self.apply_memory(&dir, resources, 0)?;
        self.apply_pids(&dir, resources)?;
        self.apply_io(&dir, resources)?;
        self.apply_hugetlb(&dir, resources)?;
        Ok(())
    }

    fn apply(&self, container_id: &str, pid: i32) -> SudockerResult<()> {
        write_cgroup_procs(&self.leaf_path(container_id), pid)
    }

    fn update(&self, container_id: &str, resources: &Resources) -> SudockerResult<()> {
        let dir = self.leaf_path(container_id);
        let usage = self.current_memory_usage(container_id);
        self.apply_cpu(&dir, resources)?;
        self.apply_cpuset(&dir, resources)?;
        self.apply_memory(&dir, resources, usage)?;
        self.apply_pids(&dir, resources)?;
        self.apply_io(&dir, resources)?;
        self.apply_hugetlb(&dir, resources)?;
        Ok(())
    }

    fn destroy(&self, container_id: &str) -> SudockerResult<()> {
        remove_path_retrying(&self.leaf_path(container_id))
    }

    fn path(&self, container_id: &str) -> PathBuf {
        self.leaf_path(container_id)
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
        write_knob(dir.path(), "cpu.weight", 100, true).unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("cpu.weight")).unwrap(), "100");
    }

    #[test]
    fn write_knob_propagates_non_eperm_errors_regardless_of_tolerance() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        assert!(write_knob(&missing, "cpu.weight", 100, true).is_err());
        assert!(write_knob(&missing, "cpu.weight", 100, false).is_err());
    }
}

/// `cgroup.subtree_control` rejects directives for controllers the kernel
/// build doesn't have; this write is tolerant of that and ignores errors.
fn write_best_effort(path: &Path, value: &str) {
    let _ = std::fs::write(path, value);
}
