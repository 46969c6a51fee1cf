//! Orchestrator-side half of the init handshake: clones the container
//! process into a fresh set of namespaces, applies cgroups, hands it its
//! command, and drives the `procReady`/`procRun` exchange.

use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::path::Path;

use nix::sched::CloneFlags;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use sudocker_shared::SudockerResult;
use sudocker_shared::SudockerError;
use tracing::{debug, info, warn};

use crate::cgroups::Manager as CgroupManager;
use crate::types::Resources;

use super::sync::{SyncChannel, SyncMessage};

/// Explicit lifecycle states the parent walks the spawned child through.
/// Each transition method below asserts the expected predecessor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildLifecycleState {
    SpawnedChild,
    CgroupApplied,
    CommandSent,
    ChildReady,
    ChildRunning,
}

pub struct SpawnedChild {
    pub pid: Pid,
    state: ChildLifecycleState,
    sync: SyncChannel,
    command_pipe_write: Option<OwnedFd>,
}

/// Namespace flags requested for every container; user namespace is
/// opt-in since it requires `/etc/sub{u,g}id` entries most hosts lack.
pub fn clone_flags(with_user_ns: bool) -> CloneFlags {
    let mut flags = CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWNET
        | CloneFlags::CLONE_NEWIPC;
    if with_user_ns {
        flags |= CloneFlags::CLONE_NEWUSER;
    }
    flags
}

/// Whether the child's stdio is inherited from the parent (foreground,
/// `-t`/`-i`) or redirected to a per-container log file (detached).
pub enum ChildStdio {
    Inherit,
    LogFile(std::path::PathBuf),
}

/// Spawns the container init process inside a fresh set of namespaces.
/// `merged_rootfs` becomes the child's working directory, which
/// `init::child::setup_mount` then pivots into. `env` is applied in the
/// child before it proceeds to mount setup, so `execve` later inherits it.
pub fn spawn(
    merged_rootfs: &Path,
    with_user_ns: bool,
    env: &[(String, String)],
    stdio: ChildStdio,
) -> SudockerResult<SpawnedChild> {
    let (command_read, command_write) =
        nix::unistd::pipe().map_err(|e| SudockerError::syscall("pipe", e))?;
    let (parent_sync, child_sync) = SyncChannel::pair()?;

    let flags = clone_flags(with_user_ns);
    let merged_rootfs = merged_rootfs.to_path_buf();
    let child_sync_fd = child_sync.as_raw_fd();
    let command_read_fd = command_read.as_raw_fd();
    let env = env.to_vec();

    let mut stack = vec![0u8; 1024 * 1024];

    let child_fn = Box::new(move || -> isize {
        if let ChildStdio::LogFile(path) = &stdio {
            if redirect_stdio_to_log(path).is_err() {
                return 1;
            }
        }
        if std::env::set_current_dir(&merged_rootfs).is_err() {
            return 1;
        }
        if dup_fixed_fds(child_sync_fd, command_read_fd).is_err() {
            return 1;
        }
        for (key, value) in &env {
            std::env::set_var(key, value);
        }
        match crate::init::child::run_container_init_process() {
            Ok(()) => 0,
            Err(_) => 1,
        }
    });

    let pid = unsafe {
        nix::sched::clone(child_fn, &mut stack, flags, Some(libc::SIGCHLD))
            .map_err(|e| SudockerError::syscall("clone", e))?
    };

    // The child's copies of these fds were duplicated onto 3/4 and the
    // originals are no longer needed on the parent's side except for
    // `parent_sync`/`command_write`, which the parent keeps.
    drop(child_sync);
    drop(command_read);

    info!(pid = pid.as_raw(), "container process cloned into new namespaces");

    Ok(SpawnedChild {
        pid,
        state: ChildLifecycleState::SpawnedChild,
        sync: parent_sync,
        command_pipe_write: Some(command_write),
    })
}

/// Duplicates `sync_fd`/`command_fd` onto the fixed descriptors 3 and 4
/// that the child entrypoint reads from. Runs after `clone`, before any
/// other child-side setup.
fn dup_fixed_fds(sync_fd: RawFd, command_fd: RawFd) -> std::io::Result<()> {
    use nix::unistd::dup2;
    dup2(sync_fd, 3).map_err(std::io::Error::from)?;
    dup2(command_fd, 4).map_err(std::io::Error::from)?;
    Ok(())
}

/// Opens (creating/appending) `path` and duplicates it onto stdout and
/// stderr, for detached-mode containers whose output is collected by
/// `logs` rather than shown on a terminal.
fn redirect_stdio_to_log(path: &Path) -> std::io::Result<()> {
    use nix::unistd::dup2;
    use std::os::unix::fs::OpenOptionsExt;

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o644)
        .open(path)?;
    let fd = file.as_raw_fd();
    dup2(fd, 1).map_err(std::io::Error::from)?;
    dup2(fd, 2).map_err(std::io::Error::from)?;
    Ok(())
}

impl SpawnedChild {
    /// Creates the cgroup tree and attaches this pid, before the child
    /// is allowed to proceed past `procRun`.
    pub fn apply_cgroup(&mut self, manager: &dyn CgroupManager, container_id: &str, resources: &Resources) -> SudockerResult<()> {
        assert_eq!(self.state, ChildLifecycleState::SpawnedChild);
        manager.create(container_id, resources)?;
        manager.apply(container_id, self.pid.as_raw())?;
        self.state = ChildLifecycleState::CgroupApplied;
        Ok(())
    }

    /// Writes the space-joined command line to the pipe and closes it,
    /// signaling EOF to the child's blocking read.
    pub fn send_command(&mut self, command: &[String]) -> SudockerResult<()> {
        assert_eq!(self.state, ChildLifecycleState::CgroupApplied);
        use std::io::Write;

        let fd = self
            .command_pipe_write
            .take()
            .ok_or_else(|| SudockerError::Internal("command pipe already consumed".into()))?;
        let mut file = std::fs::File::from(fd);
        let joined = command.join(" ");
        file.write_all(joined.as_bytes()).map_err(|e| SudockerError::syscall("write", e))?;
        drop(file); // closes the write end, the child's read sees EOF

        self.state = ChildLifecycleState::CommandSent;
        Ok(())
    }

    /// Blocks for `procReady` from the child.
    pub fn await_ready(&mut self) -> SudockerResult<()> {
        assert_eq!(self.state, ChildLifecycleState::CommandSent);
        self.sync.expect(|m| matches!(m, SyncMessage::Ready), "procReady")?;
        self.state = ChildLifecycleState::ChildReady;
        Ok(())
    }

    /// Unblocks the child past its setup barrier.
    pub fn run(&mut self) -> SudockerResult<()> {
        assert_eq!(self.state, ChildLifecycleState::ChildReady);
        self.sync.write(&SyncMessage::Run)?;
        self.state = ChildLifecycleState::ChildRunning;
        debug!(pid = self.pid.as_raw(), "container released to exec");
        Ok(())
    }

    /// Cooperative cancellation before `procRun`: SIGKILL and reap.
    pub fn kill_before_run(&mut self) -> SudockerResult<()> {
        let _ = nix::sys::signal::kill(self.pid, Signal::SIGKILL);
        let _ = waitpid(self.pid, None);
        Ok(())
    }

    /// Non-blocking liveness check, used by the orchestrator's
    /// detached-mode monitor.
    pub fn try_wait(&self) -> SudockerResult<Option<i32>> {
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(WaitStatus::Exited(_, code)) => Ok(Some(code)),
            Ok(WaitStatus::Signaled(_, sig, _)) => Ok(Some(128 + sig as i32)),
            Ok(_) => Ok(None),
            Err(e) => {
                warn!(pid = self.pid.as_raw(), error = %e, "waitpid failed");
                Err(SudockerError::syscall("waitpid", e))
            }
        }
    }

    /// Blocking wait for the foreground/tty path: blocks until the child
    /// exits and returns its exit code (128+signal for a signal death).
    pub fn wait(&self) -> SudockerResult<i32> {
        match waitpid(self.pid, None) {
            Ok(WaitStatus::Exited(_, code)) => Ok(code),
            Ok(WaitStatus::Signaled(_, sig, _)) => Ok(128 + sig as i32),
            Ok(other) => Err(SudockerError::Internal(format!(
                "unexpected wait status for pid {}: {other:?}",
                self.pid.as_raw()
            ))),
            Err(e) => {
                warn!(pid = self.pid.as_raw(), error = %e, "waitpid failed");
                Err(SudockerError::syscall("waitpid", e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_ns_flag_is_opt_in() {
        let without = clone_flags(false);
        let with = clone_flags(true);
        assert!(!without.contains(CloneFlags::CLONE_NEWUSER));
        assert!(with.contains(CloneFlags::CLONE_NEWUSER));
    }

    #[test]
    fn base_namespaces_are_always_requested() {
        let flags = clone_flags(false);
        for f in [
            CloneFlags::CLONE_NEWUTS,
            CloneFlags::CLONE_NEWPID,
            CloneFlags::CLONE_NEWNS,
            CloneFlags::CLONE_NEWNET,
            CloneFlags::CLONE_NEWIPC,
        ] {
            assert!(flags.contains(f));
        }
    }

    #[test]
    fn lifecycle_states_are_ordered_distinctly() {
        let states = [
            ChildLifecycleState::SpawnedChild,
            ChildLifecycleState::CgroupApplied,
            ChildLifecycleState::CommandSent,
            ChildLifecycleState::ChildReady,
            ChildLifecycleState::ChildRunning,
        ];
        for (i, a) in states.iter().enumerate() {
            for (j, b) in states.iter().enumerate() {
                assert_eq!(i == j, a == b);
            }
        }
    }
}
