//! Child-side entrypoint: runs inside the freshly cloned namespaces,
//! prepares the container's view of the filesystem, and `execve`s the
//! user's command. Invoked as `sudocker init` — never meant to be run
//! by a user directly.

use std::os::fd::{FromRawFd, RawFd};
use std::path::Path;

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::unistd::{chdir, pivot_root};
use sudocker_shared::{SudockerError, SudockerResult};
use tracing::{debug, info};

use super::exec_util::{exec, resolve_in_path};
use super::sync::{SyncChannel, SyncMessage};

/// fd 3 always carries the sync channel; fd 4 always carries the
/// command pipe's read end, matching the fixed layout the parent sets
/// up before `clone`.
const SYNC_FD: RawFd = 3;
const COMMAND_PIPE_FD: RawFd = 4;

/// Entry point for the `sudocker init` subcommand. Never returns on
/// success: the final step is `execve` into the user's command.
pub fn run_container_init_process() -> SudockerResult<()> {
    let sync = unsafe { SyncChannel::from_owned_fd(std::os::fd::OwnedFd::from_raw_fd(SYNC_FD)) };

    match run(&sync) {
        Ok(()) => unreachable!("run() only returns via execve or Err"),
        Err(e) => {
            let _ = sync.write(&SyncMessage::Error { message: e.to_string() });
            Err(e)
        }
    }
}

fn run(sync: &SyncChannel) -> SudockerResult<()> {
    setup_mount()?;

    sync.write(&SyncMessage::Ready)?;
    sync.expect(|m| matches!(m, SyncMessage::Run), "procRun")?;

    let command = read_command_from_pipe()?;
    if command.is_empty() {
        return Err(SudockerError::InvalidArgument("empty container command".into()));
    }

    let path = resolve_in_path(&command[0])?;
    info!(command = %command.join(" "), resolved = %path.display(), "execve into container command");

    exec(&path, &command)
}

/// Isolates mount propagation, pivots into the merged rootfs (which must
/// already be the current working directory when this runs), and mounts
/// a fresh `/proc` and `/dev`.
fn setup_mount() -> SudockerResult<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| SudockerError::syscall("mount", format!("remount / private: {e}")))?;

    let pwd = std::env::current_dir().map_err(|e| SudockerError::syscall("getcwd", e))?;
    do_pivot_root(&pwd)?;

    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        None::<&str>,
    )
    .map_err(|e| SudockerError::syscall("mount", format!("/proc: {e}")))?;

    mount(
        Some("tmpfs"),
        "/dev",
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME,
        Some("mode=755"),
    )
    .map_err(|e| SudockerError::syscall("mount", format!("/dev: {e}")))?;

    debug!("container mounts established");
    Ok(())
}

/// `pivot_root` requires `new_root` and `old_root` to live on different
/// filesystems, so `root` is first bind-mounted onto itself.
fn do_pivot_root(root: &Path) -> SudockerResult<()> {
    mount(
        Some(root),
        root,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| SudockerError::syscall("mount", format!("bind {} onto itself: {e}", root.display())))?;

    let pivot_dir = root.join(".pivot_root");
    std::fs::create_dir_all(&pivot_dir).map_err(|e| SudockerError::syscall("mkdir", e))?;

    pivot_root(root, &pivot_dir)
        .map_err(|e| SudockerError::syscall("pivot_root", format!("{} -> {}: {e}", root.display(), pivot_dir.display())))?;

    chdir("/").map_err(|e| SudockerError::syscall("chdir", e))?;

    umount2("/.pivot_root", MntFlags::MNT_DETACH)
        .map_err(|e| SudockerError::syscall("umount2", format!(".pivot_root: {e}")))?;
    std::fs::remove_dir("/.pivot_root").map_err(|e| SudockerError::syscall("rmdir", e))?;

    Ok(())
}

fn read_command_from_pipe() -> SudockerResult<Vec<String>> {
    use std::io::Read;

    let mut pipe = unsafe { std::fs::File::from_raw_fd(COMMAND_PIPE_FD) };
    let mut buf = String::new();
    pipe.read_to_string(&mut buf).map_err(|e| SudockerError::syscall("read", e))?;

    Ok(buf.split(' ').filter(|s| !s.is_empty()).map(str::to_string).collect())
}

