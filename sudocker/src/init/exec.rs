//! `exec` re-entry: joins every namespace of a running container's init
//! process and `execve`s a new command inside it.
//!
//! Driven by two environment variables set before a `/proc/self/exe`
//! self-reexec: `SUDOCKER_EXEC_PID` (target init pid) and
//! `SUDOCKER_EXEC_CMD` (space-joined command). [`maybe_reexec`] is
//! called at binary startup, before argument parsing, and never returns
//! if those variables are present.

use std::fs::File;
use std::os::fd::AsRawFd;

use nix::sched::{setns, CloneFlags};
use sudocker_shared::{SudockerError, SudockerResult};
use tracing::info;

use super::exec_util::{exec, resolve_in_path};

const EXEC_PID_VAR: &str = "SUDOCKER_EXEC_PID";
const EXEC_CMD_VAR: &str = "SUDOCKER_EXEC_CMD";

/// Namespaces joined for `exec`, in join order. `user` is joined last
/// since joining it changes the caller's effective capabilities.
const JOINED_NAMESPACES: &[(&str, CloneFlags)] = &[
    ("mnt", CloneFlags::CLONE_NEWNS),
    ("uts", CloneFlags::CLONE_NEWUTS),
    ("ipc", CloneFlags::CLONE_NEWIPC),
    ("net", CloneFlags::CLONE_NEWNET),
    ("pid", CloneFlags::CLONE_NEWPID),
];

/// Sets the two re-entry environment variables and self-reexecs via
/// `/proc/self/exe`. Called by the orchestrator's `exec` command
/// implementation; never returns on success.
pub fn spawn_exec_reentry(target_pid: i32, command: &[String]) -> SudockerResult<std::process::Child> {
    let exe = std::fs::read_link("/proc/self/exe").map_err(|e| SudockerError::syscall("readlink", e))?;

    let child = std::process::Command::new(exe)
        .env(EXEC_PID_VAR, target_pid.to_string())
        .env(EXEC_CMD_VAR, command.join(" "))
        .spawn()
        .map_err(|e| SudockerError::syscall("spawn", e))?;

    Ok(child)
}

/// Checked at process startup. Returns `Ok(true)` only if this invocation
/// was the no-return branch (it never actually returns `Ok(true)` because
/// a successful `execve` replaces the process image).
pub fn maybe_reexec() -> SudockerResult<bool> {
    let (pid_var, cmd_var) = match (std::env::var(EXEC_PID_VAR), std::env::var(EXEC_CMD_VAR)) {
        (Ok(p), Ok(c)) => (p, c),
        _ => return Ok(false),
    };

    let target_pid: i32 = pid_var
        .parse()
        .map_err(|_| SudockerError::InvalidArgument(format!("bad {EXEC_PID_VAR}: {pid_var}")))?;
    let command: Vec<String> = cmd_var.split(' ').filter(|s| !s.is_empty()).map(str::to_string).collect();

    run_exec_reentry(target_pid, &command)?;
    unreachable!("run_exec_reentry only returns via execve or Err")
}

fn run_exec_reentry(target_pid: i32, command: &[String]) -> SudockerResult<()> {
    if command.is_empty() {
        return Err(SudockerError::InvalidArgument("empty exec command".into()));
    }

    for (ns, flag) in JOINED_NAMESPACES {
        let path = format!("/proc/{target_pid}/ns/{ns}");
        let file = File::open(&path).map_err(|e| SudockerError::syscall("open", format!("{path}: {e}")))?;
        setns(file.as_raw_fd(), *flag).map_err(|e| SudockerError::syscall("setns", format!("{ns}: {e}")))?;
    }

    info!(target_pid, command = %command.join(" "), "exec: joined container namespaces");

    let path = resolve_in_path(&command[0])?;
    exec(&path, command)
}
