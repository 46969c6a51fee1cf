//! Process liveness and signal helpers shared by `stop`, `rm` and the
//! registry's reboot-recovery pass.

use std::time::Duration;

/// Sends SIGTERM, then polls for exit up to `grace`, escalating to
/// SIGKILL if the process is still alive afterward.
pub async fn terminate_then_kill(pid: i32, grace: Duration) -> bool {
    if !is_process_alive(pid) {
        return true;
    }

    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !is_process_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    kill_process(pid)
}

/// Sends SIGKILL unconditionally.
///
/// Returns `true` if the process was killed or already gone, `false` if
/// the signal could not be delivered (permission denied).
pub fn kill_process(pid: i32) -> bool {
    unsafe { libc::kill(pid, libc::SIGKILL) == 0 || !is_process_alive(pid) }
}

/// `libc::kill(pid, 0)`: checks existence without signaling.
pub fn is_process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Guards against PID reuse when recovering persisted state after a host
/// reboot: a `pid` is only trusted if `/proc/{pid}/cmdline` still mentions
/// our own re-exec marker and the container id.
pub fn is_same_container_process(pid: i32, container_id: &str) -> bool {
    let cmdline_path = format!("/proc/{pid}/cmdline");
    match std::fs::read_to_string(&cmdline_path) {
        Ok(cmdline) => {
            let args: Vec<&str> = cmdline.split('\0').collect();
            args.iter().any(|a| a.contains("sudocker")) && cmdline.contains(container_id)
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive() {
        assert!(is_process_alive(std::process::id() as i32));
    }

    #[test]
    fn very_high_pid_is_not_alive() {
        assert!(!is_process_alive(i32::MAX - 1));
    }

    #[test]
    fn zero_and_negative_pids_are_never_alive() {
        assert!(!is_process_alive(0));
        assert!(!is_process_alive(-5));
    }
}
