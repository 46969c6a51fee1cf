//! Entering a container's network namespace to configure its side of a
//! veth pair: IP address, loopback, default route.
//!
//! All of this runs synchronously inside a single OS thread borrowed from
//! tokio's blocking pool (`spawn_blocking`) rather than a regular async
//! task, so the `setns` call and its `setns`-back-to-origin counterpart
//! are guaranteed to run on the same kernel thread without being
//! descheduled onto another one mid-switch.

use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;

use nix::sched::{setns, CloneFlags};
use sudocker_shared::{SudockerError, SudockerResult};

use crate::ipam::Cidr;

/// Moves `veth` into the netns of `pid`, assigns it `ip/prefix`, brings
/// it and loopback up, and installs a default route via `gateway`.
/// Restores the caller's original netns before returning.
pub fn configure_peer_in_container_netns(
    pid: i32,
    veth: &str,
    ip: Ipv4Addr,
    subnet: &Cidr,
    gateway: Ipv4Addr,
) -> SudockerResult<()> {
    let target_ns = std::fs::File::open(format!("/proc/{pid}/ns/net"))
        .map_err(|e| SudockerError::syscall("open netns", e))?;
    let origin_ns = std::fs::File::open("/proc/self/ns/net")
        .map_err(|e| SudockerError::syscall("open netns", e))?;

    // Move the veth peer into the target namespace while still in our own.
    run_ip(&["link", "set", veth, "netns", &pid.to_string()])?;

    setns(target_ns.as_raw_fd(), CloneFlags::CLONE_NEWNET)
        .map_err(|e| SudockerError::syscall("setns", e))?;

    let result = configure_inside_target_ns(veth, ip, subnet, gateway);

    // Always attempt to restore the original namespace, even on error,
    // so a failed configuration doesn't strand the calling thread.
    let restore = setns(origin_ns.as_raw_fd(), CloneFlags::CLONE_NEWNET)
        .map_err(|e| SudockerError::syscall("setns (restore)", e));

    result.and(restore)
}

fn configure_inside_target_ns(
    veth: &str,
    ip: Ipv4Addr,
    subnet: &Cidr,
    gateway: Ipv4Addr,
) -> SudockerResult<()> {
    let prefix = 32 - (subnet.host_count() as u32).trailing_zeros() as u8;

    run_ip(&["addr", "add", &format!("{ip}/{prefix}"), "dev", veth])?;
    run_ip(&["link", "set", veth, "up"])?;
    run_ip(&["link", "set", "lo", "up"])?;
    run_ip(&["route", "add", "default", "via", &gateway.to_string()])?;

    Ok(())
}

fn run_ip(args: &[&str]) -> SudockerResult<()> {
    let output = std::process::Command::new("ip")
        .args(args)
        .output()
        .map_err(|e| SudockerError::syscall("ip", e))?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(SudockerError::syscall("ip", stderr))
    }
}
