//! Bridge network driver: shells out to `ip` and `iptables` rather than
//! speaking netlink directly, keeping the dependency stack free of a
//! netlink crate.

use std::net::Ipv4Addr;

use sudocker_shared::{SudockerError, SudockerResult};
use tracing::{debug, warn};

use crate::ipam::Cidr;
use crate::types::{Endpoint, PortMapping, Proto};

pub struct BridgeDriver;

impl BridgeDriver {
    pub fn new() -> Self {
        Self
    }

    /// Creates the bridge link, assigns it the subnet's gateway address
    /// (first host address), brings it up, and installs a MASQUERADE
    /// rule for outbound traffic.
    pub fn create(&self, name: &str, subnet: &Cidr, gateway: Ipv4Addr) -> SudockerResult<()> {
        run_ip(&["link", "add", name, "type", "bridge"])?;
        run_ip(&["addr", "add", &format!("{gateway}/{}", subnet_prefix(subnet)), "dev", name])?;
        run_ip(&["link", "set", name, "up"])?;

        run_iptables(&[
            "-t", "nat", "-A", "POSTROUTING",
            "-s", &subnet.to_string(),
            "!", "-o", name,
            "-j", "MASQUERADE",
        ])?;

        debug!(bridge = name, subnet = %subnet, gateway = %gateway, "bridge created");
        Ok(())
    }

    /// Removes the bridge link and its MASQUERADE rule. Tolerant of
    /// "link/rule does not exist" so teardown of partially-created state
    /// always makes progress.
    pub fn delete(&self, name: &str, subnet: &Cidr) -> SudockerResult<()> {
        let _ = run_iptables(&[
            "-t", "nat", "-D", "POSTROUTING",
            "-s", &subnet.to_string(),
            "!", "-o", name,
            "-j", "MASQUERADE",
        ]);

        match run_ip(&["link", "del", name]) {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("Cannot find device") => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Creates a veth pair, attaches the host side to the bridge, and
    /// brings the host side up. The container-side peer stays in the
    /// host netns until the orchestrator moves it once the init pid is
    /// known.
    pub fn connect(&self, bridge_name: &str, endpoint: &Endpoint) -> SudockerResult<()> {
        let host_veth = &endpoint.host_veth;
        let peer_veth = &endpoint.container_veth;

        run_ip(&["link", "add", host_veth, "type", "veth", "peer", "name", peer_veth])?;
        run_ip(&["link", "set", host_veth, "master", bridge_name])?;
        run_ip(&["link", "set", host_veth, "up"])?;

        debug!(bridge = bridge_name, host_veth, peer_veth, "endpoint connected");
        Ok(())
    }

    /// Removes the host-side veth link, which takes both ends of the
    /// pair down with it.
    pub fn disconnect(&self, endpoint: &Endpoint) -> SudockerResult<()> {
        match run_ip(&["link", "del", &endpoint.host_veth]) {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("Cannot find device") => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Installs (or, with `remove = true`, removes) the DNAT rule for
    /// one port publication. Idempotent: `iptables -D` on a missing rule
    /// is tolerated.
    pub fn configure_port_mapping(
        &self,
        bridge_name: &str,
        endpoint_ip: Ipv4Addr,
        port: &PortMapping,
        remove: bool,
    ) -> SudockerResult<()> {
        let action = if remove { "-D" } else { "-A" };
        let proto = match port.proto {
            Proto::Tcp => "tcp",
            Proto::Udp => "udp",
        };

        let args = [
            "-t", "nat", action, "PREROUTING",
            "!", "-i", bridge_name,
            "-p", proto,
            "-m", proto,
            "--dport", &port.host_port.to_string(),
            "-j", "DNAT",
            "--to-destination", &format!("{endpoint_ip}:{}", port.container_port),
        ];

        match run_iptables(&args) {
            Ok(()) => Ok(()),
            Err(_) if remove => Ok(()), // removal of a missing rule is a no-op
            Err(e) => Err(e),
        }
    }
}

fn subnet_prefix(subnet: &Cidr) -> u8 {
    // host_count() == 2^(32-prefix); recover prefix from that.
    32 - (subnet.host_count() as u32).trailing_zeros() as u8
}

fn run_ip(args: &[&str]) -> SudockerResult<()> {
    run_command("ip", args)
}

fn run_iptables(args: &[&str]) -> SudockerResult<()> {
    run_command("iptables", args)
}

fn run_command(program: &str, args: &[&str]) -> SudockerResult<()> {
    let output = std::process::Command::new(program)
        .args(args)
        .output()
        .map_err(|e| SudockerError::syscall(program_name_to_static(program), e))?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        warn!(program, args = ?args, stderr, "command failed");
        Err(SudockerError::syscall(program_name_to_static(program), stderr))
    }
}

fn program_name_to_static(program: &str) -> &'static str {
    match program {
        "ip" => "ip",
        "iptables" => "iptables",
        _ => "exec",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnet_prefix_recovers_from_host_count() {
        let c: Cidr = "10.42.0.0/24".parse().unwrap();
        assert_eq!(subnet_prefix(&c), 24);
        let c: Cidr = "10.42.0.0/30".parse().unwrap();
        assert_eq!(subnet_prefix(&c), 30);
    }
}
