//! Network service: a thin JSON-persisted layer over [`BridgeDriver`]
//! plus the netns plumbing that `Connect` requires.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use sudocker_shared::{SudockerError, SudockerResult};
use tracing::info;

use crate::ipam::{Cidr, SubnetAllocator};
use crate::types::{Endpoint, NetworkInfo, PortMapping};

use super::bridge::BridgeDriver;
use super::netns::configure_peer_in_container_netns;

pub struct NetworkService {
    networks_dir: PathBuf,
    ipam: SubnetAllocator,
    driver: BridgeDriver,
}

impl NetworkService {
    pub fn new(networks_dir: PathBuf, ipam_path: PathBuf) -> Self {
        Self {
            networks_dir,
            ipam: SubnetAllocator::new(ipam_path),
            driver: BridgeDriver::new(),
        }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.networks_dir.join(name)
    }

    pub fn create(&self, name: &str, subnet_cidr: &str) -> SudockerResult<NetworkInfo> {
        if self.path_for(name).exists() {
            return Err(SudockerError::already_exists("network", name));
        }

        let subnet: Cidr = subnet_cidr.parse()?;
        let gateway = self.ipam.allocate(&subnet)?;

        self.driver.create(name, &subnet, gateway)?;

        let info = NetworkInfo {
            name: name.to_string(),
            driver: "bridge".to_string(),
            subnet: subnet.to_string(),
            gateway: gateway.to_string(),
            created_time: chrono::Utc::now(),
        };

        crate::util::atomic_write(&self.path_for(name), serde_json::to_vec_pretty(&info)?.as_slice())?;
        info!(network = name, subnet = %subnet, gateway = %gateway, "network created");
        Ok(info)
    }

    pub fn get(&self, name: &str) -> SudockerResult<NetworkInfo> {
        let bytes = std::fs::read(self.path_for(name))
            .map_err(|_| SudockerError::not_found("network", name))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn list(&self) -> SudockerResult<Vec<NetworkInfo>> {
        if !self.networks_dir.exists() {
            return Ok(Vec::new());
        }
        let mut result = Vec::new();
        for entry in std::fs::read_dir(&self.networks_dir)? {
            let entry = entry?;
            match std::fs::read(entry.path()).ok().and_then(|b| serde_json::from_slice(&b).ok()) {
                Some(info) => result.push(info),
                None => tracing::warn!(path = %entry.path().display(), "skipping malformed network entry"),
            }
        }
        Ok(result)
    }

    pub fn delete(&self, name: &str) -> SudockerResult<()> {
        let info = self.get(name)?;
        let subnet: Cidr = info.subnet.parse()?;
        let gateway: Ipv4Addr = info.gateway.parse().map_err(|_| {
            SudockerError::Internal(format!("persisted gateway for {name} is not an IPv4 address"))
        })?;

        self.ipam.release(&subnet, gateway)?;
        self.driver.delete(name, &subnet)?;
        std::fs::remove_file(self.path_for(name))?;
        Ok(())
    }

    /// Allocates an IP, attaches the veth pair to the bridge, then
    /// (once the container's init pid is known) enters its netns to
    /// finish configuration and installs any port mappings.
    pub fn connect(
        &self,
        network_name: &str,
        container_id: &str,
        container_pid: i32,
        ports: Vec<PortMapping>,
    ) -> SudockerResult<Endpoint> {
        let network = self.get(network_name)?;
        let subnet: Cidr = network.subnet.parse()?;
        let gateway: Ipv4Addr = network.gateway.parse().map_err(|_| {
            SudockerError::Internal(format!("persisted gateway for {network_name} is not IPv4"))
        })?;

        let ip = self.ipam.allocate(&subnet)?;

        let endpoint_id = Endpoint::make_id(container_id, network_name);
        let endpoint = Endpoint {
            id: endpoint_id.clone(),
            container_id: container_id.to_string(),
            network_name: network_name.to_string(),
            ip: ip.to_string(),
            host_veth: format!("veth{}", sudocker_shared::short_id(&endpoint_id)),
            container_veth: Endpoint::container_veth_name(&endpoint_id),
            ports,
        };

        self.driver.connect(network_name, &endpoint)?;

        configure_peer_in_container_netns(
            container_pid,
            &endpoint.container_veth,
            ip,
            &subnet,
            gateway,
        )?;

        for port in &endpoint.ports {
            self.driver.configure_port_mapping(network_name, ip, port, false)?;
        }

        Ok(endpoint)
    }

    /// Removes port mappings, detaches the veth, and releases the IP.
    /// Tolerant of partial state so `rm -f` always makes progress.
    pub fn disconnect(&self, endpoint: &Endpoint) -> SudockerResult<()> {
        let network = self.get(&endpoint.network_name)?;
        let subnet: Cidr = network.subnet.parse()?;
        let ip: Ipv4Addr = endpoint.ip.parse().map_err(|_| {
            SudockerError::Internal(format!("endpoint {} has non-IPv4 address", endpoint.id))
        })?;

        for port in &endpoint.ports {
            let _ = self.driver.configure_port_mapping(&endpoint.network_name, ip, port, true);
        }

        self.driver.disconnect(endpoint)?;
        self.ipam.release(&subnet, ip)?;
        Ok(())
    }
}
