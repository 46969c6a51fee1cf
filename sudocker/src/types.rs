//! Core data model, split into an immutable `*Spec` (what the caller
//! asked for) and a mutable `*Info` (what is true right now), so the
//! registry can persist and mutate state independently of the original
//! request.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sudocker_shared::{ContainerId, NetworkId};

/// A `hostPath:containerPath` volume binding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeBinding {
    pub host_path: String,
    pub container_path: String,
}

/// A `hostPort:containerPort/proto` port publication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
    pub proto: Proto,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Proto {
    Tcp,
    Udp,
}

/// Per-device throttle, supplementing the base blkio weight.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BlkioDeviceThrottle {
    pub major: i64,
    pub minor: i64,
    pub read_bps: Option<u64>,
    pub write_bps: Option<u64>,
    pub read_iops: Option<u64>,
    pub write_iops: Option<u64>,
}

/// Every controller knob the cgroup manager may be asked to write. `None`
/// means "do not touch this knob"; `0`/`-1` sentinels used by the CLI are
/// translated to `None`/"unlimited" before reaching this struct.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Resources {
    pub cpu_shares: Option<u64>,
    pub cpu_period_us: Option<u64>,
    pub cpu_quota_us: Option<i64>,
    pub cpu_rt_period_us: Option<u64>,
    pub cpu_rt_runtime_us: Option<i64>,
    pub cpu_idle: Option<bool>,

    pub cpuset_cpus: Option<String>,
    pub cpuset_mems: Option<String>,

    pub memory_limit_bytes: Option<i64>,
    /// Total mem+swap limit (v1 `memory.memsw.limit_in_bytes`); `-1` means
    /// unlimited swap. v2 writes the delta `memory_swap - memory_limit`.
    pub memory_swap_bytes: Option<i64>,
    pub memory_soft_limit_bytes: Option<i64>,
    pub memory_swappiness: Option<u64>,

    pub pids_limit: Option<i64>,

    pub blkio_weight: Option<u16>,
    pub blkio_devices: Vec<BlkioDeviceThrottle>,

    pub hugetlb_limits: HashMap<String, u64>,

    /// `--cgroup-parent`: an explicit cgroup path the caller asked for.
    /// When set, a rootless `EPERM` on a cgroup write is fatal; when
    /// absent (the default managed-parent path), `EPERM` is tolerated.
    pub cgroup_parent: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Stopped,
}

impl ContainerStatus {
    /// Whether `from -> self` is a legal status transition
    /// (`Created -> Running -> Stopped`, with `start` allowing
    /// `Stopped -> Running` again).
    pub fn can_transition_from(self, from: ContainerStatus) -> bool {
        use ContainerStatus::*;
        matches!(
            (from, self),
            (Created, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Stopped)
                | (Paused, Stopped)
                | (Stopped, Running)
        )
    }
}

/// The immutable request a user made via `create`/`run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub volumes: Vec<VolumeBinding>,
    pub ports: Vec<PortMapping>,
    pub network_name: Option<String>,
    pub requested_ip: Option<String>,
    pub tty: bool,
    pub detach: bool,
    pub auto_remove: bool,
    pub name: Option<String>,
    pub resources: Resources,
}

/// Per-container mutable state, persisted by the registry as
/// `config.json`. Field names match the stable on-disk JSON schema
/// exactly, since it is read directly by `ps`/`logs` without going
/// through the in-memory cache on a cold start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: ContainerId,
    pub pid: Option<i32>,
    pub image_name: String,
    pub command: Vec<String>,
    pub created_time: DateTime<Utc>,
    pub container_name: Option<String>,
    pub status: ContainerStatus,
    pub volumes: Vec<VolumeBinding>,
    pub port_mapping: Vec<PortMapping>,
    pub ip: Option<String>,
    pub network_name: Option<String>,

    #[serde(default)]
    pub spec: Option<ContainerSpec>,
}

/// A network's persisted record: always driver `"bridge"` in this
/// implementation, but the field exists so a future second driver has
/// somewhere to read from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub name: NetworkId,
    pub driver: String,
    pub subnet: String,
    pub gateway: String,
    pub created_time: DateTime<Utc>,
}

/// `<containerId>-<networkName>`, owned by the container, weakly
/// referenced by the network for cleanup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: String,
    pub container_id: ContainerId,
    pub network_name: NetworkId,
    pub ip: String,
    pub host_veth: String,
    pub container_veth: String,
    pub ports: Vec<PortMapping>,
}

impl Endpoint {
    pub fn make_id(container_id: &str, network_name: &str) -> String {
        format!("{container_id}-{network_name}")
    }

    /// `cif-<shortEndpointId>`, the peer visible inside the container.
    pub fn container_veth_name(endpoint_id: &str) -> String {
        format!("cif-{}", sudocker_shared::short_id(endpoint_id))
    }
}

/// Absolute paths making up a container's overlay rootfs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayRootfs {
    pub lower: std::path::PathBuf,
    pub upper: std::path::PathBuf,
    pub work: std::path::PathBuf,
    pub merged: std::path::PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_follow_lifecycle() {
        use ContainerStatus::*;
        assert!(Running.can_transition_from(Created));
        assert!(Stopped.can_transition_from(Running));
        assert!(Running.can_transition_from(Stopped));
        assert!(!Created.can_transition_from(Stopped));
        assert!(!Running.can_transition_from(Running));
    }

    #[test]
    fn endpoint_id_and_veth_naming() {
        let id = Endpoint::make_id("c1", "n1");
        assert_eq!(id, "c1-n1");
        let veth = Endpoint::container_veth_name(&id);
        assert!(veth.starts_with("cif-"));
    }
}
