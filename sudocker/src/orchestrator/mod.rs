//! Lifecycle orchestrator: composes the registry, storage driver, network
//! service, and cgroup manager into the `create`/`run`/`start`/`exec`/
//! `stop`/`rm`/`ps`/`logs`/`commit` operations.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use sudocker_shared::{ContainerId, SudockerError, SudockerResult};
use tokio::sync::Semaphore;
use tracing::warn;

use crate::cgroups::{self, Manager as CgroupManager};
use crate::init::{self, ChildStdio, SpawnedChild};
use crate::network::NetworkService;
use crate::registry::{ContainerManager, ContainerStore};
use crate::storage::StorageDriver;
use crate::types::{ContainerInfo, ContainerSpec, ContainerStatus, Endpoint, NetworkInfo, PortMapping};
use crate::util::is_process_alive;

/// Bound on concurrent fan-out for `stop`/`rm` across multiple containers.
const FAN_OUT_LIMIT: usize = 50;

/// Outcome of `run`/`start`: either the container is left running in the
/// background, or it was waited on to completion (tty/foreground mode).
#[derive(Debug)]
pub enum RunOutcome {
    Detached(ContainerId),
    Foreground { id: ContainerId, exit_code: i32 },
}

struct Inner {
    registry: ContainerManager,
    storage: StorageDriver,
    network: NetworkService,
    cgroups: Box<dyn CgroupManager>,
    images_root: PathBuf,
}

/// Composition root for the runtime's core operations. Cheap to clone —
/// internally an `Arc`, so a background monitor task spawned from `run`
/// can hold its own handle.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Lays out the standard persisted-state tree under `data_root` and
    /// detects the host's cgroup version. Replays persisted container
    /// state into the registry's cache (reboot recovery).
    pub fn new(data_root: &std::path::Path) -> SudockerResult<Self> {
        let overlay_root = data_root.join("overlay2");
        let images_root = data_root.join("images");
        let containers_root = data_root.join("containers");
        let networks_dir = data_root.join("network").join("network");
        let ipam_path = data_root.join("network").join("ipam").join("subnet.json");
        let cgroup_root = PathBuf::from("/sys/fs/cgroup");

        std::fs::create_dir_all(&overlay_root)?;
        std::fs::create_dir_all(&images_root)?;
        std::fs::create_dir_all(&containers_root)?;
        std::fs::create_dir_all(&networks_dir)?;

        let registry = ContainerManager::new(ContainerStore::new(containers_root));
        registry.recover()?;

        Ok(Self {
            inner: Arc::new(Inner {
                registry,
                storage: StorageDriver::new(overlay_root, images_root.clone()),
                network: NetworkService::new(networks_dir, ipam_path),
                cgroups: cgroups::detect(cgroup_root)?,
                images_root,
            }),
        })
    }

    pub fn registry(&self) -> &ContainerManager {
        &self.inner.registry
    }

    pub fn network(&self) -> &NetworkService {
        &self.inner.network
    }

    fn storage(&self) -> &StorageDriver {
        &self.inner.storage
    }

    fn cgroups(&self) -> &dyn CgroupManager {
        self.inner.cgroups.as_ref()
    }

    /// `create`: prepares the overlay rootfs and records a `Created`
    /// container. Starts nothing.
    pub fn create(&self, spec: ContainerSpec) -> SudockerResult<ContainerId> {
        self.create_internal(&spec)
    }

    fn create_internal(&self, spec: &ContainerSpec) -> SudockerResult<ContainerId> {
        if spec.command.is_empty() {
            return Err(SudockerError::InvalidArgument("empty command".into()));
        }
        if let Some(name) = &spec.name {
            if self.registry().resolve(name).is_ok() {
                return Err(SudockerError::already_exists("container", name));
            }
        }

        let id = generate_container_id();
        self.storage().prepare(&id, &spec.image, &spec.volumes)?;

        let info = ContainerInfo {
            id: id.clone(),
            pid: None,
            image_name: spec.image.clone(),
            command: spec.command.clone(),
            created_time: chrono::Utc::now(),
            container_name: spec.name.clone(),
            status: ContainerStatus::Created,
            volumes: spec.volumes.clone(),
            port_mapping: spec.ports.clone(),
            ip: None,
            network_name: spec.network_name.clone(),
            spec: Some(spec.clone()),
        };

        match self.registry().record(info) {
            Ok(()) => Ok(id),
            Err(e) => {
                let _ = self.storage().teardown(&id, &spec.image, &spec.volumes);
                Err(e)
            }
        }
    }

    /// `run`: `create` followed immediately by launching the container.
    pub async fn run(&self, spec: ContainerSpec) -> SudockerResult<RunOutcome> {
        let id = self.create_internal(&spec)?;
        self.start_by_id(&id, &spec).await
    }

    /// `start`: re-launches an already-created (or previously stopped)
    /// container from its persisted spec. The overlay rootfs is already
    /// mounted — only `stop`/`rm` unmount it, never `stop` alone — so no
    /// `storage::prepare` call is needed here.
    pub async fn start(&self, id_or_name: &str) -> SudockerResult<RunOutcome> {
        let info = self.registry().get(id_or_name)?;
        let spec = info
            .spec
            .clone()
            .ok_or_else(|| SudockerError::Internal(format!("container {} has no persisted spec", info.id)))?;
        self.start_by_id(&info.id, &spec).await
    }

    async fn start_by_id(&self, id: &str, spec: &ContainerSpec) -> SudockerResult<RunOutcome> {
        let info = self.registry().get(id)?;
        let stdio = if spec.tty {
            ChildStdio::Inherit
        } else {
            ChildStdio::LogFile(self.registry().log_path(id)?)
        };

        let child = self.launch(&info, spec, stdio)?;
        self.registry()
            .update_status(id, ContainerStatus::Running, Some(child.pid.as_raw()))?;

        if spec.detach {
            let this = self.clone();
            let id_owned = info.id.clone();
            let auto_remove = spec.auto_remove;
            tokio::spawn(async move {
                this.monitor_detached(child, id_owned, auto_remove).await;
            });
            Ok(RunOutcome::Detached(info.id))
        } else {
            let exit_code = tokio::task::spawn_blocking(move || child.wait())
                .await
                .map_err(|e| SudockerError::Internal(format!("wait task panicked: {e}")))??;

            self.registry().update_status(id, ContainerStatus::Stopped, None)?;
            if spec.auto_remove {
                self.rm(id, false).await?;
            }
            Ok(RunOutcome::Foreground { id: info.id, exit_code })
        }
    }

    /// Waits on a detached child in the background, flips its status to
    /// `Stopped` on exit, and removes it if it was started with `--rm`.
    async fn monitor_detached(self, child: SpawnedChild, id: String, auto_remove: bool) {
        match tokio::task::spawn_blocking(move || child.wait()).await {
            Ok(Ok(_exit_code)) => {}
            Ok(Err(e)) => warn!(id = %id, error = %e, "detached-container wait failed"),
            Err(e) => {
                warn!(id = %id, error = %e, "detached-container wait task panicked");
                return;
            }
        }
        if let Err(e) = self.registry().update_status(&id, ContainerStatus::Stopped, None) {
            warn!(id = %id, error = %e, "failed to record detached container exit");
        }
        if auto_remove {
            if let Err(e) = self.rm(&id, false).await {
                warn!(id = %id, error = %e, "auto-remove after detached exit failed");
            }
        }
    }

    /// Drives the clone/cgroup/network/sync handshake described for
    /// init-process staging, unwinding whatever was set up so far if any
    /// step fails before the child is released past `procRun`.
    fn launch(&self, info: &ContainerInfo, spec: &ContainerSpec, stdio: ChildStdio) -> SudockerResult<SpawnedChild> {
        let merged = self.storage().merged_path(&info.id, &spec.image);
        let mut child = init::spawn(&merged, false, &spec.env, stdio)?;

        let setup: SudockerResult<Option<Endpoint>> = (|| {
            child.apply_cgroup(self.cgroups(), &info.id, &spec.resources)?;

            let endpoint = match &spec.network_name {
                Some(network_name) => Some(self.network().connect(
                    network_name,
                    &info.id,
                    child.pid.as_raw(),
                    spec.ports.clone(),
                )?),
                None => None,
            };

            child.send_command(&spec.command)?;
            child.await_ready()?;
            Ok(endpoint)
        })();

        match setup {
            Ok(endpoint) => {
                if let Some(ep) = &endpoint {
                    self.registry().update_ip(&info.id, ep.ip.clone())?;
                }
                child.run()?;
                Ok(child)
            }
            Err(e) => {
                let _ = child.kill_before_run();
                let _ = self.cgroups().destroy(&info.id);
                Err(e)
            }
        }
    }

    /// `exec`: joins a running container's namespaces and runs `command`
    /// inside it via the `setns` re-exec. Returns `None` when detached.
    pub fn exec(&self, id_or_name: &str, command: Vec<String>, detach: bool) -> SudockerResult<Option<i32>> {
        if command.is_empty() {
            return Err(SudockerError::InvalidArgument("empty exec command".into()));
        }

        let info = self.registry().get(id_or_name)?;
        if info.status != ContainerStatus::Running {
            return Err(SudockerError::PreconditionFailed(format!(
                "container {} is not running",
                info.id
            )));
        }
        let pid = info
            .pid
            .ok_or_else(|| SudockerError::Internal(format!("running container {} has no pid", info.id)))?;

        let mut child = init::spawn_exec_reentry(pid, &command)?;
        if detach {
            return Ok(None);
        }

        use std::os::unix::process::ExitStatusExt;
        let status = child.wait().map_err(|e| SudockerError::syscall("waitpid", e))?;
        Ok(Some(status.code().unwrap_or_else(|| 128 + status.signal().unwrap_or(0))))
    }

    /// `stop`: SIGTERM, wait up to `grace`, escalate to SIGKILL. A no-op
    /// on a container that is not running (idempotent).
    pub async fn stop(&self, id_or_name: &str, grace: Duration) -> SudockerResult<()> {
        let info = self.registry().get(id_or_name)?;
        if !matches!(info.status, ContainerStatus::Running | ContainerStatus::Paused) {
            return Ok(());
        }
        if let Some(pid) = info.pid {
            crate::util::terminate_then_kill(pid, grace).await;
        }
        self.registry().update_status(&info.id, ContainerStatus::Stopped, None)?;
        Ok(())
    }

    /// Bounded, concurrent `stop` across many containers; results are
    /// returned in the same order as `ids`.
    pub async fn stop_many(&self, ids: Vec<String>, grace: Duration) -> Vec<(String, SudockerResult<()>)> {
        let semaphore = Arc::new(Semaphore::new(FAN_OUT_LIMIT));
        let futures = ids.into_iter().map(|id| {
            let semaphore = semaphore.clone();
            let this = self.clone();
            async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore is never closed");
                let result = this.stop(&id, grace).await;
                (id, result)
            }
        });
        futures::future::join_all(futures).await
    }

    /// `rm`: requires `--force` to remove a running (or paused) container,
    /// killing it in place rather than resuming a paused one first. Then
    /// unwinds overlay, network endpoint, and cgroup state, tolerating
    /// partial failures so a corrupted container still gets removed.
    pub async fn rm(&self, id_or_name: &str, force: bool) -> SudockerResult<()> {
        let info = self.registry().get(id_or_name)?;
        let id = info.id.clone();

        if matches!(info.status, ContainerStatus::Running | ContainerStatus::Paused) {
            if !force {
                return Err(SudockerError::PreconditionFailed(format!(
                    "cannot remove running container {id} (use -f)"
                )));
            }
            if let Some(pid) = info.pid {
                crate::util::kill_process(pid);
                wait_briefly_for_exit(pid, Duration::from_secs(2)).await;
            }
            self.registry().update_status(&id, ContainerStatus::Stopped, None)?;
        }

        let (image, volumes) = match &info.spec {
            Some(spec) => (spec.image.clone(), spec.volumes.clone()),
            None => (info.image_name.clone(), info.volumes.clone()),
        };

        if let Err(e) = self.storage().teardown(&id, &image, &volumes) {
            warn!(id = %id, error = %e, "overlay teardown failed during rm");
        }

        if let (Some(network_name), Some(ip)) = (&info.network_name, &info.ip) {
            let endpoint = reconstruct_endpoint(&id, network_name, ip, &info.port_mapping);
            if let Err(e) = self.network().disconnect(&endpoint) {
                warn!(id = %id, error = %e, "network disconnect failed during rm");
            }
        }

        if let Err(e) = self.cgroups().destroy(&id) {
            warn!(id = %id, error = %e, "cgroup destroy failed during rm");
        }

        self.registry().delete(&id)?;
        Ok(())
    }

    /// Bounded, concurrent `rm` across many containers; results are
    /// returned in the same order as `ids`.
    pub async fn rm_many(&self, ids: Vec<String>, force: bool) -> Vec<(String, SudockerResult<()>)> {
        let semaphore = Arc::new(Semaphore::new(FAN_OUT_LIMIT));
        let futures = ids.into_iter().map(|id| {
            let semaphore = semaphore.clone();
            let this = self.clone();
            async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore is never closed");
                let result = this.rm(&id, force).await;
                (id, result)
            }
        });
        futures::future::join_all(futures).await
    }

    /// `ps`: read-only listing over the registry.
    pub fn ps(&self, all: bool) -> SudockerResult<Vec<ContainerInfo>> {
        self.registry().list(all)
    }

    /// `logs`: the full contents of a container's stdio log file (empty
    /// if the container has never written to it, e.g. a tty container).
    pub fn logs(&self, id_or_name: &str) -> SudockerResult<Vec<u8>> {
        let path = self.registry().log_path(id_or_name)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(SudockerError::Io(e)),
        }
    }

    /// `logs -f`: streams newly appended bytes to `on_chunk` forever,
    /// polling for growth. The caller is expected to run this in a task
    /// it can cancel (e.g. on Ctrl-C).
    pub async fn logs_follow(&self, id_or_name: &str, mut on_chunk: impl FnMut(&[u8])) -> SudockerResult<()> {
        use tokio::io::AsyncReadExt;

        let path = self.registry().log_path(id_or_name)?;
        let mut file = tokio::fs::File::open(&path).await.map_err(SudockerError::Io)?;
        let mut buf = vec![0u8; 8192];
        loop {
            let n = file.read(&mut buf).await.map_err(SudockerError::Io)?;
            if n > 0 {
                on_chunk(&buf[..n]);
            } else {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
    }

    /// `commit`: tars the container's merged rootfs into
    /// `<images_root>/<repo>.tar`, the same shape `ensure_lower_extracted`
    /// expects of a pulled image.
    pub fn commit(&self, id_or_name: &str, reference: &str) -> SudockerResult<PathBuf> {
        let info = self.registry().get(id_or_name)?;
        let image = info.spec.as_ref().map(|s| s.image.clone()).unwrap_or_else(|| info.image_name.clone());
        let merged = self.storage().merged_path(&info.id, &image);

        let repo = reference.split_once(':').map(|(repo, _tag)| repo).unwrap_or(reference);
        let dest = self.inner.images_root.join(format!("{repo}.tar"));

        let file = std::fs::File::create(&dest)?;
        let mut builder = tar::Builder::new(file);
        builder
            .append_dir_all(".", &merged)
            .map_err(|e| SudockerError::Internal(format!("commit: tar build failed: {e}")))?;
        builder
            .finish()
            .map_err(|e| SudockerError::Internal(format!("commit: tar finalize failed: {e}")))?;

        Ok(dest)
    }

    pub fn network_create(&self, name: &str, subnet_cidr: &str) -> SudockerResult<NetworkInfo> {
        self.network().create(name, subnet_cidr)
    }

    pub fn network_list(&self) -> SudockerResult<Vec<NetworkInfo>> {
        self.network().list()
    }

    pub fn network_remove(&self, name: &str) -> SudockerResult<()> {
        self.network().delete(name)
    }
}

/// Rebuilds an [`Endpoint`] from a container's persisted fields. Safe
/// because `host_veth`/`container_veth` are pure functions of the
/// container+network id, so nothing needs to be separately persisted.
fn reconstruct_endpoint(container_id: &str, network_name: &str, ip: &str, ports: &[PortMapping]) -> Endpoint {
    let endpoint_id = Endpoint::make_id(container_id, network_name);
    Endpoint {
        host_veth: format!("veth{}", sudocker_shared::short_id(&endpoint_id)),
        container_veth: Endpoint::container_veth_name(&endpoint_id),
        id: endpoint_id,
        container_id: container_id.to_string(),
        network_name: network_name.to_string(),
        ip: ip.to_string(),
        ports: ports.to_vec(),
    }
}

async fn wait_briefly_for_exit(pid: i32, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if !is_process_alive(pid) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn generate_container_id() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Resources;

    fn orchestrator() -> (tempfile::TempDir, Orchestrator) {
        let dir = tempfile::tempdir().unwrap();
        let orch = Orchestrator::new(dir.path()).unwrap();
        (dir, orch)
    }

    fn sample_spec(image: &str) -> ContainerSpec {
        ContainerSpec {
            image: image.to_string(),
            command: vec!["true".to_string()],
            env: vec![],
            volumes: vec![],
            ports: vec![],
            network_name: None,
            requested_ip: None,
            tty: false,
            detach: true,
            auto_remove: false,
            name: None,
            resources: Resources::default(),
        }
    }

    #[test]
    fn generated_ids_are_sixty_four_hex_chars_and_unique() {
        let a = generate_container_id();
        let b = generate_container_id();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn reconstructed_endpoint_matches_connect_naming() {
        let ep = reconstruct_endpoint("c1", "n1", "10.0.0.5", &[]);
        assert_eq!(ep.id, "c1-n1");
        assert!(ep.host_veth.starts_with("veth"));
        assert!(ep.container_veth.starts_with("cif-"));
    }

    #[test]
    fn create_rejects_empty_command_before_touching_storage() {
        let (_dir, orch) = orchestrator();
        let mut spec = sample_spec("busybox");
        spec.command = vec![];
        let err = orch.create(spec).unwrap_err();
        assert!(matches!(err, SudockerError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn stop_on_unknown_container_is_not_found() {
        let (_dir, orch) = orchestrator();
        let err = orch.stop("nope", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, SudockerError::NotFound { .. }));
    }
}
