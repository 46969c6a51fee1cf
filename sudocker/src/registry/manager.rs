//! Container registry: an in-memory cache backed by [`ContainerStore`],
//! following a "store-first" discipline — every mutation persists to
//! disk before the cache is updated, so a crash between the two never
//! leaves the cache ahead of truth on disk.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use sudocker_shared::{ContainerId, SudockerError, SudockerResult};
use tracing::{debug, info};

use crate::types::{ContainerInfo, ContainerStatus};
use crate::util::{is_process_alive, is_same_container_process};

use super::store::ContainerStore;

#[derive(Clone)]
pub struct ContainerManager {
    inner: Arc<RwLock<Inner>>,
}

struct Inner {
    containers: HashMap<ContainerId, ContainerInfo>,
    store: ContainerStore,
}

impl ContainerManager {
    pub fn new(store: ContainerStore) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                containers: HashMap::new(),
                store,
            })),
        }
    }

    fn read(&self) -> SudockerResult<std::sync::RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|e| SudockerError::Internal(format!("registry lock poisoned: {e}")))
    }

    fn write(&self) -> SudockerResult<std::sync::RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|e| SudockerError::Internal(format!("registry lock poisoned: {e}")))
    }

    /// Loads every persisted container from disk into the cache.
    /// Any container whose recorded pid is no longer alive (or whose pid
    /// was recycled by an unrelated process across a host reboot) is
    /// flipped to `Stopped`.
    pub fn recover(&self) -> SudockerResult<()> {
        let mut inner = self.write()?;
        for mut info in inner.store.list()? {
            if info.status == ContainerStatus::Running {
                let alive = info
                    .pid
                    .map(|pid| is_process_alive(pid) && is_same_container_process(pid, &info.id))
                    .unwrap_or(false);

                if !alive {
                    debug!(id = %info.id, "recovered container's init pid is gone; marking stopped");
                    info.status = ContainerStatus::Stopped;
                    info.pid = None;
                    inner.store.save(&info)?;
                }
            }
            inner.containers.insert(info.id.clone(), info);
        }
        Ok(())
    }

    pub fn record(&self, info: ContainerInfo) -> SudockerResult<()> {
        let mut inner = self.write()?;

        if inner.containers.contains_key(&info.id) {
            return Err(SudockerError::already_exists("container", &info.id));
        }
        if let Some(name) = &info.container_name {
            if inner.containers.values().any(|c| c.container_name.as_deref() == Some(name)) {
                return Err(SudockerError::already_exists("container", name));
            }
        }

        inner.store.save(&info)?;
        info!(id = %info.id, name = ?info.container_name, "container registered");
        inner.containers.insert(info.id.clone(), info);
        Ok(())
    }

    /// Resolves a user-supplied id or name to the full, canonical id.
    pub fn resolve(&self, id_or_name: &str) -> SudockerResult<ContainerId> {
        let inner = self.read()?;
        if inner.containers.contains_key(id_or_name) {
            return Ok(id_or_name.to_string());
        }
        inner
            .containers
            .values()
            .find(|c| c.container_name.as_deref() == Some(id_or_name))
            .map(|c| c.id.clone())
            .ok_or_else(|| SudockerError::not_found("container", id_or_name))
    }

    pub fn get(&self, id_or_name: &str) -> SudockerResult<ContainerInfo> {
        let id = self.resolve(id_or_name)?;
        let inner = self.read()?;
        inner
            .containers
            .get(&id)
            .cloned()
            .ok_or_else(|| SudockerError::not_found("container", id_or_name))
    }

    pub fn list(&self, all: bool) -> SudockerResult<Vec<ContainerInfo>> {
        let inner = self.read()?;
        let mut items: Vec<_> = inner
            .containers
            .values()
            .filter(|c| all || c.status != ContainerStatus::Stopped)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.created_time.cmp(&b.created_time));
        Ok(items)
    }

    /// Mutates a container's status, enforcing the legal-transition
    /// invariant.
    pub fn update_status(&self, id_or_name: &str, new_status: ContainerStatus, pid: Option<i32>) -> SudockerResult<()> {
        let id = self.resolve(id_or_name)?;
        let mut inner = self.write()?;

        let current = inner
            .containers
            .get(&id)
            .ok_or_else(|| SudockerError::not_found("container", &id))?;

        if !new_status.can_transition_from(current.status) {
            return Err(SudockerError::Internal(format!(
                "illegal status transition {:?} -> {:?} for {id}",
                current.status, new_status
            )));
        }

        let mut updated = current.clone();
        updated.status = new_status;
        updated.pid = pid;

        inner.store.save(&updated)?;
        inner.containers.insert(id, updated);
        Ok(())
    }

    pub fn update_ip(&self, id_or_name: &str, ip: String) -> SudockerResult<()> {
        let id = self.resolve(id_or_name)?;
        let mut inner = self.write()?;
        let mut updated = inner
            .containers
            .get(&id)
            .ok_or_else(|| SudockerError::not_found("container", &id))?
            .clone();
        updated.ip = Some(ip);
        inner.store.save(&updated)?;
        inner.containers.insert(id, updated);
        Ok(())
    }

    pub fn delete(&self, id_or_name: &str) -> SudockerResult<()> {
        let id = self.resolve(id_or_name)?;
        let mut inner = self.write()?;
        inner.store.delete(&id)?;
        inner.containers.remove(&id);
        Ok(())
    }

    pub fn log_path(&self, id_or_name: &str) -> SudockerResult<std::path::PathBuf> {
        let id = self.resolve(id_or_name)?;
        Ok(self.read()?.store.log_path(&id))
    }
}
