//! JSON-file persistence for container info, one file per container at
//! `<infoRoot>/<id>/config.json`, written atomically.

use std::path::PathBuf;

use sudocker_shared::{ContainerId, SudockerError, SudockerResult};
use tracing::warn;

use crate::types::ContainerInfo;

pub struct ContainerStore {
    info_root: PathBuf,
}

impl ContainerStore {
    pub fn new(info_root: PathBuf) -> Self {
        Self { info_root }
    }

    fn config_path(&self, id: &str) -> PathBuf {
        self.info_root.join(id).join("config.json")
    }

    pub fn log_path(&self, id: &str) -> PathBuf {
        self.info_root.join(id).join(format!("{id}-json.log"))
    }

    pub fn save(&self, info: &ContainerInfo) -> SudockerResult<()> {
        crate::util::atomic_write(&self.config_path(&info.id), serde_json::to_vec_pretty(info)?.as_slice())
    }

    pub fn get(&self, id: &str) -> SudockerResult<ContainerInfo> {
        let bytes = std::fs::read(self.config_path(id))
            .map_err(|_| SudockerError::not_found("container", id))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Enumerates every persisted container, skipping (and warning on)
    /// malformed entries rather than failing the whole listing.
    pub fn list(&self) -> SudockerResult<Vec<ContainerInfo>> {
        if !self.info_root.exists() {
            return Ok(Vec::new());
        }

        let mut result = Vec::new();
        for entry in std::fs::read_dir(&self.info_root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let config_path = entry.path().join("config.json");
            match std::fs::read(&config_path) {
                Ok(bytes) => match serde_json::from_slice(&bytes) {
                    Ok(info) => result.push(info),
                    Err(e) => warn!(path = %config_path.display(), error = %e, "skipping malformed container entry"),
                },
                Err(_) => continue, // directory without a config.json isn't a container
            }
        }
        Ok(result)
    }

    pub fn delete(&self, id: &ContainerId) -> SudockerResult<()> {
        let dir = self.info_root.join(id);
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        Ok(())
    }
}
