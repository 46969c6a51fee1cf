//! Container registry: persists per-container info and exposes a
//! thread-safe in-memory view over it.

mod manager;
mod store;

pub use manager::ContainerManager;
pub use store::ContainerStore;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContainerInfo, ContainerStatus};

    fn sample(id: &str, name: &str) -> ContainerInfo {
        ContainerInfo {
            id: id.to_string(),
            pid: None,
            image_name: "busybox".to_string(),
            command: vec!["true".to_string()],
            created_time: chrono::Utc::now(),
            container_name: Some(name.to_string()),
            status: ContainerStatus::Created,
            volumes: vec![],
            port_mapping: vec![],
            ip: None,
            network_name: None,
            spec: None,
        }
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = ContainerManager::new(ContainerStore::new(dir.path().to_path_buf()));

        mgr.record(sample("1111111111", "collide")).unwrap();
        let err = mgr.record(sample("2222222222", "collide")).unwrap_err();
        assert!(matches!(err, sudocker_shared::SudockerError::AlreadyExists { .. }));
    }

    #[test]
    fn status_round_trips_through_store() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = ContainerManager::new(ContainerStore::new(dir.path().to_path_buf()));
        mgr.record(sample("1111111111", "c1")).unwrap();

        mgr.update_status("c1", ContainerStatus::Running, Some(42)).unwrap();
        let info = mgr.get("1111111111").unwrap();
        assert_eq!(info.status, ContainerStatus::Running);
        assert_eq!(info.pid, Some(42));

        // Reload from disk into a fresh manager to prove persistence.
        let mgr2 = ContainerManager::new(ContainerStore::new(dir.path().to_path_buf()));
        mgr2.recover().unwrap();
        let info2 = mgr2.get("c1").unwrap();
        assert_eq!(info2.status, ContainerStatus::Stopped, "dead pid recovers to Stopped");
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = ContainerManager::new(ContainerStore::new(dir.path().to_path_buf()));
        mgr.record(sample("1111111111", "c1")).unwrap();
        let err = mgr.update_status("c1", ContainerStatus::Paused, None).unwrap_err();
        assert!(matches!(err, sudocker_shared::SudockerError::Internal(_)));
    }
}
