//! Bind-mount volumes: create both sides, bind-mount, and tear down
//! with `MNT_DETACH`.

use std::path::{Path, PathBuf};

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use sudocker_shared::{SudockerError, SudockerResult};
use tracing::debug;

use crate::types::VolumeBinding;

/// A single bind-mounted volume, active for the lifetime of the
/// container's merged rootfs.
pub struct MountedVolume {
    target: PathBuf,
}

impl MountedVolume {
    /// Creates both directories (mode 0777) and bind-mounts
    /// `binding.host_path` onto `merged/binding.container_path`.
    pub fn mount(merged: &Path, binding: &VolumeBinding) -> SudockerResult<Self> {
        let source = PathBuf::from(&binding.host_path);
        let target = merged.join(binding.container_path.trim_start_matches('/'));

        create_dir_0777(&source)?;
        create_dir_0777(&target)?;

        mount(Some(&source), &target, None::<&str>, MsFlags::MS_BIND, None::<&str>).map_err(|e| {
            SudockerError::syscall(
                "mount",
                format!("bind {} -> {}: {e}", source.display(), target.display()),
            )
        })?;

        debug!(source = %source.display(), target = %target.display(), "volume bind-mounted");

        Ok(Self { target })
    }

    /// Unmounts the volume. Safe to call more than once (idempotent
    /// teardown).
    pub fn unmount(&self) -> SudockerResult<()> {
        match umount2(&self.target, MntFlags::MNT_DETACH) {
            Ok(()) => Ok(()),
            Err(nix::errno::Errno::EINVAL) => Ok(()), // already unmounted
            Err(e) => Err(SudockerError::syscall("umount2", format!("{}: {e}", self.target.display()))),
        }
    }
}

fn create_dir_0777(path: &Path) -> SudockerResult<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::create_dir_all(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777))?;
    Ok(())
}
