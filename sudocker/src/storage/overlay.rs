//! Overlay storage driver: a shared, once-per-image `lower` layer
//! and a per-container `upper`/`work`/`merged` triad mounted with
//! overlayfs, plus bind-mounted volumes layered on top.

use std::path::{Path, PathBuf};

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use sudocker_shared::{SudockerError, SudockerResult};
use tracing::{debug, warn};

use super::volume::MountedVolume;
use crate::types::{OverlayRootfs, VolumeBinding};

pub struct StorageDriver {
    overlay_root: PathBuf,
    images_root: PathBuf,
}

impl StorageDriver {
    pub fn new(overlay_root: PathBuf, images_root: PathBuf) -> Self {
        Self { overlay_root, images_root }
    }

    fn lower_dir(&self, image: &str) -> PathBuf {
        self.images_root.join(format!("{image}-lower"))
    }

    fn paths(&self, container_id: &str, image: &str) -> OverlayRootfs {
        let root = self.overlay_root.join(container_id);
        OverlayRootfs {
            lower: self.lower_dir(image),
            upper: root.join("upper"),
            work: root.join("work"),
            merged: root.join("merged"),
        }
    }

    /// The merged rootfs path for an already-`prepare`d container, for
    /// callers that need to locate it without re-running `prepare`.
    pub fn merged_path(&self, container_id: &str, image: &str) -> PathBuf {
        self.paths(container_id, image).merged
    }

    /// Extracts `<image>.tar` into the shared lower directory exactly
    /// once (checked via a marker file so re-runs are cheap idempotent
    /// no-ops, matching "per-image: decompress exactly once").
    pub fn ensure_lower_extracted(&self, image: &str) -> SudockerResult<PathBuf> {
        let lower = self.lower_dir(image);
        let marker = lower.join(".extracted");
        if marker.exists() {
            return Ok(lower);
        }

        std::fs::create_dir_all(&lower)?;
        let tar_path = self.images_root.join(format!("{image}.tar"));
        let file = std::fs::File::open(&tar_path).map_err(|e| {
            SudockerError::NotFound {
                kind: "image",
                id: format!("{image} ({}): {e}", tar_path.display()),
            }
        })?;

        let mut archive = tar::Archive::new(file);
        archive.unpack(&lower).map_err(|e| {
            SudockerError::Internal(format!("failed to extract image {image}: {e}"))
        })?;

        std::fs::write(&marker, b"")?;
        debug!(image, lower = %lower.display(), "image extracted into shared lower layer");
        Ok(lower)
    }

    /// Prepares a container's overlay rootfs and mounts every requested
    /// volume. On any failure, everything mounted so far is unwound
    /// before returning.
    pub fn prepare(
        &self,
        container_id: &str,
        image: &str,
        volumes: &[VolumeBinding],
    ) -> SudockerResult<PreparedRootfs> {
        self.ensure_lower_extracted(image)?;
        let paths = self.paths(container_id, image);

        create_dir_0777(&paths.upper)?;
        create_dir_0777(&paths.work)?;
        create_dir_0777(&paths.merged)?;

        let options = format!(
            "lowerdir={},upperdir={},workdir={}",
            paths.lower.display(),
            paths.upper.display(),
            paths.work.display()
        );

        mount(
            Some("overlay"),
            &paths.merged,
            Some("overlay"),
            MsFlags::empty(),
            Some(options.as_str()),
        )
        .map_err(|e| SudockerError::syscall("mount", format!("overlay on {}: {e}", paths.merged.display())))?;

        let mut mounted_volumes: Vec<MountedVolume> = Vec::with_capacity(volumes.len());
        for binding in volumes {
            match MountedVolume::mount(&paths.merged, binding) {
                Ok(mounted) => mounted_volumes.push(mounted),
                Err(e) => {
                    // Unwind everything mounted so far, bottom-up.
                    for v in mounted_volumes.iter().rev() {
                        let _ = v.unmount();
                    }
                    let _ = umount2(&paths.merged, MntFlags::MNT_DETACH);
                    return Err(e);
                }
            }
        }

        Ok(PreparedRootfs { paths })
    }

    /// Reverses `prepare` strictly bottom-up: volumes, then `merged`,
    /// then removes `upper`/`work`/`merged`. The shared `lower` is never
    /// touched. Idempotent: a second call on an already-torn-down
    /// container is a no-op.
    pub fn teardown(&self, container_id: &str, image: &str, volumes: &[VolumeBinding]) -> SudockerResult<()> {
        let paths = self.paths(container_id, image);

        for binding in volumes {
            let target = paths.merged.join(binding.container_path.trim_start_matches('/'));
            match umount2(&target, MntFlags::MNT_DETACH) {
                Ok(()) | Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => {}
                Err(e) => warn!(target = %target.display(), error = %e, "volume unmount failed during teardown"),
            }
        }

        match umount2(&paths.merged, MntFlags::MNT_DETACH) {
            Ok(()) | Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => {}
            Err(e) => warn!(merged = %paths.merged.display(), error = %e, "overlay unmount failed during teardown"),
        }

        for dir in [&paths.upper, &paths.work, &paths.merged] {
            if dir.exists() {
                std::fs::remove_dir_all(dir)?;
            }
        }
        if let Some(root) = paths.merged.parent() {
            let _ = std::fs::remove_dir(root); // only succeeds once empty
        }

        Ok(())
    }
}

pub struct PreparedRootfs {
    pub paths: OverlayRootfs,
}

fn create_dir_0777(path: &Path) -> SudockerResult<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::create_dir_all(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777))?;
    Ok(())
}
