//! Overlay storage driver with bind-mount volumes.

mod overlay;
mod volume;

pub use overlay::{PreparedRootfs, StorageDriver};
pub use volume::MountedVolume;

use std::path::Path;
use sudocker_shared::SudockerResult;

/// Tars a container's merged rootfs into `<ref>.tar`, the whole of this
/// runtime's image-build support.
pub fn commit(merged: &Path, dest_tar: &Path) -> SudockerResult<()> {
    let file = std::fs::File::create(dest_tar)?;
    let mut builder = tar::Builder::new(file);
    builder.append_dir_all(".", merged)?;
    builder.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VolumeBinding;

    #[test]
    fn prepare_and_teardown_roundtrip_is_idempotent() {
        let images = tempfile::tempdir().unwrap();
        let overlay_root = tempfile::tempdir().unwrap();

        // Build a trivial image tar with one file.
        let tar_path = images.path().join("busybox.tar");
        {
            let file = std::fs::File::create(&tar_path).unwrap();
            let mut builder = tar::Builder::new(file);
            let src = tempfile::tempdir().unwrap();
            std::fs::write(src.path().join("hello.txt"), b"hi").unwrap();
            builder.append_dir_all(".", src.path()).unwrap();
            builder.finish().unwrap();
        }

        let driver = StorageDriver::new(overlay_root.path().to_path_buf(), images.path().to_path_buf());
        let lower = driver.ensure_lower_extracted("busybox").unwrap();
        assert!(lower.join("hello.txt").exists());

        // A second extraction is a no-op (marker file short-circuits it).
        let lower_again = driver.ensure_lower_extracted("busybox").unwrap();
        assert_eq!(lower, lower_again);

        let _ = driver.teardown("c1", "busybox", &[] as &[VolumeBinding]);
    }
}
