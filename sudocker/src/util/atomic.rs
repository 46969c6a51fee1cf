//! Crash-safe file writes: write to a sibling tempfile, then `rename(2)`
//! over the destination. Used by the IPAM bitmap, the container registry,
//! and the network service — every JSON file this crate persists goes
//! through here so "torn file on crash" is ruled out in one place.

use std::path::Path;

use sudocker_shared::SudockerResult;

pub fn atomic_write(path: &Path, contents: &[u8]) -> SudockerResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    use std::io::Write;
    tmp.write_all(contents)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_creates_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("file.json");

        atomic_write(&path, b"{\"a\":1}").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"{\"a\":1}");

        atomic_write(&path, b"{\"a\":2}").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"{\"a\":2}");
    }
}
