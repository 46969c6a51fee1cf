//! IPAM — subnet bitmap allocator.
//!
//! State is a single JSON file mapping CIDR string to a bitmap string (one
//! character per host address, `'0'` free / `'1'` allocated). Persistence
//! is write-through: every `allocate`/`release` call reads the whole file,
//! mutates one bit, and rewrites it atomically. No in-memory cache
//! outlives a call; concurrent callers serialize on a file lock held for
//! the duration of the read-modify-write.

mod cidr;

pub use cidr::Cidr;

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Read;
use std::path::{Path, PathBuf};

use nix::fcntl::{flock, FlockArg};
use std::os::unix::io::AsRawFd;
use sudocker_shared::{SudockerError, SudockerResult};

/// CIDR -> bitmap string, exactly the on-disk shape.
type BitmapFile = HashMap<String, String>;

pub struct SubnetAllocator {
    path: PathBuf,
}

impl SubnetAllocator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Allocates the first free host address in `subnet`, excluding the
    /// network address (index 0). The gateway has no reserved slot of its
    /// own: `NetworkService::create` calls this same method first when a
    /// network is created, so the gateway naturally claims index 1 (the
    /// subnet's first host address) and every later caller scans past it.
    pub fn allocate(&self, subnet: &Cidr) -> SudockerResult<std::net::Ipv4Addr> {
        let _guard = self.lock()?;
        let mut file = self.load()?;

        let len = subnet.host_count();
        let bitmap = file
            .entry(subnet.to_string())
            .or_insert_with(|| "0".repeat(len));

        if bitmap.len() != len {
            return Err(SudockerError::Internal(format!(
                "bitmap length {} does not match subnet host count {}",
                bitmap.len(),
                len
            )));
        }

        // Index 0 (network) is never handed out; treat it as
        // pre-allocated so a fresh bitmap still reports exhaustion
        // correctly for tiny subnets.
        let reserved = 1usize.min(len);
        let bytes = unsafe { bitmap.as_bytes_mut() };
        for b in bytes.iter_mut().take(reserved) {
            *b = b'1';
        }

        let idx = bytes
            .iter()
            .position(|&b| b == b'0')
            .ok_or_else(|| SudockerError::ResourceExhausted(format!("subnet {subnet} exhausted")))?;

        bytes[idx] = b'1';
        self.save(&file)?;

        Ok(subnet.address_at(idx))
    }

    /// Releases a previously allocated IP back to the pool.
    pub fn release(&self, subnet: &Cidr, ip: std::net::Ipv4Addr) -> SudockerResult<()> {
        let _guard = self.lock()?;
        let mut file = self.load()?;

        let idx = subnet
            .index_of(ip)
            .ok_or_else(|| SudockerError::InvalidArgument(format!("{ip} not in subnet {subnet}")))?;

        let bitmap = file.get_mut(&subnet.to_string()).ok_or_else(|| {
            SudockerError::InvalidArgument(format!("subnet {subnet} has no allocations"))
        })?;

        if idx >= bitmap.len() {
            return Err(SudockerError::InvalidArgument(format!("{ip} not in subnet {subnet}")));
        }

        unsafe { bitmap.as_bytes_mut()[idx] = b'0' };
        self.save(&file)
    }

    fn load(&self) -> SudockerResult<BitmapFile> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let mut buf = Vec::new();
        std::fs::File::open(&self.path)?.read_to_end(&mut buf)?;
        if buf.is_empty() {
            return Ok(HashMap::new());
        }
        Ok(serde_json::from_slice(&buf)?)
    }

    fn save(&self, file: &BitmapFile) -> SudockerResult<()> {
        crate::util::atomic_write(&self.path, serde_json::to_vec(file)?.as_slice())
    }

    /// Holds an exclusive `flock` on a sidecar `.lock` file for the
    /// duration of a read-modify-write, serializing concurrent allocators
    /// across processes.
    fn lock(&self) -> SudockerResult<std::fs::File> {
        let lock_path = self.path.with_extension("lock");
        if let Some(dir) = lock_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let f = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)?;
        flock(f.as_raw_fd(), FlockArg::LockExclusive)
            .map_err(|e| SudockerError::syscall("flock", e))?;
        Ok(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> (tempfile::TempDir, SubnetAllocator) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subnet.json");
        let alloc = SubnetAllocator::new(path);
        (dir, alloc)
    }

    #[test]
    fn allocate_then_release_round_trips() {
        let (_dir, alloc) = allocator();
        let subnet: Cidr = "10.42.0.0/24".parse().unwrap();

        let ip1 = alloc.allocate(&subnet).unwrap();
        let ip2 = alloc.allocate(&subnet).unwrap();
        assert_ne!(ip1, ip2);

        alloc.release(&subnet, ip1).unwrap();
        let ip3 = alloc.allocate(&subnet).unwrap();
        assert_eq!(ip1, ip3, "released address should be reused first");
    }

    #[test]
    fn first_allocation_claims_the_first_host_address() {
        let (_dir, alloc) = allocator();
        let subnet: Cidr = "10.42.0.0/24".parse().unwrap();
        let gateway = alloc.allocate(&subnet).unwrap();
        assert_eq!(gateway, subnet.address_at(1));
    }

    #[test]
    fn slash_31_subnet_has_exactly_one_usable_address() {
        let (_dir, alloc) = allocator();
        let subnet: Cidr = "10.0.0.0/31".parse().unwrap();
        // The gateway's own allocate() call claims the lone usable slot.
        let gateway = alloc.allocate(&subnet).unwrap();
        assert_eq!(gateway, subnet.address_at(1));
        let err = alloc.allocate(&subnet).unwrap_err();
        assert!(matches!(err, SudockerError::ResourceExhausted(_)));
    }

    #[test]
    fn release_of_ip_outside_subnet_is_invalid_argument() {
        let (_dir, alloc) = allocator();
        let subnet: Cidr = "10.42.0.0/24".parse().unwrap();
        alloc.allocate(&subnet).unwrap();
        let err = alloc
            .release(&subnet, "10.99.0.5".parse().unwrap())
            .unwrap_err();
        assert!(matches!(err, SudockerError::InvalidArgument(_)));
    }

    #[test]
    fn exhaustion_matches_two_to_the_host_bits_minus_two() {
        let (_dir, alloc) = allocator();
        // /30 has 4 addresses: index 0 reserved, index 1 goes to the
        // gateway, leaving 2^(32-30)-2 = 2 usable host addresses.
        let subnet: Cidr = "192.168.50.0/30".parse().unwrap();
        alloc.allocate(&subnet).unwrap(); // gateway, index 1
        alloc.allocate(&subnet).unwrap(); // host, index 2
        alloc.allocate(&subnet).unwrap(); // host, index 3
        let err = alloc.allocate(&subnet).unwrap_err();
        assert!(matches!(err, SudockerError::ResourceExhausted(_)));
    }
}
