// Bijection between btrfs objectids and ext4 inode numbers.
//
// Entries accumulate in memory and spill to a file-backed region in
// the working directory once they pass the memory limit; the lookup
// hash is an open-addressing table of entry indices built after all
// adds, with a Bloom filter screening misses when the entries live on
// disk.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, info};
use memmap2::MmapMut;

use fsmorph_core::ConvertError;

/// Bytes per serialized entry: objectid + inode number.
const ENTRY_BYTES: usize = 12;
/// Default spill threshold: 60% of total RAM.
const DEFAULT_RAM_FRACTION: f64 = 0.60;
const FALLBACK_MEMORY_LIMIT: u64 = 1 << 30;

const BLOOM_BITS_PER_ENTRY: usize = 10;
const BLOOM_HASHES: u32 = 7;

/// Spill threshold in bytes: the configured megabyte limit, or 60% of
/// system RAM when unset.
pub fn effective_memory_limit(memory_limit_mb: Option<u64>) -> u64 {
    if let Some(mb) = memory_limit_mb {
        return mb << 20;
    }
    total_ram()
        .map(|ram| (ram as f64 * DEFAULT_RAM_FRACTION) as u64)
        .unwrap_or(FALLBACK_MEMORY_LIMIT)
}

#[cfg(target_os = "linux")]
fn total_ram() -> Option<u64> {
    use procfs::Current;
    procfs::Meminfo::current().ok().map(|m| m.mem_total)
}

#[cfg(not(target_os = "linux"))]
fn total_ram() -> Option<u64> {
    None
}

/// Refuse workdirs on RAM-backed filesystems: spilling there would
/// defeat the point of spilling.
#[cfg(target_os = "linux")]
pub fn check_workdir(path: &Path) -> Result<(), ConvertError> {
    use nix::sys::statfs::{statfs, FsType, TMPFS_MAGIC};
    const RAMFS_MAGIC: FsType = FsType(0x858458f6);
    let stat = statfs(path).map_err(|e| {
        ConvertError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("statfs {}: {}", path.display(), e),
        ))
    })?;
    let fs_type = stat.filesystem_type();
    if fs_type == TMPFS_MAGIC || fs_type == RAMFS_MAGIC {
        return Err(ConvertError::MemoryPressure(format!(
            "working directory {} is on a RAM-backed filesystem",
            path.display()
        )));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn check_workdir(_path: &Path) -> Result<(), ConvertError> {
    Ok(())
}

enum Storage {
    Memory(Vec<(u64, u32)>),
    Disk {
        mmap: MmapMut,
        file: File,
        len: usize,
        capacity: usize,
        // Deletes the spill file on drop.
        _path: tempfile::TempPath,
    },
}

impl Storage {
    fn len(&self) -> usize {
        match self {
            Storage::Memory(v) => v.len(),
            Storage::Disk { len, .. } => *len,
        }
    }

    fn get(&self, index: usize) -> (u64, u32) {
        match self {
            Storage::Memory(v) => v[index],
            Storage::Disk { mmap, .. } => {
                let off = index * ENTRY_BYTES;
                let key = u64::from_le_bytes(mmap[off..off + 8].try_into().unwrap());
                let value = u32::from_le_bytes(mmap[off + 8..off + 12].try_into().unwrap());
                (key, value)
            }
        }
    }

    fn push(&mut self, key: u64, value: u32) -> Result<(), ConvertError> {
        match self {
            Storage::Memory(v) => {
                v.push((key, value));
                Ok(())
            }
            Storage::Disk {
                mmap,
                file,
                len,
                capacity,
                ..
            } => {
                if *len == *capacity {
                    // Expand via remap.
                    *capacity *= 2;
                    file.set_len((*capacity * ENTRY_BYTES) as u64)?;
                    *mmap = unsafe { MmapMut::map_mut(&*file)? };
                }
                let off = *len * ENTRY_BYTES;
                mmap[off..off + 8].copy_from_slice(&key.to_le_bytes());
                mmap[off + 8..off + 12].copy_from_slice(&value.to_le_bytes());
                *len += 1;
                Ok(())
            }
        }
    }

    fn is_disk(&self) -> bool {
        matches!(self, Storage::Disk { .. })
    }
}

struct BloomFilter {
    bits: Vec<u64>,
    bit_count: u64,
}

impl BloomFilter {
    fn new(entries: usize) -> Self {
        let bit_count = (entries.max(1) * BLOOM_BITS_PER_ENTRY) as u64;
        Self {
            bits: vec![0u64; bit_count.div_ceil(64) as usize],
            bit_count,
        }
    }

    fn positions(&self, key: u64) -> impl Iterator<Item = u64> + '_ {
        let h1 = key.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        let h2 = key.wrapping_mul(0xC2B2_AE3D_27D4_EB4F) | 1;
        (0..BLOOM_HASHES).map(move |i| h1.wrapping_add(h2.wrapping_mul(i as u64)) % self.bit_count)
    }

    fn insert(&mut self, key: u64) {
        let positions: Vec<u64> = self.positions(key).collect();
        for pos in positions {
            self.bits[(pos / 64) as usize] |= 1 << (pos % 64);
        }
    }

    fn might_contain(&self, key: u64) -> bool {
        self.positions(key)
            .all(|pos| self.bits[(pos / 64) as usize] & (1 << (pos % 64)) != 0)
    }
}

pub struct InodeMap {
    storage: Storage,
    /// Entry indices, open-addressed by objectid.
    hash: Vec<u32>,
    bloom: Option<BloomFilter>,
    memory_limit: u64,
    workdir: PathBuf,
}

const HASH_EMPTY: u32 = u32::MAX;

impl InodeMap {
    pub fn new(workdir: PathBuf, memory_limit: u64) -> Self {
        Self {
            storage: Storage::Memory(Vec::new()),
            hash: Vec::new(),
            bloom: None,
            memory_limit,
            workdir,
        }
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.len() == 0
    }

    pub fn add(&mut self, btrfs_ino: u64, ext4_ino: u32) -> Result<(), ConvertError> {
        if let Storage::Memory(v) = &self.storage {
            if (v.len() + 1) * ENTRY_BYTES > self.memory_limit as usize {
                self.spill_to_disk()?;
            }
        }
        self.storage.push(btrfs_ino, ext4_ino)
    }

    fn spill_to_disk(&mut self) -> Result<(), ConvertError> {
        check_workdir(&self.workdir)?;
        let entries = match &self.storage {
            Storage::Memory(v) => v.clone(),
            Storage::Disk { .. } => return Ok(()),
        };
        let capacity = (entries.len() * 2).max(1024);
        let mut file = tempfile::Builder::new()
            .prefix("inode-map-")
            .tempfile_in(&self.workdir)?;
        file.as_file_mut()
            .set_len((capacity * ENTRY_BYTES) as u64)?;
        file.flush()?;
        let (file, path) = file.into_parts();
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        for (i, (key, value)) in entries.iter().enumerate() {
            let off = i * ENTRY_BYTES;
            mmap[off..off + 8].copy_from_slice(&key.to_le_bytes());
            mmap[off + 8..off + 12].copy_from_slice(&value.to_le_bytes());
        }
        info!(
            "inode map spilled to {} ({} entries)",
            self.workdir.display(),
            entries.len()
        );
        self.storage = Storage::Disk {
            mmap,
            file,
            len: entries.len(),
            capacity,
            _path: path,
        };
        Ok(())
    }

    /// Build the lookup table: size `max(128, 2n)`, Fibonacci-hashed
    /// start slot, linear probing.
    pub fn build_hash(&mut self) {
        let count = self.storage.len();
        let size = (count * 2).max(128);
        self.hash = vec![HASH_EMPTY; size];
        for i in 0..count {
            let (key, _) = self.storage.get(i);
            let mut slot = Self::start_slot(key, size);
            while self.hash[slot] != HASH_EMPTY {
                slot = (slot + 1) % size;
            }
            self.hash[slot] = i as u32;
        }
        if self.storage.is_disk() {
            let mut bloom = BloomFilter::new(count);
            for i in 0..count {
                bloom.insert(self.storage.get(i).0);
            }
            self.bloom = Some(bloom);
        }
        debug!(
            "inode map hash built: {} entries in {} slots{}",
            count,
            size,
            if self.bloom.is_some() { ", bloom-filtered" } else { "" }
        );
    }

    fn start_slot(key: u64, size: usize) -> usize {
        (key.wrapping_mul(0x9E37_79B9_7F4A_7C15) % size as u64) as usize
    }

    /// The mapped ext4 inode number, or 0 when the objectid is unknown.
    pub fn lookup(&self, btrfs_ino: u64) -> u32 {
        if let Some(bloom) = &self.bloom {
            if !bloom.might_contain(btrfs_ino) {
                return 0;
            }
        }
        if self.hash.is_empty() {
            // Hash not built yet: linear scan.
            for i in 0..self.storage.len() {
                let (key, value) = self.storage.get(i);
                if key == btrfs_ino {
                    return value;
                }
            }
            return 0;
        }
        let size = self.hash.len();
        let mut slot = Self::start_slot(btrfs_ino, size);
        loop {
            let index = self.hash[slot];
            if index == HASH_EMPTY {
                return 0;
            }
            let (key, value) = self.storage.get(index as usize);
            if key == btrfs_ino {
                return value;
            }
            slot = (slot + 1) % size;
        }
    }

    /// Iterate all `(btrfs_ino, ext4_ino)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u32)> + '_ {
        (0..self.storage.len()).map(|i| self.storage.get(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_with_limit(limit: u64) -> InodeMap {
        InodeMap::new(std::env::temp_dir(), limit)
    }

    #[test]
    fn lookup_returns_mapped_values_and_zero_on_miss() {
        let mut map = map_with_limit(1 << 20);
        map.add(256, 2).unwrap();
        for i in 0..1000u64 {
            map.add(257 + i, 11 + i as u32).unwrap();
        }
        map.build_hash();
        assert_eq!(map.lookup(256), 2);
        assert_eq!(map.lookup(257), 11);
        assert_eq!(map.lookup(1256), 1010);
        assert_eq!(map.lookup(9999), 0);
        assert_eq!(map.lookup(0), 0);
    }

    #[test]
    fn hundred_thousand_entries() {
        let mut map = map_with_limit(64 << 20);
        for i in 0..100_000u64 {
            map.add(256 + i, 11 + i as u32).unwrap();
        }
        map.build_hash();
        for i in (0..100_000u64).step_by(997) {
            assert_eq!(map.lookup(256 + i), 11 + i as u32);
        }
        assert_eq!(map.lookup(1_000_000), 0);
    }

    #[test]
    fn worst_case_keys_multiples_of_table_size() {
        let mut map = map_with_limit(1 << 20);
        // 2*count slots; keys all multiples of a power of two land in
        // few start slots and exercise the probe chain.
        for i in 0..512u64 {
            map.add(i * 1024, (i + 11) as u32).unwrap();
        }
        map.build_hash();
        for i in 0..512u64 {
            assert_eq!(map.lookup(i * 1024), (i + 11) as u32);
        }
        assert_eq!(map.lookup(511 * 1024 + 1), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn spill_to_disk_preserves_lookups() {
        // A limit of 600 bytes forces the spill after 50 entries.
        let mut map = map_with_limit(1);
        map.memory_limit = 600;
        for i in 0..5000u64 {
            map.add(256 + i, 11 + i as u32).unwrap();
        }
        assert!(map.storage.is_disk());
        map.build_hash();
        assert!(map.bloom.is_some());
        for i in (0..5000u64).step_by(101) {
            assert_eq!(map.lookup(256 + i), 11 + i as u32);
        }
        assert_eq!(map.lookup(42), 0);
    }
}
