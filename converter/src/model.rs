// In-memory file model built by the reader and consumed by the
// relocator and writer.
//
// The inode table is an arena (dense vector); directory children refer
// to other inodes by arena index, which keeps ownership unambiguous
// even when hard links make several directories point at one inode.

use std::collections::HashMap;

/// Index into [`FsInfo::entries`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeIdx(pub usize);

/// Compression applied to a stored extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Zlib,
    Lzo,
    Zstd,
}

impl Compression {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Compression::None),
            1 => Some(Compression::Zlib),
            2 => Some(Compression::Lzo),
            3 => Some(Compression::Zstd),
            _ => None,
        }
    }
}

/// Kind of a file extent item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentKind {
    Inline,
    Regular,
    Prealloc,
}

impl ExtentKind {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(ExtentKind::Inline),
            1 => Some(ExtentKind::Regular),
            2 => Some(ExtentKind::Prealloc),
            _ => None,
        }
    }
}

/// One stored range of a file.
///
/// `disk_bytenr` starts out as a btrfs logical address; the relocator
/// rewrites it when the underlying blocks move. Zero denotes a sparse
/// hole. Inline extents carry their payload in `inline_data` and no
/// disk range.
#[derive(Debug, Clone)]
pub struct FileExtent {
    pub file_offset: u64,
    pub disk_bytenr: u64,
    pub disk_num_bytes: u64,
    /// Bytes of the file this extent covers.
    pub num_bytes: u64,
    /// Uncompressed size of the on-disk data.
    pub ram_bytes: u64,
    /// Offset into the uncompressed extent data where this file range
    /// starts (btrfs extent items may reference a suffix).
    pub extent_offset: u64,
    pub compression: Compression,
    pub kind: ExtentKind,
    pub inline_data: Option<Vec<u8>>,
}

impl FileExtent {
    pub fn is_hole(&self) -> bool {
        self.kind == ExtentKind::Regular && self.disk_bytenr == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timespec {
    pub sec: u64,
    pub nsec: u32,
}

/// Directory entry: name plus a non-owning arena link.
#[derive(Debug, Clone)]
pub struct ChildLink {
    pub name: Vec<u8>,
    pub target: InodeIdx,
}

pub const S_IFMT: u32 = 0o170000;
pub const S_IFSOCK: u32 = 0o140000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFIFO: u32 = 0o010000;

/// One inode read out of the btrfs FS tree.
#[derive(Debug, Clone, Default)]
pub struct FileEntry {
    /// Btrfs objectid.
    pub ino: u64,
    /// Primary parent objectid, used for `..` linkage. Zero until an
    /// INODE_REF names it.
    pub parent_ino: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub size: u64,
    pub rdev: u64,
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
    pub crtime: Timespec,
    pub symlink_target: Option<Vec<u8>>,
    pub extents: Vec<FileExtent>,
    pub children: Vec<ChildLink>,
    pub xattrs: Vec<(Vec<u8>, Vec<u8>)>,
}

impl FileEntry {
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    pub fn is_device(&self) -> bool {
        matches!(self.mode & S_IFMT, S_IFBLK | S_IFCHR)
    }
}

/// One allocated btrfs extent, as seen by the allocator.
#[derive(Debug, Clone, Copy)]
pub struct UsedRange {
    pub start: u64,
    pub length: u64,
    pub flags: u64,
}

pub const USED_FLAG_DATA: u64 = 1;
pub const USED_FLAG_METADATA: u64 = 2;
pub const USED_FLAG_SYSTEM: u64 = 4;

/// Every allocated btrfs extent, sorted and merged. Seeds the ext4
/// allocator so existing data is never overwritten.
#[derive(Debug, Default, Clone)]
pub struct UsedBlockMap {
    ranges: Vec<UsedRange>,
    normalized: bool,
}

impl UsedBlockMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, start: u64, length: u64, flags: u64) {
        if length == 0 {
            return;
        }
        self.ranges.push(UsedRange {
            start,
            length,
            flags,
        });
        self.normalized = false;
    }

    /// Sort by start and merge overlapping or adjacent ranges.
    pub fn normalize(&mut self) {
        if self.normalized {
            return;
        }
        self.ranges.sort_by_key(|r| r.start);
        let mut merged: Vec<UsedRange> = Vec::with_capacity(self.ranges.len());
        for r in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if r.start <= last.start + last.length => {
                    let end = (r.start + r.length).max(last.start + last.length);
                    last.length = end - last.start;
                    last.flags |= r.flags;
                }
                _ => merged.push(r),
            }
        }
        self.ranges = merged;
        self.normalized = true;
    }

    pub fn ranges(&self) -> &[UsedRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.ranges.iter().map(|r| r.length).sum()
    }
}

/// Per-compression-type statistics gathered during pass 1.
#[derive(Debug, Default, Clone)]
pub struct CompressionStats {
    pub zlib_extents: u64,
    pub lzo_extents: u64,
    pub zstd_extents: u64,
    pub compressed_bytes: u64,
    /// Bytes the data will occupy once stored uncompressed.
    pub uncompressed_bytes: u64,
}

impl CompressionStats {
    pub fn extent_count(&self) -> u64 {
        self.zlib_extents + self.lzo_extents + self.zstd_extents
    }

    /// Extra bytes ext4 needs because it stores the data raw.
    pub fn expansion_bytes(&self) -> u64 {
        self.uncompressed_bytes.saturating_sub(self.compressed_bytes)
    }
}

/// Everything the reader learned about the btrfs volume.
#[derive(Debug, Default)]
pub struct FsInfo {
    pub entries: Vec<FileEntry>,
    pub root: Option<InodeIdx>,
    pub label: String,
    pub fsid: [u8; 16],
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub sectorsize: u32,
    pub nodesize: u32,
    /// Extra blocks ext4 needs because CoW-shared extents must be
    /// duplicated.
    pub dedup_blocks_needed: u64,
    pub compression: CompressionStats,
    pub used_blocks: UsedBlockMap,
    /// Whether `used_blocks` came from the extent tree or was
    /// synthesised from FS-tree data extents.
    pub used_blocks_from_extent_tree: bool,
}

impl FsInfo {
    pub fn inode_count(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn entry(&self, idx: InodeIdx) -> &FileEntry {
        &self.entries[idx.0]
    }

    pub fn entry_mut(&mut self, idx: InodeIdx) -> &mut FileEntry {
        &mut self.entries[idx.0]
    }

    pub fn file_count(&self) -> u64 {
        self.entries.iter().filter(|e| !e.is_dir()).count() as u64
    }

    pub fn directory_count(&self) -> u64 {
        self.entries.iter().filter(|e| e.is_dir()).count() as u64
    }

    /// Build a plain objectid lookup map. The reader keeps its own
    /// open-addressing index during the walk; this helper serves the
    /// later passes.
    pub fn objectid_index(&self) -> HashMap<u64, InodeIdx> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.ino, InodeIdx(i)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn used_block_map_merges_overlaps() {
        let mut map = UsedBlockMap::new();
        map.add(8192, 4096, USED_FLAG_DATA);
        map.add(0, 4096, USED_FLAG_DATA);
        map.add(4096, 4096, USED_FLAG_METADATA);
        map.add(20480, 4096, USED_FLAG_DATA);
        map.normalize();
        let ranges = map.ranges();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].start, 0);
        assert_eq!(ranges[0].length, 12288);
        assert_eq!(ranges[1].start, 20480);
    }

    #[test]
    fn mode_classification() {
        let mut e = FileEntry::default();
        e.mode = S_IFDIR | 0o755;
        assert!(e.is_dir());
        e.mode = S_IFLNK | 0o777;
        assert!(e.is_symlink());
        e.mode = S_IFBLK | 0o600;
        assert!(e.is_device());
    }
}
