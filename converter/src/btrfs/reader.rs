// Pass 1: parse the btrfs volume into the in-memory file model.
//
// Walk order: superblock, chunk bootstrap, chunk tree, root tree (to
// find the FS and extent tree roots), FS tree (inodes, directory links,
// file extents, xattrs), extent tree (used-block statistics), then the
// post-walk fixups (symlink targets, root directory lookup).

use std::collections::HashSet;

use log::{debug, info, warn};

use fsmorph_core::{BlockDevice, ConvertError};

use crate::model::{
    ChildLink, Compression, ExtentKind, FileEntry, FileExtent, FsInfo, InodeIdx, Timespec,
    UsedBlockMap, USED_FLAG_DATA,
};

use super::chunk_map::ChunkMap;
use super::structures::{
    DirItem, DiskKey, ExtentItem, FileExtentItem, InodeItem, InodeRef, RootItem,
    DIR_INDEX_KEY, EXTENT_DATA_KEY, EXTENT_FLAG_TREE_BLOCK, EXTENT_ITEM_KEY, EXTENT_TREE_OBJECTID,
    FIRST_FREE_OBJECTID, FS_TREE_OBJECTID, INODE_ITEM_KEY, INODE_REF_KEY, METADATA_ITEM_KEY,
    PATH_MAX, ROOT_ITEM_KEY, XATTR_ITEM_KEY,
};
use super::superblock::BtrfsSuperblock;
use super::tree::{self, WalkAction};

/// Everything pass 1 produces.
pub struct ReadOutcome {
    pub superblock: BtrfsSuperblock,
    pub chunks: ChunkMap,
    pub info: FsInfo,
}

/// Open-addressing index from btrfs objectid to arena slot. Optional:
/// past [`ObjectidIndex::MAX_SLOTS`] it is dropped and lookups fall
/// back to a linear scan of the arena.
struct ObjectidIndex {
    slots: Vec<Option<(u64, usize)>>,
    len: usize,
}

impl ObjectidIndex {
    const MAX_SLOTS: usize = 1 << 26;

    fn new() -> Option<Self> {
        Some(Self {
            slots: vec![None; 256],
            len: 0,
        })
    }

    fn slot_of(&self, objectid: u64) -> usize {
        // Fibonacci multiplier spreads sequential objectids.
        (objectid.wrapping_mul(0x9E37_79B9_7F4A_7C15) as usize) & (self.slots.len() - 1)
    }

    fn get(&self, objectid: u64) -> Option<usize> {
        let mut slot = self.slot_of(objectid);
        loop {
            match self.slots[slot] {
                Some((key, idx)) if key == objectid => return Some(idx),
                Some(_) => slot = (slot + 1) & (self.slots.len() - 1),
                None => return None,
            }
        }
    }

    /// Insert; returns false when the table refused to grow and the
    /// caller should fall back to linear scans.
    fn insert(&mut self, objectid: u64, idx: usize) -> bool {
        if self.len * 4 >= self.slots.len() * 3 {
            if self.slots.len() * 2 > Self::MAX_SLOTS {
                return false;
            }
            let new_len = self.slots.len() * 2;
            let old = std::mem::replace(&mut self.slots, vec![None; new_len]);
            self.len = 0;
            for entry in old.into_iter().flatten() {
                self.insert(entry.0, entry.1);
            }
        }
        let mut slot = self.slot_of(objectid);
        while let Some((key, _)) = self.slots[slot] {
            if key == objectid {
                self.slots[slot] = Some((objectid, idx));
                return true;
            }
            slot = (slot + 1) & (self.slots.len() - 1);
        }
        self.slots[slot] = Some((objectid, idx));
        self.len += 1;
        true
    }
}

struct ReaderState {
    info: FsInfo,
    index: Option<ObjectidIndex>,
    cow_seen: HashSet<u64>,
    block_size: u64,
}

impl ReaderState {
    fn find(&self, objectid: u64) -> Option<InodeIdx> {
        if let Some(index) = &self.index {
            return index.get(objectid).map(InodeIdx);
        }
        // Index unavailable: linear scan of the arena.
        self.info
            .entries
            .iter()
            .position(|e| e.ino == objectid)
            .map(InodeIdx)
    }

    fn get_or_insert(&mut self, objectid: u64) -> InodeIdx {
        if let Some(idx) = self.find(objectid) {
            return idx;
        }
        let idx = self.info.entries.len();
        self.info.entries.push(FileEntry {
            ino: objectid,
            ..FileEntry::default()
        });
        if let Some(index) = &mut self.index {
            if !index.insert(objectid, idx) {
                warn!("objectid index exhausted, falling back to linear scans");
                self.index = None;
            }
        }
        InodeIdx(idx)
    }

    fn on_inode_item(&mut self, key: &DiskKey, data: &[u8]) -> Result<(), ConvertError> {
        let item = InodeItem::parse(data)?;
        let idx = self.get_or_insert(key.objectid);
        let entry = self.info.entry_mut(idx);
        entry.mode = item.mode;
        entry.uid = item.uid;
        entry.gid = item.gid;
        entry.nlink = item.nlink;
        entry.size = item.size;
        entry.rdev = item.rdev;
        entry.atime = Timespec {
            sec: item.atime_sec,
            nsec: item.atime_nsec,
        };
        entry.ctime = Timespec {
            sec: item.ctime_sec,
            nsec: item.ctime_nsec,
        };
        entry.mtime = Timespec {
            sec: item.mtime_sec,
            nsec: item.mtime_nsec,
        };
        entry.crtime = Timespec {
            sec: item.otime_sec,
            nsec: item.otime_nsec,
        };
        Ok(())
    }

    fn on_inode_ref(&mut self, key: &DiskKey, data: &[u8]) -> Result<(), ConvertError> {
        // Key offset names the parent; the first reference wins and
        // becomes the primary parent for `..` linkage.
        InodeRef::parse(data)?;
        let idx = self.get_or_insert(key.objectid);
        let entry = self.info.entry_mut(idx);
        if entry.parent_ino == 0 && key.offset != key.objectid {
            entry.parent_ino = key.offset;
        }
        Ok(())
    }

    fn on_dir_index(&mut self, key: &DiskKey, data: &[u8]) -> Result<(), ConvertError> {
        // DIR_INDEX is collision-free (one entry per item), unlike
        // DIR_ITEM, which is why the latter is skipped entirely.
        let item = DirItem::parse(data, 0)?;
        let child = self.get_or_insert(item.location.objectid);
        let name = item.name.to_vec();
        let parent = self.get_or_insert(key.objectid);
        self.info
            .entry_mut(parent)
            .children
            .push(ChildLink {
                name,
                target: child,
            });
        Ok(())
    }

    fn on_extent_data(
        &mut self,
        key: &DiskKey,
        data: &[u8],
        chunks: &ChunkMap,
    ) -> Result<(), ConvertError> {
        let item = FileExtentItem::parse(data)?;
        let kind = ExtentKind::from_raw(item.extent_type).ok_or_else(|| {
            ConvertError::corruption(format!("file extent type {}", item.extent_type))
        })?;
        let compression = Compression::from_raw(item.compression).ok_or_else(|| {
            ConvertError::unsupported(format!("compression type {}", item.compression))
        })?;

        if compression != Compression::None {
            self.info.compression.compressed_bytes += item.disk_num_bytes;
            self.info.compression.uncompressed_bytes += item.ram_bytes;
            match compression {
                Compression::Zlib => self.info.compression.zlib_extents += 1,
                Compression::Lzo => self.info.compression.lzo_extents += 1,
                Compression::Zstd => self.info.compression.zstd_extents += 1,
                Compression::None => {}
            }
        }

        // CoW tracking: a physical range observed more than once is
        // shared between inodes and will need its own copy under ext4.
        if kind != ExtentKind::Inline && item.disk_bytenr != 0 {
            let physical = chunks.resolve(item.disk_bytenr);
            if physical != super::chunk_map::RESOLVE_NOT_FOUND
                && !self.cow_seen.insert(physical)
            {
                self.info.dedup_blocks_needed +=
                    item.num_bytes.div_ceil(self.block_size);
            }
        }

        let idx = self.get_or_insert(key.objectid);
        self.info.entry_mut(idx).extents.push(FileExtent {
            file_offset: key.offset,
            disk_bytenr: item.disk_bytenr,
            disk_num_bytes: item.disk_num_bytes,
            num_bytes: item.num_bytes,
            ram_bytes: item.ram_bytes,
            extent_offset: item.offset,
            compression,
            kind,
            inline_data: item.inline_data,
        });
        Ok(())
    }

    fn on_xattr_item(&mut self, key: &DiskKey, data: &[u8]) -> Result<(), ConvertError> {
        let items = DirItem::parse_all(data)?;
        let idx = self.get_or_insert(key.objectid);
        let entry = self.info.entry_mut(idx);
        for item in items {
            entry
                .xattrs
                .push((item.name.to_vec(), item.data.to_vec()));
        }
        Ok(())
    }
}

pub struct BtrfsReader<'d> {
    device: &'d dyn BlockDevice,
}

impl<'d> BtrfsReader<'d> {
    pub fn new(device: &'d dyn BlockDevice) -> Self {
        Self { device }
    }

    pub fn read(&self) -> Result<ReadOutcome, ConvertError> {
        let sb = BtrfsSuperblock::read(self.device)?;
        info!(
            "btrfs volume '{}': {} bytes total, {} used, nodesize {}",
            sb.label, sb.total_bytes, sb.bytes_used, sb.nodesize
        );

        let mut chunks = ChunkMap::new();
        chunks.init_from_superblock(&sb)?;
        chunks.populate(self.device, &sb)?;

        let (fs_root, extent_root) = self.find_tree_roots(&chunks, &sb)?;
        debug!(
            "fs tree at {:#x} (level {}), extent tree at {:#x} (level {})",
            fs_root.bytenr, fs_root.level, extent_root.bytenr, extent_root.level
        );

        let mut state = ReaderState {
            info: FsInfo {
                label: sb.label.clone(),
                fsid: sb.fsid,
                total_bytes: sb.total_bytes,
                bytes_used: sb.bytes_used,
                sectorsize: sb.sectorsize,
                nodesize: sb.nodesize,
                ..FsInfo::default()
            },
            index: ObjectidIndex::new(),
            cow_seen: HashSet::new(),
            block_size: sb.sectorsize as u64,
        };

        self.walk_fs_tree(&chunks, &sb, &fs_root, &mut state)?;
        self.scan_extent_tree(&chunks, &sb, &extent_root, &mut state);
        self.synthesize_used_blocks(&chunks, &mut state)?;
        self.resolve_symlinks(&mut state)?;

        let root_idx = state.find(FIRST_FREE_OBJECTID).ok_or_else(|| {
            ConvertError::corruption("root directory (objectid 256) not found in FS tree")
        })?;
        if !state.info.entry(root_idx).is_dir() {
            return Err(ConvertError::corruption(
                "objectid 256 is not a directory",
            ));
        }
        state.info.root = Some(root_idx);

        info!(
            "read {} inode(s): {} director{}, {} compressed extent(s), {} dedup block(s) needed",
            state.info.inode_count(),
            state.info.directory_count(),
            if state.info.directory_count() == 1 { "y" } else { "ies" },
            state.info.compression.extent_count(),
            state.info.dedup_blocks_needed,
        );

        Ok(ReadOutcome {
            superblock: sb,
            chunks,
            info: state.info,
        })
    }

    fn find_tree_roots(
        &self,
        chunks: &ChunkMap,
        sb: &BtrfsSuperblock,
    ) -> Result<(RootItem, RootItem), ConvertError> {
        let mut fs_root = None;
        let mut extent_root = None;
        tree::walk(
            self.device,
            chunks,
            sb,
            sb.root,
            sb.root_level,
            &mut |key, data| {
                if key.key_type == ROOT_ITEM_KEY {
                    match key.objectid {
                        FS_TREE_OBJECTID => fs_root = Some(RootItem::parse(data)?),
                        EXTENT_TREE_OBJECTID => extent_root = Some(RootItem::parse(data)?),
                        _ => {}
                    }
                }
                if fs_root.is_some() && extent_root.is_some() {
                    return Ok(WalkAction::Stop);
                }
                Ok(WalkAction::Continue)
            },
        )?;
        let fs_root =
            fs_root.ok_or_else(|| ConvertError::corruption("FS tree root item missing"))?;
        let extent_root = extent_root
            .ok_or_else(|| ConvertError::corruption("extent tree root item missing"))?;
        Ok((fs_root, extent_root))
    }

    fn walk_fs_tree(
        &self,
        chunks: &ChunkMap,
        sb: &BtrfsSuperblock,
        root: &RootItem,
        state: &mut ReaderState,
    ) -> Result<(), ConvertError> {
        tree::walk(
            self.device,
            chunks,
            sb,
            root.bytenr,
            root.level,
            &mut |key, data| {
                match key.key_type {
                    INODE_ITEM_KEY => state.on_inode_item(key, data)?,
                    INODE_REF_KEY => state.on_inode_ref(key, data)?,
                    DIR_INDEX_KEY => state.on_dir_index(key, data)?,
                    EXTENT_DATA_KEY => state.on_extent_data(key, data, chunks)?,
                    XATTR_ITEM_KEY => state.on_xattr_item(key, data)?,
                    _ => {}
                }
                Ok(WalkAction::Continue)
            },
        )
    }

    /// Walk the extent tree for used-space statistics. Failures here
    /// are non-fatal: the allocator consults the map synthesised from
    /// file extents either way, and malformed single items are skipped
    /// without aborting the walk.
    fn scan_extent_tree(
        &self,
        chunks: &ChunkMap,
        sb: &BtrfsSuperblock,
        root: &RootItem,
        state: &mut ReaderState,
    ) {
        let mut extent_map = UsedBlockMap::new();
        let nodesize = sb.nodesize as u64;
        let result = tree::walk(
            self.device,
            chunks,
            sb,
            root.bytenr,
            root.level,
            &mut |key, data| {
                match key.key_type {
                    EXTENT_ITEM_KEY => match ExtentItem::parse(data) {
                        Ok(item) => {
                            let flags = if item.flags & EXTENT_FLAG_TREE_BLOCK != 0 {
                                crate::model::USED_FLAG_METADATA
                            } else {
                                USED_FLAG_DATA
                            };
                            extent_map.add(key.objectid, key.offset, flags);
                        }
                        Err(e) => warn!("skipping malformed extent item: {}", e),
                    },
                    METADATA_ITEM_KEY => {
                        extent_map.add(key.objectid, nodesize, crate::model::USED_FLAG_METADATA)
                    }
                    _ => {}
                }
                Ok(WalkAction::Continue)
            },
        );
        match result {
            Ok(()) => {
                extent_map.normalize();
                state.info.used_blocks_from_extent_tree = true;
                debug!(
                    "extent tree reports {} bytes in {} range(s)",
                    extent_map.total_bytes(),
                    extent_map.ranges().len()
                );
            }
            Err(e) => {
                warn!("extent tree walk failed ({}), using file extents only", e);
            }
        }
    }

    /// Build the used-block map from FS-tree data extents. This is the
    /// map the planner, relocator and allocator consult.
    fn synthesize_used_blocks(
        &self,
        chunks: &ChunkMap,
        state: &mut ReaderState,
    ) -> Result<(), ConvertError> {
        let mut map = UsedBlockMap::new();
        for entry in &state.info.entries {
            for extent in &entry.extents {
                if extent.kind == ExtentKind::Inline || extent.is_hole() {
                    continue;
                }
                let physical = chunks.resolve_checked(extent.disk_bytenr)?;
                map.add(physical, extent.disk_num_bytes, USED_FLAG_DATA);
            }
        }
        map.normalize();
        state.info.used_blocks = map;
        Ok(())
    }

    /// Symlink targets live in the inline payload of the first extent.
    fn resolve_symlinks(&self, state: &mut ReaderState) -> Result<(), ConvertError> {
        for entry in &mut state.info.entries {
            if !entry.is_symlink() {
                continue;
            }
            let extent = entry.extents.first().ok_or_else(|| {
                ConvertError::corruption(format!("symlink {} has no extent", entry.ino))
            })?;
            let payload = extent.inline_data.as_deref().ok_or_else(|| {
                ConvertError::corruption(format!("symlink {} target is not inline", entry.ino))
            })?;
            if payload.is_empty() || payload.len() > PATH_MAX {
                return Err(ConvertError::corruption(format!(
                    "symlink {} target length {}",
                    entry.ino,
                    payload.len()
                )));
            }
            entry.symlink_target = Some(payload.to_vec());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn objectid_index_basic() {
        let mut index = ObjectidIndex::new().unwrap();
        for i in 0..10_000u64 {
            assert!(index.insert(256 + i, i as usize));
        }
        for i in 0..10_000u64 {
            assert_eq!(index.get(256 + i), Some(i as usize));
        }
        assert_eq!(index.get(5), None);
    }

    #[test]
    fn objectid_index_survives_colliding_keys() {
        let mut index = ObjectidIndex::new().unwrap();
        // Multiples of the initial table size all land on few slots.
        for i in 0..512u64 {
            assert!(index.insert(i * 256, i as usize));
        }
        for i in 0..512u64 {
            assert_eq!(index.get(i * 256), Some(i as usize));
        }
    }
}
