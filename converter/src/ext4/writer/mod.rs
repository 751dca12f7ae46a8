// Pass 3: emit the ext4 filesystem.
//
// Write order: superblock (and sparse-super backups), group descriptor
// tables, inode tables, bitmaps, directory content, journal, then the
// free-count update and a final sync. The journal's location is decided
// up front so inode 8 can be written together with the rest of the
// inode tables; its blocks are filled later in the sequence.

pub mod directory;
pub mod extent_tree;
pub mod inode_table;
pub mod journal;

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};

use fsmorph_core::{BatchWriter, BlockDevice, ConvertError};

use crate::btrfs::decompress::DecompressCtx;
use crate::inode_map::InodeMap;
use crate::model::{FsInfo, InodeIdx};

use super::alloc::BlockAllocator;
use super::bitmap::Bitmap;
use super::checksum;
use super::constants::*;
use super::layout::Ext4Layout;
use super::structures::{
    file_type_of_mode, get_u32, Ext4GroupDesc, Ext4Inode, Ext4Superblock, ExtentHeader,
};
use directory::{DirChild, DirShape, DirectoryWriter};
use extent_tree::{ExtentTreeBuilder, ResolvedRun};
use inode_table::{
    build_xattr_area, encode_fast_symlink, encode_rdev, translate_base, INLINE_DATA_MAX,
};
use journal::JournalLocation;

pub struct WriteStats {
    pub inodes_written: u32,
    pub directories_written: u32,
    pub journal_blocks: u64,
}

struct PlannedDir {
    ino: u32,
    parent_ino: u32,
    children: Vec<DirChild>,
    shape: DirShape,
    blocks: Vec<u64>,
}

pub struct Ext4Writer<'a> {
    device: &'a dyn BlockDevice,
    layout: &'a Ext4Layout,
    fs: &'a mut FsInfo,
    inode_map: &'a InodeMap,
    alloc: BlockAllocator,
    journal: JournalLocation,
    uuid: [u8; 16],
    csum_seed: u32,
    hash_seed: [u32; 4],
    now: u32,
    uses_inline_data: bool,
    superblock: Ext4Superblock,
    group_descs: Vec<Ext4GroupDesc>,
    inode_bitmaps: Vec<Bitmap>,
    /// On-disk block bitmap content per group, kept for the free-count
    /// pass.
    block_bitmaps: Vec<Bitmap>,
    /// Rollback checkpoint blocks: allocator-reserved but reported
    /// free on disk, so the checkpoint survives until something
    /// overwrites it after mount.
    checkpoint: (u64, u64),
    planned_dirs: Vec<PlannedDir>,
}

impl<'a> Ext4Writer<'a> {
    pub fn new(
        device: &'a dyn BlockDevice,
        layout: &'a Ext4Layout,
        fs: &'a mut FsInfo,
        inode_map: &'a InodeMap,
        mut alloc: BlockAllocator,
        checkpoint: (u64, u64),
    ) -> Result<Self, ConvertError> {
        let journal = journal::plan_journal(device.size(), layout, &mut alloc, checkpoint.0)?;

        let uuid = *uuid::Uuid::new_v4().as_bytes();
        let csum_seed = checksum::crc32c_ext4(&uuid, !0);
        let hash_seed: [u32; 4] = rand::random();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);

        let uses_inline_data = fs.entries.iter().any(|e| {
            e.is_regular()
                && e.size <= INLINE_DATA_MAX as u64
                && e.extents.len() == 1
                && e.extents[0].inline_data.is_some()
        });

        let mut volume_name = [0u8; 16];
        let label = fs.label.as_bytes();
        let n = label.len().min(16);
        volume_name[..n].copy_from_slice(&label[..n]);

        let mut incompat = FEATURE_INCOMPAT_FILETYPE
            | FEATURE_INCOMPAT_EXTENTS
            | FEATURE_INCOMPAT_64BIT
            | FEATURE_INCOMPAT_FLEX_BG
            | FEATURE_INCOMPAT_CSUM_SEED;
        if uses_inline_data {
            incompat |= FEATURE_INCOMPAT_INLINE_DATA;
        }

        let superblock = Ext4Superblock {
            s_inodes_count: layout.total_inodes,
            s_blocks_count: layout.total_blocks,
            s_r_blocks_count: layout.total_blocks / 20,
            s_free_blocks_count: 0,
            s_free_inodes_count: 0,
            s_first_data_block: layout.first_data_block as u32,
            s_log_block_size: match layout.block_size {
                1024 => 0,
                2048 => 1,
                _ => 2,
            },
            s_blocks_per_group: layout.blocks_per_group,
            s_inodes_per_group: layout.inodes_per_group,
            s_mtime: 0,
            s_wtime: now,
            s_magic: EXT4_SUPER_MAGIC,
            s_state: EXT4_VALID_FS,
            s_errors: EXT4_ERRORS_CONTINUE,
            s_lastcheck: now,
            s_creator_os: EXT4_OS_LINUX,
            s_rev_level: EXT4_DYNAMIC_REV,
            s_first_ino: EXT4_FIRST_INO,
            s_inode_size: EXT4_INODE_SIZE,
            s_block_group_nr: 0,
            s_feature_compat: FEATURE_COMPAT_EXT_ATTR
                | FEATURE_COMPAT_RESIZE_INODE
                | FEATURE_COMPAT_DIR_INDEX
                | FEATURE_COMPAT_HAS_JOURNAL,
            s_feature_incompat: incompat,
            s_feature_ro_compat: FEATURE_RO_COMPAT_SPARSE_SUPER
                | FEATURE_RO_COMPAT_LARGE_FILE
                | FEATURE_RO_COMPAT_HUGE_FILE
                | FEATURE_RO_COMPAT_GDT_CSUM
                | FEATURE_RO_COMPAT_DIR_NLINK
                | FEATURE_RO_COMPAT_EXTRA_ISIZE
                | FEATURE_RO_COMPAT_METADATA_CSUM,
            s_uuid: uuid,
            s_volume_name: volume_name,
            s_reserved_gdt_blocks: 0,
            s_journal_inum: EXT4_JOURNAL_INO,
            s_hash_seed: hash_seed,
            s_def_hash_version: DX_HASH_LEGACY,
            s_jnl_backup_type: 1,
            s_desc_size: EXT4_DESC_SIZE,
            s_mkfs_time: now,
            s_jnl_blocks: [0; 17],
            s_min_extra_isize: EXT4_EXTRA_ISIZE,
            s_want_extra_isize: EXT4_EXTRA_ISIZE,
            s_flags: 0,
            s_log_groups_per_flex: 0,
            s_checksum_type: 1,
            s_checksum_seed: csum_seed,
        };

        let group_descs = layout
            .groups
            .iter()
            .map(|g| Ext4GroupDesc {
                block_bitmap: g.block_bitmap,
                inode_bitmap: g.inode_bitmap,
                inode_table: g.inode_table_start,
                flags: EXT4_BG_INODE_ZEROED,
                ..Ext4GroupDesc::default()
            })
            .collect();

        let inode_bitmaps = (0..layout.num_groups)
            .map(|_| Bitmap::new(layout.inodes_per_group as u64))
            .collect();

        Ok(Self {
            device,
            layout,
            fs,
            inode_map,
            alloc,
            journal,
            uuid,
            csum_seed,
            hash_seed,
            now,
            uses_inline_data,
            superblock,
            group_descs,
            inode_bitmaps,
            block_bitmaps: Vec::new(),
            checkpoint,
            planned_dirs: Vec::new(),
        })
    }

    pub fn journal_location(&self) -> &JournalLocation {
        &self.journal
    }

    pub fn run(&mut self) -> Result<WriteStats, ConvertError> {
        self.write_superblocks()?;
        self.write_gdt()?;
        let inodes_written = self.write_inode_tables()?;
        self.write_bitmaps()?;
        let directories_written = self.write_directories()?;
        journal::write_journal(self.device, &self.journal, self.layout.block_size, &self.uuid)?;
        self.update_free_counts()?;
        self.device.sync()?;
        info!(
            "ext4 write complete: {} inode(s), {} director(ies), journal of {} block(s)",
            inodes_written, directories_written, self.journal.total_blocks
        );
        Ok(WriteStats {
            inodes_written,
            directories_written,
            journal_blocks: self.journal.total_blocks,
        })
    }

    /// Primary superblock at byte 1024, backups at the start of every
    /// sparse-super group with `s_block_group_nr` patched.
    fn write_superblocks(&mut self) -> Result<(), ConvertError> {
        let bs = self.layout.block_size as u64;
        for group in &self.layout.groups {
            if !group.has_super {
                continue;
            }
            let group_no = self.layout.group_of_block(group.group_start);
            self.superblock.s_block_group_nr = group_no as u16;
            let bytes = self.superblock.to_bytes();
            let offset = if group_no == 0 {
                EXT4_SUPERBLOCK_OFFSET
            } else {
                group.group_start * bs
            };
            self.device.write_at(offset, &bytes)?;
        }
        self.superblock.s_block_group_nr = 0;
        Ok(())
    }

    fn serialize_gdt(&self) -> Vec<u8> {
        let mut table = vec![0u8; (self.layout.gdt_len * self.layout.block_size as u64) as usize];
        for (g, desc) in self.group_descs.iter().enumerate() {
            let bytes = desc.to_bytes();
            let off = g * EXT4_DESC_SIZE as usize;
            table[off..off + bytes.len()].copy_from_slice(&bytes);
        }
        table
    }

    fn write_gdt(&mut self) -> Result<(), ConvertError> {
        let uuid = self.uuid;
        for (g, desc) in self.group_descs.iter_mut().enumerate() {
            desc.update_checksum(&uuid, g as u32);
        }
        let table = self.serialize_gdt();
        let bs = self.layout.block_size as u64;
        for group in &self.layout.groups {
            if let Some(gdt_start) = group.gdt_start {
                self.device.write_at(gdt_start * bs, &table)?;
            }
        }
        Ok(())
    }

    fn write_inode_tables(&mut self) -> Result<u32, ConvertError> {
        self.zero_inode_tables()?;
        self.mark_reserved_inodes();
        self.write_journal_inode()?;

        let index = self.fs.objectid_index();
        let pairs: Vec<(u64, u32)> = self.inode_map.iter().collect();
        let mut ctx = DecompressCtx::new();
        let mut claimed: HashMap<u64, u64> = HashMap::new();
        let mut written = 0u32;

        for (btrfs_ino, ext4_ino) in pairs {
            let idx = *index.get(&btrfs_ino).ok_or_else(|| {
                ConvertError::invariant(format!("inode map names unknown objectid {}", btrfs_ino))
            })?;
            self.write_one_inode(idx, ext4_ino, &mut ctx, &mut claimed)?;
            written += 1;

            let (group, local) = self.layout.locate_inode(ext4_ino);
            self.inode_bitmaps[group as usize].set(local as u64);
            if self.fs.entries[idx.0].is_dir() {
                self.group_descs[group as usize].used_dirs_count += 1;
            }
        }
        debug!("{} inode(s) written", written);
        Ok(written)
    }

    fn zero_inode_tables(&mut self) -> Result<(), ConvertError> {
        let bs = self.layout.block_size as u64;
        let chunk = vec![0u8; (16usize << 20).min((self.layout.inode_table_len * bs) as usize)];
        let mut batch = BatchWriter::begin(self.device);
        for group in &self.layout.groups {
            let mut off = group.inode_table_start * bs;
            let end = (group.inode_table_start + group.inode_table_len) * bs;
            while off < end {
                let n = ((end - off) as usize).min(chunk.len());
                batch.add(off, &chunk[..n])?;
                off += n as u64;
            }
        }
        batch.submit()
    }

    fn mark_reserved_inodes(&mut self) {
        for ino in 1..=EXT4_RESERVED_INOS {
            let (group, local) = self.layout.locate_inode(ino);
            self.inode_bitmaps[group as usize].set(local as u64);
        }
    }

    fn write_journal_inode(&mut self) -> Result<(), ConvertError> {
        let bs = self.layout.block_size as u64;
        let mut inode = Ext4Inode {
            i_mode: (crate::model::S_IFREG | 0o600) as u16,
            i_links_count: 1,
            i_size: self.journal.total_blocks * bs,
            i_blocks: self.journal.total_blocks * bs / 512,
            i_flags: EXT4_EXTENTS_FL,
            i_atime: self.now,
            i_ctime: self.now,
            i_mtime: self.now,
            i_crtime: self.now,
            ..Ext4Inode::default()
        };
        let extents = self.journal.extents();
        ExtentHeader {
            entries: extents.len() as u16,
            max: EXT4_INLINE_EXTENTS as u16,
            depth: 0,
            generation: 0,
        }
        .write(&mut inode.i_block, 0);
        for (i, &(logical, physical, len)) in extents.iter().enumerate() {
            super::structures::ExtentLeaf {
                logical_block: logical,
                len: len as u16,
                physical_block: physical,
            }
            .write(&mut inode.i_block, 12 + i * 12);
        }

        // Journal backup in the superblock: i_block words plus size.
        for i in 0..15 {
            self.superblock.s_jnl_blocks[i] = get_u32(&inode.i_block, i * 4);
        }
        self.superblock.s_jnl_blocks[15] = (inode.i_size >> 32) as u32;
        self.superblock.s_jnl_blocks[16] = inode.i_size as u32;

        let bytes = inode.to_bytes_checksummed(EXT4_JOURNAL_INO, self.csum_seed);
        self.device
            .write_at(self.layout.inode_position(EXT4_JOURNAL_INO), &bytes)
    }

    fn write_one_inode(
        &mut self,
        idx: InodeIdx,
        ext4_ino: u32,
        ctx: &mut DecompressCtx,
        claimed: &mut HashMap<u64, u64>,
    ) -> Result<(), ConvertError> {
        let entry = &self.fs.entries[idx.0];

        let mut inode = if entry.is_dir() {
            let subdirs = entry
                .children
                .iter()
                .filter(|c| self.fs.entries[c.target.0].is_dir())
                .count() as u32;
            let mut inode = translate_base(entry, 2 + subdirs);
            self.plan_directory(idx, ext4_ino, &mut inode)?;
            inode
        } else if entry.is_symlink() {
            self.build_symlink(idx, ext4_ino)?
        } else if entry.is_regular() {
            self.build_regular(idx, ext4_ino, ctx, claimed)?
        } else {
            // Devices, fifos, sockets.
            let mut inode = translate_base(entry, entry.nlink.max(1));
            inode.i_size = 0;
            if entry.is_device() {
                encode_rdev(&mut inode, entry.rdev);
            }
            inode
        };

        let entry = &self.fs.entries[idx.0];
        if !entry.xattrs.is_empty() && inode.xattr_area.is_empty() {
            inode.xattr_area = build_xattr_area(entry.ino, &entry.xattrs, None);
        }

        let bytes = inode.to_bytes_checksummed(ext4_ino, self.csum_seed);
        self.device
            .write_at(self.layout.inode_position(ext4_ino), &bytes)?;
        Ok(())
    }

    fn plan_directory(
        &mut self,
        idx: InodeIdx,
        ext4_ino: u32,
        inode: &mut Ext4Inode,
    ) -> Result<(), ConvertError> {
        let bs = self.layout.block_size as u64;
        let entry = &self.fs.entries[idx.0];

        let mut children = Vec::with_capacity(entry.children.len());
        for child in &entry.children {
            let target = &self.fs.entries[child.target.0];
            let ino = self.inode_map.lookup(target.ino);
            if ino == 0 {
                return Err(ConvertError::invariant(format!(
                    "directory {} references unmapped objectid {}",
                    entry.ino, target.ino
                )));
            }
            children.push(DirChild {
                name: child.name.clone(),
                ino,
                file_type: file_type_of_mode(target.mode),
            });
        }

        let parent_ino = if ext4_ino == EXT4_ROOT_INO {
            EXT4_ROOT_INO
        } else {
            match self.inode_map.lookup(entry.parent_ino) {
                0 => {
                    warn!(
                        "directory {} has no mapped parent, linking .. to root",
                        entry.ino
                    );
                    EXT4_ROOT_INO
                }
                ino => ino,
            }
        };

        let shape = directory::plan_shape(&children, self.layout.block_size);
        let pieces = self.alloc.allocate_blocks(shape.block_count)?;
        let mut blocks = Vec::with_capacity(shape.block_count as usize);
        for (start, len) in &pieces {
            for b in 0..*len {
                blocks.push(start + b);
            }
        }

        // Extent tree over the directory blocks, one entry per block:
        // directory blocks are allocated and indexed as each fills.
        let runs: Vec<ResolvedRun> = blocks
            .iter()
            .enumerate()
            .map(|(i, &physical)| ResolvedRun {
                file_block: i as u32,
                physical,
                len: 1,
                unwritten: false,
            })
            .collect();
        let mut builder = ExtentTreeBuilder {
            device: self.device,
            alloc: &mut self.alloc,
            block_size: self.layout.block_size,
            csum_seed: self.csum_seed,
        };
        let tree_blocks = builder.install(inode, &runs, ext4_ino)?;

        inode.i_flags |= EXT4_EXTENTS_FL;
        if shape.htree {
            inode.i_flags |= EXT4_INDEX_FL;
        }
        inode.i_size = shape.block_count * bs;
        inode.i_blocks = (shape.block_count + tree_blocks) * bs / 512;

        self.planned_dirs.push(PlannedDir {
            ino: ext4_ino,
            parent_ino,
            children,
            shape,
            blocks,
        });
        Ok(())
    }

    fn build_symlink(&mut self, idx: InodeIdx, ext4_ino: u32) -> Result<Ext4Inode, ConvertError> {
        let bs = self.layout.block_size as u64;
        let entry = &self.fs.entries[idx.0];
        let target = entry
            .symlink_target
            .clone()
            .ok_or_else(|| ConvertError::corruption(format!("symlink {} lost its target", entry.ino)))?;
        let mut inode = translate_base(entry, entry.nlink.max(1));

        if target.len() <= EXT4_INLINE_SYMLINK_MAX {
            encode_fast_symlink(&mut inode, &target);
            return Ok(inode);
        }
        if target.len() >= bs as usize {
            return Err(ConvertError::unsupported(format!(
                "symlink target of {} bytes does not fit one block",
                target.len()
            )));
        }
        let block = self.alloc.allocate_run(1)?;
        let mut buf = vec![0u8; bs as usize];
        buf[..target.len()].copy_from_slice(&target);
        self.device.write_at(block * bs, &buf)?;

        let mut builder = ExtentTreeBuilder {
            device: self.device,
            alloc: &mut self.alloc,
            block_size: self.layout.block_size,
            csum_seed: self.csum_seed,
        };
        let runs = [ResolvedRun {
            file_block: 0,
            physical: block,
            len: 1,
            unwritten: false,
        }];
        builder.install(&mut inode, &runs, ext4_ino)?;
        inode.i_size = target.len() as u64;
        inode.i_blocks = bs / 512;
        Ok(inode)
    }

    fn build_regular(
        &mut self,
        idx: InodeIdx,
        ext4_ino: u32,
        ctx: &mut DecompressCtx,
        claimed: &mut HashMap<u64, u64>,
    ) -> Result<Ext4Inode, ConvertError> {
        let bs = self.layout.block_size as u64;
        let entry = &self.fs.entries[idx.0];
        let mut inode = translate_base(entry, entry.nlink.max(1));

        // Inline data: a single inline extent small enough for the
        // inode body (i_block plus the system.data xattr value).
        if self.uses_inline_data
            && entry.size <= INLINE_DATA_MAX as u64
            && entry.extents.len() == 1
            && entry.extents[0].inline_data.is_some()
        {
            let extent = entry.extents[0].clone();
            let payload = ctx.decompress_inline(&extent, self.layout.block_size)?;
            let size = entry.size as usize;
            let head = size.min(EXT4_INLINE_DATA_IBLOCK);
            inode.i_block[..head].copy_from_slice(&payload[..head]);
            let tail = &payload[head..size];
            inode.xattr_area = build_xattr_area(entry.ino, &entry.xattrs, Some(tail));
            inode.i_flags |= EXT4_INLINE_DATA_FL;
            inode.i_size = entry.size;
            return Ok(inode);
        }

        let mut builder = ExtentTreeBuilder {
            device: self.device,
            alloc: &mut self.alloc,
            block_size: self.layout.block_size,
            csum_seed: self.csum_seed,
        };
        let entry = &mut self.fs.entries[idx.0];
        let runs = builder.resolve_file_runs(entry, claimed, ctx)?;
        let data_blocks: u64 = runs.iter().map(|r| r.len as u64).sum();
        let tree_blocks = builder.install(&mut inode, &runs, ext4_ino)?;
        inode.i_flags |= EXT4_EXTENTS_FL;
        inode.i_size = entry.size;
        inode.i_blocks = (data_blocks + tree_blocks) * bs / 512;
        Ok(inode)
    }

    fn write_bitmaps(&mut self) -> Result<(), ConvertError> {
        let bs = self.layout.block_size as usize;
        let bits_per_block = (bs * 8) as u64;

        let (cp_start, cp_len) = self.checkpoint;
        for (g, group) in self.layout.groups.iter().enumerate() {
            // Block bitmap: one bit per block of this group; bits past
            // the end of the device are set.
            let mut block_map = Bitmap::new(bits_per_block);
            for i in 0..group.blocks_in_group {
                let block = group.group_start + i;
                let in_checkpoint = block >= cp_start && block < cp_start + cp_len;
                if self.alloc.bitmap().is_set(block) && !in_checkpoint {
                    block_map.set(i);
                }
            }
            for i in group.blocks_in_group..bits_per_block {
                block_map.set(i);
            }
            self.device
                .write_at(group.block_bitmap * bs as u64, block_map.as_bytes())?;
            self.group_descs[g].block_bitmap_csum =
                checksum::bitmap_checksum(block_map.as_bytes(), self.csum_seed);
            self.block_bitmaps.push(block_map);

            // Inode bitmap: in-use bits, then padding ones past
            // inodes_per_group.
            let mut inode_map_block = Bitmap::new(bits_per_block);
            for i in 0..self.layout.inodes_per_group as u64 {
                if self.inode_bitmaps[g].is_set(i) {
                    inode_map_block.set(i);
                }
            }
            for i in self.layout.inodes_per_group as u64..bits_per_block {
                inode_map_block.set(i);
            }
            self.device
                .write_at(group.inode_bitmap * bs as u64, inode_map_block.as_bytes())?;
            let used_bytes = (self.layout.inodes_per_group as usize).div_ceil(8);
            self.group_descs[g].inode_bitmap_csum =
                checksum::bitmap_checksum(&inode_map_block.as_bytes()[..used_bytes], self.csum_seed);
        }
        Ok(())
    }

    fn write_directories(&mut self) -> Result<u32, ConvertError> {
        let mut writer = DirectoryWriter {
            device: self.device,
            block_size: self.layout.block_size,
            csum_seed: self.csum_seed,
        };
        let mut written = 0u32;
        for dir in &self.planned_dirs {
            writer.write(dir.ino, dir.parent_ino, &dir.children, &dir.shape, &dir.blocks)?;
            written += 1;
        }
        Ok(written)
    }

    /// Count free blocks and inodes per group from the final bitmaps,
    /// refresh the descriptors (64-byte stride) and the superblock.
    fn update_free_counts(&mut self) -> Result<(), ConvertError> {
        let mut total_free_blocks = 0u64;
        let mut total_free_inodes = 0u32;

        for (g, group) in self.layout.groups.iter().enumerate() {
            let used = self.block_bitmaps[g].count_set_in(0, group.blocks_in_group);
            let free_blocks = group.blocks_in_group - used;
            let free_inodes =
                self.layout.inodes_per_group - self.inode_bitmaps[g].count_set() as u32;
            total_free_blocks += free_blocks;
            total_free_inodes += free_inodes;

            let desc = &mut self.group_descs[g];
            desc.free_blocks_count = free_blocks as u32;
            desc.free_inodes_count = free_inodes;
            desc.itable_unused = 0;
            desc.update_checksum(&self.uuid, g as u32);
        }

        let table = self.serialize_gdt();
        let bs = self.layout.block_size as u64;
        for group in &self.layout.groups {
            if let Some(gdt_start) = group.gdt_start {
                self.device.write_at(gdt_start * bs, &table)?;
            }
        }

        self.superblock.s_free_blocks_count = total_free_blocks;
        self.superblock.s_free_inodes_count = total_free_inodes;
        self.write_superblocks()
    }

    /// Re-read the superblock and descriptors and verify checksums.
    /// Invoked by the orchestrator after the final sync.
    pub fn verify(&self) -> Result<(), ConvertError> {
        let mut sb = vec![0u8; EXT4_SUPERBLOCK_SIZE];
        self.device.read_at(EXT4_SUPERBLOCK_OFFSET, &mut sb)?;
        if super::structures::get_u16(&sb, 0x38) != EXT4_SUPER_MAGIC {
            return Err(ConvertError::corruption("written superblock magic"));
        }
        if get_u32(&sb, 0x3FC) != checksum::superblock_checksum(&sb) {
            return Err(ConvertError::corruption("written superblock checksum"));
        }
        let bs = self.layout.block_size as u64;
        let gdt_start = self.layout.groups[0]
            .gdt_start
            .ok_or_else(|| ConvertError::invariant("group 0 lost its GDT"))?;
        let mut table = vec![0u8; (self.layout.gdt_len * bs) as usize];
        self.device.read_at(gdt_start * bs, &mut table)?;
        for g in 0..self.layout.num_groups {
            let off = g as usize * EXT4_DESC_SIZE as usize;
            let desc = Ext4GroupDesc::from_bytes(&table[off..off + EXT4_DESC_SIZE as usize]);
            let mut copy = desc;
            copy.update_checksum(&self.uuid, g);
            if copy.checksum != desc.checksum || desc.checksum == 0 {
                return Err(ConvertError::corruption(format!(
                    "group descriptor {} checksum mismatch after write",
                    g
                )));
            }
        }
        Ok(())
    }

    pub fn hash_seed(&self) -> [u32; 4] {
        self.hash_seed
    }
}

#[cfg(test)]
mod tests {
    use super::super::structures::{get_u16, put_u16};
    use super::*;

    #[test]
    fn superblock_magic_check() {
        let mut sb = vec![0u8; EXT4_SUPERBLOCK_SIZE];
        put_u16(&mut sb, 0x38, EXT4_SUPER_MAGIC);
        assert_eq!(get_u16(&sb, 0x38), EXT4_SUPER_MAGIC);
    }
}
