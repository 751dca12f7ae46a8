// Ext4 geometry planning.
//
// Given the device size, block size and inode ratio, lay out the block
// groups (sparse-super backups, GDT, bitmaps, inode tables) and verify
// the volume can actually hold the data read out of btrfs plus a 5%
// slack that keeps the relocator from painting itself into a corner.

use log::{debug, info};

use fsmorph_core::ConvertError;

use crate::model::{Compression, ExtentKind, FsInfo};

use super::bitmap::Bitmap;
use super::constants::*;

#[derive(Debug, Clone)]
pub struct GroupLayout {
    /// First block of the group.
    pub group_start: u64,
    pub has_super: bool,
    pub superblock_block: Option<u64>,
    pub gdt_start: Option<u64>,
    pub gdt_len: u64,
    pub reserved_gdt_len: u64,
    pub block_bitmap: u64,
    pub inode_bitmap: u64,
    pub inode_table_start: u64,
    pub inode_table_len: u64,
    pub data_start: u64,
    pub data_blocks: u64,
    /// Blocks actually present in this group (the last group may be
    /// short).
    pub blocks_in_group: u64,
}

#[derive(Debug)]
pub struct Ext4Layout {
    pub block_size: u32,
    pub total_blocks: u64,
    pub blocks_per_group: u32,
    pub num_groups: u32,
    pub inodes_per_group: u32,
    pub total_inodes: u32,
    pub inode_table_len: u64,
    pub gdt_len: u64,
    /// 1 for 1024-byte blocks (block 0 is the boot block), else 0.
    pub first_data_block: u64,
    pub groups: Vec<GroupLayout>,
    /// Every block occupied by ext4 metadata, sorted ascending.
    pub reserved_blocks: Vec<u64>,
    /// Blocks of file payload the conversion must be able to place.
    pub data_blocks_required: u64,
}

/// Sparse-super convention: backups live in groups 0, 1 and powers of
/// 3, 5 and 7.
pub fn group_has_super(group: u32) -> bool {
    if group <= 1 {
        return true;
    }
    for base in [3u64, 5, 7] {
        let mut p = base;
        while p < group as u64 {
            p *= base;
        }
        if p == group as u64 {
            return true;
        }
    }
    false
}

pub fn plan_layout(
    device_size: u64,
    block_size: u32,
    inode_ratio: u32,
    fs: &FsInfo,
) -> Result<Ext4Layout, ConvertError> {
    let bs = block_size as u64;
    let total_blocks = device_size / bs;
    let blocks_per_group = 8 * block_size;
    let first_data_block: u64 = if block_size == 1024 { 1 } else { 0 };

    let group_space = total_blocks.saturating_sub(first_data_block);
    if group_space == 0 {
        return Err(ConvertError::SpaceExhausted(
            "device smaller than one block".into(),
        ));
    }
    let num_groups = group_space.div_ceil(blocks_per_group as u64) as u32;

    // Inodes per group: device_size / ratio inodes overall, spread
    // across groups, rounded up to a byte of the inode bitmap, capped
    // by the bitmap block, floored at 16.
    let wanted_inodes = device_size.div_ceil(inode_ratio as u64);
    let mut inodes_per_group = wanted_inodes.div_ceil(num_groups as u64);
    inodes_per_group = inodes_per_group.div_ceil(8) * 8;
    inodes_per_group = inodes_per_group.clamp(16, 8 * bs);
    let inodes_per_group = inodes_per_group as u32;

    let total_inodes = inodes_per_group
        .checked_mul(num_groups)
        .ok_or_else(|| ConvertError::invariant("inode count overflow"))?;
    let needed_inodes = fs.inode_count() + u64::from(EXT4_RESERVED_INOS) + 6;
    if u64::from(total_inodes) < fs.inode_count() + 16 {
        return Err(ConvertError::SpaceExhausted(format!(
            "{} inodes planned but {} needed; lower --inode-ratio",
            total_inodes, needed_inodes
        )));
    }

    let gdt_len = (num_groups as u64 * EXT4_DESC_SIZE as u64).div_ceil(bs);
    // An in-place conversion leaves no room to grow the volume, so no
    // reserved GDT blocks are planned.
    let reserved_gdt_len = 0u64;
    let inode_table_len = (inodes_per_group as u64 * EXT4_INODE_SIZE as u64).div_ceil(bs);

    let mut groups = Vec::with_capacity(num_groups as usize);
    let mut reserved_blocks: Vec<u64> = Vec::new();
    if first_data_block == 1 {
        // Boot block outside any group.
        reserved_blocks.push(0);
    }

    for g in 0..num_groups {
        let group_start = first_data_block + g as u64 * blocks_per_group as u64;
        let group_end = (group_start + blocks_per_group as u64).min(total_blocks);
        let blocks_in_group = group_end - group_start;
        let has_super = group_has_super(g);

        let mut cur = group_start;
        let mut superblock_block = None;
        let mut gdt_start = None;
        if has_super {
            superblock_block = Some(cur);
            cur += 1;
            gdt_start = Some(cur);
            cur += gdt_len + reserved_gdt_len;
        }
        let block_bitmap = cur;
        cur += 1;
        let inode_bitmap = cur;
        cur += 1;
        let inode_table_start = cur;
        cur += inode_table_len;
        let data_start = cur;

        if data_start > group_end {
            return Err(ConvertError::SpaceExhausted(format!(
                "group {} metadata ({} blocks) does not fit its {} block(s)",
                g,
                data_start - group_start,
                blocks_in_group
            )));
        }

        for b in group_start..data_start {
            reserved_blocks.push(b);
        }

        groups.push(GroupLayout {
            group_start,
            has_super,
            superblock_block,
            gdt_start,
            gdt_len: if has_super { gdt_len } else { 0 },
            reserved_gdt_len,
            block_bitmap,
            inode_bitmap,
            inode_table_start,
            inode_table_len,
            data_start,
            data_blocks: group_end - data_start,
            blocks_in_group,
        });
    }

    reserved_blocks.sort_unstable();
    reserved_blocks.dedup();

    let data_blocks_required = estimate_data_blocks(fs, bs) + fs.dedup_blocks_needed;
    let reserved_count = reserved_blocks.len() as u64;
    let free_after_metadata = total_blocks.saturating_sub(reserved_count);
    if data_blocks_required >= free_after_metadata {
        return Err(ConvertError::SpaceExhausted(format!(
            "{} data blocks required but only {} available outside metadata",
            data_blocks_required, free_after_metadata
        )));
    }
    let slack = free_after_metadata - data_blocks_required;
    if slack < total_blocks / 20 {
        return Err(ConvertError::SpaceExhausted(format!(
            "only {} spare block(s) would remain (less than 5% of {}); conversion could deadlock",
            slack, total_blocks
        )));
    }

    info!(
        "planned ext4 geometry: {} blocks of {} bytes, {} group(s), {} inodes",
        total_blocks, block_size, num_groups, total_inodes
    );
    debug!(
        "reserved {} metadata block(s); {} data block(s) required, {} spare",
        reserved_count, data_blocks_required, slack
    );

    Ok(Ext4Layout {
        block_size,
        total_blocks,
        blocks_per_group,
        num_groups,
        inodes_per_group,
        total_inodes,
        inode_table_len,
        gdt_len,
        first_data_block,
        groups,
        reserved_blocks,
        data_blocks_required,
    })
}

impl Ext4Layout {
    /// Bitmap over the whole device with every reserved block set.
    pub fn reserved_bitmap(&self) -> Bitmap {
        let mut bitmap = Bitmap::new(self.total_blocks);
        for &b in &self.reserved_blocks {
            bitmap.set(b);
        }
        bitmap
    }

    pub fn group_of_block(&self, block: u64) -> u32 {
        if block < self.first_data_block {
            return 0;
        }
        ((block - self.first_data_block) / self.blocks_per_group as u64) as u32
    }

    /// Group and group-local index of an inode number (1-based).
    pub fn locate_inode(&self, ino: u32) -> (u32, u32) {
        let idx = ino - 1;
        (idx / self.inodes_per_group, idx % self.inodes_per_group)
    }

    /// Byte offset of inode `ino`'s slot in its group's inode table.
    pub fn inode_position(&self, ino: u32) -> u64 {
        let (group, local) = self.locate_inode(ino);
        let table = self.groups[group as usize].inode_table_start;
        table * self.block_size as u64 + local as u64 * EXT4_INODE_SIZE as u64
    }
}

/// Leaf extent entries per tree block.
pub fn extents_per_block(block_size: u32) -> usize {
    ((block_size - 12) / 12) as usize
}

/// Blocks of file payload, extent-index overhead, long symlink targets
/// and directory content the writer will need.
fn estimate_data_blocks(fs: &FsInfo, bs: u64) -> u64 {
    let epb = 340u64; // 4096-byte blocks; a lower block size only over-reserves
    let mut blocks = 0u64;
    for entry in &fs.entries {
        if entry.is_dir() {
            let mut size = 24u64; // . and ..
            for child in &entry.children {
                size += dir_entry_len(child.name.len());
            }
            let dir_blocks = size.div_ceil(bs);
            // HTree root and one index node once it spills past a block.
            blocks += if dir_blocks > 1 {
                dir_blocks + 2
            } else {
                dir_blocks
            };
            continue;
        }
        if entry.is_symlink() {
            if entry
                .symlink_target
                .as_ref()
                .is_some_and(|t| t.len() > EXT4_INLINE_SYMLINK_MAX)
            {
                blocks += 1;
            }
            continue;
        }
        let mut extent_count = 0u64;
        for extent in &entry.extents {
            match extent.kind {
                ExtentKind::Inline => {
                    // Small files stay in the inode; anything else gets
                    // one block.
                    if entry.size > EXT4_INLINE_DATA_IBLOCK as u64 {
                        blocks += 1;
                        extent_count += 1;
                    }
                }
                ExtentKind::Regular | ExtentKind::Prealloc => {
                    if extent.is_hole() {
                        continue;
                    }
                    let payload = if extent.compression == Compression::None {
                        extent.num_bytes
                    } else {
                        extent.ram_bytes
                    };
                    blocks += payload.div_ceil(bs);
                    extent_count += 1;
                }
            }
        }
        if extent_count > EXT4_INLINE_EXTENTS as u64 {
            blocks += extent_count.div_ceil(epb);
        }
    }
    blocks
}

/// Directory entry record length: header plus name, 4-byte aligned.
pub fn dir_entry_len(name_len: usize) -> u64 {
    ((8 + name_len + 3) & !3) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FileEntry;

    fn empty_fs() -> FsInfo {
        let mut fs = FsInfo::default();
        fs.entries.push(FileEntry {
            ino: 256,
            mode: crate::model::S_IFDIR | 0o755,
            ..FileEntry::default()
        });
        fs
    }

    #[test]
    fn sparse_super_groups() {
        let expect: Vec<u32> = vec![0, 1, 3, 5, 7, 9, 25, 27, 49, 81, 125];
        for g in 0..200u32 {
            assert_eq!(group_has_super(g), expect.contains(&g), "group {}", g);
        }
    }

    #[test]
    fn layout_invariants_small_device() {
        let fs = empty_fs();
        let layout = plan_layout(128 << 20, 4096, 16384, &fs).unwrap();
        assert_eq!(layout.total_blocks, 32768);
        assert_eq!(layout.blocks_per_group, 32768);
        assert_eq!(layout.num_groups, 1);
        assert!(u64::from(layout.total_inodes) >= fs.inode_count() + 16);
        for group in &layout.groups {
            assert!(group.inode_table_start + group.inode_table_len <= layout.total_blocks);
            assert!(group.data_start >= group.group_start);
        }
    }

    #[test]
    fn layout_metadata_regions_do_not_overlap() {
        let fs = empty_fs();
        let layout = plan_layout(2048u64 << 20, 4096, 16384, &fs).unwrap();
        assert!(layout.num_groups > 1);
        let mut sorted = layout.reserved_blocks.clone();
        sorted.sort_unstable();
        sorted.dedup();
        // Reserved list was already sorted and duplicate-free.
        assert_eq!(sorted, layout.reserved_blocks);
        for pair in layout.groups.windows(2) {
            assert!(pair[0].data_start <= pair[1].group_start);
        }
    }

    #[test]
    fn layout_rejects_inode_starved_volume() {
        let mut fs = empty_fs();
        for i in 0..100_000u64 {
            fs.entries.push(FileEntry {
                ino: 257 + i,
                mode: crate::model::S_IFREG | 0o644,
                ..FileEntry::default()
            });
        }
        // 64 MiB device cannot hold 100k inodes at the default ratio.
        assert!(plan_layout(64 << 20, 4096, 16384, &fs).is_err());
    }

    #[test]
    fn inode_position_uses_group_tables() {
        let fs = empty_fs();
        let layout = plan_layout(1024u64 << 20, 4096, 16384, &fs).unwrap();
        let (g0, l0) = layout.locate_inode(1);
        assert_eq!((g0, l0), (0, 0));
        let (g, local) = layout.locate_inode(layout.inodes_per_group + 1);
        assert_eq!((g, local), (1, 0));
        let pos = layout.inode_position(layout.inodes_per_group + 1);
        assert_eq!(
            pos,
            layout.groups[1].inode_table_start * 4096
        );
    }
}
