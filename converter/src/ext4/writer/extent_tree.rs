// Extent tree construction for regular files.
//
// File extents are resolved into per-block physical runs first: blocks
// already claimed by another inode (CoW sharing) are cloned through to
// fresh allocations, compressed extents are decompressed into newly
// allocated runs, and inline payloads get their own block when they
// cannot stay in the inode. Up to four runs fit inline in `i_block`;
// larger files get a bottom-up tree of on-disk nodes.

use std::collections::HashMap;

use log::trace;

use fsmorph_core::{BlockDevice, ConvertError};

use crate::btrfs::decompress::DecompressCtx;
use crate::ext4::alloc::BlockAllocator;
use crate::ext4::checksum;
use crate::ext4::constants::*;
use crate::ext4::structures::{put_u32, ExtentHeader, ExtentIdx, ExtentLeaf, Ext4Inode};
use crate::model::{Compression, ExtentKind, FileEntry};

/// Marks an extent as unwritten (preallocated) in `ee_len`.
const EXTENT_UNWRITTEN_BIT: u16 = 0x8000;

/// One contiguous physical run backing part of a file.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedRun {
    pub file_block: u32,
    pub physical: u64,
    pub len: u32,
    pub unwritten: bool,
}

pub struct ExtentTreeBuilder<'a> {
    pub device: &'a dyn BlockDevice,
    pub alloc: &'a mut BlockAllocator,
    pub block_size: u32,
    pub csum_seed: u32,
}

impl<'a> ExtentTreeBuilder<'a> {
    /// Flatten a file's extents into merged physical runs, cloning
    /// CoW-shared blocks and materialising compressed or inline data.
    /// In-memory extents are rewritten to their final addresses.
    pub fn resolve_file_runs(
        &mut self,
        entry: &mut FileEntry,
        claimed: &mut HashMap<u64, u64>,
        ctx: &mut DecompressCtx,
    ) -> Result<Vec<ResolvedRun>, ConvertError> {
        let bs = self.block_size as u64;
        let mut runs: Vec<ResolvedRun> = Vec::new();

        for i in 0..entry.extents.len() {
            let extent = entry.extents[i].clone();
            if extent.is_hole() || extent.num_bytes == 0 {
                continue;
            }
            let file_block = (extent.file_offset / bs) as u32;

            match extent.kind {
                ExtentKind::Inline => {
                    let data = ctx.decompress_inline(&extent, self.block_size)?.to_vec();
                    let start = self.write_fresh(&data, claimed)?;
                    entry.extents[i].disk_bytenr = start * bs;
                    entry.extents[i].compression = Compression::None;
                    entry.extents[i].inline_data = None;
                    runs.push(ResolvedRun {
                        file_block,
                        physical: start,
                        len: (data.len() as u64 / bs) as u32,
                        unwritten: false,
                    });
                }
                ExtentKind::Regular | ExtentKind::Prealloc if extent.compression != Compression::None => {
                    let decoded = ctx
                        .decompress(self.device, &extent, extent.disk_bytenr, self.block_size)?;
                    let lo = extent.extent_offset as usize;
                    let hi = (extent.extent_offset + extent.num_bytes) as usize;
                    if hi > decoded.len() {
                        return Err(ConvertError::corruption(format!(
                            "extent of inode {} references past its decompressed data",
                            entry.ino
                        )));
                    }
                    let mut slice = decoded[lo..hi].to_vec();
                    slice.resize(slice.len().div_ceil(bs as usize) * bs as usize, 0);
                    let start = self.write_fresh(&slice, claimed)?;
                    entry.extents[i].disk_bytenr = start * bs;
                    entry.extents[i].disk_num_bytes = slice.len() as u64;
                    entry.extents[i].extent_offset = 0;
                    entry.extents[i].compression = Compression::None;
                    runs.push(ResolvedRun {
                        file_block,
                        physical: start,
                        len: (slice.len() as u64 / bs) as u32,
                        unwritten: false,
                    });
                }
                ExtentKind::Regular | ExtentKind::Prealloc => {
                    let unwritten = extent.kind == ExtentKind::Prealloc;
                    let phys_start = extent.disk_bytenr + extent.extent_offset;
                    let block_count = extent.num_bytes.div_ceil(bs);
                    let first = phys_start / bs;
                    self.resolve_shared_blocks(
                        entry.ino,
                        file_block,
                        first,
                        block_count,
                        unwritten,
                        claimed,
                        &mut runs,
                    )?;
                }
            }
        }

        runs.sort_by_key(|r| r.file_block);
        Ok(merge_runs(runs))
    }

    /// Claim `[first, first+count)` for this inode, cloning any block
    /// another inode claimed before.
    #[allow(clippy::too_many_arguments)]
    fn resolve_shared_blocks(
        &mut self,
        ino: u64,
        file_block: u32,
        first: u64,
        count: u64,
        unwritten: bool,
        claimed: &mut HashMap<u64, u64>,
        runs: &mut Vec<ResolvedRun>,
    ) -> Result<(), ConvertError> {
        let bs = self.block_size as usize;
        let mut block_buf = vec![0u8; bs];
        for b in 0..count {
            let physical = first + b;
            let target = match claimed.get(&physical) {
                None => {
                    claimed.insert(physical, ino);
                    physical
                }
                Some(owner) if *owner == ino => physical,
                Some(_) => {
                    // CoW-shared: give this inode its own copy.
                    let fresh = self.alloc.allocate_run(1)?;
                    self.device
                        .read_at(physical * bs as u64, &mut block_buf)?;
                    self.device.write_at(fresh * bs as u64, &block_buf)?;
                    trace!("cloned shared block {} -> {}", physical, fresh);
                    fresh
                }
            };
            push_block(runs, file_block + b as u32, target, unwritten);
        }
        Ok(())
    }

    /// Allocate space for `data` (already block-padded) and write it.
    fn write_fresh(
        &mut self,
        data: &[u8],
        claimed: &mut HashMap<u64, u64>,
    ) -> Result<u64, ConvertError> {
        let bs = self.block_size as u64;
        let blocks = data.len() as u64 / bs;
        let start = self.alloc.allocate_run(blocks)?;
        self.device.write_at(start * bs, data)?;
        for b in start..start + blocks {
            claimed.insert(b, u64::MAX);
        }
        Ok(start)
    }

    /// Install the extent tree for `runs` into `inode`. Returns the
    /// number of tree blocks written to disk.
    pub fn install(
        &mut self,
        inode: &mut Ext4Inode,
        runs: &[ResolvedRun],
        ino: u32,
    ) -> Result<u64, ConvertError> {
        inode.i_flags |= EXT4_EXTENTS_FL;
        let leaves: Vec<ExtentLeaf> = runs
            .iter()
            .map(|r| ExtentLeaf {
                logical_block: r.file_block,
                len: if r.unwritten {
                    r.len as u16 | EXTENT_UNWRITTEN_BIT
                } else {
                    r.len as u16
                },
                physical_block: r.physical,
            })
            .collect();

        if leaves.len() <= EXT4_INLINE_EXTENTS {
            let header = ExtentHeader {
                entries: leaves.len() as u16,
                max: EXT4_INLINE_EXTENTS as u16,
                depth: 0,
                generation: 0,
            };
            header.write(&mut inode.i_block, 0);
            for (i, leaf) in leaves.iter().enumerate() {
                leaf.write(&mut inode.i_block, 12 + i * 12);
            }
            return Ok(0);
        }

        let bs = self.block_size as usize;
        let per_block = super::super::layout::extents_per_block(self.block_size);
        let mut tree_blocks = 0u64;

        // Leaf level.
        let mut index: Vec<(u32, u64)> = Vec::new();
        for chunk in leaves.chunks(per_block) {
            let block = self.alloc.allocate_run(1)?;
            let mut buf = vec![0u8; bs];
            ExtentHeader {
                entries: chunk.len() as u16,
                max: per_block as u16,
                depth: 0,
                generation: 0,
            }
            .write(&mut buf, 0);
            for (i, leaf) in chunk.iter().enumerate() {
                leaf.write(&mut buf, 12 + i * 12);
            }
            self.stamp_tail(&mut buf, ino);
            self.device.write_at(block as u64 * bs as u64, &buf)?;
            index.push((chunk[0].logical_block, block));
            tree_blocks += 1;
        }

        // Index levels until the root fits inline.
        let mut depth = 1u16;
        while index.len() > EXT4_INLINE_EXTENTS {
            let mut next: Vec<(u32, u64)> = Vec::new();
            for chunk in index.chunks(per_block) {
                let block = self.alloc.allocate_run(1)?;
                let mut buf = vec![0u8; bs];
                ExtentHeader {
                    entries: chunk.len() as u16,
                    max: per_block as u16,
                    depth,
                    generation: 0,
                }
                .write(&mut buf, 0);
                for (i, &(logical, child)) in chunk.iter().enumerate() {
                    ExtentIdx {
                        first_logical_block: logical,
                        child_block: child,
                    }
                    .write(&mut buf, 12 + i * 12);
                }
                self.stamp_tail(&mut buf, ino);
                self.device.write_at(block as u64 * bs as u64, &buf)?;
                next.push((chunk[0].0, block));
                tree_blocks += 1;
            }
            index = next;
            depth += 1;
        }

        let header = ExtentHeader {
            entries: index.len() as u16,
            max: EXT4_INLINE_EXTENTS as u16,
            depth,
            generation: 0,
        };
        header.write(&mut inode.i_block, 0);
        for (i, &(logical, child)) in index.iter().enumerate() {
            ExtentIdx {
                first_logical_block: logical,
                child_block: child,
            }
            .write(&mut inode.i_block, 12 + i * 12);
        }
        Ok(tree_blocks)
    }

    fn stamp_tail(&self, buf: &mut [u8], ino: u32) {
        let len = buf.len();
        let crc = checksum::extent_block_checksum(buf, ino, 0, self.csum_seed);
        put_u32(buf, len - 4, crc);
    }
}

/// Longest run one extent entry can hold; unwritten extents lose one
/// block to the flag bit.
fn run_cap(unwritten: bool) -> u32 {
    if unwritten {
        EXT4_MAX_EXTENT_LEN - 1
    } else {
        EXT4_MAX_EXTENT_LEN
    }
}

fn push_block(runs: &mut Vec<ResolvedRun>, file_block: u32, physical: u64, unwritten: bool) {
    if let Some(last) = runs.last_mut() {
        if last.unwritten == unwritten
            && last.file_block as u64 + last.len as u64 == file_block as u64
            && last.physical + last.len as u64 == physical
            && last.len < run_cap(unwritten)
        {
            last.len += 1;
            return;
        }
    }
    runs.push(ResolvedRun {
        file_block,
        physical,
        len: 1,
        unwritten,
    });
}

fn merge_runs(runs: Vec<ResolvedRun>) -> Vec<ResolvedRun> {
    let mut merged: Vec<ResolvedRun> = Vec::with_capacity(runs.len());
    for run in runs {
        match merged.last_mut() {
            Some(last)
                if last.unwritten == run.unwritten
                    && last.file_block as u64 + last.len as u64 == run.file_block as u64
                    && last.physical + last.len as u64 == run.physical
                    && last.len + run.len <= run_cap(run.unwritten) =>
            {
                last.len += run.len;
            }
            _ => merged.push(run),
        }
    }
    merged
}

/// Walk an inline or depth-1 extent tree back out of an inode and its
/// on-disk nodes. Shared with the tests and the verification sweep.
pub fn read_extent_leaves(
    device: &dyn BlockDevice,
    inode_block: &[u8; 60],
    block_size: u32,
) -> Result<Vec<ExtentLeaf>, ConvertError> {
    let header = ExtentHeader::read(inode_block, 0)
        .ok_or_else(|| ConvertError::corruption("missing extent header magic"))?;
    let mut leaves = Vec::new();
    if header.depth == 0 {
        for i in 0..header.entries as usize {
            leaves.push(ExtentLeaf::read(inode_block, 12 + i * 12));
        }
        return Ok(leaves);
    }
    if header.depth != 1 {
        return Err(ConvertError::unsupported(
            "extent walk beyond depth 1",
        ));
    }
    let bs = block_size as usize;
    let mut node = vec![0u8; bs];
    for i in 0..header.entries as usize {
        let idx = ExtentIdx::read(inode_block, 12 + i * 12);
        device.read_at(idx.child_block * bs as u64, &mut node)?;
        let child = ExtentHeader::read(&node, 0)
            .ok_or_else(|| ConvertError::corruption("missing extent header in tree node"))?;
        for j in 0..child.entries as usize {
            leaves.push(ExtentLeaf::read(&node, 12 + j * 12));
        }
    }
    Ok(leaves)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_respects_extent_cap() {
        let runs = vec![
            ResolvedRun {
                file_block: 0,
                physical: 100,
                len: EXT4_MAX_EXTENT_LEN - 1,
                unwritten: false,
            },
            ResolvedRun {
                file_block: EXT4_MAX_EXTENT_LEN - 1,
                physical: 100 + (EXT4_MAX_EXTENT_LEN as u64 - 1),
                len: 2,
                unwritten: false,
            },
        ];
        let merged = merge_runs(runs);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn merge_joins_adjacent_runs() {
        let runs = vec![
            ResolvedRun {
                file_block: 0,
                physical: 50,
                len: 4,
                unwritten: false,
            },
            ResolvedRun {
                file_block: 4,
                physical: 54,
                len: 4,
                unwritten: false,
            },
            ResolvedRun {
                file_block: 8,
                physical: 90,
                len: 1,
                unwritten: false,
            },
        ];
        let merged = merge_runs(runs);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].len, 8);
    }

    #[test]
    fn unwritten_runs_do_not_merge_with_written() {
        let runs = vec![
            ResolvedRun {
                file_block: 0,
                physical: 50,
                len: 4,
                unwritten: false,
            },
            ResolvedRun {
                file_block: 4,
                physical: 54,
                len: 4,
                unwritten: true,
            },
        ];
        assert_eq!(merge_runs(runs).len(), 2);
    }
}
