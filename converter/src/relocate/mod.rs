// Pass 2b: move data blocks out of the regions ext4 metadata needs.
//
// An extent with any block inside the planned metadata area is moved
// whole, so its `disk_bytenr` stays meaningful; destinations come from
// the global allocator, preferring one consecutive run and degrading
// to fragments only when several entries must share scattered space
// (each entry still covers one contiguous destination).

pub mod migration;

use std::collections::HashSet;

use log::{debug, info, warn};

use fsmorph_core::{BlockDevice, ConvertError};

use crate::btrfs::checksum::crc32c_continue;
use crate::btrfs::chunk_map::ChunkMap;
use crate::ext4::alloc::BlockAllocator;
use crate::ext4::bitmap::Bitmap;
use crate::ext4::layout::Ext4Layout;
use crate::model::{Compression, ExtentKind, FileExtent, FsInfo};

/// Copy granularity during relocation.
const COPY_CHUNK: usize = 16 << 20;

#[derive(Debug, Clone, Copy)]
pub struct RelocationEntry {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub length: u64,
    pub checksum: u32,
    pub seq: u32,
    pub completed: bool,
}

#[derive(Debug, Default)]
pub struct RelocationPlan {
    pub entries: Vec<RelocationEntry>,
    /// Data blocks found inside reserved regions.
    pub conflict_blocks: u64,
}

impl RelocationPlan {
    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.length).sum()
    }
}

/// Detect extents colliding with reserved blocks and assign
/// destinations for them.
pub fn build_plan(
    fs: &FsInfo,
    chunks: &ChunkMap,
    layout: &Ext4Layout,
    alloc: &mut BlockAllocator,
) -> Result<RelocationPlan, ConvertError> {
    let bs = layout.block_size as u64;
    let conflict = layout.reserved_bitmap();

    let mut plan = RelocationPlan::default();
    // Distinct moved source ranges; CoW-shared extents move once.
    let mut planned_sources: HashSet<u64> = HashSet::new();

    for entry in &fs.entries {
        for extent in &entry.extents {
            if extent.kind == ExtentKind::Inline || extent.is_hole() {
                continue;
            }
            let physical = chunks.resolve_checked(extent.disk_bytenr)?;
            let first_block = physical / bs;
            let block_count = extent.disk_num_bytes.div_ceil(bs);

            let conflicts = count_conflicts(&conflict, first_block, block_count);
            if conflicts == 0 {
                continue;
            }
            plan.conflict_blocks += conflicts;
            if !planned_sources.insert(physical) {
                continue;
            }

            // A compressed extent is one indivisible stream, so its
            // destination must be a single run; uncompressed extents
            // may scatter and are split during the rewrite phase.
            let pieces = if extent.compression != Compression::None {
                vec![(alloc.allocate_run(block_count)?, block_count)]
            } else {
                alloc.allocate_blocks(block_count)?
            };
            let mut src = first_block * bs;
            for (dst_block, len_blocks) in pieces {
                let length = (len_blocks * bs).min(first_block * bs + extent.disk_num_bytes - src);
                plan.entries.push(RelocationEntry {
                    src_offset: src,
                    dst_offset: dst_block * bs,
                    length,
                    checksum: 0,
                    seq: 0,
                    completed: false,
                });
                src += length;
            }
        }
    }

    plan.entries.sort_by_key(|e| e.src_offset);
    coalesce(&mut plan.entries);
    for (i, entry) in plan.entries.iter_mut().enumerate() {
        entry.seq = i as u32;
    }

    info!(
        "relocation plan: {} conflicting block(s), {} entr{}, {} byte(s) to move",
        plan.conflict_blocks,
        plan.entries.len(),
        if plan.entries.len() == 1 { "y" } else { "ies" },
        plan.total_bytes()
    );
    Ok(plan)
}

fn count_conflicts(conflict: &Bitmap, first_block: u64, count: u64) -> u64 {
    (first_block..first_block + count)
        .filter(|&b| conflict.is_set(b))
        .count() as u64
}

/// Merge entries whose source and destination are both adjacent.
fn coalesce(entries: &mut Vec<RelocationEntry>) {
    let mut merged: Vec<RelocationEntry> = Vec::with_capacity(entries.len());
    for entry in entries.drain(..) {
        match merged.last_mut() {
            Some(prev)
                if prev.src_offset + prev.length == entry.src_offset
                    && prev.dst_offset + prev.length == entry.dst_offset =>
            {
                prev.length += entry.length;
            }
            _ => merged.push(entry),
        }
    }
    *entries = merged;
}

/// Open-addressing index from a block-aligned physical offset to the
/// extents that start there. Linear probing deliberately walks past
/// occupied slots so CoW aliases of the same physical extent all
/// surface on lookup.
struct ExtentHash {
    slots: Vec<Option<(u64, u32, u32)>>,
    mask: usize,
}

impl ExtentHash {
    const MAX_SLOTS: usize = 1 << 27;

    fn build(fs: &FsInfo, chunks: &ChunkMap) -> Option<Self> {
        let count: usize = fs.entries.iter().map(|e| e.extents.len()).sum();
        let want = (count.max(64) * 2).next_power_of_two();
        if want > Self::MAX_SLOTS {
            return None;
        }
        let mut hash = Self {
            slots: vec![None; want],
            mask: want - 1,
        };
        for (ei, entry) in fs.entries.iter().enumerate() {
            for (xi, extent) in entry.extents.iter().enumerate() {
                if extent.kind == ExtentKind::Inline || extent.is_hole() {
                    continue;
                }
                let physical = chunks.resolve(extent.disk_bytenr);
                if physical == crate::btrfs::chunk_map::RESOLVE_NOT_FOUND {
                    continue;
                }
                hash.insert(physical, ei as u32, xi as u32);
            }
        }
        Some(hash)
    }

    fn slot_of(&self, key: u64) -> usize {
        (key.wrapping_mul(0x9E37_79B9_7F4A_7C15) as usize) & self.mask
    }

    fn insert(&mut self, key: u64, inode_index: u32, extent_index: u32) {
        let mut slot = self.slot_of(key);
        while self.slots[slot].is_some() {
            slot = (slot + 1) & self.mask;
        }
        self.slots[slot] = Some((key, inode_index, extent_index));
    }

    /// Every `(inode, extent)` pair whose extent starts at `key`.
    fn lookup_all(&self, key: u64, out: &mut Vec<(u32, u32)>) {
        let mut slot = self.slot_of(key);
        while let Some((k, ei, xi)) = self.slots[slot] {
            if k == key {
                out.push((ei, xi));
            }
            slot = (slot + 1) & self.mask;
        }
    }
}

/// Execute the plan: copy every entry, then rewrite extent addresses.
/// After this returns, every non-inline extent's `disk_bytenr` is a
/// physical device offset.
pub fn execute(
    device: &dyn BlockDevice,
    plan: &mut RelocationPlan,
    fs: &mut FsInfo,
    chunks: &ChunkMap,
) -> Result<(), ConvertError> {
    // Build the lookup before addresses change.
    let extent_hash = ExtentHash::build(fs, chunks);
    if extent_hash.is_none() {
        warn!("extent hash too large, falling back to linear extent scan");
    }

    for i in 0..plan.entries.len() {
        if let Err(e) = copy_entry(device, &mut plan.entries[i]) {
            warn!(
                "relocation failed at entry {}: {}; rolling the moved blocks back",
                i, e
            );
            partial_rollback(device, plan, plan.entries[i].seq)?;
            return Err(e);
        }
        plan.entries[i].completed = true;
    }

    rewrite_extents(plan, fs, chunks, extent_hash.as_ref())?;
    device.sync()?;
    Ok(())
}

fn copy_entry(device: &dyn BlockDevice, entry: &mut RelocationEntry) -> Result<(), ConvertError> {
    let mut buf = vec![0u8; COPY_CHUNK.min(entry.length as usize)];
    let mut done = 0u64;
    let mut crc = 0u32;
    while done < entry.length {
        let chunk = buf.len().min((entry.length - done) as usize);
        device.read_at(entry.src_offset + done, &mut buf[..chunk])?;
        // Continuing from zero yields the plain one-shot value on the
        // first chunk.
        crc = crc32c_continue(crc, &buf[..chunk]);
        entry.checksum = crc;
        device.write_at(entry.dst_offset + done, &buf[..chunk])?;
        done += chunk as u64;
    }
    debug!(
        "relocated {} byte(s) {:#x} -> {:#x} (crc {:#010x})",
        entry.length, entry.src_offset, entry.dst_offset, entry.checksum
    );
    Ok(())
}

/// Copy completed entries back, newest first, up to and excluding
/// `failed_seq`.
pub fn partial_rollback(
    device: &dyn BlockDevice,
    plan: &RelocationPlan,
    failed_seq: u32,
) -> Result<(), ConvertError> {
    for entry in plan
        .entries
        .iter()
        .rev()
        .filter(|e| e.completed && e.seq < failed_seq)
    {
        migration::copy_range(device, entry.dst_offset, entry.src_offset, entry.length)?;
    }
    device.sync()?;
    Ok(())
}

/// One remapped piece of a physical byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    new_start: u64,
    len: u64,
}

/// Map `[start, start+len)` through the sorted plan, yielding maximal
/// contiguous post-relocation segments (identity where nothing moved).
fn remap_range(entries: &[RelocationEntry], start: u64, len: u64) -> Vec<Segment> {
    let mut out: Vec<Segment> = Vec::new();
    let mut pos = start;
    let end = start + len;
    while pos < end {
        let idx = entries.partition_point(|e| e.src_offset + e.length <= pos);
        let segment = if idx < entries.len() && entries[idx].src_offset <= pos {
            let e = &entries[idx];
            let take = (e.src_offset + e.length).min(end) - pos;
            Segment {
                new_start: e.dst_offset + (pos - e.src_offset),
                len: take,
            }
        } else {
            let next = if idx < entries.len() {
                entries[idx].src_offset.min(end)
            } else {
                end
            };
            Segment {
                new_start: pos,
                len: next - pos,
            }
        };
        pos += segment.len;
        match out.last_mut() {
            Some(last) if last.new_start + last.len == segment.new_start => {
                last.len += segment.len;
            }
            _ => out.push(segment),
        }
    }
    out
}

/// Rewrite every extent address to its post-relocation physical
/// offset. The hash handles the common case (an extent moved whole by
/// one entry, including all its CoW aliases); the sweep resolves the
/// rest, splitting uncompressed extents whose destination ended up in
/// several pieces.
fn rewrite_extents(
    plan: &RelocationPlan,
    fs: &mut FsInfo,
    chunks: &ChunkMap,
    extent_hash: Option<&ExtentHash>,
) -> Result<(), ConvertError> {
    let mut moved: HashSet<(u32, u32)> = HashSet::new();

    if let Some(hash) = extent_hash {
        let mut hits = Vec::new();
        for entry in &plan.entries {
            hits.clear();
            hash.lookup_all(entry.src_offset, &mut hits);
            for &(ei, xi) in &hits {
                let extent = &mut fs.entries[ei as usize].extents[xi as usize];
                if extent.disk_num_bytes <= entry.length {
                    extent.disk_bytenr = entry.dst_offset;
                    moved.insert((ei, xi));
                }
            }
        }
    }

    for (ei, entry) in fs.entries.iter_mut().enumerate() {
        let old = std::mem::take(&mut entry.extents);
        for (xi, mut extent) in old.into_iter().enumerate() {
            if extent.kind == ExtentKind::Inline
                || extent.is_hole()
                || moved.contains(&(ei as u32, xi as u32))
            {
                entry.extents.push(extent);
                continue;
            }
            let physical = chunks.resolve_checked(extent.disk_bytenr)?;
            let segments = remap_range(&plan.entries, physical, extent.disk_num_bytes);
            if segments.len() == 1 {
                extent.disk_bytenr = segments[0].new_start;
                entry.extents.push(extent);
                continue;
            }
            if extent.compression != Compression::None {
                return Err(ConvertError::invariant(format!(
                    "compressed extent at {:#x} was scattered by relocation",
                    physical
                )));
            }
            split_extent(&extent, &segments, &mut entry.extents);
        }
    }
    Ok(())
}

/// Break one uncompressed extent into sub-extents, one per relocated
/// segment, preserving the file range it serves.
fn split_extent(extent: &FileExtent, segments: &[Segment], out: &mut Vec<FileExtent>) {
    let file_lo = extent.extent_offset;
    let file_hi = extent.extent_offset + extent.num_bytes;
    let mut seg_off = 0u64;
    for segment in segments {
        let lo = seg_off.max(file_lo);
        let hi = (seg_off + segment.len).min(file_hi);
        seg_off += segment.len;
        if lo >= hi {
            continue;
        }
        out.push(FileExtent {
            file_offset: extent.file_offset + (lo - file_lo),
            disk_bytenr: segment.new_start,
            disk_num_bytes: segment.len,
            num_bytes: hi - lo,
            ram_bytes: segment.len,
            extent_offset: lo - (seg_off - segment.len),
            compression: Compression::None,
            kind: extent.kind,
            inline_data: None,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(src: u64, dst: u64, len: u64) -> RelocationEntry {
        RelocationEntry {
            src_offset: src,
            dst_offset: dst,
            length: len,
            checksum: 0,
            seq: 0,
            completed: false,
        }
    }

    #[test]
    fn coalesce_merges_adjacent_pairs() {
        let mut entries = vec![
            entry(0, 1 << 20, 4096),
            entry(4096, (1 << 20) + 4096, 4096),
            entry(8192, 5 << 20, 4096),
        ];
        coalesce(&mut entries);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].length, 8192);
        assert_eq!(entries[1].src_offset, 8192);
    }

    #[test]
    fn coalesce_requires_both_sides_adjacent() {
        let mut entries = vec![
            entry(0, 1 << 20, 4096),
            // Source adjacent, destination not.
            entry(4096, 3 << 20, 4096),
        ];
        coalesce(&mut entries);
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn extent_hash_surfaces_cow_aliases() {
        let mut hash = ExtentHash {
            slots: vec![None; 16],
            mask: 15,
        };
        hash.insert(0x4000, 1, 0);
        hash.insert(0x4000, 2, 3);
        hash.insert(0x8000, 3, 1);
        let mut hits = Vec::new();
        hash.lookup_all(0x4000, &mut hits);
        hits.sort_unstable();
        assert_eq!(hits, vec![(1, 0), (2, 3)]);
        hits.clear();
        hash.lookup_all(0xC000, &mut hits);
        assert!(hits.is_empty());
    }
}
