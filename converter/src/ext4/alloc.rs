// Global block allocator for the conversion.
//
// Seeded with the planned metadata blocks and every block the btrfs
// volume already occupies, so relocation destinations, journal blocks,
// extent-tree nodes, directory blocks and decompressed data never land
// on bytes that still matter. The bitmap doubles as the source of the
// on-disk block bitmaps at the end of pass 3.

use log::trace;

use fsmorph_core::ConvertError;

use crate::model::UsedBlockMap;

use super::bitmap::Bitmap;
use super::layout::Ext4Layout;

pub struct BlockAllocator {
    bitmap: Bitmap,
    block_size: u64,
    hint: u64,
}

impl BlockAllocator {
    pub fn new(layout: &Ext4Layout, used: &UsedBlockMap) -> Self {
        let mut bitmap = layout.reserved_bitmap();
        let bs = layout.block_size as u64;
        for range in used.ranges() {
            let first = range.start / bs;
            let last = (range.start + range.length).div_ceil(bs);
            bitmap.set_range(first, last - first);
        }
        Self {
            bitmap,
            block_size: bs,
            hint: 0,
        }
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn is_used(&self, block: u64) -> bool {
        self.bitmap.is_set(block)
    }

    pub fn mark_used(&mut self, block: u64, count: u64) {
        self.bitmap.set_range(block, count);
    }

    pub fn free_blocks(&self) -> u64 {
        self.bitmap.count_clear()
    }

    /// Allocate `count` consecutive blocks.
    pub fn allocate_run(&mut self, count: u64) -> Result<u64, ConvertError> {
        let start = self
            .bitmap
            .find_clear_run(self.hint, count)
            .or_else(|| self.bitmap.find_clear_run(0, count))
            .ok_or_else(|| {
                ConvertError::SpaceExhausted(format!(
                    "no free run of {} block(s) left",
                    count
                ))
            })?;
        self.bitmap.set_range(start, count);
        self.hint = start + count;
        trace!("allocated run [{}, {})", start, start + count);
        Ok(start)
    }

    /// Allocate `count` blocks, preferring one run but degrading to
    /// fragments when the space is no longer contiguous. Returns
    /// `(start, len)` pieces covering exactly `count` blocks.
    pub fn allocate_blocks(&mut self, count: u64) -> Result<Vec<(u64, u64)>, ConvertError> {
        if let Ok(start) = self.allocate_run(count) {
            return Ok(vec![(start, count)]);
        }
        let mut pieces = Vec::new();
        let mut remaining = count;
        while remaining > 0 {
            let start = match self
                .bitmap
                .find_clear(self.hint)
                .or_else(|| self.bitmap.find_clear(0))
            {
                Some(b) => b,
                None => {
                    // Undo the partial allocation before failing.
                    for &(s, l) in &pieces {
                        for b in s..s + l {
                            self.bitmap.clear(b);
                        }
                    }
                    return Err(ConvertError::SpaceExhausted(format!(
                        "no free space for {} more block(s)",
                        remaining
                    )));
                }
            };
            let mut len = 0u64;
            while len < remaining && !self.bitmap.is_set(start + len) && start + len < self.bitmap.len_bits()
            {
                len += 1;
            }
            self.bitmap.set_range(start, len);
            self.hint = start + len;
            pieces.push((start, len));
            remaining -= len;
        }
        Ok(pieces)
    }

    /// Claim `[start, start+count)` if every block is free.
    pub fn allocate_at(&mut self, start: u64, count: u64) -> bool {
        if start + count > self.bitmap.len_bits() {
            return false;
        }
        for b in start..start + count {
            if self.bitmap.is_set(b) {
                return false;
            }
        }
        self.bitmap.set_range(start, count);
        true
    }

    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FileEntry, FsInfo, USED_FLAG_DATA};

    fn test_allocator() -> BlockAllocator {
        let mut fs = FsInfo::default();
        fs.entries.push(FileEntry {
            ino: 256,
            mode: crate::model::S_IFDIR | 0o755,
            ..FileEntry::default()
        });
        let layout = crate::ext4::layout::plan_layout(128 << 20, 4096, 16384, &fs).unwrap();
        let mut used = UsedBlockMap::new();
        used.add(600 * 4096, 16 * 4096, USED_FLAG_DATA);
        used.normalize();
        BlockAllocator::new(&layout, &used)
    }

    #[test]
    fn seeded_blocks_are_used() {
        let alloc = test_allocator();
        assert!(alloc.is_used(0)); // superblock
        assert!(alloc.is_used(600));
        assert!(alloc.is_used(615));
        assert!(!alloc.is_used(616));
    }

    #[test]
    fn runs_do_not_overlap_used_space() {
        let mut alloc = test_allocator();
        let a = alloc.allocate_run(32).unwrap();
        let b = alloc.allocate_run(32).unwrap();
        assert!(a + 32 <= b || b + 32 <= a);
        for blk in a..a + 32 {
            assert!(alloc.is_used(blk));
        }
    }

    #[test]
    fn fragmented_allocation_covers_count() {
        let mut alloc = test_allocator();
        // Punch a comb pattern into free space to force fragmentation.
        for i in 0..128u64 {
            alloc.mark_used(1000 + i * 2, 1);
        }
        let pieces = alloc.allocate_blocks(200).unwrap();
        let total: u64 = pieces.iter().map(|&(_, l)| l).sum();
        assert_eq!(total, 200);
    }

    #[test]
    fn allocate_at_respects_occupancy() {
        let mut alloc = test_allocator();
        assert!(!alloc.allocate_at(600, 4)); // seeded as used
        assert!(alloc.allocate_at(700, 4));
        assert!(!alloc.allocate_at(700, 1)); // now taken
    }
}
