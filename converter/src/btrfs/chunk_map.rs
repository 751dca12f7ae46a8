// Btrfs logical to physical address resolution.
//
// The superblock's system chunk array bootstraps enough mappings to
// read the chunk tree; walking the chunk tree then yields the full set.
// Entries are kept sorted and non-overlapping so resolution is a
// binary search.

use log::debug;

use fsmorph_core::{BlockDevice, ConvertError};

use super::structures::{ChunkItem, DiskKey, CHUNK_ITEM_KEY, KEY_SIZE};
use super::superblock::BtrfsSuperblock;
use super::tree::{self, WalkAction};

/// Returned by [`ChunkMap::resolve`] when no mapping covers an address.
pub const RESOLVE_NOT_FOUND: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMapping {
    pub logical_start: u64,
    pub physical_start: u64,
    pub length: u64,
    pub type_flags: u64,
}

#[derive(Debug, Default)]
pub struct ChunkMap {
    entries: Vec<ChunkMapping>,
    sorted: bool,
}

impl ChunkMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, logical_start: u64, physical_start: u64, length: u64, type_flags: u64) {
        self.entries.push(ChunkMapping {
            logical_start,
            physical_start,
            length,
            type_flags,
        });
        self.sorted = false;
    }

    /// Parse the superblock's `sys_chunk_array`: repeated
    /// `(key, chunk, stripes)` records. Only CHUNK_ITEM keys are
    /// accepted; the first stripe provides the physical offset.
    pub fn init_from_superblock(&mut self, sb: &BtrfsSuperblock) -> Result<(), ConvertError> {
        let array = &sb.sys_chunk_array;
        let mut off = 0usize;
        while off < array.len() {
            let key = DiskKey::parse(array, off)?;
            if key.key_type != CHUNK_ITEM_KEY {
                return Err(ConvertError::corruption(format!(
                    "unexpected key type {} in system chunk array",
                    key.key_type
                )));
            }
            off += KEY_SIZE;
            let chunk = ChunkItem::parse(array, off)?;
            off += chunk.encoded_len;
            self.add(key.offset, chunk.stripe0_offset, chunk.length, chunk.type_flags);
        }
        self.finish();
        debug!(
            "bootstrapped {} system chunk mapping(s) from superblock",
            self.entries.len()
        );
        Ok(())
    }

    /// Walk the chunk tree to pick up every chunk item the bootstrap
    /// array did not carry.
    pub fn populate(
        &mut self,
        device: &dyn BlockDevice,
        sb: &BtrfsSuperblock,
    ) -> Result<(), ConvertError> {
        let mut found: Vec<(u64, ChunkMapping)> = Vec::new();
        tree::walk(
            device,
            self,
            sb,
            sb.chunk_root,
            sb.chunk_root_level,
            &mut |key, data| {
                if key.key_type == CHUNK_ITEM_KEY {
                    let chunk = ChunkItem::parse(data, 0)?;
                    found.push((
                        key.offset,
                        ChunkMapping {
                            logical_start: key.offset,
                            physical_start: chunk.stripe0_offset,
                            length: chunk.length,
                            type_flags: chunk.type_flags,
                        },
                    ));
                }
                Ok(WalkAction::Continue)
            },
        )?;
        for (logical, mapping) in found {
            if self.lookup(logical).is_none() {
                self.entries.push(mapping);
                self.sorted = false;
            }
        }
        self.finish();
        debug!("chunk map populated: {} mapping(s)", self.entries.len());
        Ok(())
    }

    fn finish(&mut self) {
        self.entries.sort_by_key(|e| e.logical_start);
        self.sorted = true;
    }

    fn lookup(&self, logical: u64) -> Option<&ChunkMapping> {
        if !self.sorted {
            return self
                .entries
                .iter()
                .find(|e| logical >= e.logical_start && logical < e.logical_start + e.length);
        }
        let idx = match self
            .entries
            .binary_search_by(|e| e.logical_start.cmp(&logical))
        {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        let entry = &self.entries[idx];
        if logical < entry.logical_start + entry.length {
            Some(entry)
        } else {
            None
        }
    }

    /// Resolve a logical byte address to its physical counterpart, or
    /// [`RESOLVE_NOT_FOUND`].
    pub fn resolve(&self, logical: u64) -> u64 {
        match self.lookup(logical) {
            Some(e) => e.physical_start + (logical - e.logical_start),
            None => RESOLVE_NOT_FOUND,
        }
    }

    pub fn resolve_checked(&self, logical: u64) -> Result<u64, ConvertError> {
        match self.resolve(logical) {
            RESOLVE_NOT_FOUND => Err(ConvertError::corruption(format!(
                "no chunk mapping covers logical address {:#x}",
                logical
            ))),
            physical => Ok(physical),
        }
    }

    pub fn mappings(&self) -> &[ChunkMapping] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_with(entries: &[(u64, u64, u64)]) -> ChunkMap {
        let mut map = ChunkMap::new();
        for &(logical, physical, len) in entries {
            map.add(logical, physical, len, 0);
        }
        map.finish();
        map
    }

    #[test]
    fn resolve_inside_every_mapping() {
        let entries = [
            (0u64, 1048576u64, 4194304u64),
            (4194304, 12582912, 8388608),
            (20971520, 104857600, 1048576),
        ];
        let map = map_with(&entries);
        for &(logical, physical, len) in &entries {
            for off in [0u64, 1, 4095, len / 2, len - 1] {
                assert_eq!(map.resolve(logical + off), physical + off);
            }
        }
    }

    #[test]
    fn resolve_outside_returns_sentinel() {
        let map = map_with(&[(4096, 8192, 4096)]);
        assert_eq!(map.resolve(0), RESOLVE_NOT_FOUND);
        assert_eq!(map.resolve(4095), RESOLVE_NOT_FOUND);
        assert_eq!(map.resolve(8192), RESOLVE_NOT_FOUND);
        assert_eq!(map.resolve(u64::MAX), RESOLVE_NOT_FOUND);
    }

    #[test]
    fn unsorted_additions_resolve_after_finish() {
        let map = map_with(&[(1 << 30, 4096, 4096), (0, 8192, 4096)]);
        assert_eq!(map.resolve(0), 8192);
        assert_eq!(map.resolve(1 << 30), 4096);
    }
}
