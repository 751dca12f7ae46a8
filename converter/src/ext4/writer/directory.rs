// Directory block construction.
//
// A directory whose linear layout fits one block is written linearly.
// Anything larger becomes an HTree: block 0 is the dx root (".", "..",
// dx_root_info, count/limit, index entries), block 1 an intermediate
// index node, blocks 2.. the hashed leaves. Entries are distributed by
// the legacy name hash; a leaf never splits a hash value across its
// boundary.

use log::trace;

use fsmorph_core::{BatchWriter, BlockDevice, ConvertError};

use crate::ext4::checksum;
use crate::ext4::constants::*;
use crate::ext4::structures::{put_u16, put_u32, write_dirent};

/// One child as the directory writer needs it.
#[derive(Debug, Clone)]
pub struct DirChild {
    pub name: Vec<u8>,
    pub ino: u32,
    pub file_type: u8,
}

/// Planned shape of one directory.
#[derive(Debug, Clone)]
pub struct DirShape {
    pub htree: bool,
    pub block_count: u64,
}

/// 12-byte tail holding the block checksum, counted as a dirent with
/// inode 0.
const DIRENT_TAIL: usize = 12;
/// dx root: dot (12) + dotdot (12) + dx_root_info (8).
const DX_ROOT_ENTRIES_OFF: usize = 32;
/// dx node: 8-byte fake dirent.
const DX_NODE_ENTRIES_OFF: usize = 8;
/// dx_tail: reserved + checksum.
const DX_TAIL: usize = 8;

fn rec_len(name_len: usize) -> usize {
    (8 + name_len + 3) & !3
}

/// Legacy ext4 directory hash: per character, rotate left by eight,
/// fold in the padding constant and the byte.
pub fn ext4_legacy_hash(name: &[u8]) -> u32 {
    let mut hash = DX_HASH_SEED_INIT;
    for &byte in name {
        hash = hash.rotate_left(8) ^ DX_HASH_PADDING ^ byte as u32;
    }
    // High bit is reserved, lowest bit marks continuation entries.
    hash & 0x7FFF_FFFE
}

/// Decide linear versus HTree and count blocks.
pub fn plan_shape(children: &[DirChild], block_size: u32) -> DirShape {
    let bs = block_size as usize;
    let mut linear = 24usize; // "." and ".."
    for child in children {
        linear += rec_len(child.name.len());
    }
    if linear + DIRENT_TAIL <= bs {
        return DirShape {
            htree: false,
            block_count: 1,
        };
    }
    let leaves = hash_and_split(children, block_size).len() as u64;
    DirShape {
        htree: true,
        block_count: 2 + leaves,
    }
}

/// Sort children by hash and cut them into leaf-sized groups without
/// splitting a hash value across leaves. Returns each leaf's children
/// (still hash-ordered) with the leaf's lowest hash.
fn hash_and_split(children: &[DirChild], block_size: u32) -> Vec<(u32, Vec<DirChild>)> {
    let bs = block_size as usize;
    let capacity = bs - DIRENT_TAIL;

    let mut hashed: Vec<(u32, DirChild)> = children
        .iter()
        .map(|c| (ext4_legacy_hash(&c.name), c.clone()))
        .collect();
    hashed.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.name.cmp(&b.1.name)));

    let mut leaves: Vec<(u32, Vec<DirChild>)> = Vec::new();
    let mut current: Vec<DirChild> = Vec::new();
    let mut current_bytes = 0usize;
    let mut current_hash = 0u32;
    let mut last_hash: Option<u32> = None;

    for (hash, child) in hashed {
        let len = rec_len(child.name.len());
        let same_hash_as_prev = last_hash == Some(hash);
        if !current.is_empty() && current_bytes + len > capacity && !same_hash_as_prev {
            leaves.push((current_hash, std::mem::take(&mut current)));
            current_bytes = 0;
        }
        if current.is_empty() {
            current_hash = hash;
        }
        current_bytes += len;
        current.push(child);
        last_hash = Some(hash);
    }
    if !current.is_empty() {
        leaves.push((current_hash, current));
    }
    leaves
}

pub struct DirectoryWriter<'a> {
    pub device: &'a dyn BlockDevice,
    pub block_size: u32,
    pub csum_seed: u32,
}

impl<'a> DirectoryWriter<'a> {
    /// Write the directory's content into its allocated blocks.
    /// `blocks[i]` is the physical block of logical block `i`.
    pub fn write(
        &mut self,
        ino: u32,
        parent_ino: u32,
        children: &[DirChild],
        shape: &DirShape,
        blocks: &[u64],
    ) -> Result<(), ConvertError> {
        if blocks.len() as u64 != shape.block_count {
            return Err(ConvertError::invariant(format!(
                "directory {} allocated {} block(s), shape wants {}",
                ino,
                blocks.len(),
                shape.block_count
            )));
        }
        let content = if shape.htree {
            self.build_htree(ino, parent_ino, children)?
        } else {
            vec![self.build_linear(ino, parent_ino, children)?]
        };

        // Contiguous directories go out in a single write; scattered
        // ones through the batch surface.
        let bs = self.block_size as u64;
        let contiguous = blocks.windows(2).all(|w| w[1] == w[0] + 1);
        if contiguous {
            let flat: Vec<u8> = content.concat();
            self.device.write_at(blocks[0] * bs, &flat)?;
        } else {
            let mut batch = BatchWriter::begin(self.device);
            for (i, block) in content.iter().enumerate() {
                batch.add(blocks[i] * bs, block)?;
            }
            batch.submit()?;
        }
        trace!(
            "directory {} written: {} block(s), htree={}",
            ino,
            blocks.len(),
            shape.htree
        );
        Ok(())
    }

    fn stamp_dirent_tail(&self, block: &mut [u8], ino: u32) {
        let bs = block.len();
        put_u32(block, bs - DIRENT_TAIL, 0); // inode 0
        put_u16(block, bs - DIRENT_TAIL + 4, DIRENT_TAIL as u16);
        block[bs - DIRENT_TAIL + 6] = 0;
        block[bs - DIRENT_TAIL + 7] = 0xDE;
        let crc = checksum::dirent_block_checksum(block, ino, 0, self.csum_seed);
        put_u32(block, bs - 4, crc);
    }

    fn build_linear(
        &self,
        ino: u32,
        parent_ino: u32,
        children: &[DirChild],
    ) -> Result<Vec<u8>, ConvertError> {
        let bs = self.block_size as usize;
        let mut block = vec![0u8; bs];
        write_dirent(&mut block, 0, ino, 12, b".", EXT4_FT_DIR);
        write_dirent(&mut block, 12, parent_ino, 12, b"..", EXT4_FT_DIR);
        let mut off = 24;
        for (i, child) in children.iter().enumerate() {
            let len = rec_len(child.name.len());
            let is_last = i == children.len() - 1;
            let this_rec = if is_last {
                bs - DIRENT_TAIL - off
            } else {
                len
            };
            write_dirent(
                &mut block,
                off,
                child.ino,
                this_rec as u16,
                &child.name,
                child.file_type,
            );
            off += this_rec;
        }
        if children.is_empty() {
            // ".." absorbs the rest of the block.
            put_u16(&mut block, 16, (bs - DIRENT_TAIL - 12) as u16);
        }
        self.stamp_dirent_tail(&mut block, ino);
        Ok(block)
    }

    fn build_htree(
        &self,
        ino: u32,
        parent_ino: u32,
        children: &[DirChild],
    ) -> Result<Vec<Vec<u8>>, ConvertError> {
        let bs = self.block_size as usize;
        let leaves = hash_and_split(children, self.block_size);

        // Index capacity checks: one root entry points at the node,
        // the node indexes every leaf.
        let node_limit = (bs - DX_NODE_ENTRIES_OFF - DX_TAIL) / 8 - 1;
        if leaves.len() > node_limit {
            return Err(ConvertError::unsupported(format!(
                "directory with {} htree leaves exceeds one index node",
                leaves.len()
            )));
        }

        let mut blocks: Vec<Vec<u8>> = Vec::with_capacity(2 + leaves.len());

        // Block 0: dx root.
        let mut root = vec![0u8; bs];
        write_dirent(&mut root, 0, ino, 12, b".", EXT4_FT_DIR);
        write_dirent(&mut root, 12, parent_ino, (bs - 12) as u16, b"..", EXT4_FT_DIR);
        // dx_root_info at offset 24.
        put_u32(&mut root, 24, 0); // reserved
        root[28] = DX_HASH_LEGACY;
        root[29] = 8; // info length
        root[30] = 1; // indirect levels: root -> node -> leaves
        root[31] = 0;
        let root_limit = (bs - DX_ROOT_ENTRIES_OFF - DX_TAIL) / 8;
        put_u16(&mut root, DX_ROOT_ENTRIES_OFF, root_limit as u16);
        put_u16(&mut root, DX_ROOT_ENTRIES_OFF + 2, 1); // count: the node entry
        put_u32(&mut root, DX_ROOT_ENTRIES_OFF + 4, 1); // logical block of the node
        self.stamp_dx_tail(&mut root, ino, DX_ROOT_ENTRIES_OFF, 1);
        blocks.push(root);

        // Block 1: intermediate index node.
        let mut node = vec![0u8; bs];
        // Fake dirent spanning the block keeps linear readers moving.
        put_u32(&mut node, 0, 0);
        put_u16(&mut node, 4, bs as u16);
        // The count/limit pair overlays the first entry's hash field;
        // that entry's block points at the first leaf, later entries
        // carry each leaf's lowest hash.
        put_u16(&mut node, DX_NODE_ENTRIES_OFF, (node_limit + 1) as u16);
        put_u16(&mut node, DX_NODE_ENTRIES_OFF + 2, leaves.len() as u16);
        put_u32(&mut node, DX_NODE_ENTRIES_OFF + 4, 2);
        for (i, (hash, _)) in leaves.iter().enumerate().skip(1) {
            let off = DX_NODE_ENTRIES_OFF + 8 * i;
            put_u32(&mut node, off, *hash);
            put_u32(&mut node, off + 4, 2 + i as u32);
        }
        self.stamp_dx_tail(&mut node, ino, DX_NODE_ENTRIES_OFF, leaves.len());
        blocks.push(node);

        // Leaf blocks.
        for (_, leaf_children) in &leaves {
            let mut block = vec![0u8; bs];
            let mut off = 0usize;
            for (i, child) in leaf_children.iter().enumerate() {
                let len = rec_len(child.name.len());
                let is_last = i == leaf_children.len() - 1;
                let this_rec = if is_last {
                    bs - DIRENT_TAIL - off
                } else {
                    len
                };
                write_dirent(
                    &mut block,
                    off,
                    child.ino,
                    this_rec as u16,
                    &child.name,
                    child.file_type,
                );
                off += this_rec;
            }
            self.stamp_dirent_tail(&mut block, ino);
            blocks.push(block);
        }
        Ok(blocks)
    }

    /// dx root/node blocks checksum only the entries in use, not the
    /// padding up to `limit`.
    fn stamp_dx_tail(&self, block: &mut [u8], ino: u32, count_offset: usize, count: usize) {
        let bs = block.len();
        put_u32(block, bs - 8, 0); // dt_reserved
        let crc = checksum::dx_block_checksum(block, count_offset, count, ino, self.csum_seed);
        put_u32(block, bs - 4, crc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn children(n: usize) -> Vec<DirChild> {
        (0..n)
            .map(|i| DirChild {
                name: format!("file_{:04}.dat", i).into_bytes(),
                ino: 11 + i as u32,
                file_type: EXT4_FT_REG_FILE,
            })
            .collect()
    }

    #[test]
    fn legacy_hash_is_deterministic_and_even() {
        let a = ext4_legacy_hash(b"file_0000.dat");
        assert_eq!(a, ext4_legacy_hash(b"file_0000.dat"));
        assert_eq!(a & 1, 0);
        assert_eq!(a & 0x8000_0000, 0);
        assert_ne!(a, ext4_legacy_hash(b"file_0001.dat"));
    }

    #[test]
    fn small_directory_stays_linear() {
        let shape = plan_shape(&children(10), 4096);
        assert!(!shape.htree);
        assert_eq!(shape.block_count, 1);
    }

    #[test]
    fn large_directory_becomes_htree() {
        let kids = children(1000);
        let shape = plan_shape(&kids, 4096);
        assert!(shape.htree);
        // 1000 entries of 20 bytes need at least five leaves.
        assert!(shape.block_count >= 2 + 5);
    }

    #[test]
    fn dx_blocks_carry_kernel_shaped_checksums() {
        use crate::ext4::checksum::{dirent_block_checksum, dx_block_checksum};
        use crate::ext4::structures::get_u32;
        use fsmorph_core::FileBlockDevice;

        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(4096).unwrap();
        let device = FileBlockDevice::open(file.path(), true).unwrap();
        let writer = DirectoryWriter {
            device: &device,
            block_size: 4096,
            csum_seed: 0x00C0_FFEE,
        };

        let kids = children(1000);
        let blocks = writer.build_htree(2, 2, &kids).unwrap();
        assert!(blocks.len() > 3);

        // dx root: one entry in use at offset 32; the checksum must
        // cover only that entry plus the tail, not the whole block.
        let root = &blocks[0];
        let stored = get_u32(root, 4096 - 4);
        assert_eq!(stored, dx_block_checksum(root, 32, 1, 2, 0x00C0_FFEE));
        assert_ne!(stored, dirent_block_checksum(root, 2, 0, 0x00C0_FFEE));

        // dx node: one entry per leaf, entries at offset 8.
        let leaf_count = blocks.len() - 2;
        let node = &blocks[1];
        let stored = get_u32(node, 4096 - 4);
        assert_eq!(
            stored,
            dx_block_checksum(node, 8, leaf_count, 2, 0x00C0_FFEE)
        );

        // Hashed leaves keep the ordinary 12-byte dirent tail.
        let leaf = &blocks[2];
        let stored = get_u32(leaf, 4096 - 4);
        assert_eq!(stored, dirent_block_checksum(leaf, 2, 0, 0x00C0_FFEE));
    }

    #[test]
    fn hash_split_keeps_order_and_everyone() {
        let kids = children(1000);
        let leaves = hash_and_split(&kids, 4096);
        let total: usize = leaves.iter().map(|(_, l)| l.len()).sum();
        assert_eq!(total, 1000);
        // Leaf boundary hashes ascend.
        for pair in leaves.windows(2) {
            assert!(pair[0].0 <= pair[1].0);
        }
        // Every child hashes at or above its leaf's boundary hash, and
        // below the next leaf's.
        for (i, (low, leaf)) in leaves.iter().enumerate() {
            for child in leaf {
                let h = ext4_legacy_hash(&child.name);
                if i > 0 {
                    assert!(h >= *low);
                }
                if i + 1 < leaves.len() {
                    assert!(h <= leaves[i + 1].0);
                }
            }
        }
    }
}
