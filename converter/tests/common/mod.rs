// Builds miniature, byte-accurate btrfs images for the integration
// suites: a valid superblock with a single identity-mapped system
// chunk, chunk/root/extent trees, and an FS tree that spills into
// multiple leaves under one internal node when the file set demands
// it.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::Write;

use byteorder::{ByteOrder, LittleEndian};
use tempfile::NamedTempFile;

use fsmorph_converter::btrfs::structures::*;
use fsmorph_converter::btrfs::superblock::{finish_superblock_checksum, offsets};

pub const NODE_SIZE: usize = 4096;
/// Metadata nodes live from here (identity logical = physical).
pub const METADATA_BASE: u64 = 4 << 20;

/// Wire the log output into `cargo test` capture.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

const MOCK_TIME: u64 = 1_700_000_000;

type Key = (u64, u8, u64);

#[derive(Clone)]
pub struct TestFile {
    pub ino: u64,
    pub parent: u64,
    pub name: Vec<u8>,
    pub mode: u32,
    pub size: u64,
    /// Inline payload, exclusive with `regular`.
    pub inline: Option<Vec<u8>>,
    /// `(file_offset, disk_bytenr, data)` regular extents; data is
    /// written at `disk_bytenr` in the image.
    pub regular: Vec<(u64, u64, Vec<u8>)>,
}

impl TestFile {
    pub fn inline_file(ino: u64, name: &str, payload: &[u8]) -> Self {
        Self {
            ino,
            parent: 256,
            name: name.as_bytes().to_vec(),
            mode: 0o100644,
            size: payload.len() as u64,
            inline: Some(payload.to_vec()),
            regular: Vec::new(),
        }
    }

    pub fn regular_file(ino: u64, name: &str, disk_bytenr: u64, data: Vec<u8>) -> Self {
        Self {
            ino,
            parent: 256,
            name: name.as_bytes().to_vec(),
            mode: 0o100644,
            size: data.len() as u64,
            inline: None,
            regular: vec![(0, disk_bytenr, data)],
        }
    }
}

pub struct BtrfsImageBuilder {
    pub size: u64,
    pub label: String,
    pub files: Vec<TestFile>,
}

fn put16(buf: &mut [u8], off: usize, v: u16) {
    LittleEndian::write_u16(&mut buf[off..off + 2], v);
}

fn put32(buf: &mut [u8], off: usize, v: u32) {
    LittleEndian::write_u32(&mut buf[off..off + 4], v);
}

fn put64(buf: &mut [u8], off: usize, v: u64) {
    LittleEndian::write_u64(&mut buf[off..off + 8], v);
}

fn key_bytes(key: Key) -> [u8; KEY_SIZE] {
    let mut b = [0u8; KEY_SIZE];
    put64(&mut b, 0, key.0);
    b[8] = key.1;
    put64(&mut b, 9, key.2);
    b
}

fn inode_item_bytes(mode: u32, size: u64, nlink: u32) -> Vec<u8> {
    let mut b = vec![0u8; INODE_ITEM_SIZE];
    put64(&mut b, 0, 1); // generation
    put64(&mut b, 16, size);
    put32(&mut b, 40, nlink);
    put32(&mut b, 44, 1000); // uid
    put32(&mut b, 48, 1000); // gid
    put32(&mut b, 52, mode);
    for time_off in [112usize, 124, 136, 148] {
        put64(&mut b, time_off, MOCK_TIME);
        put32(&mut b, time_off + 8, 0);
    }
    b
}

fn inode_ref_bytes(index: u64, name: &[u8]) -> Vec<u8> {
    let mut b = vec![0u8; 10 + name.len()];
    put64(&mut b, 0, index);
    put16(&mut b, 8, name.len() as u16);
    b[10..].copy_from_slice(name);
    b
}

fn dir_index_bytes(child: u64, name: &[u8], file_type: u8) -> Vec<u8> {
    let mut b = vec![0u8; DIR_ITEM_HEADER + name.len()];
    b[..KEY_SIZE].copy_from_slice(&key_bytes((child, INODE_ITEM_KEY, 0)));
    put64(&mut b, KEY_SIZE, 1); // transid
    put16(&mut b, KEY_SIZE + 8, 0); // data_len
    put16(&mut b, KEY_SIZE + 10, name.len() as u16);
    b[KEY_SIZE + 12] = file_type;
    b[DIR_ITEM_HEADER..].copy_from_slice(name);
    b
}

fn extent_data_inline_bytes(payload: &[u8]) -> Vec<u8> {
    let mut b = vec![0u8; FILE_EXTENT_INLINE_HEADER + payload.len()];
    put64(&mut b, 0, 1); // generation
    put64(&mut b, 8, payload.len() as u64); // ram_bytes
    b[20] = FILE_EXTENT_INLINE;
    b[FILE_EXTENT_INLINE_HEADER..].copy_from_slice(payload);
    b
}

fn extent_data_regular_bytes(disk_bytenr: u64, num_bytes: u64) -> Vec<u8> {
    let mut b = vec![0u8; FILE_EXTENT_REG_SIZE];
    put64(&mut b, 0, 1);
    put64(&mut b, 8, num_bytes); // ram_bytes
    b[20] = FILE_EXTENT_REG;
    put64(&mut b, 21, disk_bytenr);
    put64(&mut b, 29, num_bytes);
    put64(&mut b, 37, 0); // offset
    put64(&mut b, 45, num_bytes);
    b
}

fn root_item_bytes(bytenr: u64, level: u8, dirid: u64) -> Vec<u8> {
    let mut b = vec![0u8; ROOT_ITEM_MIN_SIZE];
    b[..INODE_ITEM_SIZE].copy_from_slice(&inode_item_bytes(0o040755, 0, 1));
    put64(&mut b, INODE_ITEM_SIZE + 8, dirid);
    put64(&mut b, INODE_ITEM_SIZE + 16, bytenr);
    b[238] = level;
    b
}

fn extent_item_bytes(flags: u64) -> Vec<u8> {
    let mut b = vec![0u8; 24];
    put64(&mut b, 0, 1); // refs
    put64(&mut b, 8, 1); // generation
    put64(&mut b, 16, flags);
    b
}

fn write_node_header(node: &mut [u8], logical: u64, owner: u64, nritems: u32, level: u8) {
    node[0x20..0x30].copy_from_slice(&[7u8; 16]); // fsid
    put64(node, 0x30, logical);
    put64(node, 0x38, 1); // flags: WRITTEN
    put64(node, 0x50, 1); // generation
    put64(node, 0x58, owner);
    put32(node, 0x60, nritems);
    node[0x64] = level;
}

fn finish_node_checksum(node: &mut [u8]) {
    let crc = crc32c::crc32c(&node[0x20..]);
    node[..4].copy_from_slice(&crc.to_le_bytes());
    for b in &mut node[4..0x20] {
        *b = 0;
    }
}

fn write_leaf(image: &mut [u8], logical: u64, owner: u64, items: &[(Key, Vec<u8>)]) {
    let mut node = vec![0u8; NODE_SIZE];
    write_node_header(&mut node, logical, owner, items.len() as u32, 0);
    let mut data_end = NODE_SIZE;
    for (i, (key, data)) in items.iter().enumerate() {
        data_end -= data.len();
        let item_off = HEADER_SIZE + i * ITEM_SIZE;
        node[item_off..item_off + KEY_SIZE].copy_from_slice(&key_bytes(*key));
        put32(&mut node, item_off + KEY_SIZE, (data_end - HEADER_SIZE) as u32);
        put32(&mut node, item_off + KEY_SIZE + 4, data.len() as u32);
        node[data_end..data_end + data.len()].copy_from_slice(data);
    }
    finish_node_checksum(&mut node);
    let off = logical as usize;
    image[off..off + NODE_SIZE].copy_from_slice(&node);
}

fn write_internal(image: &mut [u8], logical: u64, owner: u64, ptrs: &[(Key, u64)], level: u8) {
    let mut node = vec![0u8; NODE_SIZE];
    write_node_header(&mut node, logical, owner, ptrs.len() as u32, level);
    for (i, (key, child)) in ptrs.iter().enumerate() {
        let off = HEADER_SIZE + i * KEY_PTR_SIZE;
        node[off..off + KEY_SIZE].copy_from_slice(&key_bytes(*key));
        put64(&mut node, off + KEY_SIZE, *child);
        put64(&mut node, off + KEY_SIZE + 8, 1); // generation
    }
    finish_node_checksum(&mut node);
    let off = logical as usize;
    image[off..off + NODE_SIZE].copy_from_slice(&node);
}

/// Pack sorted items into as many leaves as they need and return the
/// root (logical, level), advancing `next_logical`.
fn write_tree(
    image: &mut [u8],
    owner: u64,
    items: &[(Key, Vec<u8>)],
    next_logical: &mut u64,
) -> (u64, u8) {
    let usable = NODE_SIZE - HEADER_SIZE;
    let mut leaves: Vec<(Key, u64)> = Vec::new();
    let mut start = 0usize;
    while start < items.len() || leaves.is_empty() {
        let mut used = 0usize;
        let mut end = start;
        while end < items.len() && used + ITEM_SIZE + items[end].1.len() <= usable {
            used += ITEM_SIZE + items[end].1.len();
            end += 1;
        }
        let logical = *next_logical;
        *next_logical += NODE_SIZE as u64;
        write_leaf(image, logical, owner, &items[start..end]);
        let first_key = items
            .get(start)
            .map(|(k, _)| *k)
            .unwrap_or((0, 0, 0));
        leaves.push((first_key, logical));
        if end == start {
            break;
        }
        start = end;
    }
    if leaves.len() == 1 {
        return (leaves[0].1, 0);
    }
    let logical = *next_logical;
    *next_logical += NODE_SIZE as u64;
    write_internal(image, logical, owner, &leaves, 1);
    (logical, 1)
}

impl BtrfsImageBuilder {
    pub fn new(size: u64, label: &str) -> Self {
        Self {
            size,
            label: label.to_string(),
            files: Vec::new(),
        }
    }

    pub fn add(&mut self, file: TestFile) -> &mut Self {
        self.files.push(file);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut image = vec![0u8; self.size as usize];

        // File data first.
        for file in &self.files {
            for (_, disk_bytenr, data) in &file.regular {
                let off = *disk_bytenr as usize;
                image[off..off + data.len()].copy_from_slice(data);
            }
        }

        // FS tree items, sorted by key.
        let mut items: BTreeMap<Key, Vec<u8>> = BTreeMap::new();
        items.insert(
            (256, INODE_ITEM_KEY, 0),
            inode_item_bytes(0o040755, 0, 1),
        );
        items.insert((256, INODE_REF_KEY, 256), inode_ref_bytes(0, b".."));

        let mut dir_index: BTreeMap<u64, u64> = BTreeMap::new();
        for file in &self.files {
            items.insert(
                (file.ino, INODE_ITEM_KEY, 0),
                inode_item_bytes(file.mode, file.size, 1),
            );
            let index = dir_index.entry(file.parent).or_insert(2);
            items.insert(
                (file.ino, INODE_REF_KEY, file.parent),
                inode_ref_bytes(*index, &file.name),
            );
            items.insert(
                (file.parent, DIR_INDEX_KEY, *index),
                dir_index_bytes(file.ino, &file.name, 1),
            );
            *index += 1;

            if let Some(payload) = &file.inline {
                items.insert(
                    (file.ino, EXTENT_DATA_KEY, 0),
                    extent_data_inline_bytes(payload),
                );
            }
            for (file_offset, disk_bytenr, data) in &file.regular {
                items.insert(
                    (file.ino, EXTENT_DATA_KEY, *file_offset),
                    extent_data_regular_bytes(*disk_bytenr, data.len() as u64),
                );
            }
        }
        let fs_items: Vec<(Key, Vec<u8>)> = items.into_iter().collect();

        // Extent tree: one data item per regular extent.
        let mut extent_items: BTreeMap<Key, Vec<u8>> = BTreeMap::new();
        for file in &self.files {
            for (_, disk_bytenr, data) in &file.regular {
                extent_items.insert(
                    (*disk_bytenr, EXTENT_ITEM_KEY, data.len() as u64),
                    extent_item_bytes(EXTENT_FLAG_DATA),
                );
            }
        }
        let extent_items: Vec<(Key, Vec<u8>)> = extent_items.into_iter().collect();

        let mut next_logical = METADATA_BASE;

        // Chunk tree: empty leaf, the bootstrap array covers the disk.
        let chunk_root = next_logical;
        next_logical += NODE_SIZE as u64;
        write_leaf(&mut image, chunk_root, CHUNK_TREE_OBJECTID, &[]);

        let (fs_root, fs_level) =
            write_tree(&mut image, FS_TREE_OBJECTID, &fs_items, &mut next_logical);
        let (extent_root, extent_level) = write_tree(
            &mut image,
            EXTENT_TREE_OBJECTID,
            &extent_items,
            &mut next_logical,
        );

        // Root tree: root items for the FS and extent trees.
        let root_items = vec![
            (
                (EXTENT_TREE_OBJECTID, ROOT_ITEM_KEY, 0),
                root_item_bytes(extent_root, extent_level, 0),
            ),
            (
                (FS_TREE_OBJECTID, ROOT_ITEM_KEY, 0),
                root_item_bytes(fs_root, fs_level, 256),
            ),
        ];
        let root_tree = next_logical;
        next_logical += NODE_SIZE as u64;
        write_leaf(&mut image, root_tree, ROOT_TREE_OBJECTID, &root_items);

        // Superblock with a single identity system chunk.
        let sb_off = SUPERBLOCK_OFFSET as usize;
        {
            let sb = &mut image[sb_off..sb_off + SUPERBLOCK_SIZE];
            sb[offsets::MAGIC..offsets::MAGIC + 8].copy_from_slice(BTRFS_MAGIC);
            sb[offsets::FSID..offsets::FSID + 16].copy_from_slice(&[7u8; 16]);
            put64(sb, offsets::BYTENR, SUPERBLOCK_OFFSET);
            put64(sb, offsets::GENERATION, 1);
            put64(sb, offsets::ROOT, root_tree);
            put64(sb, offsets::CHUNK_ROOT, chunk_root);
            put64(sb, offsets::TOTAL_BYTES, self.size);
            put64(sb, offsets::BYTES_USED, next_logical - METADATA_BASE);
            put64(sb, offsets::ROOT_DIR_OBJECTID, 6);
            put64(sb, offsets::NUM_DEVICES, 1);
            put32(sb, offsets::SECTORSIZE, 4096);
            put32(sb, offsets::NODESIZE, NODE_SIZE as u32);
            put32(sb, offsets::STRIPESIZE, 4096);
            put16(sb, offsets::CSUM_TYPE, 0); // crc32c
            sb[offsets::ROOT_LEVEL] = 0;
            sb[offsets::CHUNK_ROOT_LEVEL] = 0;
            let label = self.label.as_bytes();
            sb[offsets::LABEL..offsets::LABEL + label.len()].copy_from_slice(label);

            // sys_chunk_array: one SYSTEM chunk mapping the whole
            // device 1:1.
            let mut array = Vec::new();
            array.extend_from_slice(&key_bytes((FIRST_CHUNK_TREE_OBJECTID, CHUNK_ITEM_KEY, 0)));
            let mut chunk = vec![0u8; CHUNK_HEADER_SIZE + STRIPE_SIZE];
            put64(&mut chunk, 0, self.size); // length
            put64(&mut chunk, 8, EXTENT_TREE_OBJECTID); // owner
            put64(&mut chunk, 16, 65536); // stripe_len
            put64(&mut chunk, 24, BLOCK_GROUP_SYSTEM);
            put32(&mut chunk, 32, 4096); // io_align
            put32(&mut chunk, 36, 4096); // io_width
            put32(&mut chunk, 40, 4096); // sector_size
            put16(&mut chunk, 44, 1); // num_stripes
            put64(&mut chunk, CHUNK_HEADER_SIZE, 1); // devid
            put64(&mut chunk, CHUNK_HEADER_SIZE + 8, 0); // offset: identity
            array.extend_from_slice(&chunk);
            put32(sb, offsets::SYS_CHUNK_ARRAY_SIZE, array.len() as u32);
            sb[offsets::SYS_CHUNK_ARRAY..offsets::SYS_CHUNK_ARRAY + array.len()]
                .copy_from_slice(&array);

            finish_superblock_checksum(sb);
        }

        image
    }

    pub fn write_temp(&self) -> NamedTempFile {
        let image = self.build();
        let mut file = NamedTempFile::new().expect("temp image");
        file.write_all(&image).expect("write image");
        file.flush().expect("flush image");
        file
    }
}
