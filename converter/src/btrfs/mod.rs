//! Btrfs on-disk parsing: superblock, chunk map, B-tree walker, the
//! pass-1 reader and the transparent extent decompressor.

pub mod checksum;
pub mod chunk_map;
pub mod decompress;
pub mod reader;
pub mod structures;
pub mod superblock;
pub mod tree;

pub use chunk_map::ChunkMap;
pub use reader::BtrfsReader;
pub use superblock::BtrfsSuperblock;
