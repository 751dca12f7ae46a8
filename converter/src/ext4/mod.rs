//! Ext4 on-disk layer: constants and structures, checksum helpers, the
//! geometry planner, the global block allocator and the pass-3 writer.

pub mod alloc;
pub mod bitmap;
pub mod checksum;
pub mod constants;
pub mod layout;
pub mod structures;
pub mod writer;

pub use alloc::BlockAllocator;
pub use bitmap::Bitmap;
pub use layout::{Ext4Layout, GroupLayout};
