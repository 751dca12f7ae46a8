//! In-place btrfs to ext4 conversion engine.
//!
//! The conversion runs in three strictly ordered passes:
//!
//! 1. [`btrfs::reader`] parses the btrfs volume into an in-memory
//!    [`model::FsInfo`].
//! 2. [`ext4::layout`] plans the ext4 geometry and [`relocate`] moves
//!    data blocks out of the regions ext4 metadata needs, journaling
//!    every move so [`relocate::migration`] can roll the device back.
//! 3. [`ext4::writer`] emits the complete ext4 filesystem around the
//!    surviving data blocks.
//!
//! [`conversion`] drives the passes and implements the public
//! [`fsmorph_core::BlockConverter`] trait.

pub mod btrfs;
pub mod conversion;
pub mod ext4;
pub mod inode_map;
pub mod model;
pub mod relocate;

pub use conversion::Btrfs2Ext4Converter;
