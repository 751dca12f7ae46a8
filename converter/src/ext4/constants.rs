// Ext4 on-disk constants.
// CRITICAL: these values come straight from the ext4 specification and
// must not drift.

pub const EXT4_SUPER_MAGIC: u16 = 0xEF53;
pub const EXT4_SUPERBLOCK_OFFSET: u64 = 1024;
pub const EXT4_SUPERBLOCK_SIZE: usize = 1024;

// Reserved inodes.
pub const EXT4_BAD_INO: u32 = 1;
pub const EXT4_ROOT_INO: u32 = 2;
pub const EXT4_RESIZE_INO: u32 = 7;
pub const EXT4_JOURNAL_INO: u32 = 8;
/// First inode available for regular files.
pub const EXT4_FIRST_INO: u32 = 11;
pub const EXT4_RESERVED_INOS: u32 = 10;

pub const EXT4_INODE_SIZE: u16 = 256;
pub const EXT4_EXTRA_ISIZE: u16 = 32;
pub const EXT4_DESC_SIZE: u16 = 64;

// Filesystem state / behaviour.
pub const EXT4_VALID_FS: u16 = 1;
pub const EXT4_ERRORS_CONTINUE: u16 = 1;
pub const EXT4_OS_LINUX: u32 = 0;
pub const EXT4_DYNAMIC_REV: u32 = 1;

// Compatible features.
pub const FEATURE_COMPAT_EXT_ATTR: u32 = 0x0008;
pub const FEATURE_COMPAT_RESIZE_INODE: u32 = 0x0010;
pub const FEATURE_COMPAT_DIR_INDEX: u32 = 0x0020;
pub const FEATURE_COMPAT_HAS_JOURNAL: u32 = 0x0004;

// Incompatible features.
pub const FEATURE_INCOMPAT_FILETYPE: u32 = 0x0002;
pub const FEATURE_INCOMPAT_EXTENTS: u32 = 0x0040;
pub const FEATURE_INCOMPAT_64BIT: u32 = 0x0080;
pub const FEATURE_INCOMPAT_FLEX_BG: u32 = 0x0200;
pub const FEATURE_INCOMPAT_INLINE_DATA: u32 = 0x8000;
pub const FEATURE_INCOMPAT_CSUM_SEED: u32 = 0x2000;

// Read-only compatible features.
pub const FEATURE_RO_COMPAT_SPARSE_SUPER: u32 = 0x0001;
pub const FEATURE_RO_COMPAT_LARGE_FILE: u32 = 0x0002;
pub const FEATURE_RO_COMPAT_HUGE_FILE: u32 = 0x0008;
pub const FEATURE_RO_COMPAT_GDT_CSUM: u32 = 0x0010;
pub const FEATURE_RO_COMPAT_DIR_NLINK: u32 = 0x0020;
pub const FEATURE_RO_COMPAT_EXTRA_ISIZE: u32 = 0x0040;
pub const FEATURE_RO_COMPAT_METADATA_CSUM: u32 = 0x0400;

// Inode flags.
pub const EXT4_EXTENTS_FL: u32 = 0x0008_0000;
pub const EXT4_INDEX_FL: u32 = 0x0000_1000;
pub const EXT4_INLINE_DATA_FL: u32 = 0x1000_0000;

// Block group flags.
pub const EXT4_BG_INODE_ZEROED: u16 = 0x0004;

// Extent tree.
pub const EXT4_EXTENT_MAGIC: u16 = 0xF30A;
/// Longest run one extent can describe.
pub const EXT4_MAX_EXTENT_LEN: u32 = 32768;
/// Extents that fit inline in `i_block` (header + 4 entries).
pub const EXT4_INLINE_EXTENTS: usize = 4;

// Directory entry file types.
pub const EXT4_FT_UNKNOWN: u8 = 0;
pub const EXT4_FT_REG_FILE: u8 = 1;
pub const EXT4_FT_DIR: u8 = 2;
pub const EXT4_FT_CHRDEV: u8 = 3;
pub const EXT4_FT_BLKDEV: u8 = 4;
pub const EXT4_FT_FIFO: u8 = 5;
pub const EXT4_FT_SOCK: u8 = 6;
pub const EXT4_FT_SYMLINK: u8 = 7;

// HTree.
pub const DX_HASH_LEGACY: u8 = 0;
/// Legacy hash initial value and padding constant.
pub const DX_HASH_SEED_INIT: u32 = 0x12A3_FE2D;
pub const DX_HASH_PADDING: u32 = 0x37AB_E8F9;

// JBD2 (all big-endian on disk).
pub const JBD2_MAGIC: u32 = 0xC03B_3998;
pub const JBD2_SUPERBLOCK_V2: u32 = 4;

// In-inode extended attributes.
pub const EXT4_XATTR_MAGIC: u32 = 0xEA02_0000;

/// Symlink targets up to this many bytes are stored in `i_block`.
pub const EXT4_INLINE_SYMLINK_MAX: usize = 59;

/// Inline file data capacity in `i_block` before xattr spill.
pub const EXT4_INLINE_DATA_IBLOCK: usize = 60;
