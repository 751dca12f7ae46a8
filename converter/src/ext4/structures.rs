// Ext4 on-disk structures.
// CRITICAL: everything here is little-endian and offset-exact; the
// serializers write each field at its published offset into a zeroed
// buffer instead of relying on struct layout.

use byteorder::{ByteOrder, LittleEndian};

use super::checksum;
use super::constants::*;

#[inline]
pub fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    LittleEndian::write_u16(&mut buf[off..off + 2], v);
}

#[inline]
pub fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    LittleEndian::write_u32(&mut buf[off..off + 4], v);
}

#[inline]
pub fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    LittleEndian::write_u64(&mut buf[off..off + 8], v);
}

#[inline]
pub fn get_u16(buf: &[u8], off: usize) -> u16 {
    LittleEndian::read_u16(&buf[off..off + 2])
}

#[inline]
pub fn get_u32(buf: &[u8], off: usize) -> u32 {
    LittleEndian::read_u32(&buf[off..off + 4])
}

#[inline]
pub fn get_u64(buf: &[u8], off: usize) -> u64 {
    LittleEndian::read_u64(&buf[off..off + 8])
}

/// Ext4 superblock. Fields not represented here stay zero on disk.
#[derive(Debug, Clone)]
pub struct Ext4Superblock {
    pub s_inodes_count: u32,
    pub s_blocks_count: u64,
    pub s_r_blocks_count: u64,
    pub s_free_blocks_count: u64,
    pub s_free_inodes_count: u32,
    pub s_first_data_block: u32,
    pub s_log_block_size: u32,
    pub s_blocks_per_group: u32,
    pub s_inodes_per_group: u32,
    pub s_mtime: u32,
    pub s_wtime: u32,
    pub s_magic: u16,
    pub s_state: u16,
    pub s_errors: u16,
    pub s_lastcheck: u32,
    pub s_creator_os: u32,
    pub s_rev_level: u32,
    pub s_first_ino: u32,
    pub s_inode_size: u16,
    pub s_block_group_nr: u16,
    pub s_feature_compat: u32,
    pub s_feature_incompat: u32,
    pub s_feature_ro_compat: u32,
    pub s_uuid: [u8; 16],
    pub s_volume_name: [u8; 16],
    pub s_reserved_gdt_blocks: u16,
    pub s_journal_inum: u32,
    pub s_hash_seed: [u32; 4],
    pub s_def_hash_version: u8,
    pub s_jnl_backup_type: u8,
    pub s_desc_size: u16,
    pub s_mkfs_time: u32,
    pub s_jnl_blocks: [u32; 17],
    pub s_min_extra_isize: u16,
    pub s_want_extra_isize: u16,
    pub s_flags: u32,
    pub s_log_groups_per_flex: u8,
    pub s_checksum_type: u8,
    pub s_checksum_seed: u32,
}

impl Ext4Superblock {
    /// Serialize to the 1024-byte on-disk form and stamp the trailing
    /// checksum.
    pub fn to_bytes(&self) -> [u8; EXT4_SUPERBLOCK_SIZE] {
        let mut b = [0u8; EXT4_SUPERBLOCK_SIZE];
        put_u32(&mut b, 0x000, self.s_inodes_count);
        put_u32(&mut b, 0x004, self.s_blocks_count as u32);
        put_u32(&mut b, 0x008, self.s_r_blocks_count as u32);
        put_u32(&mut b, 0x00C, self.s_free_blocks_count as u32);
        put_u32(&mut b, 0x010, self.s_free_inodes_count);
        put_u32(&mut b, 0x014, self.s_first_data_block);
        put_u32(&mut b, 0x018, self.s_log_block_size);
        put_u32(&mut b, 0x01C, self.s_log_block_size); // cluster size
        put_u32(&mut b, 0x020, self.s_blocks_per_group);
        put_u32(&mut b, 0x024, self.s_blocks_per_group); // clusters per group
        put_u32(&mut b, 0x028, self.s_inodes_per_group);
        put_u32(&mut b, 0x02C, self.s_mtime);
        put_u32(&mut b, 0x030, self.s_wtime);
        put_u16(&mut b, 0x034, 0); // mount count
        put_u16(&mut b, 0x036, 0xFFFF); // max mount count disabled
        put_u16(&mut b, 0x038, self.s_magic);
        put_u16(&mut b, 0x03A, self.s_state);
        put_u16(&mut b, 0x03C, self.s_errors);
        put_u32(&mut b, 0x040, self.s_lastcheck);
        put_u32(&mut b, 0x048, self.s_creator_os);
        put_u32(&mut b, 0x04C, self.s_rev_level);
        put_u32(&mut b, 0x054, self.s_first_ino);
        put_u16(&mut b, 0x058, self.s_inode_size);
        put_u16(&mut b, 0x05A, self.s_block_group_nr);
        put_u32(&mut b, 0x05C, self.s_feature_compat);
        put_u32(&mut b, 0x060, self.s_feature_incompat);
        put_u32(&mut b, 0x064, self.s_feature_ro_compat);
        b[0x068..0x078].copy_from_slice(&self.s_uuid);
        b[0x078..0x088].copy_from_slice(&self.s_volume_name);
        put_u16(&mut b, 0x0CE, self.s_reserved_gdt_blocks);
        put_u32(&mut b, 0x0E0, self.s_journal_inum);
        for (i, seed) in self.s_hash_seed.iter().enumerate() {
            put_u32(&mut b, 0x0EC + i * 4, *seed);
        }
        b[0x0FC] = self.s_def_hash_version;
        b[0x0FD] = self.s_jnl_backup_type;
        put_u16(&mut b, 0x0FE, self.s_desc_size);
        put_u32(&mut b, 0x108, self.s_mkfs_time);
        for (i, blk) in self.s_jnl_blocks.iter().enumerate() {
            put_u32(&mut b, 0x10C + i * 4, *blk);
        }
        put_u32(&mut b, 0x150, (self.s_blocks_count >> 32) as u32);
        put_u32(&mut b, 0x154, (self.s_r_blocks_count >> 32) as u32);
        put_u32(&mut b, 0x158, (self.s_free_blocks_count >> 32) as u32);
        put_u16(&mut b, 0x15C, self.s_min_extra_isize);
        put_u16(&mut b, 0x15E, self.s_want_extra_isize);
        put_u32(&mut b, 0x160, self.s_flags);
        b[0x174] = self.s_log_groups_per_flex;
        b[0x175] = self.s_checksum_type;
        put_u32(&mut b, 0x270, self.s_checksum_seed);
        let crc = checksum::superblock_checksum(&b);
        put_u32(&mut b, 0x3FC, crc);
        b
    }
}

/// Group descriptor, 64 bytes in 64-bit mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ext4GroupDesc {
    pub block_bitmap: u64,
    pub inode_bitmap: u64,
    pub inode_table: u64,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub used_dirs_count: u32,
    pub flags: u16,
    pub block_bitmap_csum: u32,
    pub inode_bitmap_csum: u32,
    pub itable_unused: u32,
    pub checksum: u16,
}

impl Ext4GroupDesc {
    pub fn to_bytes(&self) -> [u8; EXT4_DESC_SIZE as usize] {
        let mut b = [0u8; EXT4_DESC_SIZE as usize];
        put_u32(&mut b, 0x00, self.block_bitmap as u32);
        put_u32(&mut b, 0x04, self.inode_bitmap as u32);
        put_u32(&mut b, 0x08, self.inode_table as u32);
        put_u16(&mut b, 0x0C, self.free_blocks_count as u16);
        put_u16(&mut b, 0x0E, self.free_inodes_count as u16);
        put_u16(&mut b, 0x10, self.used_dirs_count as u16);
        put_u16(&mut b, 0x12, self.flags);
        put_u16(&mut b, 0x18, self.block_bitmap_csum as u16);
        put_u16(&mut b, 0x1A, self.inode_bitmap_csum as u16);
        put_u16(&mut b, 0x1C, self.itable_unused as u16);
        put_u16(&mut b, 0x1E, self.checksum);
        put_u32(&mut b, 0x20, (self.block_bitmap >> 32) as u32);
        put_u32(&mut b, 0x24, (self.inode_bitmap >> 32) as u32);
        put_u32(&mut b, 0x28, (self.inode_table >> 32) as u32);
        put_u16(&mut b, 0x2C, (self.free_blocks_count >> 16) as u16);
        put_u16(&mut b, 0x2E, (self.free_inodes_count >> 16) as u16);
        put_u16(&mut b, 0x30, (self.used_dirs_count >> 16) as u16);
        put_u16(&mut b, 0x32, (self.itable_unused >> 16) as u16);
        put_u16(&mut b, 0x38, (self.block_bitmap_csum >> 16) as u16);
        put_u16(&mut b, 0x3A, (self.inode_bitmap_csum >> 16) as u16);
        b
    }

    pub fn from_bytes(b: &[u8]) -> Self {
        Self {
            block_bitmap: get_u32(b, 0x00) as u64 | ((get_u32(b, 0x20) as u64) << 32),
            inode_bitmap: get_u32(b, 0x04) as u64 | ((get_u32(b, 0x24) as u64) << 32),
            inode_table: get_u32(b, 0x08) as u64 | ((get_u32(b, 0x28) as u64) << 32),
            free_blocks_count: get_u16(b, 0x0C) as u32 | ((get_u16(b, 0x2C) as u32) << 16),
            free_inodes_count: get_u16(b, 0x0E) as u32 | ((get_u16(b, 0x2E) as u32) << 16),
            used_dirs_count: get_u16(b, 0x10) as u32 | ((get_u16(b, 0x30) as u32) << 16),
            flags: get_u16(b, 0x12),
            block_bitmap_csum: get_u16(b, 0x18) as u32 | ((get_u16(b, 0x38) as u32) << 16),
            inode_bitmap_csum: get_u16(b, 0x1A) as u32 | ((get_u16(b, 0x3A) as u32) << 16),
            itable_unused: get_u16(b, 0x1C) as u32 | ((get_u16(b, 0x32) as u32) << 16),
            checksum: get_u16(b, 0x1E),
        }
    }

    /// Recompute `checksum` over the serialized descriptor.
    pub fn update_checksum(&mut self, uuid: &[u8; 16], group: u32) {
        self.checksum = 0;
        let bytes = self.to_bytes();
        self.checksum = checksum::group_desc_checksum(&bytes, uuid, group);
    }
}

/// Ext4 inode, 256 bytes with extra-isize 32.
#[derive(Debug, Clone)]
pub struct Ext4Inode {
    pub i_mode: u16,
    pub i_uid: u32,
    pub i_gid: u32,
    pub i_size: u64,
    pub i_atime: u32,
    pub i_ctime: u32,
    pub i_mtime: u32,
    pub i_crtime: u32,
    pub i_atime_extra: u32,
    pub i_ctime_extra: u32,
    pub i_mtime_extra: u32,
    pub i_crtime_extra: u32,
    pub i_links_count: u16,
    /// 512-byte sector count.
    pub i_blocks: u64,
    pub i_flags: u32,
    pub i_block: [u8; 60],
    pub i_generation: u32,
    pub i_extra_isize: u16,
    pub i_checksum: u32,
    /// In-inode xattr bytes placed after the fixed area.
    pub xattr_area: Vec<u8>,
}

impl Default for Ext4Inode {
    fn default() -> Self {
        Self {
            i_mode: 0,
            i_uid: 0,
            i_gid: 0,
            i_size: 0,
            i_atime: 0,
            i_ctime: 0,
            i_mtime: 0,
            i_crtime: 0,
            i_atime_extra: 0,
            i_ctime_extra: 0,
            i_mtime_extra: 0,
            i_crtime_extra: 0,
            i_links_count: 0,
            i_blocks: 0,
            i_flags: 0,
            i_block: [0u8; 60],
            i_generation: 0,
            i_extra_isize: EXT4_EXTRA_ISIZE,
            i_checksum: 0,
            xattr_area: Vec::new(),
        }
    }
}

/// Fixed inode area plus extra-isize: xattrs start here.
pub const INODE_XATTR_OFFSET: usize = 128 + EXT4_EXTRA_ISIZE as usize;

impl Ext4Inode {
    pub fn to_bytes(&self) -> [u8; EXT4_INODE_SIZE as usize] {
        let mut b = [0u8; EXT4_INODE_SIZE as usize];
        put_u16(&mut b, 0x00, self.i_mode);
        put_u16(&mut b, 0x02, self.i_uid as u16);
        put_u32(&mut b, 0x04, self.i_size as u32);
        put_u32(&mut b, 0x08, self.i_atime);
        put_u32(&mut b, 0x0C, self.i_ctime);
        put_u32(&mut b, 0x10, self.i_mtime);
        put_u32(&mut b, 0x14, 0); // dtime
        put_u16(&mut b, 0x18, self.i_gid as u16);
        put_u16(&mut b, 0x1A, self.i_links_count);
        put_u32(&mut b, 0x1C, self.i_blocks as u32);
        put_u32(&mut b, 0x20, self.i_flags);
        b[0x28..0x64].copy_from_slice(&self.i_block);
        put_u32(&mut b, 0x64, self.i_generation);
        put_u32(&mut b, 0x6C, (self.i_size >> 32) as u32);
        // osd2 (Linux flavour).
        put_u16(&mut b, 0x74, (self.i_blocks >> 32) as u16);
        put_u16(&mut b, 0x78, (self.i_uid >> 16) as u16);
        put_u16(&mut b, 0x7A, (self.i_gid >> 16) as u16);
        put_u16(&mut b, 0x7C, self.i_checksum as u16);
        put_u16(&mut b, 0x80, self.i_extra_isize);
        put_u16(&mut b, 0x82, (self.i_checksum >> 16) as u16);
        put_u32(&mut b, 0x84, self.i_ctime_extra);
        put_u32(&mut b, 0x88, self.i_mtime_extra);
        put_u32(&mut b, 0x8C, self.i_atime_extra);
        put_u32(&mut b, 0x90, self.i_crtime);
        put_u32(&mut b, 0x94, self.i_crtime_extra);
        if !self.xattr_area.is_empty() {
            let end = INODE_XATTR_OFFSET + self.xattr_area.len();
            b[INODE_XATTR_OFFSET..end].copy_from_slice(&self.xattr_area);
        }
        b
    }

    /// Serialize with the metadata checksum stamped into both halves.
    pub fn to_bytes_checksummed(&mut self, ino: u32, csum_seed: u32) -> [u8; 256] {
        self.i_checksum = 0;
        let bytes = self.to_bytes();
        self.i_checksum =
            checksum::inode_checksum(&bytes, ino, self.i_generation, csum_seed);
        self.to_bytes()
    }

    /// Split a btrfs timestamp into the epoch field and the extra
    /// field packing the upper second bits with 30-bit nanoseconds.
    pub fn encode_time(sec: u64, nsec: u32) -> (u32, u32) {
        let epoch = (sec >> 32) as u32 & 0x3;
        (sec as u32, epoch | (nsec << 2))
    }
}

/// Extent tree node header, 12 bytes.
#[derive(Debug, Clone, Copy)]
pub struct ExtentHeader {
    pub entries: u16,
    pub max: u16,
    pub depth: u16,
    pub generation: u32,
}

impl ExtentHeader {
    pub fn write(&self, buf: &mut [u8], off: usize) {
        put_u16(buf, off, EXT4_EXTENT_MAGIC);
        put_u16(buf, off + 2, self.entries);
        put_u16(buf, off + 4, self.max);
        put_u16(buf, off + 6, self.depth);
        put_u32(buf, off + 8, self.generation);
    }

    pub fn read(buf: &[u8], off: usize) -> Option<Self> {
        if get_u16(buf, off) != EXT4_EXTENT_MAGIC {
            return None;
        }
        Some(Self {
            entries: get_u16(buf, off + 2),
            max: get_u16(buf, off + 4),
            depth: get_u16(buf, off + 6),
            generation: get_u32(buf, off + 8),
        })
    }
}

/// Leaf extent entry, 12 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentLeaf {
    pub logical_block: u32,
    pub len: u16,
    pub physical_block: u64,
}

impl ExtentLeaf {
    pub fn write(&self, buf: &mut [u8], off: usize) {
        put_u32(buf, off, self.logical_block);
        put_u16(buf, off + 4, self.len);
        put_u16(buf, off + 6, (self.physical_block >> 32) as u16);
        put_u32(buf, off + 8, self.physical_block as u32);
    }

    pub fn read(buf: &[u8], off: usize) -> Self {
        Self {
            logical_block: get_u32(buf, off),
            len: get_u16(buf, off + 4),
            physical_block: ((get_u16(buf, off + 6) as u64) << 32) | get_u32(buf, off + 8) as u64,
        }
    }
}

/// Index extent entry, 12 bytes.
#[derive(Debug, Clone, Copy)]
pub struct ExtentIdx {
    pub first_logical_block: u32,
    pub child_block: u64,
}

impl ExtentIdx {
    pub fn write(&self, buf: &mut [u8], off: usize) {
        put_u32(buf, off, self.first_logical_block);
        put_u32(buf, off + 4, self.child_block as u32);
        put_u16(buf, off + 8, (self.child_block >> 32) as u16);
        put_u16(buf, off + 10, 0);
    }

    pub fn read(buf: &[u8], off: usize) -> Self {
        Self {
            first_logical_block: get_u32(buf, off),
            child_block: get_u32(buf, off + 4) as u64 | ((get_u16(buf, off + 8) as u64) << 32),
        }
    }
}

/// Write one directory entry (v2 layout) at `off`; returns the bytes
/// consumed (`rec_len`).
pub fn write_dirent(
    buf: &mut [u8],
    off: usize,
    ino: u32,
    rec_len: u16,
    name: &[u8],
    file_type: u8,
) {
    put_u32(buf, off, ino);
    put_u16(buf, off + 4, rec_len);
    buf[off + 6] = name.len() as u8;
    buf[off + 7] = file_type;
    buf[off + 8..off + 8 + name.len()].copy_from_slice(name);
}

/// Directory file_type byte for a POSIX mode.
pub fn file_type_of_mode(mode: u32) -> u8 {
    match mode & crate::model::S_IFMT {
        crate::model::S_IFREG => EXT4_FT_REG_FILE,
        crate::model::S_IFDIR => EXT4_FT_DIR,
        crate::model::S_IFCHR => EXT4_FT_CHRDEV,
        crate::model::S_IFBLK => EXT4_FT_BLKDEV,
        crate::model::S_IFIFO => EXT4_FT_FIFO,
        crate::model::S_IFSOCK => EXT4_FT_SOCK,
        crate::model::S_IFLNK => EXT4_FT_SYMLINK,
        _ => EXT4_FT_UNKNOWN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superblock_magic_and_checksum_land_at_offsets() {
        let sb = Ext4Superblock {
            s_inodes_count: 1,
            s_blocks_count: 2,
            s_r_blocks_count: 0,
            s_free_blocks_count: 0,
            s_free_inodes_count: 0,
            s_first_data_block: 0,
            s_log_block_size: 2,
            s_blocks_per_group: 32768,
            s_inodes_per_group: 8192,
            s_mtime: 0,
            s_wtime: 0,
            s_magic: EXT4_SUPER_MAGIC,
            s_state: EXT4_VALID_FS,
            s_errors: EXT4_ERRORS_CONTINUE,
            s_lastcheck: 0,
            s_creator_os: EXT4_OS_LINUX,
            s_rev_level: EXT4_DYNAMIC_REV,
            s_first_ino: EXT4_FIRST_INO,
            s_inode_size: EXT4_INODE_SIZE,
            s_block_group_nr: 0,
            s_feature_compat: 0,
            s_feature_incompat: 0,
            s_feature_ro_compat: 0,
            s_uuid: [9; 16],
            s_volume_name: [0; 16],
            s_reserved_gdt_blocks: 0,
            s_journal_inum: EXT4_JOURNAL_INO,
            s_hash_seed: [1, 2, 3, 4],
            s_def_hash_version: DX_HASH_LEGACY,
            s_jnl_backup_type: 1,
            s_desc_size: EXT4_DESC_SIZE,
            s_mkfs_time: 0,
            s_jnl_blocks: [0; 17],
            s_min_extra_isize: EXT4_EXTRA_ISIZE,
            s_want_extra_isize: EXT4_EXTRA_ISIZE,
            s_flags: 0,
            s_log_groups_per_flex: 0,
            s_checksum_type: 1,
            s_checksum_seed: 0,
        };
        let bytes = sb.to_bytes();
        assert_eq!(get_u16(&bytes, 0x38), EXT4_SUPER_MAGIC);
        assert_eq!(get_u16(&bytes, 0x0FE), EXT4_DESC_SIZE);
        let crc = get_u32(&bytes, 0x3FC);
        assert_eq!(crc, checksum::superblock_checksum(&bytes));
        assert_ne!(crc, 0);
    }

    #[test]
    fn group_desc_roundtrip_through_bytes() {
        let mut desc = Ext4GroupDesc {
            block_bitmap: 0x1_0000_0123,
            inode_bitmap: 0x1_0000_0124,
            inode_table: 0x1_0000_0125,
            free_blocks_count: 70000,
            free_inodes_count: 8180,
            used_dirs_count: 3,
            flags: EXT4_BG_INODE_ZEROED,
            block_bitmap_csum: 0,
            inode_bitmap_csum: 0,
            itable_unused: 100,
            checksum: 0,
        };
        desc.update_checksum(&[7u8; 16], 5);
        let bytes = desc.to_bytes();
        let back = Ext4GroupDesc::from_bytes(&bytes);
        assert_eq!(back.block_bitmap, desc.block_bitmap);
        assert_eq!(back.inode_table, desc.inode_table);
        assert_eq!(back.free_blocks_count, desc.free_blocks_count);
        assert_eq!(back.checksum, desc.checksum);
        assert_ne!(back.checksum, 0);
    }

    #[test]
    fn inode_time_encoding_packs_nanoseconds() {
        let (sec, extra) = Ext4Inode::encode_time(0x1_2345_6789, 999_999_999);
        assert_eq!(sec, 0x2345_6789);
        assert_eq!(extra & 0x3, 1);
        assert_eq!(extra >> 2, 999_999_999);
    }

    #[test]
    fn extent_structures_roundtrip() {
        let mut buf = [0u8; 24];
        let leaf = ExtentLeaf {
            logical_block: 7,
            len: 32768,
            physical_block: 0x1_2345_6789,
        };
        leaf.write(&mut buf, 0);
        assert_eq!(ExtentLeaf::read(&buf, 0), leaf);

        let idx = ExtentIdx {
            first_logical_block: 9,
            child_block: 0x2_0000_0001,
        };
        idx.write(&mut buf, 12);
        let back = ExtentIdx::read(&buf, 12);
        assert_eq!(back.first_logical_block, 9);
        assert_eq!(back.child_block, 0x2_0000_0001);
    }

    #[test]
    fn dirent_layout() {
        let mut block = vec![0u8; 64];
        write_dirent(&mut block, 0, 2, 12, b".", EXT4_FT_DIR);
        assert_eq!(get_u32(&block, 0), 2);
        assert_eq!(get_u16(&block, 4), 12);
        assert_eq!(block[6], 1);
        assert_eq!(block[7], EXT4_FT_DIR);
        assert_eq!(block[8], b'.');
    }
}
