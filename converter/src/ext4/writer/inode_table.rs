// Translation of btrfs inodes into ext4 inode records.
//
// Field mapping: mode/uid/gid/nlink/size/rdev carry over with lo/hi
// splits, timestamps become `{seconds, extra}` pairs, `i_blocks` is a
// 512-byte sector count. Small regular files become inline data with a
// `system.data` xattr carrying the bytes past the 60 in `i_block`.

use log::warn;

use crate::model::{FileEntry, Timespec};

use super::super::constants::*;
use super::super::structures::{put_u16, put_u32, Ext4Inode};

/// Inline file payload capacity: `i_block` plus the xattr value area
/// the extra-isize leaves for `system.data`.
pub const INLINE_DATA_MAX: usize =
    EXT4_INLINE_DATA_IBLOCK + EXT4_EXTRA_ISIZE as usize - 4;

/// In-inode xattr storage area (past the 128+extra_isize fixed part).
pub const XATTR_AREA_SIZE: usize =
    EXT4_INODE_SIZE as usize - 128 - EXT4_EXTRA_ISIZE as usize;

/// Base translation shared by every file type.
pub fn translate_base(entry: &FileEntry, nlink: u32) -> Ext4Inode {
    let mut inode = Ext4Inode {
        i_mode: entry.mode as u16,
        i_uid: entry.uid,
        i_gid: entry.gid,
        i_size: entry.size,
        i_links_count: nlink.min(u16::MAX as u32) as u16,
        ..Ext4Inode::default()
    };
    set_time(&mut inode, entry.atime, entry.mtime, entry.ctime, entry.crtime);
    inode
}

fn set_time(inode: &mut Ext4Inode, atime: Timespec, mtime: Timespec, ctime: Timespec, crtime: Timespec) {
    let (sec, extra) = Ext4Inode::encode_time(atime.sec, atime.nsec);
    inode.i_atime = sec;
    inode.i_atime_extra = extra;
    let (sec, extra) = Ext4Inode::encode_time(mtime.sec, mtime.nsec);
    inode.i_mtime = sec;
    inode.i_mtime_extra = extra;
    let (sec, extra) = Ext4Inode::encode_time(ctime.sec, ctime.nsec);
    inode.i_ctime = sec;
    inode.i_ctime_extra = extra;
    let (sec, extra) = Ext4Inode::encode_time(crtime.sec, crtime.nsec);
    inode.i_crtime = sec;
    inode.i_crtime_extra = extra;
}

/// Encode a device number into the first two `i_block` slots: the old
/// 16-bit form when it fits, the large form otherwise.
pub fn encode_rdev(inode: &mut Ext4Inode, rdev: u64) {
    // Btrfs stores the huge encoding: major << 20 | minor.
    let major = (rdev >> 20) as u32;
    let minor = (rdev & 0xFFFFF) as u32;
    if major < 256 && minor < 256 {
        put_u32(&mut inode.i_block, 0, (major << 8) | minor);
    } else {
        let new = (minor & 0xFF) | (major << 8) | ((minor & !0xFF) << 12);
        put_u32(&mut inode.i_block, 4, new);
    }
}

/// A symlink target short enough to live in `i_block`.
pub fn encode_fast_symlink(inode: &mut Ext4Inode, target: &[u8]) {
    inode.i_block[..target.len()].copy_from_slice(target);
    inode.i_size = target.len() as u64;
}

struct XattrEntry<'a> {
    name_index: u8,
    name: &'a [u8],
    value: &'a [u8],
}

fn split_xattr_name(full: &[u8]) -> (u8, &[u8]) {
    const PREFIXES: [(&[u8], u8); 4] = [
        (b"user.", 1),
        (b"trusted.", 4),
        (b"security.", 6),
        (b"system.", 7),
    ];
    for (prefix, index) in PREFIXES {
        if full.starts_with(prefix) {
            return (index, &full[prefix.len()..]);
        }
    }
    (0, full)
}

fn xattr_entry_size(name_len: usize) -> usize {
    (16 + name_len + 3) & !3
}

/// Build the in-inode xattr area: 4-byte magic header, entry table
/// growing forward, values packed from the end. `inline_tail` is the
/// `system.data` value for inline files (may be empty but present).
/// Oversized user xattrs are dropped with a warning - there is no
/// external xattr block in this writer.
pub fn build_xattr_area(
    ino: u64,
    xattrs: &[(Vec<u8>, Vec<u8>)],
    inline_tail: Option<&[u8]>,
) -> Vec<u8> {
    let mut area = vec![0u8; XATTR_AREA_SIZE];
    put_u32(&mut area, 0, EXT4_XATTR_MAGIC);

    let mut entries: Vec<XattrEntry> = Vec::new();
    if let Some(tail) = inline_tail {
        entries.push(XattrEntry {
            name_index: 7,
            name: b"data",
            value: tail,
        });
    }
    for (name, value) in xattrs {
        let (index, short) = split_xattr_name(name);
        entries.push(XattrEntry {
            name_index: index,
            name: short,
            value,
        });
    }

    let mut entry_off = 4usize;
    let mut value_off = XATTR_AREA_SIZE;
    for entry in &entries {
        let entry_size = xattr_entry_size(entry.name.len());
        let value_size = (entry.value.len() + 3) & !3;
        // Entry table and value heap must not collide; keep a 4-byte
        // zero gap terminating the entry list.
        if entry_off + entry_size + 4 + value_size > value_off {
            warn!(
                "inode {}: dropping xattr {:?} ({} value bytes do not fit in the inode)",
                ino,
                String::from_utf8_lossy(entry.name),
                entry.value.len()
            );
            continue;
        }
        value_off -= value_size;
        area[value_off..value_off + entry.value.len()].copy_from_slice(entry.value);

        area[entry_off] = entry.name.len() as u8;
        area[entry_off + 1] = entry.name_index;
        // e_value_offs is relative to IFIRST (the first entry, right
        // after the 4-byte header), not to the header itself.
        put_u16(&mut area, entry_off + 2, (value_off - 4) as u16);
        put_u32(&mut area, entry_off + 4, 0); // value_inum
        put_u32(&mut area, entry_off + 8, entry.value.len() as u32);
        put_u32(&mut area, entry_off + 12, 0); // hash, unused in-inode
        area[entry_off + 16..entry_off + 16 + entry.name.len()].copy_from_slice(entry.name);
        entry_off += xattr_entry_size(entry.name.len());
    }

    if entries.is_empty() {
        return Vec::new();
    }
    area
}
