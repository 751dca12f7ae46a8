// Btrfs on-disk structure accessors.
//
// Btrfs packs its structures without alignment, so nothing here casts
// device bytes to structs; every field is read at a spelled-out offset
// through the little-endian helpers below.

use byteorder::{ByteOrder, LittleEndian};

use fsmorph_core::ConvertError;

pub const BTRFS_MAGIC: &[u8; 8] = b"_BHRfS_M";
pub const SUPERBLOCK_OFFSET: u64 = 0x10000;
pub const SUPERBLOCK_SIZE: usize = 4096;
pub const SYS_CHUNK_ARRAY_MAX: usize = 2048;
pub const LABEL_SIZE: usize = 256;

/// Node header: 32-byte csum, 16-byte fsid, bytenr, flags, chunk-tree
/// uuid, generation, owner, nritems, level.
pub const HEADER_SIZE: usize = 0x65;
pub const KEY_SIZE: usize = 17;
pub const ITEM_SIZE: usize = 25;
pub const KEY_PTR_SIZE: usize = 33;

// Tree objectids.
pub const ROOT_TREE_OBJECTID: u64 = 1;
pub const EXTENT_TREE_OBJECTID: u64 = 2;
pub const CHUNK_TREE_OBJECTID: u64 = 3;
pub const DEV_TREE_OBJECTID: u64 = 4;
pub const FS_TREE_OBJECTID: u64 = 5;
pub const FIRST_CHUNK_TREE_OBJECTID: u64 = 256;
pub const FIRST_FREE_OBJECTID: u64 = 256;

// Item key types.
pub const INODE_ITEM_KEY: u8 = 1;
pub const INODE_REF_KEY: u8 = 12;
pub const XATTR_ITEM_KEY: u8 = 24;
pub const DIR_ITEM_KEY: u8 = 84;
pub const DIR_INDEX_KEY: u8 = 96;
pub const EXTENT_DATA_KEY: u8 = 108;
pub const ROOT_ITEM_KEY: u8 = 132;
pub const EXTENT_ITEM_KEY: u8 = 168;
pub const METADATA_ITEM_KEY: u8 = 169;
pub const BLOCK_GROUP_ITEM_KEY: u8 = 192;
pub const DEV_ITEM_KEY: u8 = 216;
pub const CHUNK_ITEM_KEY: u8 = 228;

// Block group / chunk type flags.
pub const BLOCK_GROUP_DATA: u64 = 1 << 0;
pub const BLOCK_GROUP_SYSTEM: u64 = 1 << 1;
pub const BLOCK_GROUP_METADATA: u64 = 1 << 2;

// Extent item flags (extent tree).
pub const EXTENT_FLAG_DATA: u64 = 1 << 0;
pub const EXTENT_FLAG_TREE_BLOCK: u64 = 1 << 1;

pub const PATH_MAX: usize = 4096;

#[inline]
pub fn le16(buf: &[u8], off: usize) -> u16 {
    LittleEndian::read_u16(&buf[off..off + 2])
}

#[inline]
pub fn le32(buf: &[u8], off: usize) -> u32 {
    LittleEndian::read_u32(&buf[off..off + 4])
}

#[inline]
pub fn le64(buf: &[u8], off: usize) -> u64 {
    LittleEndian::read_u64(&buf[off..off + 8])
}

fn need(buf: &[u8], off: usize, len: usize, what: &str) -> Result<(), ConvertError> {
    if off.checked_add(len).map_or(true, |end| end > buf.len()) {
        return Err(ConvertError::corruption(format!(
            "{} truncated: need {} bytes at offset {}, have {}",
            what,
            len,
            off,
            buf.len()
        )));
    }
    Ok(())
}

/// Btrfs item key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskKey {
    pub objectid: u64,
    pub key_type: u8,
    pub offset: u64,
}

impl DiskKey {
    pub fn parse(buf: &[u8], off: usize) -> Result<Self, ConvertError> {
        need(buf, off, KEY_SIZE, "disk key")?;
        Ok(Self {
            objectid: le64(buf, off),
            key_type: buf[off + 8],
            offset: le64(buf, off + 9),
        })
    }
}

/// Parsed B-tree node header.
#[derive(Debug, Clone, Copy)]
pub struct NodeHeader {
    pub bytenr: u64,
    pub generation: u64,
    pub owner: u64,
    pub nritems: u32,
    pub level: u8,
}

impl NodeHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, ConvertError> {
        need(buf, 0, HEADER_SIZE, "node header")?;
        Ok(Self {
            bytenr: le64(buf, 0x30),
            generation: le64(buf, 0x50),
            owner: le64(buf, 0x58),
            nritems: le32(buf, 0x60),
            level: buf[0x64],
        })
    }

    pub fn stored_csum(buf: &[u8]) -> &[u8] {
        &buf[..0x20]
    }

    /// Bytes covered by the node checksum (everything after the slot).
    pub fn csum_payload(buf: &[u8]) -> &[u8] {
        &buf[0x20..]
    }
}

/// Leaf item descriptor: key plus the data range inside the node.
#[derive(Debug, Clone, Copy)]
pub struct LeafItem {
    pub key: DiskKey,
    pub data_offset: u32,
    pub data_size: u32,
}

/// Item `index` of a leaf node. Data offsets are relative to the end of
/// the header.
pub fn leaf_item(buf: &[u8], index: u32) -> Result<LeafItem, ConvertError> {
    let off = HEADER_SIZE + index as usize * ITEM_SIZE;
    need(buf, off, ITEM_SIZE, "leaf item")?;
    Ok(LeafItem {
        key: DiskKey::parse(buf, off)?,
        data_offset: le32(buf, off + KEY_SIZE),
        data_size: le32(buf, off + KEY_SIZE + 4),
    })
}

/// Borrow the item's data slice, bounds-checked against the node.
pub fn leaf_item_data<'a>(buf: &'a [u8], item: &LeafItem) -> Result<&'a [u8], ConvertError> {
    let start = HEADER_SIZE + item.data_offset as usize;
    need(buf, start, item.data_size as usize, "leaf item data")?;
    Ok(&buf[start..start + item.data_size as usize])
}

/// Key pointer `index` of an internal node.
pub fn node_key_ptr(buf: &[u8], index: u32) -> Result<(DiskKey, u64), ConvertError> {
    let off = HEADER_SIZE + index as usize * KEY_PTR_SIZE;
    need(buf, off, KEY_PTR_SIZE, "key pointer")?;
    Ok((DiskKey::parse(buf, off)?, le64(buf, off + KEY_SIZE)))
}

/// btrfs_inode_item (160 bytes).
#[derive(Debug, Clone, Copy, Default)]
pub struct InodeItem {
    pub generation: u64,
    pub size: u64,
    pub nbytes: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub rdev: u64,
    pub flags: u64,
    pub atime_sec: u64,
    pub atime_nsec: u32,
    pub ctime_sec: u64,
    pub ctime_nsec: u32,
    pub mtime_sec: u64,
    pub mtime_nsec: u32,
    pub otime_sec: u64,
    pub otime_nsec: u32,
}

pub const INODE_ITEM_SIZE: usize = 160;

impl InodeItem {
    pub fn parse(data: &[u8]) -> Result<Self, ConvertError> {
        need(data, 0, INODE_ITEM_SIZE, "inode item")?;
        Ok(Self {
            generation: le64(data, 0),
            size: le64(data, 16),
            nbytes: le64(data, 24),
            nlink: le32(data, 40),
            uid: le32(data, 44),
            gid: le32(data, 48),
            mode: le32(data, 52),
            rdev: le64(data, 56),
            flags: le64(data, 64),
            atime_sec: le64(data, 112),
            atime_nsec: le32(data, 120),
            ctime_sec: le64(data, 124),
            ctime_nsec: le32(data, 132),
            mtime_sec: le64(data, 136),
            mtime_nsec: le32(data, 144),
            otime_sec: le64(data, 148),
            otime_nsec: le32(data, 156),
        })
    }
}

/// btrfs_inode_ref: index, name_len, name. Key offset carries the
/// parent objectid.
#[derive(Debug)]
pub struct InodeRef<'a> {
    pub index: u64,
    pub name: &'a [u8],
}

impl<'a> InodeRef<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, ConvertError> {
        need(data, 0, 10, "inode ref")?;
        let name_len = le16(data, 8) as usize;
        need(data, 10, name_len, "inode ref name")?;
        Ok(Self {
            index: le64(data, 0),
            name: &data[10..10 + name_len],
        })
    }
}

/// btrfs_dir_item: location key, transid, data_len, name_len, type,
/// then name and data. XATTR_ITEM uses the same layout with the xattr
/// value in `data`.
#[derive(Debug)]
pub struct DirItem<'a> {
    pub location: DiskKey,
    pub item_type: u8,
    pub name: &'a [u8],
    pub data: &'a [u8],
    /// Total encoded length, for iterating packed entries.
    pub encoded_len: usize,
}

pub const DIR_ITEM_HEADER: usize = KEY_SIZE + 8 + 2 + 2 + 1;

impl<'a> DirItem<'a> {
    pub fn parse(data: &'a [u8], off: usize) -> Result<Self, ConvertError> {
        need(data, off, DIR_ITEM_HEADER, "dir item")?;
        let location = DiskKey::parse(data, off)?;
        let data_len = le16(data, off + KEY_SIZE + 8) as usize;
        let name_len = le16(data, off + KEY_SIZE + 10) as usize;
        let item_type = data[off + KEY_SIZE + 12];
        let name_off = off + DIR_ITEM_HEADER;
        need(data, name_off, name_len + data_len, "dir item payload")?;
        Ok(Self {
            location,
            item_type,
            name: &data[name_off..name_off + name_len],
            data: &data[name_off + name_len..name_off + name_len + data_len],
            encoded_len: DIR_ITEM_HEADER + name_len + data_len,
        })
    }

    /// Iterate the packed entries of one item body (XATTR_ITEMs may
    /// hold several).
    pub fn parse_all(data: &'a [u8]) -> Result<Vec<DirItem<'a>>, ConvertError> {
        let mut out = Vec::new();
        let mut off = 0;
        while off < data.len() {
            let item = DirItem::parse(data, off)?;
            off += item.encoded_len;
            out.push(item);
        }
        Ok(out)
    }
}

/// btrfs_file_extent_item.
#[derive(Debug, Clone)]
pub struct FileExtentItem {
    pub generation: u64,
    pub ram_bytes: u64,
    pub compression: u8,
    pub extent_type: u8,
    /// Regular/prealloc only.
    pub disk_bytenr: u64,
    pub disk_num_bytes: u64,
    pub offset: u64,
    pub num_bytes: u64,
    /// Inline only.
    pub inline_data: Option<Vec<u8>>,
}

pub const FILE_EXTENT_INLINE_HEADER: usize = 21;
pub const FILE_EXTENT_REG_SIZE: usize = 53;

pub const FILE_EXTENT_INLINE: u8 = 0;
pub const FILE_EXTENT_REG: u8 = 1;
pub const FILE_EXTENT_PREALLOC: u8 = 2;

impl FileExtentItem {
    pub fn parse(data: &[u8]) -> Result<Self, ConvertError> {
        need(data, 0, FILE_EXTENT_INLINE_HEADER, "file extent item")?;
        let generation = le64(data, 0);
        let ram_bytes = le64(data, 8);
        let compression = data[16];
        let extent_type = data[20];
        if extent_type == FILE_EXTENT_INLINE {
            let payload = &data[FILE_EXTENT_INLINE_HEADER..];
            return Ok(Self {
                generation,
                ram_bytes,
                compression,
                extent_type,
                disk_bytenr: 0,
                disk_num_bytes: payload.len() as u64,
                offset: 0,
                num_bytes: ram_bytes,
                inline_data: Some(payload.to_vec()),
            });
        }
        need(data, 0, FILE_EXTENT_REG_SIZE, "regular file extent item")?;
        Ok(Self {
            generation,
            ram_bytes,
            compression,
            extent_type,
            disk_bytenr: le64(data, 21),
            disk_num_bytes: le64(data, 29),
            offset: le64(data, 37),
            num_bytes: le64(data, 45),
            inline_data: None,
        })
    }
}

/// btrfs_chunk header (stripes follow).
#[derive(Debug, Clone, Copy)]
pub struct ChunkItem {
    pub length: u64,
    pub type_flags: u64,
    pub num_stripes: u16,
    /// First stripe's device offset; single-device operation takes
    /// this as the physical address.
    pub stripe0_devid: u64,
    pub stripe0_offset: u64,
    pub encoded_len: usize,
}

pub const CHUNK_HEADER_SIZE: usize = 48;
pub const STRIPE_SIZE: usize = 32;

impl ChunkItem {
    pub fn parse(data: &[u8], off: usize) -> Result<Self, ConvertError> {
        need(data, off, CHUNK_HEADER_SIZE, "chunk item")?;
        let num_stripes = le16(data, off + 44);
        if num_stripes == 0 {
            return Err(ConvertError::corruption("chunk item with zero stripes"));
        }
        let encoded_len = CHUNK_HEADER_SIZE + num_stripes as usize * STRIPE_SIZE;
        need(data, off, encoded_len, "chunk stripes")?;
        Ok(Self {
            length: le64(data, off),
            type_flags: le64(data, off + 24),
            num_stripes,
            stripe0_devid: le64(data, off + CHUNK_HEADER_SIZE),
            stripe0_offset: le64(data, off + CHUNK_HEADER_SIZE + 8),
            encoded_len,
        })
    }
}

/// btrfs_root_item; only the fields the conversion needs.
#[derive(Debug, Clone, Copy)]
pub struct RootItem {
    pub root_dirid: u64,
    pub bytenr: u64,
    pub level: u8,
}

pub const ROOT_ITEM_MIN_SIZE: usize = 239;

impl RootItem {
    pub fn parse(data: &[u8]) -> Result<Self, ConvertError> {
        need(data, 0, ROOT_ITEM_MIN_SIZE, "root item")?;
        Ok(Self {
            root_dirid: le64(data, INODE_ITEM_SIZE + 8),
            bytenr: le64(data, INODE_ITEM_SIZE + 16),
            level: data[238],
        })
    }
}

/// btrfs_extent_item header (extent tree).
#[derive(Debug, Clone, Copy)]
pub struct ExtentItem {
    pub refs: u64,
    pub flags: u64,
}

impl ExtentItem {
    pub fn parse(data: &[u8]) -> Result<Self, ConvertError> {
        need(data, 0, 24, "extent item")?;
        Ok(Self {
            refs: le64(data, 0),
            flags: le64(data, 16),
        })
    }
}
