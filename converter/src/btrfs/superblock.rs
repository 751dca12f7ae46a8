// Btrfs superblock parsing and validation.
//
// The primary superblock lives at byte 0x10000 and is 4096 bytes; every
// multi-byte field is little-endian. The checksum covers everything
// after the 32-byte checksum slot.

use fsmorph_core::{BlockDevice, ConvertError};

use super::checksum::{self, ChecksumKind};
use super::structures::{
    le16, le32, le64, BTRFS_MAGIC, LABEL_SIZE, SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE,
    SYS_CHUNK_ARRAY_MAX,
};

const MAGIC_OFFSET: usize = 0x40;
const LABEL_OFFSET: usize = 0x12B;
const SYS_CHUNK_ARRAY_OFFSET: usize = 0x32B;

#[derive(Debug, Clone)]
pub struct BtrfsSuperblock {
    pub fsid: [u8; 16],
    pub generation: u64,
    /// Root tree root, logical.
    pub root: u64,
    /// Chunk tree root, logical.
    pub chunk_root: u64,
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub root_dir_objectid: u64,
    pub num_devices: u64,
    pub sectorsize: u32,
    pub nodesize: u32,
    pub sys_chunk_array_size: u32,
    pub csum_type: ChecksumKind,
    pub root_level: u8,
    pub chunk_root_level: u8,
    pub label: String,
    pub sys_chunk_array: Vec<u8>,
    /// The raw 4096 superblock bytes, kept for the migration backup.
    pub raw: Vec<u8>,
}

impl BtrfsSuperblock {
    /// Read and validate the superblock from `device`.
    pub fn read(device: &dyn BlockDevice) -> Result<Self, ConvertError> {
        let mut raw = vec![0u8; SUPERBLOCK_SIZE];
        device.read_at(SUPERBLOCK_OFFSET, &mut raw)?;
        Self::parse(raw)
    }

    pub fn parse(raw: Vec<u8>) -> Result<Self, ConvertError> {
        if raw.len() != SUPERBLOCK_SIZE {
            return Err(ConvertError::corruption("superblock buffer size"));
        }
        if &raw[MAGIC_OFFSET..MAGIC_OFFSET + 8] != BTRFS_MAGIC {
            return Err(ConvertError::corruption("bad btrfs superblock magic"));
        }

        let csum_type = ChecksumKind::from_raw(le16(&raw, 0xC4))?;
        if !checksum::verify(csum_type, &raw[..0x20], &raw[0x20..]) {
            return Err(ConvertError::corruption("btrfs superblock checksum mismatch"));
        }

        let sectorsize = le32(&raw, 0x90);
        if sectorsize != 4096 {
            return Err(ConvertError::unsupported(format!(
                "sector size {} (only 4096 is supported)",
                sectorsize
            )));
        }
        let nodesize = le32(&raw, 0x94);
        if nodesize < sectorsize || nodesize > 65536 || nodesize % sectorsize != 0 {
            return Err(ConvertError::corruption(format!(
                "node size {} out of range",
                nodesize
            )));
        }
        let num_devices = le64(&raw, 0x88);
        if num_devices != 1 {
            return Err(ConvertError::unsupported(format!(
                "multi-device filesystem ({} devices)",
                num_devices
            )));
        }
        let sys_chunk_array_size = le32(&raw, 0xA0);
        if sys_chunk_array_size == 0 || sys_chunk_array_size as usize > SYS_CHUNK_ARRAY_MAX {
            return Err(ConvertError::corruption(format!(
                "system chunk array size {}",
                sys_chunk_array_size
            )));
        }

        let mut fsid = [0u8; 16];
        fsid.copy_from_slice(&raw[0x20..0x30]);

        let label_bytes = &raw[LABEL_OFFSET..LABEL_OFFSET + LABEL_SIZE];
        let label_end = label_bytes.iter().position(|&b| b == 0).unwrap_or(LABEL_SIZE);
        let label = String::from_utf8_lossy(&label_bytes[..label_end]).into_owned();

        let sys_chunk_array =
            raw[SYS_CHUNK_ARRAY_OFFSET..SYS_CHUNK_ARRAY_OFFSET + sys_chunk_array_size as usize]
                .to_vec();

        Ok(Self {
            fsid,
            generation: le64(&raw, 0x48),
            root: le64(&raw, 0x50),
            chunk_root: le64(&raw, 0x58),
            total_bytes: le64(&raw, 0x70),
            bytes_used: le64(&raw, 0x78),
            root_dir_objectid: le64(&raw, 0x80),
            num_devices,
            sectorsize,
            nodesize,
            sys_chunk_array_size,
            csum_type,
            root_level: raw[0xC6],
            chunk_root_level: raw[0xC7],
            label,
            sys_chunk_array,
            raw,
        })
    }
}

/// Serialisation side used by tests and fixtures: lay a valid
/// superblock into `buf` and stamp its checksum.
pub fn finish_superblock_checksum(buf: &mut [u8]) {
    let crc = checksum::crc32c(&buf[0x20..]);
    buf[..4].copy_from_slice(&crc.to_le_bytes());
    for b in &mut buf[4..0x20] {
        *b = 0;
    }
}

/// Field offsets shared with the fixture builder.
pub mod offsets {
    pub const CSUM: usize = 0x00;
    pub const FSID: usize = 0x20;
    pub const BYTENR: usize = 0x30;
    pub const MAGIC: usize = 0x40;
    pub const GENERATION: usize = 0x48;
    pub const ROOT: usize = 0x50;
    pub const CHUNK_ROOT: usize = 0x58;
    pub const TOTAL_BYTES: usize = 0x70;
    pub const BYTES_USED: usize = 0x78;
    pub const ROOT_DIR_OBJECTID: usize = 0x80;
    pub const NUM_DEVICES: usize = 0x88;
    pub const SECTORSIZE: usize = 0x90;
    pub const NODESIZE: usize = 0x94;
    pub const STRIPESIZE: usize = 0x9C;
    pub const SYS_CHUNK_ARRAY_SIZE: usize = 0xA0;
    pub const CSUM_TYPE: usize = 0xC4;
    pub const ROOT_LEVEL: usize = 0xC6;
    pub const CHUNK_ROOT_LEVEL: usize = 0xC7;
    pub const LABEL: usize = 0x12B;
    pub const SYS_CHUNK_ARRAY: usize = 0x32B;
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{ByteOrder, LittleEndian};

    fn minimal_superblock() -> Vec<u8> {
        let mut raw = vec![0u8; SUPERBLOCK_SIZE];
        raw[offsets::MAGIC..offsets::MAGIC + 8].copy_from_slice(BTRFS_MAGIC);
        LittleEndian::write_u64(&mut raw[offsets::NUM_DEVICES..], 1);
        LittleEndian::write_u32(&mut raw[offsets::SECTORSIZE..], 4096);
        LittleEndian::write_u32(&mut raw[offsets::NODESIZE..], 16384);
        LittleEndian::write_u32(&mut raw[offsets::SYS_CHUNK_ARRAY_SIZE..], 97);
        raw[offsets::LABEL] = b'T';
        finish_superblock_checksum(&mut raw);
        raw
    }

    #[test]
    fn parse_accepts_valid_superblock() {
        let sb = BtrfsSuperblock::parse(minimal_superblock()).unwrap();
        assert_eq!(sb.sectorsize, 4096);
        assert_eq!(sb.nodesize, 16384);
        assert_eq!(sb.label, "T");
        assert_eq!(sb.sys_chunk_array.len(), 97);
    }

    #[test]
    fn parse_rejects_bad_magic() {
        let mut raw = minimal_superblock();
        raw[offsets::MAGIC] = b'X';
        finish_superblock_checksum(&mut raw);
        assert!(BtrfsSuperblock::parse(raw).is_err());
    }

    #[test]
    fn parse_rejects_bad_checksum() {
        let mut raw = minimal_superblock();
        raw[0] ^= 0xFF;
        assert!(BtrfsSuperblock::parse(raw).is_err());
    }

    #[test]
    fn parse_rejects_multi_device() {
        let mut raw = minimal_superblock();
        LittleEndian::write_u64(&mut raw[offsets::NUM_DEVICES..], 2);
        finish_superblock_checksum(&mut raw);
        assert!(BtrfsSuperblock::parse(raw).is_err());
    }

    #[test]
    fn parse_rejects_odd_sector_size() {
        let mut raw = minimal_superblock();
        LittleEndian::write_u32(&mut raw[offsets::SECTORSIZE..], 512);
        finish_superblock_checksum(&mut raw);
        assert!(BtrfsSuperblock::parse(raw).is_err());
    }
}
