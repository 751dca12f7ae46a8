// On-disk relocation journal and btrfs superblock backup.
//
// End-of-device layout (all offsets block-aligned downward):
//   [entry array][footer block @ size-12K][superblock backup @ size-8K]
// The footer names the entry array's offset, count and CRC32c, and is
// zeroed after a successful rollback so it cannot be replayed.

use log::{info, warn};

use fsmorph_core::{BlockDevice, ConvertError};

use crate::btrfs::checksum::crc32c;
use crate::btrfs::structures::{SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE};
use crate::ext4::structures::{get_u32, get_u64, put_u32, put_u64};

use super::{RelocationEntry, RelocationPlan};

pub const FOOTER_MAGIC: &[u8; 8] = b"B2E4MAP1";
pub const FOOTER_SIZE: usize = 64;
pub const ENTRY_SIZE: usize = 40;

/// Hard limits on what a footer may describe.
pub const MAX_ENTRIES: usize = 1 << 20;
pub const MAX_MAP_BYTES: u64 = 1 << 30;

const ALIGN: u64 = 4096;

fn align_down(v: u64) -> u64 {
    v & !(ALIGN - 1)
}

pub fn backup_offset(device_size: u64) -> u64 {
    align_down(device_size - 2 * ALIGN)
}

pub fn footer_offset(device_size: u64) -> u64 {
    align_down(device_size - 3 * ALIGN)
}

/// Blocks holding the checkpoint (entry array, footer, superblock
/// backup). Pass 3 must not allocate over them while the checkpoint is
/// meant to survive.
pub fn protected_blocks(device_size: u64, entry_count: usize, block_size: u32) -> (u64, u64) {
    let map_len = (entry_count * ENTRY_SIZE) as u64;
    let map_off = align_down(footer_offset(device_size) - map_len);
    let bs = block_size as u64;
    let first = map_off / bs;
    let total = device_size / bs;
    (first, total.saturating_sub(first))
}

fn serialize_entries(entries: &[RelocationEntry]) -> Vec<u8> {
    let mut buf = vec![0u8; entries.len() * ENTRY_SIZE];
    for (i, e) in entries.iter().enumerate() {
        let off = i * ENTRY_SIZE;
        put_u64(&mut buf, off, e.src_offset);
        put_u64(&mut buf, off + 8, e.dst_offset);
        put_u64(&mut buf, off + 16, e.length);
        put_u32(&mut buf, off + 24, e.checksum);
        put_u32(&mut buf, off + 28, e.seq);
        put_u32(&mut buf, off + 32, u32::from(e.completed));
    }
    buf
}

fn deserialize_entries(buf: &[u8], count: usize) -> Vec<RelocationEntry> {
    (0..count)
        .map(|i| {
            let off = i * ENTRY_SIZE;
            RelocationEntry {
                src_offset: get_u64(buf, off),
                dst_offset: get_u64(buf, off + 8),
                length: get_u64(buf, off + 16),
                checksum: get_u32(buf, off + 24),
                seq: get_u32(buf, off + 28),
                completed: get_u32(buf, off + 32) != 0,
            }
        })
        .collect()
}

/// Persist the rollback checkpoint: superblock backup, entry array,
/// footer. Invoked before the point of no return even for empty plans,
/// so a checkpoint always exists.
pub fn save(
    device: &dyn BlockDevice,
    btrfs_superblock: &[u8],
    plan: &RelocationPlan,
) -> Result<(), ConvertError> {
    if btrfs_superblock.len() != SUPERBLOCK_SIZE {
        return Err(ConvertError::invariant("superblock backup size"));
    }
    if plan.entries.len() > MAX_ENTRIES {
        return Err(ConvertError::SpaceExhausted(format!(
            "relocation plan of {} entries exceeds the {} entry limit",
            plan.entries.len(),
            MAX_ENTRIES
        )));
    }
    let serialized = serialize_entries(&plan.entries);
    if serialized.len() as u64 > MAX_MAP_BYTES {
        return Err(ConvertError::SpaceExhausted(
            "serialized relocation map exceeds 1 GiB".into(),
        ));
    }

    let size = device.size();
    let backup_off = backup_offset(size);
    let footer_off = footer_offset(size);
    let map_off = align_down(footer_off - serialized.len() as u64);

    device.write_at(backup_off, btrfs_superblock)?;
    if !serialized.is_empty() {
        device.write_at(map_off, &serialized)?;
    }

    let mut footer = [0u8; FOOTER_SIZE];
    footer[..8].copy_from_slice(FOOTER_MAGIC);
    put_u64(&mut footer, 8, map_off);
    put_u32(&mut footer, 16, plan.entries.len() as u32);
    put_u32(&mut footer, 20, crc32c(&serialized));
    device.write_at(footer_off, &footer)?;
    device.sync()?;

    info!(
        "migration checkpoint saved: {} entr{}, footer at {:#x}",
        plan.entries.len(),
        if plan.entries.len() == 1 { "y" } else { "ies" },
        footer_off
    );
    Ok(())
}

/// Read and validate the footer, returning the stored entries.
pub fn load(device: &dyn BlockDevice) -> Result<Vec<RelocationEntry>, ConvertError> {
    let size = device.size();
    let mut footer = [0u8; FOOTER_SIZE];
    device.read_at(footer_offset(size), &mut footer)?;
    if &footer[..8] != FOOTER_MAGIC {
        return Err(ConvertError::corruption(
            "no migration footer found on this device",
        ));
    }
    let map_off = get_u64(&footer, 8);
    let count = get_u32(&footer, 16) as usize;
    let stored_crc = get_u32(&footer, 20);
    if count > MAX_ENTRIES {
        return Err(ConvertError::corruption("migration footer entry count"));
    }
    let map_len = count * ENTRY_SIZE;
    if map_off + map_len as u64 > size {
        return Err(ConvertError::corruption("migration map offset out of range"));
    }
    let mut serialized = vec![0u8; map_len];
    device.read_at(map_off, &mut serialized)?;
    if crc32c(&serialized) != stored_crc {
        return Err(ConvertError::corruption(
            "migration map checksum mismatch; refusing to roll back",
        ));
    }
    Ok(deserialize_entries(&serialized, count))
}

/// Copy `length` bytes from `src` to `dst` in bounded chunks.
pub fn copy_range(
    device: &dyn BlockDevice,
    src: u64,
    dst: u64,
    length: u64,
) -> Result<(), ConvertError> {
    const CHUNK: usize = 1 << 20;
    let mut buf = vec![0u8; CHUNK.min(length as usize).max(1)];
    let mut done = 0u64;
    while done < length {
        let n = buf.len().min((length - done) as usize);
        device.read_at(src + done, &mut buf[..n])?;
        device.write_at(dst + done, &buf[..n])?;
        done += n as u64;
    }
    Ok(())
}

/// Reverse a conversion: undo every recorded move (newest first),
/// restore the btrfs superblock, then wipe the footer so the rollback
/// cannot run twice.
pub fn rollback(device: &dyn BlockDevice) -> Result<(), ConvertError> {
    let entries = load(device)?;
    info!("rolling back {} relocation entr{}", entries.len(),
        if entries.len() == 1 { "y" } else { "ies" });

    for entry in entries.iter().rev() {
        copy_range(device, entry.dst_offset, entry.src_offset, entry.length)?;
    }

    let size = device.size();
    let mut superblock = vec![0u8; SUPERBLOCK_SIZE];
    device.read_at(backup_offset(size), &mut superblock)?;
    device.write_at(SUPERBLOCK_OFFSET, &superblock)?;

    clear_footer(device)?;
    device.sync()?;
    info!("rollback complete; the volume is btrfs again");
    Ok(())
}

/// Zero the footer record.
pub fn clear_footer(device: &dyn BlockDevice) -> Result<(), ConvertError> {
    let zeroes = [0u8; FOOTER_SIZE];
    device.write_at(footer_offset(device.size()), &zeroes)?;
    Ok(())
}

/// Whether a (syntactically) valid footer is present.
pub fn footer_present(device: &dyn BlockDevice) -> bool {
    let mut footer = [0u8; FOOTER_SIZE];
    if device.read_at(footer_offset(device.size()), &mut footer).is_err() {
        warn!("could not read migration footer region");
        return false;
    }
    &footer[..8] == FOOTER_MAGIC
}
