// JBD2 journal region.
//
// The journal is sized from the device (4/16/32/64/128 MiB at the
// 512 MiB/1/2/4 GiB thresholds), placed at the end of the device when
// a contiguous run is free there, and otherwise wherever the allocator
// finds room. Only the first block carries content - the big-endian
// JBD2 superblock - and the rest is zeroed through the batch surface.

use byteorder::{BigEndian, ByteOrder};
use log::{debug, info};

use fsmorph_core::{BatchWriter, BlockDevice, ConvertError};

use crate::ext4::alloc::BlockAllocator;
use crate::ext4::constants::{EXT4_MAX_EXTENT_LEN, JBD2_MAGIC, JBD2_SUPERBLOCK_V2};
use crate::ext4::layout::Ext4Layout;

/// Where the journal landed; handed from the journal planner to the
/// inode-table writer so inode 8 can describe it.
#[derive(Debug, Clone)]
pub struct JournalLocation {
    /// Contiguous pieces, each at most [`EXT4_MAX_EXTENT_LEN`] blocks
    /// once chunked for the inode's extent entries.
    pub pieces: Vec<(u64, u64)>,
    pub total_blocks: u64,
}

impl JournalLocation {
    pub fn first_block(&self) -> u64 {
        self.pieces.first().map(|&(b, _)| b).unwrap_or(0)
    }

    /// Extent entries (logical, physical, length) for inode 8,
    /// chunked at the per-extent cap.
    pub fn extents(&self) -> Vec<(u32, u64, u32)> {
        let mut out = Vec::new();
        let mut logical = 0u32;
        for &(start, len) in &self.pieces {
            let mut off = 0u64;
            while off < len {
                let chunk = (len - off).min(EXT4_MAX_EXTENT_LEN as u64);
                out.push((logical, start + off, chunk as u32));
                logical += chunk as u32;
                off += chunk;
            }
        }
        out
    }
}

/// Journal size for a device, per the size thresholds.
pub fn journal_bytes(device_size: u64) -> u64 {
    const MIB: u64 = 1 << 20;
    if device_size < 512 * MIB {
        4 * MIB
    } else if device_size < 1024 * MIB {
        16 * MIB
    } else if device_size < 2048 * MIB {
        32 * MIB
    } else if device_size < 4096 * MIB {
        64 * MIB
    } else {
        128 * MIB
    }
}

/// Reserve the journal's blocks. Prefers one run at the end of the
/// device (just below `end_limit`, which keeps it off the rollback
/// checkpoint), then one run anywhere, then fragments - as long as
/// the result still fits the four inline extent slots of inode 8.
pub fn plan_journal(
    device_size: u64,
    layout: &Ext4Layout,
    alloc: &mut BlockAllocator,
    end_limit: u64,
) -> Result<JournalLocation, ConvertError> {
    let bs = layout.block_size as u64;
    let blocks = journal_bytes(device_size) / bs;

    // End of device first.
    let end = end_limit.min(layout.total_blocks);
    if end > blocks {
        let tail = end - blocks;
        if alloc.allocate_at(tail, blocks) {
            debug!("journal placed at end of device: [{}, {})", tail, tail + blocks);
            return Ok(JournalLocation {
                pieces: vec![(tail, blocks)],
                total_blocks: blocks,
            });
        }
    }
    if let Ok(start) = alloc.allocate_run(blocks) {
        debug!("journal placed at [{}, {})", start, start + blocks);
        return Ok(JournalLocation {
            pieces: vec![(start, blocks)],
            total_blocks: blocks,
        });
    }
    let pieces = alloc.allocate_blocks(blocks)?;
    let location = JournalLocation {
        pieces,
        total_blocks: blocks,
    };
    if location.extents().len() > 4 {
        return Err(ConvertError::SpaceExhausted(format!(
            "free space too fragmented for a {} block journal",
            blocks
        )));
    }
    Ok(location)
}

/// Serialize the JBD2 superblock. Everything is big-endian.
pub fn jbd2_superblock(block_size: u32, total_blocks: u64, uuid: &[u8; 16]) -> Vec<u8> {
    let mut b = vec![0u8; 1024];
    BigEndian::write_u32(&mut b[0x00..], JBD2_MAGIC);
    BigEndian::write_u32(&mut b[0x04..], JBD2_SUPERBLOCK_V2);
    BigEndian::write_u32(&mut b[0x08..], 0); // h_sequence
    BigEndian::write_u32(&mut b[0x0C..], block_size);
    BigEndian::write_u32(&mut b[0x10..], total_blocks as u32); // s_maxlen
    BigEndian::write_u32(&mut b[0x14..], 1); // s_first
    BigEndian::write_u32(&mut b[0x18..], 1); // s_sequence
    BigEndian::write_u32(&mut b[0x1C..], 0); // s_start: empty journal
    BigEndian::write_u32(&mut b[0x20..], 0); // s_errno
    b[0x30..0x40].copy_from_slice(uuid);
    BigEndian::write_u32(&mut b[0x40..], 1); // s_nr_users
    b
}

/// Write the journal region: superblock in the first block, zeroes in
/// the rest.
pub fn write_journal(
    device: &dyn BlockDevice,
    location: &JournalLocation,
    block_size: u32,
    uuid: &[u8; 16],
) -> Result<(), ConvertError> {
    let bs = block_size as u64;
    let sb = jbd2_superblock(block_size, location.total_blocks, uuid);

    // Zero pass in large chunks through the batch surface.
    let chunk_blocks = (16u64 << 20) / bs;
    let zeroes = vec![0u8; (chunk_blocks * bs) as usize];
    let mut batch = BatchWriter::begin(device);
    let mut skipped_first = false;
    for &(start, len) in &location.pieces {
        let mut block = start;
        let end = start + len;
        if !skipped_first {
            // First block gets the superblock, not zeroes.
            block += 1;
            skipped_first = true;
        }
        while block < end {
            let n = (end - block).min(chunk_blocks);
            batch.add(block * bs, &zeroes[..(n * bs) as usize])?;
            block += n;
        }
    }
    batch.submit()?;

    let mut first_block = vec![0u8; block_size as usize];
    let copy_len = sb.len().min(first_block.len());
    first_block[..copy_len].copy_from_slice(&sb[..copy_len]);
    device.write_at(location.first_block() * bs, &first_block)?;

    info!(
        "journal written: {} block(s) starting at block {}",
        location.total_blocks,
        location.first_block()
    );
    Ok(())
}
