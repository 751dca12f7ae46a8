// Migration checkpoint and rollback round-trips.

use std::io::Write;

use fsmorph_converter::relocate::migration;
use fsmorph_converter::relocate::{partial_rollback, RelocationEntry, RelocationPlan};
use fsmorph_core::{BlockDevice, FileBlockDevice};

const MIB: u64 = 1 << 20;

fn patterned_device(size: usize) -> (tempfile::NamedTempFile, Vec<u8>) {
    let bytes: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&bytes).unwrap();
    file.flush().unwrap();
    (file, bytes)
}

fn entry(seq: u32, src: u64, dst: u64, len: u64) -> RelocationEntry {
    RelocationEntry {
        src_offset: src,
        dst_offset: dst,
        length: len,
        checksum: 0,
        seq,
        completed: false,
    }
}

#[test]
fn save_execute_rollback_roundtrip() {
    let (file, original) = patterned_device((16 * MIB) as usize);
    let device = FileBlockDevice::open(file.path(), false).unwrap();

    let plan = RelocationPlan {
        entries: vec![
            entry(0, MIB, 5 * MIB, 128 * 1024),
            entry(1, 2 * MIB, 6 * MIB, 4096),
        ],
        conflict_blocks: 33,
    };
    let sb_backup = original[0x10000..0x11000].to_vec();
    migration::save(&device, &sb_backup, &plan).unwrap();

    // Execute the moves, then let "pass 3" scribble over the sources
    // and the primary superblock.
    for e in &plan.entries {
        migration::copy_range(&device, e.src_offset, e.dst_offset, e.length).unwrap();
    }
    device.write_at(MIB, &vec![0xEE; 128 * 1024]).unwrap();
    device.write_at(2 * MIB, &vec![0xEE; 4096]).unwrap();
    device.write_at(0x10000, &vec![0xEE; 4096]).unwrap();

    migration::rollback(&device).unwrap();

    // Every block in the union of sources and destinations matches
    // the pre-relocation device, and the superblock is back.
    let mut check = |offset: u64, len: usize| {
        let mut buf = vec![0u8; len];
        device.read_at(offset, &mut buf).unwrap();
        assert_eq!(
            buf,
            &original[offset as usize..offset as usize + len],
            "mismatch at {:#x}",
            offset
        );
    };
    check(MIB, 128 * 1024);
    check(2 * MIB, 4096);
    check(5 * MIB, 128 * 1024);
    check(6 * MIB, 4096);
    check(0x10000, 4096);

    assert!(!migration::footer_present(&device));
}

#[test]
fn empty_plan_still_creates_a_checkpoint() {
    let (file, original) = patterned_device((8 * MIB) as usize);
    let device = FileBlockDevice::open(file.path(), false).unwrap();

    let plan = RelocationPlan::default();
    let sb_backup = original[0x10000..0x11000].to_vec();
    migration::save(&device, &sb_backup, &plan).unwrap();
    assert!(migration::footer_present(&device));

    device.write_at(0x10000, &[0u8; 4096]).unwrap();
    migration::rollback(&device).unwrap();

    let mut buf = vec![0u8; 4096];
    device.read_at(0x10000, &mut buf).unwrap();
    assert_eq!(buf, sb_backup);
}

#[test]
fn corrupt_footer_aborts_rollback() {
    let (file, original) = patterned_device((8 * MIB) as usize);
    let device = FileBlockDevice::open(file.path(), false).unwrap();

    let plan = RelocationPlan {
        entries: vec![entry(0, MIB, 2 * MIB, 4096)],
        conflict_blocks: 1,
    };
    migration::save(&device, &original[0x10000..0x11000], &plan).unwrap();

    // Flip a bit in the serialized entry array: the footer CRC must
    // catch it.
    let footer_off = migration::footer_offset(device.size());
    let mut footer = vec![0u8; 64];
    device.read_at(footer_off, &mut footer).unwrap();
    let map_off = u64::from_le_bytes(footer[8..16].try_into().unwrap());
    let mut byte = [0u8; 1];
    device.read_at(map_off, &mut byte).unwrap();
    device.write_at(map_off, &[byte[0] ^ 0xFF]).unwrap();

    assert!(migration::rollback(&device).is_err());
    // And nothing was copied back.
    let mut buf = vec![0u8; 4096];
    device.read_at(MIB, &mut buf).unwrap();
    assert_eq!(buf, &original[MIB as usize..MIB as usize + 4096]);
}

#[test]
fn missing_footer_is_an_error() {
    let (file, _) = patterned_device((8 * MIB) as usize);
    let device = FileBlockDevice::open(file.path(), false).unwrap();
    assert!(migration::rollback(&device).is_err());
    assert!(!migration::footer_present(&device));
}

#[test]
fn partial_rollback_reverses_completed_entries_only() {
    let (file, original) = patterned_device((8 * MIB) as usize);
    let device = FileBlockDevice::open(file.path(), false).unwrap();

    let mut plan = RelocationPlan {
        entries: vec![
            entry(0, MIB, 4 * MIB, 8192),
            entry(1, 2 * MIB, 5 * MIB, 8192),
            entry(2, 3 * MIB, 6 * MIB, 8192),
        ],
        conflict_blocks: 6,
    };

    // Entries 0 and 1 completed; entry 2 "failed" mid-write.
    for e in plan.entries.iter_mut().take(2) {
        migration::copy_range(&device, e.src_offset, e.dst_offset, e.length).unwrap();
        e.completed = true;
    }
    // Sources were already repurposed.
    device.write_at(MIB, &vec![0x11; 8192]).unwrap();
    device.write_at(2 * MIB, &vec![0x22; 8192]).unwrap();

    partial_rollback(&device, &plan, 2).unwrap();

    let mut buf = vec![0u8; 8192];
    device.read_at(MIB, &mut buf).unwrap();
    assert_eq!(buf, &original[MIB as usize..MIB as usize + 8192]);
    device.read_at(2 * MIB, &mut buf).unwrap();
    assert_eq!(buf, &original[2 * MIB as usize..2 * MIB as usize + 8192]);
    // The never-started source keeps whatever was there.
    device.read_at(3 * MIB, &mut buf).unwrap();
    assert_eq!(buf, &original[3 * MIB as usize..3 * MIB as usize + 8192]);
}
