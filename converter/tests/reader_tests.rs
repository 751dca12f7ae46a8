// Pass-1 reader tests over synthesized btrfs images.

mod common;

use common::{BtrfsImageBuilder, TestFile};
use fsmorph_converter::btrfs::reader::BtrfsReader;
use fsmorph_converter::model::{Compression, ExtentKind};
use fsmorph_core::FileBlockDevice;

const MIB: u64 = 1 << 20;

#[test]
fn reads_empty_volume() {
    let image = BtrfsImageBuilder::new(128 * MIB, "T").write_temp();
    let device = FileBlockDevice::open(image.path(), true).unwrap();
    let outcome = BtrfsReader::new(&device).read().unwrap();

    assert_eq!(outcome.info.label, "T");
    assert_eq!(outcome.info.inode_count(), 1);
    let root = outcome.info.entry(outcome.info.root.unwrap());
    assert_eq!(root.ino, 256);
    assert!(root.is_dir());
    assert_eq!(root.mode & 0o777, 0o755);
    assert!(root.children.is_empty());
}

#[test]
fn reads_files_with_extents_and_links() {
    let mut builder = BtrfsImageBuilder::new(128 * MIB, "vol");
    builder.add(TestFile::inline_file(257, "notes.txt", b"hello inline world"));
    let payload: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
    builder.add(TestFile::regular_file(258, "blob.bin", 8 * MIB, payload.clone()));
    let image = builder.write_temp();

    let device = FileBlockDevice::open(image.path(), true).unwrap();
    let outcome = BtrfsReader::new(&device).read().unwrap();
    let info = &outcome.info;

    assert_eq!(info.inode_count(), 3);
    let root = info.entry(info.root.unwrap());
    assert_eq!(root.children.len(), 2);

    let index = info.objectid_index();
    let notes = info.entry(index[&257]);
    assert_eq!(notes.size, 18);
    assert_eq!(notes.extents.len(), 1);
    assert_eq!(notes.extents[0].kind, ExtentKind::Inline);
    assert_eq!(
        notes.extents[0].inline_data.as_deref(),
        Some(&b"hello inline world"[..])
    );

    let blob = info.entry(index[&258]);
    assert_eq!(blob.parent_ino, 256);
    assert_eq!(blob.nlink, 1);
    let extent = &blob.extents[0];
    assert_eq!(extent.kind, ExtentKind::Regular);
    assert_eq!(extent.compression, Compression::None);
    assert_eq!(extent.disk_bytenr, 8 * MIB);
    assert_eq!(extent.num_bytes, 8192);

    // Synthesised used-block map covers the data extent.
    assert!(info
        .used_blocks
        .ranges()
        .iter()
        .any(|r| r.start == 8 * MIB && r.length == 8192));
}

#[test]
fn resolves_chunk_mapping_identity() {
    let image = BtrfsImageBuilder::new(128 * MIB, "T").write_temp();
    let device = FileBlockDevice::open(image.path(), true).unwrap();
    let outcome = BtrfsReader::new(&device).read().unwrap();
    for addr in [0u64, 4096, 8 * MIB, 100 * MIB] {
        assert_eq!(outcome.chunks.resolve(addr), addr);
    }
    assert_eq!(
        outcome.chunks.resolve(128 * MIB),
        fsmorph_converter::btrfs::chunk_map::RESOLVE_NOT_FOUND
    );
}

#[test]
fn rejects_corrupt_superblock_magic() {
    let image = BtrfsImageBuilder::new(128 * MIB, "T");
    let mut bytes = image.build();
    bytes[0x10000 + 0x40] = b'X';
    let mut file = tempfile::NamedTempFile::new().unwrap();
    std::io::Write::write_all(&mut file, &bytes).unwrap();
    let device = FileBlockDevice::open(file.path(), true).unwrap();
    assert!(BtrfsReader::new(&device).read().is_err());
}

#[test]
fn rejects_corrupt_node_checksum() {
    let image = BtrfsImageBuilder::new(128 * MIB, "T");
    let mut bytes = image.build();
    // Flip one byte inside the first FS tree leaf.
    let off = common::METADATA_BASE as usize + common::NODE_SIZE + 0x200;
    bytes[off] ^= 0xFF;
    let mut file = tempfile::NamedTempFile::new().unwrap();
    std::io::Write::write_all(&mut file, &bytes).unwrap();
    let device = FileBlockDevice::open(file.path(), true).unwrap();
    assert!(BtrfsReader::new(&device).read().is_err());
}

#[test]
fn reads_thousand_file_directory() {
    let mut builder = BtrfsImageBuilder::new(192 * MIB, "big");
    for i in 0..1000u64 {
        builder.add(TestFile::inline_file(
            257 + i,
            &format!("file_{:04}.dat", i),
            format!("payload {:04}", i).as_bytes(),
        ));
    }
    let image = builder.write_temp();
    let device = FileBlockDevice::open(image.path(), true).unwrap();
    let outcome = BtrfsReader::new(&device).read().unwrap();

    assert_eq!(outcome.info.inode_count(), 1001);
    let root = outcome.info.entry(outcome.info.root.unwrap());
    assert_eq!(root.children.len(), 1000);
    let names: std::collections::HashSet<&[u8]> =
        root.children.iter().map(|c| c.name.as_slice()).collect();
    assert!(names.contains(&b"file_0000.dat"[..]));
    assert!(names.contains(&b"file_0999.dat"[..]));
}
