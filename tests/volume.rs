//! End-to-end scenarios on a 64 MiB in-memory volume with 512-byte
//! sectors, one sector per cluster and 32 reserved sectors.

use std::io::SeekFrom;
use std::sync::Arc;

use fat32_img::{
    is_end_of_chain, mkfat32, BlockStream, FormatConfig, FsError, MemStream, Volume,
};

const SIZE: u64 = 64 << 20;

fn format_volume() -> Arc<dyn BlockStream> {
    let stream: Arc<dyn BlockStream> = Arc::new(MemStream::new(SIZE));
    let cfg = FormatConfig {
        sectors_per_cluster: 1,
        ..FormatConfig::default()
    };
    mkfat32(&stream, SIZE, &cfg).unwrap();
    stream
}

fn fat_entry(stream: &Arc<dyn BlockStream>, fat_offset: u64, index: u64) -> u32 {
    let mut buf = [0u8; 4];
    stream.read_at(fat_offset + index * 4, &mut buf).unwrap();
    u32::from_le_bytes(buf)
}

#[test]
fn format_layout_and_reserved_entries() {
    let stream = format_volume();
    let vol = Volume::mount(stream.clone()).unwrap();
    let boot = vol.boot();

    assert_eq!(boot.fat_offset(0), 16384);
    assert_eq!(boot.data_offset(), 1064960);
    assert_eq!(boot.root_offset(), 1064960);
    assert_eq!(boot.root_cluster, 2);

    assert_eq!(fat_entry(&stream, 16384, 0), 0x0FFF_FFF8);
    assert_eq!(fat_entry(&stream, 16384, 1), 0x0FFF_FFFF);
    assert_eq!(fat_entry(&stream, 16384, 2), 0x0FFF_FFFF);

    // FSINFO advertises every cluster but the root as free
    let mut sector = [0u8; 512];
    stream.read_at(512, &mut sector).unwrap();
    let free = u32::from_le_bytes(sector[0x1E8..0x1EC].try_into().unwrap());
    let clusters = (SIZE - 32 * 512) / 512;
    assert_eq!(free as u64, clusters - 1);

    // re-parsing yields a legal FAT32 volume with a one-cluster root
    let count = boot.cluster_count();
    assert!((65_526..=0x0FFF_FFF6).contains(&count));
    let root = vol.root().unwrap();
    assert!(root.entries().unwrap().is_empty());
}

#[test]
fn small_file_survives_remount() {
    let stream = format_volume();
    {
        let vol = Volume::mount(stream.clone()).unwrap();
        let root = vol.root().unwrap();
        let mut f = root.create("hello.txt", 0).unwrap();
        f.write(b"Hi").unwrap();
        f.close().unwrap();
        drop(root);
        vol.flush().unwrap();
    }

    let vol = Volume::mount(stream.clone()).unwrap();
    let root = vol.root().unwrap();
    let e = root.find("hello.txt").unwrap();
    assert_eq!(e.file_size(), 2);
    assert_eq!(e.start(), 3);

    let mut f = root.open("hello.txt").unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(f.read(&mut buf).unwrap(), 2);
    assert_eq!(&buf[..2], b"Hi");
    f.close().unwrap();

    assert!(is_end_of_chain(
        fat_entry(&stream, 16384, 3) & 0x0FFF_FFFF
    ));
}

#[test]
fn long_name_slots_and_checksum() {
    let stream = format_volume();
    let vol = Volume::mount(stream.clone()).unwrap();
    let root = vol.root().unwrap();
    root.create("Readme With Spaces.txt", 0)
        .unwrap()
        .close()
        .unwrap();

    let e = root.find("Readme With Spaces.txt").unwrap();
    // two long slots precede the 8.3 slot on disk
    assert_eq!(e.slot_count(), 3);
    assert_eq!(e.short_name(), "README~1.TXT");
    for slot in e.lfn_slots() {
        assert_eq!(slot.checksum, e.short_entry().checksum());
    }

    // the raw slot order on disk: terminal LFN, LFN #1, then 8.3
    let mut raw = [0u8; 96];
    stream
        .read_at(vol.boot().root_offset() + e.pos(), &mut raw)
        .unwrap();
    assert_eq!(raw[0], 0x42); // seq 2 | LAST_LONG_ENTRY
    assert_eq!(raw[32], 0x01);
    assert_eq!(&raw[64..72], b"README~1");
}

#[test]
fn fragmented_chain_reads_back_exactly() {
    let stream = format_volume();
    let vol = Volume::mount(stream.clone()).unwrap();
    let root = vol.root().unwrap();

    root.create("a.bin", 1).unwrap().close().unwrap();
    root.create("b.bin", 1).unwrap().close().unwrap();
    let a_start = root.find("a.bin").unwrap().start();
    let b_start = root.find("b.bin").unwrap().start();
    assert_eq!(a_start + 1, b_start);
    root.erase("a.bin").unwrap();

    let mut c = root.create("c.bin", 2).unwrap();
    let payload: Vec<u8> = (0..900u32).map(|i| (i * 7 % 251) as u8).collect();
    c.write(&payload).unwrap();
    c.close().unwrap();

    // c reuses the hole and a later cluster: two non-contiguous runs
    let e = root.find("c.bin").unwrap();
    assert_eq!(e.start(), a_start);
    let next = fat_entry(&stream, 16384, a_start as u64) & 0x0FFF_FFFF;
    assert_ne!(next, a_start + 1);
    assert!(!is_end_of_chain(next));

    let mut f = root.open("c.bin").unwrap();
    let mut back = vec![0u8; 900];
    assert_eq!(f.read(&mut back).unwrap(), 900);
    assert_eq!(back, payload);
    f.close().unwrap();
}

#[test]
fn erase_then_create_reuses_cluster_and_slot() {
    let stream = format_volume();
    let vol = Volume::mount(stream.clone()).unwrap();
    let root = vol.root().unwrap();

    let mut f = root.create("hello.txt", 0).unwrap();
    f.write(b"Hi").unwrap();
    f.close().unwrap();
    let e = root.find("hello.txt").unwrap();
    assert_eq!(e.start(), 3);
    assert_eq!(e.pos(), 0);
    let (free_before, _) = vol.free_space();

    root.erase("hello.txt").unwrap();
    assert_eq!(vol.free_space().0, free_before + 1);
    // the slot group is erased on disk, not blanked
    let mut first = [0u8; 1];
    stream.read_at(vol.boot().root_offset(), &mut first).unwrap();
    assert_eq!(first[0], 0xE5);

    root.create("other.bin", 1).unwrap().close().unwrap();
    let e = root.find("other.bin").unwrap();
    assert_eq!(e.start(), 3);
    assert_eq!(e.pos(), 0);
}

#[test]
fn rmtree_frees_directory_and_contents() {
    let stream = format_volume();
    let vol = Volume::mount(stream.clone()).unwrap();
    let root = vol.root().unwrap();
    let (free_at_start, _) = vol.free_space();

    let sub = root.mkdir("sub").unwrap();
    let mut f = sub.create("x", 0).unwrap();
    f.write(b"payload").unwrap();
    f.close().unwrap();
    // one cluster for the table, one for x
    assert_eq!(vol.free_space().0, free_at_start - 2);

    root.rmtree("sub").unwrap();
    assert!(root.find("sub").is_none());
    assert_eq!(vol.free_space().0, free_at_start);

    // both slot groups in the parent are erased
    let mut raw = [0u8; 64];
    stream.read_at(vol.boot().root_offset(), &mut raw).unwrap();
    assert_eq!(raw[0], 0xE5);
}

#[test]
fn seek_boundaries() {
    let stream = format_volume();
    let vol = Volume::mount(stream.clone()).unwrap();
    let root = vol.root().unwrap();
    let mut f = root.create("b.bin", 1).unwrap();
    f.write(&[1u8; 512]).unwrap();
    // seeking k bytes past the allocated size grows by ceil(k/cluster)
    f.seek(SeekFrom::Start(512 + 1)).unwrap();
    assert_eq!(f.tell(), 513);
    f.close().unwrap();
    let e = root.find("b.bin").unwrap();
    let second = fat_entry(&stream, 16384, e.start() as u64) & 0x0FFF_FFFF;
    assert!(!is_end_of_chain(second));
    assert!(is_end_of_chain(
        fat_entry(&stream, 16384, second as u64) & 0x0FFF_FFFF
    ));
}

#[test]
fn exhausting_free_space_fails_cleanly() {
    let stream = format_volume();
    let vol = Volume::mount(stream.clone()).unwrap();
    let root = vol.root().unwrap();
    let (free, _) = vol.free_space();

    // allocate every free cluster, then one more
    let mut f = root.create("big.bin", 0).unwrap();
    f.truncate(free as u64 * 512, false).unwrap();
    assert_eq!(vol.free_space().0, 0);
    let err = f.write(&[0u8; 1]).map(|_| ()).unwrap_err();
    assert!(matches!(err, FsError::OutOfSpace { .. }));
    f.close().unwrap();
}

#[test]
fn flush_persists_fsinfo_counters() {
    let stream = format_volume();
    {
        let vol = Volume::mount(stream.clone()).unwrap();
        let root = vol.root().unwrap();
        root.create("f.bin", 4).unwrap().close().unwrap();
        let free = vol.free_space().0;
        drop(root);
        drop(vol); // drop flushes FSINFO

        let mut sector = [0u8; 512];
        stream.read_at(512, &mut sector).unwrap();
        let recorded = u32::from_le_bytes(sector[0x1E8..0x1EC].try_into().unwrap());
        assert_eq!(recorded, free);
        let hint = u32::from_le_bytes(sector[0x1EC..0x1F0].try_into().unwrap());
        assert_eq!(hint, 6); // last cluster handed to f.bin
    }
}
