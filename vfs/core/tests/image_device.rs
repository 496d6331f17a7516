use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use imagefs_core::{
    BlockCache, ByteStream, DeviceStorage, Driver, MountFlags, OpenFlags, VfsErrorKind,
};
use imagefs_mem::{MemFs, MemFsConfig};
use pretty_assertions::assert_eq;

const BLOCK: usize = 128;
const BLOCKS: u64 = 10;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

fn reload(image: &File) -> BlockCache<DeviceStorage<File>> {
    let device = image.try_clone().unwrap();
    BlockCache::new(BLOCK, BLOCKS, DeviceStorage::new(device, BLOCK)).unwrap()
}

#[tracing_test::traced_test]
#[test]
fn file_survives_flush_and_reload() {
    let image = tempfile::tempfile().unwrap();
    let config = MemFsConfig {
        block_size: BLOCK,
        total_blocks: BLOCKS,
        ..MemFsConfig::default()
    };
    let fs = MemFs::with_device(config, image.try_clone().unwrap()).unwrap();
    let driver = Driver::mount(fs, MountFlags::READ_WRITE).unwrap();
    let payload = pattern(300);

    let mut stream = driver.create("/data.bin").unwrap();
    stream.write(&payload).unwrap();
    assert_eq!(stream.cache().total_blocks(), 3);
    assert_eq!(stream.cache().dirty_count(), 3);
    stream.close().unwrap();

    let fs = driver.unmount().unwrap();
    assert_eq!(fs.free_blocks(), 7);
    assert_eq!(fs.block_bitmap(), vec![0b0000_0111, 0]);

    // First-fit placed the file in device blocks 0..3.
    let mut cache = reload(&image);
    let mut buf = vec![0u8; 300];
    cache.read(0, &mut buf).unwrap();
    assert_eq!(buf, payload);
    assert!(logs_contain("mounted"));
}

#[test]
fn stream_over_device_cache_round_trips() {
    let image = tempfile::tempfile().unwrap();
    let payload = pattern(500);

    {
        let mut cache = reload(&image);
        let mut stream = ByteStream::new(&mut cache, 0, OpenFlags::READ_WRITE).unwrap();
        stream.write_at(&payload, 200).unwrap();
        assert_eq!(stream.size(), 700);

        let mut back = vec![0u8; 500];
        assert_eq!(stream.read_at(&mut back, 200).unwrap(), 500);
        assert_eq!(back, payload);
        stream.close().unwrap();
        assert_eq!(cache.dirty_count(), 0);
    }

    let mut raw = Vec::new();
    let mut file = image.try_clone().unwrap();
    file.seek(SeekFrom::Start(0)).unwrap();
    file.read_to_end(&mut raw).unwrap();
    assert!(raw.len() >= 700);
    assert_eq!(&raw[200..700], &payload[..]);
    assert!(raw[..200].iter().all(|&b| b == 0));

    let mut fresh = reload(&image);
    let mut back = vec![0u8; 500];
    fresh.read(200, &mut back).unwrap();
    assert_eq!(back, payload);
}

#[test]
fn growth_past_the_device_is_no_space() {
    let image = tempfile::tempfile().unwrap();
    let storage = DeviceStorage::new(image, BLOCK).with_max_blocks(2);
    let mut cache = BlockCache::new(BLOCK, 0, storage).unwrap();
    let mut stream = ByteStream::new(&mut cache, 0, OpenFlags::WRITE).unwrap();

    stream.write(&[1u8; 256]).unwrap();
    let err = stream.write(&[1u8]).unwrap_err();
    assert_eq!(err.kind(), VfsErrorKind::NoSpace);
    assert_eq!(stream.size(), 256);
    assert_eq!(stream.position(), 256);
}

#[test]
fn full_device_rejects_new_data() {
    let config = MemFsConfig {
        block_size: BLOCK,
        total_blocks: 2,
        ..MemFsConfig::default()
    };
    let driver = Driver::mount(MemFs::new(config).unwrap(), MountFlags::READ_WRITE).unwrap();
    driver.write_file("/fits", &[0u8; 256], 0o644).unwrap();

    let err = driver.write_file("/overflow", b"x", 0o644).unwrap_err();
    assert_eq!(err.kind(), VfsErrorKind::NoSpace);
    assert_eq!(err.errno(), libc::ENOSPC);
    assert_eq!(driver.stat("/overflow").unwrap().size, 0);
}
