use vdisk_storage::sparse::HostedConfig;
use vdisk_storage::{
    DiskError, HostedExtent, OpenOptions, StdFileBackend, StorageBackend, VirtualDisk,
};

use std::io::Write as _;

#[cfg(any(unix, windows))]
use std::io::{Seek, SeekFrom};

#[test]
fn std_file_backend_set_len_write_read_roundtrip() {
    let file = tempfile::tempfile().unwrap();
    let mut backend = StdFileBackend::from_file(file);

    backend.set_len(4096).unwrap();
    assert_eq!(backend.len().unwrap(), 4096);

    let data = b"grain table bytes";
    backend.write_at(123, data).unwrap();

    let mut back = vec![0u8; data.len()];
    backend.read_at(123, &mut back).unwrap();
    assert_eq!(back, data);
}

#[test]
fn std_file_backend_read_oob_returns_out_of_bounds() {
    let file = tempfile::tempfile().unwrap();
    let mut backend = StdFileBackend::from_file(file);
    backend.set_len(1024).unwrap();

    let mut buf = [0u8; 200];
    let err = backend.read_at(900, &mut buf).unwrap_err();
    assert!(matches!(err, DiskError::OutOfBounds { .. }));
}

#[cfg(any(unix, windows))]
#[test]
fn std_file_backend_does_not_disturb_file_cursor() {
    let mut file = tempfile::tempfile().unwrap();
    file.write_all(&[0u8; 16]).unwrap();
    file.seek(SeekFrom::Start(5)).unwrap();
    let before = file.stream_position().unwrap();

    let mut backend = StdFileBackend::from_file(file);
    let mut buf = [0u8; 4];
    backend.read_at(0, &mut buf).unwrap();
    backend.write_at(8, &[1, 2, 3, 4]).unwrap();
    backend.flush().unwrap();

    let mut file = backend.into_file();
    assert_eq!(file.stream_position().unwrap(), before);
}

#[test]
fn std_file_backend_offset_overflow_is_reported() {
    let file = tempfile::tempfile().unwrap();
    let mut backend = StdFileBackend::from_file(file);
    let mut buf = [0u8; 2];

    assert!(matches!(
        backend.read_at(u64::MAX, &mut buf).unwrap_err(),
        DiskError::OffsetOverflow
    ));
    assert!(matches!(
        backend.write_at(u64::MAX - 1, &buf).unwrap_err(),
        DiskError::OffsetOverflow
    ));
}

#[test]
fn std_file_backend_read_only_rejects_writes_and_allows_flush() {
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(b"KDMV").unwrap();
    tmp.flush().unwrap();

    let mut backend = StdFileBackend::open_read_only(tmp.path()).unwrap();
    assert!(backend.is_read_only());
    assert_eq!(backend.len().unwrap(), 4);

    let err = backend.write_at(0, b"x").unwrap_err();
    assert!(matches!(err, DiskError::NotSupported(s) if s == "read-only backend"));
    let err = backend.set_len(8).unwrap_err();
    assert!(matches!(err, DiskError::NotSupported(s) if s == "read-only backend"));

    backend.flush().unwrap();
}

#[test]
fn hosted_extent_persists_through_a_real_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.vmdk");

    let config = HostedConfig::new(4 * 1024 * 1024).with_gtes_per_gt(16);
    let mut extent =
        HostedExtent::create(StdFileBackend::create(&path).unwrap(), &config, None).unwrap();
    extent.write_at(3 * 1024 * 1024 + 7, b"persisted").unwrap();
    extent.close().unwrap();
    drop(extent);

    let backend = StdFileBackend::open_read_only(&path).unwrap();
    let mut extent = HostedExtent::open(backend, &OpenOptions::read_only(), None).unwrap();
    let mut buf = [0u8; 9];
    extent.read_at(3 * 1024 * 1024 + 7, &mut buf).unwrap();
    assert_eq!(&buf, b"persisted");
    extent.verify_redundancy().unwrap();

    assert!(matches!(
        extent.write_at(0, b"x").unwrap_err(),
        DiskError::ReadOnly
    ));
}
