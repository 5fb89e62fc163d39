use std::fs;
use std::path::Path;

use vdisk_storage::sparse::HostedConfig;
use vdisk_storage::{
    Access, ChainOptions, Descriptor, DescriptorSource, DiskError, ExtentKind, ExtentRecord,
    ExtentSet, HostedExtent, LayerChain, OpenOptions, StdFileBackend, StreamExtent, VirtualDisk,
};

const MIB: u64 = 1024 * 1024;
const GRAIN: u64 = 64 * 1024;
const BASE_CID: u32 = 0x1111_0001;
const CHILD_CID: u32 = 0x2222_0002;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(29).wrapping_add(seed as u32) as u8)
        .collect()
}

/// Create a hosted extent at `path` carrying `descriptor` in its descriptor area.
fn create_hosted(path: &Path, capacity: u64, descriptor: &Descriptor) -> HostedExtent<StdFileBackend> {
    let config = HostedConfig::new(capacity)
        .with_gtes_per_gt(16)
        .with_descriptor(descriptor.to_text());
    HostedExtent::create(StdFileBackend::create(path).unwrap(), &config, None).unwrap()
}

fn base_descriptor(capacity: u64) -> Descriptor {
    Descriptor::new("monolithicSparse", BASE_CID).with_extent(ExtentRecord::new(
        ExtentKind::Sparse,
        capacity / 512,
        Some("base.vmdk"),
    ))
}

fn child_descriptor(capacity: u64, parent_cid: u32, hint: &str) -> Descriptor {
    Descriptor::new("monolithicSparse", CHILD_CID)
        .with_parent(parent_cid, hint)
        .with_extent(ExtentRecord::new(
            ExtentKind::Sparse,
            capacity / 512,
            Some("child.vmdk"),
        ))
}

/// Base with `base_data` written at `base_offset`, child with no data.
fn two_layer_chain(dir: &Path, base_offset: u64, base_data: &[u8]) {
    let mut base = create_hosted(&dir.join("base.vmdk"), MIB, &base_descriptor(MIB));
    base.write_at(base_offset, base_data).unwrap();
    base.close().unwrap();

    let mut child = create_hosted(
        &dir.join("child.vmdk"),
        MIB,
        &child_descriptor(MIB, BASE_CID, "base.vmdk"),
    );
    child.close().unwrap();
}

#[test]
fn resolves_child_to_base_and_reads_through() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let base_data = pattern(10_000, 1);
    two_layer_chain(dir.path(), 3 * GRAIN, &base_data);

    let chain = LayerChain::resolve(dir.path().join("child.vmdk"), ChainOptions::default())
        .unwrap();
    assert_eq!(chain.layers().len(), 2);
    assert_eq!(chain.top().source(), DescriptorSource::Embedded);
    assert_eq!(chain.base().content_id(), Some(BASE_CID));
    assert!(chain.top().needs_parent());
    assert!(!chain.base().needs_parent());

    let mut disk = chain.open_content().unwrap();
    assert_eq!(disk.capacity_bytes(), MIB);
    let mut buf = vec![0u8; base_data.len()];
    disk.read_at(3 * GRAIN, &mut buf).unwrap();
    assert_eq!(buf, base_data);
    disk.close().unwrap();
}

#[test]
fn writes_land_in_the_top_layer_only() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let base_data = pattern(GRAIN as usize, 2);
    two_layer_chain(dir.path(), 0, &base_data);
    let base_before = fs::read(dir.path().join("base.vmdk")).unwrap();

    let chain = LayerChain::resolve(dir.path().join("child.vmdk"), ChainOptions::default())
        .unwrap();
    let mut disk = chain.open_content().unwrap();
    disk.write_at(100, b"child bytes").unwrap();

    let mut expected = base_data.clone();
    expected[100..111].copy_from_slice(b"child bytes");
    let mut buf = vec![0u8; GRAIN as usize];
    disk.read_at(0, &mut buf).unwrap();
    assert_eq!(buf, expected);
    disk.close().unwrap();
    drop(disk);

    assert_eq!(fs::read(dir.path().join("base.vmdk")).unwrap(), base_before);

    // The base alone still shows the old content.
    let backend = StdFileBackend::open_read_only(dir.path().join("base.vmdk")).unwrap();
    let mut base = HostedExtent::open(backend, &OpenOptions::read_only(), None).unwrap();
    base.read_at(0, &mut buf).unwrap();
    assert_eq!(buf, base_data);
}

#[test]
fn read_only_chain_rejects_writes() {
    let dir = tempfile::tempdir().unwrap();
    two_layer_chain(dir.path(), 0, b"base");

    let chain = LayerChain::resolve(dir.path().join("child.vmdk"), ChainOptions::read_only())
        .unwrap();
    let mut disk = chain.open_content().unwrap();
    assert!(matches!(
        disk.write_at(0, b"x").unwrap_err(),
        DiskError::ReadOnly
    ));
}

#[test]
fn extents_of_a_chain_are_the_union_of_both_layers() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    // Base holds grains 1 and 2.
    two_layer_chain(dir.path(), GRAIN + 5, &pattern(GRAIN as usize, 3));

    let chain = LayerChain::resolve(dir.path().join("child.vmdk"), ChainOptions::default())
        .unwrap();
    let mut disk = chain.open_content().unwrap();
    // Child holds grains 2 (overlapping the base), 3 and 9.
    disk.write_at(2 * GRAIN + 7, &pattern((GRAIN + 1) as usize, 4)).unwrap();
    disk.write_at(9 * GRAIN, b"far").unwrap();

    let mut expected = ExtentSet::new();
    expected.insert(GRAIN, 2 * GRAIN);
    expected.insert(2 * GRAIN, 2 * GRAIN);
    expected.insert(9 * GRAIN, GRAIN);
    assert_eq!(disk.extents_in_range(0, MIB).unwrap(), expected.into_vec());
    assert_eq!(
        disk.extents_in_range(0, MIB).unwrap(),
        vec![
            StreamExtent::new(GRAIN, 3 * GRAIN),
            StreamExtent::new(9 * GRAIN, GRAIN)
        ]
    );

    // Every non-zero byte lies inside a reported extent.
    let mut all = vec![0u8; MIB as usize];
    disk.read_at(0, &mut all).unwrap();
    let reported = disk.extents_in_range(0, MIB).unwrap();
    for (i, b) in all.iter().enumerate() {
        if *b != 0 {
            let i = i as u64;
            assert!(reported.iter().any(|e| e.start <= i && i < e.end()), "byte {i}");
        }
    }

    assert_eq!(
        disk.extents_in_range(2 * GRAIN - 1, 2).unwrap(),
        vec![StreamExtent::new(2 * GRAIN - 1, 2)]
    );
}

#[test]
fn missing_parent_lists_the_candidates() {
    let dir = tempfile::tempdir().unwrap();
    two_layer_chain(dir.path(), 0, b"base");
    fs::remove_file(dir.path().join("base.vmdk")).unwrap();

    match LayerChain::resolve(dir.path().join("child.vmdk"), ChainOptions::default()) {
        Err(DiskError::MissingParent { child, candidates }) => {
            assert_eq!(child, dir.path().join("child.vmdk"));
            assert_eq!(candidates, vec![dir.path().join("base.vmdk")]);
        }
        other => panic!("expected MissingParent, got {other:?}"),
    }
}

#[test]
fn content_id_mismatch_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let mut base = create_hosted(&dir.path().join("base.vmdk"), MIB, &base_descriptor(MIB));
    base.close().unwrap();
    let mut child = create_hosted(
        &dir.path().join("child.vmdk"),
        MIB,
        &child_descriptor(MIB, 0xdead_beef, "base.vmdk"),
    );
    child.close().unwrap();

    let path = dir.path().join("child.vmdk");
    match LayerChain::resolve(&path, ChainOptions::default()) {
        Err(DiskError::ParentMismatch { expected, actual }) => {
            assert_eq!(expected, 0xdead_beef);
            assert_eq!(actual, BASE_CID);
        }
        other => panic!("expected ParentMismatch, got {other:?}"),
    }

    let relaxed = ChainOptions::default().with_content_id_check(false);
    let chain = LayerChain::resolve(&path, relaxed).unwrap();
    assert_eq!(chain.layers().len(), 2);
}

#[test]
fn parent_hint_with_foreign_separators_falls_back_to_bare_name() {
    let dir = tempfile::tempdir().unwrap();
    let mut base = create_hosted(&dir.path().join("base.vmdk"), MIB, &base_descriptor(MIB));
    base.close().unwrap();
    let mut child = create_hosted(
        &dir.path().join("child.vmdk"),
        MIB,
        &child_descriptor(MIB, BASE_CID, "C:\\VMs\\old\\base.vmdk"),
    );
    child.close().unwrap();

    let chain = LayerChain::resolve(dir.path().join("child.vmdk"), ChainOptions::default())
        .unwrap();
    assert_eq!(chain.base().path(), dir.path().join("base.vmdk"));
}

#[test]
fn multi_extent_child_reads_parent_through_windows() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let base_data = pattern((2 * MIB) as usize, 5);
    let mut base = create_hosted(&dir.path().join("base.vmdk"), 2 * MIB, &base_descriptor(2 * MIB));
    base.write_at(0, &base_data).unwrap();
    base.close().unwrap();

    // Two bare hosted extents, named by a standalone descriptor.
    for name in ["child-s001.vmdk", "child-s002.vmdk"] {
        let config = HostedConfig::new(MIB).with_gtes_per_gt(16);
        let mut extent =
            HostedExtent::create(StdFileBackend::create(dir.path().join(name)).unwrap(), &config, None)
                .unwrap();
        extent.close().unwrap();
    }
    let descriptor = Descriptor::new("twoGbMaxExtentSparse", CHILD_CID)
        .with_parent(BASE_CID, "base.vmdk")
        .with_extent(ExtentRecord::new(ExtentKind::Sparse, MIB / 512, Some("child-s001.vmdk")))
        .with_extent(ExtentRecord::new(ExtentKind::Sparse, MIB / 512, Some("child-s002.vmdk")));
    fs::write(dir.path().join("child.vmdk"), descriptor.to_text()).unwrap();

    let chain = LayerChain::resolve(dir.path().join("child.vmdk"), ChainOptions::default())
        .unwrap();
    assert_eq!(chain.top().source(), DescriptorSource::File);
    let mut disk = chain.open_content().unwrap();
    assert_eq!(disk.capacity_bytes(), 2 * MIB);

    let mut all = vec![0u8; (2 * MIB) as usize];
    disk.read_at(0, &mut all).unwrap();
    assert_eq!(all, base_data);

    // Straddles the extent boundary; the second extent must copy the base from 1 MiB onwards.
    disk.write_at(MIB - 4, b"boundary").unwrap();
    let mut expected = base_data.clone();
    expected[(MIB - 4) as usize..(MIB + 4) as usize].copy_from_slice(b"boundary");
    disk.read_at(0, &mut all).unwrap();
    assert_eq!(all, expected);
    disk.close().unwrap();
    drop(disk);

    // The second extent holds one grain starting at its own offset 0.
    let backend = StdFileBackend::open_read_only(dir.path().join("child-s002.vmdk")).unwrap();
    let mut second = HostedExtent::open(backend, &OpenOptions::read_only(), None).unwrap();
    assert_eq!(second.own_extents(0, MIB).unwrap(), vec![StreamExtent::new(0, GRAIN)]);
    let mut grain = vec![0u8; GRAIN as usize];
    second.read_at(0, &mut grain).unwrap();
    assert_eq!(&grain[..4], b"dary");
    assert_eq!(&grain[4..], &base_data[(MIB + 4) as usize..(MIB + GRAIN) as usize]);
}

#[test]
fn declared_size_must_match_extent_capacity() {
    let dir = tempfile::tempdir().unwrap();
    let config = HostedConfig::new(MIB).with_gtes_per_gt(16);
    let mut extent =
        HostedExtent::create(StdFileBackend::create(dir.path().join("data.vmdk")).unwrap(), &config, None)
            .unwrap();
    extent.close().unwrap();

    let descriptor = Descriptor::new("monolithicSparse", BASE_CID)
        .with_extent(ExtentRecord::new(ExtentKind::Sparse, 4096, Some("data.vmdk")));
    fs::write(dir.path().join("disk.vmdk"), descriptor.to_text()).unwrap();

    let chain = LayerChain::resolve(
        dir.path().join("disk.vmdk"),
        ChainOptions::default().with_access(Access::ReadOnly),
    )
    .unwrap();
    assert!(matches!(
        chain.open_content().err().unwrap(),
        DiskError::UnsupportedFeature(_)
    ));
}
