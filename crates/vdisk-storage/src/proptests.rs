use crate::sparse::{HostedConfig, ServerConfig};
use crate::{
    Access, ExtentSet, FlatDisk, HostedExtent, MemBackend, OpenOptions, ParentLink, ServerExtent,
    VirtualDisk, SECTOR_SIZE,
};
use proptest::prelude::*;
use proptest::test_runner::TestCaseResult;

#[derive(Debug, Clone)]
enum Op {
    Write { offset: u32, data: Vec<u8> },
    Read { offset: u32, len: usize },
    Flush,
    Reopen,
}

const MAX_DISK_SIZE: u32 = 1024 * 1024; // 1 MiB
const MAX_OPS: usize = 48;
const MAX_RW_LEN: usize = 24 * 1024;

const SECTOR_SIZE_U32: u32 = SECTOR_SIZE as u32;
const MAX_DISK_SECTORS: u32 = MAX_DISK_SIZE / SECTOR_SIZE_U32;

fn disk_size_strategy() -> impl Strategy<Value = u32> {
    (1u32..=MAX_DISK_SECTORS).prop_map(|sectors| sectors * SECTOR_SIZE_U32)
}

fn hosted_grain_strategy() -> impl Strategy<Value = u64> {
    prop_oneof![Just(8u64), Just(16u64), Just(128u64)]
}

fn hosted_table_strategy() -> impl Strategy<Value = u32> {
    // Small tables make requests cross table boundaries.
    prop_oneof![Just(4u32), Just(16u32), Just(512u32)]
}

fn server_grain_strategy() -> impl Strategy<Value = u32> {
    prop_oneof![Just(1u32), Just(2u32), Just(8u32), Just(64u32)]
}

fn offset_strategy(disk_size: u32) -> BoxedStrategy<u32> {
    let max_offset = disk_size;

    let any = 0u32..=max_offset;
    let sector_aligned =
        (0u32..=max_offset / SECTOR_SIZE_U32).prop_map(|lba| lba * SECTOR_SIZE_U32);
    let grain_boundary_minus_delta = (0u32..=max_offset / 4096, 1u32..SECTOR_SIZE_U32)
        .prop_map(move |(grain, delta)| (grain * 4096).saturating_sub(delta).min(max_offset));
    let near_end =
        (0u32..=SECTOR_SIZE_U32).prop_map(move |delta| max_offset.saturating_sub(delta));

    prop_oneof![
        4 => any,
        2 => sector_aligned,
        2 => grain_boundary_minus_delta,
        1 => near_end,
    ]
    .boxed()
}

fn write_op_strategy(disk_size: u32) -> BoxedStrategy<Op> {
    offset_strategy(disk_size)
        .prop_flat_map(move |offset| {
            let remaining = disk_size - offset;
            let max_len = (remaining as usize).min(MAX_RW_LEN);
            (Just(offset), prop::collection::vec(any::<u8>(), 0..=max_len))
        })
        .prop_map(|(offset, data)| Op::Write { offset, data })
        .boxed()
}

fn read_op_strategy(disk_size: u32) -> BoxedStrategy<Op> {
    offset_strategy(disk_size)
        .prop_flat_map(move |offset| {
            let remaining = disk_size - offset;
            let max_len = (remaining as usize).min(MAX_RW_LEN);
            (Just(offset), 0usize..=max_len)
        })
        .prop_map(|(offset, len)| Op::Read { offset, len })
        .boxed()
}

fn op_strategy(disk_size: u32) -> BoxedStrategy<Op> {
    prop_oneof![
        5 => write_op_strategy(disk_size),
        4 => read_op_strategy(disk_size),
        1 => Just(Op::Flush),
        1 => Just(Op::Reopen),
    ]
    .boxed()
}

fn ops_strategy(disk_size: u32) -> BoxedStrategy<Vec<Op>> {
    prop::collection::vec(op_strategy(disk_size), 1..=MAX_OPS).boxed()
}

fn hosted_scenario_strategy() -> BoxedStrategy<(u32, u64, u32, Vec<Op>)> {
    (disk_size_strategy(), hosted_grain_strategy(), hosted_table_strategy())
        .prop_flat_map(|(disk_size, grain, table)| {
            (Just(disk_size), Just(grain), Just(table), ops_strategy(disk_size))
        })
        .boxed()
}

fn server_scenario_strategy() -> BoxedStrategy<(u32, u32, Vec<Op>)> {
    (disk_size_strategy(), server_grain_strategy())
        .prop_flat_map(|(disk_size, grain)| (Just(disk_size), Just(grain), ops_strategy(disk_size)))
        .boxed()
}

fn chain_scenario_strategy() -> BoxedStrategy<(u32, u64, u8, Vec<Op>)> {
    (disk_size_strategy(), hosted_grain_strategy(), any::<u8>())
        .prop_flat_map(|(disk_size, grain, seed)| {
            (Just(disk_size), Just(grain), Just(seed), ops_strategy(disk_size))
        })
        .boxed()
}

/// Apply `ops` to `disk` and a flat byte model side by side.
///
/// Besides content, every written byte must be reported by `extents_in_range`.
fn run_ops<D, Reopen>(
    mut disk: D,
    mut model: Vec<u8>,
    ops: &[Op],
    mut reopen: Reopen,
) -> TestCaseResult
where
    D: VirtualDisk,
    Reopen: FnMut(D) -> D,
{
    let capacity = disk.capacity_bytes() as usize;
    prop_assert_eq!(capacity, model.len());
    let mut written = ExtentSet::new();

    for op in ops {
        match op {
            Op::Write { offset, data } => {
                let offset = *offset as usize;
                disk.write_at(offset as u64, data).unwrap();
                model[offset..offset + data.len()].copy_from_slice(data);
                written.insert(offset as u64, data.len() as u64);

                let mut read_back = vec![0xA5u8; data.len()];
                disk.read_at(offset as u64, &mut read_back).unwrap();
                prop_assert_eq!(read_back.as_slice(), data.as_slice());
            }
            Op::Read { offset, len } => {
                let offset = *offset as usize;
                let len = *len;
                let mut buf = vec![0xA5u8; len];
                disk.read_at(offset as u64, &mut buf).unwrap();
                prop_assert_eq!(buf.as_slice(), &model[offset..offset + len]);
            }
            Op::Flush => {
                disk.flush().unwrap();
            }
            Op::Reopen => {
                disk.flush().unwrap();
                disk = reopen(disk);
                prop_assert_eq!(disk.capacity_bytes() as usize, capacity);
            }
        }
    }

    disk.flush().unwrap();
    disk = reopen(disk);
    prop_assert_eq!(disk.capacity_bytes() as usize, capacity);

    let mut all = vec![0u8; capacity];
    disk.read_at(0, &mut all).unwrap();
    prop_assert_eq!(all.as_slice(), model.as_slice());

    let mut reported = ExtentSet::new();
    reported.extend(disk.extents_in_range(0, capacity as u64).unwrap());
    for extent in written.extents() {
        prop_assert_eq!(
            reported.clipped(extent.start, extent.length).iter().map(|e| e.length).sum::<u64>(),
            extent.length
        );
    }

    Ok(())
}

fn make_base_pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed as u32) as u8)
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_hosted_extent_matches_reference((disk_size, grain, table, ops) in hosted_scenario_strategy()) {
        let config = HostedConfig::new(u64::from(disk_size))
            .with_grain_size_sectors(grain)
            .with_gtes_per_gt(table);
        let disk = HostedExtent::create(MemBackend::new(), &config, None).unwrap();
        let model = vec![0u8; disk_size as usize];

        run_ops(disk, model, &ops, |disk| {
            let mut reopened =
                HostedExtent::open(disk.into_backend(), &OpenOptions::default(), None).unwrap();
            reopened.verify_redundancy().unwrap();
            reopened
        })?;
    }

    #[test]
    fn prop_server_extent_matches_reference((disk_size, grain, ops) in server_scenario_strategy()) {
        let config = ServerConfig::new(u64::from(disk_size)).with_grain_size_sectors(grain);
        let disk = ServerExtent::create(MemBackend::new(), &config, None).unwrap();
        let model = vec![0u8; disk_size as usize];

        run_ops(disk, model, &ops, |disk| {
            ServerExtent::open(disk.into_backend(), &OpenOptions::default(), None).unwrap()
        })?;
    }

    #[test]
    fn prop_differencing_extent_matches_reference((disk_size, grain, seed, ops) in chain_scenario_strategy()) {
        let model = make_base_pattern(disk_size as usize, seed);
        let mut base = FlatDisk::create(MemBackend::new(), u64::from(disk_size)).unwrap();
        base.write_at(0, &model).unwrap();

        let config = HostedConfig::new(u64::from(disk_size))
            .with_grain_size_sectors(grain)
            .with_gtes_per_gt(16);
        let disk =
            HostedExtent::create(MemBackend::new(), &config, Some(ParentLink::owned(base))).unwrap();

        run_ops(disk, model, &ops, |disk| {
            let (backend, parent) = disk.into_parts();
            let options = OpenOptions::default().with_access(Access::ReadWrite);
            HostedExtent::open(backend, &options, parent).unwrap()
        })?;
    }
}
