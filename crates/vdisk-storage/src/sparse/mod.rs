//! Two-level sparse extents: grain directory → grain table → grain.
//!
//! Both on-disk variants share one indirection walk ([`SparseExtent`]); what differs between them
//! (where tables live, how grains are reserved, whether writes are allowed at all) is supplied by
//! a [`GrainDirectory`] implementation:
//!
//! - [`HostedDirectory`]: desktop layout with a redundant directory and optional compression
//! - [`ServerDirectory`]: server layout with lazily allocated tables and batched grain allocation

mod cache;
mod compression;
mod extent;
mod hosted;
mod server;

pub use cache::GrainTableCache;
pub use compression::{
    encode_compressed_grain, inflate_grain, inflate_grain_range, validate_zlib_header,
    CompressedGrainHeader, COMPRESSED_GRAIN_HEADER_SIZE,
};
pub use extent::SparseExtent;
pub use hosted::{
    CompressionAlgorithm, HostedConfig, HostedDirectory, HostedExtent, HostedFlags, HostedHeader,
    HOSTED_HEADER_SIZE,
};
pub use server::{
    ServerConfig, ServerDirectory, ServerExtent, ServerHeader, SERVER_GTES_PER_GT,
    SERVER_HEADER_SIZE,
};

use crate::util::div_ceil_u64;
use crate::{Access, DiskError, Result, StorageBackend, SECTOR_SIZE};

// Hard caps to avoid absurd allocations from untrusted headers.
const MAX_GRAIN_SECTORS: u64 = 8192; // 4 MiB grains
const MAX_GTES_PER_GT: u32 = 64 * 1024;
const MAX_GD_ENTRIES: u64 = 16 * 1024 * 1024;

/// Which grain directory a hosted extent resolves tables through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirectoryChoice {
    /// Use the primary directory and cross-check every table against its redundant copy.
    #[default]
    Primary,
    /// Recover through the redundant directory, ignoring the primary one. The extent is
    /// read-only in this mode.
    Redundant,
}

/// Options applied when opening a sparse extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOptions {
    pub access: Access,
    pub directory: DirectoryChoice,
    /// Number of decompressed grains kept per extent. Zero disables the cache; every read of a
    /// compressed grain then inflates the stream up to the requested offset.
    pub compressed_grain_cache: usize,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            access: Access::ReadWrite,
            directory: DirectoryChoice::Primary,
            compressed_grain_cache: 8,
        }
    }
}

impl OpenOptions {
    pub fn read_only() -> Self {
        Self {
            access: Access::ReadOnly,
            ..Self::default()
        }
    }

    pub fn with_access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    pub fn with_directory(mut self, directory: DirectoryChoice) -> Self {
        self.directory = directory;
        self
    }
}

/// Indirection geometry derived from a variant header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub capacity_sectors: u64,
    pub grain_sectors: u64,
    pub gtes_per_gt: u32,
    pub gd_entries: u32,
}

/// Position of a logical byte inside the indirection structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrainAddress {
    pub table: u32,
    pub grain: u32,
    pub within: u64,
}

impl Geometry {
    pub fn new(capacity_sectors: u64, grain_sectors: u64, gtes_per_gt: u32) -> Result<Self> {
        if grain_sectors == 0 || grain_sectors > MAX_GRAIN_SECTORS {
            return Err(DiskError::MalformedHeader("grain size out of range"));
        }
        if gtes_per_gt == 0 || gtes_per_gt > MAX_GTES_PER_GT {
            return Err(DiskError::MalformedHeader("grain table size out of range"));
        }
        let sectors_per_table = grain_sectors
            .checked_mul(u64::from(gtes_per_gt))
            .ok_or(DiskError::OffsetOverflow)?;
        let gd_entries = div_ceil_u64(capacity_sectors, sectors_per_table)?;
        if gd_entries > MAX_GD_ENTRIES {
            return Err(DiskError::UnsupportedFeature("grain directory too large"));
        }
        capacity_sectors
            .checked_mul(SECTOR_SIZE as u64)
            .ok_or(DiskError::OffsetOverflow)?;
        Ok(Self {
            capacity_sectors,
            grain_sectors,
            gtes_per_gt,
            gd_entries: gd_entries as u32,
        })
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_sectors * SECTOR_SIZE as u64
    }

    pub fn grain_bytes(&self) -> u64 {
        self.grain_sectors * SECTOR_SIZE as u64
    }

    /// Logical bytes covered by one grain table.
    pub fn table_coverage(&self) -> u64 {
        self.grain_bytes() * u64::from(self.gtes_per_gt)
    }

    /// On-disk size of one grain table, in bytes (unpadded).
    pub fn table_bytes(&self) -> usize {
        self.gtes_per_gt as usize * 4
    }

    /// On-disk size of one grain table, padded to whole sectors.
    pub fn table_sectors(&self) -> u64 {
        (self.table_bytes() as u64).div_ceil(SECTOR_SIZE as u64)
    }

    /// On-disk size of the grain directory, padded to whole sectors.
    pub fn directory_sectors(&self) -> u64 {
        (u64::from(self.gd_entries) * 4).div_ceil(SECTOR_SIZE as u64)
    }

    pub fn locate(&self, offset: u64) -> GrainAddress {
        let coverage = self.table_coverage();
        let within_table = offset % coverage;
        GrainAddress {
            table: (offset / coverage) as u32,
            grain: (within_table / self.grain_bytes()) as u32,
            within: within_table % self.grain_bytes(),
        }
    }

    /// Logical byte offset of the first byte of `grain` in `table`.
    pub fn grain_offset(&self, table: u32, grain: u32) -> u64 {
        (u64::from(grain) + u64::from(self.gtes_per_gt) * u64::from(table)) * self.grain_bytes()
    }
}

/// One loaded grain table: `gtes_per_gt` sector pointers, zero meaning "not present here".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrainTable {
    entries: Vec<u32>,
}

impl GrainTable {
    pub fn empty(entries: u32) -> Self {
        Self {
            entries: vec![0; entries as usize],
        }
    }

    pub fn from_bytes(raw: &[u8]) -> Self {
        Self {
            entries: raw
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        }
    }

    pub fn entries(&self) -> &[u32] {
        &self.entries
    }

    pub fn get(&self, grain: u32) -> u32 {
        self.entries.get(grain as usize).copied().unwrap_or(0)
    }

    pub fn set_run(&mut self, first: u32, values: &[u32]) {
        let first = first as usize;
        self.entries[first..first + values.len()].copy_from_slice(values);
    }
}

pub(crate) fn encode_entries(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub(crate) fn decode_entries(raw: &[u8]) -> Vec<u32> {
    GrainTable::from_bytes(raw).entries
}

/// The variant-specific half of a sparse extent.
///
/// [`SparseExtent`] owns the walk over directory → table → grain; implementations own the
/// directory itself and decide where new tables and grains go.
pub trait GrainDirectory {
    fn geometry(&self) -> &Geometry;

    /// First sector that may hold grain data; pointers below it are corrupt.
    fn data_start_sector(&self) -> u64;

    /// Why the format forbids writes, if it does.
    fn immutable_reason(&self) -> Option<&'static str>;

    fn compressed_grains(&self) -> bool;

    /// Load table `table` from disk, or `None` if the directory has no table for it.
    fn load_table<B: StorageBackend>(
        &mut self,
        backend: &mut B,
        table: u32,
    ) -> Result<Option<GrainTable>>;

    /// Create a zeroed table for `table` and record it in the directory.
    fn allocate_table<B: StorageBackend>(
        &mut self,
        backend: &mut B,
        table: u32,
    ) -> Result<GrainTable>;

    /// How many of `wanted` contiguous unallocated grains one allocation may cover (≥ 1).
    fn allocation_batch(&self, wanted: u32) -> u32;

    /// Reserve room for `count` contiguous grains and return the first sector.
    fn reserve_grains<B: StorageBackend>(&mut self, backend: &mut B, count: u32) -> Result<u64>;

    /// Persist entries `first..first + values.len()` of table `table`.
    fn store_entries<B: StorageBackend>(
        &mut self,
        backend: &mut B,
        table: u32,
        first: u32,
        values: &[u32],
    ) -> Result<()>;
}

pub(crate) fn read_metadata<B: StorageBackend>(
    backend: &mut B,
    offset: u64,
    buf: &mut [u8],
    ctx: &'static str,
) -> Result<()> {
    match backend.read_at(offset, buf) {
        Ok(()) => Ok(()),
        Err(DiskError::OutOfBounds { .. }) => Err(DiskError::CorruptIndirection(ctx)),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_length_rounds_up() {
        // 1 MiB, 64 KiB grains, 512 entries per table: one table covers 32 MiB.
        let g = Geometry::new(2048, 128, 512).unwrap();
        assert_eq!(g.gd_entries, 1);
        assert_eq!(g.table_sectors(), 4);
        assert_eq!(g.directory_sectors(), 1);

        let g = Geometry::new(4096 * 8 + 1, 8, 4096).unwrap();
        assert_eq!(g.gd_entries, 2);
    }

    #[test]
    fn locate_splits_offsets() {
        let g = Geometry::new(1 << 20, 8, 16).unwrap();
        // grain = 4 KiB, table coverage = 64 KiB
        let addr = g.locate(65536 + 3 * 4096 + 17);
        assert_eq!(
            addr,
            GrainAddress {
                table: 1,
                grain: 3,
                within: 17
            }
        );
        assert_eq!(g.grain_offset(1, 3), 65536 + 3 * 4096);
    }

    #[test]
    fn rejects_zero_grain_size() {
        assert!(matches!(
            Geometry::new(2048, 0, 512).unwrap_err(),
            DiskError::MalformedHeader(_)
        ));
    }
}
