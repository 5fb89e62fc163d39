use super::{
    decode_entries, encode_entries, read_metadata, Geometry, GrainDirectory, GrainTable,
    OpenOptions, SparseExtent, MAX_GRAIN_SECTORS,
};
use crate::util::{le_u32, sectors_to_bytes, write_zeroes};
use crate::{DiskError, ParentLink, Result, StorageBackend, SECTOR_SIZE};

pub const SERVER_HEADER_SIZE: usize = 2048;
pub const SERVER_GTES_PER_GT: u32 = 4096;

const SERVER_MAGIC: u32 = 0x4457_4f43; // "COWD"
const SERVER_VERSION: u32 = 1;
const SERVER_FLAGS: u32 = 3;
const SERVER_GD_OFFSET: u32 = 4;

const OFF_CAPACITY: usize = 12;
const OFF_GRAIN: usize = 16;
const OFF_GD_OFFSET: usize = 20;
const OFF_GD_ENTRIES: usize = 24;
const OFF_FREE_SECTOR: usize = 28;
const OFF_SAVED_GENERATION: usize = 0x660;
const OFF_UNCLEAN_SHUTDOWN: usize = 0x66c;

/// The 2048-byte header of a server sparse extent.
///
/// The raw bytes are kept so that fields this crate does not interpret survive header rewrites.
#[derive(Clone, PartialEq, Eq)]
pub struct ServerHeader {
    raw: [u8; SERVER_HEADER_SIZE],
}

impl std::fmt::Debug for ServerHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHeader")
            .field("capacity_sectors", &self.capacity_sectors())
            .field("grain_sectors", &self.grain_sectors())
            .field("gd_offset", &self.gd_offset())
            .field("gd_entries", &self.gd_entries())
            .field("free_sector", &self.free_sector())
            .finish_non_exhaustive()
    }
}

impl ServerHeader {
    pub fn parse(raw: [u8; SERVER_HEADER_SIZE]) -> Result<Self> {
        let header = Self { raw };
        if le_u32(&raw[0..4]) != SERVER_MAGIC {
            return Err(DiskError::MalformedHeader("server extent magic mismatch"));
        }
        if le_u32(&raw[4..8]) != SERVER_VERSION {
            return Err(DiskError::UnsupportedFeature(
                "unsupported server extent version",
            ));
        }
        if header.grain_sectors() == 0 || u64::from(header.grain_sectors()) > MAX_GRAIN_SECTORS {
            return Err(DiskError::MalformedHeader("server grain size invalid"));
        }
        if header.gd_offset() < SERVER_GD_OFFSET {
            return Err(DiskError::MalformedHeader(
                "server grain directory overlaps header",
            ));
        }
        Ok(header)
    }

    fn new(capacity_sectors: u32, grain_sectors: u32, gd_entries: u32, free_sector: u32) -> Self {
        let mut raw = [0u8; SERVER_HEADER_SIZE];
        raw[0..4].copy_from_slice(&SERVER_MAGIC.to_le_bytes());
        raw[4..8].copy_from_slice(&SERVER_VERSION.to_le_bytes());
        raw[8..12].copy_from_slice(&SERVER_FLAGS.to_le_bytes());
        let mut header = Self { raw };
        header.put(OFF_CAPACITY, capacity_sectors);
        header.put(OFF_GRAIN, grain_sectors);
        header.put(OFF_GD_OFFSET, SERVER_GD_OFFSET);
        header.put(OFF_GD_ENTRIES, gd_entries);
        header.put(OFF_FREE_SECTOR, free_sector);
        header
    }

    pub fn read_from<B: StorageBackend>(backend: &mut B) -> Result<Self> {
        let mut raw = [0u8; SERVER_HEADER_SIZE];
        match backend.read_at(0, &mut raw) {
            Ok(()) => {}
            Err(DiskError::OutOfBounds { .. }) => {
                return Err(DiskError::MalformedHeader("server header truncated"));
            }
            Err(e) => return Err(e),
        }
        Self::parse(raw)
    }

    fn get(&self, offset: usize) -> u32 {
        le_u32(&self.raw[offset..offset + 4])
    }

    fn put(&mut self, offset: usize, value: u32) {
        self.raw[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn as_bytes(&self) -> &[u8; SERVER_HEADER_SIZE] {
        &self.raw
    }

    pub fn capacity_sectors(&self) -> u32 {
        self.get(OFF_CAPACITY)
    }

    pub fn grain_sectors(&self) -> u32 {
        self.get(OFF_GRAIN)
    }

    pub fn gd_offset(&self) -> u32 {
        self.get(OFF_GD_OFFSET)
    }

    pub fn gd_entries(&self) -> u32 {
        self.get(OFF_GD_ENTRIES)
    }

    pub fn free_sector(&self) -> u32 {
        self.get(OFF_FREE_SECTOR)
    }

    pub fn saved_generation(&self) -> u32 {
        self.get(OFF_SAVED_GENERATION)
    }

    pub fn unclean_shutdown(&self) -> bool {
        self.get(OFF_UNCLEAN_SHUTDOWN) != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerConfig {
    pub capacity_bytes: u64,
    pub grain_size_sectors: u32,
}

impl ServerConfig {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            capacity_bytes,
            grain_size_sectors: 64,
        }
    }

    pub fn with_grain_size_sectors(mut self, sectors: u32) -> Self {
        self.grain_size_sectors = sectors;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity_bytes == 0 || self.capacity_bytes % SECTOR_SIZE as u64 != 0 {
            return Err(DiskError::InvalidConfig(
                "capacity must be a non-zero multiple of 512",
            ));
        }
        if self.capacity_bytes / SECTOR_SIZE as u64 > u64::from(u32::MAX) {
            return Err(DiskError::InvalidConfig(
                "server extents address at most 2^32 sectors",
            ));
        }
        if self.grain_size_sectors == 0 || u64::from(self.grain_size_sectors) > MAX_GRAIN_SECTORS {
            return Err(DiskError::InvalidConfig("grain size out of range"));
        }
        Ok(())
    }
}

/// Grain directory of a server extent plus its free-sector cursor.
#[derive(Debug, Clone)]
pub struct ServerDirectory {
    header: ServerHeader,
    geometry: Geometry,
    entries: Vec<u32>,
}

impl ServerDirectory {
    pub fn open<B: StorageBackend>(backend: &mut B) -> Result<Self> {
        let header = ServerHeader::read_from(backend)?;
        let geometry = Geometry::new(
            u64::from(header.capacity_sectors()),
            u64::from(header.grain_sectors()),
            SERVER_GTES_PER_GT,
        )?;
        if header.gd_entries() < geometry.gd_entries {
            return Err(DiskError::MalformedHeader(
                "server grain directory too short for capacity",
            ));
        }

        let mut raw = vec![0u8; geometry.gd_entries as usize * 4];
        read_metadata(
            backend,
            sectors_to_bytes(u64::from(header.gd_offset()))?,
            &mut raw,
            "grain directory beyond end of extent file",
        )?;
        let directory = Self {
            header,
            geometry,
            entries: decode_entries(&raw),
        };
        if u64::from(directory.header.free_sector()) < directory.data_start_sector() {
            return Err(DiskError::MalformedHeader(
                "server free sector inside grain directory",
            ));
        }
        Ok(directory)
    }

    pub fn header(&self) -> &ServerHeader {
        &self.header
    }

    pub fn entries(&self) -> &[u32] {
        &self.entries
    }

    fn directory_sectors(&self) -> u64 {
        (u64::from(self.header.gd_entries()) * 4).div_ceil(SECTOR_SIZE as u64)
    }

    fn persist_header<B: StorageBackend>(&self, backend: &mut B) -> Result<()> {
        backend.write_at(0, self.header.as_bytes())
    }

    /// Advance the free-sector cursor by `sectors` and return its previous value.
    fn take_free(&mut self, sectors: u64) -> Result<u64> {
        let start = self.header.free_sector();
        let next = u64::from(start)
            .checked_add(sectors)
            .and_then(|n| u32::try_from(n).ok())
            .ok_or(DiskError::UnsupportedFeature(
                "server extent exceeds 2^32 sectors",
            ))?;
        self.header.put(OFF_FREE_SECTOR, next);
        Ok(u64::from(start))
    }
}

impl GrainDirectory for ServerDirectory {
    fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    fn data_start_sector(&self) -> u64 {
        u64::from(self.header.gd_offset()) + self.directory_sectors()
    }

    fn immutable_reason(&self) -> Option<&'static str> {
        None
    }

    fn compressed_grains(&self) -> bool {
        false
    }

    fn load_table<B: StorageBackend>(
        &mut self,
        backend: &mut B,
        table: u32,
    ) -> Result<Option<GrainTable>> {
        let sector = self
            .entries
            .get(table as usize)
            .copied()
            .ok_or(DiskError::CorruptIndirection(
                "grain table index beyond grain directory",
            ))?;
        if sector == 0 {
            return Ok(None);
        }
        if u64::from(sector) < self.data_start_sector() {
            return Err(DiskError::CorruptIndirection(
                "grain table overlaps grain directory",
            ));
        }
        let mut raw = vec![0u8; self.geometry.table_bytes()];
        read_metadata(
            backend,
            sectors_to_bytes(u64::from(sector))?,
            &mut raw,
            "grain table beyond end of extent file",
        )?;
        Ok(Some(GrainTable::from_bytes(&raw)))
    }

    fn allocate_table<B: StorageBackend>(
        &mut self,
        backend: &mut B,
        table: u32,
    ) -> Result<GrainTable> {
        let table_sectors = self.geometry.table_sectors();
        let sector = self.take_free(table_sectors)?;
        write_zeroes(backend, sectors_to_bytes(sector)?, table_sectors * SECTOR_SIZE as u64)?;

        // `take_free` proved the sector fits in 32 bits.
        let pointer = sector as u32;
        self.entries[table as usize] = pointer;
        let gd_at = sectors_to_bytes(u64::from(self.header.gd_offset()))? + u64::from(table) * 4;
        backend.write_at(gd_at, &pointer.to_le_bytes())?;
        self.persist_header(backend)?;
        Ok(GrainTable::empty(self.geometry.gtes_per_gt))
    }

    fn allocation_batch(&self, wanted: u32) -> u32 {
        wanted
    }

    fn reserve_grains<B: StorageBackend>(&mut self, backend: &mut B, count: u32) -> Result<u64> {
        let start = self.take_free(u64::from(count) * self.geometry.grain_sectors)?;
        self.persist_header(backend)?;
        Ok(start)
    }

    fn store_entries<B: StorageBackend>(
        &mut self,
        backend: &mut B,
        table: u32,
        first: u32,
        values: &[u32],
    ) -> Result<()> {
        let sector = self.entries[table as usize];
        let at = sectors_to_bytes(u64::from(sector))? + u64::from(first) * 4;
        backend.write_at(at, &encode_entries(values))
    }
}

/// A server sparse extent.
pub type ServerExtent<B> = SparseExtent<B, ServerDirectory>;

impl<B: StorageBackend> SparseExtent<B, ServerDirectory> {
    /// Write a header and an empty grain directory to `backend`, replacing its contents.
    pub fn create(mut backend: B, config: &ServerConfig, parent: Option<ParentLink>) -> Result<Self> {
        config.validate()?;
        let capacity_sectors = (config.capacity_bytes / SECTOR_SIZE as u64) as u32;
        let geometry = Geometry::new(
            u64::from(capacity_sectors),
            u64::from(config.grain_size_sectors),
            SERVER_GTES_PER_GT,
        )?;
        let free_sector = u64::from(SERVER_GD_OFFSET) + geometry.directory_sectors();
        let header = ServerHeader::new(
            capacity_sectors,
            config.grain_size_sectors,
            geometry.gd_entries,
            free_sector as u32,
        );

        backend.set_len(0)?;
        backend.set_len(sectors_to_bytes(free_sector)?)?;
        backend.write_at(0, header.as_bytes())?;
        backend.flush()?;

        tracing::debug!(
            capacity = config.capacity_bytes,
            grain_sectors = config.grain_size_sectors,
            "created server sparse extent"
        );

        let directory = ServerDirectory {
            header,
            geometry,
            entries: vec![0; geometry.gd_entries as usize],
        };
        Ok(Self::from_parts(backend, directory, &OpenOptions::default(), parent))
    }

    pub fn open(mut backend: B, options: &OpenOptions, parent: Option<ParentLink>) -> Result<Self> {
        let directory = ServerDirectory::open(&mut backend)?;
        tracing::debug!(header = ?directory.header, "opened server sparse extent");
        Ok(Self::from_parts(backend, directory, options, parent))
    }

    pub fn header(&self) -> &ServerHeader {
        self.directory().header()
    }
}
