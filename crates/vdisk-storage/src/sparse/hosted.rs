use bitflags::bitflags;

use super::{
    decode_entries, encode_entries, read_metadata, DirectoryChoice, Geometry, GrainDirectory,
    GrainTable, OpenOptions, SparseExtent, MAX_GRAIN_SECTORS, MAX_GTES_PER_GT,
};
use crate::util::{align_up_u64, le_u16, le_u32, le_u64, sectors_to_bytes, write_zeroes};
use crate::{DiskError, ParentLink, Result, StorageBackend, SECTOR_SIZE};

pub const HOSTED_HEADER_SIZE: usize = 512;

const HOSTED_MAGIC: u32 = 0x564d_444b; // "KDMV"
const NEWLINE_TEST: [u8; 4] = [b'\n', b' ', b'\r', b'\n'];
const MIN_GRAIN_SECTORS: u64 = 8;
const MAX_DESCRIPTOR_SECTORS: u64 = 2048;
const DEFAULT_DESCRIPTOR_SECTORS: u64 = 20;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct HostedFlags: u32 {
        const VALID_NEWLINE_TEST = 1 << 0;
        const REDUNDANT_GRAIN_TABLE = 1 << 1;
        const COMPRESSED_GRAINS = 1 << 16;
        const MARKERS = 1 << 17;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionAlgorithm {
    #[default]
    None,
    Deflate,
}

impl CompressionAlgorithm {
    fn from_raw(raw: u16) -> Result<Self> {
        match raw {
            0 => Ok(Self::None),
            1 => Ok(Self::Deflate),
            _ => Err(DiskError::UnsupportedFeature(
                "unknown grain compression algorithm",
            )),
        }
    }

    fn to_raw(self) -> u16 {
        match self {
            Self::None => 0,
            Self::Deflate => 1,
        }
    }
}

/// The 512-byte header at the start of a hosted sparse extent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostedHeader {
    pub version: u32,
    pub flags: HostedFlags,
    pub capacity_sectors: u64,
    pub grain_sectors: u64,
    pub descriptor_offset: u64,
    pub descriptor_sectors: u64,
    pub gtes_per_gt: u32,
    pub rgd_offset: u64,
    pub gd_offset: u64,
    pub overhead_sectors: u64,
    pub unclean_shutdown: bool,
    pub compression: CompressionAlgorithm,
}

impl HostedHeader {
    pub fn parse(raw: &[u8; HOSTED_HEADER_SIZE]) -> Result<Self> {
        if le_u32(&raw[0..4]) != HOSTED_MAGIC {
            return Err(DiskError::MalformedHeader("hosted extent magic mismatch"));
        }
        let version = le_u32(&raw[4..8]);
        if !(1..=3).contains(&version) {
            return Err(DiskError::UnsupportedFeature(
                "unsupported hosted extent version",
            ));
        }
        let flags = HostedFlags::from_bits_retain(le_u32(&raw[8..12]));
        if flags.contains(HostedFlags::VALID_NEWLINE_TEST) && raw[73..77] != NEWLINE_TEST {
            // Typically a text-mode transfer mangled the file.
            return Err(DiskError::MalformedHeader(
                "hosted header newline test failed",
            ));
        }

        let grain_sectors = le_u64(&raw[20..28]);
        if grain_sectors < MIN_GRAIN_SECTORS
            || grain_sectors > MAX_GRAIN_SECTORS
            || !grain_sectors.is_power_of_two()
        {
            return Err(DiskError::MalformedHeader("hosted grain size invalid"));
        }

        let gd_offset = le_u64(&raw[56..64]);
        if gd_offset == u64::MAX {
            return Err(DiskError::UnsupportedFeature(
                "grain directory stored at end of stream",
            ));
        }
        if gd_offset == 0 {
            return Err(DiskError::MalformedHeader("hosted grain directory offset is zero"));
        }

        let rgd_offset = le_u64(&raw[48..56]);
        if flags.contains(HostedFlags::REDUNDANT_GRAIN_TABLE) && rgd_offset == 0 {
            return Err(DiskError::MalformedHeader(
                "redundant grain directory flagged but offset is zero",
            ));
        }

        let compression = CompressionAlgorithm::from_raw(le_u16(&raw[77..79]))?;
        if flags.contains(HostedFlags::COMPRESSED_GRAINS) && compression == CompressionAlgorithm::None
        {
            return Err(DiskError::MalformedHeader(
                "compressed grains flagged without an algorithm",
            ));
        }

        let descriptor_sectors = le_u64(&raw[36..44]);
        if descriptor_sectors > MAX_DESCRIPTOR_SECTORS {
            return Err(DiskError::MalformedHeader("embedded descriptor too large"));
        }

        Ok(Self {
            version,
            flags,
            capacity_sectors: le_u64(&raw[12..20]),
            grain_sectors,
            descriptor_offset: le_u64(&raw[28..36]),
            descriptor_sectors,
            gtes_per_gt: le_u32(&raw[44..48]),
            rgd_offset,
            gd_offset,
            overhead_sectors: le_u64(&raw[64..72]),
            unclean_shutdown: raw[72] != 0,
            compression,
        })
    }

    pub fn to_bytes(&self) -> [u8; HOSTED_HEADER_SIZE] {
        let mut raw = [0u8; HOSTED_HEADER_SIZE];
        raw[0..4].copy_from_slice(&HOSTED_MAGIC.to_le_bytes());
        raw[4..8].copy_from_slice(&self.version.to_le_bytes());
        raw[8..12].copy_from_slice(&self.flags.bits().to_le_bytes());
        raw[12..20].copy_from_slice(&self.capacity_sectors.to_le_bytes());
        raw[20..28].copy_from_slice(&self.grain_sectors.to_le_bytes());
        raw[28..36].copy_from_slice(&self.descriptor_offset.to_le_bytes());
        raw[36..44].copy_from_slice(&self.descriptor_sectors.to_le_bytes());
        raw[44..48].copy_from_slice(&self.gtes_per_gt.to_le_bytes());
        raw[48..56].copy_from_slice(&self.rgd_offset.to_le_bytes());
        raw[56..64].copy_from_slice(&self.gd_offset.to_le_bytes());
        raw[64..72].copy_from_slice(&self.overhead_sectors.to_le_bytes());
        raw[72] = u8::from(self.unclean_shutdown);
        raw[73..77].copy_from_slice(&NEWLINE_TEST);
        raw[77..79].copy_from_slice(&self.compression.to_raw().to_le_bytes());
        raw
    }

    pub fn read_from<B: StorageBackend>(backend: &mut B) -> Result<Self> {
        let mut raw = [0u8; HOSTED_HEADER_SIZE];
        match backend.read_at(0, &mut raw) {
            Ok(()) => {}
            Err(DiskError::OutOfBounds { .. }) => {
                return Err(DiskError::MalformedHeader("hosted header truncated"));
            }
            Err(e) => return Err(e),
        }
        Self::parse(&raw)
    }

    pub fn geometry(&self) -> Result<Geometry> {
        Geometry::new(self.capacity_sectors, self.grain_sectors, self.gtes_per_gt)
    }

    pub fn has_redundant_directory(&self) -> bool {
        self.flags.contains(HostedFlags::REDUNDANT_GRAIN_TABLE)
    }

    /// Text of the descriptor embedded in the descriptor area, if the extent carries one.
    pub fn read_descriptor<B: StorageBackend>(&self, backend: &mut B) -> Result<Option<String>> {
        if self.descriptor_offset == 0 || self.descriptor_sectors == 0 {
            return Ok(None);
        }
        let mut raw = vec![0u8; (self.descriptor_sectors * SECTOR_SIZE as u64) as usize];
        read_metadata(
            backend,
            sectors_to_bytes(self.descriptor_offset)?,
            &mut raw,
            "embedded descriptor beyond end of extent file",
        )?;
        let used = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        raw.truncate(used);
        if raw.is_empty() {
            return Ok(None);
        }
        String::from_utf8(raw)
            .map(Some)
            .map_err(|_| DiskError::MalformedDescriptor {
                line: 0,
                reason: "embedded descriptor is not valid UTF-8".to_string(),
            })
    }
}

/// Layout parameters for a new hosted sparse extent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostedConfig {
    pub capacity_bytes: u64,
    pub grain_size_sectors: u64,
    pub gtes_per_gt: u32,
    pub redundant_directory: bool,
    /// Descriptor text stored in the extent's descriptor area.
    pub descriptor: Option<String>,
    pub descriptor_sectors: u64,
}

impl HostedConfig {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            capacity_bytes,
            grain_size_sectors: 128,
            gtes_per_gt: 512,
            redundant_directory: true,
            descriptor: None,
            descriptor_sectors: DEFAULT_DESCRIPTOR_SECTORS,
        }
    }

    pub fn with_grain_size_sectors(mut self, sectors: u64) -> Self {
        self.grain_size_sectors = sectors;
        self
    }

    pub fn with_gtes_per_gt(mut self, entries: u32) -> Self {
        self.gtes_per_gt = entries;
        self
    }

    pub fn with_redundant_directory(mut self, redundant: bool) -> Self {
        self.redundant_directory = redundant;
        self
    }

    pub fn with_descriptor(mut self, text: impl Into<String>) -> Self {
        self.descriptor = Some(text.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity_bytes == 0 || self.capacity_bytes % SECTOR_SIZE as u64 != 0 {
            return Err(DiskError::InvalidConfig(
                "capacity must be a non-zero multiple of 512",
            ));
        }
        if self.grain_size_sectors < MIN_GRAIN_SECTORS
            || self.grain_size_sectors > MAX_GRAIN_SECTORS
            || !self.grain_size_sectors.is_power_of_two()
        {
            return Err(DiskError::InvalidConfig(
                "grain size must be a power of two between 8 and 8192 sectors",
            ));
        }
        if self.gtes_per_gt == 0 || self.gtes_per_gt > MAX_GTES_PER_GT {
            return Err(DiskError::InvalidConfig("grain table size out of range"));
        }
        if let Some(text) = &self.descriptor {
            if self.descriptor_sectors == 0 || self.descriptor_sectors > MAX_DESCRIPTOR_SECTORS {
                return Err(DiskError::InvalidConfig("descriptor area size out of range"));
            }
            // Keep a terminating NUL inside the area.
            if text.len() as u64 >= self.descriptor_sectors * SECTOR_SIZE as u64 {
                return Err(DiskError::InvalidConfig(
                    "descriptor does not fit the descriptor area",
                ));
            }
        }
        Ok(())
    }
}

/// Primary and (optional) redundant grain directory of a hosted extent.
#[derive(Debug, Clone)]
pub struct HostedDirectory {
    header: HostedHeader,
    geometry: Geometry,
    primary: Vec<u32>,
    redundant: Option<Vec<u32>>,
    choice: DirectoryChoice,
}

impl HostedDirectory {
    pub fn open<B: StorageBackend>(backend: &mut B, choice: DirectoryChoice) -> Result<Self> {
        let header = HostedHeader::read_from(backend)?;
        let geometry = header.geometry()?;
        let primary = read_directory(backend, header.gd_offset, &geometry)?;
        let redundant = if header.has_redundant_directory() {
            Some(read_directory(backend, header.rgd_offset, &geometry)?)
        } else {
            None
        };

        match (choice, &redundant) {
            (DirectoryChoice::Redundant, None) => {
                return Err(DiskError::InvalidConfig(
                    "extent has no redundant grain directory",
                ));
            }
            (DirectoryChoice::Redundant, Some(_)) => {
                tracing::warn!("resolving hosted extent through its redundant grain directory");
            }
            (DirectoryChoice::Primary, Some(copy)) => {
                if primary
                    .iter()
                    .zip(copy)
                    .any(|(p, r)| (*p == 0) != (*r == 0))
                {
                    return Err(DiskError::CorruptIndirection(
                        "primary and redundant grain directories disagree",
                    ));
                }
            }
            (DirectoryChoice::Primary, None) => {}
        }

        Ok(Self {
            header,
            geometry,
            primary,
            redundant,
            choice,
        })
    }

    pub fn header(&self) -> &HostedHeader {
        &self.header
    }

    pub fn choice(&self) -> DirectoryChoice {
        self.choice
    }

    pub fn primary_entries(&self) -> &[u32] {
        &self.primary
    }

    pub fn redundant_entries(&self) -> Option<&[u32]> {
        self.redundant.as_deref()
    }

    fn resolving_directory(&self) -> &[u32] {
        match self.choice {
            DirectoryChoice::Redundant => self.redundant.as_deref().unwrap_or(&self.primary),
            DirectoryChoice::Primary => &self.primary,
        }
    }

    fn read_table<B: StorageBackend>(&self, backend: &mut B, sector: u32) -> Result<Vec<u8>> {
        let mut raw = vec![0u8; self.geometry.table_bytes()];
        read_metadata(
            backend,
            sectors_to_bytes(u64::from(sector))?,
            &mut raw,
            "grain table beyond end of extent file",
        )?;
        Ok(raw)
    }

    /// Compare both directories and every table pair; the first difference is reported.
    pub fn verify_redundancy<B: StorageBackend>(&self, backend: &mut B) -> Result<()> {
        let Some(redundant) = &self.redundant else {
            return Ok(());
        };
        for (p, r) in self.primary.iter().zip(redundant) {
            match (*p, *r) {
                (0, 0) => {}
                (0, _) | (_, 0) => {
                    return Err(DiskError::CorruptIndirection(
                        "primary and redundant grain directories disagree",
                    ));
                }
                (p, r) => {
                    if self.read_table(backend, p)? != self.read_table(backend, r)? {
                        return Err(DiskError::CorruptIndirection(
                            "redundant grain table differs from primary",
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn write_directory_entry<B: StorageBackend>(
        backend: &mut B,
        gd_offset: u64,
        table: u32,
        sector: u32,
    ) -> Result<()> {
        let at = sectors_to_bytes(gd_offset)? + u64::from(table) * 4;
        backend.write_at(at, &sector.to_le_bytes())
    }
}

fn read_directory<B: StorageBackend>(
    backend: &mut B,
    gd_offset: u64,
    geometry: &Geometry,
) -> Result<Vec<u32>> {
    let mut raw = vec![0u8; geometry.gd_entries as usize * 4];
    read_metadata(
        backend,
        sectors_to_bytes(gd_offset)?,
        &mut raw,
        "grain directory beyond end of extent file",
    )?;
    Ok(decode_entries(&raw))
}

fn sector_pointer(sector: u64) -> Result<u32> {
    u32::try_from(sector)
        .map_err(|_| DiskError::UnsupportedFeature("grain table sector does not fit a 32-bit pointer"))
}

impl GrainDirectory for HostedDirectory {
    fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    fn data_start_sector(&self) -> u64 {
        self.header.overhead_sectors.max(1)
    }

    fn immutable_reason(&self) -> Option<&'static str> {
        if self.choice == DirectoryChoice::Redundant {
            Some("extent opened through its redundant grain directory")
        } else if self.header.flags.contains(HostedFlags::COMPRESSED_GRAINS) {
            Some("compressed extents are read-only")
        } else if self.header.flags.contains(HostedFlags::MARKERS) {
            Some("extents with markers are read-only")
        } else {
            None
        }
    }

    fn compressed_grains(&self) -> bool {
        self.header.flags.contains(HostedFlags::COMPRESSED_GRAINS)
    }

    fn load_table<B: StorageBackend>(
        &mut self,
        backend: &mut B,
        table: u32,
    ) -> Result<Option<GrainTable>> {
        let sector = self
            .resolving_directory()
            .get(table as usize)
            .copied()
            .ok_or(DiskError::CorruptIndirection(
                "grain table index beyond grain directory",
            ))?;
        if sector == 0 {
            return Ok(None);
        }
        let raw = self.read_table(backend, sector)?;

        if self.choice == DirectoryChoice::Primary {
            if let Some(redundant) = &self.redundant {
                let copy_sector = redundant[table as usize];
                if copy_sector == 0 || self.read_table(backend, copy_sector)? != raw {
                    return Err(DiskError::CorruptIndirection(
                        "redundant grain table differs from primary",
                    ));
                }
            }
        }
        Ok(Some(GrainTable::from_bytes(&raw)))
    }

    /// Appends the zeroed primary table (and its redundant copy) at end-of-file, sector
    /// aligned. The grain allocated right after starts at the next grain boundary, so on a file
    /// that ends grain aligned a table allocation grows the file by one grain of padding.
    fn allocate_table<B: StorageBackend>(
        &mut self,
        backend: &mut B,
        table: u32,
    ) -> Result<GrainTable> {
        let table_len = self.geometry.table_sectors() * SECTOR_SIZE as u64;
        let mut end = align_up_u64(backend.len()?, SECTOR_SIZE as u64)?;

        let primary_sector = sector_pointer(end / SECTOR_SIZE as u64)?;
        write_zeroes(backend, end, table_len)?;
        end += table_len;

        let redundant_sector = if self.redundant.is_some() {
            let sector = sector_pointer(end / SECTOR_SIZE as u64)?;
            write_zeroes(backend, end, table_len)?;
            Some(sector)
        } else {
            None
        };

        // Tables exist on disk before either directory points at them.
        let idx = table as usize;
        self.primary[idx] = primary_sector;
        Self::write_directory_entry(backend, self.header.gd_offset, table, primary_sector)?;
        if let (Some(redundant), Some(sector)) = (self.redundant.as_mut(), redundant_sector) {
            redundant[idx] = sector;
            Self::write_directory_entry(backend, self.header.rgd_offset, table, sector)?;
        }
        Ok(GrainTable::empty(self.geometry.gtes_per_gt))
    }

    fn allocation_batch(&self, _wanted: u32) -> u32 {
        1
    }

    fn reserve_grains<B: StorageBackend>(&mut self, backend: &mut B, _count: u32) -> Result<u64> {
        let start = align_up_u64(backend.len()?, self.geometry.grain_bytes())?;
        Ok(start / SECTOR_SIZE as u64)
    }

    fn store_entries<B: StorageBackend>(
        &mut self,
        backend: &mut B,
        table: u32,
        first: u32,
        values: &[u32],
    ) -> Result<()> {
        let raw = encode_entries(values);
        let within = u64::from(first) * 4;
        let primary = self.primary[table as usize];
        backend.write_at(sectors_to_bytes(u64::from(primary))? + within, &raw)?;
        if let Some(redundant) = &self.redundant {
            let copy = redundant[table as usize];
            backend.write_at(sectors_to_bytes(u64::from(copy))? + within, &raw)?;
        }
        Ok(())
    }
}

/// A hosted sparse extent.
pub type HostedExtent<B> = SparseExtent<B, HostedDirectory>;

impl<B: StorageBackend> SparseExtent<B, HostedDirectory> {
    /// Lay out a new, empty hosted extent on `backend`, replacing its contents.
    ///
    /// All grain tables are preallocated after their directories; the first grain starts at the
    /// grain-aligned overhead.
    pub fn create(mut backend: B, config: &HostedConfig, parent: Option<ParentLink>) -> Result<Self> {
        config.validate()?;
        let capacity_sectors = config.capacity_bytes / SECTOR_SIZE as u64;
        let geometry = Geometry::new(capacity_sectors, config.grain_size_sectors, config.gtes_per_gt)?;
        let gd_sectors = geometry.directory_sectors();
        let tables_sectors = u64::from(geometry.gd_entries) * geometry.table_sectors();

        let (descriptor_offset, descriptor_sectors) = match config.descriptor {
            Some(_) => (1, config.descriptor_sectors),
            None => (0, 0),
        };
        let mut next = 1 + descriptor_sectors;

        let rgd_offset = if config.redundant_directory {
            let offset = next;
            next += gd_sectors + tables_sectors;
            offset
        } else {
            0
        };
        let gd_offset = next;
        next += gd_sectors + tables_sectors;
        let overhead_sectors = align_up_u64(next, config.grain_size_sectors)?;

        let mut flags = HostedFlags::VALID_NEWLINE_TEST;
        if config.redundant_directory {
            flags |= HostedFlags::REDUNDANT_GRAIN_TABLE;
        }
        let header = HostedHeader {
            version: 1,
            flags,
            capacity_sectors,
            grain_sectors: config.grain_size_sectors,
            descriptor_offset,
            descriptor_sectors,
            gtes_per_gt: config.gtes_per_gt,
            rgd_offset,
            gd_offset,
            overhead_sectors,
            unclean_shutdown: false,
            compression: CompressionAlgorithm::None,
        };

        backend.set_len(0)?;
        backend.set_len(sectors_to_bytes(overhead_sectors)?)?;
        backend.write_at(0, &header.to_bytes())?;
        if let Some(text) = &config.descriptor {
            backend.write_at(sectors_to_bytes(descriptor_offset)?, text.as_bytes())?;
        }

        let table_pointers = |gd: u64| -> Result<Vec<u32>> {
            (0..u64::from(geometry.gd_entries))
                .map(|i| sector_pointer(gd + gd_sectors + i * geometry.table_sectors()))
                .collect()
        };
        let primary = table_pointers(gd_offset)?;
        backend.write_at(sectors_to_bytes(gd_offset)?, &encode_entries(&primary))?;
        let redundant = if config.redundant_directory {
            let entries = table_pointers(rgd_offset)?;
            backend.write_at(sectors_to_bytes(rgd_offset)?, &encode_entries(&entries))?;
            Some(entries)
        } else {
            None
        };
        backend.flush()?;

        tracing::debug!(
            capacity = config.capacity_bytes,
            grain_sectors = config.grain_size_sectors,
            overhead_sectors,
            "created hosted sparse extent"
        );

        let directory = HostedDirectory {
            header,
            geometry,
            primary,
            redundant,
            choice: DirectoryChoice::Primary,
        };
        Ok(Self::from_parts(backend, directory, &OpenOptions::default(), parent))
    }

    pub fn open(mut backend: B, options: &OpenOptions, parent: Option<ParentLink>) -> Result<Self> {
        let directory = HostedDirectory::open(&mut backend, options.directory)?;
        tracing::debug!(
            capacity = directory.geometry.capacity_bytes(),
            flags = ?directory.header.flags,
            "opened hosted sparse extent"
        );
        Ok(Self::from_parts(backend, directory, options, parent))
    }

    pub fn header(&self) -> &HostedHeader {
        self.directory().header()
    }

    pub fn verify_redundancy(&mut self) -> Result<()> {
        let (backend, directory) = self.parts_mut();
        directory.verify_redundancy(backend)
    }

    pub fn embedded_descriptor(&mut self) -> Result<Option<String>> {
        let (backend, directory) = self.parts_mut();
        directory.header.read_descriptor(backend)
    }
}
