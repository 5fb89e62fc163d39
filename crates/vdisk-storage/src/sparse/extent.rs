use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use super::compression::{
    inflate_grain, inflate_grain_range, CompressedGrainHeader, COMPRESSED_GRAIN_HEADER_SIZE,
};
use super::{read_metadata, GrainAddress, GrainDirectory, GrainTableCache, OpenOptions};
use crate::extents::ExtentSet;
use crate::util::{checked_range, checked_write_range, sectors_to_bytes};
use crate::{
    Access, DiskError, ParentLink, Result, StorageBackend, StreamExtent, VirtualDisk, SECTOR_SIZE,
};

/// A sparse extent: the shared grain-directory walk over a variant-specific [`GrainDirectory`].
///
/// Reads of grains the extent does not hold fall through to the parent link (or read as zeros
/// without one). Writes allocate missing grains copy-on-write: the parent's bytes for the whole
/// grain are copied in first, the caller's bytes are laid over them, the grain data is written,
/// and only then are the table entries persisted.
pub struct SparseExtent<B, D> {
    backend: B,
    directory: D,
    tables: GrainTableCache,
    inflated: Option<LruCache<u64, Arc<Vec<u8>>>>,
    parent: Option<ParentLink>,
    access: Access,
    closed: bool,
}

impl<B: StorageBackend, D: GrainDirectory> SparseExtent<B, D> {
    pub(crate) fn from_parts(
        backend: B,
        directory: D,
        options: &OpenOptions,
        parent: Option<ParentLink>,
    ) -> Self {
        let inflated = if directory.compressed_grains() {
            NonZeroUsize::new(options.compressed_grain_cache).map(LruCache::new)
        } else {
            None
        };
        Self {
            backend,
            directory,
            tables: GrainTableCache::new(),
            inflated,
            parent,
            access: options.access,
            closed: false,
        }
    }

    pub fn directory(&self) -> &D {
        &self.directory
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn parent(&self) -> Option<&ParentLink> {
        self.parent.as_ref()
    }

    /// Number of grain tables currently held in memory.
    pub fn cached_tables(&self) -> usize {
        self.tables.len()
    }

    /// Current length of the backing file.
    pub fn file_len(&mut self) -> Result<u64> {
        self.backend.len()
    }

    pub fn into_parts(self) -> (B, Option<ParentLink>) {
        (self.backend, self.parent)
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    pub(super) fn parts_mut(&mut self) -> (&mut B, &mut D) {
        (&mut self.backend, &mut self.directory)
    }

    /// Byte position inside the backing file of the grain holding logical `offset`, or `None`
    /// when this extent does not store that grain.
    pub fn grain_location(&mut self, offset: u64) -> Result<Option<u64>> {
        self.ensure_open()?;
        checked_range(offset, 1, self.capacity_bytes())?;
        let addr = self.directory.geometry().locate(offset);
        if !self.load_grain_table(addr.table)? {
            return Ok(None);
        }
        match self.table_entry(addr.table, addr.grain)? {
            0 => Ok(None),
            sector => Ok(Some(self.grain_file_offset(sector)?)),
        }
    }

    /// Ranges of `[start, start + length)` stored by this extent alone, ignoring the parent.
    pub fn own_extents(&mut self, start: u64, length: u64) -> Result<Vec<StreamExtent>> {
        self.ensure_open()?;
        let end = start.saturating_add(length).min(self.capacity_bytes());
        if start >= end {
            return Ok(Vec::new());
        }
        let geometry = *self.directory.geometry();
        let coverage = geometry.table_coverage();
        let grain_bytes = geometry.grain_bytes();

        let mut set = ExtentSet::new();
        let first_table = (start / coverage) as u32;
        let last_table = ((end - 1) / coverage) as u32;
        for table in first_table..=last_table {
            // Absent tables are skipped wholesale.
            if !self.load_grain_table(table)? {
                continue;
            }
            let table_start = u64::from(table) * coverage;
            let first = (start.max(table_start) - table_start) / grain_bytes;
            let last = ((end - 1).min(table_start + coverage - 1) - table_start) / grain_bytes;
            let entries = self.table_entries(table, first as u32, last as u32)?;
            for (i, entry) in entries.iter().enumerate() {
                if *entry != 0 {
                    set.insert(
                        geometry.grain_offset(table, first as u32 + i as u32),
                        grain_bytes,
                    );
                }
            }
        }
        Ok(set.clipped(start, end - start))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(DiskError::Closed);
        }
        Ok(())
    }

    fn load_grain_table(&mut self, table: u32) -> Result<bool> {
        if self.tables.contains(table) {
            return Ok(true);
        }
        if table >= self.directory.geometry().gd_entries {
            return Err(DiskError::CorruptIndirection(
                "grain table index beyond grain directory",
            ));
        }
        match self.directory.load_table(&mut self.backend, table)? {
            Some(loaded) => {
                self.tables.insert(table, loaded);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn table_entry(&self, table: u32, grain: u32) -> Result<u32> {
        self.tables
            .get(table)
            .map(|t| t.get(grain))
            .ok_or(DiskError::CorruptIndirection("grain table missing from cache"))
    }

    fn table_entries(&self, table: u32, first: u32, last: u32) -> Result<Vec<u32>> {
        let loaded = self
            .tables
            .get(table)
            .ok_or(DiskError::CorruptIndirection("grain table missing from cache"))?;
        loaded
            .entries()
            .get(first as usize..=last as usize)
            .map(<[u32]>::to_vec)
            .ok_or(DiskError::CorruptIndirection("grain index beyond grain table"))
    }

    fn grain_file_offset(&self, sector: u32) -> Result<u64> {
        let sector = u64::from(sector);
        if sector < self.directory.data_start_sector() {
            return Err(DiskError::CorruptIndirection(
                "grain pointer overlaps extent metadata",
            ));
        }
        sectors_to_bytes(sector)
    }

    fn read_fallback(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match &self.parent {
            Some(parent) => parent.read_or_zero(offset, buf),
            None => {
                buf.fill(0);
                Ok(())
            }
        }
    }

    /// Read a run that lies inside one allocated grain table.
    fn read_from_table(&mut self, addr: GrainAddress, abs: u64, run: &mut [u8]) -> Result<()> {
        let geometry = *self.directory.geometry();
        let grain_bytes = geometry.grain_bytes();
        let last = addr.grain + ((addr.within + run.len() as u64 - 1) / grain_bytes) as u32;
        let entries = self.table_entries(addr.table, addr.grain, last)?;

        let mut pos = 0usize;
        let mut within = addr.within;
        let mut i = 0usize;
        while pos < run.len() {
            let chunk = (grain_bytes - within).min((run.len() - pos) as u64) as usize;
            if entries[i] == 0 {
                // Coalesce neighbouring holes into one parent read.
                let mut len = chunk;
                let mut j = i + 1;
                while pos + len < run.len() && entries[j] == 0 {
                    len += (grain_bytes as usize).min(run.len() - pos - len);
                    j += 1;
                }
                self.read_fallback(abs + pos as u64, &mut run[pos..pos + len])?;
                pos += len;
                i = j;
            } else {
                let logical = geometry.grain_offset(addr.table, addr.grain + i as u32);
                self.read_grain(entries[i], logical, within, &mut run[pos..pos + chunk])?;
                pos += chunk;
                i += 1;
            }
            within = 0;
        }
        Ok(())
    }

    fn read_grain(&mut self, sector: u32, logical: u64, within: u64, out: &mut [u8]) -> Result<()> {
        let file_offset = self.grain_file_offset(sector)?;
        if self.directory.compressed_grains() {
            return self.read_compressed_grain(file_offset, logical, within, out);
        }
        read_metadata(
            &mut self.backend,
            file_offset + within,
            out,
            "grain lies beyond end of extent file",
        )
    }

    fn read_compressed_grain(
        &mut self,
        file_offset: u64,
        logical: u64,
        within: u64,
        out: &mut [u8],
    ) -> Result<()> {
        let within_usize = within as usize;
        if let Some(cache) = self.inflated.as_mut() {
            if let Some(grain) = cache.get(&file_offset) {
                out.copy_from_slice(&grain[within_usize..within_usize + out.len()]);
                return Ok(());
            }
        }

        let payload = self.read_compressed_payload(file_offset, logical)?;
        let grain_bytes = self.directory.geometry().grain_bytes() as usize;
        match self.inflated.as_mut() {
            Some(cache) => {
                let grain = Arc::new(inflate_grain(&payload, grain_bytes)?);
                out.copy_from_slice(&grain[within_usize..within_usize + out.len()]);
                cache.put(file_offset, grain);
                Ok(())
            }
            None => inflate_grain_range(&payload, within, out),
        }
    }

    fn read_compressed_payload(&mut self, file_offset: u64, logical: u64) -> Result<Vec<u8>> {
        let mut raw = [0u8; COMPRESSED_GRAIN_HEADER_SIZE];
        read_metadata(
            &mut self.backend,
            file_offset,
            &mut raw,
            "compressed grain header beyond end of extent file",
        )?;
        let header = CompressedGrainHeader::parse(&raw);
        if header.lba != logical / SECTOR_SIZE as u64 {
            return Err(DiskError::CorruptGrain(
                "grain header does not match its logical position",
            ));
        }
        // Deflate may expand incompressible data slightly; anything far beyond a grain is bogus.
        let max_payload = self.directory.geometry().grain_bytes() * 2 + 4096;
        if header.data_size < 2 || u64::from(header.data_size) > max_payload {
            return Err(DiskError::CorruptGrain("compressed grain size out of range"));
        }
        let mut payload = vec![0u8; header.data_size as usize];
        read_metadata(
            &mut self.backend,
            file_offset + COMPRESSED_GRAIN_HEADER_SIZE as u64,
            &mut payload,
            "compressed grain payload beyond end of extent file",
        )?;
        Ok(payload)
    }

    /// Allocate the unallocated grain at `addr` (and, when the directory batches, the following
    /// unallocated grains the rest of `data` needs), copying parent content in and laying `data`
    /// over it. Returns how many bytes of `data` were consumed.
    fn allocate_run(&mut self, addr: GrainAddress, data: &[u8]) -> Result<usize> {
        let geometry = *self.directory.geometry();
        let grain_bytes = geometry.grain_bytes();

        let needed = (addr.within + data.len() as u64)
            .div_ceil(grain_bytes)
            .min(u64::from(geometry.gtes_per_gt - addr.grain)) as u32;
        let last = addr.grain + needed - 1;
        let wanted = self
            .table_entries(addr.table, addr.grain, last)?
            .iter()
            .take_while(|entry| **entry == 0)
            .count() as u32;
        let count = self.directory.allocation_batch(wanted).clamp(1, wanted.max(1));

        let run_start = geometry.grain_offset(addr.table, addr.grain);
        let run_bytes = u64::from(count) * grain_bytes;
        let mut grains = vec![0u8; run_bytes as usize];
        let inherited = self
            .capacity_bytes()
            .saturating_sub(run_start)
            .min(run_bytes) as usize;
        self.read_fallback(run_start, &mut grains[..inherited])?;

        let within = addr.within as usize;
        let consumed = (run_bytes as usize - within).min(data.len());
        grains[within..within + consumed].copy_from_slice(&data[..consumed]);

        let first_sector = self.directory.reserve_grains(&mut self.backend, count)?;
        let pointers = (0..u64::from(count))
            .map(|i| {
                u32::try_from(first_sector + i * geometry.grain_sectors).map_err(|_| {
                    DiskError::UnsupportedFeature("grain sector does not fit a 32-bit pointer")
                })
            })
            .collect::<Result<Vec<u32>>>()?;

        // Grain data first, then the tables that point at it.
        self.backend
            .write_at(sectors_to_bytes(first_sector)?, &grains)?;
        self.directory
            .store_entries(&mut self.backend, addr.table, addr.grain, &pointers)?;
        self.tables
            .get_mut(addr.table)
            .ok_or(DiskError::CorruptIndirection("grain table missing from cache"))?
            .set_run(addr.grain, &pointers);

        tracing::trace!(
            table = addr.table,
            grain = addr.grain,
            count,
            first_sector,
            "allocated grains"
        );
        Ok(consumed)
    }
}

impl<B: StorageBackend, D: GrainDirectory> VirtualDisk for SparseExtent<B, D> {
    fn capacity_bytes(&self) -> u64 {
        self.directory.geometry().capacity_bytes()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.ensure_open()?;
        checked_range(offset, buf.len(), self.capacity_bytes())?;

        let coverage = self.directory.geometry().table_coverage();
        let mut pos = 0usize;
        while pos < buf.len() {
            let abs = offset + pos as u64;
            let addr = self.directory.geometry().locate(abs);
            let table_end = (u64::from(addr.table) + 1) * coverage;
            let run_len = (table_end - abs).min((buf.len() - pos) as u64) as usize;
            let run = &mut buf[pos..pos + run_len];

            if self.load_grain_table(addr.table)? {
                self.read_from_table(addr, abs, run)?;
            } else {
                // No table: the whole run within this table's coverage comes from below.
                self.read_fallback(abs, run)?;
            }
            pos += run_len;
        }
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if !self.access.is_writable() {
            return Err(DiskError::ReadOnly);
        }
        if let Some(reason) = self.directory.immutable_reason() {
            return Err(DiskError::IllegalWrite(reason));
        }
        checked_write_range(offset, buf.len(), self.capacity_bytes())?;

        let grain_bytes = self.directory.geometry().grain_bytes();
        let mut pos = 0usize;
        while pos < buf.len() {
            let abs = offset + pos as u64;
            let addr = self.directory.geometry().locate(abs);

            if !self.load_grain_table(addr.table)? {
                let table = self
                    .directory
                    .allocate_table(&mut self.backend, addr.table)?;
                tracing::debug!(table = addr.table, "allocated grain table");
                self.tables.insert(addr.table, table);
            }

            match self.table_entry(addr.table, addr.grain)? {
                0 => pos += self.allocate_run(addr, &buf[pos..])?,
                sector => {
                    let chunk = (grain_bytes - addr.within).min((buf.len() - pos) as u64) as usize;
                    let at = self.grain_file_offset(sector)? + addr.within;
                    self.backend.write_at(at, &buf[pos..pos + chunk])?;
                    pos += chunk;
                }
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.backend.flush()
    }

    fn extents_in_range(&mut self, start: u64, length: u64) -> Result<Vec<StreamExtent>> {
        let end = start.saturating_add(length).min(self.capacity_bytes());
        if start >= end {
            self.ensure_open()?;
            return Ok(Vec::new());
        }
        let mut set: ExtentSet = self.own_extents(start, end - start)?.into_iter().collect();
        if let Some(parent) = &self.parent {
            set.extend(parent.extents_in_range(start, end - start)?);
        }
        Ok(set.clipped(start, end - start))
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.backend.flush()?;
        self.closed = true;
        if let Some(parent) = self.parent.as_mut() {
            parent.close()?;
        }
        Ok(())
    }
}
