use crate::extents::ExtentSet;
use crate::util::{checked_range, checked_write_range};
use crate::{DiskError, ParentLink, Result, StreamExtent, VirtualDisk};

struct Part {
    start: u64,
    disk: Box<dyn VirtualDisk>,
}

/// Extents of one layer laid end to end, in declaration order.
///
/// When the extents read from a common parent, the concatenation holds that parent and closes
/// it after closing every extent.
pub struct ConcatDisk {
    parts: Vec<Part>,
    capacity: u64,
    parent: Option<ParentLink>,
}

impl ConcatDisk {
    pub fn new(disks: Vec<Box<dyn VirtualDisk>>, parent: Option<ParentLink>) -> Result<Self> {
        let mut parts = Vec::with_capacity(disks.len());
        let mut capacity = 0u64;
        for disk in disks {
            let len = disk.capacity_bytes();
            parts.push(Part {
                start: capacity,
                disk,
            });
            capacity = capacity
                .checked_add(len)
                .ok_or(DiskError::OffsetOverflow)?;
        }
        Ok(Self {
            parts,
            capacity,
            parent,
        })
    }

    fn part_index(&self, offset: u64) -> usize {
        self.parts
            .partition_point(|p| p.start + p.disk.capacity_bytes() <= offset)
    }
}

impl VirtualDisk for ConcatDisk {
    fn capacity_bytes(&self) -> u64 {
        self.capacity
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.capacity)?;
        let mut pos = 0usize;
        let mut idx = self.part_index(offset);
        while pos < buf.len() {
            let abs = offset + pos as u64;
            let part = &mut self.parts[idx];
            let within = abs - part.start;
            let chunk = (part.disk.capacity_bytes() - within).min((buf.len() - pos) as u64) as usize;
            part.disk.read_at(within, &mut buf[pos..pos + chunk])?;
            pos += chunk;
            idx += 1;
        }
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        checked_write_range(offset, buf.len(), self.capacity)?;
        let mut pos = 0usize;
        let mut idx = self.part_index(offset);
        while pos < buf.len() {
            let abs = offset + pos as u64;
            let part = &mut self.parts[idx];
            let within = abs - part.start;
            let chunk = (part.disk.capacity_bytes() - within).min((buf.len() - pos) as u64) as usize;
            part.disk.write_at(within, &buf[pos..pos + chunk])?;
            pos += chunk;
            idx += 1;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        for part in &mut self.parts {
            part.disk.flush()?;
        }
        Ok(())
    }

    fn extents_in_range(&mut self, start: u64, length: u64) -> Result<Vec<StreamExtent>> {
        let end = start.saturating_add(length).min(self.capacity);
        if start >= end {
            return Ok(Vec::new());
        }
        let mut set = ExtentSet::new();
        for part in &mut self.parts {
            let part_end = part.start + part.disk.capacity_bytes();
            if part_end <= start || part.start >= end {
                continue;
            }
            let local_start = start.max(part.start) - part.start;
            let local_end = end.min(part_end) - part.start;
            let delta = i128::from(part.start);
            set.extend(
                part.disk
                    .extents_in_range(local_start, local_end - local_start)?
                    .into_iter()
                    .filter_map(|e| e.offset_by(delta)),
            );
        }
        Ok(set.clipped(start, end - start))
    }

    fn close(&mut self) -> Result<()> {
        for part in &mut self.parts {
            part.disk.close()?;
        }
        if let Some(parent) = self.parent.as_mut() {
            parent.close()?;
        }
        Ok(())
    }
}
