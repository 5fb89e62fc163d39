//! Parent links between differencing layers.
//!
//! A sparse extent falls back to its parent for every grain it does not store itself. Whether
//! closing the extent also closes that parent is an explicit decision made when the link is
//! built ([`Ownership`]); nothing is inferred from reference counts.

use std::cell::RefCell;
use std::rc::Rc;

use crate::util::checked_range;
use crate::{DiskError, Result, StreamExtent, VirtualDisk};

/// A disk shared between several readers (e.g. every extent of a multi-extent layer reads from
/// the same parent content).
pub type SharedDisk = Rc<RefCell<Box<dyn VirtualDisk>>>;

pub fn share(disk: impl VirtualDisk + 'static) -> SharedDisk {
    share_boxed(Box::new(disk))
}

pub fn share_boxed(disk: Box<dyn VirtualDisk>) -> SharedDisk {
    Rc::new(RefCell::new(disk))
}

/// Who is responsible for closing a parent disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Closing the child closes the parent.
    Owned,
    /// The parent outlives the child; somebody else closes it.
    Borrowed,
}

/// Read-only view of the layer beneath a differencing extent.
pub struct ParentLink {
    disk: SharedDisk,
    ownership: Ownership,
}

impl ParentLink {
    /// Link to a parent that the child takes over.
    pub fn owned(disk: impl VirtualDisk + 'static) -> Self {
        Self {
            disk: share(disk),
            ownership: Ownership::Owned,
        }
    }

    pub fn owned_boxed(disk: Box<dyn VirtualDisk>) -> Self {
        Self {
            disk: share_boxed(disk),
            ownership: Ownership::Owned,
        }
    }

    pub fn shared(disk: SharedDisk, ownership: Ownership) -> Self {
        Self { disk, ownership }
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    pub fn disk(&self) -> &SharedDisk {
        &self.disk
    }

    pub fn capacity_bytes(&self) -> Result<u64> {
        Ok(self.borrow()?.capacity_bytes())
    }

    /// Read `buf.len()` bytes at `offset`; bytes past the parent's capacity read as zeros.
    pub fn read_or_zero(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut disk = self.borrow_mut()?;
        let capacity = disk.capacity_bytes();
        let available = capacity.saturating_sub(offset).min(buf.len() as u64) as usize;
        let (head, tail) = buf.split_at_mut(available);
        if !head.is_empty() {
            disk.read_at(offset, head)?;
        }
        tail.fill(0);
        Ok(())
    }

    pub fn extents_in_range(&self, start: u64, length: u64) -> Result<Vec<StreamExtent>> {
        self.borrow_mut()?.extents_in_range(start, length)
    }

    pub fn close(&mut self) -> Result<()> {
        match self.ownership {
            Ownership::Owned => self.borrow_mut()?.close(),
            Ownership::Borrowed => Ok(()),
        }
    }

    fn borrow(&self) -> Result<std::cell::Ref<'_, Box<dyn VirtualDisk>>> {
        self.disk
            .try_borrow()
            .map_err(|_| DiskError::NotSupported("parent disk is already in use"))
    }

    fn borrow_mut(&self) -> Result<std::cell::RefMut<'_, Box<dyn VirtualDisk>>> {
        self.disk
            .try_borrow_mut()
            .map_err(|_| DiskError::NotSupported("parent disk is already in use"))
    }
}

impl std::fmt::Debug for ParentLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParentLink")
            .field("ownership", &self.ownership)
            .finish_non_exhaustive()
    }
}

/// Read-only window `[offset, offset + len)` into a shared disk.
///
/// Each extent of a multi-extent layer sees the parent content through a window positioned at
/// the extent's own offset in the layer.
pub struct WindowDisk {
    inner: ParentLink,
    offset: u64,
    len: u64,
}

impl WindowDisk {
    pub fn new(disk: SharedDisk, offset: u64, len: u64) -> Self {
        Self {
            inner: ParentLink::shared(disk, Ownership::Borrowed),
            offset,
            len,
        }
    }
}

impl VirtualDisk for WindowDisk {
    fn capacity_bytes(&self) -> u64 {
        self.len
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.len)?;
        let abs = self
            .offset
            .checked_add(offset)
            .ok_or(DiskError::OffsetOverflow)?;
        self.inner.read_or_zero(abs, buf)
    }

    fn write_at(&mut self, _offset: u64, _buf: &[u8]) -> Result<()> {
        Err(DiskError::ReadOnly)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn extents_in_range(&mut self, start: u64, length: u64) -> Result<Vec<StreamExtent>> {
        let end = start.saturating_add(length).min(self.len);
        if start >= end {
            return Ok(Vec::new());
        }
        let abs = self
            .offset
            .checked_add(start)
            .ok_or(DiskError::OffsetOverflow)?;
        let delta = -i128::from(self.offset);
        Ok(self
            .inner
            .extents_in_range(abs, end - start)?
            .into_iter()
            .filter_map(|e| e.offset_by(delta))
            .collect())
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}
