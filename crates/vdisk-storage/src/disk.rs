use crate::util::{checked_range, checked_write_range};
use crate::{DiskError, Result, StorageBackend, StreamExtent};

pub const SECTOR_SIZE: usize = 512;

/// Requested access for an opened disk or layer.
///
/// This is independent of format-level immutability: a compressed hosted extent opened with
/// [`Access::ReadWrite`] still rejects writes with [`DiskError::IllegalWrite`], while any disk
/// opened with [`Access::ReadOnly`] rejects them with [`DiskError::ReadOnly`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Access {
    ReadOnly,
    #[default]
    ReadWrite,
}

impl Access {
    pub fn is_writable(self) -> bool {
        matches!(self, Access::ReadWrite)
    }
}

/// Byte-addressed disk with a fixed capacity.
///
/// `read_at`/`write_at` require the whole range to lie inside `capacity_bytes()`; cursor-style
/// clamping and EOF reporting live in [`crate::DiskStream`].
pub trait VirtualDisk {
    fn capacity_bytes(&self) -> u64;

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    /// Ranges inside `[start, start + length)` that hold stored data.
    ///
    /// Dense disks report the whole (clamped) window.
    fn extents_in_range(&mut self, start: u64, length: u64) -> Result<Vec<StreamExtent>> {
        let end = start.saturating_add(length).min(self.capacity_bytes());
        if start >= end {
            return Ok(Vec::new());
        }
        Ok(vec![StreamExtent::new(start, end - start)])
    }

    /// Flush and release the disk. Closing cascades to any parent the disk owns.
    fn close(&mut self) -> Result<()> {
        self.flush()
    }
}

impl<D: VirtualDisk + ?Sized> VirtualDisk for Box<D> {
    fn capacity_bytes(&self) -> u64 {
        (**self).capacity_bytes()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write_at(offset, buf)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn extents_in_range(&mut self, start: u64, length: u64) -> Result<Vec<StreamExtent>> {
        (**self).extents_in_range(start, length)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// A disk that reads as zeros and stores nothing (`ZERO` extents).
#[derive(Debug, Clone, Copy)]
pub struct ZeroDisk {
    capacity: u64,
}

impl ZeroDisk {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            capacity: capacity_bytes,
        }
    }
}

impl VirtualDisk for ZeroDisk {
    fn capacity_bytes(&self) -> u64 {
        self.capacity
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.capacity)?;
        buf.fill(0);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        checked_write_range(offset, buf.len(), self.capacity)?;
        Err(DiskError::IllegalWrite("zero extents cannot store data"))
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn extents_in_range(&mut self, _start: u64, _length: u64) -> Result<Vec<StreamExtent>> {
        Ok(Vec::new())
    }
}

/// A fully allocated extent: `capacity` bytes stored verbatim at `offset` inside the backend.
pub struct FlatDisk<B> {
    backend: B,
    offset: u64,
    capacity: u64,
    access: Access,
    closed: bool,
}

impl<B: StorageBackend> FlatDisk<B> {
    pub fn open(mut backend: B, offset: u64, capacity: u64, access: Access) -> Result<Self> {
        let end = offset
            .checked_add(capacity)
            .ok_or(DiskError::OffsetOverflow)?;
        if backend.len()? < end {
            return Err(DiskError::MalformedHeader(
                "flat extent file is shorter than its declared size",
            ));
        }
        tracing::debug!(offset, capacity, ?access, "opened flat extent");
        Ok(Self {
            backend,
            offset,
            capacity,
            access,
            closed: false,
        })
    }

    /// Size `backend` for a new flat extent of `capacity` bytes.
    pub fn create(mut backend: B, capacity: u64) -> Result<Self> {
        backend.set_len(capacity)?;
        Self::open(backend, 0, capacity, Access::ReadWrite)
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(DiskError::Closed);
        }
        Ok(())
    }
}

impl<B: StorageBackend> VirtualDisk for FlatDisk<B> {
    fn capacity_bytes(&self) -> u64 {
        self.capacity
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.ensure_open()?;
        checked_range(offset, buf.len(), self.capacity)?;
        self.backend.read_at(self.offset + offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if !self.access.is_writable() {
            return Err(DiskError::ReadOnly);
        }
        checked_write_range(offset, buf.len(), self.capacity)?;
        self.backend.write_at(self.offset + offset, buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.backend.flush()
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.backend.flush()?;
        self.closed = true;
        Ok(())
    }
}
