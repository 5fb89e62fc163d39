use std::fs::{File, OpenOptions};
use std::path::Path;

use crate::{DiskError, Result};

/// Byte-addressed storage holding one extent file.
///
/// Offsets are absolute positions in the backing store. Reads must lie entirely inside the
/// current length ([`DiskError::OutOfBounds`] otherwise); writes past the end grow the store.
pub trait StorageBackend {
    fn len(&mut self) -> Result<u64>;

    fn set_len(&mut self, len: u64) -> Result<()>;

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    fn is_read_only(&self) -> bool {
        false
    }
}

impl<B: StorageBackend + ?Sized> StorageBackend for Box<B> {
    fn len(&mut self) -> Result<u64> {
        (**self).len()
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        (**self).set_len(len)
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

    fn is_read_only(&self) -> bool {
        (**self).is_read_only()
    }
}

fn end_offset(offset: u64, len: usize) -> Result<u64> {
    offset
        .checked_add(len as u64)
        .ok_or(DiskError::OffsetOverflow)
}

/// In-memory backend, mostly for tests and scratch layers.
#[derive(Debug, Default, Clone)]
pub struct MemBackend {
    data: Vec<u8>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn with_len(len: u64) -> Result<Self> {
        let len: usize = len
            .try_into()
            .map_err(|_| DiskError::InvalidConfig("backend length exceeds address space"))?;
        Ok(Self {
            data: vec![0u8; len],
        })
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

impl StorageBackend for MemBackend {
    fn len(&mut self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        let len: usize = len.try_into().map_err(|_| DiskError::OffsetOverflow)?;
        self.data.resize(len, 0);
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = end_offset(offset, buf.len())?;
        if end > self.data.len() as u64 {
            return Err(DiskError::OutOfBounds {
                offset,
                len: buf.len(),
                capacity: self.data.len() as u64,
            });
        }
        let start = offset as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let end: usize = end_offset(offset, buf.len())?
            .try_into()
            .map_err(|_| DiskError::OffsetOverflow)?;
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        let start = offset as usize;
        self.data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// [`StorageBackend`] over a `std::fs::File` using positional I/O.
///
/// Reads and writes never move the file cursor, so the handle can be shared with code that
/// uses `Seek` on the same `File` (e.g. after [`StdFileBackend::into_file`]).
#[derive(Debug)]
pub struct StdFileBackend {
    file: File,
    read_only: bool,
}

impl StdFileBackend {
    pub fn from_file(file: File) -> Self {
        Self {
            file,
            read_only: false,
        }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self::from_file(file))
    }

    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self {
            file,
            read_only: true,
        })
    }

    /// Create (or truncate) a file for a new extent.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self::from_file(file))
    }

    /// Block mutations at the backend layer regardless of the OS-level handle permissions.
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn into_file(self) -> File {
        self.file
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(DiskError::NotSupported("read-only backend"));
        }
        Ok(())
    }
}

impl StorageBackend for StdFileBackend {
    fn len(&mut self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.ensure_writable()?;
        self.file.set_len(len)?;
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = end_offset(offset, buf.len())?;
        let capacity = self.len()?;
        if end > capacity {
            return Err(DiskError::OutOfBounds {
                offset,
                len: buf.len(),
                capacity,
            });
        }
        pread_exact(&self.file, offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        end_offset(offset, buf.len())?;
        pwrite_all(&self.file, offset, buf)
    }

    fn flush(&mut self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.file.sync_data()?;
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

#[cfg(unix)]
fn pread_exact(file: &File, offset: u64, buf: &mut [u8]) -> Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)?;
    Ok(())
}

#[cfg(unix)]
fn pwrite_all(file: &File, offset: u64, buf: &[u8]) -> Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)?;
    Ok(())
}

#[cfg(windows)]
fn pread_exact(file: &File, mut offset: u64, mut buf: &mut [u8]) -> Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_read(buf, offset)?;
        if n == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        buf = &mut std::mem::take(&mut buf)[n..];
        offset += n as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn pwrite_all(file: &File, mut offset: u64, mut buf: &[u8]) -> Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_write(buf, offset)?;
        if n == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into());
        }
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_backend_grows_on_write_and_rejects_short_reads() {
        let mut backend = MemBackend::new();
        backend.write_at(10, b"abc").unwrap();
        assert_eq!(backend.len().unwrap(), 13);
        assert_eq!(&backend.as_slice()[..10], &[0u8; 10]);

        let mut buf = [0u8; 4];
        let err = backend.read_at(10, &mut buf).unwrap_err();
        assert!(matches!(err, DiskError::OutOfBounds { capacity: 13, .. }));
    }

    #[test]
    fn mem_backend_offset_overflow_is_reported() {
        let mut backend = MemBackend::with_len(16).unwrap();
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
}
