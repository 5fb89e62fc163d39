use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::{DiskError, Result, StreamExtent, VirtualDisk};

/// Cursor over a [`VirtualDisk`] with a fixed length.
///
/// Reads are clamped to the length. A read exactly at the end returns `Ok(0)` once; reading
/// again without seeking, or reading from a position past the end, fails with
/// [`DiskError::ReadPastEnd`]. Writes never extend the stream.
pub struct DiskStream<D> {
    disk: D,
    position: u64,
    eof_reported: bool,
}

impl<D: VirtualDisk> DiskStream<D> {
    pub fn new(disk: D) -> Self {
        Self {
            disk,
            position: 0,
            eof_reported: false,
        }
    }

    pub fn len(&self) -> u64 {
        self.disk.capacity_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn set_len(&mut self, _len: u64) -> Result<()> {
        Err(DiskError::NotSupported("disk streams have a fixed length"))
    }

    pub fn extents_in_range(&mut self, start: u64, length: u64) -> Result<Vec<StreamExtent>> {
        self.disk.extents_in_range(start, length)
    }

    pub fn close(&mut self) -> Result<()> {
        self.disk.close()
    }

    pub fn get_ref(&self) -> &D {
        &self.disk
    }

    pub fn get_mut(&mut self) -> &mut D {
        &mut self.disk
    }

    pub fn into_inner(self) -> D {
        self.disk
    }

    fn past_end(&self) -> io::Error {
        DiskError::ReadPastEnd {
            position: self.position,
            length: self.len(),
        }
        .into()
    }
}

impl<D: VirtualDisk> Read for DiskStream<D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let len = self.len();
        if self.position > len {
            return Err(self.past_end());
        }
        if self.position == len {
            if self.eof_reported {
                return Err(self.past_end());
            }
            self.eof_reported = true;
            return Ok(0);
        }

        let n = (len - self.position).min(buf.len() as u64) as usize;
        self.disk.read_at(self.position, &mut buf[..n])?;
        self.position += n as u64;
        Ok(n)
    }
}

impl<D: VirtualDisk> Write for DiskStream<D> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.disk.write_at(self.position, buf)?;
        self.position += buf.len() as u64;
        self.eof_reported = false;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(self.disk.flush()?)
    }
}

impl<D: VirtualDisk> Seek for DiskStream<D> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(delta) => self.len().checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative or overflowing position",
            )
        })?;
        self.position = target;
        self.eof_reported = false;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FlatDisk, MemBackend};

    fn stream(len: u64) -> DiskStream<FlatDisk<MemBackend>> {
        DiskStream::new(FlatDisk::create(MemBackend::new(), len).unwrap())
    }

    #[test]
    fn eof_is_reported_once() {
        let mut s = stream(8);
        let mut buf = [0u8; 16];
        assert_eq!(s.read(&mut buf).unwrap(), 8);
        assert_eq!(s.read(&mut buf).unwrap(), 0);
        let err = s.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        s.seek(SeekFrom::End(0)).unwrap();
        assert_eq!(s.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn reading_beyond_the_end_fails() {
        let mut s = stream(8);
        s.seek(SeekFrom::Start(9)).unwrap();
        assert!(s.read(&mut [0u8; 1]).is_err());
        assert!(s.seek(SeekFrom::Current(-10)).is_err());
    }

    #[test]
    fn writes_do_not_extend() {
        let mut s = stream(8);
        s.seek(SeekFrom::Start(4)).unwrap();
        let err = s.write(b"12345").unwrap_err();
        let inner = err.get_ref().and_then(|e| e.downcast_ref::<DiskError>());
        assert!(matches!(inner, Some(DiskError::IllegalWrite(_))));
        assert_eq!(s.len(), 8);
        assert!(matches!(
            s.set_len(16).unwrap_err(),
            DiskError::NotSupported(_)
        ));

        s.write_all(b"1234").unwrap();
        s.rewind().unwrap();
        let mut out = Vec::new();
        s.read_to_end(&mut out).unwrap();
        assert_eq!(&out, b"\0\0\0\01234");
    }
}
