use crate::{DiskError, Result, StorageBackend};

pub fn align_up_u64(value: u64, alignment: u64) -> Result<u64> {
    if alignment == 0 {
        return Err(DiskError::OffsetOverflow);
    }
    let rem = value % alignment;
    if rem == 0 {
        return Ok(value);
    }
    value
        .checked_add(alignment - rem)
        .ok_or(DiskError::OffsetOverflow)
}

pub fn div_ceil_u64(n: u64, d: u64) -> Result<u64> {
    if d == 0 {
        return Err(DiskError::OffsetOverflow);
    }
    Ok(n.div_ceil(d))
}

pub fn checked_range(offset: u64, len: usize, capacity: u64) -> Result<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or(DiskError::OffsetOverflow)?;
    if end > capacity {
        return Err(DiskError::OutOfBounds {
            offset,
            len,
            capacity,
        });
    }
    Ok(())
}

/// Same as [`checked_range`] but reported as a write outside the fixed disk length.
pub fn checked_write_range(offset: u64, len: usize, capacity: u64) -> Result<()> {
    match checked_range(offset, len, capacity) {
        Err(DiskError::OutOfBounds { .. }) => {
            Err(DiskError::IllegalWrite("write extends beyond the end of the disk"))
        }
        other => other,
    }
}

pub fn sectors_to_bytes(sectors: u64) -> Result<u64> {
    sectors
        .checked_mul(crate::SECTOR_SIZE as u64)
        .ok_or(DiskError::OffsetOverflow)
}

pub fn le_u16(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

pub fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

pub fn le_u64(bytes: &[u8]) -> u64 {
    u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

pub fn write_zeroes<B: StorageBackend + ?Sized>(
    backend: &mut B,
    mut offset: u64,
    mut len: u64,
) -> Result<()> {
    const CHUNK: usize = 64 * 1024;
    let buf = [0u8; CHUNK];
    while len > 0 {
        let to_write = (len as usize).min(CHUNK);
        backend.write_at(offset, &buf[..to_write])?;
        offset = offset
            .checked_add(to_write as u64)
            .ok_or(DiskError::OffsetOverflow)?;
        len -= to_write as u64;
    }
    Ok(())
}
