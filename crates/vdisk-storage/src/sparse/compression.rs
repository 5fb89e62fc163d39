//! Per-grain compression for hosted extents.
//!
//! A compressed grain is stored as a [`CompressedGrainHeader`] followed by a zlib stream. The
//! zlib header is checked by hand and the body is inflated as raw deflate.

use std::io::{self, Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::util::{le_u32, le_u64};
use crate::{DiskError, Result};

pub const COMPRESSED_GRAIN_HEADER_SIZE: usize = 12;

const ZLIB_METHOD_DEFLATE: u8 = 8;
const ZLIB_FLAG_PRESET_DICTIONARY: u8 = 0x20;

/// Prefix of a compressed grain: the grain's logical sector and the payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressedGrainHeader {
    pub lba: u64,
    pub data_size: u32,
}

impl CompressedGrainHeader {
    pub fn parse(raw: &[u8; COMPRESSED_GRAIN_HEADER_SIZE]) -> Self {
        Self {
            lba: le_u64(&raw[0..8]),
            data_size: le_u32(&raw[8..12]),
        }
    }

    pub fn to_bytes(&self) -> [u8; COMPRESSED_GRAIN_HEADER_SIZE] {
        let mut raw = [0u8; COMPRESSED_GRAIN_HEADER_SIZE];
        raw[0..8].copy_from_slice(&self.lba.to_le_bytes());
        raw[8..12].copy_from_slice(&self.data_size.to_le_bytes());
        raw
    }
}

/// Check the 2-byte zlib header: deflate method, window ≤ 32 KiB, valid check bits and no
/// preset dictionary.
pub fn validate_zlib_header(payload: &[u8]) -> Result<()> {
    if payload.len() < 2 {
        return Err(DiskError::CorruptGrain("compressed payload too short"));
    }
    let (cmf, flg) = (payload[0], payload[1]);
    if cmf & 0x0f != ZLIB_METHOD_DEFLATE {
        return Err(DiskError::UnsupportedFeature("compressed grain is not deflate"));
    }
    if cmf >> 4 > 7 {
        return Err(DiskError::CorruptGrain("zlib window size out of range"));
    }
    if (u16::from(cmf) << 8 | u16::from(flg)) % 31 != 0 {
        return Err(DiskError::CorruptGrain("zlib header check bits mismatch"));
    }
    if flg & ZLIB_FLAG_PRESET_DICTIONARY != 0 {
        return Err(DiskError::UnsupportedFeature(
            "compressed grain uses a preset dictionary",
        ));
    }
    Ok(())
}

fn map_inflate_error(err: io::Error) -> DiskError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof => {
            DiskError::CorruptGrain("compressed grain shorter than requested range")
        }
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => {
            DiskError::CorruptGrain("invalid deflate stream")
        }
        _ => DiskError::Io(err),
    }
}

/// Inflate `out.len()` bytes starting `within` bytes into the grain.
///
/// There is no random access inside a deflate stream; the decoder discards everything in front
/// of `within`.
pub fn inflate_grain_range(payload: &[u8], within: u64, out: &mut [u8]) -> Result<()> {
    validate_zlib_header(payload)?;
    let mut decoder = DeflateDecoder::new(&payload[2..]);
    let skipped = io::copy(&mut (&mut decoder).take(within), &mut io::sink())
        .map_err(map_inflate_error)?;
    if skipped != within {
        return Err(DiskError::CorruptGrain(
            "compressed grain shorter than requested range",
        ));
    }
    decoder.read_exact(out).map_err(map_inflate_error)
}

/// Inflate a whole grain. A stream that ends early (the last grain of a disk whose capacity is
/// not grain aligned) is padded with zeros.
pub fn inflate_grain(payload: &[u8], grain_bytes: usize) -> Result<Vec<u8>> {
    validate_zlib_header(payload)?;
    let mut out = Vec::with_capacity(grain_bytes);
    DeflateDecoder::new(&payload[2..])
        .take(grain_bytes as u64)
        .read_to_end(&mut out)
        .map_err(map_inflate_error)?;
    out.resize(grain_bytes, 0);
    Ok(out)
}

/// Encode `data` as a compressed grain (header + zlib stream) for logical sector `lba`.
pub fn encode_compressed_grain(lba: u64, data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    let payload = encoder.finish()?;
    let data_size: u32 = payload
        .len()
        .try_into()
        .map_err(|_| DiskError::UnsupportedFeature("compressed grain too large"))?;

    let mut out = Vec::with_capacity(COMPRESSED_GRAIN_HEADER_SIZE + payload.len());
    out.extend_from_slice(&CompressedGrainHeader { lba, data_size }.to_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}
