use crate::sparse::{HostedExtent, OpenOptions, ServerExtent};
use crate::{DiskError, ParentLink, Result, StorageBackend, StreamExtent, VirtualDisk};

const HOSTED_MAGIC: [u8; 4] = *b"KDMV";
const SERVER_MAGIC: [u8; 4] = *b"COWD";

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExtentFormat {
    Hosted,
    Server,
    /// Neither sparse magic; usually a flat extent or a text descriptor.
    Unknown,
}

/// Detect the sparse extent variant from its magic.
pub fn detect_format<B: StorageBackend>(backend: &mut B) -> Result<ExtentFormat> {
    if backend.len()? < 4 {
        return Ok(ExtentFormat::Unknown);
    }
    let mut magic = [0u8; 4];
    backend.read_at(0, &mut magic)?;
    Ok(match magic {
        HOSTED_MAGIC => ExtentFormat::Hosted,
        SERVER_MAGIC => ExtentFormat::Server,
        _ => ExtentFormat::Unknown,
    })
}

/// Either sparse variant, opened from a single backend.
pub enum SparseImage<B> {
    Hosted(Box<HostedExtent<B>>),
    Server(Box<ServerExtent<B>>),
}

impl<B: StorageBackend> SparseImage<B> {
    pub fn format(&self) -> ExtentFormat {
        match self {
            Self::Hosted(_) => ExtentFormat::Hosted,
            Self::Server(_) => ExtentFormat::Server,
        }
    }

    pub fn open_with_format(
        format: ExtentFormat,
        backend: B,
        options: &OpenOptions,
        parent: Option<ParentLink>,
    ) -> Result<Self> {
        match format {
            ExtentFormat::Hosted => Ok(Self::Hosted(Box::new(HostedExtent::open(
                backend, options, parent,
            )?))),
            ExtentFormat::Server => Ok(Self::Server(Box::new(ServerExtent::open(
                backend, options, parent,
            )?))),
            ExtentFormat::Unknown => Err(DiskError::MalformedHeader(
                "not a sparse extent: unrecognized magic",
            )),
        }
    }

    pub fn open_auto(mut backend: B, options: &OpenOptions, parent: Option<ParentLink>) -> Result<Self> {
        let format = detect_format(&mut backend)?;
        Self::open_with_format(format, backend, options, parent)
    }

    pub fn into_backend(self) -> B {
        match self {
            Self::Hosted(d) => d.into_backend(),
            Self::Server(d) => d.into_backend(),
        }
    }
}

impl<B: StorageBackend> VirtualDisk for SparseImage<B> {
    fn capacity_bytes(&self) -> u64 {
        match self {
            Self::Hosted(d) => d.capacity_bytes(),
            Self::Server(d) => d.capacity_bytes(),
        }
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self {
            Self::Hosted(d) => d.read_at(offset, buf),
            Self::Server(d) => d.read_at(offset, buf),
        }
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        match self {
            Self::Hosted(d) => d.write_at(offset, buf),
            Self::Server(d) => d.write_at(offset, buf),
        }
    }

    fn flush(&mut self) -> Result<()> {
        match self {
            Self::Hosted(d) => d.flush(),
            Self::Server(d) => d.flush(),
        }
    }

    fn extents_in_range(&mut self, start: u64, length: u64) -> Result<Vec<StreamExtent>> {
        match self {
            Self::Hosted(d) => d.extents_in_range(start, length),
            Self::Server(d) => d.extents_in_range(start, length),
        }
    }

    fn close(&mut self) -> Result<()> {
        match self {
            Self::Hosted(d) => d.close(),
            Self::Server(d) => d.close(),
        }
    }
}
