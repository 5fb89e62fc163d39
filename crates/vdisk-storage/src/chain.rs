//! Differencing-disk chains.
//!
//! A layer is a descriptor plus the extent files it names. A child layer stores only the grains
//! written through it and falls back to its parent for everything else; resolving a chain walks
//! `parentFileNameHint` links from the child down to a layer that needs no parent, and composing
//! it opens the layers bottom-up so each one reads through the one beneath.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::descriptor::{
    Descriptor, ExtentAccess, ExtentKind, ExtentRecord, CID_NO_PARENT,
};
use crate::formats::{detect_format, ExtentFormat, SparseImage};
use crate::parent::{share_boxed, WindowDisk};
use crate::sparse::{DirectoryChoice, HostedHeader, OpenOptions, ServerHeader};
use crate::util::sectors_to_bytes;
use crate::{
    Access, ConcatDisk, DiskError, DiskStream, FlatDisk, Ownership, ParentLink, Result,
    StdFileBackend, StorageBackend, VirtualDisk, ZeroDisk,
};

// Standalone descriptors are small text files.
const MAX_DESCRIPTOR_FILE_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainOptions {
    /// Access for the top layer. Every layer beneath it is opened read-only.
    pub access: Access,
    /// Require each child's `parentCID` to equal its parent's `CID`.
    pub verify_content_ids: bool,
    pub max_depth: usize,
    pub compressed_grain_cache: usize,
}

impl Default for ChainOptions {
    fn default() -> Self {
        Self {
            access: Access::ReadWrite,
            verify_content_ids: true,
            max_depth: 64,
            compressed_grain_cache: OpenOptions::default().compressed_grain_cache,
        }
    }
}

impl ChainOptions {
    pub fn read_only() -> Self {
        Self {
            access: Access::ReadOnly,
            ..Self::default()
        }
    }

    pub fn with_access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    pub fn with_content_id_check(mut self, verify: bool) -> Self {
        self.verify_content_ids = verify;
        self
    }

    fn open_options(&self, access: Access) -> OpenOptions {
        OpenOptions {
            access,
            directory: DirectoryChoice::Primary,
            compressed_grain_cache: self.compressed_grain_cache,
        }
    }
}

/// Where a layer's descriptor came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorSource {
    /// A standalone text file naming separate extent files.
    File,
    /// The descriptor area of a hosted sparse extent.
    Embedded,
    /// A bare sparse extent without any descriptor; it cannot declare a parent.
    Synthesized,
}

/// One layer of a chain.
#[derive(Debug, Clone)]
pub struct Layer {
    path: PathBuf,
    descriptor: Descriptor,
    source: DescriptorSource,
}

impl Layer {
    /// Open the layer at `path`: a standalone descriptor, a hosted extent (with or without an
    /// embedded descriptor) or a server extent.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut backend = StdFileBackend::open_read_only(&path)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let (descriptor, source) = match detect_format(&mut backend)? {
            ExtentFormat::Hosted => {
                let header = HostedHeader::read_from(&mut backend)?;
                match header.read_descriptor(&mut backend)? {
                    Some(text) => (Descriptor::parse(&text)?, DescriptorSource::Embedded),
                    None => (
                        synthesized(ExtentKind::Sparse, header.capacity_sectors, &file_name),
                        DescriptorSource::Synthesized,
                    ),
                }
            }
            ExtentFormat::Server => {
                let header = ServerHeader::read_from(&mut backend)?;
                (
                    synthesized(
                        ExtentKind::VmfsSparse,
                        u64::from(header.capacity_sectors()),
                        &file_name,
                    ),
                    DescriptorSource::Synthesized,
                )
            }
            ExtentFormat::Unknown => {
                let len = backend.len()?;
                if len > MAX_DESCRIPTOR_FILE_BYTES {
                    return Err(DiskError::UnsupportedFeature(
                        "file is neither a sparse extent nor a descriptor",
                    ));
                }
                let mut raw = vec![0u8; len as usize];
                backend.read_at(0, &mut raw)?;
                let text = String::from_utf8(raw).map_err(|_| DiskError::MalformedDescriptor {
                    line: 0,
                    reason: "descriptor is not valid UTF-8".to_string(),
                })?;
                (Descriptor::parse(&text)?, DescriptorSource::File)
            }
        };

        tracing::debug!(path = %path.display(), ?source, "opened layer");
        Ok(Self {
            path,
            descriptor,
            source,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn source(&self) -> DescriptorSource {
        self.source
    }

    pub fn needs_parent(&self) -> bool {
        self.descriptor.needs_parent()
    }

    /// The layer's content id, unless the descriptor was synthesized.
    pub fn content_id(&self) -> Option<u32> {
        match self.source {
            DescriptorSource::Synthesized => None,
            _ => Some(self.descriptor.content_id),
        }
    }

    pub fn capacity_bytes(&self) -> Result<u64> {
        sectors_to_bytes(self.descriptor.capacity_sectors())
    }

    fn directory(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new(""))
    }

    /// Places the parent may live, most specific first: the hint as written (relative to this
    /// layer's directory unless absolute), then its bare file name next to this layer.
    pub fn parent_candidates(&self) -> Vec<PathBuf> {
        let Some(hint) = &self.descriptor.parent_file_name_hint else {
            return Vec::new();
        };
        let normalized = hint.replace('\\', "/");
        let mut candidates = vec![self.directory().join(&normalized)];
        if let Some(base) = normalized.rsplit('/').next().filter(|b| !b.is_empty()) {
            candidates.push(self.directory().join(base));
        }
        candidates.dedup();
        candidates
    }

    fn extent_path(&self, record: &ExtentRecord) -> Result<PathBuf> {
        match self.source {
            // An embedded descriptor always describes the file that carries it.
            DescriptorSource::Embedded | DescriptorSource::Synthesized => Ok(self.path.clone()),
            DescriptorSource::File => record
                .file_name
                .as_deref()
                .map(|name| self.directory().join(name))
                .ok_or(DiskError::MalformedDescriptor {
                    line: 0,
                    reason: "extent has no file name".to_string(),
                }),
        }
    }

    /// Open this layer's content on top of `parent`.
    pub fn open_disk(
        &self,
        access: Access,
        parent: Option<Box<dyn VirtualDisk>>,
        options: &ChainOptions,
    ) -> Result<Box<dyn VirtualDisk>> {
        let extents = &self.descriptor.extents;
        if extents.iter().any(|e| e.access == ExtentAccess::NoAccess) {
            return Err(DiskError::UnsupportedFeature("layer has a NOACCESS extent"));
        }

        if let [record] = extents.as_slice() {
            let link = parent.map(ParentLink::owned_boxed);
            return self.open_extent(record, access, link, options);
        }

        // Every extent reads the shared parent through a window at its own offset; the
        // concatenation owns the parent and closes it after the extents.
        let shared = parent.map(share_boxed);
        let mut disks = Vec::with_capacity(extents.len());
        let mut offset = 0u64;
        for record in extents {
            let len = sectors_to_bytes(record.size_sectors)?;
            let link = shared
                .as_ref()
                .map(|disk| ParentLink::owned(WindowDisk::new(disk.clone(), offset, len)));
            disks.push(self.open_extent(record, access, link, options)?);
            offset = offset.checked_add(len).ok_or(DiskError::OffsetOverflow)?;
        }
        let owner = shared.map(|disk| ParentLink::shared(disk, Ownership::Owned));
        Ok(Box::new(ConcatDisk::new(disks, owner)?))
    }

    fn open_extent(
        &self,
        record: &ExtentRecord,
        access: Access,
        parent: Option<ParentLink>,
        options: &ChainOptions,
    ) -> Result<Box<dyn VirtualDisk>> {
        let access = match record.access {
            ExtentAccess::ReadOnly => Access::ReadOnly,
            _ => access,
        };
        let size = sectors_to_bytes(record.size_sectors)?;

        match record.kind {
            ExtentKind::Zero => Ok(Box::new(ZeroDisk::new(size))),
            ExtentKind::Flat | ExtentKind::Vmfs => {
                let backend = open_backend(&self.extent_path(record)?, access)?;
                let offset = sectors_to_bytes(record.offset_sectors)?;
                Ok(Box::new(FlatDisk::open(backend, offset, size, access)?))
            }
            ExtentKind::Sparse | ExtentKind::VmfsSparse => {
                let mut backend = open_backend(&self.extent_path(record)?, access)?;
                let expected = match record.kind {
                    ExtentKind::Sparse => ExtentFormat::Hosted,
                    _ => ExtentFormat::Server,
                };
                if detect_format(&mut backend)? != expected {
                    return Err(DiskError::MalformedHeader(
                        "extent file does not match its declared type",
                    ));
                }
                let image = SparseImage::open_with_format(
                    expected,
                    backend,
                    &options.open_options(access),
                    parent,
                )?;
                if image.capacity_bytes() != size {
                    return Err(DiskError::UnsupportedFeature(
                        "extent size differs from its header capacity",
                    ));
                }
                Ok(Box::new(image))
            }
        }
    }
}

fn synthesized(kind: ExtentKind, capacity_sectors: u64, file_name: &str) -> Descriptor {
    let create_type = match kind {
        ExtentKind::VmfsSparse => "vmfsSparse",
        _ => "monolithicSparse",
    };
    Descriptor::new(create_type, CID_NO_PARENT).with_extent(ExtentRecord::new(
        kind,
        capacity_sectors,
        Some(file_name),
    ))
}

fn open_backend(path: &Path, access: Access) -> Result<StdFileBackend> {
    match access {
        Access::ReadWrite => StdFileBackend::open(path),
        Access::ReadOnly => StdFileBackend::open_read_only(path),
    }
}

/// An ordered stack of layers, child first.
#[derive(Debug, Clone)]
pub struct LayerChain {
    layers: Vec<Layer>,
    options: ChainOptions,
}

impl LayerChain {
    /// Open `path` and follow parent links until a layer needs no parent.
    pub fn resolve(path: impl AsRef<Path>, options: ChainOptions) -> Result<Self> {
        let top = Layer::open(path)?;
        let mut seen = HashSet::new();
        seen.insert(identity(top.path()));
        let mut layers = vec![top];

        loop {
            let child = &layers[layers.len() - 1];
            if !child.needs_parent() {
                break;
            }
            if layers.len() >= options.max_depth {
                return Err(DiskError::UnsupportedFeature("layer chain too deep"));
            }

            let candidates = child.parent_candidates();
            let Some(found) = candidates.iter().find(|c| c.is_file()).cloned() else {
                return Err(DiskError::MissingParent {
                    child: child.path().to_path_buf(),
                    candidates,
                });
            };
            if !seen.insert(identity(&found)) {
                return Err(DiskError::UnsupportedFeature("layer chain contains a cycle"));
            }

            let parent = Layer::open(&found)?;
            if options.verify_content_ids {
                let expected = child.descriptor().parent_content_id;
                if let Some(actual) = parent.content_id() {
                    if expected != CID_NO_PARENT && expected != actual {
                        return Err(DiskError::ParentMismatch { expected, actual });
                    }
                }
            }
            tracing::debug!(
                child = %child.path().display(),
                parent = %found.display(),
                "resolved parent layer"
            );
            layers.push(parent);
        }

        Ok(Self { layers, options })
    }

    /// Layers from the child (index 0) to the base.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn top(&self) -> &Layer {
        &self.layers[0]
    }

    pub fn base(&self) -> &Layer {
        &self.layers[self.layers.len() - 1]
    }

    pub fn options(&self) -> &ChainOptions {
        &self.options
    }

    /// Compose the chain into one disk: the base is opened first, each layer above it reads
    /// through the one beneath and owns it.
    pub fn open_content(&self) -> Result<Box<dyn VirtualDisk>> {
        let mut below: Option<Box<dyn VirtualDisk>> = None;
        for (depth, layer) in self.layers.iter().enumerate().rev() {
            let access = if depth == 0 {
                self.options.access
            } else {
                Access::ReadOnly
            };
            below = Some(layer.open_disk(access, below.take(), &self.options)?);
        }
        below.ok_or(DiskError::InvalidConfig("layer chain is empty"))
    }

    pub fn open_stream(&self) -> Result<DiskStream<Box<dyn VirtualDisk>>> {
        Ok(DiskStream::new(self.open_content()?))
    }
}

fn identity(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
