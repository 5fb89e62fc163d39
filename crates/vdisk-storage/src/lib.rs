//! Sparse virtual-disk extents and differencing-disk chains.
//!
//! Sparse extents address their content through two levels of indirection (grain directory →
//! grain table → grain) and only store the grains that have been written. A differencing layer
//! is a sparse extent whose unwritten grains read through to a parent. This crate provides:
//!
//! - [`VirtualDisk`]: byte-addressed, fixed-capacity disk interface
//! - [`HostedExtent`] / [`ServerExtent`]: the two sparse extent variants over a shared
//!   [`SparseExtent`] engine
//! - [`FlatDisk`], [`ZeroDisk`], [`ConcatDisk`]: the non-sparse extents and multi-extent layers
//! - [`LayerChain`]: resolves a child's parents and composes them into one disk
//! - [`DiskStream`]: `Read`/`Write`/`Seek` cursor with fixed-length EOF semantics
//!
//! Everything is single-threaded and blocking; extents read and write through a
//! [`StorageBackend`].

mod backend;
mod chain;
mod concat;
mod descriptor;
mod disk;
mod error;
mod extents;
mod formats;
mod parent;
pub mod sparse;
mod stream;
mod util;

pub use backend::{MemBackend, StdFileBackend, StorageBackend};
pub use chain::{ChainOptions, DescriptorSource, Layer, LayerChain};
pub use concat::ConcatDisk;
pub use descriptor::{
    Descriptor, ExtentAccess, ExtentKind, ExtentRecord, CID_NO_PARENT,
};
pub use disk::{Access, FlatDisk, VirtualDisk, ZeroDisk, SECTOR_SIZE};
pub use error::{DiskError, Result};
pub use extents::{ExtentSet, StreamExtent};
pub use formats::{detect_format, ExtentFormat, SparseImage};
pub use parent::{share, share_boxed, Ownership, ParentLink, SharedDisk, WindowDisk};
pub use sparse::{
    DirectoryChoice, HostedConfig, HostedExtent, OpenOptions, ServerConfig, ServerExtent,
    SparseExtent,
};
pub use stream::DiskStream;

#[cfg(test)]
mod proptests;
