//! Text descriptor: the small key/value file that names a layer's extents and its parent.
//!
//! ```text
//! # Disk DescriptorFile
//! version=1
//! CID=a1b2c3d4
//! parentCID=ffffffff
//! createType="monolithicSparse"
//!
//! RW 2048 SPARSE "disk.vmdk"
//!
//! ddb.virtualHWVersion = "4"
//! ```
//!
//! Only the fields the layer chain consumes are interpreted; other header keys and `ddb.*`
//! entries are kept verbatim and written back out.

use std::fmt;
use std::str::FromStr;

use crate::{DiskError, Result};

/// `parentCID` value of a layer without a parent.
pub const CID_NO_PARENT: u32 = 0xffff_ffff;

const HEADER_LINE: &str = "# Disk DescriptorFile";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentAccess {
    ReadWrite,
    ReadOnly,
    NoAccess,
}

impl ExtentAccess {
    fn keyword(self) -> &'static str {
        match self {
            Self::ReadWrite => "RW",
            Self::ReadOnly => "RDONLY",
            Self::NoAccess => "NOACCESS",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentKind {
    /// Hosted sparse extent.
    Sparse,
    /// Server sparse extent.
    VmfsSparse,
    Flat,
    Vmfs,
    Zero,
}

impl ExtentKind {
    fn keyword(self) -> &'static str {
        match self {
            Self::Sparse => "SPARSE",
            Self::VmfsSparse => "VMFSSPARSE",
            Self::Flat => "FLAT",
            Self::Vmfs => "VMFS",
            Self::Zero => "ZERO",
        }
    }

    pub fn is_sparse(self) -> bool {
        matches!(self, Self::Sparse | Self::VmfsSparse)
    }
}

/// One extent line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtentRecord {
    pub access: ExtentAccess,
    pub size_sectors: u64,
    pub kind: ExtentKind,
    /// Absent for `ZERO` extents.
    pub file_name: Option<String>,
    /// Start of the data inside a flat file.
    pub offset_sectors: u64,
}

impl ExtentRecord {
    pub fn new(kind: ExtentKind, size_sectors: u64, file_name: Option<&str>) -> Self {
        Self {
            access: ExtentAccess::ReadWrite,
            size_sectors,
            kind,
            file_name: file_name.map(str::to_string),
            offset_sectors: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub version: u32,
    pub content_id: u32,
    pub parent_content_id: u32,
    pub create_type: String,
    pub parent_file_name_hint: Option<String>,
    pub extents: Vec<ExtentRecord>,
    /// Header keys this crate does not interpret, in file order.
    pub extra: Vec<(String, String)>,
    pub ddb: Vec<(String, String)>,
}

impl Descriptor {
    pub fn new(create_type: impl Into<String>, content_id: u32) -> Self {
        Self {
            version: 1,
            content_id,
            parent_content_id: CID_NO_PARENT,
            create_type: create_type.into(),
            parent_file_name_hint: None,
            extents: Vec::new(),
            extra: Vec::new(),
            ddb: Vec::new(),
        }
    }

    pub fn with_parent(mut self, parent_content_id: u32, hint: impl Into<String>) -> Self {
        self.parent_content_id = parent_content_id;
        self.parent_file_name_hint = Some(hint.into());
        self
    }

    pub fn with_extent(mut self, extent: ExtentRecord) -> Self {
        self.extents.push(extent);
        self
    }

    pub fn needs_parent(&self) -> bool {
        self.parent_content_id != CID_NO_PARENT || self.parent_file_name_hint.is_some()
    }

    pub fn capacity_sectors(&self) -> u64 {
        self.extents.iter().map(|e| e.size_sectors).sum()
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut descriptor = Self::new(String::new(), CID_NO_PARENT);
        let mut saw_version = false;

        for (idx, raw_line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.trim().trim_end_matches('\0');
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(extent) = parse_extent_line(line, line_no)? {
                descriptor.extents.push(extent);
                continue;
            }

            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| malformed(line_no, "expected `key=value` or an extent line"))?;
            let key = key.trim();
            let value = unquote(value.trim());
            match key {
                "version" => {
                    descriptor.version = value
                        .parse()
                        .map_err(|_| malformed(line_no, "version is not a number"))?;
                    saw_version = true;
                }
                "CID" => descriptor.content_id = parse_cid(value, line_no)?,
                "parentCID" => descriptor.parent_content_id = parse_cid(value, line_no)?,
                "createType" => descriptor.create_type = value.to_string(),
                "parentFileNameHint" => {
                    descriptor.parent_file_name_hint = Some(value.to_string());
                }
                _ if key.starts_with("ddb.") => {
                    descriptor.ddb.push((key.to_string(), value.to_string()));
                }
                _ => descriptor.extra.push((key.to_string(), value.to_string())),
            }
        }

        if !saw_version {
            return Err(malformed(0, "missing version"));
        }
        if descriptor.extents.is_empty() {
            return Err(malformed(0, "descriptor names no extents"));
        }
        Ok(descriptor)
    }

    pub fn to_text(&self) -> String {
        self.to_string()
    }
}

impl FromStr for Descriptor {
    type Err = DiskError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{HEADER_LINE}")?;
        writeln!(f, "version={}", self.version)?;
        writeln!(f, "CID={:08x}", self.content_id)?;
        writeln!(f, "parentCID={:08x}", self.parent_content_id)?;
        writeln!(f, "createType=\"{}\"", self.create_type)?;
        if let Some(hint) = &self.parent_file_name_hint {
            writeln!(f, "parentFileNameHint=\"{hint}\"")?;
        }
        for (key, value) in &self.extra {
            writeln!(f, "{key}=\"{value}\"")?;
        }

        writeln!(f)?;
        writeln!(f, "# Extent description")?;
        for extent in &self.extents {
            write!(
                f,
                "{} {} {}",
                extent.access.keyword(),
                extent.size_sectors,
                extent.kind.keyword()
            )?;
            if let Some(name) = &extent.file_name {
                write!(f, " \"{name}\"")?;
                if extent.offset_sectors != 0 {
                    write!(f, " {}", extent.offset_sectors)?;
                }
            }
            writeln!(f)?;
        }

        if !self.ddb.is_empty() {
            writeln!(f)?;
            writeln!(f, "# The Disk Data Base")?;
            writeln!(f, "#DDB")?;
            writeln!(f)?;
            for (key, value) in &self.ddb {
                writeln!(f, "{key} = \"{value}\"")?;
            }
        }
        Ok(())
    }
}

fn malformed(line: usize, reason: &str) -> DiskError {
    DiskError::MalformedDescriptor {
        line,
        reason: reason.to_string(),
    }
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn parse_cid(value: &str, line: usize) -> Result<u32> {
    u32::from_str_radix(value, 16).map_err(|_| malformed(line, "content id is not hexadecimal"))
}

/// Parse `<access> <sectors> <type> ["<file>" [offset]]`, or `None` if the line is not an
/// extent line.
fn parse_extent_line(line: &str, line_no: usize) -> Result<Option<ExtentRecord>> {
    let (first, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let access = match first {
        "RW" => ExtentAccess::ReadWrite,
        "RDONLY" => ExtentAccess::ReadOnly,
        "NOACCESS" => ExtentAccess::NoAccess,
        _ => return Ok(None),
    };

    let mut rest = rest.trim_start();
    let (size, tail) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    let size_sectors = size
        .parse()
        .map_err(|_| malformed(line_no, "extent size is not a number"))?;
    rest = tail.trim_start();

    let (kind, tail) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    let kind = match kind {
        "SPARSE" => ExtentKind::Sparse,
        "VMFSSPARSE" => ExtentKind::VmfsSparse,
        "FLAT" => ExtentKind::Flat,
        "VMFS" => ExtentKind::Vmfs,
        "ZERO" => ExtentKind::Zero,
        "" => return Err(malformed(line_no, "extent line has no type")),
        _ => {
            return Err(DiskError::UnsupportedFeature("unknown extent type"));
        }
    };
    rest = tail.trim_start();

    let mut file_name = None;
    let mut offset_sectors = 0;
    if let Some(quoted) = rest.strip_prefix('"') {
        let end = quoted
            .find('"')
            .ok_or_else(|| malformed(line_no, "unterminated extent file name"))?;
        file_name = Some(quoted[..end].to_string());
        let tail = quoted[end + 1..].trim();
        if !tail.is_empty() {
            offset_sectors = tail
                .parse()
                .map_err(|_| malformed(line_no, "extent offset is not a number"))?;
        }
    } else if !rest.is_empty() {
        return Err(malformed(line_no, "extent file name must be quoted"));
    }

    if kind != ExtentKind::Zero && file_name.is_none() {
        return Err(malformed(line_no, "extent has no file name"));
    }

    Ok(Some(ExtentRecord {
        access,
        size_sectors,
        kind,
        file_name,
        offset_sectors,
    }))
}
