//! Pointer records.
//!
//! A pointer is the small text file that stands in for a large artifact in
//! ordinary revision control. It names the artifact by path and by the
//! [`ContentId`] of its bytes:
//!
//! ```text
//! format-version: 1
//! path: data/transacoes.csv
//! hash: blake3:af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262
//! size: 1048576
//! ```
//!
//! Encoding is stable, the same record always produces the same bytes, so
//! re-adding unchanged content never shows up as a diff. Unknown keys are
//! ignored on read, which lets newer writers add optional fields.

use std::error::Error;
use std::ffi::OsString;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::hash::{Blake3, ContentId, HashProtocol, ParseIdError};

/// The format version written by this implementation.
pub const FORMAT_VERSION: u32 = 1;

/// Extension appended to a tracked path to name its pointer file.
pub const POINTER_EXTENSION: &str = "ptr";

/// One tracked path at one point in history.
pub struct PointerRecord<H: HashProtocol = Blake3> {
    /// Workspace-relative path of the artifact.
    pub path: PathBuf,
    pub id: ContentId<H>,
    pub size: u64,
    pub format_version: u32,
}

impl<H: HashProtocol> PointerRecord<H> {
    pub fn new(path: impl Into<PathBuf>, id: ContentId<H>, size: u64) -> Self {
        Self {
            path: path.into(),
            id,
            size,
            format_version: FORMAT_VERSION,
        }
    }

    /// Where the pointer file for this record lives, relative to the
    /// workspace root.
    pub fn pointer_path(&self) -> PathBuf {
        pointer_path(&self.path)
    }
}

impl<H: HashProtocol> Clone for PointerRecord<H> {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            id: self.id,
            size: self.size,
            format_version: self.format_version,
        }
    }
}

impl<H: HashProtocol> PartialEq for PointerRecord<H> {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
            && self.id == other.id
            && self.size == other.size
            && self.format_version == other.format_version
    }
}

impl<H: HashProtocol> Eq for PointerRecord<H> {}

impl<H: HashProtocol> fmt::Debug for PointerRecord<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PointerRecord")
            .field("path", &self.path)
            .field("id", &self.id)
            .field("size", &self.size)
            .field("format_version", &self.format_version)
            .finish()
    }
}

impl<H: HashProtocol> Serialize for PointerRecord<H> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        PointerFile::from_record(self).serialize(serializer)
    }
}

/// The on-disk shape. Field order is the key order of the encoding.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct PointerFile {
    format_version: u32,
    path: String,
    hash: String,
    size: u64,
}

impl PointerFile {
    fn from_record<H: HashProtocol>(record: &PointerRecord<H>) -> Self {
        PointerFile {
            format_version: record.format_version,
            path: portable_path(&record.path),
            hash: record.id.to_string(),
            size: record.size,
        }
    }
}

#[derive(Debug)]
pub enum PointerError {
    /// The text is not a mapping with the required keys.
    Syntax(serde_yaml::Error),
    /// The `hash` value is not a digest of the expected protocol.
    Hash(ParseIdError),
    /// The `path` value is empty, absolute or escapes the workspace.
    Path(String),
    /// The `format-version` value is not a supported version.
    Version(u32),
}

impl fmt::Display for PointerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointerError::Syntax(e) => write!(f, "malformed pointer: {e}"),
            PointerError::Hash(e) => write!(f, "malformed pointer hash: {e}"),
            PointerError::Path(p) => write!(f, "malformed pointer path: {p:?}"),
            PointerError::Version(v) => write!(f, "unsupported pointer format version {v}"),
        }
    }
}

impl Error for PointerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PointerError::Syntax(e) => Some(e),
            PointerError::Hash(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_yaml::Error> for PointerError {
    fn from(err: serde_yaml::Error) -> Self {
        PointerError::Syntax(err)
    }
}

impl From<ParseIdError> for PointerError {
    fn from(err: ParseIdError) -> Self {
        PointerError::Hash(err)
    }
}

pub fn encode<H: HashProtocol>(record: &PointerRecord<H>) -> Result<Vec<u8>, PointerError> {
    Ok(serde_yaml::to_string(&PointerFile::from_record(record))?.into_bytes())
}

pub fn decode<H: HashProtocol>(bytes: &[u8]) -> Result<PointerRecord<H>, PointerError> {
    let file: PointerFile = serde_yaml::from_slice(bytes)?;
    if file.format_version == 0 {
        return Err(PointerError::Version(file.format_version));
    }
    let path = parse_path(&file.path)?;
    let id = file.hash.parse::<ContentId<H>>()?;
    Ok(PointerRecord {
        path,
        id,
        size: file.size,
        format_version: file.format_version,
    })
}

/// The pointer file path for a tracked path: `data/x.csv` → `data/x.csv.ptr`.
pub fn pointer_path(tracked: &Path) -> PathBuf {
    let mut name: OsString = tracked.as_os_str().to_owned();
    name.push(".");
    name.push(POINTER_EXTENSION);
    PathBuf::from(name)
}

/// Whether `path` carries the pointer file extension.
pub fn is_pointer_name(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == POINTER_EXTENSION)
}

/// The tracked path a pointer file stands for, if `pointer` is one. Pointer
/// files never stand for other pointer files.
pub fn tracked_path(pointer: &Path) -> Option<PathBuf> {
    if !is_pointer_name(pointer) {
        return None;
    }
    let tracked = pointer.with_extension("");
    (tracked.file_name().is_some() && !is_pointer_name(&tracked)).then_some(tracked)
}

fn portable_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn parse_path(text: &str) -> Result<PathBuf, PointerError> {
    if text.is_empty() || text.starts_with('/') {
        return Err(PointerError::Path(text.to_owned()));
    }
    let mut path = PathBuf::new();
    for part in text.split('/') {
        if part.is_empty() || part == "." || part == ".." {
            return Err(PointerError::Path(text.to_owned()));
        }
        path.push(part);
    }
    if !path
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        return Err(PointerError::Path(text.to_owned()));
    }
    Ok(path)
}
