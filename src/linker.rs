//! Placing artifact files into the working tree.
//!
//! The linker is the only part of the engine that creates or deletes files in
//! the working tree. Writes go to a temporary file next to the target and are
//! renamed over it once complete, so a failed checkout leaves whatever was
//! there before.

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tempfile::Builder;

use crate::hash::{hash_file, ContentId, HashProtocol};
use crate::pointer::PointerRecord;

/// Name of the exclusion file maintained next to tracked files.
pub const IGNORE_FILE: &str = ".gitignore";

const TEMP_PREFIX: &str = ".datapile-";

/// How a working tree file relates to the content its pointer names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Drift {
    Unchanged,
    Modified,
    Missing,
}

impl Drift {
    pub fn of<H: HashProtocol>(current: Option<ContentId<H>>, expected: ContentId<H>) -> Drift {
        match current {
            None => Drift::Missing,
            Some(id) if id == expected => Drift::Unchanged,
            Some(_) => Drift::Modified,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Linker {
    root: PathBuf,
    /// Serializes edits of exclusion files, which are shared between paths.
    ignores: Arc<Mutex<()>>,
}

impl Linker {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ignores: Arc::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes the bytes of `source` to the record's path, replacing any
    /// existing file.
    ///
    /// The number of bytes written must match the record's size, otherwise the
    /// write is discarded with [`io::ErrorKind::InvalidData`].
    pub fn materialize<H: HashProtocol, R: Read>(
        &self,
        record: &PointerRecord<H>,
        mut source: R,
    ) -> io::Result<()> {
        let target = self.root.join(&record.path);
        let parent = target
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no parent directory"))?;
        fs::create_dir_all(parent)?;

        let mut staged = Builder::new().prefix(TEMP_PREFIX).tempfile_in(parent)?;
        let written = io::copy(&mut source, &mut staged)?;
        if written != record.size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "{} has {written} bytes, pointer says {}",
                    record.id, record.size
                ),
            ));
        }
        staged.flush()?;
        staged.as_file().sync_all()?;
        if let Some(permissions) = target_permissions(&target)? {
            staged.as_file().set_permissions(permissions)?;
        }
        staged.persist(&target).map_err(|e| e.error)?;
        Ok(())
    }

    /// Replaces the file at `path` with `bytes` in one rename.
    pub fn write_atomic(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        let target = self.root.join(path);
        let parent = target
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no parent directory"))?;
        fs::create_dir_all(parent)?;
        let mut staged = Builder::new().prefix(TEMP_PREFIX).tempfile_in(parent)?;
        staged.write_all(bytes)?;
        staged.as_file().sync_all()?;
        if let Some(permissions) = target_permissions(&target)? {
            staged.as_file().set_permissions(permissions)?;
        }
        staged.persist(&target).map_err(|e| e.error)?;
        Ok(())
    }

    /// Whether the exclusion file next to `path` lists it.
    pub fn is_tracked(&self, path: &Path) -> io::Result<bool> {
        let (ignore_file, entry) = self.ignore_entry(path)?;
        match fs::read_to_string(ignore_file) {
            Ok(text) => Ok(text.lines().any(|line| line.trim_end() == entry)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Adds an exclusion entry for `path` unless one exists. Returns whether
    /// the file was changed.
    pub fn ensure_ignored(&self, path: &Path) -> io::Result<bool> {
        let _guard = self.ignores.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_tracked(path)? {
            return Ok(false);
        }
        let (ignore_file, entry) = self.ignore_entry(path)?;
        let needs_newline = match fs::read(&ignore_file) {
            Ok(bytes) => bytes.last().is_some_and(|&b| b != b'\n'),
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e),
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&ignore_file)?;
        if needs_newline {
            file.write_all(b"\n")?;
        }
        writeln!(file, "{entry}")?;
        Ok(true)
    }

    /// Removes the exclusion entry for `path`. Returns whether the file was
    /// changed.
    pub fn unignore(&self, path: &Path) -> io::Result<bool> {
        let _guard = self.ignores.lock().unwrap_or_else(PoisonError::into_inner);
        let (ignore_file, entry) = self.ignore_entry(path)?;
        let text = match fs::read_to_string(&ignore_file) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };
        let kept: Vec<&str> = text
            .lines()
            .filter(|line| line.trim_end() != entry)
            .collect();
        if kept.len() == text.lines().count() {
            return Ok(false);
        }
        let mut out = kept.join("\n");
        if !out.is_empty() {
            out.push('\n');
        }
        fs::write(ignore_file, out)?;
        Ok(true)
    }

    /// The content id of the file at `path`, `None` if it does not exist.
    /// `known` may answer from a stat memo before the file is hashed.
    pub fn observe<H: HashProtocol>(
        &self,
        path: &Path,
        known: impl FnOnce(&fs::Metadata) -> Option<ContentId<H>>,
    ) -> io::Result<Option<ContentId<H>>> {
        let full = self.root.join(path);
        let meta = match fs::metadata(&full) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        match known(&meta) {
            Some(id) => Ok(Some(id)),
            None => hash_file(&full).map(Some),
        }
    }

    pub fn detect_drift<H: HashProtocol>(
        &self,
        path: &Path,
        expected: ContentId<H>,
        known: impl FnOnce(&fs::Metadata) -> Option<ContentId<H>>,
    ) -> io::Result<Drift> {
        Ok(Drift::of(self.observe(path, known)?, expected))
    }

    fn ignore_entry(&self, path: &Path) -> io::Result<(PathBuf, String)> {
        let full = self.root.join(path);
        let name = full
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?
            .to_string_lossy()
            .into_owned();
        let dir = full.parent().unwrap_or(&self.root);
        Ok((dir.join(IGNORE_FILE), format!("/{name}")))
    }
}

/// Permissions for the file replacing `target`: the existing file's if there
/// is one, otherwise the usual default for new files.
fn target_permissions(target: &Path) -> io::Result<Option<fs::Permissions>> {
    match fs::metadata(target) {
        Ok(meta) => Ok(Some(meta.permissions())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(default_permissions()),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn default_permissions() -> Option<fs::Permissions> {
    use std::os::unix::fs::PermissionsExt;
    Some(fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn default_permissions() -> Option<fs::Permissions> {
    None
}
