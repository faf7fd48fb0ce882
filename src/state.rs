//! Per-workspace bookkeeping in `.datapile/state.json`.
//!
//! For every tracked path the state remembers the content id the engine last
//! wrote or read there, together with the file's size and modification time
//! at that moment. Two things fall out of this:
//!
//! - a stat that still matches lets status checks skip rehashing large files,
//! - a working file that still has the recorded id but no longer matches its
//!   pointer was left behind by a pointer change (stale) rather than edited.
//!
//! The state is a pure cache. Losing it costs a rehash, never correctness.
//!
//! Filesystem timestamps are coarse, so a file rewritten right after it was
//! recorded can keep both its size and its mtime. Entries whose mtime lies
//! within [`SETTLE`] of the moment they were recorded are therefore never
//! trusted for lookups.

use std::collections::BTreeMap;
use std::fs::{self, Metadata};
use std::io::{self, Write};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::warn;

use crate::hash::{Blake3, ContentId, HashProtocol};

/// How long a file must have been left alone before its stat is trusted.
pub const SETTLE: Duration = Duration::from_secs(2);

#[derive(Serialize, Deserialize)]
#[serde(bound = "H: HashProtocol")]
pub struct StateEntry<H: HashProtocol = Blake3> {
    pub id: ContentId<H>,
    pub size: u64,
    /// Modification time in nanoseconds since the epoch.
    pub mtime: u64,
    /// When the entry was recorded, in nanoseconds since the epoch.
    #[serde(default)]
    pub recorded: u64,
}

impl<H: HashProtocol> StateEntry<H> {
    fn settled(&self) -> bool {
        self.recorded.saturating_sub(self.mtime) >= SETTLE.as_nanos() as u64
    }
}

#[derive(Serialize, Deserialize)]
#[serde(bound = "H: HashProtocol")]
pub struct StateIndex<H: HashProtocol = Blake3> {
    #[serde(default)]
    entries: BTreeMap<String, StateEntry<H>>,
}

impl<H: HashProtocol> Default for StateIndex<H> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

fn key(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn nanos(time: SystemTime) -> Option<u64> {
    let since_epoch = time.duration_since(UNIX_EPOCH).ok()?;
    u64::try_from(since_epoch.as_nanos()).ok()
}

impl<H: HashProtocol> StateIndex<H> {
    /// Reads the state at `path`. A missing or unreadable state file yields an
    /// empty index.
    pub fn load(path: &Path) -> io::Result<Self> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e),
        };
        match serde_json::from_slice(&bytes) {
            Ok(index) => Ok(index),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "discarding unreadable state");
                Ok(Self::default())
            }
        }
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let dir = path.parent().unwrap_or(Path::new("."));
        let mut staged = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut staged, self)?;
        staged.write_all(b"\n")?;
        staged.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// The id recorded for `path` if the file still has the recorded size and
    /// modification time and had settled when it was recorded.
    pub fn lookup(&self, path: &Path, meta: &Metadata) -> Option<ContentId<H>> {
        let entry = self.entries.get(&key(path))?;
        let mtime = nanos(meta.modified().ok()?)?;
        (entry.settled() && entry.size == meta.len() && entry.mtime == mtime).then_some(entry.id)
    }

    /// Remembers that `path`, described by `meta`, holds `id`.
    pub fn record(&mut self, path: &Path, id: ContentId<H>, meta: &Metadata) {
        let mtime = meta.modified().ok().and_then(nanos).unwrap_or(0);
        let recorded = nanos(SystemTime::now()).unwrap_or(0);
        self.entries.insert(
            key(path),
            StateEntry {
                id,
                size: meta.len(),
                mtime,
                recorded,
            },
        );
    }

    /// The id last written or read at `path`.
    pub fn last(&self, path: &Path) -> Option<ContentId<H>> {
        self.entries.get(&key(path)).map(|entry| entry.id)
    }

    pub fn forget(&mut self, path: &Path) -> bool {
        self.entries.remove(&key(path)).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;
    use tempfile::tempdir;

    fn age(path: &Path, by: Duration) {
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - by).unwrap();
    }

    #[test]
    fn lookup_requires_matching_settled_stat() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("data.csv");
        fs::write(&file, b"a,b\n").unwrap();
        let id = hash_bytes(b"a,b\n");
        let rel = Path::new("data.csv");
        let mut state: StateIndex = StateIndex::default();

        // Freshly written files are not trusted.
        state.record(rel, id, &fs::metadata(&file).unwrap());
        assert_eq!(state.lookup(rel, &fs::metadata(&file).unwrap()), None);

        age(&file, Duration::from_secs(60));
        let meta = fs::metadata(&file).unwrap();
        assert_eq!(state.lookup(rel, &meta), None);
        state.record(rel, id, &meta);
        assert_eq!(state.lookup(rel, &meta), Some(id));

        fs::write(&file, b"a,b,c\n").unwrap();
        assert_eq!(state.lookup(rel, &fs::metadata(&file).unwrap()), None);
        assert_eq!(state.last(rel), Some(id));
    }

    #[test]
    fn same_size_new_mtime_misses() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("m.bin");
        fs::write(&file, b"1234").unwrap();
        age(&file, Duration::from_secs(60));
        let mut state: StateIndex = StateIndex::default();
        let rel = Path::new("m.bin");
        state.record(rel, hash_bytes(b"1234"), &fs::metadata(&file).unwrap());

        fs::write(&file, b"5678").unwrap();
        assert_eq!(state.lookup(rel, &fs::metadata(&file).unwrap()), None);
    }

    #[test]
    fn save_load_forget() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("x");
        fs::write(&file, b"x").unwrap();
        age(&file, Duration::from_secs(60));
        let meta = fs::metadata(&file).unwrap();
        let path = dir.path().join("state.json");

        let mut state: StateIndex = StateIndex::default();
        state.record(Path::new("sub/x"), hash_bytes(b"x"), &meta);
        state.save(&path).unwrap();

        let mut loaded: StateIndex = StateIndex::load(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.last(Path::new("sub/x")), Some(hash_bytes(b"x")));
        assert_eq!(loaded.lookup(Path::new("sub/x"), &meta), Some(hash_bytes(b"x")));
        assert!(loaded.forget(Path::new("sub/x")));
        assert!(loaded.is_empty());
    }

    #[test]
    fn unreadable_state_starts_over() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"{ not json").unwrap();
        let state: StateIndex = StateIndex::load(&path).unwrap();
        assert!(state.is_empty());
    }
}
