//! A cache stored as a sharded directory tree.
//!
//! # Layout
//! ```text
//! <root>/
//!   blake3/
//!     af/
//!       1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262
//!   tmp/          staging area for writes in flight
//!   quarantine/   objects that failed verification
//! ```
//!
//! The first two hex characters of the digest select the shard directory,
//! which bounds the fan-out of any single directory to 256 entries.
//!
//! Objects are written to `tmp/` first, hashed on the way, and renamed into
//! place only after the digest checked out. Both directories live below the
//! same root so the rename is atomic. Finished objects are marked read-only
//! and are never modified in place, which is what makes memory-mapping them
//! for reads sound.

use std::fs::{self, File};
use std::io::{self, Read};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use memmap2::Mmap;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::{CacheError, CacheStore, Stored};
use crate::hash::{Blake3, ContentId, HashProtocol, HashingReader};

const TMP_DIR: &str = "tmp";
const QUARANTINE_DIR: &str = "quarantine";
const SHARD_LEN: usize = 2;

pub struct DirCache<H: HashProtocol = Blake3> {
    root: PathBuf,
    _hasher: PhantomData<fn(H) -> ()>,
}

impl<H: HashProtocol> std::fmt::Debug for DirCache<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirCache").field("root", &self.root).finish()
    }
}

impl<H: HashProtocol> DirCache<H> {
    /// Opens the cache rooted at `root`, creating the directory structure if
    /// it does not exist yet.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(H::NAME))?;
        fs::create_dir_all(root.join(TMP_DIR))?;
        fs::create_dir_all(root.join(QUARANTINE_DIR))?;
        Ok(Self {
            root,
            _hasher: PhantomData,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The path an object with `id` is stored at.
    pub fn object_path(&self, id: &ContentId<H>) -> PathBuf {
        let hex = id.to_hex();
        self.root
            .join(H::NAME)
            .join(&hex[..SHARD_LEN])
            .join(&hex[SHARD_LEN..])
    }

    fn quarantine(&self, id: &ContentId<H>) -> io::Result<()> {
        let from = self.object_path(id);
        let to = self.root.join(QUARANTINE_DIR).join(id.to_hex());
        match fs::rename(&from, &to) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn read_object(&self, id: &ContentId<H>) -> Result<Bytes, CacheError> {
        let path = self.object_path(id);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CacheError::NotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        if file.metadata()?.len() == 0 {
            return Ok(Bytes::new());
        }
        // SAFETY: objects are read-only and only ever replaced by rename, so
        // the mapped inode is never truncated or rewritten underneath us.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Bytes::from_owner(mmap))
    }
}

impl<H: HashProtocol> CacheStore<H> for DirCache<H> {
    fn put<R: Read>(&self, id: ContentId<H>, reader: R) -> Result<Stored, CacheError> {
        let path = self.object_path(&id);
        if path.is_file() {
            match self.get(id) {
                Ok(_) => return Ok(Stored::AlreadyPresent),
                // Removed between the check and the read, write it again.
                Err(CacheError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let mut staged = NamedTempFile::new_in(self.root.join(TMP_DIR))?;
        let mut reader: HashingReader<R, H> = HashingReader::new(reader);
        io::copy(&mut reader, &mut staged)?;
        let (actual, len) = reader.finish();
        if actual != id {
            return Err(CacheError::DigestMismatch {
                expected: id.to_string(),
                actual: actual.to_string(),
            });
        }

        let file = staged.as_file();
        file.sync_all()?;
        let mut permissions = file.metadata()?.permissions();
        permissions.set_readonly(true);
        file.set_permissions(permissions)?;

        if let Some(shard) = path.parent() {
            fs::create_dir_all(shard)?;
        }
        match staged.persist(&path) {
            Ok(_) => {
                debug!(%id, len, "stored cache object");
                Ok(Stored::Written)
            }
            // A concurrent writer of the same id won the race.
            Err(_) if path.is_file() => Ok(Stored::AlreadyPresent),
            Err(e) => Err(e.error.into()),
        }
    }

    fn get(&self, id: ContentId<H>) -> Result<Bytes, CacheError> {
        let bytes = self.read_object(&id)?;
        let actual = ContentId::<H>::digest(&bytes);
        if actual != id {
            drop(bytes);
            warn!(%id, %actual, "quarantining corrupted cache object");
            self.quarantine(&id)?;
            return Err(CacheError::Corruption {
                id: id.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(bytes)
    }

    fn has(&self, id: ContentId<H>) -> Result<bool, CacheError> {
        match fs::metadata(self.object_path(&id)) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn ids(&self) -> Result<Vec<ContentId<H>>, CacheError> {
        let mut ids = Vec::new();
        for shard in fs::read_dir(self.root.join(H::NAME))? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            let shard_name = shard.file_name();
            let Some(prefix) = shard_name.to_str() else {
                continue;
            };
            if prefix.len() != SHARD_LEN {
                continue;
            }
            for object in fs::read_dir(shard.path())? {
                let object = object?;
                let name = object.file_name();
                let Some(rest) = name.to_str() else {
                    continue;
                };
                if let Ok(id) = ContentId::from_hex(&format!("{prefix}{rest}")) {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn remove(&self, id: ContentId<H>) -> Result<bool, CacheError> {
        match fs::remove_file(self.object_path(&id)) {
            Ok(()) => {
                debug!(%id, "removed cache object");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;
    use std::collections::HashSet;
    use tempfile::tempdir;

    #[test]
    fn put_get_has() {
        let dir = tempdir().unwrap();
        let cache: DirCache = DirCache::open(dir.path()).unwrap();
        let data = b"150000 rows of transactions".to_vec();
        let id = hash_bytes(&data);

        assert!(!cache.has(id).unwrap());
        assert_eq!(cache.put(id, &data[..]).unwrap(), Stored::Written);
        assert!(cache.has(id).unwrap());
        assert_eq!(&cache.get(id).unwrap()[..], &data[..]);

        let hex = id.to_hex();
        let expected = dir.path().join("blake3").join(&hex[..2]).join(&hex[2..]);
        assert!(expected.is_file());
    }

    #[test]
    fn second_put_writes_nothing() {
        let dir = tempdir().unwrap();
        let cache: DirCache = DirCache::open(dir.path()).unwrap();
        let id = hash_bytes(b"model weights");
        cache.put(id, &b"model weights"[..]).unwrap();
        assert_eq!(
            cache.put(id, &b"model weights"[..]).unwrap(),
            Stored::AlreadyPresent
        );
    }

    #[test]
    fn mismatched_put_stores_nothing() {
        let dir = tempdir().unwrap();
        let cache: DirCache = DirCache::open(dir.path()).unwrap();
        let id = hash_bytes(b"expected");
        let err = cache.put(id, &b"something else"[..]).unwrap_err();
        assert!(matches!(err, CacheError::DigestMismatch { .. }));
        assert!(!cache.has(id).unwrap());
        assert_eq!(fs::read_dir(dir.path().join(TMP_DIR)).unwrap().count(), 0);
    }

    #[test]
    fn empty_object() {
        let dir = tempdir().unwrap();
        let cache: DirCache = DirCache::open(dir.path()).unwrap();
        let id = hash_bytes(b"");
        cache.put(id, io::empty()).unwrap();
        assert!(cache.get(id).unwrap().is_empty());
    }

    #[test]
    #[allow(clippy::permissions_set_readonly_false)]
    fn tampered_object_is_quarantined() {
        let dir = tempdir().unwrap();
        let cache: DirCache = DirCache::open(dir.path()).unwrap();
        let id = hash_bytes(b"original");
        cache.put(id, &b"original"[..]).unwrap();

        let path = cache.object_path(&id);
        let mut permissions = fs::metadata(&path).unwrap().permissions();
        permissions.set_readonly(false);
        fs::set_permissions(&path, permissions).unwrap();
        fs::write(&path, b"tampered").unwrap();

        let err = cache.get(id).unwrap_err();
        assert!(matches!(err, CacheError::Corruption { .. }));
        assert!(!cache.has(id).unwrap());
        assert!(dir.path().join(QUARANTINE_DIR).join(id.to_hex()).is_file());

        // A fresh put restores the object.
        assert_eq!(cache.put(id, &b"original"[..]).unwrap(), Stored::Written);
        assert_eq!(&cache.get(id).unwrap()[..], b"original");
    }

    #[test]
    fn gc_keeps_live_objects() {
        let dir = tempdir().unwrap();
        let cache: DirCache = DirCache::open(dir.path()).unwrap();
        let live = hash_bytes(b"live");
        let dead = hash_bytes(b"dead");
        cache.put(live, &b"live"[..]).unwrap();
        cache.put(dead, &b"dead"[..]).unwrap();

        let removed = cache.gc(&HashSet::from([live])).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(cache.ids().unwrap(), vec![live]);
    }

    #[test]
    fn ids_ignore_foreign_files() {
        let dir = tempdir().unwrap();
        let cache: DirCache = DirCache::open(dir.path()).unwrap();
        let id = hash_bytes(b"a");
        cache.put(id, &b"a"[..]).unwrap();
        fs::write(dir.path().join("blake3").join("README"), b"x").unwrap();
        fs::create_dir_all(dir.path().join("blake3").join("zz")).unwrap();
        fs::write(dir.path().join("blake3").join("zz").join("junk"), b"x").unwrap();
        assert_eq!(cache.ids().unwrap(), vec![id]);
    }
}
