use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read};
use std::sync::{PoisonError, RwLock};

use bytes::Bytes;

use super::{CacheError, CacheStore, Stored};
use crate::hash::{Blake3, ContentId, HashProtocol, HashingReader};

/// Simple in-memory implementation of [`CacheStore`].
///
/// Useful for unit tests or ephemeral workspaces where persistence is not
/// required.
pub struct MemoryCache<H: HashProtocol = Blake3> {
    objects: RwLock<HashMap<ContentId<H>, Bytes>>,
}

impl<H: HashProtocol> fmt::Debug for MemoryCache<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoryCache")
    }
}

impl<H: HashProtocol> Default for MemoryCache<H> {
    fn default() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
        }
    }
}

impl<H: HashProtocol> MemoryCache<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stores `bytes` under `id` without checking that they match.
    ///
    /// This exists to simulate on-disk corruption in tests.
    pub fn insert_unchecked(&self, id: ContentId<H>, bytes: Bytes) {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, bytes);
    }
}

impl<H: HashProtocol> CacheStore<H> for MemoryCache<H> {
    fn put<R: Read>(&self, id: ContentId<H>, reader: R) -> Result<Stored, CacheError> {
        if self.has(id)? {
            self.get(id)?;
            return Ok(Stored::AlreadyPresent);
        }
        let mut reader: HashingReader<R, H> = HashingReader::new(reader);
        let mut buf = Vec::new();
        io::copy(&mut reader, &mut buf)?;
        let (actual, _) = reader.finish();
        if actual != id {
            return Err(CacheError::DigestMismatch {
                expected: id.to_string(),
                actual: actual.to_string(),
            });
        }
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        // This operation is idempotent, a concurrent writer may have been first.
        let stored = if objects.contains_key(&id) {
            Stored::AlreadyPresent
        } else {
            Stored::Written
        };
        objects.entry(id).or_insert_with(|| Bytes::from(buf));
        Ok(stored)
    }

    fn get(&self, id: ContentId<H>) -> Result<Bytes, CacheError> {
        let bytes = self
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or_else(|| CacheError::NotFound(id.to_string()))?;
        let actual = ContentId::<H>::digest(&bytes);
        if actual != id {
            self.remove(id)?;
            return Err(CacheError::Corruption {
                id: id.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(bytes)
    }

    fn has(&self, id: ContentId<H>) -> Result<bool, CacheError> {
        Ok(self
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id))
    }

    fn ids(&self) -> Result<Vec<ContentId<H>>, CacheError> {
        let mut ids: Vec<_> = self
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn remove(&self, id: ContentId<H>) -> Result<bool, CacheError> {
        Ok(self
            .objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some())
    }
}
