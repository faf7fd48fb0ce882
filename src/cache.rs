//! The local content-addressable cache.
//!
//! A cache is a collection of objects addressed by the [`ContentId`] of their
//! bytes. It has no notion of paths, pointers or history, which keeps it safe
//! to delete and rebuild from a remote at any time.
//!
//! Every read is verified: an object whose bytes no longer hash to its address
//! is moved out of the way and reported as [`CacheError::Corruption`], it is
//! never served.

pub mod dir;
pub mod memory;

use std::collections::HashSet;
use std::error::Error;
use std::fmt;
use std::io::{self, Read};

use bytes::Bytes;
use serde::Serialize;

use crate::hash::{ContentId, HashProtocol};

pub use dir::DirCache;
pub use memory::MemoryCache;

/// What a successful [`CacheStore::put`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stored {
    /// The object was written.
    Written,
    /// A verified object was already present, nothing was written.
    AlreadyPresent,
}

#[derive(Debug)]
pub enum CacheError {
    Io(io::Error),
    /// No object with this id exists in the cache.
    NotFound(String),
    /// The stored object does not hash to its address. It has been
    /// quarantined.
    Corruption { id: String, actual: String },
    /// The bytes offered to `put` do not hash to the claimed id.
    DigestMismatch { expected: String, actual: String },
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Io(e) => write!(f, "cache io error: {e}"),
            CacheError::NotFound(id) => write!(f, "object {id} not in cache"),
            CacheError::Corruption { id, actual } => {
                write!(f, "cache object {id} is corrupted (content hashes to {actual})")
            }
            CacheError::DigestMismatch { expected, actual } => {
                write!(f, "content hashes to {actual}, expected {expected}")
            }
        }
    }
}

impl Error for CacheError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CacheError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CacheError {
    fn from(err: io::Error) -> Self {
        CacheError::Io(err)
    }
}

/// Storage for content-addressed objects.
///
/// Implementations must be safe to share between threads. Writes of one id
/// must be atomic so that a concurrent [`get`](CacheStore::get) never observes
/// a partial object.
pub trait CacheStore<H: HashProtocol>: Send + Sync {
    /// Stores the bytes produced by `reader` under `id`.
    ///
    /// The bytes are hashed while they are written. If they do not hash to
    /// `id` nothing is stored and [`CacheError::DigestMismatch`] is returned.
    /// Putting an id that is already present verifies the existing object
    /// instead of writing it again.
    fn put<R: Read>(&self, id: ContentId<H>, reader: R) -> Result<Stored, CacheError>;

    /// Returns the verified bytes of `id`.
    fn get(&self, id: ContentId<H>) -> Result<Bytes, CacheError>;

    fn has(&self, id: ContentId<H>) -> Result<bool, CacheError>;

    /// Lists every object id in the cache.
    fn ids(&self) -> Result<Vec<ContentId<H>>, CacheError>;

    /// Removes `id`, returning whether it was present.
    fn remove(&self, id: ContentId<H>) -> Result<bool, CacheError>;

    /// Deletes every object that is not in `live` and returns how many were
    /// removed.
    fn gc(&self, live: &HashSet<ContentId<H>>) -> Result<usize, CacheError> {
        let mut removed = 0;
        for id in self.ids()? {
            if !live.contains(&id) && self.remove(id)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Re-hashes every object and returns the ids found corrupted. Corrupted
    /// objects are quarantined as a side effect of the verifying read.
    fn verify(&self) -> Result<Vec<ContentId<H>>, CacheError> {
        let mut corrupted = Vec::new();
        for id in self.ids()? {
            match self.get(id) {
                Ok(_) | Err(CacheError::NotFound(_)) => {}
                Err(CacheError::Corruption { .. }) => corrupted.push(id),
                Err(e) => return Err(e),
            }
        }
        Ok(corrupted)
    }
}

impl<H, C> CacheStore<H> for &C
where
    H: HashProtocol,
    C: CacheStore<H>,
{
    fn put<R: Read>(&self, id: ContentId<H>, reader: R) -> Result<Stored, CacheError> {
        (**self).put(id, reader)
    }

    fn get(&self, id: ContentId<H>) -> Result<Bytes, CacheError> {
        (**self).get(id)
    }

    fn has(&self, id: ContentId<H>) -> Result<bool, CacheError> {
        (**self).has(id)
    }

    fn ids(&self) -> Result<Vec<ContentId<H>>, CacheError> {
        (**self).ids()
    }

    fn remove(&self, id: ContentId<H>) -> Result<bool, CacheError> {
        (**self).remove(id)
    }
}
