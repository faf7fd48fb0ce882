//! Content identifiers.
//!
//! A [`ContentId`] is the 256 bit digest of a byte sequence under some
//! [`HashProtocol`]. It names content independent of the path or file it was
//! read from, so two files with the same bytes always share one id.
//!
//! The textual form carries the protocol name as a tag, e.g.
//! `blake3:af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262`,
//! so pointer files stay unambiguous if the default protocol ever changes.

use std::cmp::Ordering;
use std::fmt;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::{self, Read};
use std::marker::PhantomData;
use std::path::Path;
use std::str::FromStr;

use digest::typenum::U32;
use digest::Digest;
use hex::{FromHex, FromHexError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Length of a raw digest in bytes.
pub const DIGEST_LEN: usize = 32;

/// Buffer size used when hashing streams.
pub const CHUNK_LEN: usize = 64 * 1024;

pub type RawDigest = [u8; DIGEST_LEN];

/// A trait for hash functions usable as content addresses.
pub trait HashProtocol: Digest<OutputSize = U32> + Clone + Send + 'static {
    const NAME: &'static str;
}

use blake2::Blake2b as Blake2bUnsized;
pub type Blake2b = Blake2bUnsized<U32>;

pub use blake3::Hasher as Blake3;

impl HashProtocol for Blake2b {
    const NAME: &'static str = "blake2";
}

impl HashProtocol for Blake3 {
    const NAME: &'static str = "blake3";
}

/// The digest of some content under the hash protocol `H`.
#[repr(transparent)]
pub struct ContentId<H = Blake3> {
    pub raw: RawDigest,
    _hasher: PhantomData<fn(H) -> ()>,
}

impl<H> ContentId<H> {
    pub const fn new(raw: RawDigest) -> Self {
        Self {
            raw,
            _hasher: PhantomData,
        }
    }

    /// Lowercase hex of the digest without the protocol tag.
    pub fn to_hex(&self) -> String {
        hex::encode(self.raw)
    }
}

impl<H: HashProtocol> ContentId<H> {
    pub fn digest(bytes: &[u8]) -> Self {
        Self::new(H::digest(bytes).into())
    }

    pub fn from_hex(hex: &str) -> Result<Self, FromHexError> {
        Ok(Self::new(RawDigest::from_hex(hex)?))
    }

    /// The protocol name used as the tag of the textual form.
    pub fn protocol() -> &'static str {
        H::NAME
    }
}

impl<H> Clone for ContentId<H> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<H> Copy for ContentId<H> {}

impl<H> PartialEq for ContentId<H> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<H> Eq for ContentId<H> {}

impl<H> PartialOrd for ContentId<H> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<H> Ord for ContentId<H> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.raw.cmp(&other.raw)
    }
}

impl<H> Hash for ContentId<H> {
    fn hash<S: Hasher>(&self, state: &mut S) {
        self.raw.hash(state);
    }
}

impl<H: HashProtocol> fmt::Display for ContentId<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", H::NAME, hex::encode(self.raw))
    }
}

impl<H: HashProtocol> fmt::Debug for ContentId<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({self})")
    }
}

/// An error that can occur when parsing a content id from a string.
/// The error can be caused by a bad protocol tag or a bad hex encoding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParseIdError {
    BadProtocol,
    BadHex(FromHexError),
}

impl From<FromHexError> for ParseIdError {
    fn from(value: FromHexError) -> Self {
        ParseIdError::BadHex(value)
    }
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseIdError::BadProtocol => write!(f, "unexpected hash protocol tag"),
            ParseIdError::BadHex(e) => write!(f, "bad digest hex: {e}"),
        }
    }
}

impl std::error::Error for ParseIdError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ParseIdError::BadProtocol => None,
            ParseIdError::BadHex(e) => Some(e),
        }
    }
}

impl<H: HashProtocol> FromStr for ContentId<H> {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((protocol, digest)) = s.split_once(':') else {
            return Err(ParseIdError::BadProtocol);
        };
        if protocol != H::NAME {
            return Err(ParseIdError::BadProtocol);
        }
        Ok(Self::from_hex(digest)?)
    }
}

impl<H: HashProtocol> Serialize for ContentId<H> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de, H: HashProtocol> Deserialize<'de> for ContentId<H> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Hashes everything `reader` yields, one chunk at a time.
pub fn hash_reader<H: HashProtocol, R: Read>(mut reader: R) -> io::Result<ContentId<H>> {
    let mut hasher = H::new();
    let mut buf = vec![0u8; CHUNK_LEN];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => Digest::update(&mut hasher, &buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(ContentId::new(hasher.finalize().into()))
}

pub fn hash_file<H: HashProtocol>(path: &Path) -> io::Result<ContentId<H>> {
    hash_reader(File::open(path)?)
}

pub fn hash_bytes<H: HashProtocol>(bytes: &[u8]) -> ContentId<H> {
    ContentId::digest(bytes)
}

/// A reader that hashes and counts the bytes passing through it.
pub struct HashingReader<R, H: HashProtocol = Blake3> {
    inner: R,
    hasher: H,
    len: u64,
}

impl<R: Read, H: HashProtocol> HashingReader<R, H> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: H::new(),
            len: 0,
        }
    }

    /// Number of bytes read so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Consumes the reader and returns the digest of everything read.
    pub fn finish(self) -> (ContentId<H>, u64) {
        (ContentId::new(self.hasher.finalize().into()), self.len)
    }
}

impl<R: Read, H: HashProtocol> Read for HashingReader<R, H> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        Digest::update(&mut self.hasher, &buf[..n]);
        self.len += n as u64;
        Ok(n)
    }
}
