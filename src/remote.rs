//! Remote storage for cache objects.
//!
//! A remote is any [`object_store`] backend (a local directory, S3, GCS,
//! Azure, HTTP or memory) holding objects under the same sharded layout as the
//! local cache:
//!
//! ```text
//! <prefix>/blake3/af/1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262
//! ```
//!
//! Uploads are create-only. Content addressing makes an object that already
//! exists under its id equal to the one being uploaded, so a concurrent upload
//! of the same id is never an error. Downloads are re-hashed before they are
//! handed out or stored.
//!
//! Store futures are driven by a tokio runtime shared by all remotes in the
//! process, so network backends get the reactor they need while the public
//! API stays blocking.
//!
//! [`Remote::push_all`] and [`Remote::pull_all`] move batches of objects on a
//! small pool of worker threads. Each item gets its own result and a failure
//! never aborts the rest of the batch.

use std::error::Error;
use std::fmt;
use std::io::{self, Read};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;

use bytes::{Buf, Bytes};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use object_store::path::Path;
use object_store::{parse_url, ObjectStore, PutMode, PutPayload};
use serde::ser::SerializeStruct;
use serde::Serialize;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheError, CacheStore, Stored};
use crate::hash::{Blake3, ContentId, HashProtocol};
use crate::ErrorKind;

const SHARD_LEN: usize = 2;

#[derive(Debug)]
pub enum RemoteError {
    /// The remote URL could not be turned into a store.
    Url(object_store::Error),
    /// The remote could not be reached or refused the request.
    Unavailable(object_store::Error),
    /// The remote is out of space or over quota.
    Full(object_store::Error),
    /// The remote has no object with this id.
    NotFound(String),
    /// Downloaded bytes do not hash to the requested id.
    IntegrityMismatch { expected: String, actual: String },
    /// The local side of the transfer failed.
    Cache(CacheError),
    /// The runtime driving store requests could not be started.
    Runtime(io::Error),
}

impl RemoteError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RemoteError::Url(_) => ErrorKind::Config,
            RemoteError::Unavailable(_) => ErrorKind::RemoteUnavailable,
            RemoteError::Full(_) => ErrorKind::RemoteFull,
            RemoteError::NotFound(_) => ErrorKind::ObjectNotFound,
            RemoteError::IntegrityMismatch { .. } => ErrorKind::IntegrityMismatch,
            RemoteError::Cache(e) => ErrorKind::of_cache(e),
            RemoteError::Runtime(_) => ErrorKind::Io,
        }
    }

    /// Whether trying the same transfer again may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    fn from_store(err: object_store::Error, id: &str) -> Self {
        match err {
            object_store::Error::NotFound { .. } => RemoteError::NotFound(id.to_owned()),
            err if out_of_space(&err) => RemoteError::Full(err),
            err => RemoteError::Unavailable(err),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::Url(e) => write!(f, "invalid remote: {e}"),
            RemoteError::Unavailable(e) => write!(f, "remote unavailable: {e}"),
            RemoteError::Full(e) => write!(f, "remote is full: {e}"),
            RemoteError::NotFound(id) => write!(f, "object {id} not on remote"),
            RemoteError::IntegrityMismatch { expected, actual } => {
                write!(f, "remote object {expected} hashes to {actual}")
            }
            RemoteError::Cache(e) => write!(f, "{e}"),
            RemoteError::Runtime(e) => write!(f, "failed to start io runtime: {e}"),
        }
    }
}

impl Error for RemoteError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RemoteError::Url(e) | RemoteError::Unavailable(e) | RemoteError::Full(e) => Some(e),
            RemoteError::Cache(e) => Some(e),
            RemoteError::Runtime(e) => Some(e),
            _ => None,
        }
    }
}

/// Looks for a storage exhaustion error anywhere in the source chain.
fn out_of_space(err: &(dyn Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<io::Error>() {
            if matches!(
                io.kind(),
                io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded
            ) {
                return true;
            }
        }
        current = e.source();
    }
    false
}

/// Separates store failures surfacing through [`DownloadReader`] from local
/// write failures.
fn download_error(err: io::Error, id: &str) -> RemoteError {
    if !err
        .get_ref()
        .is_some_and(|inner| inner.is::<object_store::Error>())
    {
        return RemoteError::Cache(CacheError::Io(err));
    }
    let kind = err.kind();
    match err.into_inner().map(|inner| inner.downcast::<object_store::Error>()) {
        Some(Ok(store_err)) => RemoteError::from_store(*store_err, id),
        Some(Err(other)) => RemoteError::Cache(CacheError::Io(io::Error::new(kind, other))),
        None => RemoteError::Cache(CacheError::Io(kind.into())),
    }
}

/// The outcome of moving one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Transfer {
    Transferred,
    /// The destination already had the object.
    AlreadyPresent,
    /// The batch was cancelled before this item was attempted.
    Skipped,
}

impl From<Stored> for Transfer {
    fn from(stored: Stored) -> Self {
        match stored {
            Stored::Written => Transfer::Transferred,
            Stored::AlreadyPresent => Transfer::AlreadyPresent,
        }
    }
}

/// Cooperative cancellation for batch transfers.
///
/// Items already in flight finish, items not yet started are reported as
/// [`Transfer::Skipped`].
#[derive(Debug, Clone, Default)]
pub struct Cancel(Arc<AtomicBool>);

impl Cancel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Number of transfers in flight at once.
    pub jobs: usize,
    pub cancel: Cancel,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            jobs: crate::config::DEFAULT_JOBS,
            cancel: Cancel::new(),
        }
    }
}

impl BatchOptions {
    pub fn with_jobs(jobs: usize) -> Self {
        Self {
            jobs,
            ..Self::default()
        }
    }
}

pub struct ItemReport<H: HashProtocol = Blake3> {
    pub id: ContentId<H>,
    pub result: Result<Transfer, RemoteError>,
}

impl<H: HashProtocol> fmt::Debug for ItemReport<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemReport")
            .field("id", &self.id)
            .field("result", &self.result)
            .finish()
    }
}

impl<H: HashProtocol> Serialize for ItemReport<H> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut item = serializer.serialize_struct("ItemReport", 3)?;
        item.serialize_field("id", &self.id)?;
        match &self.result {
            Ok(transfer) => {
                item.serialize_field("status", transfer)?;
                item.skip_field("error")?;
            }
            Err(e) => {
                item.serialize_field("status", &e.kind())?;
                item.serialize_field("error", &e.to_string())?;
            }
        }
        item.end()
    }
}

/// Per-item results of a batch, in the order the ids were given.
pub struct BatchReport<H: HashProtocol = Blake3> {
    pub items: Vec<ItemReport<H>>,
    pub cancelled: bool,
}

impl<H: HashProtocol> fmt::Debug for BatchReport<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchReport")
            .field("items", &self.items)
            .field("cancelled", &self.cancelled)
            .finish()
    }
}

impl<H: HashProtocol> Serialize for BatchReport<H> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut report = serializer.serialize_struct("BatchReport", 3)?;
        report.serialize_field("items", &self.items)?;
        report.serialize_field("cancelled", &self.cancelled)?;
        report.serialize_field("ok", &self.ok())?;
        report.end()
    }
}

impl<H: HashProtocol> BatchReport<H> {
    /// True when every item reached its destination.
    pub fn ok(&self) -> bool {
        !self.cancelled
            && self.items.iter().all(|item| {
                matches!(
                    item.result,
                    Ok(Transfer::Transferred) | Ok(Transfer::AlreadyPresent)
                )
            })
    }

    pub fn count(&self, transfer: Transfer) -> usize {
        self.items
            .iter()
            .filter(|item| matches!(&item.result, Ok(t) if *t == transfer))
            .count()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&ContentId<H>, &RemoteError)> + '_ {
        self.items
            .iter()
            .filter_map(|item| item.result.as_ref().err().map(|e| (&item.id, e)))
    }
}

fn shared_runtime() -> Result<Arc<Runtime>, RemoteError> {
    static RUNTIME: OnceLock<Arc<Runtime>> = OnceLock::new();
    if let Some(runtime) = RUNTIME.get() {
        return Ok(runtime.clone());
    }
    let runtime = Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("datapile-io")
        .enable_all()
        .build()
        .map_err(RemoteError::Runtime)?;
    Ok(RUNTIME.get_or_init(|| Arc::new(runtime)).clone())
}

/// Exposes a download as [`Read`] so it can be streamed into the cache.
///
/// Store errors are wrapped in [`io::Error`] and unwrapped again by
/// [`download_error`].
struct DownloadReader {
    runtime: Arc<Runtime>,
    chunks: BoxStream<'static, object_store::Result<Bytes>>,
    current: Bytes,
}

impl Read for DownloadReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.current.is_empty() {
            match self.runtime.block_on(self.chunks.next()) {
                None => return Ok(0),
                Some(Ok(chunk)) => self.current = chunk,
                Some(Err(e)) => return Err(io::Error::other(e)),
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }
}

/// A named remote backed by an [`object_store`] compatible storage service.
pub struct Remote<H: HashProtocol = Blake3> {
    name: String,
    store: Arc<dyn ObjectStore>,
    prefix: Path,
    runtime: Arc<Runtime>,
    _hasher: PhantomData<fn(H) -> ()>,
}

impl<H: HashProtocol> fmt::Debug for Remote<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Remote")
            .field("name", &self.name)
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl<H: HashProtocol> Remote<H> {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn ObjectStore>,
        prefix: Path,
    ) -> Result<Self, RemoteError> {
        Ok(Self {
            name: name.into(),
            store,
            prefix,
            runtime: shared_runtime()?,
            _hasher: PhantomData,
        })
    }

    /// Creates a remote pointing at the object store described by `url`.
    pub fn with_url(name: impl Into<String>, url: &Url) -> Result<Self, RemoteError> {
        let (store, prefix) = parse_url(url).map_err(RemoteError::Url)?;
        Self::new(name, Arc::from(store), prefix)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn object_path(&self, id: &ContentId<H>) -> Path {
        let hex = id.to_hex();
        self.prefix
            .child(H::NAME)
            .child(&hex[..SHARD_LEN])
            .child(&hex[SHARD_LEN..])
    }

    pub fn has(&self, id: ContentId<H>) -> Result<bool, RemoteError> {
        match self.runtime.block_on(self.store.head(&self.object_path(&id))) {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(RemoteError::from_store(e, &id.to_string())),
        }
    }

    /// Uploads `id` from `cache` unless the remote already has it.
    pub fn push<C: CacheStore<H>>(&self, cache: &C, id: ContentId<H>) -> Result<Transfer, RemoteError> {
        if self.has(id)? {
            return Ok(Transfer::AlreadyPresent);
        }
        let bytes = cache.get(id).map_err(RemoteError::Cache)?;
        let len = bytes.len();
        let path = self.object_path(&id);
        let payload = PutPayload::from(bytes);
        let result = self.runtime.block_on(async {
            match self
                .store
                .put_opts(&path, payload.clone(), PutMode::Create.into())
                .await
            {
                // Backends without conditional writes. Overwriting is harmless
                // since the object under this path can only have these bytes.
                Err(object_store::Error::NotImplemented { .. }) => {
                    self.store.put(&path, payload).await.map(|_| ())
                }
                other => other.map(|_| ()),
            }
        });
        match result {
            Ok(()) => {
                debug!(remote = %self.name, %id, len, "uploaded object");
                Ok(Transfer::Transferred)
            }
            Err(object_store::Error::AlreadyExists { .. }) => Ok(Transfer::AlreadyPresent),
            Err(e) => Err(RemoteError::from_store(e, &id.to_string())),
        }
    }

    /// Downloads `id` and returns its verified bytes.
    pub fn pull(&self, id: ContentId<H>) -> Result<Bytes, RemoteError> {
        let name = id.to_string();
        let bytes = self.runtime.block_on(async {
            let result = self.store.get(&self.object_path(&id)).await?;
            result.bytes().await
        })
        .map_err(|e| RemoteError::from_store(e, &name))?;
        let actual = ContentId::<H>::digest(&bytes);
        if actual != id {
            return Err(RemoteError::IntegrityMismatch {
                expected: name,
                actual: actual.to_string(),
            });
        }
        Ok(bytes)
    }

    /// Streams `id` from the remote into `cache`. The cache checks the digest
    /// while writing, so a bad download never becomes a cache object.
    pub fn pull_into<C: CacheStore<H>>(
        &self,
        cache: &C,
        id: ContentId<H>,
    ) -> Result<Transfer, RemoteError> {
        if cache.has(id).map_err(RemoteError::Cache)? {
            return Ok(Transfer::AlreadyPresent);
        }
        let name = id.to_string();
        let result = self
            .runtime
            .block_on(self.store.get(&self.object_path(&id)))
            .map_err(|e| RemoteError::from_store(e, &name))?;
        let reader = DownloadReader {
            runtime: self.runtime.clone(),
            chunks: result.into_stream(),
            current: Bytes::new(),
        };
        match cache.put(id, reader) {
            Ok(stored) => {
                debug!(remote = %self.name, %id, "downloaded object");
                Ok(stored.into())
            }
            Err(CacheError::DigestMismatch { expected, actual }) => {
                warn!(remote = %self.name, %id, %actual, "remote object failed verification");
                Err(RemoteError::IntegrityMismatch { expected, actual })
            }
            Err(CacheError::Io(e)) => Err(download_error(e, &name)),
            Err(e) => Err(RemoteError::Cache(e)),
        }
    }

    /// Lists every object id on the remote.
    pub fn ids(&self) -> Result<Vec<ContentId<H>>, RemoteError> {
        let prefix = self.prefix.child(H::NAME);
        let listing: Vec<_> = self
            .runtime
            .block_on(self.store.list(Some(&prefix)).try_collect())
            .map_err(|e| RemoteError::from_store(e, H::NAME))?;
        let mut ids = Vec::new();
        for meta in listing {
            let parts: Vec<_> = meta.location.parts().collect();
            let [.., shard, rest] = parts.as_slice() else {
                continue;
            };
            if shard.as_ref().len() != SHARD_LEN {
                continue;
            }
            if let Ok(id) = ContentId::from_hex(&format!("{}{}", shard.as_ref(), rest.as_ref())) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Uploads every id in `ids` from `cache`.
    pub fn push_all<C, I>(&self, cache: &C, ids: I, options: &BatchOptions) -> BatchReport<H>
    where
        C: CacheStore<H>,
        I: IntoIterator<Item = ContentId<H>>,
    {
        let report = run_batch(ids.into_iter().collect(), options, |id| self.push(cache, id));
        self.log_report("push", &report);
        report
    }

    /// Downloads every id in `ids` into `cache`.
    pub fn pull_all<C, I>(&self, cache: &C, ids: I, options: &BatchOptions) -> BatchReport<H>
    where
        C: CacheStore<H>,
        I: IntoIterator<Item = ContentId<H>>,
    {
        let report = run_batch(ids.into_iter().collect(), options, |id| {
            self.pull_into(cache, id)
        });
        self.log_report("pull", &report);
        report
    }

    fn log_report(&self, op: &str, report: &BatchReport<H>) {
        for (id, err) in report.failures() {
            warn!(remote = %self.name, %id, error = %err, "{op} failed");
        }
        info!(
            remote = %self.name,
            transferred = report.count(Transfer::Transferred),
            present = report.count(Transfer::AlreadyPresent),
            skipped = report.count(Transfer::Skipped),
            failed = report.failures().count(),
            cancelled = report.cancelled,
            "{op} finished"
        );
    }
}

/// Runs `op` for every id on `options.jobs` worker threads.
fn run_batch<H, F>(ids: Vec<ContentId<H>>, options: &BatchOptions, op: F) -> BatchReport<H>
where
    H: HashProtocol,
    F: Fn(ContentId<H>) -> Result<Transfer, RemoteError> + Sync,
{
    let (work_tx, work_rx) = crossbeam_channel::unbounded();
    for item in ids.iter().copied().enumerate() {
        // The receiver is alive until the end of this function.
        let _ = work_tx.send(item);
    }
    drop(work_tx);

    let (done_tx, done_rx) = crossbeam_channel::unbounded();
    let workers = options.jobs.clamp(1, ids.len().max(1));
    let cancel = &options.cancel;
    let op = &op;
    thread::scope(|scope| {
        for _ in 0..workers {
            let work_rx = work_rx.clone();
            let done_tx = done_tx.clone();
            scope.spawn(move || {
                for (index, id) in work_rx.iter() {
                    let result = if cancel.is_cancelled() {
                        Ok(Transfer::Skipped)
                    } else {
                        op(id)
                    };
                    if done_tx.send((index, result)).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(done_tx);

    let mut results: Vec<Option<Result<Transfer, RemoteError>>> =
        ids.iter().map(|_| None).collect();
    for (index, result) in done_rx.iter() {
        results[index] = Some(result);
    }
    let items = ids
        .into_iter()
        .zip(results)
        .map(|(id, result)| ItemReport {
            id,
            result: result.unwrap_or(Ok(Transfer::Skipped)),
        })
        .collect();
    BatchReport {
        items,
        cancelled: cancel.is_cancelled(),
    }
}
