//! The versioning coordinator.
//!
//! A [`Workspace`] ties the pieces together for one working tree:
//!
//! - `add` hashes a file, stores it in the cache, writes its pointer file and
//!   excludes the file from ordinary version control,
//! - `checkout` reads a pointer and materializes its content, fetching it from
//!   the default remote when the cache lacks it,
//! - `push`, `fetch` and `pull` move the content referenced by a [`Scope`]
//!   between the cache and a remote,
//! - `gc` drops cache objects no pointer in a [`Scope`] refers to.
//!
//! Operations on one path are serialized, operations on different paths run
//! concurrently. A `Workspace` is `Sync` and can be shared behind an `Arc`.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde::ser::SerializeStruct;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::{CacheError, CacheStore, DirCache, Stored};
use crate::config::{Config, RemoteConfig, CONFIG_FILE, DIR_NAME, STATE_FILE};
use crate::error::Error;
use crate::hash::{Blake3, ContentId, HashProtocol, HashingReader};
use crate::history::{Change, CommitRef, History, Revision};
use crate::linker::{Drift, Linker};
use crate::pointer::{self, pointer_path, tracked_path, PointerRecord};
use crate::remote::{BatchOptions, BatchReport, Remote, RemoteError};
use crate::state::StateIndex;

/// Which pointer records make up the live set of an operation.
///
/// The working tree is always part of it; the history scopes add the
/// pointers recorded at the given revisions.
#[derive(Clone, Copy)]
pub enum Scope<'a> {
    Worktree,
    Revisions(&'a dyn History, &'a [Revision]),
    AllCommits(&'a dyn History),
}

impl fmt::Debug for Scope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Worktree => write!(f, "Worktree"),
            Scope::Revisions(_, revisions) => f.debug_tuple("Revisions").field(revisions).finish(),
            Scope::AllCommits(_) => write!(f, "AllCommits"),
        }
    }
}

/// Where a tracked path stands relative to its pointer and the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrackState {
    /// No pointer file exists for the path.
    Untracked,
    /// The pointer differs from the one at the head of the history.
    Added,
    /// The pointer matches the head of the history and the file matches the
    /// pointer.
    Committed,
    /// The file was changed after it was last added or checked out.
    Modified,
    /// The pointer changed but the file still holds the content last
    /// checked out.
    Stale,
    /// The pointer exists but the file does not.
    Missing,
}

#[derive(Serialize)]
#[serde(bound = "H: HashProtocol")]
pub struct AddOutcome<H: HashProtocol = Blake3> {
    pub pointer: PointerRecord<H>,
    pub stored: Stored,
}

impl<H: HashProtocol> fmt::Debug for AddOutcome<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddOutcome")
            .field("pointer", &self.pointer)
            .field("stored", &self.stored)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "status")]
pub enum Checkout {
    /// The file already held the pointer's content.
    Unchanged,
    /// The file was written, `fetched` tells whether the content had to be
    /// downloaded first.
    Materialized { fetched: bool },
}

/// The outcome of one path in a multi-path operation.
#[derive(Debug)]
pub struct PathResult<T> {
    pub path: PathBuf,
    pub result: Result<T, Error>,
}

impl<T: Serialize> Serialize for PathResult<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut item = serializer.serialize_struct("PathResult", 3)?;
        item.serialize_field("path", &self.path)?;
        match &self.result {
            Ok(value) => {
                item.serialize_field("result", value)?;
                item.skip_field("error")?;
            }
            Err(e) => {
                item.serialize_field("result", &e.kind())?;
                item.serialize_field("error", &e.to_string())?;
            }
        }
        item.end()
    }
}

/// What `pull` did: the transfer batch followed by a checkout of every
/// tracked path.
pub struct PullReport<H: HashProtocol = Blake3> {
    pub fetched: BatchReport<H>,
    pub checkouts: Vec<PathResult<Checkout>>,
}

impl<H: HashProtocol> PullReport<H> {
    pub fn ok(&self) -> bool {
        self.fetched.ok() && self.checkouts.iter().all(|c| c.result.is_ok())
    }
}

impl<H: HashProtocol> fmt::Debug for PullReport<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PullReport")
            .field("fetched", &self.fetched)
            .field("checkouts", &self.checkouts)
            .finish()
    }
}

impl<H: HashProtocol> Serialize for PullReport<H> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut report = serializer.serialize_struct("PullReport", 3)?;
        report.serialize_field("fetched", &self.fetched)?;
        report.serialize_field("checkouts", &self.checkouts)?;
        report.serialize_field("ok", &self.ok())?;
        report.end()
    }
}

#[derive(Default)]
struct PathLocks {
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl PathLocks {
    fn with<T>(&self, path: &Path, f: impl FnOnce() -> T) -> T {
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(path.to_path_buf())
            .or_default()
            .clone();
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }
}

pub struct Workspace<C, H: HashProtocol = Blake3> {
    root: PathBuf,
    cache: C,
    linker: Linker,
    config: RwLock<Config>,
    remotes: RwLock<HashMap<String, Arc<Remote<H>>>>,
    state: Mutex<StateIndex<H>>,
    locks: PathLocks,
    /// Held shared by operations that write the cache or pointers, and
    /// exclusively by `gc`.
    collecting: RwLock<()>,
}

impl<C, H: HashProtocol> fmt::Debug for Workspace<C, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workspace")
            .field("root", &self.root)
            .finish()
    }
}

/// The closest ancestor of `start` (or `start` itself) holding a workspace.
pub fn find_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(DIR_NAME).is_dir())
        .map(Path::to_path_buf)
}

impl<H: HashProtocol> Workspace<DirCache<H>, H> {
    /// Creates the metadata directory under `root` if needed and opens the
    /// workspace.
    pub fn init(root: impl AsRef<Path>) -> Result<Self, Error> {
        let root = fs::canonicalize(root)?;
        let meta = root.join(DIR_NAME);
        fs::create_dir_all(&meta)?;
        let config_path = meta.join(CONFIG_FILE);
        if !config_path.exists() {
            Config::default().save(&config_path)?;
        }
        info!(root = %root.display(), "initialized workspace");
        Self::open(root)
    }

    /// Opens an existing workspace with its on-disk cache.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, Error> {
        let root = fs::canonicalize(root)?;
        if !root.join(DIR_NAME).is_dir() {
            return Err(crate::config::ConfigError::NotAWorkspace(root).into());
        }
        let config = Config::load(&root.join(DIR_NAME).join(CONFIG_FILE))?;
        let cache = DirCache::open(config.cache_dir(&root))?;
        Self::assemble(root, cache, config)
    }
}

impl<C: CacheStore<H>, H: HashProtocol> Workspace<C, H> {
    /// Opens the workspace at `root` on top of an arbitrary cache.
    pub fn with_cache(root: impl AsRef<Path>, cache: C) -> Result<Self, Error> {
        let root = fs::canonicalize(root)?;
        fs::create_dir_all(root.join(DIR_NAME))?;
        let config = Config::load(&root.join(DIR_NAME).join(CONFIG_FILE))?;
        Self::assemble(root, cache, config)
    }

    fn assemble(root: PathBuf, cache: C, config: Config) -> Result<Self, Error> {
        let state = StateIndex::load(&root.join(DIR_NAME).join(STATE_FILE))?;
        Ok(Self {
            linker: Linker::new(&root),
            root,
            cache,
            config: RwLock::new(config),
            remotes: RwLock::new(HashMap::new()),
            state: Mutex::new(state),
            locks: PathLocks::default(),
            collecting: RwLock::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    pub fn config(&self) -> Config {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Starts tracking the file at `path`, or records its new content if it
    /// is tracked already.
    pub fn add(&self, path: impl AsRef<Path>) -> Result<AddOutcome<H>, Error> {
        let rel = self.relative(path.as_ref())?;
        if pointer::is_pointer_name(&rel) {
            return Err(Error::PointerName(rel));
        }
        let _shared = self.collecting.read().unwrap_or_else(PoisonError::into_inner);
        self.locks.with(&rel, || self.add_locked(&rel))
    }

    fn add_locked(&self, rel: &Path) -> Result<AddOutcome<H>, Error> {
        let full = self.root.join(rel);
        let meta = fs::metadata(&full)?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", rel.display()),
            )
            .into());
        }

        let known = self.memo().lookup(rel, &meta);
        let (id, size) = match known {
            Some(id) => (id, meta.len()),
            None => {
                let mut reader: HashingReader<File, H> = HashingReader::new(File::open(&full)?);
                io::copy(&mut reader, &mut io::sink())?;
                reader.finish()
            }
        };

        let stored = if self.cache.has(id)? {
            Stored::AlreadyPresent
        } else {
            match self.cache.put(id, File::open(&full)?) {
                Ok(stored) => stored,
                Err(CacheError::DigestMismatch { .. }) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("{} changed while it was being added", rel.display()),
                    )
                    .into())
                }
                Err(e) => return Err(e.into()),
            }
        };

        let record = PointerRecord::new(rel, id, size);
        let bytes = pointer::encode(&record).map_err(|source| Error::MalformedPointer {
            path: record.pointer_path(),
            source,
        })?;
        self.linker.write_atomic(&record.pointer_path(), &bytes)?;
        self.linker.ensure_ignored(rel)?;
        self.remember(rel, id, &meta)?;

        info!(path = %rel.display(), %id, size, ?stored, "added");
        Ok(AddOutcome {
            pointer: record,
            stored,
        })
    }

    /// Makes the file at `path` hold the content its pointer names.
    ///
    /// The file is left untouched if the content cannot be obtained.
    pub fn checkout(&self, path: impl AsRef<Path>) -> Result<Checkout, Error> {
        let rel = self.relative(path.as_ref())?;
        let _shared = self.collecting.read().unwrap_or_else(PoisonError::into_inner);
        self.locks.with(&rel, || {
            let record = self.read_pointer(&rel)?;
            self.materialize(&record)
        })
    }

    /// Restores `path` as it was at `revision`: the historical pointer is
    /// written into the working tree and its content materialized.
    pub fn checkout_at(
        &self,
        history: &dyn History,
        revision: &Revision,
        path: impl AsRef<Path>,
    ) -> Result<Checkout, Error> {
        let rel = self.relative(path.as_ref())?;
        let _shared = self.collecting.read().unwrap_or_else(PoisonError::into_inner);
        self.locks.with(&rel, || {
            let pointer = pointer_path(&rel);
            let bytes = history
                .read_at(revision, &pointer)?
                .ok_or_else(|| Error::NotTracked(rel.clone()))?;
            let record = self.decode_pointer(&rel, &bytes)?;
            let outcome = self.materialize(&record)?;
            self.linker.write_atomic(&pointer, &bytes)?;
            self.linker.ensure_ignored(&rel)?;
            Ok(outcome)
        })
    }

    fn materialize(&self, record: &PointerRecord<H>) -> Result<Checkout, Error> {
        let rel = record.path.as_path();
        let full = self.root.join(rel);
        if self.observe(rel)? == Some(record.id) {
            self.remember(rel, record.id, &fs::metadata(&full)?)?;
            debug!(path = %rel.display(), "already up to date");
            return Ok(Checkout::Unchanged);
        }

        let fetched = self.ensure_cached(record)?;
        let bytes = self.cache.get(record.id)?;
        self.linker.materialize(record, &bytes[..])?;
        drop(bytes);
        self.remember(rel, record.id, &fs::metadata(&full)?)?;

        info!(path = %rel.display(), id = %record.id, fetched, "checked out");
        Ok(Checkout::Materialized { fetched })
    }

    /// Makes sure the cache holds the record's content. Returns whether it
    /// had to be downloaded.
    fn ensure_cached(&self, record: &PointerRecord<H>) -> Result<bool, Error> {
        if self.cache.has(record.id)? {
            return Ok(false);
        }
        let unavailable = || Error::ArtifactUnavailable {
            path: record.path.clone(),
            id: record.id.to_string(),
        };
        if self.config().default_remote.is_none() {
            return Err(unavailable());
        }
        let remote = self.remote(None)?;
        match remote.pull_into(&self.cache, record.id) {
            Ok(_) => Ok(true),
            Err(RemoteError::NotFound(_)) => Err(unavailable()),
            Err(e) => Err(e.into()),
        }
    }

    /// Records the pointers of `paths` as one commit. With no paths every
    /// pointer change in the working tree is committed, including removals.
    ///
    /// Committing pointers that match the head creates no commit and returns
    /// the head.
    pub fn commit(
        &self,
        history: &mut dyn History,
        paths: &[PathBuf],
        message: &str,
    ) -> Result<CommitRef, Error> {
        let mut changes = Vec::new();
        if paths.is_empty() {
            let tracked: BTreeSet<PathBuf> = self.pointer_files()?.into_iter().collect();
            for rel in &tracked {
                let pointer = pointer_path(rel);
                changes.push(Change::write(&pointer, fs::read(self.root.join(&pointer))?));
            }
            for pointer in history.paths_at(&Revision::Head)? {
                if let Some(rel) = tracked_path(&pointer) {
                    if !tracked.contains(&rel) {
                        changes.push(Change::delete(pointer));
                    }
                }
            }
        } else {
            for path in paths {
                let rel = self.relative(path)?;
                let pointer = pointer_path(&rel);
                match fs::read(self.root.join(&pointer)) {
                    Ok(bytes) => changes.push(Change::write(&pointer, bytes)),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        if history.read_at(&Revision::Head, &pointer)?.is_none() {
                            return Err(Error::NotTracked(rel));
                        }
                        changes.push(Change::delete(pointer));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        let commit = history.commit(&changes, message)?;
        info!(%commit, changes = changes.len(), subject = message, "committed pointers");
        Ok(commit)
    }

    /// Uploads the content referenced by `scope` to a remote.
    pub fn push(&self, scope: Scope<'_>, remote: Option<&str>) -> Result<BatchReport<H>, Error> {
        self.push_with(scope, remote, &self.batch_options())
    }

    pub fn push_with(
        &self,
        scope: Scope<'_>,
        remote: Option<&str>,
        options: &BatchOptions,
    ) -> Result<BatchReport<H>, Error> {
        let remote = self.remote(remote)?;
        let live = self.live_set(scope)?;
        Ok(remote.push_all(&self.cache, live, options))
    }

    /// Downloads the content referenced by `scope` into the cache without
    /// touching the working tree.
    pub fn fetch(&self, scope: Scope<'_>, remote: Option<&str>) -> Result<BatchReport<H>, Error> {
        self.fetch_with(scope, remote, &self.batch_options())
    }

    pub fn fetch_with(
        &self,
        scope: Scope<'_>,
        remote: Option<&str>,
        options: &BatchOptions,
    ) -> Result<BatchReport<H>, Error> {
        let remote = self.remote(remote)?;
        let _shared = self.collecting.read().unwrap_or_else(PoisonError::into_inner);
        let live = self.live_set(scope)?;
        Ok(remote.pull_all(&self.cache, live, options))
    }

    /// Fetches the content referenced by `scope`, then checks out every
    /// tracked path of the working tree.
    pub fn pull(&self, scope: Scope<'_>, remote: Option<&str>) -> Result<PullReport<H>, Error> {
        self.pull_with(scope, remote, &self.batch_options())
    }

    pub fn pull_with(
        &self,
        scope: Scope<'_>,
        remote: Option<&str>,
        options: &BatchOptions,
    ) -> Result<PullReport<H>, Error> {
        let fetched = self.fetch_with(scope, remote, options)?;
        let mut checkouts = Vec::new();
        if !fetched.cancelled {
            for path in self.tracked()? {
                let result = self.checkout(&path);
                if let Err(e) = &result {
                    warn!(path = %path.display(), error = %e, "checkout failed");
                }
                checkouts.push(PathResult { path, result });
            }
        }
        Ok(PullReport { fetched, checkouts })
    }

    /// Deletes cache objects not referenced by `scope`. Returns how many were
    /// removed.
    pub fn gc(&self, scope: Scope<'_>) -> Result<usize, Error> {
        let _exclusive = self
            .collecting
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let live: HashSet<ContentId<H>> = self.live_set(scope)?.into_iter().collect();
        let removed = self.cache.gc(&live)?;
        info!(live = live.len(), removed, "collected cache");
        Ok(removed)
    }

    /// Re-hashes every cache object. Corrupted objects are quarantined and
    /// returned.
    pub fn verify(&self) -> Result<Vec<ContentId<H>>, Error> {
        let corrupted = self.cache.verify()?;
        for id in &corrupted {
            warn!(%id, "corrupted cache object");
        }
        Ok(corrupted)
    }

    /// How the file at `path` relates to its pointer.
    pub fn status(&self, path: impl AsRef<Path>) -> Result<Drift, Error> {
        let rel = self.relative(path.as_ref())?;
        let record = self.read_pointer(&rel)?;
        Ok(self
            .linker
            .detect_drift(&rel, record.id, |meta| self.memo().lookup(&rel, meta))?)
    }

    /// Where `path` stands in its lifecycle, judged against the head of
    /// `history`.
    pub fn state(&self, history: &dyn History, path: impl AsRef<Path>) -> Result<TrackState, Error> {
        let rel = self.relative(path.as_ref())?;
        let pointer = pointer_path(&rel);
        let bytes = match fs::read(self.root.join(&pointer)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(TrackState::Untracked),
            Err(e) => return Err(e.into()),
        };
        let record = self.decode_pointer(&rel, &bytes)?;
        match self.observe(&rel)? {
            None => Ok(TrackState::Missing),
            Some(current) if current != record.id => {
                if self.memo().last(&rel) == Some(current) {
                    Ok(TrackState::Stale)
                } else {
                    Ok(TrackState::Modified)
                }
            }
            Some(_) => {
                let committed = history.read_at(&Revision::Head, &pointer)?;
                if committed.as_deref() == Some(&bytes[..]) {
                    Ok(TrackState::Committed)
                } else {
                    Ok(TrackState::Added)
                }
            }
        }
    }

    /// Every tracked path in the working tree, sorted. Pointer files that
    /// fail to decode are skipped with a warning.
    pub fn tracked(&self) -> Result<Vec<PathBuf>, Error> {
        Ok(self.pointers()?.into_iter().map(|record| record.path).collect())
    }

    /// The decodable pointer records of the working tree, sorted by path.
    fn pointers(&self) -> Result<Vec<PointerRecord<H>>, Error> {
        let mut records = Vec::new();
        for rel in self.pointer_files()? {
            match self.read_pointer(&rel) {
                Ok(record) => records.push(record),
                Err(e @ Error::MalformedPointer { .. }) => {
                    warn!(path = %rel.display(), error = %e, "skipping malformed pointer");
                }
                // Untracked since the directory was listed.
                Err(Error::NotTracked(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    /// Tracked paths of every pointer file in the working tree, sorted.
    fn pointer_files(&self) -> Result<Vec<PathBuf>, Error> {
        let mut tracked = Vec::new();
        let mut pending = vec![PathBuf::new()];
        while let Some(dir) = pending.pop() {
            for entry in fs::read_dir(self.root.join(&dir))? {
                let entry = entry?;
                let name = entry.file_name();
                let file_type = entry.file_type()?;
                let rel = dir.join(&name);
                if file_type.is_dir() {
                    if name != DIR_NAME && name != ".git" {
                        pending.push(rel);
                    }
                } else if file_type.is_file() {
                    if let Some(path) = tracked_path(&rel) {
                        tracked.push(path);
                    }
                }
            }
        }
        tracked.sort();
        Ok(tracked)
    }

    /// Stops tracking `path`. The file itself and the cache are left alone.
    /// Returns whether the path was tracked.
    pub fn untrack(&self, path: impl AsRef<Path>) -> Result<bool, Error> {
        let rel = self.relative(path.as_ref())?;
        self.locks.with(&rel, || {
            match fs::remove_file(self.root.join(pointer_path(&rel))) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
                Err(e) => return Err(e.into()),
            }
            self.linker.unignore(&rel)?;
            let mut state = self.memo();
            if state.forget(&rel) {
                state.save(&self.state_path())?;
            }
            info!(path = %rel.display(), "untracked");
            Ok(true)
        })
    }

    /// Adds or replaces a remote and saves the configuration.
    pub fn add_remote(&self, name: &str, url: &str, make_default: bool) -> Result<(), Error> {
        self.update_config(|config| config.add_remote(name, url, make_default))?;
        self.remotes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        info!(name, url, make_default, "configured remote");
        Ok(())
    }

    pub fn set_default_remote(&self, name: &str) -> Result<(), Error> {
        self.update_config(|config| config.set_default_remote(name))
    }

    pub fn remove_remote(&self, name: &str) -> Result<(), Error> {
        self.update_config(|config| config.remove_remote(name).map(|_| ()))?;
        self.remotes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        Ok(())
    }

    /// The configured remotes and the name of the default one.
    pub fn remotes(&self) -> (BTreeMap<String, RemoteConfig>, Option<String>) {
        let config = self.config();
        (config.remotes, config.default_remote)
    }

    fn update_config<T>(
        &self,
        change: impl FnOnce(&mut Config) -> Result<T, crate::config::ConfigError>,
    ) -> Result<T, Error> {
        let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
        let mut updated = config.clone();
        let value = change(&mut updated)?;
        updated.save(&self.root.join(DIR_NAME).join(CONFIG_FILE))?;
        *config = updated;
        Ok(value)
    }

    /// The remote called `name`, or the default remote.
    pub fn remote(&self, name: Option<&str>) -> Result<Arc<Remote<H>>, Error> {
        let (name, url) = {
            let config = self.config.read().unwrap_or_else(PoisonError::into_inner);
            let (name, remote) = config.resolve_remote(name)?;
            (name.to_owned(), remote.url()?)
        };
        if let Some(remote) = self
            .remotes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name)
        {
            return Ok(remote.clone());
        }
        let remote = Arc::new(Remote::with_url(name.clone(), &url)?);
        Ok(self
            .remotes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name)
            .or_insert(remote)
            .clone())
    }

    /// Content ids referenced by the pointers in `scope`, sorted.
    pub fn live_set(&self, scope: Scope<'_>) -> Result<Vec<ContentId<H>>, Error> {
        let mut live = BTreeSet::new();
        for record in self.pointers()? {
            live.insert(record.id);
        }
        let (history, revisions) = match scope {
            Scope::Worktree => return Ok(live.into_iter().collect()),
            Scope::Revisions(history, revisions) => (history, revisions.to_vec()),
            Scope::AllCommits(history) => (
                history,
                history
                    .commits()?
                    .into_iter()
                    .map(Revision::Commit)
                    .collect(),
            ),
        };
        for revision in &revisions {
            for pointer in history.paths_at(revision)? {
                let Some(rel) = tracked_path(&pointer) else {
                    continue;
                };
                let Some(bytes) = history.read_at(revision, &pointer)? else {
                    continue;
                };
                match self.decode_pointer(&rel, &bytes) {
                    Ok(record) => {
                        live.insert(record.id);
                    }
                    Err(e) => {
                        warn!(
                            ?revision,
                            path = %rel.display(),
                            error = %e,
                            "skipping malformed pointer"
                        );
                    }
                }
            }
        }
        Ok(live.into_iter().collect())
    }

    fn batch_options(&self) -> BatchOptions {
        BatchOptions::with_jobs(self.config().jobs())
    }

    fn read_pointer(&self, rel: &Path) -> Result<PointerRecord<H>, Error> {
        let bytes = match fs::read(self.root.join(pointer_path(rel))) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotTracked(rel.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };
        self.decode_pointer(rel, &bytes)
    }

    /// Decodes the pointer for `rel`. The pointer file's location decides the
    /// tracked path, so a pointer moved along with its file keeps working.
    fn decode_pointer(&self, rel: &Path, bytes: &[u8]) -> Result<PointerRecord<H>, Error> {
        let mut record: PointerRecord<H> =
            pointer::decode(bytes).map_err(|source| Error::MalformedPointer {
                path: pointer_path(rel),
                source,
            })?;
        if record.path != rel {
            debug!(
                recorded = %record.path.display(),
                path = %rel.display(),
                "pointer names another path"
            );
            record.path = rel.to_path_buf();
        }
        Ok(record)
    }

    /// The content id of the file at `rel`, `None` if it does not exist.
    fn observe(&self, rel: &Path) -> Result<Option<ContentId<H>>, Error> {
        Ok(self
            .linker
            .observe(rel, |meta| self.memo().lookup(rel, meta))?)
    }

    fn remember(&self, rel: &Path, id: ContentId<H>, meta: &fs::Metadata) -> Result<(), Error> {
        let mut state = self.memo();
        state.record(rel, id, meta);
        state.save(&self.state_path())?;
        Ok(())
    }

    fn memo(&self) -> MutexGuard<'_, StateIndex<H>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_path(&self) -> PathBuf {
        self.root.join(DIR_NAME).join(STATE_FILE)
    }

    /// Turns `path` into a normalized path relative to the root.
    fn relative(&self, path: &Path) -> Result<PathBuf, Error> {
        let outside = || Error::OutsideWorkspace(path.to_path_buf());
        let rel = if path.is_absolute() {
            path.strip_prefix(&self.root).map_err(|_| outside())?
        } else {
            path
        };
        let mut normalized = PathBuf::new();
        for component in rel.components() {
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(outside());
                    }
                }
                _ => return Err(outside()),
            }
        }
        match normalized.components().next() {
            None => Err(outside()),
            Some(Component::Normal(first)) if first == DIR_NAME => Err(outside()),
            _ => Ok(normalized),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::history::MemoryHistory;
    use tempfile::tempdir;

    fn workspace(dir: &Path) -> Workspace<MemoryCache> {
        Workspace::with_cache(dir, MemoryCache::new()).unwrap()
    }

    #[test]
    fn relative_paths_are_normalized() {
        let dir = tempdir().unwrap();
        let ws = workspace(dir.path());
        assert_eq!(
            ws.relative(Path::new("./data/x.csv")).unwrap(),
            PathBuf::from("data/x.csv")
        );
        assert_eq!(
            ws.relative(&ws.root().join("data/x.csv")).unwrap(),
            PathBuf::from("data/x.csv")
        );
        assert_eq!(
            ws.relative(&ws.root().join("sub/../data/x.csv")).unwrap(),
            PathBuf::from("data/x.csv")
        );
        for bad in [
            "../x",
            "",
            ".datapile/config.yaml",
            "/elsewhere/x",
            "data/../../x",
            "data/../.datapile/state.json",
        ] {
            assert!(
                matches!(ws.relative(Path::new(bad)), Err(Error::OutsideWorkspace(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn add_writes_pointer_and_ignore_entry() {
        let dir = tempdir().unwrap();
        let ws = workspace(dir.path());
        fs::create_dir_all(dir.path().join("data")).unwrap();
        fs::write(dir.path().join("data/x.csv"), b"id,v\n1,2\n").unwrap();

        let outcome = ws.add("data/x.csv").unwrap();
        assert_eq!(outcome.stored, Stored::Written);
        assert_eq!(outcome.pointer.size, 9);
        let text = fs::read_to_string(dir.path().join("data/x.csv.ptr")).unwrap();
        assert!(text.contains("path: data/x.csv"));
        assert_eq!(
            fs::read_to_string(dir.path().join("data/.gitignore")).unwrap(),
            "/x.csv\n"
        );
        assert_eq!(ws.tracked().unwrap(), vec![PathBuf::from("data/x.csv")]);
        assert_eq!(ws.status("data/x.csv").unwrap(), Drift::Unchanged);
    }

    #[test]
    fn lifecycle_states() {
        let dir = tempdir().unwrap();
        let ws = workspace(dir.path());
        let mut history = MemoryHistory::new();
        let file = dir.path().join("model.bin");

        assert_eq!(ws.state(&history, "model.bin").unwrap(), TrackState::Untracked);
        fs::write(&file, b"weights v1").unwrap();
        ws.add("model.bin").unwrap();
        assert_eq!(ws.state(&history, "model.bin").unwrap(), TrackState::Added);

        ws.commit(&mut history, &[], "v1").unwrap();
        assert_eq!(ws.state(&history, "model.bin").unwrap(), TrackState::Committed);

        fs::write(&file, b"weights v2, retrained").unwrap();
        assert_eq!(ws.state(&history, "model.bin").unwrap(), TrackState::Modified);
        ws.add("model.bin").unwrap();
        let v2 = ws.commit(&mut history, &[], "v2").unwrap();

        // Roll the pointer back behind the engine's back.
        let v1 = history.find("v1").unwrap();
        let old = history
            .read_at(&v1.into(), Path::new("model.bin.ptr"))
            .unwrap()
            .unwrap();
        fs::write(dir.path().join("model.bin.ptr"), old).unwrap();
        assert_eq!(ws.state(&history, "model.bin").unwrap(), TrackState::Stale);

        ws.checkout("model.bin").unwrap();
        assert_eq!(fs::read(&file).unwrap(), b"weights v1");
        assert_eq!(ws.state(&history, "model.bin").unwrap(), TrackState::Added);

        ws.checkout_at(&history, &v2.into(), "model.bin").unwrap();
        assert_eq!(ws.state(&history, "model.bin").unwrap(), TrackState::Committed);

        fs::remove_file(&file).unwrap();
        assert_eq!(ws.state(&history, "model.bin").unwrap(), TrackState::Missing);
    }

    #[test]
    fn commit_without_changes_returns_head() {
        let dir = tempdir().unwrap();
        let ws = workspace(dir.path());
        let mut history = MemoryHistory::new();
        fs::write(dir.path().join("a.csv"), b"a").unwrap();
        ws.add("a.csv").unwrap();
        let first = ws.commit(&mut history, &[], "add a").unwrap();
        let again = ws.commit(&mut history, &[PathBuf::from("a.csv")], "again").unwrap();
        assert_eq!(first, again);
        assert_eq!(history.commits().unwrap().len(), 1);

        assert!(matches!(
            ws.commit(&mut history, &[PathBuf::from("nope.csv")], "x"),
            Err(Error::NotTracked(_))
        ));
    }

    #[test]
    fn untrack_keeps_data() {
        let dir = tempdir().unwrap();
        let ws = workspace(dir.path());
        let mut history = MemoryHistory::new();
        fs::write(dir.path().join("a.csv"), b"a").unwrap();
        ws.add("a.csv").unwrap();
        ws.commit(&mut history, &[], "add").unwrap();

        assert!(ws.untrack("a.csv").unwrap());
        assert!(!ws.untrack("a.csv").unwrap());
        assert!(dir.path().join("a.csv").is_file());
        assert!(!dir.path().join("a.csv.ptr").exists());
        assert_eq!(fs::read_to_string(dir.path().join(".gitignore")).unwrap(), "");
        assert!(ws.tracked().unwrap().is_empty());

        ws.commit(&mut history, &[], "drop").unwrap();
        assert!(history.paths_at(&Revision::Head).unwrap().is_empty());
    }

    #[test]
    fn missing_pointer_is_not_tracked() {
        let dir = tempdir().unwrap();
        let ws = workspace(dir.path());
        assert!(matches!(ws.checkout("x.bin"), Err(Error::NotTracked(_))));
        assert!(matches!(ws.status("x.bin"), Err(Error::NotTracked(_))));
    }

    #[test]
    fn malformed_pointer_is_reported() {
        let dir = tempdir().unwrap();
        let ws = workspace(dir.path());
        fs::write(dir.path().join("x.bin.ptr"), b"format-version: 1\npath: x.bin\n").unwrap();
        let err = ws.checkout("x.bin").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::MalformedPointer);
    }

    #[test]
    fn live_set_covers_history() {
        let dir = tempdir().unwrap();
        let ws = workspace(dir.path());
        let mut history = MemoryHistory::new();
        let file = dir.path().join("t.csv");

        fs::write(&file, b"v1").unwrap();
        let v1 = ws.add("t.csv").unwrap().pointer.id;
        let c1 = ws.commit(&mut history, &[], "v1").unwrap();
        fs::write(&file, b"v2").unwrap();
        let v2 = ws.add("t.csv").unwrap().pointer.id;
        ws.commit(&mut history, &[], "v2").unwrap();

        assert_eq!(ws.live_set(Scope::Worktree).unwrap(), vec![v2]);
        let revisions = [Revision::Commit(c1)];
        let mut expected = vec![v1, v2];
        expected.sort();
        assert_eq!(
            ws.live_set(Scope::Revisions(&history, &revisions)).unwrap(),
            expected
        );
        assert_eq!(ws.live_set(Scope::AllCommits(&history)).unwrap(), expected);

        assert_eq!(ws.gc(Scope::AllCommits(&history)).unwrap(), 0);
        assert_eq!(ws.gc(Scope::Worktree).unwrap(), 1);
        assert_eq!(ws.cache().ids().unwrap(), vec![v2]);
    }
}
