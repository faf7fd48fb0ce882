//! The revision-control side of the engine.
//!
//! Pointer files are small text and belong in ordinary version control. The
//! engine only needs a narrow view of it: read a file as of some revision,
//! record new pointer contents as a commit, and enumerate commits and the
//! paths they contain. [`History`] is that view. [`MemoryHistory`] is an
//! in-process implementation used by tests and embedders that keep history
//! themselves.

use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use digest::Digest;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::hash::{Blake3, ContentId, ParseIdError};

/// Identifies one commit.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommitRef(ContentId<Blake3>);

impl CommitRef {
    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }

    /// The first 12 hex characters, for display.
    pub fn short(&self) -> String {
        self.0.to_hex()[..12].to_owned()
    }
}

impl fmt::Display for CommitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_hex())
    }
}

impl fmt::Debug for CommitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommitRef({})", self.short())
    }
}

impl FromStr for CommitRef {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(CommitRef(ContentId::from_hex(s)?))
    }
}

impl Serialize for CommitRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CommitRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// A point in history to read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revision {
    /// The most recent commit.
    Head,
    Commit(CommitRef),
}

impl From<CommitRef> for Revision {
    fn from(commit: CommitRef) -> Self {
        Revision::Commit(commit)
    }
}

/// One file change in a commit. `None` content deletes the path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub path: PathBuf,
    pub content: Option<Vec<u8>>,
}

impl Change {
    pub fn write(path: impl Into<PathBuf>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            content: Some(content.into()),
        }
    }

    pub fn delete(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            content: None,
        }
    }
}

#[derive(Debug)]
pub enum HistoryError {
    UnknownRevision(String),
    /// The history has no commits yet.
    Empty,
    Backend(Box<dyn Error + Send + Sync>),
}

impl fmt::Display for HistoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistoryError::UnknownRevision(rev) => write!(f, "unknown revision {rev}"),
            HistoryError::Empty => write!(f, "history has no commits"),
            HistoryError::Backend(e) => write!(f, "history backend error: {e}"),
        }
    }
}

impl Error for HistoryError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            HistoryError::Backend(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

/// Read and write access to the version control system holding pointer files.
pub trait History: Send + Sync {
    /// The content of `path` at `revision`, `None` if the path did not exist
    /// there. Reading [`Revision::Head`] of an empty history yields `None`.
    fn read_at(&self, revision: &Revision, path: &Path) -> Result<Option<Vec<u8>>, HistoryError>;

    /// Records `changes` as one commit on top of the head.
    ///
    /// A commit that would not change any content is not created, the current
    /// head is returned instead.
    fn commit(&mut self, changes: &[Change], message: &str) -> Result<CommitRef, HistoryError>;

    /// Every path present at `revision`, sorted.
    fn paths_at(&self, revision: &Revision) -> Result<Vec<PathBuf>, HistoryError>;

    /// All commits, oldest first.
    fn commits(&self) -> Result<Vec<CommitRef>, HistoryError>;

    fn head(&self) -> Result<Option<CommitRef>, HistoryError> {
        Ok(self.commits()?.last().copied())
    }

    /// Records a single file.
    fn write(&mut self, path: &Path, bytes: &[u8], message: &str) -> Result<CommitRef, HistoryError> {
        self.commit(&[Change::write(path, bytes)], message)
    }
}

struct Commit {
    id: CommitRef,
    message: String,
    tree: BTreeMap<PathBuf, Vec<u8>>,
}

/// An append-only history kept in memory.
///
/// Every commit stores a full snapshot of its tree. Pointer files are tiny, so
/// this stays cheap for the histories this is meant for.
#[derive(Default)]
pub struct MemoryHistory {
    commits: Vec<Commit>,
    index: HashMap<CommitRef, usize>,
}

impl fmt::Debug for MemoryHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryHistory")
            .field("commits", &self.commits.len())
            .finish()
    }
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recent commit whose message is `message`.
    pub fn find(&self, message: &str) -> Option<CommitRef> {
        self.commits
            .iter()
            .rev()
            .find(|commit| commit.message == message)
            .map(|commit| commit.id)
    }

    /// Commits with their messages, newest first.
    pub fn log(&self) -> Vec<(CommitRef, &str)> {
        self.commits
            .iter()
            .rev()
            .map(|commit| (commit.id, commit.message.as_str()))
            .collect()
    }

    fn resolve(&self, revision: &Revision) -> Result<Option<&Commit>, HistoryError> {
        match revision {
            Revision::Head => Ok(self.commits.last()),
            Revision::Commit(id) => self
                .index
                .get(id)
                .map(|&i| Some(&self.commits[i]))
                .ok_or_else(|| HistoryError::UnknownRevision(id.to_string())),
        }
    }

    fn commit_id(
        parent: Option<CommitRef>,
        message: &str,
        tree: &BTreeMap<PathBuf, Vec<u8>>,
    ) -> CommitRef {
        let mut hasher = Blake3::new();
        if let Some(parent) = parent {
            Digest::update(&mut hasher, parent.0.raw);
        }
        Digest::update(&mut hasher, (message.len() as u64).to_le_bytes());
        Digest::update(&mut hasher, message.as_bytes());
        for (path, content) in tree {
            let path = path.to_string_lossy();
            Digest::update(&mut hasher, (path.len() as u64).to_le_bytes());
            Digest::update(&mut hasher, path.as_bytes());
            Digest::update(&mut hasher, (content.len() as u64).to_le_bytes());
            Digest::update(&mut hasher, content);
        }
        CommitRef(ContentId::new(hasher.finalize().into()))
    }
}

impl History for MemoryHistory {
    fn read_at(&self, revision: &Revision, path: &Path) -> Result<Option<Vec<u8>>, HistoryError> {
        Ok(self
            .resolve(revision)?
            .and_then(|commit| commit.tree.get(path).cloned()))
    }

    fn commit(&mut self, changes: &[Change], message: &str) -> Result<CommitRef, HistoryError> {
        let parent = self.commits.last();
        let mut tree = parent.map(|c| c.tree.clone()).unwrap_or_default();
        for change in changes {
            match &change.content {
                Some(content) => {
                    tree.insert(change.path.clone(), content.clone());
                }
                None => {
                    tree.remove(&change.path);
                }
            }
        }
        if let Some(parent) = parent {
            if parent.tree == tree {
                return Ok(parent.id);
            }
        }
        let id = Self::commit_id(parent.map(|c| c.id), message, &tree);
        self.index.insert(id, self.commits.len());
        self.commits.push(Commit {
            id,
            message: message.to_owned(),
            tree,
        });
        Ok(id)
    }

    fn paths_at(&self, revision: &Revision) -> Result<Vec<PathBuf>, HistoryError> {
        Ok(self
            .resolve(revision)?
            .map(|commit| commit.tree.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn commits(&self) -> Result<Vec<CommitRef>, HistoryError> {
        Ok(self.commits.iter().map(|commit| commit.id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_back_old_revisions() {
        let mut history = MemoryHistory::new();
        let path = Path::new("data/transacoes.csv.ptr");
        let v1 = history.write(path, b"one", "Dados v1").unwrap();
        let v2 = history.write(path, b"two", "Dados v2").unwrap();
        assert_ne!(v1, v2);

        assert_eq!(history.read_at(&v1.into(), path).unwrap().unwrap(), b"one");
        assert_eq!(history.read_at(&Revision::Head, path).unwrap().unwrap(), b"two");
        assert_eq!(history.head().unwrap(), Some(v2));
        assert_eq!(history.find("Dados v1"), Some(v1));
        assert_eq!(history.commits().unwrap(), vec![v1, v2]);
        assert_eq!(history.log()[0], (v2, "Dados v2"));
    }

    #[test]
    fn unchanged_commit_is_not_recorded() {
        let mut history = MemoryHistory::new();
        let path = Path::new("a.ptr");
        let first = history.write(path, b"x", "add").unwrap();
        let again = history.write(path, b"x", "add again").unwrap();
        assert_eq!(first, again);
        assert_eq!(history.commits().unwrap().len(), 1);
    }

    #[test]
    fn deletions_and_paths() {
        let mut history = MemoryHistory::new();
        let first = history
            .commit(
                &[Change::write("b.ptr", "b"), Change::write("a.ptr", "a")],
                "two files",
            )
            .unwrap();
        history.commit(&[Change::delete("a.ptr")], "drop a").unwrap();

        assert_eq!(
            history.paths_at(&first.into()).unwrap(),
            vec![PathBuf::from("a.ptr"), PathBuf::from("b.ptr")]
        );
        assert_eq!(
            history.paths_at(&Revision::Head).unwrap(),
            vec![PathBuf::from("b.ptr")]
        );
        assert_eq!(history.read_at(&Revision::Head, Path::new("a.ptr")).unwrap(), None);
    }

    #[test]
    fn empty_history_and_unknown_revisions() {
        let history = MemoryHistory::new();
        assert_eq!(history.head().unwrap(), None);
        assert_eq!(history.read_at(&Revision::Head, Path::new("x")).unwrap(), None);
        assert!(history.paths_at(&Revision::Head).unwrap().is_empty());

        let bogus: CommitRef = "00".repeat(32).parse().unwrap();
        assert!(matches!(
            history.read_at(&bogus.into(), Path::new("x")),
            Err(HistoryError::UnknownRevision(_))
        ));
    }

    #[test]
    fn commit_ref_text_form() {
        let mut history = MemoryHistory::new();
        let id = history.write(Path::new("p"), b"1", "m").unwrap();
        let parsed: CommitRef = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(id.short().len(), 12);
    }
}
