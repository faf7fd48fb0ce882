#![doc = include_str!("../README.md")]

pub mod cache;
pub mod config;
pub mod error;
pub mod hash;
pub mod history;
pub mod linker;
pub mod pointer;
pub mod remote;
pub mod state;
pub mod workspace;

pub use cache::{CacheError, CacheStore, DirCache, MemoryCache, Stored};
pub use config::{Config, ConfigError, RemoteConfig};
pub use error::{Error, ErrorKind};
pub use hash::{Blake2b, Blake3, ContentId, HashProtocol};
pub use history::{Change, CommitRef, History, HistoryError, MemoryHistory, Revision};
pub use linker::Drift;
pub use pointer::{PointerError, PointerRecord};
pub use remote::{BatchOptions, BatchReport, Cancel, Remote, RemoteError, Transfer};
pub use workspace::{AddOutcome, Checkout, PullReport, Scope, TrackState, Workspace};
