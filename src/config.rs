//! Workspace configuration.
//!
//! Stored as YAML in `.datapile/config.yaml`:
//!
//! ```text
//! default-remote: storage
//! jobs: 4
//! remotes:
//!   storage:
//!     url: file:///srv/datapile
//! ```
//!
//! A missing file is the empty configuration. At most one remote is the
//! default, and it has to be one of the configured remotes.

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use url::Url;

/// Name of the per-workspace metadata directory.
pub const DIR_NAME: &str = ".datapile";
pub const CONFIG_FILE: &str = "config.yaml";
pub const CACHE_DIR: &str = "cache";
pub const STATE_FILE: &str = "state.json";

/// Number of concurrent transfers used when `jobs` is not configured.
pub const DEFAULT_JOBS: usize = 4;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_remote: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jobs: Option<usize>,
    /// Overrides the cache location, relative paths are resolved against the
    /// workspace root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
    #[serde(default)]
    pub remotes: BTreeMap<String, RemoteConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub url: String,
}

impl RemoteConfig {
    pub fn url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.url).map_err(|source| ConfigError::BadUrl {
            url: self.url.clone(),
            source,
        })
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Yaml(serde_yaml::Error),
    BadUrl {
        url: String,
        source: url::ParseError,
    },
    UnknownRemote(String),
    NoDefaultRemote,
    /// The directory has no `.datapile` metadata directory.
    NotAWorkspace(PathBuf),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "config io error: {e}"),
            ConfigError::Yaml(e) => write!(f, "invalid config: {e}"),
            ConfigError::BadUrl { url, source } => write!(f, "invalid remote url {url:?}: {source}"),
            ConfigError::UnknownRemote(name) => write!(f, "no remote named {name:?}"),
            ConfigError::NoDefaultRemote => {
                write!(f, "no remote given and no default remote configured")
            }
            ConfigError::NotAWorkspace(path) => {
                write!(f, "{} is not a workspace (no {DIR_NAME})", path.display())
            }
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Yaml(e) => Some(e),
            ConfigError::BadUrl { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(err: io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Yaml(err)
    }
}

impl Config {
    /// Reads and validates the config at `path`. A missing file yields the
    /// default configuration.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Config::default()),
            Err(e) => return Err(e.into()),
        };
        if text.trim().is_empty() {
            return Ok(Config::default());
        }
        let config: Config = serde_yaml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the config to `path`, replacing the old file atomically.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;
        let text = serde_yaml::to_string(self)?;
        let dir = path.parent().unwrap_or(Path::new("."));
        let mut staged = NamedTempFile::new_in(dir)?;
        staged.write_all(text.as_bytes())?;
        staged.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(name) = &self.default_remote {
            if !self.remotes.contains_key(name) {
                return Err(ConfigError::UnknownRemote(name.clone()));
            }
        }
        for remote in self.remotes.values() {
            remote.url()?;
        }
        Ok(())
    }

    /// Adds or replaces the remote `name`.
    pub fn add_remote(
        &mut self,
        name: &str,
        url: &str,
        make_default: bool,
    ) -> Result<(), ConfigError> {
        let remote = RemoteConfig {
            url: url.to_owned(),
        };
        remote.url()?;
        self.remotes.insert(name.to_owned(), remote);
        if make_default {
            self.default_remote = Some(name.to_owned());
        }
        Ok(())
    }

    pub fn set_default_remote(&mut self, name: &str) -> Result<(), ConfigError> {
        if !self.remotes.contains_key(name) {
            return Err(ConfigError::UnknownRemote(name.to_owned()));
        }
        self.default_remote = Some(name.to_owned());
        Ok(())
    }

    /// Removes the remote `name`, clearing the default if it pointed there.
    pub fn remove_remote(&mut self, name: &str) -> Result<RemoteConfig, ConfigError> {
        let removed = self
            .remotes
            .remove(name)
            .ok_or_else(|| ConfigError::UnknownRemote(name.to_owned()))?;
        if self.default_remote.as_deref() == Some(name) {
            self.default_remote = None;
        }
        Ok(removed)
    }

    /// The remote to use: `name` if given, otherwise the default.
    pub fn resolve_remote<'a>(
        &'a self,
        name: Option<&'a str>,
    ) -> Result<(&'a str, &'a RemoteConfig), ConfigError> {
        let name = name
            .or(self.default_remote.as_deref())
            .ok_or(ConfigError::NoDefaultRemote)?;
        let remote = self
            .remotes
            .get(name)
            .ok_or_else(|| ConfigError::UnknownRemote(name.to_owned()))?;
        Ok((name, remote))
    }

    pub fn jobs(&self) -> usize {
        self.jobs.unwrap_or(DEFAULT_JOBS).max(1)
    }

    /// The cache directory for a workspace rooted at `root`.
    pub fn cache_dir(&self, root: &Path) -> PathBuf {
        match &self.cache_dir {
            Some(dir) => root.join(dir),
            None => root.join(DIR_NAME).join(CACHE_DIR),
        }
    }
}
