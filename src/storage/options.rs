use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::tree::WalkDirection;
use crate::types::{Level, LEAF_LEVEL, MAX_TREE_HEIGHT};

/// Tunables supplied when opening a [`super::Tree`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeOptions {
    /// Levels at or below this one are locked in the caller's mode during descent.
    pub lock_level: Level,
    /// Number of result cache slots; zero disables the cache.
    pub cache_slots: usize,
    /// Default direction for tree walks.
    pub walk_direction: WalkDirection,
    /// Restart count at which a search starts logging warnings.
    pub restart_warn_threshold: u32,
    /// Restart count at which a search gives up and reports corruption.
    pub restart_limit: u32,
    /// Maximal number of queued readers admitted together on release.
    pub convoy_size: usize,
    /// Items a node holds before balancing splits it.
    pub node_capacity: usize,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            lock_level: LEAF_LEVEL,
            cache_slots: 16,
            walk_direction: WalkDirection::Rightward,
            restart_warn_threshold: 100,
            restart_limit: 10_000,
            convoy_size: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            node_capacity: 64,
        }
    }
}

impl TreeOptions {
    /// Creates options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the lock floor level.
    pub fn lock_level(mut self, level: Level) -> Self {
        self.lock_level = level;
        self
    }

    /// Sets the number of result cache slots.
    pub fn cache_slots(mut self, slots: usize) -> Self {
        self.cache_slots = slots;
        self
    }

    /// Sets the default walk direction.
    pub fn walk_direction(mut self, direction: WalkDirection) -> Self {
        self.walk_direction = direction;
        self
    }

    /// Sets the restart warning threshold and the hard restart limit.
    pub fn restart_limits(mut self, warn: u32, limit: u32) -> Self {
        self.restart_warn_threshold = warn;
        self.restart_limit = limit;
        self
    }

    /// Sets the reader convoy size.
    pub fn convoy_size(mut self, size: usize) -> Self {
        self.convoy_size = size;
        self
    }

    /// Sets the node capacity used by balancing.
    pub fn node_capacity(mut self, capacity: usize) -> Self {
        self.node_capacity = capacity;
        self
    }

    /// Checks the options for values the engine cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock_level < LEAF_LEVEL || self.lock_level > MAX_TREE_HEIGHT {
            return Err(ConfigError::Invalid {
                field: "lock_level",
                reason: format!("must be within {LEAF_LEVEL}..={MAX_TREE_HEIGHT}"),
            });
        }
        if self.node_capacity < 3 {
            return Err(ConfigError::Invalid {
                field: "node_capacity",
                reason: "must be at least 3".to_string(),
            });
        }
        if self.convoy_size == 0 {
            return Err(ConfigError::Invalid {
                field: "convoy_size",
                reason: "must be positive".to_string(),
            });
        }
        if self.restart_limit == 0 || self.restart_warn_threshold > self.restart_limit {
            return Err(ConfigError::Invalid {
                field: "restart_limit",
                reason: "must be positive and not below the warning threshold".to_string(),
            });
        }
        Ok(())
    }

    /// Parses options from TOML; missing fields keep their defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let options: TreeOptions =
            toml::from_str(contents).map_err(|source| ConfigError::Parse {
                path: None,
                source,
            })?;
        options.validate()?;
        Ok(options)
    }

    /// Loads options from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let options: TreeOptions =
            toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: Some(path.to_path_buf()),
                source,
            })?;
        options.validate()?;
        Ok(options)
    }

    /// Renders the options as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|source| ConfigError::Serialize { source })
    }
}

/// Errors raised while loading tree options.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read tree config {path}: {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The contents are not valid TOML for [`TreeOptions`].
    #[error("failed to parse tree config{}: {source}", path.as_ref().map(|p| format!(" {}", p.display())).unwrap_or_default())]
    Parse {
        /// File that failed, if any.
        path: Option<PathBuf>,
        /// Underlying error.
        source: toml::de::Error,
    },
    /// The options could not be rendered.
    #[error("failed to serialize tree config: {source}")]
    Serialize {
        /// Underlying error.
        source: toml::ser::Error,
    },
    /// A field holds an unusable value.
    #[error("invalid tree config value for {field}: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}
