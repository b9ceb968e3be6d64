//! Engine configuration loaded from TOML.
//!
//! ```toml
//! default_isolation = "repeatableRead"
//! default_max_wait_ms = 2000
//! default_timeout_ms = 5000
//! max_open_transactions = 16
//!
//! [planner]
//! max_depth = 8
//! max_fanout = 100000
//! strategy = "breadthFirst"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::query::planner::PlannerConfig;
use crate::txn::IsolationLevel;

/// Tunables of an [`crate::Engine`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Isolation used when a transaction does not request one.
    pub default_isolation: IsolationLevel,
    /// Default bound on waiting for a transaction slot.
    pub default_max_wait_ms: u64,
    /// Default bound on a transaction's open duration.
    pub default_timeout_ms: u64,
    /// Concurrently open transactions, implicit ones included.
    pub max_open_transactions: usize,
    /// Relation-loading limits.
    pub planner: PlannerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_isolation: IsolationLevel::ReadCommitted,
            default_max_wait_ms: 2_000,
            default_timeout_ms: 5_000,
            max_open_transactions: 16,
            planner: PlannerConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            origin: "<inline>".into(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates the file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            origin: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `explicit` if given, otherwise the per-user default file when it
    /// exists, otherwise the built-in defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match default_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Serializes the configuration back to TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|source| ConfigError::Serialize { source })
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_open_transactions == 0 {
            return Err(ConfigError::Invalid {
                field: "max_open_transactions",
                reason: "must be at least 1".into(),
            });
        }
        if self.planner.max_depth == 0 {
            return Err(ConfigError::Invalid {
                field: "planner.max_depth",
                reason: "must be at least 1".into(),
            });
        }
        if self.planner.max_fanout == 0 {
            return Err(ConfigError::Invalid {
                field: "planner.max_fanout",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// Configuration load failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read.
    #[error("failed to read engine config {path}: {source}")]
    Read {
        /// Path that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// File is not valid TOML for [`EngineConfig`].
    #[error("failed to parse engine config {origin}: {source}")]
    Parse {
        /// Path or `<inline>`.
        origin: String,
        /// Underlying parse error.
        source: toml::de::Error,
    },
    /// Configuration could not be rendered as TOML.
    #[error("failed to serialize engine config: {source}")]
    Serialize {
        /// Underlying serializer error.
        source: toml::ser::Error,
    },
    /// A value is out of range.
    #[error("invalid engine config value for {field}: {reason}")]
    Invalid {
        /// Offending key.
        field: &'static str,
        /// Explanation.
        reason: String,
    },
}

/// Per-user configuration file location.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("relcore").join("engine.toml"))
}
