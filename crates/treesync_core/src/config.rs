//! Configuration types for a replica.
//!
//! [`ReplicaConfig`] controls how a [`Replica`](crate::crdt::Replica) sets up
//! its underlying yrs document. It is persisted as TOML, the same way a
//! deployment stores the rest of its settings.
//!
//! # Example
//!
//! ```ignore
//! use treesync_core::config::ReplicaConfig;
//!
//! let config = ReplicaConfig::from_toml_str(r#"
//!     root_name = "page"
//!     track_history = false
//! "#)?;
//! assert_eq!(config.root_name, "page");
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default name of the root XML fragment shared by all replicas of a document.
pub const DEFAULT_ROOT_NAME: &str = "document";

/// Settings for one replica of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaConfig {
    /// Name of the root XML fragment. Every replica of one document must use
    /// the same name, otherwise they observe different trees.
    pub root_name: String,

    /// Track local changes for undo/redo
    pub track_history: bool,

    /// Fixed client ID for the underlying document (random if not set).
    /// Useful for deterministic tests; never share one ID between live replicas.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<u64>,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            root_name: DEFAULT_ROOT_NAME.to_string(),
            track_history: true,
            client_id: None,
        }
    }
}

impl ReplicaConfig {
    /// Parse a config from TOML text. Missing keys take their default values.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Serialize the config to pretty TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load config from a TOML file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Load config from a TOML file, or return the default if it doesn't exist.
    pub fn load_from_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load_from(path);
        }
        Ok(Self::default())
    }

    /// Save config to a TOML file, creating parent directories as needed.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }
}
