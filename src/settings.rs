//! Application settings storage
//!
//! Stores configuration in a JSON file. Missing fields fall back to
//! defaults, and a few values can be overridden from the environment.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::coordinator::GroupingConfig;
use crate::error::{GroupingError, Result};

pub const DB_ENV: &str = "REVIEWTREE_DB";
pub const DEPTH_ENV: &str = "REVIEWTREE_DEPTH";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    /// Hierarchy depth used when the coordinator starts (default: 1)
    #[serde(default = "default_depth")]
    pub default_depth: usize,
    /// Deepest hierarchy level a user may request (default: 10)
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Concurrent leaf resolutions per hierarchy pass (default: 8)
    #[serde(default = "default_resolver_concurrency")]
    pub resolver_concurrency: usize,
    #[serde(default)]
    pub db_path: Option<String>,
}

fn default_depth() -> usize {
    1
}

fn default_max_depth() -> usize {
    10
}

fn default_resolver_concurrency() -> usize {
    8
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_depth: default_depth(),
            max_depth: default_max_depth(),
            resolver_concurrency: default_resolver_concurrency(),
            db_path: None,
        }
    }
}

impl Settings {
    /// Load settings from disk, or defaults when the file is missing or unreadable
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Settings::default();
        }
        match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => Settings::default(),
        }
    }

    /// Load from disk, then apply environment overrides
    pub fn load_with_env(path: &Path) -> Self {
        let mut settings = Self::load(path);
        settings.apply_env();
        settings
    }

    pub fn apply_env(&mut self) {
        if let Ok(db) = std::env::var(DB_ENV) {
            if !db.is_empty() {
                self.db_path = Some(db);
            }
        }
        if let Some(depth) = std::env::var(DEPTH_ENV).ok().and_then(|d| d.parse().ok()) {
            self.default_depth = depth;
        }
    }

    /// Save settings to disk
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| GroupingError::Settings(format!("Failed to serialize settings: {}", e)))?;

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| GroupingError::Settings(format!("Failed to create config directory: {}", e)))?;
        }

        fs::write(path, content)
            .map_err(|e| GroupingError::Settings(format!("Failed to write settings: {}", e)))?;

        Ok(())
    }

    /// Database location: explicit setting, else the platform data dir
    pub fn resolve_db_path(&self) -> PathBuf {
        match &self.db_path {
            Some(path) => PathBuf::from(path),
            None => data_dir().join("reviewtree.db"),
        }
    }

    pub fn grouping_config(&self) -> GroupingConfig {
        GroupingConfig {
            initial_depth: self.default_depth.min(self.max_depth),
            max_depth: self.max_depth,
            resolver_concurrency: self.resolver_concurrency.max(1),
        }
    }
}

pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|p| p.join("reviewtree"))
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn default_settings_path() -> PathBuf {
    data_dir().join("settings.json")
}
