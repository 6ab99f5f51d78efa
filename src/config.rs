//! Loadable configuration for the set of indexing roots.
//!
//! Grounded on the teacher's `settings/legacy.rs` (a `Settings` struct
//! deserialized from a JSON file on disk, falling back to defaults on any
//! read/parse failure) generalized from the app's single on/off
//! `indexing.enabled` flag into the full per-root flag/filter shape
//! `IndexingTree` needs (spec §10.3).

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::indexing_tree::{DirectoryFlags, FilterKind, IndexingTree};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RootConfig {
    pub path: String,
    pub recurse: bool,
    pub check_mtime: bool,
    pub monitor: bool,
    pub no_stat: bool,
}

impl Default for RootConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            recurse: true,
            check_mtime: true,
            monitor: true,
            no_stat: false,
        }
    }
}

impl RootConfig {
    fn flags(&self) -> DirectoryFlags {
        let mut flags = DirectoryFlags::NONE;
        if self.recurse {
            flags = flags | DirectoryFlags::RECURSE;
        }
        if self.check_mtime {
            flags = flags | DirectoryFlags::CHECK_MTIME;
        }
        if self.monitor {
            flags = flags | DirectoryFlags::MONITOR;
        }
        if self.no_stat {
            flags = flags | DirectoryFlags::NO_STAT;
        }
        flags
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub kind: FilterKindConfig,
    pub glob: String,
}

#[derive(Debug, Clone, Copy, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FilterKindConfig {
    #[default]
    File,
    Directory,
    ParentDirectory,
}

impl From<FilterKindConfig> for FilterKind {
    fn from(kind: FilterKindConfig) -> Self {
        match kind {
            FilterKindConfig::File => FilterKind::File,
            FilterKindConfig::Directory => FilterKind::Directory,
            FilterKindConfig::ParentDirectory => FilterKind::ParentDirectory,
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            kind: FilterKindConfig::File,
            glob: String::new(),
        }
    }
}

/// User-configurable set of indexing roots and filters, matching the shape
/// of the teacher's `Settings` (alias/default-heavy, falls back to an empty
/// config on any read/parse failure rather than propagating an error).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RootsConfig {
    #[serde(default)]
    pub roots: Vec<RootConfig>,
    #[serde(default)]
    pub filters: Vec<FilterConfig>,
    #[serde(default)]
    pub filter_hidden: bool,
}

impl Default for RootsConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            filters: Vec::new(),
            filter_hidden: true,
        }
    }
}

impl RootsConfig {
    /// Loads a roots config from a JSON file. Returns the default (empty)
    /// config if the file is missing or malformed, matching the teacher's
    /// `load_settings` fallback behavior.
    pub fn load(path: &Path) -> Self {
        let Ok(contents) = fs::read_to_string(path) else {
            return Self::default();
        };
        serde_json::from_str(&contents).unwrap_or_default()
    }

    /// Applies every configured root and filter onto a fresh `IndexingTree`.
    pub fn apply(&self, tree: &mut IndexingTree) {
        tree.set_filter_hidden(self.filter_hidden);
        for filter in &self.filters {
            if let Err(err) = tree.add_filter(filter.kind.into(), &filter.glob) {
                log::warn!("config: invalid filter glob {:?}: {err}", filter.glob);
                continue;
            }
        }
        for root in &self.roots {
            tree.add(&root.path, root.flags());
        }
    }
}
