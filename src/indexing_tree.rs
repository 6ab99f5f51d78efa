//! Component A: the configured tree of indexing roots.
//!
//! Answers two questions for any path: is it in scope, and which configured
//! root governs its policy. Grounded on the teacher's settings-driven root
//! list (`settings/legacy.rs`) generalized into the tree-of-roots shape the
//! rest of the core needs, with filters modeled on `scanner.rs`'s
//! `EXCLUDED_PREFIXES`/`should_exclude` (here made caller-configurable glob
//! filters rather than hardcoded prefixes) via `globset`, a new dependency
//! this crate introduces for that purpose (see DESIGN.md).

use std::collections::HashMap;

use globset::{Glob, GlobMatcher};
use log::warn;

use crate::events::EventBus;
use crate::path_util::{basename, is_prefix_or_equal, is_strict_prefix, normalize_path, parent_of};

/// Per-root bitset. Hand-rolled rather than pulled from a flags crate, since
/// the teacher's own config types (`settings/legacy.rs`) use plain booleans
/// and the core has only four bits to track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirectoryFlags(u8);

impl DirectoryFlags {
    pub const RECURSE: DirectoryFlags = DirectoryFlags(1 << 0);
    pub const CHECK_MTIME: DirectoryFlags = DirectoryFlags(1 << 1);
    pub const MONITOR: DirectoryFlags = DirectoryFlags(1 << 2);
    pub const NO_STAT: DirectoryFlags = DirectoryFlags(1 << 3);

    pub const NONE: DirectoryFlags = DirectoryFlags(0);

    pub fn contains(self, other: DirectoryFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl std::ops::BitOr for DirectoryFlags {
    type Output = DirectoryFlags;
    fn bitor(self, rhs: DirectoryFlags) -> DirectoryFlags {
        DirectoryFlags(self.0 | rhs.0)
    }
}

/// File type as known to the tree/cache. `Unknown` may be promoted once to
/// a concrete type, never demoted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Unknown,
    Regular,
    Directory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterKind {
    File,
    Directory,
    ParentDirectory,
}

struct CompiledFilter {
    matcher: GlobMatcher,
}

/// Emitted by `IndexingTree::add`/`remove`. `FileNotifier` subscribes to
/// queue newly added roots and to tear down state for removed ones.
#[derive(Debug, Clone)]
pub enum TreeEvent {
    DirectoryAdded { path: String, flags: DirectoryFlags },
    DirectoryRemoved { path: String },
}

struct Node {
    path: String,
    flags: DirectoryFlags,
    shallow: bool,
    parent: Option<usize>,
    children: Vec<usize>,
}

/// Ordered tree of configured roots, each with flags and a shared set of
/// glob filters. Represented as an arena of `Option<Node>` so indices stay
/// stable across `remove` (spec §4.A / design note "arena + indices").
pub struct IndexingTree {
    nodes: Vec<Option<Node>>,
    by_path: HashMap<String, usize>,
    filters: HashMap<FilterKind, Vec<CompiledFilter>>,
    filter_hidden: bool,
    pub events: EventBus<TreeEvent>,
}

const ROOT_PATH: &str = "/";

impl IndexingTree {
    pub fn new() -> Self {
        let root = Node {
            path: ROOT_PATH.to_string(),
            flags: DirectoryFlags::NONE,
            shallow: true,
            parent: None,
            children: Vec::new(),
        };
        let mut by_path = HashMap::new();
        by_path.insert(ROOT_PATH.to_string(), 0usize);
        Self {
            nodes: vec![Some(root)],
            by_path,
            filters: HashMap::new(),
            filter_hidden: false,
            events: EventBus::new(),
        }
    }

    pub fn set_filter_hidden(&mut self, on: bool) {
        self.filter_hidden = on;
    }

    pub fn filter_hidden(&self) -> bool {
        self.filter_hidden
    }

    fn node(&self, idx: usize) -> &Node {
        self.nodes[idx].as_ref().expect("arena slot must be live")
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node {
        self.nodes[idx].as_mut().expect("arena slot must be live")
    }

    /// Deepest existing node whose path is `path` itself or a prefix of it.
    fn deepest_ancestor(&self, path: &str) -> usize {
        let mut best = 0usize;
        let mut best_len = 0usize;
        for (idx, slot) in self.nodes.iter().enumerate() {
            let Some(node) = slot else { continue };
            if is_prefix_or_equal(&node.path, path) && node.path.len() >= best_len {
                best = idx;
                best_len = node.path.len();
            }
        }
        best
    }

    /// Add or promote a root. Per spec §4.A: if a node already equals
    /// `path`, promote it from shallow and overwrite its flags (warning if
    /// they changed); otherwise attach a new node under the deepest existing
    /// ancestor and re-parent that ancestor's descendants prefixed by `path`.
    pub fn add(&mut self, path: &str, flags: DirectoryFlags) {
        let path = normalize_path(path);

        if let Some(&idx) = self.by_path.get(&path) {
            let node = self.node_mut(idx);
            if !node.shallow && node.flags != flags {
                warn!("indexing tree: root {path} re-added with different flags");
            }
            node.shallow = false;
            node.flags = flags;
            self.events.emit(&TreeEvent::DirectoryAdded { path, flags });
            return;
        }

        let parent_idx = self.deepest_ancestor(&path);
        let new_idx = self.nodes.len();
        self.nodes.push(Some(Node {
            path: path.clone(),
            flags,
            shallow: false,
            parent: Some(parent_idx),
            children: Vec::new(),
        }));
        self.by_path.insert(path.clone(), new_idx);
        self.node_mut(parent_idx).children.push(new_idx);

        // Re-parent existing children of `parent_idx` that fall under the new node.
        let mut moved = Vec::new();
        {
            let parent = self.node(parent_idx);
            for &child_idx in &parent.children {
                if child_idx == new_idx {
                    continue;
                }
                let child_path = self.node(child_idx).path.clone();
                if is_strict_prefix(&path, &child_path) {
                    moved.push(child_idx);
                }
            }
        }
        if !moved.is_empty() {
            self.node_mut(parent_idx).children.retain(|c| !moved.contains(c));
            for &child_idx in &moved {
                self.node_mut(child_idx).parent = Some(new_idx);
            }
            self.node_mut(new_idx).children.extend(moved);
        }

        self.events.emit(&TreeEvent::DirectoryAdded { path, flags });
    }

    /// Remove a configured root. Per spec §4.A: locate the exact node; if it
    /// is the synthetic root, demote it to shallow; otherwise reparent its
    /// children to its own parent and drop it.
    pub fn remove(&mut self, path: &str) {
        let path = normalize_path(path);
        let Some(&idx) = self.by_path.get(&path) else {
            return;
        };

        if idx == 0 {
            self.node_mut(0).shallow = true;
            self.events.emit(&TreeEvent::DirectoryRemoved { path });
            return;
        }

        let parent_idx = self.node(idx).parent.expect("non-root node always has a parent");
        let children = std::mem::take(&mut self.node_mut(idx).children);
        for &child_idx in &children {
            self.node_mut(child_idx).parent = Some(parent_idx);
        }
        self.node_mut(parent_idx).children.retain(|&c| c != idx);
        self.node_mut(parent_idx).children.extend(children);

        self.by_path.remove(&path);
        self.nodes[idx] = None;
        self.events.emit(&TreeEvent::DirectoryRemoved { path });
    }

    pub fn add_filter(&mut self, kind: FilterKind, glob: &str) -> Result<(), globset::Error> {
        let matcher = Glob::new(glob)?.compile_matcher();
        self.filters.entry(kind).or_default().push(CompiledFilter { matcher });
        Ok(())
    }

    pub fn clear_filters(&mut self, kind: FilterKind) {
        self.filters.remove(&kind);
    }

    fn matches_filter(&self, kind: FilterKind, name: &str) -> bool {
        self.filters
            .get(&kind)
            .map(|fs| fs.iter().any(|f| f.matcher.is_match(name)))
            .unwrap_or(false)
    }

    /// Whether `node`'s flags admit `path`: `path` is the node itself, a
    /// direct child of it, or a deeper descendant and the node has `RECURSE`.
    fn admits(node: &Node, path: &str) -> bool {
        if node.path == path {
            return true;
        }
        if !is_strict_prefix(&node.path, path) {
            return false;
        }
        parent_of(path).as_deref() == Some(node.path.as_str()) || node.flags.contains(DirectoryFlags::RECURSE)
    }

    /// Deepest non-shallow ancestor (or `path` itself) whose flags admit
    /// `path`, per spec §4.A's definition of "which root governs P".
    fn find_governing_root(&self, path: &str) -> Option<usize> {
        let mut best: Option<usize> = None;
        let mut best_len = 0usize;
        for (idx, slot) in self.nodes.iter().enumerate() {
            let Some(node) = slot else { continue };
            if node.shallow || !is_prefix_or_equal(&node.path, path) {
                continue;
            }
            if Self::admits(node, path) && node.path.len() >= best_len {
                best = Some(idx);
                best_len = node.path.len();
            }
        }
        best
    }

    /// `get_root(path) -> (root_path, flags)?` per spec §4.A.
    pub fn get_root(&self, path: &str) -> Option<(String, DirectoryFlags)> {
        let path = normalize_path(path);
        let idx = self.find_governing_root(&path)?;
        let node = self.node(idx);
        Some((node.path.clone(), node.flags))
    }

    /// `file_is_indexable(path, type?)` per spec §4.A.
    pub fn file_is_indexable(&self, path: &str, file_type: FileType) -> bool {
        let path = normalize_path(path);
        let name = basename(&path);

        if self.filter_hidden && name.starts_with('.') && path != ROOT_PATH {
            return false;
        }

        // Unknown is never resolved to Directory/Regular by a caller (spec
        // §4.A: "if type is UNKNOWN, stat it, no follow"); a stat failure
        // (e.g. the path vanished between event and check) falls back to
        // FilterKind::File, the more conservative of the two filter sets.
        let resolved = if file_type == FileType::Unknown {
            match std::fs::symlink_metadata(&path) {
                Ok(meta) if meta.is_dir() => FileType::Directory,
                Ok(_) => FileType::Regular,
                Err(_) => FileType::Regular,
            }
        } else {
            file_type
        };
        let kind = match resolved {
            FileType::Directory => FilterKind::Directory,
            _ => FilterKind::File,
        };
        if self.matches_filter(kind, name) {
            return false;
        }

        let Some(idx) = self.find_governing_root(&path) else {
            return false;
        };
        self.node(idx).flags.contains(DirectoryFlags::MONITOR)
    }

    /// `parent_is_indexable(parent, children)` per spec §4.A: the parent
    /// itself must be indexable, and no `children` basename may match a
    /// PARENT_DIRECTORY filter.
    pub fn parent_is_indexable(&self, parent: &str, children: &[String]) -> bool {
        if !self.file_is_indexable(parent, FileType::Directory) {
            return false;
        }
        !children.iter().any(|child| {
            let name = basename(child);
            self.matches_filter(FilterKind::ParentDirectory, name)
        })
    }
}

impl Default for IndexingTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_attaches_under_deepest_ancestor_and_reparents_descendants() {
        let mut tree = IndexingTree::new();
        tree.add("/home/alice", DirectoryFlags::RECURSE | DirectoryFlags::MONITOR);
        tree.add(
            "/home/alice/Docs/Archive",
            DirectoryFlags::RECURSE | DirectoryFlags::MONITOR,
        );
        // Now attach /home/alice/Docs, which should become the parent of Archive.
        tree.add("/home/alice/Docs", DirectoryFlags::RECURSE | DirectoryFlags::MONITOR);

        let docs_idx = *tree.by_path.get("/home/alice/Docs").unwrap();
        let archive_idx = *tree.by_path.get("/home/alice/Docs/Archive").unwrap();
        assert_eq!(tree.node(archive_idx).parent, Some(docs_idx));
        assert!(tree.node(docs_idx).children.contains(&archive_idx));
    }

    #[test]
    fn add_twice_same_flags_is_a_no_op_beyond_promotion() {
        let mut tree = IndexingTree::new();
        let flags = DirectoryFlags::RECURSE | DirectoryFlags::MONITOR;
        tree.add("/srv/data", flags);
        tree.add("/srv/data", flags);
        let idx = *tree.by_path.get("/srv/data").unwrap();
        assert!(!tree.node(idx).shallow);
        assert_eq!(tree.node(idx).flags, flags);
    }

    #[test]
    fn remove_reparents_children_to_removed_nodes_parent() {
        let mut tree = IndexingTree::new();
        let flags = DirectoryFlags::RECURSE | DirectoryFlags::MONITOR;
        tree.add("/a", flags);
        tree.add("/a/b", flags);
        tree.add("/a/b/c", flags);

        tree.remove("/a/b");

        let a_idx = *tree.by_path.get("/a").unwrap();
        let c_idx = *tree.by_path.get("/a/b/c").unwrap();
        assert_eq!(tree.node(c_idx).parent, Some(a_idx));
        assert!(tree.node(a_idx).children.contains(&c_idx));
        assert!(!tree.by_path.contains_key("/a/b"));
    }

    #[test]
    fn remove_root_demotes_to_shallow_instead_of_dropping() {
        let mut tree = IndexingTree::new();
        tree.remove("/");
        assert!(tree.node(0).shallow);
        assert!(tree.by_path.contains_key("/"));
    }

    #[test]
    fn round_trip_add_then_remove_restores_shape() {
        let mut tree = IndexingTree::new();
        let flags = DirectoryFlags::RECURSE | DirectoryFlags::MONITOR;
        let before = tree.nodes.len();
        tree.add("/tmp/x", flags);
        tree.remove("/tmp/x");
        assert_eq!(tree.by_path.len(), 1);
        // The arena slot is tombstoned, not reclaimed, so length may grow by
        // one tombstone; no *live* node remains beyond the root.
        assert!(tree.nodes.len() >= before);
        assert_eq!(tree.nodes.iter().flatten().count(), 1);
    }

    #[test]
    fn file_is_indexable_requires_monitor_flag() {
        let mut tree = IndexingTree::new();
        tree.add("/data", DirectoryFlags::RECURSE);
        assert!(!tree.file_is_indexable("/data/a.txt", FileType::Regular));

        tree.add("/data", DirectoryFlags::RECURSE | DirectoryFlags::MONITOR);
        assert!(tree.file_is_indexable("/data/a.txt", FileType::Regular));
    }

    #[test]
    fn file_is_indexable_respects_recurse_flag_for_grandchildren() {
        let mut tree = IndexingTree::new();
        tree.add("/data", DirectoryFlags::MONITOR);
        assert!(tree.file_is_indexable("/data/child.txt", FileType::Regular));
        assert!(!tree.file_is_indexable("/data/sub/grandchild.txt", FileType::Regular));

        tree.add("/data", DirectoryFlags::MONITOR | DirectoryFlags::RECURSE);
        assert!(tree.file_is_indexable("/data/sub/grandchild.txt", FileType::Regular));
    }

    #[test]
    fn file_filter_rejects_matching_basename() {
        let mut tree = IndexingTree::new();
        tree.add("/data", DirectoryFlags::RECURSE | DirectoryFlags::MONITOR);
        tree.add_filter(FilterKind::File, "*.tmp").unwrap();
        assert!(!tree.file_is_indexable("/data/scratch.tmp", FileType::Regular));
        assert!(tree.file_is_indexable("/data/keep.txt", FileType::Regular));
    }

    #[test]
    fn filter_hidden_rejects_dotfiles_when_enabled() {
        let mut tree = IndexingTree::new();
        tree.add("/data", DirectoryFlags::RECURSE | DirectoryFlags::MONITOR);
        tree.set_filter_hidden(true);
        assert!(!tree.file_is_indexable("/data/.secret", FileType::Regular));
    }

    #[test]
    fn file_is_indexable_stats_unknown_type_without_following_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"x").unwrap();

        let mut tree = IndexingTree::new();
        tree.add(&dir.path().to_string_lossy(), DirectoryFlags::RECURSE | DirectoryFlags::MONITOR);
        tree.add_filter(FilterKind::Directory, "sub").unwrap();

        // Unknown resolves to Directory here, so the Directory filter applies.
        assert!(!tree.file_is_indexable(&sub.to_string_lossy(), FileType::Unknown));
        // Unknown resolves to Regular here, so the Directory filter does not apply.
        assert!(tree.file_is_indexable(&file.to_string_lossy(), FileType::Unknown));
    }

    #[test]
    fn parent_is_indexable_checks_parent_directory_filter_against_children() {
        let mut tree = IndexingTree::new();
        tree.add("/data", DirectoryFlags::RECURSE | DirectoryFlags::MONITOR);
        tree.add_filter(FilterKind::ParentDirectory, ".noindex").unwrap();

        let children = vec!["a.txt".to_string(), "b.txt".to_string()];
        assert!(tree.parent_is_indexable("/data", &children));

        let children_with_marker = vec!["a.txt".to_string(), ".noindex".to_string()];
        assert!(!tree.parent_is_indexable("/data", &children_with_marker));
    }

    #[test]
    fn get_root_returns_deepest_governing_root() {
        let mut tree = IndexingTree::new();
        tree.add("/a", DirectoryFlags::RECURSE | DirectoryFlags::MONITOR);
        tree.add("/a/b", DirectoryFlags::MONITOR);
        let (root, _) = tree.get_root("/a/b/c.txt").unwrap();
        assert_eq!(root, "/a/b");
    }

    #[test]
    fn directory_added_event_fires_on_add() {
        let mut tree = IndexingTree::new();
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = std::sync::Arc::clone(&seen);
        tree.events.subscribe(move |event| {
            if let TreeEvent::DirectoryAdded { path, .. } = event {
                seen_clone.lock().unwrap().push(path.clone());
            }
        });
        tree.add("/new-root", DirectoryFlags::MONITOR);
        assert_eq!(*seen.lock().unwrap(), vec!["/new-root".to_string()]);
    }
}
