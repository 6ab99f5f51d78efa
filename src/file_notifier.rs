//! Component F: drives ingestion for one `IndexingTree` by coupling the
//! `Crawler` with a `Store` query and diffing the two views.
//!
//! Grounded on `indexing/reconciler.rs`'s buffer/replay flow, generalized
//! from a single SQLite-backed index into the spec's abstract two-view diff
//! (a crawled filesystem view vs. a queried store view) over the `Store`
//! trait (spec §4.F). The per-entry physical/logical size split and mtime
//! extraction mirror `reconciler.rs::entry_size_and_mtime`.

use std::collections::VecDeque;
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Once};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};

use crate::crawler::{CrawlPredicates, Crawler, FileMetadata};
use crate::events::{Event, EventBus};
use crate::fs_cache::{quark_from_static, register_property, FileCache, FileHandle, Quark, TraversalOrder};
use crate::fs_monitor::FsEvent;
use crate::ignore_poison::IgnorePoison;
use crate::indexing_tree::{DirectoryFlags, FileType, IndexingTree};
use crate::path_util::parent_of;
use crate::store::{Store, TypedValue};

/// Canonical properties registered on `FileHandle`s by the notifier (spec
/// §3, "Canonical properties"). Registered once, process-wide, the first
/// time a `FileNotifier` is constructed.
mod quarks {
    use super::*;

    pub fn crawled() -> Quark {
        quark_from_static("file_notifier::crawled")
    }
    pub fn queried() -> Quark {
        quark_from_static("file_notifier::queried")
    }
    pub fn iri() -> Quark {
        quark_from_static("file_notifier::iri")
    }
    pub fn store_mtime() -> Quark {
        quark_from_static("file_notifier::store_mtime")
    }
    pub fn filesystem_mtime() -> Quark {
        quark_from_static("file_notifier::filesystem_mtime")
    }
    pub fn file_info() -> Quark {
        quark_from_static("file_notifier::file_info")
    }

    static INIT: Once = Once::new();

    /// Append-only registration (spec §4.D, §5: "process-wide, initialized
    /// before first use, append-only"). Safe to call repeatedly.
    pub fn ensure_registered() {
        INIT.call_once(|| {
            register_property(crawled(), |_| {});
            register_property(queried(), |_| {});
            register_property(iri(), |_| {});
            register_property(store_mtime(), |_| {});
            register_property(filesystem_mtime(), |_| {});
            register_property(file_info(), |_| {});
        });
    }
}

fn format_mtime(t: SystemTime) -> String {
    let dt: DateTime<Utc> = t.into();
    dt.to_rfc3339()
}

/// Crawl predicates backed by a shared `IndexingTree` (spec §4.F: "the
/// IndexingTree determining whether each reported file is still in scope").
/// Wrapped in a `Mutex` purely to satisfy `Send + Sync + 'static` for the
/// `spawn_blocking`-driven crawler; the core otherwise runs single-threaded
/// (spec §5).
pub struct TreePredicates {
    tree: Arc<std::sync::Mutex<IndexingTree>>,
}

impl TreePredicates {
    pub fn new(tree: Arc<std::sync::Mutex<IndexingTree>>) -> Self {
        Self { tree }
    }
}

impl CrawlPredicates for TreePredicates {
    fn check_directory(&self, dir: &str) -> bool {
        self.tree.lock_ignore_poison().file_is_indexable(dir, FileType::Directory)
    }

    fn check_file(&self, file: &str) -> bool {
        self.tree.lock_ignore_poison().file_is_indexable(file, FileType::Regular)
    }

    fn check_directory_contents(&self, parent: &str, children: &[String]) -> bool {
        self.tree.lock_ignore_poison().parent_is_indexable(parent, children)
    }
}

/// Component F. Owns the `FileCache` that accumulates crawl + store
/// properties; does not own the `IndexingTree` (shared with the crawler's
/// predicates and with `MinerFS`).
pub struct FileNotifier<S: Store> {
    store: Arc<S>,
    cache: FileCache,
    pending_roots: VecDeque<(String, DirectoryFlags)>,
    pub events: EventBus<Event>,
    /// Shared with every `Crawler` this notifier starts (see
    /// `process_root`), so a caller holding only this `Arc` — `MinerFS`'s
    /// `pause`/`resume` — can halt an in-flight or not-yet-started crawl
    /// without ever seeing its `CrawlerHandle` (spec §4.G: "pause() stops
    /// Crawler... resume() undoes each").
    crawl_pause: Arc<AtomicU32>,
}

impl<S: Store> FileNotifier<S> {
    pub fn new(store: Arc<S>) -> Self {
        quarks::ensure_registered();
        Self {
            store,
            cache: FileCache::new(),
            pending_roots: VecDeque::new(),
            events: EventBus::new(),
            crawl_pause: Arc::new(AtomicU32::new(0)),
        }
    }

    /// The shared pause counter every crawl this notifier starts will read.
    /// `MinerFS` clones this once at construction and writes to it directly
    /// from `pause`/`resume`, so the effect reaches a crawl already in
    /// flight as well as one that hasn't started yet.
    pub fn crawl_pause_handle(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.crawl_pause)
    }

    /// Queue a root for crawling (spec §4.F "Monitor wiring": fired when the
    /// `IndexingTree` emits `directory-added`).
    pub fn queue_root(&mut self, path: String, flags: DirectoryFlags) {
        self.pending_roots.push_back((path, flags));
    }

    pub fn has_pending(&self) -> bool {
        !self.pending_roots.is_empty()
    }

    /// Drain and process every pending root, one at a time (spec §4.F item
    /// 5: "Dequeue the root and crawl the next pending root").
    pub async fn drive_pending(&mut self, tree: Arc<std::sync::Mutex<IndexingTree>>) {
        while let Some((root, flags)) = self.pending_roots.pop_front() {
            self.process_root(Arc::clone(&tree), root, flags).await;
        }
    }

    /// Run one root through crawl -> query -> diff (spec §4.F items 1-4).
    pub async fn process_root(&mut self, tree: Arc<std::sync::Mutex<IndexingTree>>, root: String, flags: DirectoryFlags) {
        let crawl_id = uuid::Uuid::new_v4();
        info!("file notifier: crawling root {root} (crawl_id={crawl_id})");

        let predicates: Arc<dyn CrawlPredicates> = Arc::new(TreePredicates::new(tree));
        let mut crawler = Crawler::new(predicates).with_shared_pause(Arc::clone(&self.crawl_pause));
        crawler.start(&root);
        crawler.run(flags.contains(DirectoryFlags::RECURSE)).await;

        let root_handle = self.cache.get_or_create(&root, FileType::Directory, None);
        for meta in crawler.drain_found() {
            self.register_crawled_entry(meta, Some(root_handle));
        }
        self.cache.set_property(root_handle, quarks::crawled(), true);
        debug!("file notifier: root {root} crawled");

        self.query_store(&root, flags.contains(DirectoryFlags::RECURSE)).await;
        self.cache.set_property(root_handle, quarks::queried(), true);

        let ready = self
            .cache
            .get_property::<bool>(root_handle, quarks::crawled())
            .copied()
            .unwrap_or(false)
            && self
                .cache
                .get_property::<bool>(root_handle, quarks::queried())
                .copied()
                .unwrap_or(false);
        if ready {
            self.diff_and_emit(root_handle);
        }
    }

    fn register_crawled_entry(&mut self, meta: FileMetadata, parent: Option<FileHandle>) {
        let file_type = if meta.is_dir { FileType::Directory } else { FileType::Regular };
        let handle = self.cache.get_or_create(&meta.path, file_type, parent);
        let mtime = format_mtime(meta.mtime);
        self.cache.set_property(handle, quarks::filesystem_mtime(), mtime);
        self.cache.set_property(handle, quarks::file_info(), meta);
    }

    /// Issue the scoped store query (spec §4.F item 2) and populate `iri`
    /// and `store_mtime` on matching handles (item 3). Non-recursive roots
    /// are additionally filtered to direct children only: the query text
    /// asks the store for an exact-container match (see `build_scope_query`),
    /// but since the store is an opaque collaborator (spec §6) the notifier
    /// also enforces the restriction itself, matching
    /// `tracker-file-notifier.c`'s `OPTIONAL { ?u nfo:belongsToContainer ?p }
    /// . FILTER (?url = "%s" || nie:url(?p) = "%s")` container predicate
    /// rather than a prefix match over arbitrary depth.
    async fn query_store(&mut self, root: &str, recurse: bool) {
        let text = build_scope_query(root, recurse);
        match self.store.query(&text).await {
            Ok(rows) => {
                for row in rows {
                    match parse_scope_row(&row) {
                        Some((path, iri, store_mtime)) => {
                            if !recurse && path != root && parent_of(&path).as_deref() != Some(root) {
                                continue;
                            }
                            let handle = self.cache.get_or_create(&path, FileType::Unknown, None);
                            self.cache.set_property(handle, quarks::iri(), iri);
                            self.cache.set_property(handle, quarks::store_mtime(), store_mtime);
                        }
                        None => warn!("file notifier: malformed store row for root {root}, skipping"),
                    }
                }
            }
            Err(err) => {
                error!("file notifier: store query failed for root {root}: {err}");
            }
        }
    }

    /// Pre-order traversal diffing `store_mtime` against `filesystem_mtime`
    /// per spec §4.F item 4 / §8 property 8. The root handle itself is
    /// never diffed (it anchors the crawl, it is not itself a crawled
    /// entry); non-directory leaves are forgotten afterward, directories
    /// are retained for monitoring (spec §3, "Lifecycle").
    fn diff_and_emit(&mut self, root: FileHandle) {
        let cache = &self.cache;
        let mut emitted = Vec::new();

        cache.traverse(root, TraversalOrder::Pre, None, |h, _depth| {
            if h == root {
                return false;
            }
            let store_mtime = cache.get_property::<String>(h, quarks::store_mtime()).cloned();
            let fs_mtime = cache.get_property::<String>(h, quarks::filesystem_mtime()).cloned();
            let is_dir = matches!(cache.file_type(h), FileType::Directory);
            let path = cache.path(h).to_string();

            match (store_mtime, fs_mtime) {
                (Some(_), None) => emitted.push(Event::deleted(path, is_dir)),
                (None, Some(_)) => emitted.push(Event::created(path, is_dir)),
                (Some(s), Some(f)) if s != f => emitted.push(Event::updated(path, is_dir)),
                (Some(_), Some(_)) => {}
                (None, None) => debug_assert!(false, "unreachable: {path} has neither store nor filesystem mtime"),
            }
            false
        });

        for event in &emitted {
            self.events.emit(event);
        }

        // Non-directory leaves are forgotten regardless of whether the crawl
        // ever concretely typed them: a store-only (deleted) entry is
        // registered by `query_store` as `FileType::Unknown` and is never
        // promoted to `Regular` since no crawl visits it, so forgetting only
        // `Regular` would leak its `store_mtime`/`iri` properties across
        // repeated crawls of the same root (spec §3, "forgotten for
        // non-directory leaves").
        self.cache.forget(root, Some(FileType::Regular));
        self.cache.forget(root, Some(FileType::Unknown));
    }

    /// Translate a live monitor event into a core `Event`, with the
    /// `IndexingTree` deciding scope (spec §4.F "Monitor wiring"; spec §8
    /// scenario 4, "Move out of scope").
    pub fn forward_live_event(&self, tree: &IndexingTree, event: &FsEvent) -> Option<Event> {
        let file_type_of = |is_dir: bool| if is_dir { FileType::Directory } else { FileType::Regular };
        match event {
            FsEvent::Created { path, is_dir } => {
                tree.file_is_indexable(path, file_type_of(*is_dir)).then(|| Event::created(path.clone(), *is_dir))
            }
            FsEvent::Updated { path, is_dir } => {
                tree.file_is_indexable(path, file_type_of(*is_dir)).then(|| Event::updated(path.clone(), *is_dir))
            }
            FsEvent::Deleted { path, is_dir } => Some(Event::deleted(path.clone(), *is_dir)),
            FsEvent::Moved { src, dst, is_dir, .. } => {
                if tree.file_is_indexable(dst, file_type_of(*is_dir)) {
                    Some(Event::moved(src.clone(), dst.clone(), *is_dir))
                } else {
                    Some(Event::deleted(src.clone(), *is_dir))
                }
            }
        }
    }
}

/// Templated scope query per spec §4.F item 2 ("URLs and store mtimes of
/// all `FileDataObject` descended from or equal to this root"). Kept next
/// to the diff logic rather than factored into a shared string-builder
/// module (spec §9, "store query text assembly -> templated builder").
fn build_scope_query(root: &str, recurse: bool) -> String {
    if recurse {
        format!(
            "SELECT ?url ?iri ?mtime WHERE {{ ?iri nie:url ?url ; nfo:fileLastModified ?mtime . FILTER(?url = \"{root}\" || STRSTARTS(?url, CONCAT(\"{root}\", \"/\"))) }}"
        )
    } else {
        format!(
            "SELECT ?url ?iri ?mtime WHERE {{ ?iri nie:url ?url ; nfo:fileLastModified ?mtime . OPTIONAL {{ ?iri nfo:belongsToContainer ?parent }} . FILTER(?url = \"{root}\" || nie:url(?parent) = \"{root}\") }}"
        )
    }
}

fn parse_scope_row(row: &[TypedValue]) -> Option<(String, String, String)> {
    let path = match row.first()? {
        TypedValue::Text(s) => s.clone(),
        _ => return None,
    };
    let iri = match row.get(1)? {
        TypedValue::Text(s) => s.clone(),
        _ => return None,
    };
    let mtime = match row.get(2)? {
        TypedValue::Date(s) | TypedValue::Text(s) => s.clone(),
        _ => return None,
    };
    Some((path, iri, mtime))
}
