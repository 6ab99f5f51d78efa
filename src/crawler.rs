//! Component C: the asynchronous, pauseable, cancellable directory walk.
//!
//! Grounded on the teacher's `indexing/scanner.rs` (`run_scan`/`build_walker`/
//! `entry_size_and_mtime`), generalized from a single fixed-exclusion volume
//! walk into the spec's predicate-driven crawl over arbitrary roots. The
//! teacher's `jwalk`-parallel model is replaced with a single cooperative
//! task per crawl: each directory is enumerated via a `spawn_blocking`
//! offload (`walkdir`, already a teacher dependency) and the results are
//! reintegrated on the loop that owns the two FIFOs, matching the
//! single-outstanding-enumeration contract (spec §4.C, §5).

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use log::warn;
use walkdir::WalkDir;

use crate::error::CancelToken;
use crate::events::EventBus;
use crate::path_util::normalize_path;

/// One discovered filesystem entry, carried all the way to `FileNotifier`.
/// Physical size is tracked alongside logical size because network
/// filesystems and sparse files routinely lie about the latter (spec §11).
#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub path: String,
    pub is_dir: bool,
    pub mtime: SystemTime,
    pub logical_size: u64,
    pub physical_size: u64,
}

#[cfg(unix)]
fn physical_size(meta: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.blocks() * 512
}

#[cfg(not(unix))]
fn physical_size(meta: &fs::Metadata) -> u64 {
    meta.len()
}

fn entry_metadata(path: &Path) -> std::io::Result<FileMetadata> {
    let meta = fs::symlink_metadata(path)?;
    Ok(FileMetadata {
        path: normalize_path(&path.to_string_lossy()),
        is_dir: meta.is_dir(),
        mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        logical_size: meta.len(),
        physical_size: physical_size(&meta),
    })
}

/// User-supplied filtering hooks (spec §4.C). Default implementations admit
/// everything, so callers only override what they care about.
pub trait CrawlPredicates: Send + Sync {
    fn check_directory(&self, _dir: &str) -> bool {
        true
    }
    fn check_file(&self, _file: &str) -> bool {
        true
    }
    fn check_directory_contents(&self, _parent: &str, _children: &[String]) -> bool {
        true
    }
}

/// Accepts everything; useful for tests and for callers with no filtering
/// needs of their own (the IndexingTree-backed predicate set lives in
/// `file_notifier`).
pub struct AcceptAll;
impl CrawlPredicates for AcceptAll {}

#[derive(Debug, Clone)]
pub enum CrawlEvent {
    DirectoryCrawled {
        dir: String,
        dirs_in_dir: u64,
        files_in_dir: u64,
    },
    Finished {
        was_interrupted: bool,
        dirs_found: u64,
        dirs_ignored: u64,
        files_found: u64,
        files_ignored: u64,
    },
}

#[derive(Default)]
struct Counts {
    dirs_found: AtomicU64,
    dirs_ignored: AtomicU64,
    files_found: AtomicU64,
    files_ignored: AtomicU64,
}

/// Shared, `Clone`-able handle for controlling a crawl from outside its
/// driving task. Mirrors the teacher's `ScanHandle { progress, cancelled }`.
#[derive(Clone)]
pub struct CrawlerHandle {
    cancel: CancelToken,
    pause_count: Arc<AtomicU32>,
    counts: Arc<Counts>,
}

impl CrawlerHandle {
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Increments the pause count; the dispatch loop stops scheduling new
    /// items once the count is above zero (spec §4.C: "in-flight
    /// enumerations complete but do not schedule successors").
    pub fn pause(&self) {
        self.pause_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrements the pause count; resumes dispatch once it reaches zero.
    pub fn resume(&self) {
        self.pause_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| Some(c.saturating_sub(1)))
            .ok();
    }

    pub fn is_paused(&self) -> bool {
        self.pause_count.load(Ordering::SeqCst) > 0
    }

    pub fn dirs_found(&self) -> u64 {
        self.counts.dirs_found.load(Ordering::Relaxed)
    }

    pub fn files_found(&self) -> u64 {
        self.counts.files_found.load(Ordering::Relaxed)
    }
}

/// Drives one recursive walk. Not `Clone`; external control goes through
/// the `CrawlerHandle` returned by `start`.
pub struct Crawler {
    directories: VecDeque<String>,
    found: VecDeque<FileMetadata>,
    predicates: Arc<dyn CrawlPredicates>,
    batch_size: usize,
    throttle: Duration,
    pub events: EventBus<CrawlEvent>,
    handle: CrawlerHandle,
    started: bool,
    finished: bool,
}

impl Crawler {
    pub fn new(predicates: Arc<dyn CrawlPredicates>) -> Self {
        Self {
            directories: VecDeque::new(),
            found: VecDeque::new(),
            predicates,
            batch_size: 100,
            throttle: Duration::from_millis(0),
            events: EventBus::new(),
            handle: CrawlerHandle {
                cancel: CancelToken::new(),
                pause_count: Arc::new(AtomicU32::new(0)),
                counts: Arc::new(Counts::default()),
            },
            started: false,
            finished: false,
        }
    }

    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Replace this crawl's pause counter with an externally owned one, so a
    /// caller that never sees this `Crawler`'s own `CrawlerHandle` (e.g. one
    /// that toggles pause state before the crawl object even exists) can
    /// still halt it. Mirrors `with_throttle`/`with_batch_size`'s builder
    /// shape.
    pub fn with_shared_pause(mut self, pause_count: Arc<AtomicU32>) -> Self {
        self.handle.pause_count = pause_count;
        self
    }

    pub fn handle(&self) -> CrawlerHandle {
        self.handle.clone()
    }

    /// `start(root, recurse) -> bool` per spec §4.C.
    pub fn start(&mut self, root: &str) -> bool {
        if self.started || self.finished {
            return false;
        }
        self.started = true;
        self.directories.push_back(normalize_path(root));
        true
    }

    /// Drains the `found` queue accumulated so far.
    pub fn drain_found(&mut self) -> Vec<FileMetadata> {
        self.found.drain(..).collect()
    }

    /// Runs the walk to completion, honoring pause/cancel between every
    /// directory dispatch. One outstanding enumeration at a time: the loop
    /// never issues a second `spawn_blocking` readdir before the first
    /// resolves (spec §4.C "single-directory reentrancy").
    pub async fn run(&mut self, recurse: bool) {
        let mut was_interrupted = false;

        'outer: loop {
            if self.handle.cancel.is_cancelled() {
                was_interrupted = true;
                break;
            }

            while self.handle.is_paused() {
                if self.handle.cancel.is_cancelled() {
                    was_interrupted = true;
                    break 'outer;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }

            let Some(dir) = self.directories.pop_front() else {
                break;
            };

            if !self.predicates.check_directory(&dir) {
                self.handle.counts.dirs_ignored.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let dir_for_blocking = dir.clone();
            let batch_size = self.batch_size;
            let listing = tokio::task::spawn_blocking(move || list_directory(&dir_for_blocking, batch_size)).await;

            let entries = match listing {
                Ok(Ok(entries)) => entries,
                Ok(Err(err)) => {
                    warn!("crawler: failed to read directory {dir}: {err}");
                    continue;
                }
                Err(join_err) => {
                    warn!("crawler: directory read task for {dir} panicked: {join_err}");
                    continue;
                }
            };

            let child_names: Vec<String> = entries
                .iter()
                .map(|e| crate::path_util::basename(&e.path).to_string())
                .collect();
            if !self.predicates.check_directory_contents(&dir, &child_names) {
                self.handle.counts.dirs_ignored.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let mut dirs_in_dir = 0u64;
            let mut files_in_dir = 0u64;

            for entry in entries {
                if entry.is_dir {
                    if !self.predicates.check_directory(&entry.path) {
                        self.handle.counts.dirs_ignored.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    self.handle.counts.dirs_found.fetch_add(1, Ordering::Relaxed);
                    dirs_in_dir += 1;
                    if recurse {
                        self.directories.push_back(entry.path.clone());
                    }
                    self.found.push_back(entry);
                } else {
                    if !self.predicates.check_file(&entry.path) {
                        self.handle.counts.files_ignored.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    self.handle.counts.files_found.fetch_add(1, Ordering::Relaxed);
                    files_in_dir += 1;
                    self.found.push_back(entry);
                }
            }

            self.events.emit(&CrawlEvent::DirectoryCrawled {
                dir,
                dirs_in_dir,
                files_in_dir,
            });

            if !self.throttle.is_zero() {
                tokio::time::sleep(self.throttle).await;
            }
        }

        self.finished = true;
        self.events.emit(&CrawlEvent::Finished {
            was_interrupted,
            dirs_found: self.handle.counts.dirs_found.load(Ordering::Relaxed),
            dirs_ignored: self.handle.counts.dirs_ignored.load(Ordering::Relaxed),
            files_found: self.handle.counts.files_found.load(Ordering::Relaxed),
            files_ignored: self.handle.counts.files_ignored.load(Ordering::Relaxed),
        });
    }
}

fn list_directory(dir: &str, batch_size: usize) -> std::io::Result<Vec<FileMetadata>> {
    let mut out = Vec::with_capacity(batch_size.min(1024));
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(err) => {
                warn!("crawler: entry error under {dir}: {err}");
                continue;
            }
        };
        match entry_metadata(entry.path()) {
            Ok(meta) => out.push(meta),
            Err(err) => warn!("crawler: stat failed for {path}: {err}", path = entry.path().display()),
        }
    }
    Ok(out)
}
