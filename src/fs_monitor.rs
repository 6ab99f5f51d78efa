//! Component B: wraps the OS change-notification facility.
//!
//! Grounded on the teacher's `file_system/watcher.rs` (`WatcherManager`,
//! `notify` + `notify-debouncer-full`), which is the teacher's cross-platform
//! watcher (as opposed to its macOS-only FSEvents path in
//! `indexing/watcher.rs`). The debouncer's own coalescing window stands in
//! for the `changes-done` close-out pairing described in spec §4.B; the
//! event-kind parsing the FSEvents path does (`must_scan_sub_dirs`,
//! `history_done`) informs what a coalescing rule has to account for, even
//! though the wire format here is `notify`'s, not FSEvents'.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use futures_util::StreamExt;
use log::warn;
use notify::{EventKind, ModifyKind, RecursiveMode, RenameMode};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, FileIdMap};
use tokio::sync::mpsc;

use crate::error::CancelToken;
use crate::events::EventBus;
use crate::path_util::{is_strict_prefix, normalize_path};

/// Default monitor cap: a conservative constant rather than a queried
/// platform limit, since the teacher's own cap (spec §4.B: "system limit
/// minus a safety margin of 500") is itself just a safety margin, not a
/// precisely load-bearing number.
pub const DEFAULT_MONITOR_CAP: usize = 8_192;

#[derive(Debug)]
pub enum MonitorError {
    Backend(String),
}

impl fmt::Display for MonitorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorError::Backend(msg) => write!(f, "monitor backend error: {msg}"),
        }
    }
}
impl std::error::Error for MonitorError {}

impl From<notify::Error> for MonitorError {
    fn from(err: notify::Error) -> Self {
        MonitorError::Backend(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub enum FsEvent {
    Created { path: String, is_dir: bool },
    Updated { path: String, is_dir: bool },
    Deleted { path: String, is_dir: bool },
    Moved { src: String, dst: String, is_dir: bool, src_was_watched: bool },
}

/// Platform-provided capability set (spec §6, "Monitor backend interface").
/// `NotifyMonitorBackend` is the only implementation the core ships; the
/// trait exists so a future platform-specific backend (e.g. FSEvents) can
/// be swapped in without touching `FilesystemMonitor`'s policy logic
/// (design note, spec §9: "dynamic dispatch -> trait sum types").
pub trait MonitorBackend {
    fn add(&mut self, dir: &str) -> Result<(), MonitorError>;
    fn remove(&mut self, dir: &str) -> Result<(), MonitorError>;
    fn facility_name(&self) -> &'static str;
}

pub struct NotifyMonitorBackend {
    debouncer: Debouncer<notify::RecommendedWatcher, FileIdMap>,
}

impl NotifyMonitorBackend {
    pub fn new(coalesce_window: Duration, sender: mpsc::UnboundedSender<DebounceEventResult>) -> Result<Self, MonitorError> {
        let debouncer = new_debouncer(coalesce_window, None, move |result: DebounceEventResult| {
            let _ = sender.send(result);
        })
        .map_err(MonitorError::from)?;
        Ok(Self { debouncer })
    }
}

impl MonitorBackend for NotifyMonitorBackend {
    fn add(&mut self, dir: &str) -> Result<(), MonitorError> {
        self.debouncer
            .watch(std::path::Path::new(dir), RecursiveMode::NonRecursive)
            .map_err(MonitorError::from)
    }

    fn remove(&mut self, dir: &str) -> Result<(), MonitorError> {
        self.debouncer
            .unwatch(std::path::Path::new(dir))
            .map_err(MonitorError::from)
    }

    fn facility_name(&self) -> &'static str {
        "notify"
    }
}

/// Component B. Owns the watched-directory set, the soft monitor cap, and
/// the move-rewrite ordering rule; translates backend events into `FsEvent`.
pub struct FilesystemMonitor<B: MonitorBackend> {
    backend: B,
    watched: HashSet<String>,
    max_watches: usize,
    ignored: u64,
    warned_cap: bool,
    pub events: EventBus<FsEvent>,
}

impl<B: MonitorBackend> FilesystemMonitor<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            watched: HashSet::new(),
            max_watches: DEFAULT_MONITOR_CAP,
            ignored: 0,
            warned_cap: false,
            events: EventBus::new(),
        }
    }

    pub fn with_max_watches(mut self, max_watches: usize) -> Self {
        self.max_watches = max_watches;
        self
    }

    pub fn ignored_count(&self) -> u64 {
        self.ignored
    }

    pub fn is_watched(&self, dir: &str) -> bool {
        self.watched.contains(&normalize_path(dir))
    }

    /// Add a watch. Never fails the caller when the cap is hit; returns
    /// `false` and bumps `ignored` instead (spec §4.B, "Limits").
    pub fn add(&mut self, dir: &str) -> bool {
        let dir = normalize_path(dir);
        if self.watched.contains(&dir) {
            return true;
        }
        if self.watched.len() >= self.max_watches {
            self.ignored += 1;
            if !self.warned_cap {
                warn!("filesystem monitor: cap of {} watches reached, further adds are ignored", self.max_watches);
                self.warned_cap = true;
            }
            return false;
        }
        if let Err(err) = self.backend.add(&dir) {
            warn!("filesystem monitor: failed to watch {dir}: {err}");
            return false;
        }
        self.watched.insert(dir);
        true
    }

    pub fn remove(&mut self, dir: &str) {
        let dir = normalize_path(dir);
        if self.watched.remove(&dir) {
            if let Err(err) = self.backend.remove(&dir) {
                warn!("filesystem monitor: failed to unwatch {dir}: {err}");
            }
        }
    }

    /// Handle a directory move: per spec §4.B, add watches for every
    /// descendant of `dst` corresponding to a watch under `src` *before*
    /// cancelling the `src` watches (kernels can reuse watch descriptors
    /// asynchronously, so the order avoids a window with no coverage).
    fn rewrite_watches_for_move(&mut self, src: &str, dst: &str) {
        let affected: Vec<String> = self
            .watched
            .iter()
            .filter(|w| *w == src || is_strict_prefix(src, w))
            .cloned()
            .collect();

        let mut to_add = Vec::new();
        for watched_path in &affected {
            let suffix = &watched_path[src.len()..];
            to_add.push(format!("{dst}{suffix}"));
        }
        for new_path in to_add {
            self.add(&new_path);
        }
        for old_path in affected {
            self.remove(&old_path);
        }
    }

    /// Translate one raw debounced event batch into `FsEvent`s, applying
    /// move-rewrite as needed, and publish them.
    pub fn handle_debounced(&mut self, result: DebounceEventResult) {
        let events = match result {
            Ok(events) => events,
            Err(errors) => {
                for err in errors {
                    warn!("filesystem monitor: backend error: {err}");
                }
                return;
            }
        };

        for debounced in events {
            let paths = &debounced.event.paths;
            match debounced.event.kind {
                EventKind::Create(_) => {
                    if let Some(path) = paths.first() {
                        let path = normalize_path(&path.to_string_lossy());
                        let is_dir = std::path::Path::new(&path).is_dir();
                        self.events.emit(&FsEvent::Created { path, is_dir });
                    }
                }
                EventKind::Remove(_) => {
                    if let Some(path) = paths.first() {
                        let path = normalize_path(&path.to_string_lossy());
                        self.events.emit(&FsEvent::Deleted { path, is_dir: false });
                    }
                }
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() == 2 => {
                    let src = normalize_path(&paths[0].to_string_lossy());
                    let dst = normalize_path(&paths[1].to_string_lossy());
                    let is_dir = std::path::Path::new(&dst).is_dir();
                    let src_was_watched = self.watched.contains(&src);
                    if is_dir && src_was_watched {
                        self.rewrite_watches_for_move(&src, &dst);
                    }
                    self.events.emit(&FsEvent::Moved { src, dst, is_dir, src_was_watched });
                }
                EventKind::Modify(_) => {
                    if let Some(path) = paths.first() {
                        let path = normalize_path(&path.to_string_lossy());
                        let is_dir = std::path::Path::new(&path).is_dir();
                        self.events.emit(&FsEvent::Updated { path, is_dir });
                    }
                }
                _ => {}
            }
        }
    }

    pub fn facility_name(&self) -> &'static str {
        self.backend.facility_name()
    }

    /// Drains `receiver` until it closes or `cancel` fires, dispatching each
    /// debounced batch through `handle_debounced`. Mirrors the teacher's
    /// `indexing/watcher.rs`, which drives its own FSEvents `mpsc` channel
    /// through a `futures_util::StreamExt` loop rather than polling the
    /// receiver directly.
    pub async fn run(&mut self, mut receiver: mpsc::UnboundedReceiver<DebounceEventResult>, cancel: &CancelToken) {
        let mut stream = futures_util::stream::poll_fn(move |cx| receiver.poll_recv(cx));
        while let Some(result) = stream.next().await {
            if cancel.is_cancelled() {
                break;
            }
            self.handle_debounced(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct FakeBackend {
        adds: Rc<RefCell<Vec<String>>>,
        removes: Rc<RefCell<Vec<String>>>,
        fail_add: bool,
    }

    impl MonitorBackend for FakeBackend {
        fn add(&mut self, dir: &str) -> Result<(), MonitorError> {
            if self.fail_add {
                return Err(MonitorError::Backend("forced failure".into()));
            }
            self.adds.borrow_mut().push(dir.to_string());
            Ok(())
        }
        fn remove(&mut self, dir: &str) -> Result<(), MonitorError> {
            self.removes.borrow_mut().push(dir.to_string());
            Ok(())
        }
        fn facility_name(&self) -> &'static str {
            "fake"
        }
    }

    #[test]
    fn add_respects_cap_and_increments_ignored() {
        let backend = FakeBackend {
            adds: Rc::new(RefCell::new(Vec::new())),
            removes: Rc::new(RefCell::new(Vec::new())),
            fail_add: false,
        };
        let mut monitor = FilesystemMonitor::new(backend).with_max_watches(1);
        assert!(monitor.add("/a"));
        assert!(!monitor.add("/b"));
        assert_eq!(monitor.ignored_count(), 1);
    }

    #[test]
    fn add_is_idempotent_for_already_watched_dir() {
        let backend = FakeBackend {
            adds: Rc::new(RefCell::new(Vec::new())),
            removes: Rc::new(RefCell::new(Vec::new())),
            fail_add: false,
        };
        let adds = Rc::clone(&backend.adds);
        let mut monitor = FilesystemMonitor::new(backend);
        assert!(monitor.add("/a"));
        assert!(monitor.add("/a"));
        assert_eq!(adds.borrow().len(), 1);
    }

    #[test]
    fn rewrite_watches_for_move_adds_destination_before_removing_source() {
        let backend = FakeBackend {
            adds: Rc::new(RefCell::new(Vec::new())),
            removes: Rc::new(RefCell::new(Vec::new())),
            fail_add: false,
        };
        let adds = Rc::clone(&backend.adds);
        let removes = Rc::clone(&backend.removes);
        let mut monitor = FilesystemMonitor::new(backend);
        monitor.add("/src");
        monitor.add("/src/inner");
        adds.borrow_mut().clear();

        monitor.rewrite_watches_for_move("/src", "/dst");

        assert!(adds.borrow().contains(&"/dst".to_string()));
        assert!(adds.borrow().contains(&"/dst/inner".to_string()));
        assert!(removes.borrow().contains(&"/src".to_string()));
        assert!(removes.borrow().contains(&"/src/inner".to_string()));
        assert!(monitor.is_watched("/dst"));
        assert!(!monitor.is_watched("/src"));
    }

    #[tokio::test]
    async fn run_drains_pending_batches_then_returns_once_the_channel_closes() {
        let backend = FakeBackend {
            adds: Rc::new(RefCell::new(Vec::new())),
            removes: Rc::new(RefCell::new(Vec::new())),
            fail_add: false,
        };
        let mut monitor = FilesystemMonitor::new(backend);

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Ok(Vec::new())).unwrap();
        drop(tx);

        let cancel = CancelToken::new();
        monitor.run(rx, &cancel).await;
    }
}
