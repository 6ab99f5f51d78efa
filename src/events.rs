//! In-process event bus.
//!
//! Design note (spec §9): "Signal/slot fanout -> in-process event bus" — each
//! component that used to emit named signals (`directory-added`,
//! `check-directory`, `finished`, ...) instead publishes a typed event to a
//! small list of registered subscribers. This replaces the teacher's
//! `tauri::AppHandle::emit("string-name", payload)` calls (which need a
//! running Tauri app) with a plain, runtime-agnostic fan-out.

use std::sync::Mutex;

use crate::ignore_poison::IgnorePoison;

/// The canonical event shape the core works in (spec §3, "Event"). Produced
/// by `FileNotifier`'s crawl/store diff and by live `FilesystemMonitor`
/// forwarding, and consumed by `MinerFS`'s four dispatch queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
    Moved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub file: String,
    pub other_file: Option<String>,
    pub is_directory: bool,
}

impl Event {
    pub fn created(file: impl Into<String>, is_directory: bool) -> Self {
        Self {
            kind: EventKind::Created,
            file: file.into(),
            other_file: None,
            is_directory,
        }
    }

    pub fn updated(file: impl Into<String>, is_directory: bool) -> Self {
        Self {
            kind: EventKind::Updated,
            file: file.into(),
            other_file: None,
            is_directory,
        }
    }

    pub fn deleted(file: impl Into<String>, is_directory: bool) -> Self {
        Self {
            kind: EventKind::Deleted,
            file: file.into(),
            other_file: None,
            is_directory,
        }
    }

    pub fn moved(src: impl Into<String>, dst: impl Into<String>, is_directory: bool) -> Self {
        Self {
            kind: EventKind::Moved,
            file: src.into(),
            other_file: Some(dst.into()),
            is_directory,
        }
    }
}

type Subscriber<T> = Box<dyn Fn(&T) + Send + Sync>;

/// A typed, multi-subscriber event bus. One instance per event type per
/// component (e.g. `IndexingTree` owns an `EventBus<TreeEvent>`).
pub struct EventBus<T> {
    subscribers: Mutex<Vec<Subscriber<T>>>,
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<T> EventBus<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. Subscribers are called synchronously, in
    /// registration order, from whichever thread calls `emit`.
    pub fn subscribe(&self, f: impl Fn(&T) + Send + Sync + 'static) {
        self.subscribers.lock_ignore_poison().push(Box::new(f));
    }

    /// Publish an event to all current subscribers.
    pub fn emit(&self, event: &T) {
        let subs = self.subscribers.lock_ignore_poison();
        for sub in subs.iter() {
            sub(event);
        }
    }

    /// Number of currently registered subscribers. Mostly useful for tests.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock_ignore_poison().len()
    }
}
