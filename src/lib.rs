//! Indexing-miner core.
//!
//! Binds a configurable [`IndexingTree`](indexing_tree::IndexingTree) of
//! indexing roots to an async [`Crawler`](crawler::Crawler), a
//! [`FilesystemMonitor`](fs_monitor::FilesystemMonitor), a canonicalizing
//! [`FileCache`](fs_cache::FileCache), a [`FileNotifier`](file_notifier::FileNotifier)
//! that diffs crawl results against a [`Store`](store::Store), a staged
//! [`ProcessingPool`](processing_pool::ProcessingPool), and the
//! [`MinerFs`](miner_fs::MinerFs) dispatch loop that ties all of the above
//! into one cooperative, single-threaded miner.

pub mod config;
pub mod crawler;
pub mod error;
pub mod events;
pub mod file_notifier;
pub mod fs_cache;
pub mod fs_monitor;
pub mod ignore_poison;
pub mod indexing_tree;
pub mod miner_fs;
pub mod path_util;
pub mod processing_pool;
pub mod store;

pub use config::RootsConfig;
pub use error::{CancelToken, MinerError};
pub use events::{Event, EventBus, EventKind};
pub use file_notifier::FileNotifier;
pub use fs_cache::{FileCache, FileHandle};
pub use fs_monitor::{FilesystemMonitor, FsEvent, MonitorBackend};
pub use indexing_tree::{DirectoryFlags, FilterKind, IndexingTree, TreeEvent};
pub use miner_fs::{Extractor, MinerFs, MinerStatus};
pub use processing_pool::{PoolError, ProcessingPool, ProcessingTask};
pub use store::{Store, StoreError, StoreStatement, TypedValue};
