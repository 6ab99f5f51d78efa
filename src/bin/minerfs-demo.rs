//! Standalone CLI demo for the indexing-miner core.
//!
//! Thin wrapper around `MinerFs`, the same shape as the teacher's
//! `commands/indexing.rs` Tauri command surface (start/stop/status) but
//! driven from argv instead of IPC, and against an in-memory `Store`
//! instead of a real triple store.
//!
//! Usage: `minerfs-demo <root-dir> [--no-recurse]`

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use minerfs_core::error::CancelToken;
use minerfs_core::indexing_tree::TreeEvent;
use minerfs_core::miner_fs::{Extractor, MinerFs};
use minerfs_core::store::{Row, Store, StoreError, TypedValue};

/// Keeps every committed statement in memory and answers `ASK`/`SELECT`
/// queries by substring match against stored subjects. Good enough for a
/// demo; real deployments implement `Store` against a persistent triple
/// store instead.
struct MemoryStore {
    subjects: Mutex<HashMap<String, bool>>,
}

impl MemoryStore {
    fn new() -> Self {
        Self { subjects: Mutex::new(HashMap::new()) }
    }
}

#[async_trait::async_trait(?Send)]
impl Store for MemoryStore {
    async fn query(&self, text: &str) -> Result<Vec<Row>, StoreError> {
        let subjects = self.subjects.lock().unwrap();
        if text.starts_with("ASK") {
            let known = subjects.keys().any(|iri| text.contains(iri.as_str()));
            return Ok(vec![vec![TypedValue::Boolean(known)]]);
        }
        Ok(Vec::new())
    }

    async fn update_array(&self, texts: &[String]) -> Result<Vec<Result<(), StoreError>>, StoreError> {
        let mut subjects = self.subjects.lock().unwrap();
        for text in texts {
            if let Some(start) = text.find('<') {
                if let Some(end) = text[start..].find('>') {
                    let iri = text[start + 1..start + end].to_string();
                    if text.contains("DELETE") && !text.contains("INSERT") {
                        subjects.remove(&iri);
                    } else {
                        subjects.insert(iri, true);
                    }
                }
            }
        }
        Ok(texts.iter().map(|_| Ok(())).collect())
    }
}

/// Synthesizes a minimal `nfo:FileDataObject` triple per file rather than
/// running any real metadata/content extraction.
struct NameOnlyExtractor;

#[async_trait::async_trait(?Send)]
impl Extractor for NameOnlyExtractor {
    async fn process_file(&mut self, file: &str, is_directory: bool, _cancel: &CancelToken) -> Option<String> {
        let name = minerfs_core::path_util::basename(file);
        let rdf_type = if is_directory { "nfo:Folder" } else { "nfo:FileDataObject" };
        Some(format!("<urn:minerfs:{file}> a {rdf_type} ; nfo:fileName \"{name}\" ."))
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let Some(root) = args.next() else {
        eprintln!("usage: minerfs-demo <root-dir> [--no-recurse]");
        std::process::exit(1);
    };
    let recurse = !args.any(|a| a == "--no-recurse");

    let store = Arc::new(MemoryStore::new());
    let mut miner = MinerFs::new(Arc::clone(&store), NameOnlyExtractor, 1024, 64);

    // `MinerFs` doesn't own the tree's `EventBus` directly in this demo, so
    // the root is queued straight through `add_directory` plus a manual
    // `on_tree_event` call rather than subscribing to a shared tree.
    println!("minerfs-demo: indexing {root} (recurse={recurse})");
    miner.add_directory(&root, recurse);
    miner.on_tree_event(&TreeEvent::DirectoryAdded {
        path: root.clone(),
        flags: minerfs_core::indexing_tree::DirectoryFlags::MONITOR
            | minerfs_core::indexing_tree::DirectoryFlags::CHECK_MTIME
            | if recurse {
                minerfs_core::indexing_tree::DirectoryFlags::RECURSE
            } else {
                minerfs_core::indexing_tree::DirectoryFlags::NONE
            },
    });

    miner.drive_crawls().await;

    let mut ticks = 0;
    while miner.progress_fraction() < 1.0 && ticks < 100_000 {
        miner.dispatch_tick().await;
        ticks += 1;
        if ticks % 100 == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
    miner.commit().await;

    println!("minerfs-demo: status={}, progress={:.1}%", miner.status().as_str(), miner.progress_fraction() * 100.0);
}
