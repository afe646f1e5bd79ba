use std::{
    collections::{BTreeSet, HashMap},
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender};
use dashmap::DashMap;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use strata_core::{ModuleName, Result, StrataError};
use tracing::{debug, error, info, warn};

use crate::registry::{InstanceRegistry, ReloadReport};
use crate::store::FsSourceStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileChange {
    Added,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpdate {
    pub path: PathBuf,
    pub change: FileChange,
}

impl FileUpdate {
    pub fn new(path: impl Into<PathBuf>, change: FileChange) -> Self {
        Self {
            path: path.into(),
            change,
        }
    }
}

/// Turns script file changes under a filesystem store into pending module
/// removes and adds, then applies them to a registry.
pub struct ScriptWatcher {
    store: Arc<FsSourceStore>,
    debounce: Duration,
    pending_removes: Mutex<BTreeSet<ModuleName>>,
    pending_adds: Mutex<BTreeSet<ModuleName>>,
    hashes: DashMap<PathBuf, String>,
    subscribers: Mutex<Vec<Sender<ReloadReport>>>,
}

impl ScriptWatcher {
    pub fn new(store: Arc<FsSourceStore>) -> Self {
        Self {
            store,
            debounce: Duration::from_millis(250),
            pending_removes: Mutex::new(BTreeSet::new()),
            pending_adds: Mutex::new(BTreeSet::new()),
            hashes: DashMap::new(),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_debounce(mut self, d: Duration) -> Self {
        self.debounce = d;
        self
    }

    pub fn store(&self) -> &Arc<FsSourceStore> {
        &self.store
    }

    /// Receives a report after every processed batch of changes.
    pub fn subscribe(&self) -> Receiver<ReloadReport> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Schedules work for one file change. Returns false when the path is
    /// not a script under the store or the content did not change.
    pub fn file_updated(&self, update: FileUpdate) -> bool {
        let Some((tier, name)) = self.store.module_name_for(&update.path) else {
            return false;
        };

        match update.change {
            FileChange::Deleted => {
                self.hashes.remove(&update.path);
            }
            FileChange::Added | FileChange::Updated => match hash_file(&update.path) {
                Some(hash) => {
                    let previous = self.hashes.insert(update.path.clone(), hash.clone());
                    if update.change == FileChange::Updated && previous.as_deref() == Some(&hash) {
                        debug!(module = %name, path = ?update.path, "content unchanged, skipping");
                        return false;
                    }
                }
                None => {
                    debug!(module = %name, path = ?update.path, "file unreadable, treating as changed");
                }
            },
        }

        let readd = match update.change {
            FileChange::Deleted => self.store.has_module(&name),
            FileChange::Added | FileChange::Updated => true,
        };
        debug!(
            module = %name,
            tier = %tier,
            change = ?update.change,
            readd,
            "scheduled module update"
        );
        self.pending_removes.lock().insert(name.clone());
        if readd {
            self.pending_adds.lock().insert(name);
        }
        true
    }

    pub fn needs_update(&self) -> bool {
        !self.pending_removes.lock().is_empty() || !self.pending_adds.lock().is_empty()
    }

    /// Applies pending removes, then pending adds, then reloads every
    /// tracked module.
    pub fn process_file_updates(&self, registry: &InstanceRegistry) -> ReloadReport {
        let removes = std::mem::take(&mut *self.pending_removes.lock());
        let adds = std::mem::take(&mut *self.pending_adds.lock());

        for name in &removes {
            registry.remove_module(name);
        }
        for name in &adds {
            match registry.add_module(name) {
                Ok(_) => {}
                Err(StrataError::SourceNotFound(_)) => {
                    debug!(module = %name, "module disappeared before it could be added");
                }
                Err(e) => {
                    error!(module = %name, error = %e, "failed to add changed module");
                    registry.add_import_error(strata_core::ImportErrorRecord::from_error(
                        name.to_string(),
                        &e,
                    ));
                }
            }
        }

        let report = registry.reload_modules();
        self.subscribers
            .lock()
            .retain(|tx| tx.send(report.clone()).is_ok());
        report
    }

    /// Blocking watch loop over every tier directory. Runs until `shutdown`
    /// is set or the notify channel disconnects.
    pub fn watch(&self, registry: &InstanceRegistry, shutdown: &AtomicBool) -> Result<()> {
        let (raw_tx, raw_rx) = std::sync::mpsc::channel::<notify::Result<Event>>();
        let mut watcher: RecommendedWatcher = Watcher::new(raw_tx, notify::Config::default())
            .map_err(|e| StrataError::Watch(e.to_string()))?;
        for (tier, dir) in self.store.tier_dirs() {
            if !dir.is_dir() {
                warn!(tier = %tier, "tier directory {:?} does not exist, not watching", dir);
                continue;
            }
            watcher
                .watch(&dir, RecursiveMode::Recursive)
                .map_err(|e| StrataError::Watch(format!("{}: {}", dir.display(), e)))?;
            info!(tier = %tier, "watching {:?}", dir);
        }

        let mut buf: HashMap<PathBuf, (FileChange, Instant)> = HashMap::new();
        let mut last_flush = Instant::now();

        while !shutdown.load(Ordering::Relaxed) {
            match raw_rx.recv_timeout(self.debounce) {
                Ok(Ok(event)) => {
                    let Some(change) = classify(&event.kind) else {
                        continue;
                    };
                    for path in event.paths.iter().filter(|p| self.is_script(p)) {
                        let change = match buf.get(path) {
                            Some((FileChange::Added, _)) if change == FileChange::Updated => {
                                FileChange::Added
                            }
                            _ => change,
                        };
                        buf.insert(path.clone(), (change, Instant::now()));
                    }
                }
                Ok(Err(e)) => {
                    error!("watcher error: {:?}", e);
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    warn!("file watcher disconnected");
                    break;
                }
            }

            if !buf.is_empty() && last_flush.elapsed() >= self.debounce {
                let now = Instant::now();
                let ready: Vec<(PathBuf, FileChange)> = buf
                    .iter()
                    .filter(|(_, (_, t))| now.duration_since(*t) >= self.debounce)
                    .map(|(p, (c, _))| (p.clone(), *c))
                    .collect();
                for (path, change) in ready {
                    buf.remove(&path);
                    self.file_updated(FileUpdate::new(path, change));
                }
                if self.needs_update() {
                    let report = self.process_file_updates(registry);
                    if !report.is_empty() {
                        info!(
                            reloaded = report.reloaded.len(),
                            removed = report.removed.len(),
                            failed = report.failed.len(),
                            "applied script changes"
                        );
                    }
                }
                last_flush = Instant::now();
            }
        }
        debug!("watch loop stopped");
        Ok(())
    }

    fn is_script(&self, path: &Path) -> bool {
        path.extension().and_then(|s| s.to_str()) == Some(self.store.extension())
    }
}

fn classify(kind: &EventKind) -> Option<FileChange> {
    match kind {
        EventKind::Create(_) => Some(FileChange::Added),
        EventKind::Modify(_) => Some(FileChange::Updated),
        EventKind::Remove(_) => Some(FileChange::Deleted),
        _ => None,
    }
}

fn hash_file(path: &Path) -> Option<String> {
    let bytes = fs::read(path).ok()?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Some(format!("{:x}", hasher.finalize()))
}
