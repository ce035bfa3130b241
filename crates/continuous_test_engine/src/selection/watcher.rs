//! Class change feed using notify-rs.
//!
//! Watches compiled class output roots and turns artifact writes and
//! removals into a [`ChangeSet`] of dotted class names.

use crate::model::ChangeSet;
use crate::normalize::path::{class_name_from_path, is_class_file};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use ignore::WalkBuilder;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Maximum pending class changes before the next drain becomes a full run.
const MAX_PENDING_CLASSES: usize = 500;
/// Poll interval for watcher backends that poll.
const POLL_INTERVAL_MS: u64 = 100;
/// Capacity of the raw event channel.
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Errors that can occur while starting the change feed.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("no output roots to watch")]
    NoRoots,
    #[error("watcher error: {0}")]
    Notify(#[from] notify::Error),
    #[error("failed to start watcher thread: {0}")]
    Thread(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeKind {
    Added,
    Changed,
    Deleted,
}

#[derive(Default)]
struct TrackerState {
    hashes: HashMap<PathBuf, blake3::Hash>,
    pending: HashMap<String, ChangeKind>,
    overflow: bool,
}

/// Classifies class artifact events by content hash.
#[derive(Default)]
pub struct ClassChangeTracker {
    state: Mutex<TrackerState>,
}

impl ClassChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the current content of an artifact without reporting a change.
    pub fn seed(&self, path: &Path) {
        if let Ok(content) = std::fs::read(path) {
            self.lock().hashes.insert(path.to_path_buf(), blake3::hash(&content));
        }
    }

    /// Observe an artifact path. Returns true if a change was recorded.
    ///
    /// A write that leaves the content unchanged is not a change.
    pub fn observe(&self, class: &str, path: &Path) -> bool {
        let content = std::fs::read(path).ok();
        let mut state = self.lock();

        let kind = match (content, state.hashes.get(path).copied()) {
            (Some(content), previous) => {
                let hash = blake3::hash(&content);
                if previous == Some(hash) {
                    return false;
                }
                state.hashes.insert(path.to_path_buf(), hash);
                if previous.is_some() {
                    ChangeKind::Changed
                } else {
                    ChangeKind::Added
                }
            }
            (None, Some(_)) => {
                state.hashes.remove(path);
                ChangeKind::Deleted
            }
            (None, None) => return false,
        };

        let merged = match (state.pending.get(class).copied(), kind) {
            (None, kind) => Some(kind),
            (Some(ChangeKind::Added), ChangeKind::Deleted) => None,
            (Some(ChangeKind::Added), _) => Some(ChangeKind::Added),
            (Some(ChangeKind::Deleted), ChangeKind::Added) => Some(ChangeKind::Changed),
            (Some(_), kind) => Some(kind),
        };

        match merged {
            Some(kind) => {
                if !state.pending.contains_key(class) && state.pending.len() >= MAX_PENDING_CLASSES {
                    if !state.overflow {
                        tracing::warn!(
                            max = MAX_PENDING_CLASSES,
                            "pending class changes exceeded limit, next batch runs everything"
                        );
                        state.overflow = true;
                    }
                    return true;
                }
                state.pending.insert(class.to_string(), kind);
            }
            None => {
                state.pending.remove(class);
            }
        }
        true
    }

    /// Drain pending changes. `None` means too many changes, run everything.
    pub fn drain(&self) -> Option<ChangeSet> {
        let mut state = self.lock();
        let pending = std::mem::take(&mut state.pending);
        if std::mem::take(&mut state.overflow) {
            return None;
        }

        let mut changes = ChangeSet::new();
        for (class, kind) in pending {
            match kind {
                ChangeKind::Added => changes.added.insert(class),
                ChangeKind::Changed => changes.changed.insert(class),
                ChangeKind::Deleted => changes.deleted.insert(class),
            };
        }
        Some(changes)
    }

    pub fn has_pending(&self) -> bool {
        let state = self.lock();
        state.overflow || !state.pending.is_empty()
    }
}

/// One compiled class output root.
pub struct OutputRoot {
    pub path: PathBuf,
    pub gitignore: Option<Gitignore>,
}

impl OutputRoot {
    /// Create an output root, loading its `.gitignore` if present.
    pub fn new(path: PathBuf) -> Self {
        let path = path.canonicalize().unwrap_or(path);
        let gitignore = load_gitignore(&path);
        Self { path, gitignore }
    }

    /// Check if a path should be ignored.
    pub fn should_ignore(&self, path: &Path) -> bool {
        if !is_class_file(path) {
            return true;
        }
        let Ok(relative) = path.strip_prefix(&self.path) else {
            return true;
        };
        if let Some(ref gi) = self.gitignore {
            if gi.matched_path_or_any_parents(relative, false).is_ignore() {
                return true;
            }
        }
        false
    }

    /// Map a path under this root to its class name, if it is a tracked artifact.
    pub fn class_for(&self, path: &Path) -> Option<String> {
        if self.should_ignore(path) {
            return None;
        }
        match class_name_from_path(&self.path, path) {
            Ok(name) => Some(name),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "ignoring artifact");
                None
            }
        }
    }
}

fn load_gitignore(root: &Path) -> Option<Gitignore> {
    let gitignore_path = root.join(".gitignore");
    if !gitignore_path.exists() {
        return None;
    }

    let mut builder = GitignoreBuilder::new(root);
    if builder.add(&gitignore_path).is_some() {
        return None;
    }

    builder.build().ok()
}

/// Configuration for the change feed.
pub struct WatcherConfig {
    pub roots: Vec<OutputRoot>,
}

impl WatcherConfig {
    pub fn new<I>(roots: I) -> Self
    where
        I: IntoIterator<Item = PathBuf>,
    {
        Self { roots: roots.into_iter().map(OutputRoot::new).collect() }
    }

    /// Resolve a path to a class name using the first root containing it.
    pub fn class_for(&self, path: &Path) -> Option<String> {
        self.roots
            .iter()
            .find(|root| path.starts_with(&root.path))
            .and_then(|root| root.class_for(path))
    }

    /// Hash every existing artifact so the first event on it is a change.
    pub fn seed(&self, tracker: &ClassChangeTracker) {
        for root in &self.roots {
            let walker = WalkBuilder::new(&root.path)
                .hidden(false)
                .git_ignore(false)
                .build();
            for entry in walker.flatten() {
                let path = entry.path();
                if root.class_for(path).is_some() {
                    tracker.seed(path);
                }
            }
        }
    }
}

/// A running class change feed.
///
/// Dropping the feed stops the watcher.
pub struct ChangeFeed {
    tracker: Arc<ClassChangeTracker>,
    signals: mpsc::Receiver<()>,
    _watcher: RecommendedWatcher,
}

impl ChangeFeed {
    /// Seed the tracker from the current output and start watching.
    pub fn start(config: WatcherConfig) -> Result<Self, WatchError> {
        if config.roots.is_empty() {
            return Err(WatchError::NoRoots);
        }

        let tracker = Arc::new(ClassChangeTracker::new());
        config.seed(&tracker);

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (signal_tx, signals) = mpsc::channel(1);

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    for path in event.paths {
                        if let Err(e) = event_tx.blocking_send(path) {
                            tracing::debug!(path = %e.0.display(), "change feed stopped, dropping event");
                        }
                    }
                }
                Err(e) => tracing::error!(error = %e, "class watcher error"),
            },
            Config::default().with_poll_interval(Duration::from_millis(POLL_INTERVAL_MS)),
        )?;

        for root in &config.roots {
            watcher.watch(&root.path, RecursiveMode::Recursive)?;
        }

        let thread_tracker = Arc::clone(&tracker);
        std::thread::Builder::new()
            .name("class-change-feed".into())
            .spawn(move || forward_events(config, thread_tracker, event_rx, signal_tx))?;

        Ok(Self { tracker, signals, _watcher: watcher })
    }

    /// Take the changes seen since the last drain.
    pub fn drain(&self) -> Option<ChangeSet> {
        self.tracker.drain()
    }

    pub fn has_pending(&self) -> bool {
        self.tracker.has_pending()
    }

    /// Wait until at least one change is pending.
    ///
    /// Returns false once the watcher has stopped.
    pub async fn changed(&mut self) -> bool {
        self.signals.recv().await.is_some()
    }

    /// Blocking variant of [`ChangeFeed::changed`] for non-async callers.
    pub fn wait_blocking(&mut self) -> bool {
        self.signals.blocking_recv().is_some()
    }
}

fn forward_events(
    config: WatcherConfig,
    tracker: Arc<ClassChangeTracker>,
    mut events: mpsc::Receiver<PathBuf>,
    signals: mpsc::Sender<()>,
) {
    let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "failed to build change feed runtime");
            return;
        }
    };

    rt.block_on(async {
        while let Some(path) = events.recv().await {
            let Some(class) = config.class_for(&path) else {
                continue;
            };
            if tracker.observe(&class, &path) {
                tracing::debug!(class, "class artifact changed");
                // A full channel already carries a pending signal.
                let _ = signals.try_send(());
            }
        }
    });
}
