//! Filesystem change watcher.
//!
//! Wraps a `notify` watcher and turns its raw events into three logical
//! callbacks on a [`WatchHandler`]. Raw events are drained on a dedicated
//! thread; notifications for the same path arriving within the coalesce
//! window collapse into one callback:
//!
//! | first    | then     | reported   |
//! |----------|----------|------------|
//! | added    | modified | added      |
//! | modified | modified | modified   |
//! | added    | deleted  | (nothing)  |
//! | modified | deleted  | deleted    |
//! | deleted  | added    | modified   |
//!
//! In [`WatchMode::PerDirectory`] every directory gets its own
//! non-recursive registration: directories created later are registered as
//! they appear (files already inside are reported as added) and deleted
//! directories are unregistered together with everything below them.
//! [`WatchMode::Native`] uses one recursive registration for platforms where
//! per-directory handles would lock the directories.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel as channel;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::errors::WatchError;

/// Receives coalesced file changes. Called on the watcher's drain thread.
pub trait WatchHandler: Send + Sync + 'static {
    fn file_added(&self, path: &Path);
    fn file_deleted(&self, path: &Path);
    fn file_modified(&self, path: &Path);
}

/// How directories are registered with the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    /// One recursive OS registration on the root.
    Native,
    /// One non-recursive registration per directory.
    PerDirectory,
}

impl WatchMode {
    pub fn for_platform() -> Self {
        if cfg!(any(target_os = "windows", target_os = "macos")) {
            Self::Native
        } else {
            Self::PerDirectory
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WatcherOptions {
    pub coalesce: Duration,
    pub mode: WatchMode,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            coalesce: Duration::from_millis(50),
            mode: WatchMode::for_platform(),
        }
    }
}

/// A logical file change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Deleted,
    Modified,
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

pub struct ChangeWatcher {
    root: PathBuf,
    watcher: Option<Arc<Mutex<RecommendedWatcher>>>,
    registered: Arc<Mutex<BTreeSet<PathBuf>>>,
    stop_tx: channel::Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl ChangeWatcher {
    /// Start watching `root`. With `recursive == false` only the root's
    /// direct children are observed.
    pub fn new(
        root: impl Into<PathBuf>,
        recursive: bool,
        handler: Arc<dyn WatchHandler>,
        options: WatcherOptions,
    ) -> Result<Self, WatchError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(WatchError::NotADirectory(root.display().to_string()));
        }

        let (raw_tx, raw_rx) = channel::unbounded();
        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = raw_tx.send(res);
        })?;
        let watcher = Arc::new(Mutex::new(watcher));
        let registered = Arc::new(Mutex::new(BTreeSet::new()));

        let registrar = Registrar {
            watcher: watcher.clone(),
            registered: registered.clone(),
            per_directory: recursive && options.mode == WatchMode::PerDirectory,
            recursive,
        };
        registrar.register_root(&root)?;

        let (stop_tx, stop_rx) = channel::bounded(1);
        let coalescer = Coalescer::new(options.coalesce);
        let thread = std::thread::Builder::new()
            .name("projectsync-watch".into())
            .spawn(move || run_drain_loop(raw_rx, stop_rx, registrar, coalescer, handler))
            .map_err(|e| WatchError::Unavailable(notify::Error::io(e)))?;

        info!(
            root = %root.display(),
            recursive,
            mode = ?options.mode,
            directories = lock(&registered).len(),
            "change watcher started"
        );

        Ok(Self {
            root,
            watcher: Some(watcher),
            registered,
            stop_tx,
            thread: Some(thread),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directories currently registered with the OS.
    pub fn watched_dirs(&self) -> Vec<PathBuf> {
        lock(&self.registered).iter().cloned().collect()
    }

    /// Stop the drain thread and release every OS registration. Pending
    /// coalesced changes are delivered before the thread exits.
    pub fn close(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let _ = self.stop_tx.send(());
        if thread.join().is_err() {
            warn!(root = %self.root.display(), "watch drain thread panicked");
        }

        if let Some(watcher) = self.watcher.take() {
            let mut registered = lock(&self.registered);
            let mut watcher = lock(&watcher);
            for dir in std::mem::take(&mut *registered) {
                if let Err(e) = watcher.unwatch(&dir) {
                    debug!(path = %dir.display(), error = %e, "unwatch failed");
                }
            }
        }
        info!(root = %self.root.display(), "change watcher closed");
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("watcher mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

struct Registrar {
    watcher: Arc<Mutex<RecommendedWatcher>>,
    registered: Arc<Mutex<BTreeSet<PathBuf>>>,
    per_directory: bool,
    recursive: bool,
}

impl Registrar {
    fn register_root(&self, root: &Path) -> Result<(), WatchError> {
        if self.per_directory {
            self.register_tree(root)?;
            return Ok(());
        }
        let mode = if self.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        lock(&self.watcher).watch(root, mode)?;
        lock(&self.registered).insert(root.to_path_buf());
        Ok(())
    }

    /// Register `dir` and its subdirectories (per-directory mode only) and
    /// return the files found below it.
    fn register_tree(&self, dir: &Path) -> Result<Vec<PathBuf>, WatchError> {
        let mut files = Vec::new();
        if !self.recursive {
            return Ok(files);
        }
        for entry in WalkDir::new(dir).follow_links(false) {
            let entry = entry.map_err(|e| WatchError::Scan {
                path: dir.display().to_string(),
                detail: e.to_string(),
            })?;
            if entry.file_type().is_dir() {
                if self.per_directory {
                    lock(&self.watcher).watch(entry.path(), RecursiveMode::NonRecursive)?;
                    lock(&self.registered).insert(entry.path().to_path_buf());
                }
            } else {
                files.push(entry.into_path());
            }
        }
        Ok(files)
    }

    fn unregister_tree(&self, dir: &Path) {
        if !self.per_directory {
            return;
        }
        let mut registered = lock(&self.registered);
        let gone: Vec<PathBuf> = registered
            .iter()
            .filter(|p| p.starts_with(dir))
            .cloned()
            .collect();
        for path in gone {
            registered.remove(&path);
            // The OS usually drops the registration itself when the
            // directory goes away.
            if let Err(e) = lock(&self.watcher).unwatch(&path) {
                debug!(path = %path.display(), error = %e, "unwatch failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Drain loop
// ---------------------------------------------------------------------------

fn run_drain_loop(
    raw_rx: channel::Receiver<notify::Result<Event>>,
    stop_rx: channel::Receiver<()>,
    registrar: Registrar,
    mut coalescer: Coalescer,
    handler: Arc<dyn WatchHandler>,
) {
    loop {
        let tick = match coalescer.next_deadline() {
            Some(deadline) => channel::after(deadline.saturating_duration_since(Instant::now())),
            None => channel::never(),
        };

        channel::select! {
            recv(stop_rx) -> _ => break,
            recv(raw_rx) -> msg => {
                let Ok(res) = msg else {
                    break;
                };
                match res {
                    Ok(event) => handle_event(event, &registrar, &mut coalescer),
                    Err(e) => warn!(error = %e, "watch backend error"),
                }
            }
            recv(tick) -> _ => {}
        }

        for (path, kind) in coalescer.flush(Instant::now()) {
            dispatch(handler.as_ref(), &path, kind);
        }
    }

    for (path, kind) in coalescer.flush_all() {
        dispatch(handler.as_ref(), &path, kind);
    }
    debug!("watch drain loop stopped");
}

fn handle_event(event: Event, registrar: &Registrar, coalescer: &mut Coalescer) {
    let now = Instant::now();
    let changes: Vec<(PathBuf, ChangeKind)> = match event.kind {
        EventKind::Access(_) => return,
        EventKind::Create(_) => tag(event.paths, ChangeKind::Added),
        EventKind::Remove(_) => tag(event.paths, ChangeKind::Deleted),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            tag(event.paths, ChangeKind::Deleted)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => tag(event.paths, ChangeKind::Added),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut paths = event.paths.into_iter();
            let mut changes = Vec::new();
            if let Some(from) = paths.next() {
                changes.push((from, ChangeKind::Deleted));
            }
            changes.extend(paths.map(|to| (to, ChangeKind::Added)));
            changes
        }
        // Backends that cannot tell the rename side.
        EventKind::Modify(ModifyKind::Name(_)) => event
            .paths
            .into_iter()
            .map(|p| {
                let kind = if p.exists() {
                    ChangeKind::Added
                } else {
                    ChangeKind::Deleted
                };
                (p, kind)
            })
            .collect(),
        EventKind::Modify(_) | EventKind::Any | EventKind::Other => {
            tag(event.paths, ChangeKind::Modified)
        }
    };

    for (path, kind) in changes {
        match kind {
            ChangeKind::Added if path.is_dir() => match registrar.register_tree(&path) {
                Ok(files) => {
                    debug!(path = %path.display(), files = files.len(), "directory added");
                    for file in files {
                        coalescer.push(file, ChangeKind::Added, now);
                    }
                }
                Err(e) => warn!(path = %path.display(), error = %e, "failed to register new directory"),
            },
            ChangeKind::Modified if path.is_dir() => {}
            ChangeKind::Deleted => {
                registrar.unregister_tree(&path);
                coalescer.push(path, kind, now);
            }
            _ => coalescer.push(path, kind, now),
        }
    }
}

fn tag(paths: Vec<PathBuf>, kind: ChangeKind) -> Vec<(PathBuf, ChangeKind)> {
    paths.into_iter().map(|p| (p, kind)).collect()
}

fn dispatch(handler: &dyn WatchHandler, path: &Path, kind: ChangeKind) {
    debug!(path = %path.display(), ?kind, "file change");
    match kind {
        ChangeKind::Added => handler.file_added(path),
        ChangeKind::Deleted => handler.file_deleted(path),
        ChangeKind::Modified => handler.file_modified(path),
    }
}

// ---------------------------------------------------------------------------
// Coalescing
// ---------------------------------------------------------------------------

struct Pending {
    deadline: Instant,
    /// `None` when the changes so far cancel out.
    kind: Option<ChangeKind>,
}

/// Collapses changes to the same path within a fixed window that starts at
/// the path's first change.
struct Coalescer {
    window: Duration,
    pending: HashMap<PathBuf, Pending>,
}

impl Coalescer {
    fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    fn push(&mut self, path: PathBuf, kind: ChangeKind, now: Instant) {
        match self.pending.entry(path) {
            Entry::Occupied(mut entry) => {
                let pending = entry.get_mut();
                pending.kind = match pending.kind {
                    Some(previous) => combine(previous, kind),
                    None => Some(kind),
                };
            }
            Entry::Vacant(entry) => {
                entry.insert(Pending {
                    deadline: now + self.window,
                    kind: Some(kind),
                });
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Changes whose window has closed, oldest first.
    fn flush(&mut self, now: Instant) -> Vec<(PathBuf, ChangeKind)> {
        let mut due = Vec::new();
        self.pending.retain(|path, pending| {
            if pending.deadline > now {
                return true;
            }
            if let Some(kind) = pending.kind {
                due.push((pending.deadline, path.clone(), kind));
            }
            false
        });
        sorted(due)
    }

    fn flush_all(&mut self) -> Vec<(PathBuf, ChangeKind)> {
        let due = self
            .pending
            .drain()
            .filter_map(|(path, p)| p.kind.map(|kind| (p.deadline, path, kind)))
            .collect();
        sorted(due)
    }
}

fn sorted(mut due: Vec<(Instant, PathBuf, ChangeKind)>) -> Vec<(PathBuf, ChangeKind)> {
    due.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    due.into_iter().map(|(_, path, kind)| (path, kind)).collect()
}

fn combine(previous: ChangeKind, next: ChangeKind) -> Option<ChangeKind> {
    use ChangeKind::*;
    match (previous, next) {
        (Added, Deleted) => None,
        (Added, _) => Some(Added),
        (Modified, Deleted) => Some(Deleted),
        (Modified, _) => Some(Modified),
        (Deleted, Deleted) => Some(Deleted),
        (Deleted, _) => Some(Modified),
    }
}
