//! Recording lifecycle watcher.
//!
//! Infers what an external recorder is doing purely from file sizes in a
//! directory: a growing file is `recording`, a file that stopped growing is
//! `converting`, and one that stays unchanged for the stability window is
//! `ready`. Any stat or scan failure turns into an `error` status, which
//! stays until the watch is re-armed with [`RecordingWatcher::start`].

use crate::notifier::SharedNotifier;
use duorec_ipc::{RecordingState, RecordingStatus};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const NOT_CONFIGURED: &str = "recording directory is not configured";

#[derive(Debug, Clone)]
pub struct WatcherOptions {
    pub poll_interval: Duration,
    pub stability_delay: Duration,
    /// How many directory levels below the root are scanned.
    pub depth: usize,
    /// Lower-case extensions without the dot; empty accepts every file.
    pub extensions: Vec<String>,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            stability_delay: Duration::from_secs(3),
            depth: 2,
            extensions: Vec::new(),
        }
    }
}

/// What the event source reports for a watched path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEvent {
    Add(PathBuf),
    Change(PathBuf),
    Error(String),
}

#[derive(Clone)]
pub struct RecordingWatcher {
    inner: Arc<Mutex<WatchInner>>,
    notifier: SharedNotifier,
    options: Arc<WatcherOptions>,
}

#[derive(Default)]
struct WatchInner {
    dir: Option<PathBuf>,
    /// Bumped on every start/stop; callbacks from older watches compare
    /// against it and bail out.
    generation: u64,
    errored: bool,
    sizes: HashMap<PathBuf, u64>,
    pending: HashMap<PathBuf, JoinHandle<()>>,
    source: Option<JoinHandle<()>>,
    last_status: Option<RecordingStatus>,
}

impl WatchInner {
    fn is_live(&self, generation: u64) -> bool {
        self.generation == generation && self.dir.is_some() && !self.errored
    }
}

impl RecordingWatcher {
    pub fn new(notifier: SharedNotifier, options: WatcherOptions) -> Self {
        Self {
            inner: Arc::new(Mutex::new(WatchInner::default())),
            notifier,
            options: Arc::new(options),
        }
    }

    /// Arms the watcher on `directory` and returns the resulting status.
    ///
    /// Re-arming the directory that is already watched (and healthy) is a
    /// no-op. Must be called from within a tokio runtime.
    pub fn start(&self, directory: Option<&Path>) -> Option<RecordingStatus> {
        let normalized = directory
            .filter(|d| !d.as_os_str().is_empty())
            .map(std::path::absolute);

        let mut inner = self.lock();
        let dir = match normalized {
            Some(Ok(dir)) => dir,
            Some(Err(e)) => {
                self.stop_locked(&mut inner);
                inner.errored = true;
                self.dispatch(&mut inner, RecordingStatus::error(e.to_string(), None));
                return inner.last_status.clone();
            }
            None => {
                self.stop_locked(&mut inner);
                inner.errored = true;
                self.dispatch(&mut inner, RecordingStatus::error(NOT_CONFIGURED, None));
                return inner.last_status.clone();
            }
        };

        if inner.dir.as_deref() == Some(dir.as_path()) && inner.source.is_some() && !inner.errored
        {
            return inner.last_status.clone();
        }

        self.stop_locked(&mut inner);
        inner.dir = Some(dir.clone());
        info!(dir = %dir.display(), "watching recording directory");
        self.dispatch(
            &mut inner,
            RecordingStatus {
                path: Some(dir.clone()),
                ..RecordingStatus::new(RecordingState::Idle)
            },
        );

        let generation = inner.generation;
        let watcher = self.clone();
        inner.source = Some(tokio::spawn(async move {
            poll_directory(watcher, dir, generation).await;
        }));
        inner.last_status.clone()
    }

    /// Stops watching, cancelling the poller and every pending re-check.
    pub fn stop(&self) {
        let mut inner = self.lock();
        let was_active = inner.dir.is_some();
        self.stop_locked(&mut inner);
        if was_active {
            self.dispatch(&mut inner, RecordingStatus::new(RecordingState::Idle));
        }
    }

    pub fn status(&self) -> Option<RecordingStatus> {
        self.lock().last_status.clone()
    }

    pub fn directory(&self) -> Option<PathBuf> {
        self.lock().dir.clone()
    }

    /// Number of delayed re-checks still scheduled.
    pub fn pending_checks(&self) -> usize {
        self.lock().pending.len()
    }

    /// Applies one file-system event from the watch armed as `generation`.
    /// Returns whether that watch is still live.
    ///
    /// The file is stat'ed without holding the lock; a watch that was
    /// stopped or re-armed meanwhile drops the result.
    pub(crate) async fn handle_event(&self, generation: u64, event: FsEvent) -> bool {
        let path = {
            let mut inner = self.lock();
            if !inner.is_live(generation) {
                return false;
            }
            match event {
                FsEvent::Error(message) => {
                    self.fail(&mut inner, message);
                    return false;
                }
                FsEvent::Add(path) | FsEvent::Change(path) => path,
            }
        };
        if !self.accepts(&path) {
            return true;
        }

        let metadata = tokio::fs::metadata(&path).await;
        let mut inner = self.lock();
        if !inner.is_live(generation) {
            return false;
        }
        let metadata = match metadata {
            Ok(metadata) => metadata,
            Err(e) => {
                self.fail(&mut inner, format!("{}: {}", path.display(), e));
                return false;
            }
        };
        if !metadata.is_file() {
            return true;
        }

        let size = metadata.len();
        let previous = inner.sizes.insert(path.clone(), size).unwrap_or(0);
        let growing = size > previous;

        if let Some(handle) = inner.pending.remove(&path) {
            handle.abort();
        }
        let status = RecordingStatus {
            path: inner.dir.clone(),
            file: Some(path.clone()),
            bytes: Some(size),
            ..RecordingStatus::new(if growing {
                RecordingState::Recording
            } else {
                RecordingState::Converting
            })
        };
        self.dispatch(&mut inner, status);

        if !growing {
            let watcher = self.clone();
            let delay = self.options.stability_delay;
            let file = path.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                watcher.settle(generation, &file, size);
            });
            inner.pending.insert(path, handle);
        }
        true
    }

    /// Fires when a re-check's stability window has elapsed.
    fn settle(&self, generation: u64, file: &Path, expected: u64) {
        let mut inner = self.lock();
        if inner.generation != generation || inner.errored {
            return;
        }
        inner.pending.remove(file);
        if inner.sizes.get(file) != Some(&expected) {
            return;
        }
        debug!(file = %file.display(), "recording settled");
        let status = RecordingStatus {
            path: inner.dir.clone(),
            file: Some(file.to_path_buf()),
            bytes: Some(expected),
            ..RecordingStatus::new(RecordingState::Ready)
        };
        self.dispatch(&mut inner, status);
    }

    fn accepts(&self, path: &Path) -> bool {
        if self.options.extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let ext = ext.to_ascii_lowercase();
                self.options.extensions.iter().any(|allowed| *allowed == ext)
            })
            .unwrap_or(false)
    }

    fn fail(&self, inner: &mut WatchInner, message: String) {
        warn!("recording watcher error: {}", message);
        inner.errored = true;
        for (_, handle) in inner.pending.drain() {
            handle.abort();
        }
        let status = RecordingStatus::error(message, inner.dir.clone());
        self.dispatch(inner, status);
    }

    fn stop_locked(&self, inner: &mut WatchInner) {
        if let Some(source) = inner.source.take() {
            source.abort();
        }
        for (_, handle) in inner.pending.drain() {
            handle.abort();
        }
        inner.sizes.clear();
        inner.dir = None;
        inner.errored = false;
        inner.generation += 1;
    }

    fn dispatch(&self, inner: &mut WatchInner, status: RecordingStatus) {
        let payload = serde_json::to_value(&status).unwrap_or_default();
        inner.last_status = Some(status);
        self.notifier.publish("watcher/status", payload);
    }

    fn lock(&self) -> MutexGuard<'_, WatchInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

type Signature = (u64, Option<SystemTime>);

/// Polling event source. The first scan is only a baseline: files already
/// there when the watch starts produce no events. After that a new file is
/// reported as `Add` and a file whose size or modification time moved as
/// `Change`. A file that changed in one scan and is unchanged in the next
/// gets one more `Change`, so the watcher sees the write stop.
async fn poll_directory(watcher: RecordingWatcher, root: PathBuf, generation: u64) {
    let mut known: Option<HashMap<PathBuf, Signature>> = None;
    let mut hot: HashSet<PathBuf> = HashSet::new();
    let mut interval = tokio::time::interval(watcher.options.poll_interval);
    loop {
        interval.tick().await;
        let events = match scan(&root, watcher.options.depth).await {
            Ok(snapshot) => {
                let events = match &known {
                    Some(known) => diff(known, &snapshot, &mut hot),
                    None => Vec::new(),
                };
                known = Some(snapshot);
                events
            }
            Err(e) => vec![FsEvent::Error(format!("{}: {}", root.display(), e))],
        };

        for event in events {
            if !watcher.handle_event(generation, event).await {
                return;
            }
        }
    }
}

fn diff(
    known: &HashMap<PathBuf, Signature>,
    snapshot: &HashMap<PathBuf, Signature>,
    hot: &mut HashSet<PathBuf>,
) -> Vec<FsEvent> {
    let mut events = Vec::new();
    for (path, signature) in snapshot {
        match known.get(path) {
            None => events.push(FsEvent::Add(path.clone())),
            Some(previous) if previous != signature => {
                hot.insert(path.clone());
                events.push(FsEvent::Change(path.clone()));
            }
            Some(_) => {
                if hot.remove(path) {
                    events.push(FsEvent::Change(path.clone()));
                }
            }
        }
    }
    hot.retain(|path| snapshot.contains_key(path));
    events
}

async fn scan(root: &Path, depth: usize) -> std::io::Result<HashMap<PathBuf, Signature>> {
    let mut found = HashMap::new();
    let mut stack = vec![(root.to_path_buf(), 0usize)];
    while let Some((dir, level)) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if level == 0 => return Err(e),
            // Subdirectories may vanish between listing and reading.
            Err(_) => continue,
        };
        while let Some(entry) = entries.next_entry().await? {
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            let path = entry.path();
            if file_type.is_dir() {
                if level < depth {
                    stack.push((path, level + 1));
                }
            } else if file_type.is_file() {
                if let Ok(metadata) = entry.metadata().await {
                    found.insert(path, (metadata.len(), metadata.modified().ok()));
                }
            }
        }
    }
    Ok(found)
}
