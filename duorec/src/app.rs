use crate::notifier::SharedNotifier;
use crate::rename::RenamePipeline;
use crate::store::SessionStore;
use crate::timer::{TickSource, TimerEngine};
use crate::watcher::{RecordingWatcher, WatcherOptions};
use crate::worker::WorkerClient;
use duorec_ipc::worker::KnownAction;
use duorec_ipc::{
    Command, EventEnvelope, RecordingState, RecordingStatus, RenameMetadata, RenameOutcome,
    Response, StopReason,
};
use serde_json::json;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// The daemon's components wired together behind the command surface.
pub struct App {
    pub store: SessionStore,
    pub timer: TimerEngine,
    pub watcher: RecordingWatcher,
    pub renamer: RenamePipeline,
    pub worker: Option<WorkerClient>,
    notifier: SharedNotifier,
    /// Files auto-renamed during the current watch.
    processed: Mutex<HashSet<PathBuf>>,
}

impl App {
    pub fn new(
        store: SessionStore,
        notifier: SharedNotifier,
        ticks: TickSource,
        watcher_options: WatcherOptions,
    ) -> Self {
        Self {
            timer: TimerEngine::new(store.clone(), notifier.clone(), ticks),
            watcher: RecordingWatcher::new(notifier.clone(), watcher_options),
            renamer: RenamePipeline::new(store.clone()),
            worker: None,
            store,
            notifier,
            processed: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_worker(mut self, worker: WorkerClient) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Executes one control command.
    pub async fn handle(&self, command: Command) -> Response {
        match command {
            Command::TimerStart { payload } => Response::Timer(self.timer.start(payload)),
            Command::TimerStop { reason } => {
                Response::Timer(self.timer.stop(reason.unwrap_or_default()))
            }
            Command::TimerReset => Response::Timer(self.timer.reset()),
            Command::TimerStatus => Response::Timer(self.timer.status()),
            Command::TimerSetMode { mode } => Response::Mode(self.timer.set_mode(&mode)),
            Command::WatchStart { directory } => Response::Recording(self.start_watch(directory)),
            Command::WatchStop => {
                self.watcher.stop();
                Response::Recording(self.watcher.status())
            }
            Command::WatchStatus => Response::Recording(self.watcher.status()),
            Command::Rename { file, metadata } => Response::Rename(self.rename(&file, &metadata).await),
            Command::WorkerInvoke {
                action,
                payload,
                timeout_ms,
            } => self.invoke_worker(&action, payload, timeout_ms).await,
            Command::ConfigGet => Response::Config(self.store.get()),
            Command::ConfigUpdate { patch } => match self.store.apply(patch) {
                Ok(record) => Response::Config(record),
                Err(e) => Response::Error(e.to_string()),
            },
            Command::Subscribe => {
                Response::Error("subscribe is only available on the control socket".to_string())
            }
        }
    }

    /// Arms the watcher on `directory`, or on the persisted recording
    /// directory when none is given. A given directory is persisted.
    pub fn start_watch(&self, directory: Option<PathBuf>) -> Option<RecordingStatus> {
        let directory = match directory.filter(|d| !d.as_os_str().is_empty()) {
            Some(dir) => {
                let persisted = dir.clone();
                if let Err(e) = self
                    .store
                    .update(move |record| record.zoom_recording_dir = Some(persisted))
                {
                    warn!("failed to persist recording directory: {}", e);
                }
                Some(dir)
            }
            None => self.store.get().zoom_recording_dir,
        };

        let previous = self.watcher.directory();
        let status = self.watcher.start(directory.as_deref());
        if self.watcher.directory() != previous {
            self.processed().clear();
        }
        status
    }

    pub async fn rename(&self, file: &Path, metadata: &RenameMetadata) -> RenameOutcome {
        match self.renamer.rename_recording(file, metadata).await {
            Ok(result) => RenameOutcome::Renamed(result),
            Err(e) => {
                warn!(file = %file.display(), "rename failed: {}", e);
                RenameOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    async fn invoke_worker(
        &self,
        action: &str,
        payload: serde_json::Value,
        timeout_ms: Option<u64>,
    ) -> Response {
        let Some(worker) = &self.worker else {
            return Response::Error("worker is not configured".to_string());
        };
        let action = match action.parse::<KnownAction>() {
            Ok(action) => action,
            Err(e) => return Response::Error(e),
        };
        if let Err(e) = action.validate(&payload) {
            return Response::Error(e);
        }
        match worker
            .invoke(action.name(), payload, timeout_ms.map(Duration::from_millis))
            .await
        {
            Ok(result) => Response::Worker(result),
            Err(e) => Response::Error(e.to_string()),
        }
    }

    /// Renames every recording the watcher reports ready, once per watch.
    /// Runs until the event channel closes.
    pub async fn run_auto_rename(&self, mut events: broadcast::Receiver<EventEnvelope>) {
        loop {
            let envelope = match events.recv().await {
                Ok(envelope) => envelope,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("auto-rename missed {} events", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            };
            if envelope.channel != "watcher/status" {
                continue;
            }
            let Ok(status) = serde_json::from_value::<RecordingStatus>(envelope.payload) else {
                continue;
            };
            if status.state != RecordingState::Ready {
                continue;
            }
            if let Some(file) = status.file {
                self.auto_rename(file).await;
            }
        }
    }

    async fn auto_rename(&self, file: PathBuf) {
        if !self.processed().insert(file.clone()) {
            debug!(file = %file.display(), "already renamed during this watch");
            return;
        }

        let record = self.store.get();
        let metadata = RenameMetadata {
            project_code: Some(record.project_code),
            pair_id: Some(record.pair_id),
            segment_counter: Some(record.segment_counter),
            theme_id: record.current_theme_id,
            theme_title: record.current_theme_title,
            channel: None,
        };

        match self.renamer.rename_recording(&file, &metadata).await {
            Ok(result) => {
                info!(from = %file.display(), to = %result.new_path.display(), "auto-renamed recording");
                // The renamed file shows up in the watched directory too.
                self.processed().insert(result.new_path.clone());
                self.notifier.publish(
                    "rename/completed",
                    json!({ "from": file, "newPath": result.new_path }),
                );
            }
            Err(e) => {
                warn!(file = %file.display(), "auto-rename failed: {}", e);
                self.processed().remove(&file);
                self.notifier.publish(
                    "rename/failed",
                    json!({ "file": file, "error": e.to_string() }),
                );
            }
        }
    }

    /// Stops the timer and watcher and terminates the worker.
    pub fn shutdown(&self) {
        self.timer.stop(StopReason::Aborted);
        self.watcher.stop();
        if let Some(worker) = &self.worker {
            worker.dispose();
        }
    }

    fn processed(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.processed.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::{BroadcastNotifier, FanoutNotifier, MemoryNotifier};
    use duorec_ipc::{RenameOutcome, SessionPatch, SessionRecord, TimerPhase};
    use serde_json::Value;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn app(store: SessionStore) -> (App, Arc<MemoryNotifier>) {
        let memory = Arc::new(MemoryNotifier::new());
        let app = App::new(store, memory.clone(), TickSource::Manual, WatcherOptions::default());
        (app, memory)
    }

    #[tokio::test]
    async fn timer_commands_round_trip() {
        let (app, _) = app(SessionStore::in_memory(SessionRecord::default()));

        let Response::Timer(state) = app.handle(Command::TimerStart { payload: None }).await else {
            panic!("expected timer state");
        };
        assert_eq!(state.phase, TimerPhase::Intro);

        let Response::Mode(change) = app
            .handle(Command::TimerSetMode {
                mode: "down".to_string(),
            })
            .await
        else {
            panic!("expected mode change");
        };
        assert!(!change.success);

        let Response::Timer(state) = app.handle(Command::TimerStop { reason: None }).await else {
            panic!("expected timer state");
        };
        assert_eq!(state.phase, TimerPhase::Idle);
        assert_eq!(app.store.get().segment_counter, 1);
    }

    #[tokio::test]
    async fn watch_start_persists_and_falls_back_to_record() {
        let dir = TempDir::new().unwrap();
        let (app, _) = app(SessionStore::in_memory(SessionRecord::default()));

        let status = app.start_watch(None).unwrap();
        assert_eq!(status.state, RecordingState::Error);

        let status = app.start_watch(Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(status.state, RecordingState::Idle);
        assert_eq!(app.store.get().zoom_recording_dir.as_deref(), Some(dir.path()));

        app.watcher.stop();
        let status = app.start_watch(None).unwrap();
        assert_eq!(status.state, RecordingState::Idle);
        assert!(app.watcher.directory().is_some());
        app.shutdown();
    }

    #[tokio::test]
    async fn rename_failure_is_reported_as_error_object() {
        let dir = TempDir::new().unwrap();
        let (app, _) = app(SessionStore::in_memory(SessionRecord::default()));

        let outcome = app
            .rename(&dir.path().join("missing.mp4"), &RenameMetadata::default())
            .await;
        let RenameOutcome::Failed { error } = outcome else {
            panic!("rename of a missing file succeeded");
        };
        assert!(!error.is_empty());
    }

    #[tokio::test]
    async fn worker_commands_without_worker_are_errors() {
        let (app, _) = app(SessionStore::in_memory(SessionRecord::default()));
        let response = app
            .handle(Command::WorkerInvoke {
                action: "themes/hash-index".to_string(),
                payload: json!({ "csv_path": "/tmp/t.csv" }),
                timeout_ms: None,
            })
            .await;
        assert!(matches!(response, Response::Error(ref m) if m == "worker is not configured"));
    }

    #[tokio::test]
    async fn config_update_merges_fields() {
        let (app, _) = app(SessionStore::in_memory(SessionRecord::default()));
        let response = app
            .handle(Command::ConfigUpdate {
                patch: SessionPatch {
                    project_code: Some("PJ".to_string()),
                    ..SessionPatch::default()
                },
            })
            .await;
        let Response::Config(record) = response else {
            panic!("expected config");
        };
        assert_eq!(record.project_code, "PJ");
        assert_eq!(record.pair_id, "001");
    }

    #[tokio::test]
    async fn ready_recordings_are_renamed_once_per_watch() {
        let dir = TempDir::new().unwrap();
        let broadcast = Arc::new(BroadcastNotifier::new(64));
        let memory = Arc::new(MemoryNotifier::new());
        let notifier: SharedNotifier =
            Arc::new(FanoutNotifier::new(vec![broadcast.clone(), memory.clone()]));
        let record = SessionRecord {
            project_code: "PJ".to_string(),
            pair_id: "007".to_string(),
            segment_counter: 2,
            current_theme_id: Some("T9".to_string()),
            current_theme_title: Some("Night Trains".to_string()),
            ..SessionRecord::default()
        };
        let app = Arc::new(App::new(
            SessionStore::in_memory(record),
            notifier.clone(),
            TickSource::Manual,
            WatcherOptions::default(),
        ));
        let worker = tokio::spawn({
            let app = app.clone();
            let events = broadcast.subscribe();
            async move { app.run_auto_rename(events).await }
        });

        let file = dir.path().join("zoom_0.mp4");
        std::fs::write(&file, b"frames").unwrap();
        let ready = json!({ "state": "ready", "file": file, "bytes": 6 });
        notifier.publish("watcher/status", ready.clone());
        notifier.publish("watcher/status", ready);

        let mut completed: Vec<Value> = Vec::new();
        for _ in 0..200 {
            completed = memory.channel("rename/completed");
            if !completed.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(completed.len(), 1);
        let new_path = completed[0]["newPath"].as_str().unwrap().to_string();
        assert!(new_path.contains("_PJ_007_02_T9_night-trains_"));
        assert!(Path::new(&new_path).exists());

        // Give the duplicate event time to be skipped rather than fail.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(memory.channel("rename/failed").is_empty());
        worker.abort();
    }

    #[tokio::test]
    async fn failed_auto_rename_can_be_retried() {
        let dir = TempDir::new().unwrap();
        let (app, memory) = app(SessionStore::in_memory(SessionRecord::default()));

        let file = dir.path().join("late.mp4");
        app.auto_rename(file.clone()).await;
        assert_eq!(memory.channel("rename/failed").len(), 1);

        std::fs::write(&file, b"x").unwrap();
        app.auto_rename(file).await;
        assert_eq!(memory.channel("rename/completed").len(), 1);
    }

    #[tokio::test]
    async fn live_watch_renames_each_new_recording_once() {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("before_start.m4a");
        std::fs::write(&old, b"already done").unwrap();

        let broadcast = Arc::new(BroadcastNotifier::new(256));
        let memory = Arc::new(MemoryNotifier::new());
        let notifier: SharedNotifier =
            Arc::new(FanoutNotifier::new(vec![broadcast.clone(), memory.clone()]));
        let record = SessionRecord {
            project_code: "PJ".to_string(),
            pair_id: "003".to_string(),
            segment_counter: 1,
            ..SessionRecord::default()
        };
        let app = Arc::new(App::new(
            SessionStore::in_memory(record),
            notifier,
            TickSource::Manual,
            WatcherOptions {
                poll_interval: Duration::from_millis(20),
                stability_delay: Duration::from_millis(100),
                ..WatcherOptions::default()
            },
        ));
        let renamer = tokio::spawn({
            let app = app.clone();
            let events = broadcast.subscribe();
            async move { app.run_auto_rename(events).await }
        });

        app.start_watch(Some(dir.path().to_path_buf()));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let file = dir.path().join("zoom_1.m4a");
        std::fs::write(&file, b"first chunk").unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while app.watcher.status().map(|s| s.state) != Some(RecordingState::Recording) {
            assert!(tokio::time::Instant::now() < deadline, "recording never seen");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        std::fs::write(&file, b"first chunk, second chunk").unwrap();
        while memory.channel("rename/completed").is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "never renamed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Several stability windows with the renamed file sitting in the
        // watched directory.
        tokio::time::sleep(Duration::from_millis(600)).await;
        let completed = memory.channel("rename/completed");
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0]["from"], json!(file));
        assert!(memory.channel("rename/failed").is_empty());

        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"before_start.m4a".to_string()));
        assert!(names.iter().any(|n| n.contains("_PJ_003_01_")), "{names:?}");
        assert!(!file.exists());

        app.shutdown();
        renamer.abort();
    }
}
