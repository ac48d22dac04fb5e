use crate::error::SettingsError;
use crate::watcher::WatcherOptions;
use crate::worker::{SendPolicy, WorkerOptions};
use directories::ProjectDirs;
use duorec_ipc::SOCKET_PATH;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Settings {
    pub socket_path: PathBuf,
    /// Overrides the session record location in the data dir.
    pub store_path: Option<PathBuf>,
    pub auto_rename: bool,
    pub desktop_notifications: bool,
    pub timer: TimerSettings,
    pub watcher: WatcherSettings,
    pub worker: WorkerSettings,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TimerSettings {
    pub tick_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WatcherSettings {
    pub poll_interval_ms: u64,
    pub stability_delay_ms: u64,
    pub depth: usize,
    /// Lower-case extensions without the dot. Empty watches every file.
    pub extensions: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WorkerSettings {
    /// Worker executable. Empty disables the worker.
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub timeout_ms: u64,
    pub ready_gated: bool,
    pub restart_backoff_ms: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(SOCKET_PATH),
            store_path: None,
            auto_rename: false,
            desktop_notifications: false,
            timer: TimerSettings::default(),
            watcher: WatcherSettings::default(),
            worker: WorkerSettings::default(),
        }
    }
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self { tick_ms: 1000 }
    }
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            stability_delay_ms: 3000,
            depth: 2,
            extensions: Vec::new(),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            program: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            timeout_ms: 60_000,
            ready_gated: false,
            restart_backoff_ms: None,
        }
    }
}

impl TimerSettings {
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

impl WatcherSettings {
    pub fn options(&self) -> WatcherOptions {
        WatcherOptions {
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            stability_delay: Duration::from_millis(self.stability_delay_ms),
            depth: self.depth,
            extensions: self
                .extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }
}

impl WorkerSettings {
    /// `None` when no worker program is configured.
    pub fn options(&self) -> Option<WorkerOptions> {
        if self.program.trim().is_empty() {
            return None;
        }
        Some(WorkerOptions {
            program: PathBuf::from(&self.program),
            args: self.args.clone(),
            env: self.env.clone(),
            default_timeout: Duration::from_millis(self.timeout_ms),
            policy: if self.ready_gated {
                SendPolicy::ReadyGated
            } else {
                SendPolicy::Immediate
            },
            restart_backoff: self.restart_backoff_ms.map(Duration::from_millis),
        })
    }
}

pub fn load_settings() -> Result<Settings, SettingsError> {
    match ProjectDirs::from("com", "duorec", "duorec") {
        Some(proj_dirs) => load_settings_from(&proj_dirs.config_dir().join("duorec.toml")),
        None => Ok(Settings::default()),
    }
}

pub fn load_settings_from(path: &Path) -> Result<Settings, SettingsError> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let raw = fs::read_to_string(path).map_err(|source| SettingsError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| SettingsError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
