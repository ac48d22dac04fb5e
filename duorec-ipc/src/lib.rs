//! Inter-process communication between duorec and duorecctl
//!
//! We use Unix domain sockets for local IPC, one JSON document per line in
//! both directions. The types here are also the data model the daemon hands
//! to its event subscribers, so they are shared verbatim by both sides.
//!
//! The [`worker`] module holds the separate line protocol spoken with the
//! worker subprocess.

pub mod worker;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Commands that duorecctl can send to duorec
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    TimerStart { payload: Option<TimerStartPayload> },
    TimerStop { reason: Option<StopReason> },
    TimerReset,
    TimerStatus,
    TimerSetMode { mode: String },
    WatchStart { directory: Option<PathBuf> },
    WatchStop,
    WatchStatus,
    Rename { file: PathBuf, metadata: RenameMetadata },
    WorkerInvoke {
        action: String,
        payload: Value,
        timeout_ms: Option<u64>,
    },
    ConfigGet,
    ConfigUpdate { patch: SessionPatch },
    /// Turns the connection into an event stream.
    Subscribe,
}

/// Responses from duorec back to duorecctl
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Timer(TimerState),
    Mode(ModeChange),
    Recording(Option<RecordingStatus>),
    Rename(RenameOutcome),
    Worker(Value),
    Config(SessionRecord),
    Event(EventEnvelope),
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerMode {
    #[default]
    Up,
    Down,
}

impl FromStr for TimerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(TimerMode::Up),
            "down" => Ok(TimerMode::Down),
            other => Err(format!("unknown timer mode: {other}")),
        }
    }
}

impl fmt::Display for TimerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TimerMode::Up => "up",
            TimerMode::Down => "down",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerPhase {
    #[default]
    Idle,
    Intro,
    Running,
    Outro,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    #[default]
    Manual,
    Completed,
    Aborted,
}

/// Raw start request. Every field is optional and may be out of range;
/// the timer engine clamps it into a [`TimerConfig`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerStartPayload {
    pub duration_sec: Option<f64>,
    pub intro_sec: Option<f64>,
    pub outro_sec: Option<f64>,
    pub interval_sec: Option<f64>,
    pub break_length_sec: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerConfig {
    pub duration_sec: u64,
    pub intro_sec: u64,
    pub outro_sec: u64,
    pub interval_sec: u64,
    pub break_length_sec: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerState {
    pub phase: TimerPhase,
    pub config: Option<TimerConfig>,
    pub mode: TimerMode,
    pub elapsed_sec: u64,
    pub remaining_sec: u64,
    pub intro_remaining: u64,
    /// Unix epoch milliseconds.
    pub started_at: Option<i64>,
    /// Unix epoch milliseconds.
    pub stopped_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeChange {
    pub success: bool,
    pub mode: TimerMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    Idle,
    Recording,
    Converting,
    Ready,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingStatus {
    pub state: RecordingState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RecordingStatus {
    pub fn new(state: RecordingState) -> Self {
        Self {
            state,
            path: None,
            file: None,
            bytes: None,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>, path: Option<PathBuf>) -> Self {
        Self {
            error: Some(message.into()),
            path,
            ..Self::new(RecordingState::Error)
        }
    }
}

/// Participant track label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Channel {
    #[default]
    A,
    B,
}

impl Channel {
    /// Accepts `a`/`b` in any case, surrounding whitespace ignored.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "A" => Some(Channel::A),
            "B" => Some(Channel::B),
            _ => None,
        }
    }

    pub fn other(self) -> Self {
        match self {
            Channel::A => Channel::B,
            Channel::B => Channel::A,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Channel::A => "A",
            Channel::B => "B",
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RenameMetadata {
    pub project_code: Option<String>,
    pub pair_id: Option<String>,
    pub segment_counter: Option<u64>,
    pub theme_id: Option<String>,
    pub theme_title: Option<String>,
    pub channel: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameResult {
    pub new_path: PathBuf,
    pub updated_config: SessionRecord,
}

/// Rename failures cross the boundary as `{ "error": message }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RenameOutcome {
    Renamed(RenameResult),
    Failed { error: String },
}

/// The persisted key-value record shared by the timer and the rename pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionRecord {
    pub project_dir: Option<PathBuf>,
    pub zoom_recording_dir: Option<PathBuf>,
    pub project_code: String,
    pub pair_id: String,
    pub segment_counter: u64,
    pub last_channel: Channel,
    pub timer_mode: TimerMode,
    /// RFC 3339.
    pub last_rename_at: Option<String>,
    pub theme_source_path: Option<PathBuf>,
    pub current_theme_id: Option<String>,
    pub current_theme_title: Option<String>,
    pub session_length: u64,
    pub start_silence: u64,
    pub end_silence: u64,
    pub interval_seconds: u64,
    pub break_length_seconds: u64,
}

impl Default for SessionRecord {
    fn default() -> Self {
        Self {
            project_dir: None,
            zoom_recording_dir: None,
            project_code: "PROJECT".to_string(),
            pair_id: "001".to_string(),
            segment_counter: 0,
            last_channel: Channel::A,
            timer_mode: TimerMode::Up,
            last_rename_at: None,
            theme_source_path: None,
            current_theme_id: None,
            current_theme_title: None,
            session_length: 360,
            start_silence: 3,
            end_silence: 5,
            interval_seconds: 60,
            break_length_seconds: 300,
        }
    }
}

/// Partial update of a [`SessionRecord`]; absent fields are left alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionPatch {
    pub project_dir: Option<PathBuf>,
    pub zoom_recording_dir: Option<PathBuf>,
    pub project_code: Option<String>,
    pub pair_id: Option<String>,
    pub segment_counter: Option<u64>,
    pub theme_source_path: Option<PathBuf>,
    pub current_theme_id: Option<String>,
    pub current_theme_title: Option<String>,
    pub session_length: Option<u64>,
    pub start_silence: Option<u64>,
    pub end_silence: Option<u64>,
    pub interval_seconds: Option<u64>,
    pub break_length_seconds: Option<u64>,
}

impl SessionPatch {
    pub fn apply(self, record: &mut SessionRecord) {
        if let Some(v) = self.project_dir {
            record.project_dir = Some(v);
        }
        if let Some(v) = self.zoom_recording_dir {
            record.zoom_recording_dir = Some(v);
        }
        if let Some(v) = self.project_code {
            record.project_code = v;
        }
        if let Some(v) = self.pair_id {
            record.pair_id = v;
        }
        if let Some(v) = self.segment_counter {
            record.segment_counter = v;
        }
        if let Some(v) = self.theme_source_path {
            record.theme_source_path = Some(v);
        }
        if let Some(v) = self.current_theme_id {
            record.current_theme_id = Some(v);
        }
        if let Some(v) = self.current_theme_title {
            record.current_theme_title = Some(v);
        }
        if let Some(v) = self.session_length {
            record.session_length = v;
        }
        if let Some(v) = self.start_silence {
            record.start_silence = v;
        }
        if let Some(v) = self.end_silence {
            record.end_silence = v;
        }
        if let Some(v) = self.interval_seconds {
            record.interval_seconds = v;
        }
        if let Some(v) = self.break_length_seconds {
            record.break_length_seconds = v;
        }
    }
}

/// One pushed event, e.g. `timer/tick` or `watcher/status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub channel: String,
    pub payload: Value,
}

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection refused - is duorec running?")]
    ConnectionRefused,

    #[error("Connection closed by peer")]
    Closed,
}

pub const SOCKET_PATH: &str = "/tmp/duorec.sock";

/// Writes `message` as a single newline-terminated JSON line.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut buf = serde_json::to_vec(message)?;
    buf.push(b'\n');
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one JSON line. Returns `IpcError::Closed` on EOF.
pub async fn read_message<R, T>(reader: &mut R) -> Result<T, IpcError>
where
    R: AsyncBufRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(IpcError::Closed);
    }
    Ok(serde_json::from_str(line.trim_end())?)
}
