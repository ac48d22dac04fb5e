//! Client for the worker subprocess.
//!
//! The worker is a separate process speaking newline-delimited JSON on its
//! stdin/stdout (see `duorec_ipc::worker`). Its stderr is surfaced as
//! `worker/log` events and never parsed.

mod client;
mod process;

pub use client::WorkerClient;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// When requests are written to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPolicy {
    /// Write as soon as `invoke` is called.
    Immediate,
    /// Queue until the worker prints `{"status":"ready"}`, then flush in order.
    ReadyGated,
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub default_timeout: Duration,
    pub policy: SendPolicy,
    /// Respawn after an unexpected exit, waiting this long first.
    pub restart_backoff: Option<Duration>,
}

impl WorkerOptions {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            default_timeout: DEFAULT_TIMEOUT,
            policy: SendPolicy::Immediate,
            restart_backoff: None,
        }
    }
}
