use super::{WorkerClient, WorkerOptions};
use crate::error::WorkerError;
use crate::notifier::SharedNotifier;
use serde_json::json;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// How long to keep draining stdout after the process has exited.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

enum ChildExit {
    /// We killed it via `dispose`.
    Killed,
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
        reason: String,
    },
}

fn spawn_child(options: &WorkerOptions) -> Result<Child, WorkerError> {
    Command::new(&options.program)
        .args(&options.args)
        .envs(&options.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| WorkerError::Spawn(format!("{}: {}", options.program.display(), e)))
}

fn describe(status: &ExitStatus) -> (Option<i32>, Option<i32>, String) {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal: Option<i32> = None;

    let code = status.code();
    let reason = match (code, signal) {
        (_, Some(signal)) => format!("signal {signal}"),
        (Some(code), None) => format!("exit code {code}"),
        (None, None) => "unknown status".to_string(),
    };
    (code, signal, reason)
}

/// A running child with its pipes wired into the client.
struct Connection {
    reader: JoinHandle<()>,
    kill: oneshot::Receiver<()>,
}

impl WorkerClient {
    /// Launches the worker program and supervises it until disposed.
    pub fn spawn(options: WorkerOptions, notifier: SharedNotifier) -> Result<Self, WorkerError> {
        let mut child = spawn_child(&options)?;
        info!(program = %options.program.display(), pid = ?child.id(), "worker started");
        let client = Self::detached(notifier, options.default_timeout, options.policy);
        let connection = client.connect(&mut child);
        tokio::spawn(client.clone().supervise(child, connection, options));
        Ok(client)
    }

    async fn supervise(self, mut child: Child, mut connection: Option<Connection>, options: WorkerOptions) {
        loop {
            let exit = match connection.take() {
                Some(connection) => self.run_child(&mut child, connection).await,
                None => {
                    let _ = child.start_kill();
                    if self.is_disposed() {
                        ChildExit::Killed
                    } else {
                        ChildExit::Exited {
                            code: None,
                            signal: None,
                            reason: "worker stdio unavailable".to_string(),
                        }
                    }
                }
            };
            match exit {
                ChildExit::Killed => return,
                ChildExit::Exited {
                    code,
                    signal,
                    reason,
                } => self.connection_lost(&reason, code, signal),
            }
            if self.is_disposed() {
                return;
            }
            let Some(backoff) = options.restart_backoff else {
                return;
            };
            child = match self.respawn(&options, backoff).await {
                Some(child) => child,
                None => return,
            };
            connection = self.connect(&mut child);
        }
    }

    /// Hooks the child's pipes up before anyone can call `invoke` on it.
    fn connect(&self, child: &mut Child) -> Option<Connection> {
        let (kill_tx, kill) = oneshot::channel();
        {
            let mut state = self.lock();
            if state.disposed {
                return None;
            }
            state.kill = Some(kill_tx);
        }
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return None;
        };

        let reader = self.attach(stdout, stdin);
        let stderr_task = tokio::spawn(forward_stderr(self.clone(), stderr));
        self.track(stderr_task.abort_handle());
        Some(Connection { reader, kill })
    }

    async fn run_child(&self, child: &mut Child, connection: Connection) -> ChildExit {
        let status = tokio::select! {
            status = child.wait() => Some(status),
            _ = connection.kill => None,
        };

        let Some(status) = status else {
            if let Err(e) = child.kill().await {
                warn!("failed to kill worker: {}", e);
            }
            let (code, signal) = match child.try_wait() {
                Ok(Some(status)) => {
                    let (code, signal, _) = describe(&status);
                    (code, signal)
                }
                _ => (None, None),
            };
            self.publish(
                "worker/exit",
                json!({ "code": code, "signal": signal, "reason": "disposed" }),
            );
            return ChildExit::Killed;
        };

        // Let responses already in the pipe resolve before rejecting.
        let _ = tokio::time::timeout(DRAIN_GRACE, connection.reader).await;
        match status {
            Ok(status) => {
                let (code, signal, reason) = describe(&status);
                ChildExit::Exited {
                    code,
                    signal,
                    reason,
                }
            }
            Err(e) => ChildExit::Exited {
                code: None,
                signal: None,
                reason: e.to_string(),
            },
        }
    }

    async fn respawn(&self, options: &WorkerOptions, backoff: Duration) -> Option<Child> {
        loop {
            tokio::time::sleep(backoff).await;
            if self.is_disposed() {
                return None;
            }
            match spawn_child(options) {
                Ok(child) => {
                    info!(pid = ?child.id(), "worker restarted");
                    return Some(child);
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!("{}", message);
                    self.reject_outstanding(|| WorkerError::Spawn(message.clone()));
                    self.publish("worker/error", json!({ "message": message }));
                }
            }
        }
    }
}

async fn forward_stderr<R>(client: WorkerClient, stderr: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            client.log_line(line.trim_end());
        }
    }
}
