use super::SendPolicy;
use crate::error::WorkerError;
use crate::notifier::SharedNotifier;
use duorec_ipc::worker::{Inbound, WorkerAction, WorkerMessage, WorkerRequest};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, warn};
use uuid::Uuid;

struct Pending {
    action: String,
    reply: oneshot::Sender<Result<Value, WorkerError>>,
}

pub(super) struct Outbound {
    id: String,
    line: String,
}

#[derive(Default)]
pub(super) struct ClientState {
    pending: HashMap<String, Pending>,
    /// Requests held back until the worker reports ready.
    queue: VecDeque<Outbound>,
    /// Writer of the live connection, if any.
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    ready: bool,
    pub(super) disposed: bool,
    pub(super) kill: Option<oneshot::Sender<()>>,
    tasks: Vec<AbortHandle>,
}

pub(super) struct Shared {
    state: Mutex<ClientState>,
    notifier: SharedNotifier,
    default_timeout: Duration,
    policy: SendPolicy,
}

/// Request/response front end for the worker, plus its event stream.
///
/// Cheap to clone; all clones share the same pending table.
#[derive(Clone)]
pub struct WorkerClient {
    shared: Arc<Shared>,
}

impl WorkerClient {
    pub(super) fn detached(
        notifier: SharedNotifier,
        default_timeout: Duration,
        policy: SendPolicy,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ClientState::default()),
                notifier,
                default_timeout,
                policy,
            }),
        }
    }

    /// Speaks the protocol over an already-open stream pair instead of a
    /// subprocess. End of the read side counts as the worker exiting.
    pub fn from_transport<R, W>(
        reader: R,
        writer: W,
        default_timeout: Duration,
        policy: SendPolicy,
        notifier: SharedNotifier,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let client = Self::detached(notifier, default_timeout, policy);
        let reader_task = client.attach(reader, writer);
        let watcher = client.clone();
        let task = tokio::spawn(async move {
            let _ = reader_task.await;
            watcher.connection_lost("stream closed", None, None);
        });
        client.lock().tasks.push(task.abort_handle());
        client
    }

    /// Sends `action` with `payload` and waits for the matching response.
    ///
    /// Fails with `Timeout` if nothing arrives within `timeout` (or the
    /// client default), `Disposed` after [`dispose`](Self::dispose), and
    /// `Exited` if the worker dies first.
    pub async fn invoke(
        &self,
        action: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, WorkerError> {
        let id = Uuid::new_v4().to_string();
        let line = WorkerRequest {
            id: id.clone(),
            action: action.to_string(),
            payload,
        }
        .to_line()?;

        let rx = {
            let mut state = self.lock();
            if state.disposed {
                return Err(WorkerError::Disposed);
            }
            let (reply, rx) = oneshot::channel();
            state.pending.insert(
                id.clone(),
                Pending {
                    action: action.to_string(),
                    reply,
                },
            );

            let gated = self.shared.policy == SendPolicy::ReadyGated && !state.ready;
            let sender = if gated { None } else { state.outbound.clone() };
            let message = Outbound {
                id: id.clone(),
                line,
            };
            match sender {
                Some(tx) => {
                    if tx.send(message).is_err() {
                        state.pending.remove(&id);
                        return Err(WorkerError::Closed);
                    }
                }
                None if self.shared.policy == SendPolicy::ReadyGated => {
                    state.queue.push_back(message)
                }
                None => {
                    state.pending.remove(&id);
                    return Err(WorkerError::Closed);
                }
            }
            rx
        };

        let limit = timeout.unwrap_or(self.shared.default_timeout);
        match tokio::time::timeout(limit, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(WorkerError::Closed),
            Err(_) => {
                let mut state = self.lock();
                state.pending.remove(&id);
                state.queue.retain(|m| m.id != id);
                Err(WorkerError::Timeout {
                    action: action.to_string(),
                    after: limit,
                })
            }
        }
    }

    /// Typed form of [`invoke`](Self::invoke) using the action's schema.
    pub async fn call<A: WorkerAction>(&self, payload: &A::Payload) -> Result<A::Output, WorkerError> {
        let payload = serde_json::to_value(payload)?;
        let result = self.invoke(A::NAME, payload, None).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Makes the client permanently unusable: every outstanding request is
    /// rejected and the worker is terminated.
    pub fn dispose(&self) {
        let (kill, tasks) = {
            let mut state = self.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.outbound = None;
            reject_all(&mut state, || WorkerError::Disposed);
            (state.kill.take(), std::mem::take(&mut state.tasks))
        };
        if let Some(kill) = kill {
            let _ = kill.send(());
        }
        for task in tasks {
            task.abort();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.lock().disposed
    }

    pub fn is_ready(&self) -> bool {
        self.lock().ready
    }

    /// Requests still waiting for a response (queued ones included).
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Wires a fresh connection in and returns its reader task.
    pub(super) fn attach<R, W>(&self, reader: R, writer: W) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.lock();
            state.outbound = Some(tx);
            state.ready = false;
        }

        let writer_task = tokio::spawn(write_loop(self.clone(), writer, rx));
        let client = self.clone();
        let reader_task = tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => client.handle_line(&line),
                    Ok(None) => break,
                    Err(e) => {
                        warn!("worker stdout read failed: {}", e);
                        break;
                    }
                }
            }
        });

        let mut state = self.lock();
        state.tasks.retain(|t| !t.is_finished());
        state.tasks.push(writer_task.abort_handle());
        state.tasks.push(reader_task.abort_handle());
        reader_task
    }

    pub(super) fn track(&self, task: AbortHandle) {
        self.lock().tasks.push(task);
    }

    pub(super) fn handle_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() || self.is_disposed() {
            return;
        }
        let message = match WorkerMessage::parse(line) {
            Ok(message) => message,
            Err(_) => {
                // Not protocol; the worker printed something stray.
                self.log_line(line);
                return;
            }
        };

        match message.classify() {
            Inbound::Event { event, data } => {
                self.publish(&format!("worker/{event}"), data.clone());
                self.publish("worker/event", json!({ "event": event, "data": data }));
            }
            Inbound::Ready => {
                let mut state = self.lock();
                state.ready = true;
                flush_queue(&mut state);
            }
            Inbound::Response { id, outcome } => {
                let pending = self.lock().pending.remove(&id);
                match pending {
                    Some(pending) => {
                        debug!(%id, action = %pending.action, ok = outcome.is_ok(), "worker response");
                        let _ = pending.reply.send(outcome.map_err(WorkerError::Remote));
                    }
                    None => debug!(%id, "response for unknown or expired request"),
                }
            }
            Inbound::Ignored => {}
        }
    }

    pub(super) fn log_line(&self, line: &str) {
        debug!(target: "duorec::worker::stderr", "{}", line);
        self.publish("worker/log", Value::String(line.to_string()));
    }

    /// The current connection is gone. Unless we are shutting down on
    /// purpose, everything outstanding fails with `reason`.
    pub(super) fn connection_lost(&self, reason: &str, code: Option<i32>, signal: Option<i32>) {
        {
            let mut state = self.lock();
            state.outbound = None;
            state.ready = false;
            if !state.disposed {
                warn!("worker exited unexpectedly ({})", reason);
                reject_all(&mut state, || WorkerError::Exited(reason.to_string()));
            }
        }
        self.publish(
            "worker/exit",
            json!({ "code": code, "signal": signal, "reason": reason }),
        );
    }

    pub(super) fn reject_outstanding(&self, error: impl Fn() -> WorkerError) {
        reject_all(&mut self.lock(), error);
    }

    fn reject(&self, id: &str, error: WorkerError) {
        let pending = self.lock().pending.remove(id);
        if let Some(pending) = pending {
            let _ = pending.reply.send(Err(error));
        }
    }

    pub(super) fn publish(&self, channel: &str, payload: Value) {
        self.shared.notifier.publish(channel, payload);
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.shared.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn reject_all(state: &mut ClientState, error: impl Fn() -> WorkerError) {
    state.queue.clear();
    for (_, pending) in state.pending.drain() {
        let _ = pending.reply.send(Err(error()));
    }
}

fn flush_queue(state: &mut ClientState) {
    let Some(tx) = state.outbound.clone() else {
        return;
    };
    while let Some(message) = state.queue.pop_front() {
        if let Err(mpsc::error::SendError(message)) = tx.send(message) {
            state.queue.push_front(message);
            break;
        }
    }
}

async fn write_loop<W>(client: WorkerClient, mut writer: W, mut rx: mpsc::UnboundedReceiver<Outbound>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let written: std::io::Result<()> = async {
            writer.write_all(message.line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!(id = %message.id, "failed to write worker request: {}", e);
            client.reject(&message.id, WorkerError::Write(e.to_string()));
        }
    }
}
