//! Unix domain socket server for the control surface.

use crate::app::App;
use crate::notifier::BroadcastNotifier;
use anyhow::{Context, Result};
use duorec_ipc::{read_message, write_message, Command, IpcError, Response};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Binds the control socket, replacing a stale one left by a previous run.
pub fn bind(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
    }
    let listener = UnixListener::bind(path)
        .with_context(|| format!("failed to bind control socket {}", path.display()))?;
    info!("IPC server listening on {}", path.display());
    Ok(listener)
}

/// Accepts connections forever, one task per client.
pub async fn serve(listener: UnixListener, app: Arc<App>, events: Arc<BroadcastNotifier>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let app = app.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, app, events).await {
                        error!("Error handling client: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {}", e);
            }
        }
    }
}

async fn handle_client(
    stream: UnixStream,
    app: Arc<App>,
    events: Arc<BroadcastNotifier>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    loop {
        let command: Command = match read_message(&mut reader).await {
            Ok(command) => command,
            Err(IpcError::Closed) => return Ok(()),
            Err(IpcError::Serialization(e)) => {
                warn!("rejected malformed command: {}", e);
                write_message(&mut writer, &Response::Error(format!("invalid command: {e}")))
                    .await?;
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        debug!(?command, "control command");

        if let Command::Subscribe = command {
            let receiver = events.subscribe();
            write_message(&mut writer, &Response::Ok).await?;
            return stream_events(reader, writer, receiver).await;
        }

        let response = app.handle(command).await;
        write_message(&mut writer, &response).await?;
    }
}

/// Forwards every published event to the client until it hangs up.
async fn stream_events<R>(
    mut reader: R,
    mut writer: OwnedWriteHalf,
    mut receiver: broadcast::Receiver<duorec_ipc::EventEnvelope>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut discard = String::new();
    loop {
        tokio::select! {
            event = receiver.recv() => match event {
                Ok(envelope) => write_message(&mut writer, &Response::Event(envelope)).await?,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("event subscriber lagged, {} events dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
            read = reader.read_line(&mut discard) => match read {
                Ok(0) | Err(_) => return Ok(()),
                Ok(_) => discard.clear(),
            },
        }
    }
}
