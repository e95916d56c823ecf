//! Unix socket server for input sources
//!
//! Listens on the IPC socket for newline-delimited JSON [`ClientMessage`]s and
//! routes them: input signals onto the input bus, pushes into the channel
//! hub, everything else straight to the session guard.

use crate::guard::SessionGuard;
use crate::ipc::ClientMessage;
use crate::listener::InputBus;
use crate::transport::ChannelHub;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, trace, warn};

/// Everything a connection needs to route messages
#[derive(Debug, Clone)]
pub struct ServerState {
    pub guard: Arc<Mutex<SessionGuard>>,
    pub input: InputBus,
    pub hub: ChannelHub,
}

/// Remove any stale socket file and bind to `path`.
pub fn bind(path: &Path) -> std::io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    UnixListener::bind(path)
}

/// Start the Unix socket server.
///
/// If the socket cannot be bound no input will ever reach the guard, so idle
/// tracking is disabled instead of timing out a user it cannot see.
pub async fn start(path: &Path, state: ServerState) {
    let listener = match bind(path) {
        Ok(l) => l,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to bind Unix socket");
            if let Ok(mut guard) = state.guard.lock() {
                guard.disable_idle(&format!("input socket unavailable: {e}"));
            }
            return;
        }
    };

    info!("IPC server listening on {}", path.display());
    serve(listener, state).await;
}

/// Accept connections until the listener fails permanently.
pub async fn serve(listener: UnixListener, state: ServerState) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let state = state.clone();
                tokio::spawn(handle_connection(stream, state));
            }
            Err(e) => {
                warn!("Failed to accept socket connection: {}", e);
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, state: ServerState) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<ClientMessage>(&line) {
            Ok(msg) => {
                trace!(?msg, "ipc message");
                if let Err(e) = dispatch(msg, &state, &mut writer).await {
                    debug!(error = %e, "client went away before reply");
                    return;
                }
            }
            Err(e) => {
                trace!("Failed to parse IPC message: {} (line: {})", e, line);
            }
        }
    }
}

async fn dispatch<W>(msg: ClientMessage, state: &ServerState, writer: &mut W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match msg {
        ClientMessage::Activity { kind } => state.input.publish(kind),
        ClientMessage::Push { channel, payload } => {
            if !state.hub.publish(&channel, payload) {
                debug!(%channel, "push not delivered");
            }
        }
        ClientMessage::StatusChange { channel, status } => {
            if !state.hub.publish_status(&channel, status) {
                debug!(%channel, ?status, "status change not delivered");
            }
        }
        ClientMessage::ResetTimer => {
            if let Ok(guard) = state.guard.lock() {
                guard.reset_timer();
            }
        }
        ClientMessage::Acknowledge { channel } => {
            if let Ok(guard) = state.guard.lock() {
                match channel {
                    Some(channel) => {
                        if !guard.acknowledge(&channel) {
                            debug!(%channel, "acknowledge for unknown channel");
                        }
                    }
                    None => guard.acknowledge_all(),
                }
            }
        }
        ClientMessage::Status => {
            let status = match state.guard.lock() {
                Ok(guard) => guard.status(),
                Err(_) => return Ok(()),
            };
            let mut json = serde_json::to_string(&status).map_err(std::io::Error::other)?;
            json.push('\n');
            writer.write_all(json.as_bytes()).await?;
            writer.flush().await?;
        }
    }
    Ok(())
}
