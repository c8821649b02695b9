//! Unix-socket listener and connection driver.
//!
//! Every accepted connection must open with an authenticated `Hello` inside
//! a five-second window; anything else closes the socket with nothing more
//! than a debug log, so port scanners learn nothing. Authenticated
//! connections are promoted to full session clients and driven until EOF.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

use crate::client::{Client, ClientError, ClientEvent, ClientIdAllocator, ClientStatus, XsmpClient};
use crate::store::Store;
use crate::util;
use crate::xsmp::authority::Authority;
use crate::xsmp::protocol::{ClientMessage, ServerMessage};

const AUTH_WINDOW: Duration = Duration::from_secs(5);

const REFUSAL_SHUTTING_DOWN: &str =
    "Refusing new client connection because the session is currently being shut down";

pub struct XsmpServer {
    socket_path: PathBuf,
    authority: Authority,
    clients: Arc<Mutex<Store<Client>>>,
    id_alloc: ClientIdAllocator,
    events: UnboundedSender<ClientEvent>,
}

impl XsmpServer {
    pub fn new(
        socket_path: PathBuf,
        authority: Authority,
        clients: Arc<Mutex<Store<Client>>>,
        id_alloc: ClientIdAllocator,
        events: UnboundedSender<ClientEvent>,
    ) -> Self {
        Self {
            socket_path,
            authority,
            clients,
            id_alloc,
            events,
        }
    }

    pub fn network_id(&self) -> String {
        util::network_id(&self.socket_path)
    }

    /// Binds the socket, records our cookie in the authority file, and
    /// serves connections until the task is dropped.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = prepare_socket(&self.socket_path).await?;
        self.authority.install()?;
        info!("XsmpServer: listening on {}", self.socket_path.display());

        loop {
            let (stream, _addr) = listener
                .accept()
                .await
                .context("accepting on the session socket")?;
            let server = self.clone();
            tokio::spawn(async move {
                server.handle_connection(stream).await;
            });
        }
    }

    /// Removes our authority entries and the socket file. Safe to call even
    /// if `run` never got as far as binding.
    pub fn cleanup(&self) {
        if let Err(err) = self.authority.remove() {
            warn!("XsmpServer: authority cleanup failed: {}", err);
        }
        if let Err(err) = std::fs::remove_file(&self.socket_path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    "XsmpServer: could not remove {}: {}",
                    self.socket_path.display(),
                    err
                );
            }
        }
    }

    async fn handle_connection(&self, stream: UnixStream) {
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        if let Err(err) = authenticate(&mut reader, &self.authority).await {
            debug!("XsmpServer: dropping unauthenticated connection: {}", err);
            return;
        }

        let (out_tx, out_rx) = unbounded_channel();
        tokio::spawn(write_messages(out_rx, write_half));

        let id = self.id_alloc.next_id();
        let client = Arc::new(XsmpClient::new(id.clone(), out_tx.clone(), self.events.clone()));

        let accepted = self
            .clients
            .lock()
            .await
            .add(&id, Client::Xsmp(client.clone()));
        if !accepted {
            debug!("XsmpServer: refusing connection for {}", id);
            let _ = out_tx.send(ServerMessage::ConnectionRefused {
                reason: REFUSAL_SHUTTING_DOWN.to_string(),
            });
            return;
        }
        debug!("XsmpServer: accepted connection as {}", id);

        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => {
                    debug!("XsmpServer: read error on {}: {}", id, err);
                    break;
                }
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let msg: ClientMessage = match serde_json::from_str(trimmed) {
                Ok(msg) => msg,
                Err(err) => {
                    warn!("XsmpServer: unparseable message from {}: {}", id, err);
                    continue;
                }
            };
            match client.handle_message(msg) {
                Ok(()) => {}
                Err(err @ ClientError::ProtocolViolation(_)) => {
                    // A failed registration attempt does not cost the
                    // connection, only a refusal.
                    warn!("XsmpServer: rejected message from {}: {}", id, err);
                    continue;
                }
                Err(err) => {
                    warn!("XsmpServer: closing {}: {}", id, err);
                    break;
                }
            }
            if client.common().status() == ClientStatus::Finished {
                break;
            }
        }

        // EOF or a fault without an orderly goodbye counts as a failure.
        client.mark_disconnected();
    }
}

/// First-line handshake: a `Hello` bearing a cookie from the authority file,
/// delivered within the authentication window.
async fn authenticate<R>(reader: &mut R, authority: &Authority) -> Result<(), ClientError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let read = tokio::time::timeout(AUTH_WINDOW, reader.read_line(&mut line))
        .await
        .map_err(|_| ClientError::AuthenticationTimeout)?
        .map_err(|err| ClientError::Io(err.to_string()))?;
    if read == 0 {
        return Err(ClientError::Io(
            "connection closed during authentication".to_string(),
        ));
    }
    match serde_json::from_str::<ClientMessage>(line.trim()) {
        Ok(ClientMessage::Hello { cookie }) if authority.verify(&cookie) => Ok(()),
        Ok(ClientMessage::Hello { .. }) => Err(ClientError::ProtocolViolation(
            "invalid authentication cookie".to_string(),
        )),
        Ok(_) => Err(ClientError::ProtocolViolation(
            "expected a Hello handshake".to_string(),
        )),
        Err(err) => Err(ClientError::ProtocolViolation(format!(
            "unparseable handshake: {}",
            err
        ))),
    }
}

async fn write_messages(mut rx: UnboundedReceiver<ServerMessage>, mut writer: OwnedWriteHalf) {
    while let Some(msg) = rx.recv().await {
        let line = match serde_json::to_string(&msg) {
            Ok(line) => line,
            Err(err) => {
                warn!("XsmpServer: could not serialize outbound message: {}", err);
                continue;
            }
        };
        if writer.write_all(line.as_bytes()).await.is_err()
            || writer.write_all(b"\n").await.is_err()
        {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Binds the listening socket, taking over a stale path left by a dead
/// daemon. A path with a live listener behind it means we are a duplicate.
async fn prepare_socket(path: &Path) -> Result<UnixListener> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    if path.exists() {
        match UnixStream::connect(path).await {
            Ok(_) => bail!(
                "another session daemon is already listening on {}",
                path.display()
            ),
            Err(_) => {
                debug!("XsmpServer: removing stale socket {}", path.display());
                std::fs::remove_file(path)
                    .with_context(|| format!("removing stale socket {}", path.display()))?;
            }
        }
    }
    UnixListener::bind(path).with_context(|| format!("binding {}", path.display()))
}
