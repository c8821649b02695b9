mod client;
mod inhibitor;
mod manager;
mod paths;
mod session_save;
mod store;
mod util;
mod xsmp;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::Mutex;

use crate::client::ClientIdAllocator;
use crate::manager::{Manager, SessionManagerIface};
use crate::store::Store;
use crate::xsmp::authority::Authority;
use crate::xsmp::server::XsmpServer;

/// Session management daemon: registers session clients over a local socket
/// or the message bus, coordinates save-yourself rounds, and persists the
/// session so clients can be restarted on the next login.
#[derive(Parser)]
#[command(name = "sessiond", version)]
struct Cli {
    /// Listening socket path (defaults under the user runtime directory)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Do not write the saved session when the session ends
    #[arg(long)]
    no_autosave: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let socket_path = match cli.socket {
        Some(path) => path,
        None => paths::default_socket_path()?,
    };
    let saved_session_dir = paths::saved_session_dir()?;
    match session_save::load_session(&saved_session_dir) {
        Ok(apps) if !apps.is_empty() => {
            info!("sessiond: {} client(s) in the saved session", apps.len());
        }
        Ok(_) => {}
        Err(err) => warn!("sessiond: could not read the saved session: {}", err),
    }

    let (client_store_tx, client_store_rx) = unbounded_channel();
    let (inhibitor_store_tx, inhibitor_store_rx) = unbounded_channel();
    let (client_event_tx, client_event_rx) = unbounded_channel();
    let clients = Arc::new(Mutex::new(Store::new(client_store_tx)));
    let inhibitors = Arc::new(Mutex::new(Store::new(inhibitor_store_tx)));
    let id_alloc = ClientIdAllocator::new();

    let authority = Authority::new(paths::authority_path()?, util::network_id(&socket_path));
    let server = Arc::new(XsmpServer::new(
        socket_path,
        authority,
        clients.clone(),
        id_alloc.clone(),
        client_event_tx.clone(),
    ));

    // The bus is optional: without it only socket clients are served.
    let connection = match zbus::Connection::session().await {
        Ok(connection) => Some(connection),
        Err(err) => {
            warn!("sessiond: no session bus, bus clients disabled: {}", err);
            None
        }
    };
    if let Some(connection) = &connection {
        connection
            .object_server()
            .at(
                "/org/mate/SessionManager",
                SessionManagerIface {
                    clients: clients.clone(),
                    inhibitors: inhibitors.clone(),
                    id_alloc,
                    client_events: client_event_tx.clone(),
                },
            )
            .await
            .context("exporting the session manager interface")?;
        if let Err(err) = connection.request_name("org.mate.SessionManager").await {
            warn!("sessiond: could not own the session manager name: {}", err);
        }
    }

    util::publish_session_env(&server.network_id(), connection.as_ref()).await;

    let server_task = tokio::spawn(server.clone().run());

    let mut manager = Manager::new(
        clients,
        inhibitors,
        client_event_rx,
        client_store_rx,
        inhibitor_store_rx,
        saved_session_dir,
        !cli.no_autosave,
    );
    let result = manager.run().await;

    server_task.abort();
    server.cleanup();
    result
}
