//! Session coordinator.
//!
//! The manager owns the client and inhibitor registries and drives the
//! logout sequence: query every client, wait for the answers, save the
//! session, end it, run the second save phase for clients that asked for
//! one, then stop everything. A cancel during the query phase rolls the
//! whole session back to running.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use log::{debug, info, warn};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use zbus::message::Header;
use zbus::zvariant::OwnedObjectPath;
use zbus::Connection;

use crate::client::{
    Client, ClientEvent, ClientIdAllocator, ClientStatus, DbusClient, EndSessionFlags,
    RestartStyle,
};
use crate::inhibitor::{InhibitFlags, Inhibitor};
use crate::session_save;
use crate::store::{Store, StoreEvent};
use crate::util;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerPhase {
    Running,
    QueryEndSession,
    EndSession,
    EndSessionPhase2,
    Exiting,
}

pub struct Manager {
    clients: Arc<Mutex<Store<Client>>>,
    inhibitors: Arc<Mutex<Store<Inhibitor>>>,
    client_events: UnboundedReceiver<ClientEvent>,
    client_store_events: UnboundedReceiver<StoreEvent<Client>>,
    inhibitor_store_events: UnboundedReceiver<StoreEvent<Inhibitor>>,
    saved_session_dir: PathBuf,
    autosave: bool,
    phase: ManagerPhase,
    forceful: bool,
    /// Clients whose answer to the current round is still outstanding.
    pending: HashSet<String>,
    /// Clients that asked for the second save phase.
    phase2: HashSet<String>,
}

impl Manager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clients: Arc<Mutex<Store<Client>>>,
        inhibitors: Arc<Mutex<Store<Inhibitor>>>,
        client_events: UnboundedReceiver<ClientEvent>,
        client_store_events: UnboundedReceiver<StoreEvent<Client>>,
        inhibitor_store_events: UnboundedReceiver<StoreEvent<Inhibitor>>,
        saved_session_dir: PathBuf,
        autosave: bool,
    ) -> Self {
        Self {
            clients,
            inhibitors,
            client_events,
            client_store_events,
            inhibitor_store_events,
            saved_session_dir,
            autosave,
            phase: ManagerPhase::Running,
            forceful: false,
            pending: HashSet::new(),
            phase2: HashSet::new(),
        }
    }

    pub fn phase(&self) -> ManagerPhase {
        self.phase
    }

    /// Event loop; returns once the session has ended.
    pub async fn run(&mut self) -> Result<()> {
        info!("Manager: session running");
        while self.phase() != ManagerPhase::Exiting {
            tokio::select! {
                Some(event) = self.client_events.recv() => {
                    self.handle_client_event(event).await;
                }
                Some(event) = self.client_store_events.recv() => {
                    self.handle_client_store_event(event).await;
                }
                Some(event) = self.inhibitor_store_events.recv() => {
                    self.handle_inhibitor_store_event(event);
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Manager: termination signal, ending the session");
                    self.begin_logout(true).await;
                }
                else => break,
            }
        }
        info!("Manager: session ended");
        Ok(())
    }

    async fn handle_client_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Registered { id, startup_id } => {
                info!("Manager: {} registered with startup id {}", id, startup_id);
            }
            ClientEvent::LogoutRequest { id, prompt } => {
                info!(
                    "Manager: {} requested a logout (prompt = {})",
                    id, prompt
                );
                self.begin_logout(!prompt).await;
            }
            ClientEvent::EndSessionResponse {
                id,
                is_ok,
                do_last,
                cancel,
                reason,
            } => {
                self.handle_end_session_response(&id, is_ok, do_last, cancel, reason)
                    .await;
            }
            ClientEvent::Disconnected { id } => {
                debug!("Manager: {} disconnected", id);
                let mut clients = self.clients.lock().await;
                if clients.contains(&id) {
                    clients.remove(&id);
                } else {
                    debug!("Manager: {} was not in the session", id);
                }
            }
        }
    }

    async fn handle_client_store_event(&mut self, event: StoreEvent<Client>) {
        match event {
            StoreEvent::Added { id } => {
                debug!("Manager: client {} joined the session", id);
            }
            StoreEvent::Removed { id, entry } => {
                debug!(
                    "Manager: client {} left the session (startup id {:?})",
                    id,
                    entry.startup_id()
                );
                if let Client::Dbus(client) = &entry {
                    client.detach().await;
                }
                let swept = self
                    .inhibitors
                    .lock()
                    .await
                    .foreach_remove(|_, inhibitor| {
                        inhibitor.client_id.as_deref() == Some(id.as_str())
                    });
                if swept > 0 {
                    debug!("Manager: dropped {} inhibitor(s) held by {}", swept, id);
                }
                // A departed client can no longer answer; count it as done.
                self.pending.remove(&id);
                self.phase2.remove(&id);
                self.advance_if_ready().await;
            }
        }
    }

    fn handle_inhibitor_store_event(&mut self, event: StoreEvent<Inhibitor>) {
        match event {
            StoreEvent::Added { id } => debug!("Manager: inhibitor {} added", id),
            StoreEvent::Removed { id, .. } => debug!("Manager: inhibitor {} removed", id),
        }
    }

    async fn handle_end_session_response(
        &mut self,
        id: &str,
        is_ok: bool,
        do_last: bool,
        cancel: bool,
        reason: Option<String>,
    ) {
        debug!(
            "Manager: response from {}: is_ok={} do_last={} cancel={} reason={:?}",
            id, is_ok, do_last, cancel, reason
        );
        if cancel {
            self.cancel_logout().await;
            return;
        }
        match self.phase {
            ManagerPhase::QueryEndSession => {
                if !is_ok {
                    // The client is interacting with the user; its real
                    // answer arrives later.
                    if let Some(reason) = reason {
                        info!("Manager: {} is not ready: {}", id, reason);
                    }
                    return;
                }
                if do_last {
                    self.phase2.insert(id.to_string());
                }
                self.pending.remove(id);
            }
            ManagerPhase::EndSession => {
                if !is_ok {
                    // Same as the query phase: the client is still busy and
                    // will report again when it is done.
                    if let Some(reason) = reason {
                        info!("Manager: {} is not done yet: {}", id, reason);
                    }
                    return;
                }
                if do_last {
                    self.phase2.insert(id.to_string());
                }
                self.pending.remove(id);
            }
            ManagerPhase::EndSessionPhase2 => {
                self.pending.remove(id);
            }
            ManagerPhase::Running | ManagerPhase::Exiting => {
                debug!("Manager: ignoring late response from {}", id);
                return;
            }
        }
        self.advance_if_ready().await;
    }

    /// Starts the logout sequence, querying every client.
    pub async fn begin_logout(&mut self, forceful: bool) {
        if self.phase != ManagerPhase::Running {
            debug!("Manager: logout already in progress");
            return;
        }
        if !forceful && self.logout_inhibited().await {
            warn!("Manager: logout is inhibited, refusing");
            return;
        }

        self.phase = ManagerPhase::QueryEndSession;
        self.forceful = forceful;
        self.phase2.clear();
        info!("Manager: querying clients before ending the session");

        let flags = if forceful {
            EndSessionFlags::FORCEFUL
        } else {
            EndSessionFlags::NONE
        };
        // Connected-but-unregistered clients owe no answer; they are still
        // stopped with everyone else at the end.
        let snapshot: Vec<Client> = self
            .clients
            .lock()
            .await
            .values()
            .into_iter()
            .filter(|client| client.status() == ClientStatus::Registered)
            .collect();
        self.pending = snapshot.iter().map(|c| c.id()).collect();
        for client in snapshot {
            if let Err(err) = client.query_end_session(flags).await {
                debug!(
                    "Manager: {} could not be queried ({}), counting it as answered",
                    client.id(),
                    err
                );
                self.pending.remove(&client.id());
            }
        }
        self.advance_if_ready().await;
    }

    async fn logout_inhibited(&self) -> bool {
        let mut inhibited = false;
        self.inhibitors.lock().await.foreach(|_, inhibitor| {
            if inhibitor.flags.contains(InhibitFlags::LOGOUT) {
                info!(
                    "Manager: logout inhibited by {}: {}",
                    inhibitor.app_id, inhibitor.reason
                );
                inhibited = true;
            }
        });
        inhibited
    }

    async fn cancel_logout(&mut self) {
        if self.phase != ManagerPhase::QueryEndSession {
            debug!("Manager: cancel received outside the query phase, ignoring");
            return;
        }
        info!("Manager: logout cancelled by a client");
        let snapshot = {
            let mut clients = self.clients.lock().await;
            clients.set_locked(false);
            clients.values()
        };
        for client in snapshot {
            if let Err(err) = client.cancel_end_session().await {
                debug!("Manager: could not notify {}: {}", client.id(), err);
            }
        }
        self.pending.clear();
        self.phase2.clear();
        self.phase = ManagerPhase::Running;
    }

    /// Moves the phase machine forward whenever the current round has no
    /// outstanding answers left.
    async fn advance_if_ready(&mut self) {
        loop {
            if !self.pending.is_empty() {
                return;
            }
            match self.phase {
                ManagerPhase::QueryEndSession => self.begin_end_session().await,
                ManagerPhase::EndSession => {
                    if self.phase2.is_empty() {
                        self.finish_session().await;
                    } else {
                        self.begin_phase2().await;
                    }
                }
                ManagerPhase::EndSessionPhase2 => self.finish_session().await,
                ManagerPhase::Running | ManagerPhase::Exiting => return,
            }
            if self.phase == ManagerPhase::Exiting {
                return;
            }
        }
    }

    async fn begin_end_session(&mut self) {
        if self.autosave {
            self.save_session_now().await;
        }
        let snapshot: Vec<Client> = {
            let mut clients = self.clients.lock().await;
            clients.set_locked(true);
            clients
                .values()
                .into_iter()
                .filter(|client| client.status() == ClientStatus::Registered)
                .collect()
        };
        self.phase = ManagerPhase::EndSession;
        info!("Manager: ending the session for {} client(s)", snapshot.len());

        let mut flags = EndSessionFlags::SAVE;
        if self.forceful {
            flags = flags | EndSessionFlags::FORCEFUL;
        }
        self.pending = snapshot.iter().map(|c| c.id()).collect();
        for client in snapshot {
            if let Err(err) = client.end_session(flags).await {
                debug!(
                    "Manager: end_session failed for {} ({}), counting it as answered",
                    client.id(),
                    err
                );
                self.pending.remove(&client.id());
            }
        }
    }

    async fn begin_phase2(&mut self) {
        self.phase = ManagerPhase::EndSessionPhase2;
        info!(
            "Manager: second save phase for {} client(s)",
            self.phase2.len()
        );
        self.pending = std::mem::take(&mut self.phase2);
        let clients = self.clients.lock().await;
        let mut failed = Vec::new();
        for id in &self.pending {
            match clients.lookup(id) {
                Some(client) => {
                    if let Err(err) = client.end_session(EndSessionFlags::LAST).await {
                        debug!("Manager: phase 2 failed for {}: {}", id, err);
                        failed.push(id.clone());
                    }
                }
                None => failed.push(id.clone()),
            }
        }
        drop(clients);
        for id in failed {
            self.pending.remove(&id);
        }
    }

    async fn finish_session(&mut self) {
        let snapshot = {
            let clients = self.clients.lock().await;
            info!("Manager: stopping {} client(s)", clients.len());
            clients.values()
        };
        for client in snapshot {
            if let Err(err) = client.stop().await {
                debug!("Manager: could not stop {}: {}", client.id(), err);
            }
        }
        self.clients.lock().await.clear();
        self.inhibitors.lock().await.clear();
        self.phase = ManagerPhase::Exiting;
    }

    async fn save_session_now(&self) {
        let snapshot = self.clients.lock().await.values();
        let mut apps = Vec::new();
        for client in snapshot {
            match client.save() {
                Some(app) => apps.push(app),
                None => debug!(
                    "Manager: not saving {} (app {:?}, restart style {:?}, pid {})",
                    client.id(),
                    client.app_name().or_else(|| client.app_id()),
                    client.restart_style_hint(),
                    client.process_id()
                ),
            }
        }
        match session_save::save_session(&self.saved_session_dir, &apps) {
            Ok(()) => info!(
                "Manager: saved {} client(s) to {}",
                apps.len(),
                self.saved_session_dir.display()
            ),
            Err(err) => warn!("Manager: session save failed: {}", err),
        }
    }
}

/// State shared with the bus interface: registration and inhibitors, the
/// only pieces of the session other processes drive directly.
pub struct SessionManagerIface {
    pub clients: Arc<Mutex<Store<Client>>>,
    pub inhibitors: Arc<Mutex<Store<Inhibitor>>>,
    pub id_alloc: ClientIdAllocator,
    pub client_events: UnboundedSender<ClientEvent>,
}

#[zbus::interface(name = "org.mate.SessionManager")]
impl SessionManagerIface {
    async fn register_client(
        &self,
        app_id: String,
        client_startup_id: String,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
    ) -> zbus::fdo::Result<OwnedObjectPath> {
        let bus_name = header
            .sender()
            .map(|sender| sender.to_string())
            .ok_or_else(|| zbus::fdo::Error::Failed("no sender on the call".to_string()))?;
        if self.clients.lock().await.locked() {
            return Err(zbus::fdo::Error::Failed(
                "the session is shutting down".to_string(),
            ));
        }

        let id = self.id_alloc.next_id();
        let startup_id = if client_startup_id.is_empty() {
            util::generate_startup_id()
        } else {
            client_startup_id
        };
        let app_id = if app_id.is_empty() { None } else { Some(app_id) };

        let client = DbusClient::new(
            id.clone(),
            app_id,
            startup_id.clone(),
            bus_name,
            RestartStyle::Never,
            connection.clone(),
            self.client_events.clone(),
        )
        .await
        .map_err(|err| zbus::fdo::Error::Failed(err.to_string()))?;

        if !self.clients.lock().await.add(&id, Client::Dbus(client.clone())) {
            client.detach().await;
            return Err(zbus::fdo::Error::Failed(
                "could not add the client to the session".to_string(),
            ));
        }
        let _ = self.client_events.send(ClientEvent::Registered {
            id: id.clone(),
            startup_id,
        });
        OwnedObjectPath::try_from(id).map_err(|err| zbus::fdo::Error::Failed(err.to_string()))
    }

    async fn inhibit(
        &self,
        app_id: String,
        toplevel_xid: u32,
        reason: String,
        flags: u32,
    ) -> zbus::fdo::Result<u32> {
        let inhibitor = Inhibitor::new(app_id, None, reason, InhibitFlags(flags), toplevel_xid);
        info!(
            "Manager: {} inhibits {} ({})",
            inhibitor.app_id,
            inhibitor.flags.describe(),
            inhibitor.reason
        );
        let id = inhibitor.id.clone();
        let cookie = inhibitor.cookie;
        if !self.inhibitors.lock().await.add(&id, inhibitor) {
            return Err(zbus::fdo::Error::Failed(
                "could not record the inhibitor".to_string(),
            ));
        }
        Ok(cookie)
    }

    async fn uninhibit(&self, cookie: u32) -> zbus::fdo::Result<()> {
        let removed = self
            .inhibitors
            .lock()
            .await
            .foreach_remove(|_, inhibitor| inhibitor.cookie == cookie);
        if removed == 0 {
            return Err(zbus::fdo::Error::Failed(format!(
                "no inhibitor with cookie {}",
                cookie
            )));
        }
        Ok(())
    }
}
