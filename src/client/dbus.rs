//! Bus-transport session client.
//!
//! A bus client registers once over the session manager's bus interface and
//! is driven afterwards through unicast signals on a private per-client
//! interface at its own object path. Responses come back as a method call on
//! that same path, which only the owning bus connection may make.

use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::mpsc::UnboundedSender;
use zbus::message::Header;
use zbus::names::BusName;
use zbus::zvariant::ObjectPath;
use zbus::Connection;

use crate::client::{
    ClientCommon, ClientError, ClientEvent, ClientStatus, EndSessionFlags, RestartStyle,
};
use crate::session_save::SavedApp;

const CLIENT_PRIVATE_INTERFACE: &str = "org.mate.SessionManager.ClientPrivate";

pub struct DbusClient {
    common: ClientCommon,
    bus_name: String,
    caller_pid: u32,
    restart_style_hint: RestartStyle,
    connection: Connection,
}

impl DbusClient {
    /// Builds the client and exports its private interface at the client's
    /// object path. `bus_name` is the unique name of the registering caller.
    pub async fn new(
        id: String,
        app_id: Option<String>,
        startup_id: String,
        bus_name: String,
        restart_style_hint: RestartStyle,
        connection: Connection,
        events: UnboundedSender<ClientEvent>,
    ) -> Result<Arc<Self>, ClientError> {
        if bus_name.is_empty() {
            return Err(ClientError::NotRegistered);
        }

        let caller_pid = query_caller_pid(&connection, &bus_name).await;

        let common = ClientCommon::new(id.clone(), events.clone());
        common.set_startup_id(startup_id);
        if let Some(app_id) = app_id {
            common.set_app_id(app_id);
        }
        common.set_status(ClientStatus::Registered);

        let iface = ClientPrivate {
            id: id.clone(),
            bus_name: bus_name.clone(),
            events,
        };
        let path = ObjectPath::try_from(id.as_str()).map_err(to_io_error)?;
        connection
            .object_server()
            .at(&path, iface)
            .await
            .map_err(to_io_error)?;

        Ok(Arc::new(Self {
            common,
            bus_name,
            caller_pid,
            restart_style_hint,
            connection,
        }))
    }

    pub fn common(&self) -> &ClientCommon {
        &self.common
    }

    pub fn process_id(&self) -> u32 {
        self.caller_pid
    }

    pub fn restart_style_hint(&self) -> RestartStyle {
        self.restart_style_hint
    }

    pub fn save(&self) -> Option<SavedApp> {
        None
    }

    async fn emit<B>(&self, signal: &str, body: &B) -> Result<(), ClientError>
    where
        B: serde::ser::Serialize + zbus::zvariant::DynamicType + Sync,
    {
        let dest = BusName::try_from(self.bus_name.as_str()).map_err(to_io_error)?;
        let path = ObjectPath::try_from(self.common.id()).map_err(to_io_error)?;
        debug!(
            "DbusClient: emitting {} to {} at {}",
            signal,
            self.bus_name,
            self.common.id()
        );
        self.connection
            .emit_signal(Some(dest), &path, CLIENT_PRIVATE_INTERFACE, signal, body)
            .await
            .map_err(to_io_error)
    }

    pub async fn query_end_session(&self, flags: EndSessionFlags) -> Result<(), ClientError> {
        self.emit("QueryEndSession", &(flags.0,)).await
    }

    pub async fn end_session(&self, flags: EndSessionFlags) -> Result<(), ClientError> {
        self.emit("EndSession", &(flags.0,)).await
    }

    pub async fn cancel_end_session(&self) -> Result<(), ClientError> {
        self.emit("CancelEndSession", &()).await
    }

    pub async fn stop(&self) -> Result<(), ClientError> {
        self.emit("Stop", &()).await
    }

    /// Unexports the private interface once the client leaves the session.
    pub async fn detach(&self) {
        if let Ok(path) = ObjectPath::try_from(self.common.id()) {
            let _ = self
                .connection
                .object_server()
                .remove::<ClientPrivate, _>(&path)
                .await;
        }
    }
}

async fn query_caller_pid(connection: &Connection, bus_name: &str) -> u32 {
    let proxy = match zbus::fdo::DBusProxy::new(connection).await {
        Ok(proxy) => proxy,
        Err(err) => {
            debug!("DbusClient: no bus daemon proxy: {}", err);
            return 0;
        }
    };
    let name = match BusName::try_from(bus_name) {
        Ok(name) => name,
        Err(_) => return 0,
    };
    match proxy.get_connection_unix_process_id(name).await {
        Ok(pid) => pid,
        Err(err) => {
            debug!("DbusClient: pid lookup for {} failed: {}", bus_name, err);
            0
        }
    }
}

fn to_io_error<E: std::fmt::Display>(err: E) -> ClientError {
    ClientError::Io(err.to_string())
}

struct ClientPrivate {
    id: String,
    bus_name: String,
    events: UnboundedSender<ClientEvent>,
}

#[zbus::interface(name = "org.mate.SessionManager.ClientPrivate")]
impl ClientPrivate {
    /// The answer to a `QueryEndSession` or `EndSession` signal. Only the
    /// bus connection that registered the client may respond for it.
    async fn end_session_response(
        &self,
        is_ok: bool,
        reason: String,
        #[zbus(header)] header: Header<'_>,
    ) -> zbus::fdo::Result<()> {
        let sender = header.sender().map(|sender| sender.as_str());
        if !sender_is_owner(sender, &self.bus_name) {
            warn!(
                "DbusClient: rejecting EndSessionResponse for {} from a foreign sender",
                self.id
            );
            return Err(zbus::fdo::Error::Failed(
                "not the registered client for this path".to_string(),
            ));
        }
        let _ = self.events.send(response_event(&self.id, is_ok, reason));
        Ok(())
    }
}

/// A response is only accepted from the bus connection that registered the
/// client; an absent sender header is rejected outright.
fn sender_is_owner(sender: Option<&str>, bus_name: &str) -> bool {
    sender.map(|sender| sender == bus_name).unwrap_or(false)
}

fn response_event(id: &str, is_ok: bool, reason: String) -> ClientEvent {
    ClientEvent::EndSessionResponse {
        id: id.to_string(),
        is_ok,
        do_last: false,
        cancel: false,
        reason: if reason.is_empty() { None } else { Some(reason) },
    }
}
