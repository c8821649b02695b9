//! Polymorphic session-client contract.
//!
//! A session client reaches the daemon over one of two transports: the XSMP
//! socket protocol or the message bus. Both variants expose the same
//! lifecycle operations, so the coordinator drives a shutdown without caring
//! which transport a client arrived on.

pub mod dbus;
pub mod xsmp;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

pub use dbus::DbusClient;
pub use xsmp::XsmpClient;

use crate::session_save::SavedApp;

/// Where a client stands in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Unregistered,
    Registered,
    Finished,
    Failed,
}

/// What should happen to a saved client on the next login.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartStyle {
    Never,
    #[default]
    IfRunning,
    Anyway,
    Immediately,
}

impl RestartStyle {
    /// Decodes the card8 value of the `RestartStyleHint` property.
    /// Unknown values fall back to the default.
    pub fn from_card8(value: u8) -> Self {
        match value {
            0 => RestartStyle::IfRunning,
            1 => RestartStyle::Anyway,
            2 => RestartStyle::Immediately,
            3 => RestartStyle::Never,
            _ => RestartStyle::IfRunning,
        }
    }
}

/// Flags qualifying a query-end-session / end-session request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndSessionFlags(pub u32);

impl EndSessionFlags {
    pub const NONE: Self = Self(0);
    /// Skip interaction; the end is not negotiable.
    pub const FORCEFUL: Self = Self(1 << 0);
    /// Ask clients to save user data, not just report readiness.
    pub const SAVE: Self = Self(1 << 1);
    /// Final round for clients that requested a second save phase.
    pub const LAST: Self = Self(1 << 2);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for EndSessionFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Errors for operations on an individual client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client is not registered")]
    NotRegistered,
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("no valid handshake within the authentication window")]
    AuthenticationTimeout,
    #[error("transport error: {0}")]
    Io(String),
    #[error("client reported an unsuccessful save")]
    SaveFailed,
}

/// Observable client events, delivered to the coordinator in dispatch order.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The client completed registration and owns `startup_id` now.
    Registered { id: String, startup_id: String },
    /// The client asked for a session-wide logout.
    LogoutRequest { id: String, prompt: bool },
    /// The client answered a query-end-session / end-session round.
    EndSessionResponse {
        id: String,
        is_ok: bool,
        do_last: bool,
        cancel: bool,
        reason: Option<String>,
    },
    /// The client's transport went away.
    Disconnected { id: String },
}

/// State shared by both client variants.
pub struct ClientCommon {
    id: String,
    startup_id: Mutex<Option<String>>,
    app_id: Mutex<Option<String>>,
    status: Mutex<ClientStatus>,
    events: UnboundedSender<ClientEvent>,
}

impl ClientCommon {
    pub fn new(id: String, events: UnboundedSender<ClientEvent>) -> Self {
        Self {
            id,
            startup_id: Mutex::new(None),
            app_id: Mutex::new(None),
            status: Mutex::new(ClientStatus::Unregistered),
            events,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn startup_id(&self) -> Option<String> {
        self.startup_id.lock().expect("startup_id lock").clone()
    }

    pub fn set_startup_id(&self, startup_id: String) {
        *self.startup_id.lock().expect("startup_id lock") = Some(startup_id);
    }

    pub fn app_id(&self) -> Option<String> {
        self.app_id.lock().expect("app_id lock").clone()
    }

    pub fn set_app_id(&self, app_id: String) {
        *self.app_id.lock().expect("app_id lock") = Some(app_id);
    }

    pub fn status(&self) -> ClientStatus {
        *self.status.lock().expect("status lock")
    }

    pub fn set_status(&self, status: ClientStatus) {
        *self.status.lock().expect("status lock") = status;
    }

    pub fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    pub fn emit_end_session_response(
        &self,
        is_ok: bool,
        do_last: bool,
        cancel: bool,
        reason: Option<String>,
    ) {
        self.emit(ClientEvent::EndSessionResponse {
            id: self.id.clone(),
            is_ok,
            do_last,
            cancel,
            reason,
        });
    }
}

/// A registered session client, dispatching on its transport.
#[derive(Clone)]
pub enum Client {
    Xsmp(Arc<XsmpClient>),
    Dbus(Arc<DbusClient>),
}

impl Client {
    fn common(&self) -> &ClientCommon {
        match self {
            Client::Xsmp(c) => c.common(),
            Client::Dbus(c) => c.common(),
        }
    }

    pub fn id(&self) -> String {
        self.common().id().to_string()
    }

    pub fn startup_id(&self) -> Option<String> {
        self.common().startup_id()
    }

    pub fn app_id(&self) -> Option<String> {
        self.common().app_id()
    }

    pub fn status(&self) -> ClientStatus {
        self.common().status()
    }

    /// Asks whether the client is prepared to end, without committing.
    pub async fn query_end_session(&self, flags: EndSessionFlags) -> Result<(), ClientError> {
        match self {
            Client::Xsmp(c) => c.query_end_session(flags),
            Client::Dbus(c) => c.query_end_session(flags).await,
        }
    }

    /// Commits to ending the session for this client.
    pub async fn end_session(&self, flags: EndSessionFlags) -> Result<(), ClientError> {
        match self {
            Client::Xsmp(c) => c.end_session(flags),
            Client::Dbus(c) => c.end_session(flags).await,
        }
    }

    pub async fn cancel_end_session(&self) -> Result<(), ClientError> {
        match self {
            Client::Xsmp(c) => c.cancel_end_session(),
            Client::Dbus(c) => c.cancel_end_session().await,
        }
    }

    pub async fn stop(&self) -> Result<(), ClientError> {
        match self {
            Client::Xsmp(c) => c.stop(),
            Client::Dbus(c) => c.stop().await,
        }
    }

    /// Produces the restart descriptor written into the saved session, or
    /// `None` when the client must not be resurrected.
    pub fn save(&self) -> Option<SavedApp> {
        match self {
            Client::Xsmp(c) => c.save(),
            Client::Dbus(c) => c.save(),
        }
    }

    pub fn app_name(&self) -> Option<String> {
        match self {
            Client::Xsmp(c) => c.app_name(),
            Client::Dbus(_) => None,
        }
    }

    pub fn restart_style_hint(&self) -> RestartStyle {
        match self {
            Client::Xsmp(c) => c.restart_style_hint(),
            Client::Dbus(c) => c.restart_style_hint(),
        }
    }

    pub fn process_id(&self) -> u32 {
        match self {
            Client::Xsmp(c) => c.process_id(),
            Client::Dbus(c) => c.process_id(),
        }
    }
}

/// Mints sequential client ids; shared by the XSMP listener and the bus
/// registration path so both draw from one sequence.
#[derive(Clone)]
pub struct ClientIdAllocator {
    next: Arc<AtomicU64>,
}

impl ClientIdAllocator {
    pub fn new() -> Self {
        Self {
            next: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("/org/mate/SessionManager/Client{}", n)
    }
}

impl Default for ClientIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
