//! Wire protocol for the XSMP session transport.
//!
//! All communication uses newline-delimited JSON (one JSON object per line).
//! Connections are persistent: after the `Hello` authentication exchange, the
//! same connection carries the whole registration / save-yourself / shutdown
//! conversation for one client.

use serde::{Deserialize, Serialize};

/// Property names with protocol-defined meaning.
pub const PROP_PROGRAM: &str = "Program";
pub const PROP_RESTART_COMMAND: &str = "RestartCommand";
pub const PROP_DISCARD_COMMAND: &str = "DiscardCommand";
pub const PROP_RESTART_STYLE_HINT: &str = "RestartStyleHint";
pub const PROP_PROCESS_ID: &str = "ProcessID";

/// What a `SaveYourself` asks the client to persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaveKind {
    /// Application state only (checkpoint)
    Local,
    /// User data only (open documents)
    Global,
    /// Both state and user data
    Both,
}

/// How much interaction a `SaveYourself` permits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InteractStyle {
    None,
    Errors,
    Any,
}

/// Dialog kind requested by an interacting client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DialogKind {
    Error,
    Normal,
}

/// A session-management property attached to a client.
///
/// The three value shapes mirror the classic CARD8 / ARRAY8 / LISTofARRAY8
/// property types; parsers reject values of the wrong shape rather than
/// coercing them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmProp {
    pub name: String,
    pub value: PropValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum PropValue {
    Card8(u8),
    Text(String),
    TextList(Vec<String>),
}

impl SmProp {
    pub fn card8(name: &str, value: u8) -> Self {
        Self {
            name: name.to_string(),
            value: PropValue::Card8(value),
        }
    }

    pub fn text(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: PropValue::Text(value.to_string()),
        }
    }

    pub fn text_list(name: &str, values: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            value: PropValue::TextList(values.iter().map(|v| v.to_string()).collect()),
        }
    }
}

/// Messages sent from a session client to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Authentication handshake; must be the first message on a connection
    /// and must carry a cookie from the daemon's authority file.
    Hello { cookie: String },
    /// Register as a session client. An absent/empty `previous_id` asks the
    /// daemon to mint a fresh startup id; a non-empty one resumes a saved
    /// session identity.
    RegisterClient {
        #[serde(default)]
        previous_id: Option<String>,
    },
    /// Ask the daemon to initiate a save or logout on the client's behalf.
    SaveYourselfRequest {
        save_type: SaveKind,
        shutdown: bool,
        interact_style: InteractStyle,
        fast: bool,
        global: bool,
    },
    /// The client finished processing a `SaveYourself`.
    SaveYourselfDone { success: bool },
    /// The client wants to defer its real work to the second save phase.
    SaveYourselfPhase2Request,
    /// The client wants to interact with the user before answering.
    InteractRequest { dialog: DialogKind },
    /// The client finished interacting; it may veto the shutdown.
    InteractDone { cancel_shutdown: bool },
    SetProperties { properties: Vec<SmProp> },
    DeleteProperties { names: Vec<String> },
    GetProperties,
    /// Orderly goodbye from the client.
    CloseConnection {
        #[serde(default)]
        reasons: Vec<String>,
    },
}

/// Messages sent from the daemon to a session client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Sent instead of normal traffic when the daemon will not take the
    /// client (e.g. the session is shutting down); the connection closes
    /// right after.
    ConnectionRefused { reason: String },
    RegisterClientReply { client_id: String },
    SaveYourself {
        save_type: SaveKind,
        shutdown: bool,
        interact_style: InteractStyle,
        fast: bool,
    },
    SaveYourselfPhase2,
    SaveComplete,
    Interact,
    ShutdownCancelled,
    Die,
    PropertiesReply { properties: Vec<SmProp> },
}
