//! XSMP-transport session client.
//!
//! Owns the per-connection protocol state: the typed property list and the
//! save-yourself slots. Exactly one `SaveYourself` is outstanding per client
//! at any time; a request arriving while one is in flight is remembered in a
//! depth-1 queue and dispatched when the in-flight one completes. The queue
//! keeps only the newest request, so intermediate ones are superseded.

use std::sync::Mutex;

use log::{debug, warn};
use tokio::sync::mpsc::UnboundedSender;

use crate::client::{
    ClientCommon, ClientError, ClientEvent, ClientStatus, EndSessionFlags, RestartStyle,
};
use crate::session_save::SavedApp;
use crate::util::generate_startup_id;
use crate::xsmp::protocol::{
    ClientMessage, InteractStyle, PropValue, SaveKind, ServerMessage, SmProp, PROP_DISCARD_COMMAND,
    PROP_PROCESS_ID, PROP_PROGRAM, PROP_RESTART_COMMAND, PROP_RESTART_STYLE_HINT,
};

#[derive(Debug, Default)]
struct SaveYourselfState {
    /// Request currently awaiting `SaveYourselfDone`.
    current: Option<SaveKind>,
    /// Coalesced follow-up request: kind plus interact-allowed flag.
    next: Option<(SaveKind, bool)>,
}

pub struct XsmpClient {
    common: ClientCommon,
    outgoing: UnboundedSender<ServerMessage>,
    props: Mutex<Vec<SmProp>>,
    save_yourself: Mutex<SaveYourselfState>,
}

impl XsmpClient {
    pub fn new(
        id: String,
        outgoing: UnboundedSender<ServerMessage>,
        events: UnboundedSender<ClientEvent>,
    ) -> Self {
        Self {
            common: ClientCommon::new(id, events),
            outgoing,
            props: Mutex::new(Vec::new()),
            save_yourself: Mutex::new(SaveYourselfState::default()),
        }
    }

    pub fn common(&self) -> &ClientCommon {
        &self.common
    }

    /// Human-readable identity for log lines, e.g. `Client3 [gedit 1a2b]`.
    fn description(&self) -> String {
        let id = self.common.id();
        let short = id.rsplit('/').next().unwrap_or(id);
        match (self.find_text(PROP_PROGRAM), self.common.startup_id()) {
            (Some(program), Some(sid)) => format!("{} [{} {}]", short, program, sid),
            (None, Some(sid)) => format!("{} [{}]", short, sid),
            _ => short.to_string(),
        }
    }

    fn send(&self, msg: ServerMessage) -> Result<(), ClientError> {
        self.outgoing.send(msg).map_err(|_| ClientError::NotRegistered)
    }

    fn connected(&self) -> bool {
        !self.outgoing.is_closed()
    }

    // ---- property access -------------------------------------------------

    fn find_prop(&self, name: &str) -> Option<SmProp> {
        self.props
            .lock()
            .expect("props lock")
            .iter()
            .find(|p| p.name == name)
            .cloned()
    }

    fn find_text(&self, name: &str) -> Option<String> {
        match self.find_prop(name)?.value {
            PropValue::Text(s) => Some(s),
            _ => None,
        }
    }

    fn find_command(&self, name: &str) -> Option<String> {
        match self.find_prop(name)?.value {
            PropValue::TextList(args) => Some(join_command(&args)),
            _ => None,
        }
    }

    pub fn restart_style_hint(&self) -> RestartStyle {
        match self.find_prop(PROP_RESTART_STYLE_HINT).map(|p| p.value) {
            Some(PropValue::Card8(v)) => RestartStyle::from_card8(v),
            _ => RestartStyle::IfRunning,
        }
    }

    pub fn process_id(&self) -> u32 {
        match self.find_prop(PROP_PROCESS_ID).map(|p| p.value) {
            Some(PropValue::Text(s)) => s.parse().unwrap_or(0),
            _ => 0,
        }
    }

    pub fn app_name(&self) -> Option<String> {
        self.find_text(PROP_PROGRAM)
    }

    // ---- the uniform client contract ------------------------------------

    pub fn query_end_session(&self, flags: EndSessionFlags) -> Result<(), ClientError> {
        if !self.connected() {
            return Err(ClientError::NotRegistered);
        }
        // We don't want clients to persist state in this phase; we only want
        // to learn about unsaved user data and give the client a chance to
        // bring it up with the user.
        let allow_interact = !flags.contains(EndSessionFlags::FORCEFUL);
        self.do_save_yourself(SaveKind::Global, allow_interact)
    }

    pub fn end_session(&self, flags: EndSessionFlags) -> Result<(), ClientError> {
        if !self.connected() {
            return Err(ClientError::NotRegistered);
        }
        if flags.contains(EndSessionFlags::LAST) {
            debug!("XsmpClient: phase 2 for '{}'", self.description());
            return self.send(ServerMessage::SaveYourselfPhase2);
        }
        let save_type = if flags.contains(EndSessionFlags::SAVE) {
            SaveKind::Both
        } else {
            SaveKind::Global
        };
        // The interaction window was the query phase; it is over now.
        self.do_save_yourself(save_type, false)
    }

    pub fn cancel_end_session(&self) -> Result<(), ClientError> {
        if !self.connected() {
            return Err(ClientError::NotRegistered);
        }
        debug!("XsmpClient: cancel_end_session ('{}')", self.description());
        self.send(ServerMessage::ShutdownCancelled)?;
        let mut sy = self.save_yourself.lock().expect("save_yourself lock");
        sy.current = None;
        sy.next = None;
        Ok(())
    }

    pub fn stop(&self) -> Result<(), ClientError> {
        if !self.connected() {
            return Err(ClientError::NotRegistered);
        }
        debug!("XsmpClient: stop ('{}')", self.description());
        self.send(ServerMessage::Die)
    }

    pub fn save(&self) -> Option<SavedApp> {
        if self.restart_style_hint() == RestartStyle::Never {
            return None;
        }
        let exec = self.find_command(PROP_RESTART_COMMAND)?;
        let startup_id = self.common.startup_id()?;
        let name = self
            .find_text(PROP_PROGRAM)
            .unwrap_or_else(|| startup_id.clone());
        Some(SavedApp {
            name,
            exec,
            discard_exec: self.find_command(PROP_DISCARD_COMMAND),
            startup_id,
            icon: "system-run".to_string(),
            app_type: "Application".to_string(),
        })
    }

    // ---- save-yourself state machine ------------------------------------

    /// Sends a `SaveYourself`, or queues/drops it according to the slots.
    pub fn do_save_yourself(
        &self,
        save_type: SaveKind,
        allow_interact: bool,
    ) -> Result<(), ClientError> {
        let mut sy = self.save_yourself.lock().expect("save_yourself lock");
        if sy.current.is_some() {
            // Only the newest request matters; an already queued one is
            // superseded by it.
            if sy.next.is_some() {
                debug!(
                    "XsmpClient: replacing queued SaveYourself for '{}'",
                    self.description()
                );
            } else {
                debug!(
                    "XsmpClient: queuing SaveYourself({:?}) for '{}'",
                    save_type,
                    self.description()
                );
            }
            sy.next = Some((save_type, allow_interact));
            return Ok(());
        }
        sy.current = Some(save_type);
        drop(sy);

        let msg = match save_type {
            SaveKind::Local => ServerMessage::SaveYourself {
                save_type: SaveKind::Local,
                shutdown: false,
                interact_style: InteractStyle::None,
                fast: false,
            },
            kind if !allow_interact => ServerMessage::SaveYourself {
                save_type: kind,
                shutdown: true,
                interact_style: InteractStyle::None,
                fast: true,
            },
            kind => ServerMessage::SaveYourself {
                save_type: kind,
                shutdown: true,
                interact_style: InteractStyle::Any,
                fast: false,
            },
        };
        self.send(msg)
    }

    // ---- incoming protocol dispatch -------------------------------------

    pub fn handle_message(&self, msg: ClientMessage) -> Result<(), ClientError> {
        match msg {
            ClientMessage::Hello { .. } => {
                debug!(
                    "XsmpClient: stray Hello from '{}' after authentication",
                    self.description()
                );
                Ok(())
            }
            ClientMessage::RegisterClient { previous_id } => self.register(previous_id),
            ClientMessage::SaveYourselfRequest {
                save_type,
                shutdown,
                interact_style,
                fast,
                global,
            } => {
                self.save_yourself_request(save_type, shutdown, interact_style, fast, global);
                Ok(())
            }
            ClientMessage::SaveYourselfDone { success } => self.save_yourself_done(success),
            ClientMessage::SaveYourselfPhase2Request => {
                self.save_yourself_phase2_request();
                Ok(())
            }
            ClientMessage::InteractRequest { dialog } => {
                debug!(
                    "XsmpClient: '{}' received InteractRequest({:?})",
                    self.description(),
                    dialog
                );
                // The manager learns right away that this client is in the
                // way; the client then gets to put up its own dialog.
                self.common.emit_end_session_response(
                    false,
                    false,
                    false,
                    Some("This program is blocking logout.".to_string()),
                );
                self.send(ServerMessage::Interact)
            }
            ClientMessage::InteractDone { cancel_shutdown } => {
                debug!(
                    "XsmpClient: '{}' received InteractDone(cancel_shutdown = {})",
                    self.description(),
                    cancel_shutdown
                );
                self.common
                    .emit_end_session_response(true, false, cancel_shutdown, None);
                Ok(())
            }
            ClientMessage::SetProperties { properties } => {
                self.set_properties(properties);
                Ok(())
            }
            ClientMessage::DeleteProperties { names } => {
                self.delete_properties(&names);
                Ok(())
            }
            ClientMessage::GetProperties => {
                debug!(
                    "XsmpClient: GetProperties from '{}'",
                    self.description()
                );
                let properties = self.props.lock().expect("props lock").clone();
                self.send(ServerMessage::PropertiesReply { properties })
            }
            ClientMessage::CloseConnection { reasons } => {
                self.close_connection(&reasons);
                Ok(())
            }
        }
    }

    fn register(&self, previous_id: Option<String>) -> Result<(), ClientError> {
        debug!(
            "XsmpClient: '{}' received RegisterClient({:?})",
            self.description(),
            previous_id
        );
        if self.common.status() == ClientStatus::Registered {
            return Err(ClientError::ProtocolViolation(
                "client attempted to register twice".to_string(),
            ));
        }

        let previous = previous_id.filter(|id| !id.is_empty());
        let resuming = previous.is_some();
        let startup_id = previous.unwrap_or_else(generate_startup_id);
        if startup_id.is_empty() {
            return Err(ClientError::ProtocolViolation(
                "registration produced an empty client id".to_string(),
            ));
        }

        self.common.set_startup_id(startup_id.clone());
        debug!(
            "XsmpClient: sending RegisterClientReply to '{}'",
            self.description()
        );
        self.send(ServerMessage::RegisterClientReply {
            client_id: startup_id.clone(),
        })?;

        if !resuming {
            // First-ever registration: ask for an initial checkpoint.
            debug!("XsmpClient: sending initial SaveYourself");
            self.send(ServerMessage::SaveYourself {
                save_type: SaveKind::Local,
                shutdown: false,
                interact_style: InteractStyle::None,
                fast: false,
            })?;
            self.save_yourself.lock().expect("save_yourself lock").current =
                Some(SaveKind::Local);
        }

        self.common.set_status(ClientStatus::Registered);
        self.common.emit(ClientEvent::Registered {
            id: self.common.id().to_string(),
            startup_id,
        });
        Ok(())
    }

    fn save_yourself_request(
        &self,
        save_type: SaveKind,
        shutdown: bool,
        interact_style: InteractStyle,
        fast: bool,
        global: bool,
    ) {
        debug!(
            "XsmpClient: '{}' received SaveYourselfRequest({:?}, shutdown={}, {:?}, fast={}, global={})",
            self.description(),
            save_type,
            shutdown,
            interact_style,
            fast,
            global
        );
        // Of all the flag combinations only two make sense. A shutdown that
        // is also global is a logout request; `fast` decides whether the
        // user gets prompted. A non-shutdown, non-global request is the
        // client checkpointing its own state. Everything else is a confused
        // caller and is ignored, save_type/interact_style included: the
        // manager picks those itself.
        if shutdown && global {
            debug!("XsmpClient:   initiating shutdown");
            self.common.emit(ClientEvent::LogoutRequest {
                id: self.common.id().to_string(),
                prompt: !fast,
            });
        } else if !shutdown && !global {
            debug!("XsmpClient:   initiating checkpoint");
            if let Err(err) = self.do_save_yourself(SaveKind::Local, true) {
                warn!("XsmpClient: checkpoint failed for '{}': {}", self.description(), err);
            }
        } else {
            debug!("XsmpClient:   ignoring");
        }
    }

    fn save_yourself_done(&self, success: bool) -> Result<(), ClientError> {
        debug!(
            "XsmpClient: '{}' received SaveYourselfDone(success = {})",
            self.description(),
            success
        );
        let queued = {
            let mut sy = self.save_yourself.lock().expect("save_yourself lock");
            if sy.current.take().is_some() {
                self.send(ServerMessage::SaveComplete)?;
            }
            sy.next.take()
        };

        if !success {
            // Nothing the session manager can do about it; note it and move on.
            warn!(
                "XsmpClient: '{}': {}",
                self.description(),
                ClientError::SaveFailed
            );
        }

        // A failed save is still an answer to a query/end round.
        self.common.emit_end_session_response(true, false, false, None);

        if let Some((save_type, allow_interact)) = queued {
            self.do_save_yourself(save_type, allow_interact)?;
        }
        Ok(())
    }

    fn save_yourself_phase2_request(&self) {
        debug!(
            "XsmpClient: '{}' received SaveYourselfPhase2Request",
            self.description()
        );
        self.save_yourself.lock().expect("save_yourself lock").current = None;
        // A valid answer to SaveYourself, and therefore to a query or end
        // round; do_last asks the manager to come back for phase 2.
        self.common.emit_end_session_response(true, true, false, None);
    }

    fn set_properties(&self, properties: Vec<SmProp>) {
        debug!(
            "XsmpClient: SetProperties from '{}'",
            self.description()
        );
        let mut program_changed = false;
        {
            let mut props = self.props.lock().expect("props lock");
            for prop in properties {
                debug!("XsmpClient:   {} = {:?}", prop.name, prop.value);
                if prop.name == PROP_PROGRAM {
                    program_changed = true;
                }
                props.retain(|p| p.name != prop.name);
                props.push(prop);
            }
        }
        if program_changed {
            if let Some(program) = self.find_text(PROP_PROGRAM) {
                self.common.set_app_id(format!("{}.desktop", program));
            }
        }
    }

    fn delete_properties(&self, names: &[String]) {
        debug!(
            "XsmpClient: DeleteProperties from '{}': {:?}",
            self.description(),
            names
        );
        let mut props = self.props.lock().expect("props lock");
        props.retain(|p| !names.contains(&p.name));
    }

    fn close_connection(&self, reasons: &[String]) {
        debug!(
            "XsmpClient: '{}' received CloseConnection",
            self.description()
        );
        for reason in reasons {
            debug!("XsmpClient:   close reason: '{}'", reason);
        }
        self.common.set_status(ClientStatus::Finished);
        self.common.emit(ClientEvent::Disconnected {
            id: self.common.id().to_string(),
        });
    }

    /// Transport failure path: the read loop saw EOF or an IO error. A
    /// client that already said goodbye has nothing left to report.
    pub fn mark_disconnected(&self) {
        if self.common.status() == ClientStatus::Finished {
            return;
        }
        self.common.set_status(ClientStatus::Failed);
        self.common.emit(ClientEvent::Disconnected {
            id: self.common.id().to_string(),
        });
    }
}

/// Flattens a command argument list into one shell-ready string, quoting
/// arguments that need it.
fn join_command(args: &[String]) -> String {
    let mut out = String::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let plain = !arg.is_empty()
            && arg
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "-_=:./".contains(c));
        if plain {
            out.push_str(arg);
        } else {
            out.push('\'');
            for c in arg.chars() {
                if c == '\'' {
                    out.push_str("'\\''");
                } else {
                    out.push(c);
                }
            }
            out.push('\'');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xsmp::protocol::DialogKind;
    use tokio::sync::mpsc::{error::TryRecvError, unbounded_channel, UnboundedReceiver};

    fn make_client() -> (
        XsmpClient,
        UnboundedReceiver<ServerMessage>,
        UnboundedReceiver<ClientEvent>,
    ) {
        let (out_tx, out_rx) = unbounded_channel();
        let (ev_tx, ev_rx) = unbounded_channel();
        let client = XsmpClient::new("/org/mate/SessionManager/Client1".to_string(), out_tx, ev_tx);
        (client, out_rx, ev_rx)
    }

    fn registered_client() -> (
        XsmpClient,
        UnboundedReceiver<ServerMessage>,
        UnboundedReceiver<ClientEvent>,
    ) {
        let (client, mut out_rx, mut ev_rx) = make_client();
        // Resumption form: no initial SaveYourself to drain afterwards.
        client
            .handle_message(ClientMessage::RegisterClient {
                previous_id: Some("resumed-id".to_string()),
            })
            .unwrap();
        let _ = out_rx.try_recv(); // RegisterClientReply
        let _ = ev_rx.try_recv(); // Registered
        (client, out_rx, ev_rx)
    }

    #[test]
    fn fresh_registration_mints_id_and_sends_initial_checkpoint() {
        let (client, mut out_rx, mut ev_rx) = make_client();
        client
            .handle_message(ClientMessage::RegisterClient { previous_id: None })
            .unwrap();

        let reply = out_rx.try_recv().unwrap();
        let minted = match reply {
            ServerMessage::RegisterClientReply { client_id } => {
                assert!(!client_id.is_empty());
                client_id
            }
            other => panic!("expected RegisterClientReply, got {:?}", other),
        };
        match out_rx.try_recv().unwrap() {
            ServerMessage::SaveYourself {
                save_type,
                shutdown,
                interact_style,
                fast,
            } => {
                assert_eq!(save_type, SaveKind::Local);
                assert!(!shutdown);
                assert_eq!(interact_style, InteractStyle::None);
                assert!(!fast);
            }
            other => panic!("expected initial SaveYourself, got {:?}", other),
        }

        assert_eq!(client.common().status(), ClientStatus::Registered);
        assert_eq!(client.common().startup_id(), Some(minted.clone()));
        match ev_rx.try_recv().unwrap() {
            ClientEvent::Registered { startup_id, .. } => assert_eq!(startup_id, minted),
            other => panic!("expected Registered, got {:?}", other),
        }
    }

    #[test]
    fn resumed_registration_keeps_previous_id_and_skips_checkpoint() {
        let (client, mut out_rx, _ev_rx) = make_client();
        client
            .handle_message(ClientMessage::RegisterClient {
                previous_id: Some("10abc123".to_string()),
            })
            .unwrap();
        match out_rx.try_recv().unwrap() {
            ServerMessage::RegisterClientReply { client_id } => assert_eq!(client_id, "10abc123"),
            other => panic!("expected RegisterClientReply, got {:?}", other),
        }
        assert!(matches!(out_rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(client.common().startup_id(), Some("10abc123".to_string()));
    }

    #[test]
    fn double_registration_is_a_protocol_violation() {
        let (client, _out_rx, _ev_rx) = registered_client();
        let err = client
            .handle_message(ClientMessage::RegisterClient { previous_id: None })
            .unwrap_err();
        assert!(matches!(err, ClientError::ProtocolViolation(_)));
        assert_eq!(client.common().status(), ClientStatus::Registered);
    }

    #[test]
    fn query_end_session_sends_interactive_global_save() {
        let (client, mut out_rx, _ev_rx) = registered_client();
        client.query_end_session(EndSessionFlags::NONE).unwrap();
        match out_rx.try_recv().unwrap() {
            ServerMessage::SaveYourself {
                save_type,
                shutdown,
                interact_style,
                fast,
            } => {
                assert_eq!(save_type, SaveKind::Global);
                assert!(shutdown);
                assert_eq!(interact_style, InteractStyle::Any);
                assert!(!fast);
            }
            other => panic!("expected SaveYourself, got {:?}", other),
        }
    }

    #[test]
    fn forceful_query_disallows_interaction() {
        let (client, mut out_rx, _ev_rx) = registered_client();
        client.query_end_session(EndSessionFlags::FORCEFUL).unwrap();
        match out_rx.try_recv().unwrap() {
            ServerMessage::SaveYourself {
                interact_style,
                fast,
                ..
            } => {
                assert_eq!(interact_style, InteractStyle::None);
                assert!(fast);
            }
            other => panic!("expected SaveYourself, got {:?}", other),
        }
    }

    #[test]
    fn save_yourself_requests_coalesce_to_the_latest() {
        let (client, mut out_rx, _ev_rx) = registered_client();

        client.do_save_yourself(SaveKind::Global, true).unwrap(); // A: sent
        client.do_save_yourself(SaveKind::Both, false).unwrap(); // B: queued
        client.do_save_yourself(SaveKind::Local, true).unwrap(); // C: supersedes B

        // Only A went out so far.
        assert!(matches!(
            out_rx.try_recv().unwrap(),
            ServerMessage::SaveYourself {
                save_type: SaveKind::Global,
                ..
            }
        ));
        assert!(matches!(out_rx.try_recv(), Err(TryRecvError::Empty)));

        client
            .handle_message(ClientMessage::SaveYourselfDone { success: true })
            .unwrap();

        // Completion acks A, then dispatches C; B was never sent.
        assert!(matches!(out_rx.try_recv().unwrap(), ServerMessage::SaveComplete));
        assert!(matches!(
            out_rx.try_recv().unwrap(),
            ServerMessage::SaveYourself {
                save_type: SaveKind::Local,
                shutdown: false,
                ..
            }
        ));
        assert!(matches!(out_rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn save_yourself_done_answers_the_end_session_round() {
        let (client, mut out_rx, mut ev_rx) = registered_client();
        client.query_end_session(EndSessionFlags::NONE).unwrap();
        let _ = out_rx.try_recv();

        client
            .handle_message(ClientMessage::SaveYourselfDone { success: true })
            .unwrap();
        assert!(matches!(out_rx.try_recv().unwrap(), ServerMessage::SaveComplete));
        match ev_rx.try_recv().unwrap() {
            ClientEvent::EndSessionResponse {
                is_ok,
                do_last,
                cancel,
                reason,
                ..
            } => {
                assert!(is_ok);
                assert!(!do_last);
                assert!(!cancel);
                assert!(reason.is_none());
            }
            other => panic!("expected EndSessionResponse, got {:?}", other),
        }
    }

    #[test]
    fn failed_save_is_still_an_answer() {
        let (client, _out_rx, mut ev_rx) = registered_client();
        client.query_end_session(EndSessionFlags::NONE).unwrap();
        client
            .handle_message(ClientMessage::SaveYourselfDone { success: false })
            .unwrap();
        assert!(matches!(
            ev_rx.try_recv().unwrap(),
            ClientEvent::EndSessionResponse { is_ok: true, .. }
        ));
    }

    #[test]
    fn phase2_request_resets_current_and_asks_for_the_last_round() {
        let (client, mut out_rx, mut ev_rx) = registered_client();
        client.query_end_session(EndSessionFlags::NONE).unwrap();
        let _ = out_rx.try_recv();

        client
            .handle_message(ClientMessage::SaveYourselfPhase2Request)
            .unwrap();
        match ev_rx.try_recv().unwrap() {
            ClientEvent::EndSessionResponse { is_ok, do_last, .. } => {
                assert!(is_ok);
                assert!(do_last);
            }
            other => panic!("expected EndSessionResponse, got {:?}", other),
        }

        // current was cleared: a new request goes straight out.
        client.do_save_yourself(SaveKind::Both, false).unwrap();
        assert!(matches!(
            out_rx.try_recv().unwrap(),
            ServerMessage::SaveYourself {
                save_type: SaveKind::Both,
                ..
            }
        ));
    }

    #[test]
    fn end_session_with_last_flag_sends_phase2() {
        let (client, mut out_rx, _ev_rx) = registered_client();
        client.end_session(EndSessionFlags::LAST).unwrap();
        assert!(matches!(
            out_rx.try_recv().unwrap(),
            ServerMessage::SaveYourselfPhase2
        ));
    }

    #[test]
    fn end_session_with_save_flag_requests_both() {
        let (client, mut out_rx, _ev_rx) = registered_client();
        client.end_session(EndSessionFlags::SAVE).unwrap();
        match out_rx.try_recv().unwrap() {
            ServerMessage::SaveYourself {
                save_type,
                interact_style,
                ..
            } => {
                assert_eq!(save_type, SaveKind::Both);
                assert_eq!(interact_style, InteractStyle::None);
            }
            other => panic!("expected SaveYourself, got {:?}", other),
        }
    }

    #[test]
    fn interact_request_reports_blocking_then_lets_the_client_interact() {
        let (client, mut out_rx, mut ev_rx) = registered_client();
        client
            .handle_message(ClientMessage::InteractRequest {
                dialog: DialogKind::Normal,
            })
            .unwrap();
        match ev_rx.try_recv().unwrap() {
            ClientEvent::EndSessionResponse { is_ok, reason, .. } => {
                assert!(!is_ok);
                assert_eq!(reason.as_deref(), Some("This program is blocking logout."));
            }
            other => panic!("expected EndSessionResponse, got {:?}", other),
        }
        assert!(matches!(out_rx.try_recv().unwrap(), ServerMessage::Interact));
    }

    #[test]
    fn interact_done_can_cancel_the_shutdown() {
        let (client, _out_rx, mut ev_rx) = registered_client();
        client
            .handle_message(ClientMessage::InteractDone {
                cancel_shutdown: true,
            })
            .unwrap();
        assert!(matches!(
            ev_rx.try_recv().unwrap(),
            ClientEvent::EndSessionResponse { cancel: true, .. }
        ));
    }

    #[test]
    fn cancel_end_session_resets_both_slots() {
        let (client, mut out_rx, _ev_rx) = registered_client();
        client.do_save_yourself(SaveKind::Global, true).unwrap();
        client.do_save_yourself(SaveKind::Both, false).unwrap();
        let _ = out_rx.try_recv();

        client.cancel_end_session().unwrap();
        assert!(matches!(
            out_rx.try_recv().unwrap(),
            ServerMessage::ShutdownCancelled
        ));

        // Both slots clear: the next request is dispatched immediately and
        // completing it dispatches nothing further.
        client.do_save_yourself(SaveKind::Local, false).unwrap();
        assert!(matches!(
            out_rx.try_recv().unwrap(),
            ServerMessage::SaveYourself {
                save_type: SaveKind::Local,
                ..
            }
        ));
        client
            .handle_message(ClientMessage::SaveYourselfDone { success: true })
            .unwrap();
        assert!(matches!(out_rx.try_recv().unwrap(), ServerMessage::SaveComplete));
        assert!(matches!(out_rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn logout_request_combination_emits_logout_event() {
        let (client, _out_rx, mut ev_rx) = registered_client();
        client
            .handle_message(ClientMessage::SaveYourselfRequest {
                save_type: SaveKind::Both,
                shutdown: true,
                interact_style: InteractStyle::Any,
                fast: false,
                global: true,
            })
            .unwrap();
        match ev_rx.try_recv().unwrap() {
            ClientEvent::LogoutRequest { prompt, .. } => assert!(prompt),
            other => panic!("expected LogoutRequest, got {:?}", other),
        }
    }

    #[test]
    fn checkpoint_combination_sends_local_save() {
        let (client, mut out_rx, _ev_rx) = registered_client();
        client
            .handle_message(ClientMessage::SaveYourselfRequest {
                save_type: SaveKind::Local,
                shutdown: false,
                interact_style: InteractStyle::None,
                fast: false,
                global: false,
            })
            .unwrap();
        assert!(matches!(
            out_rx.try_recv().unwrap(),
            ServerMessage::SaveYourself {
                save_type: SaveKind::Local,
                shutdown: false,
                ..
            }
        ));
    }

    #[test]
    fn nonsensical_request_combinations_are_ignored() {
        let (client, mut out_rx, mut ev_rx) = registered_client();
        // shutdown without global: confused caller.
        client
            .handle_message(ClientMessage::SaveYourselfRequest {
                save_type: SaveKind::Both,
                shutdown: true,
                interact_style: InteractStyle::Any,
                fast: false,
                global: false,
            })
            .unwrap();
        // global save without shutdown: also ignored.
        client
            .handle_message(ClientMessage::SaveYourselfRequest {
                save_type: SaveKind::Global,
                shutdown: false,
                interact_style: InteractStyle::Any,
                fast: false,
                global: true,
            })
            .unwrap();
        assert!(matches!(out_rx.try_recv(), Err(TryRecvError::Empty)));
        assert!(matches!(ev_rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn restart_style_hint_parses_card8_and_defaults_otherwise() {
        let (client, _out_rx, _ev_rx) = registered_client();
        client.set_properties(vec![SmProp::card8(PROP_RESTART_STYLE_HINT, 3)]);
        assert_eq!(client.restart_style_hint(), RestartStyle::Never);

        // Wrong-typed property falls back to the default.
        client.set_properties(vec![SmProp::text(PROP_RESTART_STYLE_HINT, "Never")]);
        assert_eq!(client.restart_style_hint(), RestartStyle::IfRunning);

        client.delete_properties(&[PROP_RESTART_STYLE_HINT.to_string()]);
        assert_eq!(client.restart_style_hint(), RestartStyle::IfRunning);
    }

    #[test]
    fn process_id_parses_decimal_text_and_defaults_to_zero() {
        let (client, _out_rx, _ev_rx) = registered_client();
        assert_eq!(client.process_id(), 0);

        client.set_properties(vec![SmProp::text(PROP_PROCESS_ID, "1234")]);
        assert_eq!(client.process_id(), 1234);

        client.set_properties(vec![SmProp::text(PROP_PROCESS_ID, "abc")]);
        assert_eq!(client.process_id(), 0);
    }

    #[test]
    fn save_produces_a_desktop_descriptor_with_quoted_command() {
        let (client, _out_rx, _ev_rx) = registered_client();
        client.set_properties(vec![
            SmProp::text(PROP_PROGRAM, "gedit"),
            SmProp::text_list(PROP_RESTART_COMMAND, &["gedit", "--resume", "my file.txt"]),
            SmProp::text_list(PROP_DISCARD_COMMAND, &["rm", "-f", "/tmp/state"]),
        ]);
        let saved = client.save().unwrap();
        assert_eq!(saved.name, "gedit");
        assert_eq!(saved.exec, "gedit --resume 'my file.txt'");
        assert_eq!(saved.discard_exec.as_deref(), Some("rm -f /tmp/state"));
        assert_eq!(saved.startup_id, "resumed-id");
    }

    #[test]
    fn save_is_refused_for_restart_never_or_missing_command() {
        let (client, _out_rx, _ev_rx) = registered_client();
        assert!(client.save().is_none()); // no RestartCommand yet

        client.set_properties(vec![
            SmProp::text_list(PROP_RESTART_COMMAND, &["gedit"]),
            SmProp::card8(PROP_RESTART_STYLE_HINT, 3),
        ]);
        assert!(client.save().is_none()); // RestartNever
    }

    #[test]
    fn close_connection_finishes_the_client() {
        let (client, _out_rx, mut ev_rx) = registered_client();
        client
            .handle_message(ClientMessage::CloseConnection {
                reasons: vec!["bye".to_string()],
            })
            .unwrap();
        assert_eq!(client.common().status(), ClientStatus::Finished);
        assert!(matches!(
            ev_rx.try_recv().unwrap(),
            ClientEvent::Disconnected { .. }
        ));
    }

    #[test]
    fn operations_without_a_connection_fail_with_not_registered() {
        let (client, out_rx, _ev_rx) = registered_client();
        drop(out_rx);
        assert!(matches!(
            client.query_end_session(EndSessionFlags::NONE),
            Err(ClientError::NotRegistered)
        ));
        assert!(matches!(
            client.end_session(EndSessionFlags::NONE),
            Err(ClientError::NotRegistered)
        ));
        assert!(matches!(client.stop(), Err(ClientError::NotRegistered)));
        assert!(matches!(
            client.cancel_end_session(),
            Err(ClientError::NotRegistered)
        ));
    }

    #[test]
    fn join_command_quotes_only_when_needed() {
        let args = vec![
            "prog".to_string(),
            "--flag=1".to_string(),
            "a b".to_string(),
            "it's".to_string(),
        ];
        assert_eq!(join_command(&args), "prog --flag=1 'a b' 'it'\\''s'");
    }
}
