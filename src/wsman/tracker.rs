//! WS-Man context tracking (pipeline A).
//!
//! Requests and responses of the PowerShell WS-Man plugin are matched
//! through `MessageID`/`RelatesTo` to learn which shell and command each
//! piece of stream data belongs to. Envelopes for other resources are
//! dropped before any state is touched.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use roxmltree::{Document, Node};

use crate::error::SoapError;
use crate::logging::{component, LogContext, LogScope};
use crate::pipeline::{Consumer, Flow, SessionContext};
use crate::psrp::defrag::ContextUpdate;
use crate::wsman::compression::{decode_stream, Decompressor};
use crate::wsman::envelope::{
    child, children, decode_base64, ns, path, selector, text, Action, EnvelopeHeader, COMMAND_STATE_DONE,
    PS_RESOURCE_URI,
};
use crate::wsman::soap::{SoapMessage, TransferKey};
use crate::{log_error, log_info, log_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellState {
    Open,
    Closed,
}

/// What the tracker knows about one shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagementContext {
    pub shell_id: String,
    pub state: ShellState,
    /// Commands currently running in the shell.
    pub commands: HashSet<String>,
}

impl ManagementContext {
    fn open(shell_id: &str) -> Self {
        Self {
            shell_id: shell_id.to_string(),
            state: ShellState::Open,
            commands: HashSet::new(),
        }
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    shells: HashMap<String, ManagementContext>,
    /// MessageIDs of Create requests awaiting their response.
    create_msgs: HashSet<String>,
    /// Request MessageID to ShellId, per request kind.
    command_msgs: HashMap<String, String>,
    receive_msgs: HashMap<String, String>,
    delete_msgs: HashMap<String, String>,
    /// CommandId to ShellId.
    commands: HashMap<String, String>,
}

struct Envelope<'a, 'input> {
    key: &'a TransferKey,
    header: EnvelopeHeader,
    root: Node<'a, 'input>,
}

impl<'a, 'input> Envelope<'a, 'input> {
    fn body(&self, steps: &[(&str, &str)]) -> Option<Node<'a, 'input>> {
        child(self.root, ns::SOAP, "Body").and_then(|body| path(body, steps))
    }

    fn shell_id(&self) -> Result<&str, SoapError> {
        self.header
            .shell_id
            .as_deref()
            .ok_or(SoapError::MissingElement("ShellId selector"))
    }

    fn message_id(&self) -> Result<&str, SoapError> {
        self.header
            .message_id
            .as_deref()
            .ok_or(SoapError::MissingElement("a:MessageID"))
    }
}

pub struct ManagementContextTracker {
    log: LogScope,
    compressed_streams: bool,
    decompressor: Option<Arc<dyn Decompressor>>,
    state: Mutex<TrackerState>,
    next: Arc<dyn Consumer<ContextUpdate>>,
}

impl ManagementContextTracker {
    pub fn new(log: LogScope, next: Arc<dyn Consumer<ContextUpdate>>) -> Self {
        Self {
            log,
            compressed_streams: true,
            decompressor: None,
            state: Mutex::new(TrackerState::default()),
            next,
        }
    }

    pub fn with_default_log(next: Arc<dyn Consumer<ContextUpdate>>) -> Self {
        Self::new(LogScope::component(component::WSMAN), next)
    }

    /// Whether stream data carries compression block framing.
    pub fn with_compressed_streams(mut self, compressed: bool) -> Self {
        self.compressed_streams = compressed;
        self
    }

    pub fn with_decompressor(mut self, decompressor: Arc<dyn Decompressor>) -> Self {
        self.decompressor = Some(decompressor);
        self
    }

    pub fn context_count(&self) -> usize {
        self.state.lock().shells.len()
    }

    pub fn context(&self, shell_id: &str) -> Option<ManagementContext> {
        self.state.lock().shells.get(shell_id).cloned()
    }

    pub fn shell_state(&self, shell_id: &str) -> Option<ShellState> {
        self.state.lock().shells.get(shell_id).map(|c| c.state)
    }

    pub fn is_tracked_command(&self, command_id: &str) -> bool {
        self.state.lock().commands.contains_key(command_id)
    }

    fn handle(&self, state: &mut TrackerState, message: &SoapMessage) -> Result<Vec<ContextUpdate>, SoapError> {
        let doc = Document::parse(&message.document)?;
        let header = EnvelopeHeader::read(doc.root_element())?;

        let Some(action) = Action::from_uri(&header.action) else {
            log::debug!(
                target: self.log.target(),
                "UNRELATED_ACTION key={} action={}",
                message.key,
                header.action
            );
            return Ok(Vec::new());
        };
        if !header.may_be_powershell() {
            log::debug!(
                target: self.log.target(),
                "UNRELATED_RESOURCE key={} action={:?} resource_uri={:?}",
                message.key,
                action,
                header.resource_uri
            );
            return Ok(Vec::new());
        }

        let envelope = Envelope {
            key: &message.key,
            header,
            root: doc.root_element(),
        };
        let mut out = Vec::new();
        match action {
            Action::Create => self.create(state, &envelope, &mut out)?,
            Action::CreateResponse => self.create_response(state, &envelope, &mut out)?,
            Action::Delete => self.delete(state, &envelope)?,
            Action::DeleteResponse => self.delete_response(state, &envelope, &mut out),
            Action::Fault => self.fault(state, &envelope),
            Action::Command => self.command(state, &envelope, &mut out)?,
            Action::CommandResponse => self.command_response(state, &envelope)?,
            Action::Send => self.send(state, &envelope, &mut out)?,
            Action::Receive => self.receive(state, &envelope, &mut out)?,
            Action::ReceiveResponse => self.receive_response(state, &envelope, &mut out)?,
            Action::Signal => {
                let code = envelope
                    .body(&[(ns::SHELL, "Signal"), (ns::SHELL, "Code")])
                    .and_then(text);
                log::debug!(
                    target: self.log.target(),
                    "SIGNAL key={} shell={:?} code={:?}",
                    envelope.key,
                    envelope.header.shell_id,
                    code
                );
            }
        }
        Ok(out)
    }

    fn create(&self, state: &mut TrackerState, env: &Envelope, out: &mut Vec<ContextUpdate>) -> Result<(), SoapError> {
        if !env.header.is_powershell() {
            log::debug!(
                target: self.log.target(),
                "CREATE_NOT_POWERSHELL key={} resource_uri={:?}",
                env.key,
                env.header.resource_uri
            );
            return Ok(());
        }
        let shell = env
            .body(&[(ns::SHELL, "Shell")])
            .ok_or(SoapError::MissingElement("rsp:Shell"))?;
        let message_id = env.message_id()?;
        let creation = child(shell, ns::POWERSHELL, "creationXml")
            .and_then(text)
            .map(|xml| decode_base64(xml, "creationXml"))
            .transpose()?;

        if !state.create_msgs.insert(message_id.to_string()) {
            log::warn!(
                target: self.log.target(),
                "DUPLICATE_CREATE_MESSAGE_ID message_id={}",
                message_id
            );
        }
        log::info!(
            target: self.log.target(),
            "SHELL_CREATE_PENDING key={} message_id={}",
            env.key,
            message_id
        );
        out.push(ContextUpdate::OpenPendingShell {
            message_id: message_id.to_string(),
        });
        if let Some(bytes) = creation {
            out.push(ContextUpdate::Data {
                context: SessionContext::pending(message_id),
                bytes,
            });
        }
        Ok(())
    }

    fn create_response(
        &self,
        state: &mut TrackerState,
        env: &Envelope,
        out: &mut Vec<ContextUpdate>,
    ) -> Result<(), SoapError> {
        let pending = env
            .header
            .relates_to
            .as_deref()
            .filter(|r| state.create_msgs.contains(*r));
        let params = env
            .body(&[(ns::TRANSFER, "ResourceCreated"), (ns::ADDRESSING, "ReferenceParameters")])
            .ok_or(SoapError::MissingElement("x:ResourceCreated/a:ReferenceParameters"))?;
        let body_uri = child(params, ns::WSMAN, "ResourceURI").and_then(text);
        let is_powershell = body_uri == Some(PS_RESOURCE_URI);

        match (pending, is_powershell) {
            (None, false) => {
                log::debug!(
                    target: self.log.target(),
                    "UNRELATED_CREATE_RESPONSE key={} resource_uri={:?}",
                    env.key,
                    body_uri
                );
                return Ok(());
            }
            (Some(message_id), false) => {
                log::warn!(
                    target: self.log.target(),
                    "CREATE_RESPONSE_RESOURCE_MISMATCH message_id={} resource_uri={:?}",
                    message_id,
                    body_uri
                );
            }
            (None, true) => {
                log::warn!(
                    target: self.log.target(),
                    "CREATE_RESPONSE_WITHOUT_REQUEST key={} relates_to={:?}",
                    env.key,
                    env.header.relates_to
                );
            }
            (Some(_), true) => {}
        }

        let shell_id = child(params, ns::WSMAN, "SelectorSet")
            .and_then(|set| selector(set, "ShellId"))
            .ok_or(SoapError::MissingElement("ShellId selector"))?;
        self.open_shell(state, &shell_id);
        match pending.map(str::to_string) {
            Some(message_id) => {
                state.create_msgs.remove(&message_id);
                log_info!(
                    self.log,
                    LogContext::for_shell(&shell_id),
                    "SHELL_CREATED",
                    message_id = message_id
                );
                out.push(ContextUpdate::ResolvePendingShell { message_id, shell_id });
            }
            None => {
                log_info!(self.log, LogContext::for_shell(&shell_id), "SHELL_CREATED");
                out.push(ContextUpdate::TrackShell { shell_id });
            }
        }
        Ok(())
    }

    fn delete(&self, state: &mut TrackerState, env: &Envelope) -> Result<(), SoapError> {
        let shell_id = env.shell_id()?;
        if !state.shells.contains_key(shell_id) && !env.header.is_powershell() {
            log::debug!(
                target: self.log.target(),
                "UNRELATED_DELETE key={} shell={}",
                env.key,
                shell_id
            );
            return Ok(());
        }
        let message_id = env.message_id()?;
        self.track_request(&mut state.delete_msgs, "Delete", message_id, shell_id);
        Ok(())
    }

    fn delete_response(&self, state: &mut TrackerState, env: &Envelope, out: &mut Vec<ContextUpdate>) {
        let Some(shell_id) = self.related_request(&mut state.delete_msgs, env) else {
            return;
        };
        if let Some(context) = state.shells.get_mut(&shell_id) {
            context.state = ShellState::Closed;
            for command in context.commands.drain() {
                state.commands.remove(&command);
            }
        }
        log_info!(self.log, LogContext::for_shell(&shell_id), "SHELL_DELETED");
        out.push(ContextUpdate::CloseShell { shell_id });
    }

    fn fault(&self, state: &mut TrackerState, env: &Envelope) {
        let reason = env
            .body(&[(ns::SOAP, "Fault"), (ns::SOAP, "Reason"), (ns::SOAP, "Text")])
            .and_then(text)
            .unwrap_or("");
        let Some(relates_to) = env.header.relates_to.as_deref() else {
            log::debug!(target: self.log.target(), "UNRELATED_FAULT key={} reason={}", env.key, reason);
            return;
        };
        let shell = if state.create_msgs.remove(relates_to) {
            Some(format!("pending:{}", relates_to))
        } else {
            state
                .command_msgs
                .remove(relates_to)
                .or_else(|| state.receive_msgs.remove(relates_to))
                .or_else(|| state.delete_msgs.remove(relates_to))
        };
        match shell {
            Some(shell) => {
                log_warn!(
                    self.log,
                    LogContext::for_shell(&shell),
                    "WSMAN_FAULT",
                    relates_to = relates_to,
                    reason = reason
                );
            }
            None => {
                log::debug!(target: self.log.target(), "UNRELATED_FAULT key={} reason={}", env.key, reason);
            }
        }
    }

    fn command(&self, state: &mut TrackerState, env: &Envelope, out: &mut Vec<ContextUpdate>) -> Result<(), SoapError> {
        let shell_id = env.shell_id()?;
        if !self.admit_shell(state, env, shell_id, "Command", out) {
            return Ok(());
        }
        let command_line = env
            .body(&[(ns::SHELL, "CommandLine")])
            .ok_or(SoapError::MissingElement("rsp:CommandLine"))?;
        let command_id = command_line.attribute("CommandId");
        let message_id = env.message_id()?;

        if let Some(arguments) = child(command_line, ns::SHELL, "Arguments").and_then(text) {
            let bytes = decode_base64(arguments, "rsp:Arguments")?;
            out.push(ContextUpdate::Data {
                context: SessionContext::shell(shell_id, Flow::ClientToServer).with_command(command_id),
                bytes,
            });
        } else {
            log_error!(
                self.log,
                LogContext::for_shell(shell_id),
                "COMMAND_WITHOUT_ARGUMENTS",
                message_id = message_id
            );
        }

        self.track_request(&mut state.command_msgs, "Command", message_id, shell_id);
        if let Some(command_id) = command_id {
            self.track_command(state, command_id, shell_id);
        }
        Ok(())
    }

    fn command_response(&self, state: &mut TrackerState, env: &Envelope) -> Result<(), SoapError> {
        let command_id = env
            .body(&[(ns::SHELL, "CommandResponse"), (ns::SHELL, "CommandId")])
            .and_then(text);
        let Some(shell_id) = self.related_request(&mut state.command_msgs, env) else {
            return Ok(());
        };
        let command_id = command_id.ok_or(SoapError::MissingElement("rsp:CommandId"))?;
        self.track_command(state, command_id, &shell_id);
        log_info!(
            self.log,
            LogContext::for_shell(&shell_id).with_command(Some(command_id)),
            "COMMAND_STARTED"
        );
        Ok(())
    }

    fn send(&self, state: &mut TrackerState, env: &Envelope, out: &mut Vec<ContextUpdate>) -> Result<(), SoapError> {
        let shell_id = env.shell_id()?;
        if !self.admit_shell(state, env, shell_id, "Send", out) {
            return Ok(());
        }
        let send = env
            .body(&[(ns::SHELL, "Send")])
            .ok_or(SoapError::MissingElement("rsp:Send"))?;
        for stream in children(send, ns::SHELL, "Stream") {
            if let Some(command_id) = stream.attribute("CommandId") {
                if !state.commands.contains_key(command_id) {
                    self.track_command(state, command_id, shell_id);
                }
            }
        }
        self.push_streams(send, shell_id, Flow::ClientToServer, out);
        Ok(())
    }

    fn receive(&self, state: &mut TrackerState, env: &Envelope, out: &mut Vec<ContextUpdate>) -> Result<(), SoapError> {
        let shell_id = env.shell_id()?;
        if !self.admit_shell(state, env, shell_id, "Receive", out) {
            return Ok(());
        }
        let message_id = env.message_id()?;
        self.track_request(&mut state.receive_msgs, "Receive", message_id, shell_id);

        if let Some(receive) = env.body(&[(ns::SHELL, "Receive")]) {
            for desired in children(receive, ns::SHELL, "DesiredStream") {
                let Some(command_id) = desired.attribute("CommandId") else {
                    continue;
                };
                if !state.commands.contains_key(command_id) {
                    log_info!(
                        self.log,
                        LogContext::for_shell(shell_id).with_command(Some(command_id)),
                        "UNTRACKED_COMMAND_ADOPTED"
                    );
                    self.track_command(state, command_id, shell_id);
                }
            }
        }
        Ok(())
    }

    fn receive_response(
        &self,
        state: &mut TrackerState,
        env: &Envelope,
        out: &mut Vec<ContextUpdate>,
    ) -> Result<(), SoapError> {
        let Some(shell_id) = self.related_request(&mut state.receive_msgs, env) else {
            return Ok(());
        };
        let response = env
            .body(&[(ns::SHELL, "ReceiveResponse")])
            .ok_or(SoapError::MissingElement("rsp:ReceiveResponse"))?;

        let mut finished = Vec::new();
        for command_state in children(response, ns::SHELL, "CommandState") {
            let exit_code = child(command_state, ns::SHELL, "ExitCode").and_then(text);
            let done = command_state.attribute("State") == Some(COMMAND_STATE_DONE) || exit_code.is_some();
            if let (Some(command_id), true) = (command_state.attribute("CommandId"), done) {
                log_info!(
                    self.log,
                    LogContext::for_shell(&shell_id).with_command(Some(command_id)),
                    "COMMAND_DONE",
                    exit_code = exit_code
                );
                finished.push(command_id);
            }
        }

        self.push_streams(response, &shell_id, Flow::ServerToClient, out);

        for command_id in finished {
            state.commands.remove(command_id);
            if let Some(context) = state.shells.get_mut(&shell_id) {
                context.commands.remove(command_id);
            }
        }
        Ok(())
    }

    /// Queue the fragment data of every `rsp:Stream` under `parent`. A
    /// stream that fails to decode is dropped on its own.
    fn push_streams(&self, parent: Node<'_, '_>, shell_id: &str, flow: Flow, out: &mut Vec<ContextUpdate>) {
        for stream in children(parent, ns::SHELL, "Stream") {
            if let Err(e) = self.push_stream(stream, shell_id, flow, out) {
                log_error!(
                    self.log,
                    LogContext::for_shell(shell_id).with_command(stream.attribute("CommandId")),
                    "STREAM_DROPPED",
                    stream = stream.attribute("Name"),
                    error = e.to_string()
                );
            }
        }
    }

    fn push_stream(
        &self,
        stream: Node<'_, '_>,
        shell_id: &str,
        flow: Flow,
        out: &mut Vec<ContextUpdate>,
    ) -> Result<(), SoapError> {
        // End-of-stream markers carry no content.
        let Some(encoded) = text(stream) else {
            return Ok(());
        };
        let raw = decode_base64(encoded, "rsp:Stream")?;
        let bytes = if self.compressed_streams {
            decode_stream(&raw, self.decompressor.as_deref())?
        } else {
            raw
        };
        out.push(ContextUpdate::Data {
            context: SessionContext::shell(shell_id, flow).with_command(stream.attribute("CommandId")),
            bytes,
        });
        Ok(())
    }

    /// Decide whether a request addressed to `shell_id` concerns a
    /// PowerShell shell, opening a context for an unseen one.
    fn admit_shell(
        &self,
        state: &mut TrackerState,
        env: &Envelope,
        shell_id: &str,
        request: &str,
        out: &mut Vec<ContextUpdate>,
    ) -> bool {
        match state.shells.get(shell_id).map(|c| c.state) {
            Some(ShellState::Open) => true,
            known => {
                if !env.header.is_powershell() && known.is_none() {
                    log::debug!(
                        target: self.log.target(),
                        "UNRELATED_{} key={} shell={}",
                        request.to_ascii_uppercase(),
                        env.key,
                        shell_id
                    );
                    return false;
                }
                log_info!(
                    self.log,
                    LogContext::for_shell(shell_id),
                    "UNTRACKED_SHELL_STARTED",
                    request = request
                );
                self.open_shell(state, shell_id);
                out.push(ContextUpdate::TrackShell {
                    shell_id: shell_id.to_string(),
                });
                true
            }
        }
    }

    fn open_shell(&self, state: &mut TrackerState, shell_id: &str) {
        if let Some(previous) = state.shells.get(shell_id) {
            log_warn!(
                self.log,
                LogContext::for_shell(shell_id),
                "SHELL_ID_REUSED",
                previous_state = previous.state,
                commands = previous.commands.len()
            );
            for command in &previous.commands {
                state.commands.remove(command);
            }
        }
        state
            .shells
            .insert(shell_id.to_string(), ManagementContext::open(shell_id));
    }

    fn track_command(&self, state: &mut TrackerState, command_id: &str, shell_id: &str) {
        if let Some(previous) = state.commands.get(command_id) {
            if previous != shell_id {
                log_warn!(
                    self.log,
                    LogContext::for_shell(shell_id).with_command(Some(command_id)),
                    "COMMAND_ID_REBOUND",
                    previous_shell = previous
                );
                if let Some(context) = state.shells.get_mut(previous.as_str()) {
                    context.commands.remove(command_id);
                }
            }
        }
        state
            .commands
            .insert(command_id.to_string(), shell_id.to_string());
        if let Some(context) = state.shells.get_mut(shell_id) {
            context.commands.insert(command_id.to_string());
        }
    }

    fn track_request(&self, requests: &mut HashMap<String, String>, kind: &str, message_id: &str, shell_id: &str) {
        if let Some(previous) = requests.insert(message_id.to_string(), shell_id.to_string()) {
            log_warn!(
                self.log,
                LogContext::for_shell(shell_id),
                "REQUEST_ID_REUSED",
                kind = kind,
                message_id = message_id,
                previous_shell = previous
            );
        }
    }

    /// The shell of the request a response relates to, if it was tracked.
    fn related_request(&self, requests: &mut HashMap<String, String>, env: &Envelope) -> Option<String> {
        let shell = env
            .header
            .relates_to
            .as_deref()
            .and_then(|r| requests.remove(r));
        if shell.is_none() {
            log::debug!(
                target: self.log.target(),
                "UNRELATED_RESPONSE key={} action={} relates_to={:?}",
                env.key,
                env.header.action,
                env.header.relates_to
            );
        }
        shell
    }
}

impl Consumer<SoapMessage> for ManagementContextTracker {
    fn accept(&self, message: SoapMessage) {
        let updates = {
            let mut state = self.state.lock();
            match self.handle(&mut state, &message) {
                Ok(updates) => updates,
                Err(e) => {
                    log::error!(
                        target: self.log.target(),
                        "ENVELOPE_DROPPED key={} error={}",
                        message.key,
                        e
                    );
                    log::trace!(target: self.log.target(), "ENVELOPE_DOCUMENT {}", message.document);
                    return;
                }
            }
        };
        for update in updates {
            self.next.accept(update);
        }
    }
}
