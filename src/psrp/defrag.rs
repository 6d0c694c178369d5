//! PSRP fragment reassembly.
//!
//! Fragments are accumulated per stream, a stream being identified by the
//! owning shell, the data direction, the command and the ObjectId. ObjectIds
//! are only unique inside that scope: two shells routinely reuse the same
//! values.
//!
//! Sequencing policy:
//! - a stream never seen before expects FragmentId 0;
//! - a start fragment with FragmentId 0 always opens a new accumulation,
//!   abandoning whatever was buffered;
//! - any other FragmentId mismatch is reported and the fragment dropped,
//!   leaving the buffer as it was;
//! - once a stream completes, the next fragment on that key starts afresh
//!   whatever its FragmentId. Only the latest completed ObjectId of each
//!   (direction, command) scope is remembered; completed buffers are freed.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::logging::{component, LogScope};
use crate::pipeline::{Consumer, Flow, SessionContext, ShellKey};
use crate::psrp::fragment::{fragments, Fragment};

/// Input to the reassembler: fragment data with its context, or a change in
/// shell lifecycle observed by a context tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextUpdate {
    /// Transport blob holding one or more framed fragments.
    Data {
        context: SessionContext,
        bytes: Vec<u8>,
    },
    /// A fragment whose header was already decoded by the event source.
    Fragment {
        context: SessionContext,
        fragment: Fragment,
    },
    /// A Create request was seen; its ShellId is not known yet.
    OpenPendingShell { message_id: String },
    /// The CreateResponse for a pending shell named its ShellId.
    ResolvePendingShell { message_id: String, shell_id: String },
    /// Start tracking a shell first seen part way through its life.
    TrackShell { shell_id: String },
    /// The shell was deleted; its partial streams are released.
    CloseShell { shell_id: String },
}

/// A reassembled message payload, header still encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedMessage {
    pub context: SessionContext,
    pub object_id: u64,
    pub data: Vec<u8>,
}

/// Running counters, mostly for diagnostics and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DefragStats {
    pub fragments: u64,
    pub messages: u64,
    pub out_of_order: u64,
    pub abandoned: u64,
    pub malformed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StreamKey {
    flow: Flow,
    command_id: Option<String>,
    object_id: u64,
}

impl StreamKey {
    fn scope(&self) -> StreamScope {
        StreamScope {
            flow: self.flow,
            command_id: self.command_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StreamScope {
    flow: Flow,
    command_id: Option<String>,
}

#[derive(Debug)]
struct Assembly {
    next_fragment_id: u64,
    buffer: Vec<u8>,
}

impl Assembly {
    fn starting_at(next_fragment_id: u64) -> Self {
        Self {
            next_fragment_id,
            buffer: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct ShellStreams {
    /// Streams with fragments buffered.
    streams: HashMap<StreamKey, Assembly>,
    /// Latest completed ObjectId per scope.
    completed: HashMap<StreamScope, u64>,
}

impl ShellStreams {
    fn is_completed(&self, key: &StreamKey) -> bool {
        self.completed.get(&key.scope()) == Some(&key.object_id)
    }

    fn retained(&self) -> usize {
        self.streams.len() + self.completed.len()
    }
}

#[derive(Debug, Default)]
struct PendingShell {
    streams: ShellStreams,
    completed: Vec<CompletedMessage>,
}

#[derive(Debug, Default)]
struct DefragState {
    shells: HashMap<String, ShellStreams>,
    pending: HashMap<String, PendingShell>,
    stats: DefragStats,
}

/// What to do with an incoming fragment, decided before mutating.
enum Step {
    Begin,
    Fresh,
    Append,
    Abandon { buffered: usize, expected: u64 },
    Reject { expected: u64 },
}

fn streams_for<'a>(
    shells: &'a mut HashMap<String, ShellStreams>,
    pending: &'a mut HashMap<String, PendingShell>,
    shell: &ShellKey,
    log: &LogScope,
) -> &'a mut ShellStreams {
    match shell {
        ShellKey::Shell(id) => shells.entry(id.clone()).or_insert_with(|| {
            log::info!(
                target: log.target(),
                "UNTRACKED_SHELL_ADOPTED shell={} (fragment data arrived before any tracking)",
                id
            );
            ShellStreams::default()
        }),
        ShellKey::Pending(id) => {
            &mut pending
                .entry(id.clone())
                .or_insert_with(|| {
                    log::info!(
                        target: log.target(),
                        "UNTRACKED_PENDING_SHELL_ADOPTED message_id={}",
                        id
                    );
                    PendingShell::default()
                })
                .streams
        }
    }
}

/// Reassembles fragments into message payloads and forwards each completed
/// payload to the next stage.
pub struct FragmentReassembler {
    log: LogScope,
    state: Mutex<DefragState>,
    next: Arc<dyn Consumer<CompletedMessage>>,
}

impl FragmentReassembler {
    pub fn new(log: LogScope, next: Arc<dyn Consumer<CompletedMessage>>) -> Self {
        Self {
            log,
            state: Mutex::new(DefragState::default()),
            next,
        }
    }

    /// Reassembler logging under the default namespace.
    pub fn with_default_log(next: Arc<dyn Consumer<CompletedMessage>>) -> Self {
        Self::new(LogScope::component(component::DEFRAG), next)
    }

    pub fn stats(&self) -> DefragStats {
        self.state.lock().stats
    }

    pub fn has_shell(&self, shell_id: &str) -> bool {
        self.state.lock().shells.contains_key(shell_id)
    }

    /// Buffered streams plus completion markers held for a shell.
    pub fn retained_streams(&self, shell_id: &str) -> usize {
        self.state
            .lock()
            .shells
            .get(shell_id)
            .map_or(0, ShellStreams::retained)
    }

    pub fn pending_shell_count(&self) -> usize {
        self.state.lock().pending.len()
    }
}

impl Consumer<ContextUpdate> for FragmentReassembler {
    fn accept(&self, update: ContextUpdate) {
        let completed = {
            let mut state = self.state.lock();
            state.apply(update, &self.log)
        };
        for message in completed {
            self.next.accept(message);
        }
    }
}

impl DefragState {
    fn apply(&mut self, update: ContextUpdate, log: &LogScope) -> Vec<CompletedMessage> {
        let mut out = Vec::new();
        match update {
            ContextUpdate::Data { context, bytes } => {
                for parsed in fragments(&bytes) {
                    match parsed {
                        Ok(fragment) => self.push_fragment(&context, fragment, log, &mut out),
                        Err(e) => {
                            self.stats.malformed += 1;
                            log::error!(
                                target: log.target(),
                                "{} FRAGMENT_MALFORMED error={} blob_len={}",
                                context.log_context(),
                                e,
                                bytes.len()
                            );
                            break;
                        }
                    }
                }
            }
            ContextUpdate::Fragment { context, fragment } => {
                self.push_fragment(&context, fragment, log, &mut out)
            }
            ContextUpdate::OpenPendingShell { message_id } => {
                if self.pending.contains_key(&message_id) {
                    log::warn!(
                        target: log.target(),
                        "PENDING_SHELL_EXISTS message_id={}",
                        message_id
                    );
                } else {
                    log::debug!(target: log.target(), "PENDING_SHELL_OPENED message_id={}", message_id);
                    self.pending.insert(message_id, PendingShell::default());
                }
            }
            ContextUpdate::ResolvePendingShell {
                message_id,
                shell_id,
            } => self.resolve_pending(&message_id, &shell_id, log, &mut out),
            ContextUpdate::TrackShell { shell_id } => {
                if !self.shells.contains_key(&shell_id) {
                    log::debug!(target: log.target(), "SHELL_TRACKED shell={}", shell_id);
                    self.shells.insert(shell_id, ShellStreams::default());
                }
            }
            ContextUpdate::CloseShell { shell_id } => {
                if let Some(shell) = self.shells.remove(&shell_id) {
                    log::debug!(
                        target: log.target(),
                        "SHELL_RELEASED shell={} streams={}",
                        shell_id,
                        shell.retained()
                    );
                }
            }
        }
        out
    }

    fn push_fragment(
        &mut self,
        context: &SessionContext,
        fragment: Fragment,
        log: &LogScope,
        out: &mut Vec<CompletedMessage>,
    ) {
        self.stats.fragments += 1;
        let ctx = context.log_context().with_object(fragment.object_id);
        log::debug!(
            target: log.target(),
            "{} FRAGMENT fragment_id={} start={} end={} len={}",
            ctx,
            fragment.fragment_id,
            fragment.start,
            fragment.end,
            fragment.data.len()
        );
        log::trace!(
            target: log.target(),
            "{} FRAGMENT_DATA {}",
            ctx,
            hex::encode(&fragment.data)
        );

        let key = StreamKey {
            flow: context.flow,
            command_id: context.command_id.clone(),
            object_id: fragment.object_id,
        };
        let id = fragment.fragment_id;
        let Some(following) = id.checked_add(1) else {
            self.stats.malformed += 1;
            log::error!(target: log.target(), "{} FRAGMENT_ID_OVERFLOW fragment_id={}", ctx, id);
            return;
        };
        let shell = streams_for(&mut self.shells, &mut self.pending, &context.shell, log);

        // A stream opened before the command id was known continues under it.
        if key.command_id.is_some() && !shell.streams.contains_key(&key) && !shell.is_completed(&key) {
            let unscoped = StreamKey {
                command_id: None,
                ..key.clone()
            };
            if let Some(assembly) = shell.streams.remove(&unscoped) {
                log::debug!(target: log.target(), "{} STREAM_ADOPTED_BY_COMMAND", ctx);
                shell.streams.insert(key.clone(), assembly);
            }
        }

        let step = match shell.streams.get(&key) {
            None if shell.is_completed(&key) => Step::Fresh,
            None if id == 0 => Step::Begin,
            None => Step::Reject { expected: 0 },
            Some(assembly) => {
                if fragment.start && id == 0 && (assembly.next_fragment_id != 0 || !assembly.buffer.is_empty()) {
                    Step::Abandon {
                        buffered: assembly.buffer.len(),
                        expected: assembly.next_fragment_id,
                    }
                } else if id != assembly.next_fragment_id {
                    Step::Reject {
                        expected: assembly.next_fragment_id,
                    }
                } else {
                    Step::Append
                }
            }
        };

        let assembly = match step {
            Step::Reject { expected } => {
                self.stats.out_of_order += 1;
                log::error!(
                    target: log.target(),
                    "{} FRAGMENT_OUT_OF_ORDER expected={} got={}",
                    ctx,
                    expected,
                    id
                );
                return;
            }
            Step::Abandon { buffered, expected } => {
                self.stats.abandoned += 1;
                log::warn!(
                    target: log.target(),
                    "{} STREAM_ABANDONED buffered={} expected={}",
                    ctx,
                    buffered,
                    expected
                );
                shell.streams.insert(key.clone(), Assembly::starting_at(0));
                shell.streams.get_mut(&key)
            }
            Step::Fresh => {
                log::debug!(target: log.target(), "{} STREAM_RESTARTED_AFTER_COMPLETION", ctx);
                shell.completed.remove(&key.scope());
                shell.streams.insert(key.clone(), Assembly::starting_at(id));
                shell.streams.get_mut(&key)
            }
            Step::Begin => {
                shell.streams.insert(key.clone(), Assembly::starting_at(0));
                shell.streams.get_mut(&key)
            }
            Step::Append => shell.streams.get_mut(&key),
        };
        let Some(assembly) = assembly else {
            return;
        };
        assembly.buffer.extend_from_slice(&fragment.data);
        assembly.next_fragment_id = following;

        if !fragment.end {
            return;
        }

        let data = shell.streams.remove(&key).map(|a| a.buffer).unwrap_or_default();
        shell.completed.insert(key.scope(), key.object_id);
        self.stats.messages += 1;
        log::info!(
            target: log.target(),
            "{} END_FRAGMENT message_len={}",
            ctx,
            data.len()
        );

        let message = CompletedMessage {
            context: context.clone(),
            object_id: fragment.object_id,
            data,
        };
        match &context.shell {
            ShellKey::Shell(_) => out.push(message),
            ShellKey::Pending(message_id) => {
                if let Some(pending) = self.pending.get_mut(message_id) {
                    pending.completed.push(message);
                }
            }
        }
    }

    fn resolve_pending(
        &mut self,
        message_id: &str,
        shell_id: &str,
        log: &LogScope,
        out: &mut Vec<CompletedMessage>,
    ) {
        let Some(pending) = self.pending.remove(message_id) else {
            self.shells.entry(shell_id.to_string()).or_default();
            log::warn!(
                target: log.target(),
                "PENDING_SHELL_UNKNOWN message_id={} shell={} (tracking the shell; earlier messages are lost)",
                message_id,
                shell_id
            );
            return;
        };

        let target = self.shells.entry(shell_id.to_string()).or_default();
        for (scope, object_id) in pending.streams.completed {
            target.completed.entry(scope).or_insert(object_id);
        }
        for (key, state) in pending.streams.streams {
            if target.streams.contains_key(&key) {
                log::warn!(
                    target: log.target(),
                    "STREAM_COLLISION shell={} object_id={} (keeping the stream already tracked)",
                    shell_id,
                    key.object_id
                );
                continue;
            }
            target.streams.insert(key, state);
        }

        log::info!(
            target: log.target(),
            "PENDING_SHELL_RESOLVED message_id={} shell={} released={}",
            message_id,
            shell_id,
            pending.completed.len()
        );
        out.extend(pending.completed.into_iter().map(|m| CompletedMessage {
            context: m.context.resolved(shell_id),
            ..m
        }));
    }
}
