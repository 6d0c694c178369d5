//! Session context shared between the context trackers and the fragment
//! reassembler.
//!
//! A context names the shell (or the not-yet-identified shell of a pending
//! Create request), the command within it, and the direction of the data.

use std::fmt;

use serde::Serialize;

use crate::logging::LogContext;

/// Identity of the shell a fragment belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ShellKey {
    /// A shell whose ShellId is known.
    Shell(String),
    /// A shell being created, tracked by the MessageID of its Create request
    /// until the CreateResponse reveals the ShellId.
    Pending(String),
}

impl ShellKey {
    pub fn id(&self) -> &str {
        match self {
            ShellKey::Shell(id) | ShellKey::Pending(id) => id,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, ShellKey::Pending(_))
    }
}

impl fmt::Display for ShellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShellKey::Shell(id) => f.write_str(id),
            ShellKey::Pending(id) => write!(f, "pending:{}", id),
        }
    }
}

/// Direction of remoting data relative to the remote shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Flow {
    ClientToServer,
    ServerToClient,
    /// The event source does not say.
    Unknown,
}

/// The shell/command pair that owns a stream of fragments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SessionContext {
    pub shell: ShellKey,
    pub command_id: Option<String>,
    pub flow: Flow,
}

impl SessionContext {
    pub fn shell(shell_id: &str, flow: Flow) -> Self {
        Self {
            shell: ShellKey::Shell(shell_id.to_string()),
            command_id: None,
            flow,
        }
    }

    pub fn pending(message_id: &str) -> Self {
        Self {
            shell: ShellKey::Pending(message_id.to_string()),
            command_id: None,
            flow: Flow::ClientToServer,
        }
    }

    pub fn with_command(mut self, command_id: Option<&str>) -> Self {
        self.command_id = command_id.map(|c| c.to_string());
        self
    }

    /// Same command and flow, under a resolved shell id.
    pub fn resolved(&self, shell_id: &str) -> Self {
        Self {
            shell: ShellKey::Shell(shell_id.to_string()),
            command_id: self.command_id.clone(),
            flow: self.flow,
        }
    }

    pub fn log_context(&self) -> LogContext {
        LogContext::for_shell(&self.shell.to_string()).with_command(self.command_id.as_deref())
    }
}
