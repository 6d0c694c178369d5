//! Trace entries: the decoded, printable output of the command tracer.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use uuid::Uuid;

use crate::psrp::message::{Destination, Message};

/// What a trace entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    /// A pipeline was created to run one or more commands.
    Command,
    /// A host method invoked by the remote pipeline (console writes).
    MethodCall,
    /// A value written to the pipeline output.
    Output,
    /// The prompt string returned by the remote `prompt` function.
    Prompt,
    Error,
    /// Warning, verbose, debug and information records.
    Record,
    /// Pipeline or runspace pool state change.
    State,
}

impl fmt::Display for TraceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TraceKind::Command => "COMMAND",
            TraceKind::MethodCall => "METHOD_CALL",
            TraceKind::Output => "OUTPUT",
            TraceKind::Prompt => "PROMPT",
            TraceKind::Error => "ERROR",
            TraceKind::Record => "RECORD",
            TraceKind::State => "STATE",
        };
        f.write_str(name)
    }
}

/// How an entry appears on the interactive stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayMode {
    /// Structured log only.
    Hidden,
    /// Followed by a newline.
    Line,
    /// Written without a trailing newline (prompts, `Write` host calls).
    Inline,
}

/// One command of a pipeline, with its rendered arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandLine {
    pub name: String,
    pub arguments: Vec<String>,
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for arg in &self.arguments {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(serialize_with = "serialize_level")]
    pub level: log::Level,
    pub kind: TraceKind,
    pub text: String,
    pub display: DisplayMode,
    pub rpid: Uuid,
    pub pid: Option<Uuid>,
    pub destination: Destination,
    pub shell_id: String,
    pub command_id: Option<String>,
    /// Set for [`TraceKind::Command`] entries.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<CommandLine>,
}

impl TraceEntry {
    /// An entry correlated with the header of `message`.
    pub fn for_message(
        message: &Message,
        kind: TraceKind,
        level: log::Level,
        display: DisplayMode,
        text: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            kind,
            text: text.into(),
            display,
            rpid: message.rpid,
            pid: message.pid,
            destination: message.destination,
            shell_id: message.context.shell.to_string(),
            command_id: message.context.command_id.clone(),
            commands: Vec::new(),
        }
    }
}

impl fmt::Display for TraceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} rpid={}", self.kind, self.rpid)?;
        if let Some(pid) = &self.pid {
            write!(f, " pid={}", pid)?;
        }
        write!(f, " destination={}: {}", self.destination, self.text)
    }
}

fn serialize_level<S: Serializer>(level: &log::Level, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(level.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Flow, SessionContext};
    use crate::psrp::message::MessageType;

    fn message() -> Message {
        Message {
            destination: Destination::Server,
            message_type: MessageType::CreatePipeline,
            rpid: Uuid::from_u128(1),
            pid: Some(Uuid::from_u128(2)),
            data: Vec::new(),
            context: SessionContext::shell("S1", Flow::ClientToServer).with_command(Some("C1")),
            object_id: 1,
        }
    }

    #[test]
    fn test_entry_carries_correlation() {
        let entry = TraceEntry::for_message(
            &message(),
            TraceKind::Command,
            log::Level::Info,
            DisplayMode::Line,
            "Get-Process",
        );
        assert_eq!(entry.shell_id, "S1");
        assert_eq!(entry.command_id.as_deref(), Some("C1"));
        assert_eq!(entry.pid, Some(Uuid::from_u128(2)));
        assert!(entry.to_string().starts_with("COMMAND rpid=00000000-0000-0000-0000-000000000001"));
        assert!(entry.to_string().ends_with("destination=Server: Get-Process"));
    }

    #[test]
    fn test_entry_serializes() {
        let entry = TraceEntry::for_message(
            &message(),
            TraceKind::Output,
            log::Level::Warn,
            DisplayMode::Hidden,
            "x",
        );
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["level"], "WARN");
        assert_eq!(json["kind"], "output");
        assert_eq!(json["destination"], "server");
        assert!(json.get("commands").is_none());
    }

    #[test]
    fn test_command_line_display() {
        let line = CommandLine {
            name: "Get-ChildItem".into(),
            arguments: vec!["-Path".into(), "C:\\".into()],
        };
        assert_eq!(line.to_string(), "Get-ChildItem -Path C:\\");
    }
}
