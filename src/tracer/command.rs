//! The command tracer: interprets decoded messages and produces
//! [`TraceEntry`]s.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::clixml::{self, decode_entities, PsValue, Rendering, ShapeAction, ShapeRegistry};
use crate::logging::{component, LogContext, LogScope};
use crate::pipeline::Consumer;
use crate::psrp::message::{Message, MessageType};
use crate::tracer::entry::{CommandLine, DisplayMode, TraceEntry, TraceKind};
use crate::tracer::host_call::{interpret, HostCall, HostEffect};
use crate::tracer::sink::TraceSink;

const PIPELINE_STATES: [&str; 7] = [
    "NotStarted",
    "Running",
    "Stopping",
    "Stopped",
    "Completed",
    "Failed",
    "Disconnected",
];

const RUNSPACE_POOL_STATES: [&str; 10] = [
    "BeforeOpen",
    "Opening",
    "Opened",
    "Closed",
    "Closing",
    "Broken",
    "NegotiationSent",
    "NegotiationSucceeded",
    "Connecting",
    "Disconnected",
];

/// Last stage of both pipelines.
pub struct CommandTracer {
    log: LogScope,
    sinks: Vec<Arc<dyn TraceSink>>,
    shapes: RwLock<ShapeRegistry>,
    /// Runspace pools whose next string output is a prompt.
    prompt_pending: Mutex<HashSet<Uuid>>,
}

impl CommandTracer {
    pub fn new(log: LogScope, sinks: Vec<Arc<dyn TraceSink>>) -> Self {
        Self {
            log,
            sinks,
            shapes: RwLock::new(ShapeRegistry::default()),
            prompt_pending: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_default_log(sinks: Vec<Arc<dyn TraceSink>>) -> Self {
        Self::new(LogScope::component(component::TRACER), sinks)
    }

    pub fn with_shapes(self, shapes: ShapeRegistry) -> Self {
        *self.shapes.write() = shapes;
        self
    }

    /// Register how output objects of `type_name` are rendered.
    pub fn register_shape(&self, type_name: &str, action: ShapeAction) {
        self.shapes.write().register(type_name, action);
    }

    fn emit(&self, ctx: &LogContext, entry: TraceEntry) {
        log::log!(
            target: self.log.target(),
            entry.level,
            "{} {} destination={} {}",
            ctx,
            entry.kind,
            entry.destination,
            entry.text
        );
        for sink in &self.sinks {
            sink.emit(&entry);
        }
    }

    /// Decode the payload document. Empty payloads and decode failures are
    /// logged and yield `None`.
    fn document(&self, message: &Message, ctx: &LogContext, empty_level: log::Level) -> Option<PsValue> {
        let text = match message.text() {
            Ok(text) => text,
            Err(e) => {
                crate::log_error!(self.log, ctx, "PAYLOAD_DECODE_FAILED", message_type = message.message_type.name(), error = e.to_string());
                return None;
            }
        };
        if text.trim().is_empty() {
            log::log!(
                target: self.log.target(),
                empty_level,
                "{} EMPTY_PAYLOAD message_type={} destination={}",
                ctx,
                message.message_type,
                message.destination
            );
            return None;
        }
        match clixml::parse(text) {
            Ok(doc) => Some(doc),
            Err(e) => {
                crate::log_error!(
                    self.log,
                    ctx,
                    "CLIXML_DECODE_FAILED",
                    message_type = message.message_type.name(),
                    error = e.to_string(),
                    data = text
                );
                None
            }
        }
    }

    fn create_pipeline(&self, message: &Message, ctx: &LogContext) {
        let Some(doc) = self.document(message, ctx, log::Level::Warn) else {
            return;
        };
        let Some(cmds) = doc
            .property("PowerShell")
            .and_then(|ps| ps.property("Cmds"))
            .and_then(PsValue::list)
        else {
            crate::log_warn!(self.log, ctx, "CREATE_PIPELINE_WITHOUT_COMMANDS");
            return;
        };

        let mut commands = Vec::new();
        for cmd in cmds {
            let Some(name) = cmd.property("Cmd").and_then(PsValue::as_str) else {
                continue;
            };
            if name == "prompt" {
                crate::log_debug!(self.log, ctx, "PROMPT_REQUESTED");
                self.prompt_pending.lock().insert(message.rpid);
                return;
            }
            let mut arguments = Vec::new();
            if let Some(args) = cmd.property("Args").and_then(PsValue::list) {
                for arg in args {
                    self.push_argument(arg, &mut arguments, ctx);
                }
            }
            commands.push(CommandLine {
                name: name.to_string(),
                arguments,
            });
        }
        if commands.is_empty() {
            return;
        }

        let text = commands
            .iter()
            .map(CommandLine::to_string)
            .collect::<Vec<_>>()
            .join(" | ");
        let mut entry = TraceEntry::for_message(message, TraceKind::Command, log::Level::Info, DisplayMode::Line, text);
        entry.commands = commands;
        self.emit(ctx, entry);
    }

    /// Render one `Args` entry (`N` parameter name, `V` value).
    fn push_argument(&self, arg: &PsValue, out: &mut Vec<String>, ctx: &LogContext) {
        if let Some(name) = arg.property("N").and_then(PsValue::as_str) {
            out.push(format!("-{}", name));
        }
        let Some(value) = arg.property("V") else {
            return;
        };
        match value {
            PsValue::Nil => {}
            PsValue::String(s) => out.push(quote(s)),
            PsValue::Bool(b) => out.push(if *b { "$true".into() } else { "$false".into() }),
            PsValue::Number { .. } | PsValue::Char(_) | PsValue::Guid(_) | PsValue::DateTime(_) | PsValue::Duration(_) => {
                out.push(value.to_string())
            }
            PsValue::Object(obj) => {
                if let Some(items) = value.list() {
                    let joined: Vec<String> = items.iter().map(PsValue::to_string).collect();
                    out.push(quote(&joined.join(",")));
                } else if let Some(s) = &obj.to_string {
                    out.push(quote(s));
                } else {
                    crate::log_warn!(
                        self.log,
                        ctx,
                        "UNSUPPORTED_ARGUMENT_TYPE",
                        type_name = obj.type_name().unwrap_or("").to_string()
                    );
                    out.push("[unsupported argument]".into());
                }
            }
            other => {
                crate::log_warn!(self.log, ctx, "UNSUPPORTED_ARGUMENT_TYPE", value = other.to_string());
                out.push("[unsupported argument]".into());
            }
        }
    }

    fn host_call(&self, message: &Message, ctx: &LogContext) {
        let Some(doc) = self.document(message, ctx, log::Level::Warn) else {
            return;
        };
        let Some(call) = HostCall::from_value(&doc) else {
            crate::log_error!(self.log, ctx, "HOST_CALL_WITHOUT_METHOD", message_type = message.message_type.name());
            return;
        };

        match interpret(&call) {
            HostEffect::Write { text, newline, level } => {
                let display = if newline {
                    DisplayMode::Line
                } else {
                    DisplayMode::Inline
                };
                let entry = TraceEntry::for_message(message, TraceKind::MethodCall, level, display, text);
                self.emit(ctx, entry);
            }
            HostEffect::Exit(code) => {
                let entry = TraceEntry::for_message(
                    message,
                    TraceKind::MethodCall,
                    log::Level::Info,
                    DisplayMode::Hidden,
                    format!("SetShouldExit({})", code),
                );
                self.emit(ctx, entry);
            }
            HostEffect::NoArguments => {
                crate::log_debug!(self.log, ctx, "HOST_CALL_WITHOUT_ARGUMENTS", method = call.name);
            }
            HostEffect::MissingArgument { index, count } => {
                crate::log_error!(self.log, ctx, "HOST_CALL_MISSING_ARGUMENT", method = call.name, index = index, count = count);
            }
            HostEffect::Unsupported(name) => {
                crate::log_warn!(self.log, ctx, "UNSUPPORTED_HOST_METHOD", method = name);
                let entry = TraceEntry::for_message(
                    message,
                    TraceKind::MethodCall,
                    log::Level::Warn,
                    DisplayMode::Line,
                    format!("[Unsupported host method: {}]", name),
                );
                self.emit(ctx, entry);
            }
        }
    }

    fn output(&self, message: &Message, ctx: &LogContext) {
        let Some(doc) = self.document(message, ctx, log::Level::Info) else {
            return;
        };

        if self.prompt_pending.lock().remove(&message.rpid) {
            let entry = match &doc {
                PsValue::String(prompt) => TraceEntry::for_message(
                    message,
                    TraceKind::Prompt,
                    log::Level::Info,
                    DisplayMode::Inline,
                    decode_entities(prompt).into_owned(),
                ),
                other => {
                    crate::log_warn!(self.log, ctx, "UNSUPPORTED_PROMPT_TYPE", value = other.to_string());
                    TraceEntry::for_message(
                        message,
                        TraceKind::Prompt,
                        log::Level::Warn,
                        DisplayMode::Line,
                        "[Unsupported prompt value]",
                    )
                }
            };
            self.emit(ctx, entry);
            return;
        }

        let rendering = self.shapes.read().render(&doc);
        match rendering {
            Rendering::Hidden => {
                crate::log_debug!(self.log, ctx, "OUTPUT_HIDDEN");
            }
            Rendering::Text(text) => {
                let entry = TraceEntry::for_message(message, TraceKind::Output, log::Level::Info, DisplayMode::Line, text);
                self.emit(ctx, entry);
            }
            Rendering::Unshaped { type_name, text } => {
                crate::log_warn!(self.log, ctx, "UNSHAPED_OUTPUT_TYPE", type_name = type_name);
                let entry = TraceEntry::for_message(message, TraceKind::Output, log::Level::Warn, DisplayMode::Line, text);
                self.emit(ctx, entry);
            }
        }
    }

    fn error_record(&self, message: &Message, ctx: &LogContext) {
        let Some(doc) = self.document(message, ctx, log::Level::Warn) else {
            return;
        };
        let text = render_error_record(&doc);
        let entry = TraceEntry::for_message(message, TraceKind::Error, log::Level::Warn, DisplayMode::Line, text);
        self.emit(ctx, entry);
    }

    fn informational(&self, message: &Message, ctx: &LogContext) {
        let Some(doc) = self.document(message, ctx, log::Level::Debug) else {
            return;
        };
        let (prefix, level) = match message.message_type {
            MessageType::WarningRecord => ("WARNING: ", log::Level::Warn),
            MessageType::VerboseRecord => ("VERBOSE: ", log::Level::Info),
            MessageType::DebugRecord => ("DEBUG: ", log::Level::Debug),
            _ => ("", log::Level::Info),
        };
        let body = if message.message_type == MessageType::InformationRecord {
            doc.property("MessageData")
                .map(|data| data.property("Message").unwrap_or(data).to_string())
        } else {
            doc.property("InformationalRecord_Message").map(PsValue::to_string)
        };
        let Some(body) = body else {
            crate::log_warn!(self.log, ctx, "RECORD_WITHOUT_MESSAGE", message_type = message.message_type.name());
            return;
        };
        let entry = TraceEntry::for_message(
            message,
            TraceKind::Record,
            level,
            DisplayMode::Line,
            format!("{}{}", prefix, body),
        );
        self.emit(ctx, entry);
    }

    fn state(&self, message: &Message, ctx: &LogContext) {
        let Some(doc) = self.document(message, ctx, log::Level::Debug) else {
            return;
        };
        let (label, property, names): (&str, &str, &[&str]) = match message.message_type {
            MessageType::PipelineState => ("PipelineState", "PipelineState", &PIPELINE_STATES[..]),
            _ => ("RunspacePoolState", "RunspaceState", &RUNSPACE_POOL_STATES[..]),
        };
        let Some(value) = doc.property(property).and_then(PsValue::as_i64) else {
            crate::log_warn!(self.log, ctx, "STATE_WITHOUT_VALUE", message_type = message.message_type.name());
            return;
        };
        let name = usize::try_from(value)
            .ok()
            .and_then(|i| names.get(i))
            .map(|n| n.to_string())
            .unwrap_or_else(|| format!("Unknown({})", value));

        let mut text = format!("{}: {}", label, name);
        if let Some(reason) = doc.property("ExceptionAsErrorRecord").filter(|r| !r.is_nil()) {
            text.push_str(&format!(" ({})", error_message(reason).unwrap_or_default()));
        }
        let entry = TraceEntry::for_message(message, TraceKind::State, log::Level::Debug, DisplayMode::Hidden, text);
        self.emit(ctx, entry);
    }
}

impl Consumer<Message> for CommandTracer {
    fn accept(&self, message: Message) {
        let ctx = message
            .context
            .log_context()
            .with_runspace(message.rpid, message.pid);
        match message.message_type {
            MessageType::CreatePipeline => self.create_pipeline(&message, &ctx),
            MessageType::PipelineHostCall | MessageType::RunspacePoolHostCall => self.host_call(&message, &ctx),
            MessageType::PipelineOutput => self.output(&message, &ctx),
            MessageType::ErrorRecord => self.error_record(&message, &ctx),
            MessageType::WarningRecord
            | MessageType::VerboseRecord
            | MessageType::DebugRecord
            | MessageType::InformationRecord => self.informational(&message, &ctx),
            MessageType::PipelineState | MessageType::RunspacePoolState => self.state(&message, &ctx),
            MessageType::Unknown(tag) => {
                crate::log_warn!(
                    self.log,
                    ctx,
                    "UNRECOGNISED_MESSAGE_TYPE",
                    tag = format!("0x{:08x}", tag),
                    destination = message.destination.to_string(),
                    payload_len = message.data.len()
                );
            }
            other => {
                crate::log_info!(
                    self.log,
                    ctx,
                    "MESSAGE",
                    message_type = other.name(),
                    destination = message.destination.to_string(),
                    payload_len = message.data.len()
                );
            }
        }
    }
}

/// Quote values containing spaces, as they would be typed.
fn quote(value: &str) -> String {
    if value.trim().contains(' ') {
        format!("\"{}\"", value)
    } else {
        value.to_string()
    }
}

fn error_message(record: &PsValue) -> Option<String> {
    let obj = record.as_object()?;
    obj.to_string
        .clone()
        .filter(|s| !s.is_empty())
        .or_else(|| {
            record
                .property("Exception")
                .and_then(|e| e.property("Message"))
                .map(PsValue::to_string)
        })
}

/// Error text followed by the category and error id lines, as the console
/// shows them.
fn render_error_record(doc: &PsValue) -> String {
    let mut text = error_message(doc).unwrap_or_else(|| "[error record without message]".into());
    if let Some(category) = doc.property("ErrorCategory_Message").and_then(PsValue::as_str) {
        text.push_str(&format!("\n    + CategoryInfo          : {}", category));
    }
    if let Some(id) = doc.property("FullyQualifiedErrorId").and_then(PsValue::as_str) {
        text.push_str(&format!("\n    + FullyQualifiedErrorId : {}", id));
    }
    text
}
