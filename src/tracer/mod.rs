//! Command tracing: the interpretation of decoded PSRP messages into a
//! human-readable trace, and the sinks that receive it.

pub mod command;
pub mod entry;
pub mod host_call;
pub mod sink;

pub use command::CommandTracer;
pub use entry::{CommandLine, DisplayMode, TraceEntry, TraceKind};
pub use host_call::{HostCall, HostEffect, HostMethod};
pub use sink::{ConsoleSink, JsonLinesSink, MemorySink, TraceSink};
