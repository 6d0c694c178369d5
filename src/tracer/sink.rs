//! Trace entry sinks.

use std::io::{self, Write};

use parking_lot::Mutex;

use crate::tracer::entry::{DisplayMode, TraceEntry};

/// Receives every trace entry the tracer produces.
pub trait TraceSink: Send + Sync {
    fn emit(&self, entry: &TraceEntry);
}

/// Approximates what the remote session's user saw on their console.
pub struct ConsoleSink {
    out: Mutex<Box<dyn Write + Send>>,
}

impl ConsoleSink {
    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }
}

impl TraceSink for ConsoleSink {
    fn emit(&self, entry: &TraceEntry) {
        let mut out = self.out.lock();
        let result = match entry.display {
            DisplayMode::Hidden => return,
            DisplayMode::Line => writeln!(out, "{}", entry.text),
            DisplayMode::Inline => write!(out, "{}", entry.text).and_then(|_| out.flush()),
        };
        if let Err(e) = result {
            log::warn!(target: "remoteps::tracer", "CONSOLE_WRITE_FAILED error={}", e);
        }
    }
}

/// Writes one JSON object per entry.
pub struct JsonLinesSink<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

impl<W: Write + Send> TraceSink for JsonLinesSink<W> {
    fn emit(&self, entry: &TraceEntry) {
        let mut out = self.out.lock();
        let result = serde_json::to_writer(&mut *out, entry)
            .map_err(io::Error::from)
            .and_then(|_| out.write_all(b"\n"));
        if let Err(e) = result {
            log::warn!(target: "remoteps::tracer", "JSON_SINK_WRITE_FAILED error={}", e);
        }
    }
}

/// Keeps entries in memory.
#[derive(Default)]
pub struct MemorySink {
    entries: Mutex<Vec<TraceEntry>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<TraceEntry> {
        self.entries.lock().clone()
    }

    pub fn take(&self) -> Vec<TraceEntry> {
        std::mem::take(&mut *self.entries.lock())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl TraceSink for MemorySink {
    fn emit(&self, entry: &TraceEntry) {
        self.entries.lock().push(entry.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use uuid::Uuid;

    use crate::pipeline::{Flow, SessionContext};
    use crate::psrp::message::{Destination, Message, MessageType};
    use crate::tracer::entry::TraceKind;

    fn entry(display: DisplayMode, text: &str) -> TraceEntry {
        let message = Message {
            destination: Destination::Client,
            message_type: MessageType::PipelineOutput,
            rpid: Uuid::nil(),
            pid: None,
            data: Vec::new(),
            context: SessionContext::shell("S", Flow::ServerToClient),
            object_id: 1,
        };
        TraceEntry::for_message(&message, TraceKind::Output, log::Level::Info, display, text)
    }

    /// Shared buffer so the test can read what the console sink wrote.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_console_display_modes() {
        let buf = SharedBuf::default();
        let sink = ConsoleSink::new(Box::new(buf.clone()));
        sink.emit(&entry(DisplayMode::Inline, "PS C:\\> "));
        sink.emit(&entry(DisplayMode::Line, "Get-Process"));
        sink.emit(&entry(DisplayMode::Hidden, "state"));
        assert_eq!(
            String::from_utf8(buf.0.lock().clone()).unwrap(),
            "PS C:\\> Get-Process\n"
        );
    }

    #[test]
    fn test_json_lines() {
        let sink = JsonLinesSink::new(Vec::new());
        sink.emit(&entry(DisplayMode::Line, "one"));
        sink.emit(&entry(DisplayMode::Line, "two"));
        let out = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["text"], "two");
    }

    #[test]
    fn test_memory_sink_take() {
        let sink = MemorySink::new();
        sink.emit(&entry(DisplayMode::Line, "a"));
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.take().len(), 1);
        assert!(sink.is_empty());
    }
}
