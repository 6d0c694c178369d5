//! remoteps-trace - Passive decoder for remote PowerShell sessions
//!
//! This crate rebuilds a readable command trace of a PowerShell remoting
//! session from trace events. The traffic is decoded layer by layer:
//!
//! 1. **WS-Management** - SOAP documents logged by the WinRM provider are
//!    reassembled and matched request to response
//! 2. **PSRP fragments** - remoting fragments are reassembled per shell,
//!    command and object
//! 3. **PSRP messages** - message headers are decoded and the CLIXML
//!    payloads partially deserialized into a command trace
//!
//! ## Architecture
//!
//! The crate is organized into modules:
//! - `capture` - Raw event model and the PowerShell provider tracker
//! - `wsman` - SOAP chunk reassembly, envelope tracking, stream decompression
//! - `psrp` - Fragment framing, reassembly and message headers
//! - `clixml` - Partial CLIXML deserializer and shape table
//! - `tracer` - Message interpretation and trace sinks
//! - `pipeline` - Stage trait, session context and pipeline assembly
//! - `config` - JSON configuration
//! - `logging` - Structured logging with session context
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use remoteps_trace::capture::EventSink;
//! use remoteps_trace::config::TracerConfig;
//! use remoteps_trace::logging::init_logger;
//! use remoteps_trace::pipeline::TracePipeline;
//! use remoteps_trace::tracer::{JsonLinesSink, TraceSink};
//!
//! let config = TracerConfig::default();
//! init_logger(&config.log);
//! let json: Arc<dyn TraceSink> = Arc::new(JsonLinesSink::new(std::io::stderr()));
//! let pipeline = TracePipeline::winrm(&config, vec![json], None);
//! pipeline.on_session_start("PSRP_monitor");
//! // hand each captured RawEvent to pipeline.on_event(..)
//! ```

pub mod capture;
pub mod clixml;
pub mod config;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod psrp;
pub mod tracer;
pub mod wsman;

pub use capture::{EventSink, Provider, RawEvent};
pub use config::TracerConfig;
pub use pipeline::TracePipeline;
pub use tracer::{TraceEntry, TraceKind, TraceSink};
