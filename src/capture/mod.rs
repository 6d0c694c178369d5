//! Trace event capture boundary.
//!
//! The platform subscription itself lives outside this crate. Whatever
//! drives it converts each record into a [`RawEvent`] and hands it to an
//! [`EventSink`]: one of the pipeline entry stages, or a whole
//! [`TracePipeline`](crate::pipeline::TracePipeline).

pub mod event;
pub mod powershell;

pub use event::{
    EventHeader, EventSink, FieldValue, Provider, RawEvent, PS_CONTEXT_KEYWORD, PS_FRAGMENT_KEYWORD,
    PS_FRAGMENT_LEVEL, WINRM_KEYWORDS,
};
pub use powershell::ProviderContextTracker;
