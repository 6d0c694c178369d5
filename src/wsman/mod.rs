//! WS-Management layer of pipeline A: SOAP chunk reassembly, envelope
//! interpretation and stream decompression.

pub mod compression;
pub mod envelope;
pub mod soap;
pub mod tracker;

pub use compression::{decode_stream, frame_uncompressed, Decompressor};
pub use envelope::{Action, EnvelopeHeader, PS_RESOURCE_URI};
pub use soap::{SoapChunk, SoapMessage, SoapReassembler, TransferKey};
pub use tracker::{ManagementContext, ManagementContextTracker, ShellState};
