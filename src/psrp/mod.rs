//! PowerShell Remoting Protocol layers: fragment framing, reassembly and
//! message headers.

pub mod defrag;
pub mod fragment;
pub mod message;
pub mod parser;

pub use defrag::{CompletedMessage, ContextUpdate, DefragStats, FragmentReassembler};
pub use fragment::{fragment_message, fragments, Fragment, Fragments};
pub use message::{Destination, Message, MessageHeader, MessageType};
pub use parser::MessageParser;
