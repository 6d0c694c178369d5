//! PSRP message header.
//!
//! Layout: Destination u32 LE, MessageType u32 LE, RPID GUID (16 bytes),
//! PID GUID (16 bytes), then the serialized payload.

use std::fmt;

use serde::Serialize;
use uuid::Uuid;

use crate::error::MessageError;
use crate::pipeline::SessionContext;

pub const MESSAGE_HEADER_LEN: usize = 40;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Which end of the session a message is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    Client,
    Server,
    Unknown(u32),
}

impl Destination {
    pub fn from_wire(value: u32) -> Self {
        match value {
            0x0000_0001 => Destination::Client,
            0x0000_0002 => Destination::Server,
            other => Destination::Unknown(other),
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            Destination::Client => 0x0000_0001,
            Destination::Server => 0x0000_0002,
            Destination::Unknown(v) => v,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Client => f.write_str("Client"),
            Destination::Server => f.write_str("Server"),
            Destination::Unknown(v) => write!(f, "Unknown(0x{:08x})", v),
        }
    }
}

macro_rules! message_types {
    ($($variant:ident = $value:literal => $name:literal,)*) => {
        /// PSRP message types.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
        pub enum MessageType {
            $($variant,)*
            Unknown(u32),
        }

        impl MessageType {
            pub fn from_wire(value: u32) -> Self {
                match value {
                    $($value => MessageType::$variant,)*
                    other => MessageType::Unknown(other),
                }
            }

            pub fn to_wire(self) -> u32 {
                match self {
                    $(MessageType::$variant => $value,)*
                    MessageType::Unknown(v) => v,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(MessageType::$variant => $name,)*
                    MessageType::Unknown(_) => "UNKNOWN",
                }
            }
        }
    };
}

message_types! {
    SessionCapability = 0x0001_0002 => "SESSION_CAPABILITY",
    InitRunspacePool = 0x0001_0004 => "INIT_RUNSPACEPOOL",
    PublicKey = 0x0001_0005 => "PUBLIC_KEY",
    EncryptedSessionKey = 0x0001_0006 => "ENCRYPTED_SESSION_KEY",
    PublicKeyRequest = 0x0001_0007 => "PUBLIC_KEY_REQUEST",
    ConnectRunspacePool = 0x0001_0008 => "CONNECT_RUNSPACEPOOL",
    SetMaxRunspaces = 0x0002_1002 => "SET_MAX_RUNSPACES",
    SetMinRunspaces = 0x0002_1003 => "SET_MIN_RUNSPACES",
    RunspaceAvailability = 0x0002_1004 => "RUNSPACE_AVAILABILITY",
    RunspacePoolState = 0x0002_1005 => "RUNSPACEPOOL_STATE",
    CreatePipeline = 0x0002_1006 => "CREATE_PIPELINE",
    GetAvailableRunspaces = 0x0002_1007 => "GET_AVAILABLE_RUNSPACES",
    UserEvent = 0x0002_1008 => "USER_EVENT",
    ApplicationPrivateData = 0x0002_1009 => "APPLICATION_PRIVATE_DATA",
    GetCommandMetadata = 0x0002_100A => "GET_COMMAND_METADATA",
    RunspacePoolInitData = 0x0002_100B => "RUNSPACEPOOL_INIT_DATA",
    ResetRunspaceState = 0x0002_100C => "RESET_RUNSPACE_STATE",
    RunspacePoolHostCall = 0x0002_1100 => "RUNSPACEPOOL_HOST_CALL",
    RunspacePoolHostResponse = 0x0002_1101 => "RUNSPACEPOOL_HOST_RESPONSE",
    PipelineInput = 0x0004_1002 => "PIPELINE_INPUT",
    EndOfPipelineInput = 0x0004_1003 => "END_OF_PIPELINE_INPUT",
    PipelineOutput = 0x0004_1004 => "PIPELINE_OUTPUT",
    ErrorRecord = 0x0004_1005 => "ERROR_RECORD",
    PipelineState = 0x0004_1006 => "PIPELINE_STATE",
    DebugRecord = 0x0004_1007 => "DEBUG_RECORD",
    VerboseRecord = 0x0004_1008 => "VERBOSE_RECORD",
    WarningRecord = 0x0004_1009 => "WARNING_RECORD",
    ProgressRecord = 0x0004_1010 => "PROGRESS_RECORD",
    InformationRecord = 0x0004_1011 => "INFORMATION_RECORD",
    PipelineHostCall = 0x0004_1100 => "PIPELINE_HOST_CALL",
    PipelineHostResponse = 0x0004_1101 => "PIPELINE_HOST_RESPONSE",
}

impl MessageType {
    pub fn is_known(self) -> bool {
        !matches!(self, MessageType::Unknown(_))
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Unknown(v) => write!(f, "UNKNOWN(0x{:08x})", v),
            known => f.write_str(known.name()),
        }
    }
}

/// The fixed header of a PSRP message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub destination: Destination,
    pub message_type: MessageType,
    pub rpid: Uuid,
    /// Absent (all-zero on the wire) for runspace-pool level messages.
    pub pid: Option<Uuid>,
}

impl MessageHeader {
    pub fn decode(bytes: &[u8]) -> Result<(MessageHeader, &[u8]), MessageError> {
        if bytes.len() < MESSAGE_HEADER_LEN {
            return Err(MessageError::Truncated {
                len: bytes.len(),
                header: MESSAGE_HEADER_LEN,
            });
        }
        let destination = Destination::from_wire(read_u32_le(&bytes[0..4]));
        let message_type = MessageType::from_wire(read_u32_le(&bytes[4..8]));
        let rpid = read_guid(&bytes[8..24]);
        let pid = Some(read_guid(&bytes[24..40])).filter(|p| !p.is_nil());
        Ok((
            MessageHeader {
                destination,
                message_type,
                rpid,
                pid,
            },
            &bytes[MESSAGE_HEADER_LEN..],
        ))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MESSAGE_HEADER_LEN);
        out.extend_from_slice(&self.destination.to_wire().to_le_bytes());
        out.extend_from_slice(&self.message_type.to_wire().to_le_bytes());
        out.extend_from_slice(&self.rpid.to_bytes_le());
        out.extend_from_slice(&self.pid.unwrap_or_else(Uuid::nil).to_bytes_le());
        out
    }
}

fn read_u32_le(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// GUIDs are stored with their first three fields little-endian.
fn read_guid(bytes: &[u8]) -> Uuid {
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&bytes[..16]);
    Uuid::from_bytes_le(raw)
}

/// A fully reassembled and header-decoded PSRP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub destination: Destination,
    pub message_type: MessageType,
    pub rpid: Uuid,
    pub pid: Option<Uuid>,
    /// Serialized payload, usually a CLIXML document.
    pub data: Vec<u8>,
    pub context: SessionContext,
    pub object_id: u64,
}

impl Message {
    pub fn decode(bytes: &[u8], context: SessionContext, object_id: u64) -> Result<Message, MessageError> {
        let (header, payload) = MessageHeader::decode(bytes)?;
        Ok(Message {
            destination: header.destination,
            message_type: header.message_type,
            rpid: header.rpid,
            pid: header.pid,
            data: payload.to_vec(),
            context,
            object_id,
        })
    }

    pub fn header(&self) -> MessageHeader {
        MessageHeader {
            destination: self.destination,
            message_type: self.message_type,
            rpid: self.rpid,
            pid: self.pid,
        }
    }

    /// Header followed by payload, as carried inside fragments.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.header().encode();
        out.extend_from_slice(&self.data);
        out
    }

    /// Payload as text with any UTF-8 byte order mark removed.
    pub fn text(&self) -> Result<&str, MessageError> {
        let data = self.data.strip_prefix(UTF8_BOM).unwrap_or(&self.data);
        Ok(std::str::from_utf8(data)?)
    }
}
