//! Raw trace events as delivered by a capture adapter.
//!
//! The capture side (an ETW consumer, or a replay of a saved capture) turns
//! each OS event into a [`RawEvent`] and hands it to an [`EventSink`]: the
//! top stage of a trace pipeline.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::{uuid, Uuid};

use crate::error::EventError;
use crate::logging::{component, LogScope};

/// Keywords enabled on the WinRM provider (level 4).
pub const WINRM_KEYWORDS: u64 = 0x2000_0000_0000_0005;
/// PowerShell provider keyword of PSRP fragment events (level 5).
pub const PS_FRAGMENT_KEYWORD: u64 = 0x4000_0000_0000_0008;
/// PowerShell provider keyword of shell context events.
pub const PS_CONTEXT_KEYWORD: u64 = 0x4000_0000_0000_0100;
pub const PS_FRAGMENT_LEVEL: u8 = 5;

/// The two event providers a pipeline can be built on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provider {
    #[serde(rename = "Microsoft-Windows-WinRM")]
    WinRm,
    #[serde(rename = "Microsoft-Windows-PowerShell")]
    PowerShell,
}

impl Provider {
    pub fn name(self) -> &'static str {
        match self {
            Provider::WinRm => "Microsoft-Windows-WinRM",
            Provider::PowerShell => "Microsoft-Windows-PowerShell",
        }
    }

    pub fn guid(self) -> Uuid {
        match self {
            Provider::WinRm => uuid!("a7975c8f-ac13-49f1-87da-5a984a4ab417"),
            Provider::PowerShell => uuid!("a0c1853b-5c40-4b15-8766-3cf1c58f985a"),
        }
    }

    /// Level the capture session should enable.
    pub fn level(self) -> u8 {
        match self {
            Provider::WinRm => 4,
            Provider::PowerShell => 5,
        }
    }

    /// Keyword mask the capture session should enable.
    pub fn keywords(self) -> u64 {
        match self {
            Provider::WinRm => WINRM_KEYWORDS,
            Provider::PowerShell => PS_FRAGMENT_KEYWORD | PS_CONTEXT_KEYWORD,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    pub activity_id: Option<String>,
    pub process_id: u32,
    pub thread_id: u32,
    pub keyword: u64,
    pub level: u8,
    pub timestamp: Option<DateTime<Utc>>,
}

/// A provider-defined event field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Text(String),
    Bytes(Vec<u8>),
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::UInt(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(v: Vec<u8>) -> Self {
        FieldValue::Bytes(v)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Int(i) => write!(f, "{}", i),
            FieldValue::UInt(u) => write!(f, "{}", u),
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::Bytes(b) => write!(f, "0x{}", hex::encode(b)),
        }
    }
}

/// One captured trace record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub provider: Provider,
    pub header: EventHeader,
    #[serde(default)]
    pub fields: HashMap<String, FieldValue>,
    /// Rendered event message template, when the provider has one.
    #[serde(default)]
    pub description: Option<String>,
}

impl RawEvent {
    pub fn new(provider: Provider, header: EventHeader) -> Self {
        Self {
            provider,
            header,
            fields: HashMap::new(),
            description: None,
        }
    }

    pub fn with_field(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn field(&self, name: &'static str) -> Result<&FieldValue, EventError> {
        self.fields.get(name).ok_or(EventError::MissingField(name))
    }

    pub fn text(&self, name: &'static str) -> Result<&str, EventError> {
        match self.field(name)? {
            FieldValue::Text(s) => Ok(s),
            other => Err(invalid(name, other)),
        }
    }

    /// Unsigned integer field; text is accepted in decimal or `0x` hex.
    pub fn uint(&self, name: &'static str) -> Result<u64, EventError> {
        match self.field(name)? {
            FieldValue::UInt(v) => Ok(*v),
            FieldValue::Int(v) => u64::try_from(*v).map_err(|_| invalid(name, &FieldValue::Int(*v))),
            FieldValue::Text(s) => parse_uint(s).ok_or_else(|| invalid(name, &FieldValue::Text(s.clone()))),
            other => Err(invalid(name, other)),
        }
    }

    pub fn flag(&self, name: &'static str) -> Result<bool, EventError> {
        match self.field(name)? {
            FieldValue::Bool(b) => Ok(*b),
            FieldValue::Int(v) => Ok(*v != 0),
            FieldValue::UInt(v) => Ok(*v != 0),
            FieldValue::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(true),
                "false" | "0" => Ok(false),
                _ => Err(invalid(name, &FieldValue::Text(s.clone()))),
            },
            other => Err(invalid(name, other)),
        }
    }

    /// Binary field, either raw bytes or a `0x…` hex string.
    pub fn hex_bytes(&self, name: &'static str) -> Result<Vec<u8>, EventError> {
        match self.field(name)? {
            FieldValue::Bytes(b) => Ok(b.clone()),
            FieldValue::Text(s) => {
                let digits = s
                    .strip_prefix("0x")
                    .or_else(|| s.strip_prefix("0X"))
                    .unwrap_or(s);
                Ok(hex::decode(digits)?)
            }
            other => Err(invalid(name, other)),
        }
    }
}

fn invalid(field: &'static str, value: &FieldValue) -> EventError {
    EventError::InvalidField {
        field,
        value: value.to_string(),
    }
}

fn parse_uint(s: &str) -> Option<u64> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

/// The capture-facing side of a trace pipeline.
///
/// Events may be delivered from several capture threads at once.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: &RawEvent);

    fn on_session_start(&self, session: &str) {
        log::info!(
            target: LogScope::component(component::CAPTURE).target(),
            "CAPTURE_SESSION_STARTED session={}",
            session
        );
    }

    fn on_session_stop(&self, session: &str) {
        log::info!(
            target: LogScope::component(component::CAPTURE).target(),
            "CAPTURE_SESSION_STOPPED session={}",
            session
        );
    }
}

impl<S: EventSink + ?Sized> EventSink for std::sync::Arc<S> {
    fn on_event(&self, event: &RawEvent) {
        (**self).on_event(event)
    }

    fn on_session_start(&self, session: &str) {
        (**self).on_session_start(session)
    }

    fn on_session_stop(&self, session: &str) {
        (**self).on_session_stop(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> RawEvent {
        RawEvent::new(Provider::PowerShell, EventHeader::default())
    }

    #[test]
    fn test_provider_identity() {
        assert_eq!(
            Provider::WinRm.guid().to_string(),
            "a7975c8f-ac13-49f1-87da-5a984a4ab417"
        );
        assert_eq!(Provider::PowerShell.keywords(), 0x4000_0000_0000_0108);
        assert_eq!(Provider::PowerShell.to_string(), "Microsoft-Windows-PowerShell");
    }

    #[test]
    fn test_field_accessors() {
        let e = event()
            .with_field("ObjectId", "0x10")
            .with_field("FragmentId", 3u64)
            .with_field("sFlag", "True")
            .with_field("eFlag", false)
            .with_field("FragmentPayload", "0x0102ff");
        assert_eq!(e.uint("ObjectId").unwrap(), 16);
        assert_eq!(e.uint("FragmentId").unwrap(), 3);
        assert!(e.flag("sFlag").unwrap());
        assert!(!e.flag("eFlag").unwrap());
        assert_eq!(e.hex_bytes("FragmentPayload").unwrap(), vec![1, 2, 0xff]);
    }

    #[test]
    fn test_field_errors() {
        let e = event().with_field("FragmentPayload", "0xzz").with_field("index", true);
        assert!(matches!(e.uint("missing"), Err(EventError::MissingField("missing"))));
        assert!(matches!(e.hex_bytes("FragmentPayload"), Err(EventError::Hex(_))));
        assert!(matches!(e.text("index"), Err(EventError::InvalidField { field: "index", .. })));
    }

    #[test]
    fn test_event_json_round_trip() {
        let json = r#"{
            "provider": "Microsoft-Windows-WinRM",
            "header": {"activity_id": "{A}", "process_id": 10, "thread_id": 20, "keyword": 5, "level": 4, "timestamp": null},
            "fields": {"index": 1, "totalChunks": "2", "SoapDocument": "<s:Envelope"}
        }"#;
        let e: RawEvent = serde_json::from_str(json).unwrap();
        assert_eq!(e.provider, Provider::WinRm);
        assert_eq!(e.uint("index").unwrap(), 1);
        assert_eq!(e.uint("totalChunks").unwrap(), 2);
        assert_eq!(e.text("SoapDocument").unwrap(), "<s:Envelope");
        assert!(e.description.is_none());
    }
}
