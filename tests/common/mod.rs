//! Helpers shared by the integration tests.
#![allow(dead_code)]

use base64::Engine;
use uuid::Uuid;

use remoteps_trace::capture::{EventHeader, Provider, RawEvent};
use remoteps_trace::config::TracerConfig;
use remoteps_trace::psrp::{fragment_message, Destination, MessageHeader, MessageType};

pub const RPID: Uuid = Uuid::from_u128(0x6b1a_d7a3_0000_4000_8000_0000_0000_0001);
pub const PID: Uuid = Uuid::from_u128(0x6b1a_d7a3_0000_4000_8000_0000_0000_0002);

pub const PS_URI: &str = "http://schemas.microsoft.com/powershell/Microsoft.PowerShell";

/// Configuration without the console sink.
pub fn quiet_config() -> TracerConfig {
    TracerConfig {
        interactive: false,
        ..TracerConfig::default()
    }
}

pub fn message_bytes(message_type: MessageType, destination: Destination, pid: Option<Uuid>, payload: &str) -> Vec<u8> {
    let mut bytes = MessageHeader {
        destination,
        message_type,
        rpid: RPID,
        pid,
    }
    .encode();
    bytes.extend_from_slice(payload.as_bytes());
    bytes
}

/// Wire fragments of `message`, concatenated as a transport blob.
pub fn fragment_blob(object_id: u64, message: &[u8], max_payload: usize) -> Vec<u8> {
    fragment_message(object_id, message, max_payload)
        .iter()
        .flat_map(|f| f.encode())
        .collect()
}

pub fn create_pipeline_xml(command: &str) -> String {
    format!(
        r#"<Obj RefId="0"><MS><Obj N="PowerShell" RefId="1"><MS><Obj N="Cmds" RefId="2"><TN RefId="0"><T>System.Collections.Generic.List`1[[System.Management.Automation.PSObject]]</T></TN><LST><Obj RefId="3"><MS><S N="Cmd">{}</S><B N="IsScript">false</B><Nil N="UseLocalScope" /><Obj N="Args" RefId="4"><TNRef RefId="0" /><LST /></Obj></MS></Obj></LST></Obj><B N="IsNested">false</B></MS></Obj><B N="NoInput">true</B><B N="AddToHistory">true</B></MS></Obj>"#,
        command
    )
}

pub fn b64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// A SOAP envelope declaring the WS-Man namespaces.
pub fn envelope(action: &str, header: &str, body: &str) -> String {
    format!(
        r#"<s:Envelope xml:lang="en-US" xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:a="http://schemas.xmlsoap.org/ws/2004/08/addressing" xmlns:x="http://schemas.xmlsoap.org/ws/2004/09/transfer" xmlns:w="http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd" xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell" xmlns:p="http://schemas.microsoft.com/powershell"><s:Header><a:Action s:mustUnderstand="true">{}</a:Action>{}</s:Header><s:Body>{}</s:Body></s:Envelope>"#,
        action, header, body
    )
}

pub fn ps_header(message_id: &str, shell_id: Option<&str>) -> String {
    let selector = shell_id
        .map(|s| format!(r#"<w:SelectorSet><w:Selector Name="ShellId">{}</w:Selector></w:SelectorSet>"#, s))
        .unwrap_or_default();
    format!(
        r#"<w:ResourceURI s:mustUnderstand="true">{}</w:ResourceURI><a:MessageID>{}</a:MessageID>{}"#,
        PS_URI, message_id, selector
    )
}

pub fn relates_to(message_id: &str) -> String {
    format!(r#"<a:RelatesTo>{}</a:RelatesTo>"#, message_id)
}

/// Split a SOAP document into WinRM chunk events of `chunk_len` characters.
pub fn soap_events(document: &str, thread_id: u32, chunk_len: usize) -> Vec<RawEvent> {
    let chars: Vec<char> = document.chars().collect();
    let chunks: Vec<String> = chars.chunks(chunk_len).map(|c| c.iter().collect()).collect();
    let total = chunks.len() as u64;
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            RawEvent::new(
                Provider::WinRm,
                EventHeader {
                    activity_id: Some("{5E0A4C2B-0000-0000-0000-000000000000}".into()),
                    process_id: 4242,
                    thread_id,
                    keyword: 0x2000_0000_0000_0004,
                    level: 4,
                    timestamp: None,
                },
            )
            .with_field("index", i as u64 + 1)
            .with_field("totalChunks", total)
            .with_field("SoapDocument", chunk)
        })
        .collect()
}
