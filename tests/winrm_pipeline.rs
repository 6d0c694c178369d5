//! End-to-end decoding of WinRM SOAP traffic.

mod common;

use std::sync::Arc;

use remoteps_trace::capture::EventSink;
use remoteps_trace::error::DecompressError;
use remoteps_trace::psrp::{Destination, MessageType};
use remoteps_trace::tracer::{MemorySink, TraceKind, TraceSink};
use remoteps_trace::wsman::{frame_uncompressed, Action, Decompressor};
use remoteps_trace::TracePipeline;

use common::*;

const SESSION_CAPABILITY: &str = r#"<Obj RefId="0"><MS><Version N="protocolversion">2.3</Version><Version N="PSVersion">2.0</Version><Version N="SerializationVersion">1.1.0.1</Version></MS></Obj>"#;

fn pipeline(decompressor: Option<Arc<dyn Decompressor>>) -> (Arc<MemorySink>, TracePipeline) {
    let sink = Arc::new(MemorySink::new());
    let pipeline = TracePipeline::winrm(&quiet_config(), vec![sink.clone() as Arc<dyn TraceSink>], decompressor);
    (sink, pipeline)
}

fn feed(pipeline: &TracePipeline, document: &str) {
    for event in soap_events(document, 7, 150) {
        pipeline.on_event(&event);
    }
}

fn open_shell(pipeline: &TracePipeline) {
    let capability = message_bytes(MessageType::SessionCapability, Destination::Server, None, SESSION_CAPABILITY);
    let init = message_bytes(MessageType::InitRunspacePool, Destination::Server, None, "<Obj RefId=\"0\"><MS /></Obj>");
    let mut creation = fragment_blob(1, &capability, 32000);
    creation.extend(fragment_blob(2, &init, 32000));

    feed(
        pipeline,
        &envelope(
            Action::Create.uri(),
            &ps_header("uuid:C1", None),
            &format!(
                "<rsp:Shell><rsp:InputStreams>stdin pr</rsp:InputStreams><rsp:OutputStreams>stdout</rsp:OutputStreams><p:creationXml>{}</p:creationXml></rsp:Shell>",
                b64(&creation)
            ),
        ),
    );
    feed(
        pipeline,
        &envelope(
            Action::CreateResponse.uri(),
            &relates_to("uuid:C1"),
            &format!(
                r#"<x:ResourceCreated><a:Address>http://host:5985/wsman</a:Address><a:ReferenceParameters><w:ResourceURI>{}</w:ResourceURI><w:SelectorSet><w:Selector Name="ShellId">SHELL-1</w:Selector></w:SelectorSet></a:ReferenceParameters></x:ResourceCreated>"#,
                PS_URI
            ),
        ),
    );
}

fn run_command(pipeline: &TracePipeline, command: &str) {
    let create = message_bytes(
        MessageType::CreatePipeline,
        Destination::Server,
        Some(PID),
        &create_pipeline_xml(command),
    );
    feed(
        pipeline,
        &envelope(
            Action::Command.uri(),
            &ps_header("uuid:M2", Some("SHELL-1")),
            &format!(
                "<rsp:CommandLine><rsp:Command /><rsp:Arguments>{}</rsp:Arguments></rsp:CommandLine>",
                b64(&fragment_blob(3, &create, 64))
            ),
        ),
    );
    feed(
        pipeline,
        &envelope(
            Action::CommandResponse.uri(),
            &relates_to("uuid:M2"),
            "<rsp:CommandResponse><rsp:CommandId>CMD-1</rsp:CommandId></rsp:CommandResponse>",
        ),
    );
    feed(
        pipeline,
        &envelope(
            Action::Receive.uri(),
            &ps_header("uuid:M3", Some("SHELL-1")),
            r#"<rsp:Receive><rsp:DesiredStream CommandId="CMD-1">stdout</rsp:DesiredStream></rsp:Receive>"#,
        ),
    );
}

fn receive_response(stream: &[u8]) -> String {
    envelope(
        Action::ReceiveResponse.uri(),
        &relates_to("uuid:M3"),
        &format!(
            r#"<rsp:ReceiveResponse><rsp:Stream Name="stdout" CommandId="CMD-1">{}</rsp:Stream><rsp:CommandState CommandId="CMD-1" State="http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done"><rsp:ExitCode>0</rsp:ExitCode></rsp:CommandState></rsp:ReceiveResponse>"#,
            b64(stream)
        ),
    )
}

#[test]
fn test_command_and_output_traced() {
    let (sink, pipeline) = pipeline(None);
    open_shell(&pipeline);
    run_command(&pipeline, "Get-Process");

    let output = message_bytes(MessageType::PipelineOutput, Destination::Client, Some(PID), "<S>hello</S>");
    feed(&pipeline, &receive_response(&frame_uncompressed(&fragment_blob(4, &output, 16))));

    let entries = sink.entries();
    assert_eq!(entries.len(), 2);

    assert_eq!(entries[0].kind, TraceKind::Command);
    assert_eq!(entries[0].text, "Get-Process");
    assert_eq!(entries[0].shell_id, "SHELL-1");
    assert_eq!(entries[0].rpid, RPID);
    assert_eq!(entries[0].pid, Some(PID));

    assert_eq!(entries[1].kind, TraceKind::Output);
    assert_eq!(entries[1].text, "hello");
    assert_eq!(entries[1].command_id.as_deref(), Some("CMD-1"));

    let stats = pipeline.stats();
    assert_eq!(stats.messages, 4);
    assert_eq!(stats.out_of_order, 0);
}

#[test]
fn test_unrelated_envelope_ignored() {
    let (sink, pipeline) = pipeline(None);
    let wmi = envelope(
        "http://schemas.xmlsoap.org/ws/2004/09/enumeration/Enumerate",
        r#"<w:ResourceURI>http://schemas.microsoft.com/wbem/wsman/1/wmi/root/cimv2/Win32_Service</w:ResourceURI><a:MessageID>uuid:W1</a:MessageID>"#,
        "<n:Enumerate xmlns:n=\"http://schemas.xmlsoap.org/ws/2004/09/enumeration\" />",
    );
    feed(&pipeline, &wmi);
    let cmd_shell = envelope(
        Action::Command.uri(),
        r#"<w:ResourceURI>http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd</w:ResourceURI><a:MessageID>uuid:W2</a:MessageID><w:SelectorSet><w:Selector Name="ShellId">CMD-SHELL</w:Selector></w:SelectorSet>"#,
        &format!("<rsp:CommandLine><rsp:Command>ipconfig</rsp:Command><rsp:Arguments>{}</rsp:Arguments></rsp:CommandLine>", b64(b"/all")),
    );
    feed(&pipeline, &cmd_shell);

    assert!(sink.is_empty());
    assert_eq!(pipeline.stats().fragments, 0);
}

#[test]
fn test_interleaved_soap_transfers() {
    let (sink, pipeline) = pipeline(None);
    open_shell(&pipeline);

    let create = message_bytes(
        MessageType::CreatePipeline,
        Destination::Server,
        Some(PID),
        &create_pipeline_xml("Get-Service"),
    );
    let command = envelope(
        Action::Command.uri(),
        &ps_header("uuid:M9", Some("SHELL-1")),
        &format!(
            "<rsp:CommandLine><rsp:Arguments>{}</rsp:Arguments></rsp:CommandLine>",
            b64(&fragment_blob(5, &create, 100))
        ),
    );
    let noise = envelope(
        "http://schemas.xmlsoap.org/ws/2004/09/transfer/Get",
        r#"<w:ResourceURI>http://schemas.microsoft.com/wbem/wsman/1/config</w:ResourceURI>"#,
        "",
    );
    let a = soap_events(&command, 1, 120);
    let b = soap_events(&noise, 2, 120);
    assert!(a.len() > 2 && b.len() > 1);

    let mut a = a.into_iter();
    let mut b = b.into_iter();
    loop {
        let (x, y) = (a.next(), b.next());
        if x.is_none() && y.is_none() {
            break;
        }
        for event in x.iter().chain(y.iter()) {
            pipeline.on_event(event);
        }
    }

    let entries = sink.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].text, "Get-Service");
}

/// Run-length "compression": each (count, byte) pair expands to `count`
/// copies of `byte`.
struct RunLength;

impl Decompressor for RunLength {
    fn decompress(&self, block: &[u8], uncompressed_size: usize) -> Result<Vec<u8>, DecompressError> {
        let mut out = Vec::with_capacity(uncompressed_size);
        for pair in block.chunks(2) {
            match pair {
                [count, byte] => out.extend(std::iter::repeat(*byte).take(*count as usize)),
                _ => return Err(DecompressError::Failed("odd run-length block".into())),
            }
        }
        Ok(out)
    }
}

fn run_length_block(data: &[u8]) -> Vec<u8> {
    let mut encoded = Vec::new();
    for byte in data {
        encoded.push(1);
        encoded.push(*byte);
    }
    let mut block = Vec::new();
    block.extend_from_slice(&((data.len() - 1) as u16).to_le_bytes());
    block.extend_from_slice(&((encoded.len() - 1) as u16).to_le_bytes());
    block.extend(encoded);
    block
}

#[test]
fn test_compressed_stream_decoded_by_collaborator() {
    let (sink, pipeline) = pipeline(Some(Arc::new(RunLength)));
    open_shell(&pipeline);
    run_command(&pipeline, "Get-Date");

    let output = message_bytes(MessageType::PipelineOutput, Destination::Client, Some(PID), "<S>compressed</S>");
    feed(&pipeline, &receive_response(&run_length_block(&fragment_blob(4, &output, 1000))));

    let entries = sink.entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].text, "compressed");
}

#[test]
fn test_compressed_stream_without_collaborator_dropped() {
    let (sink, pipeline) = pipeline(None);
    open_shell(&pipeline);
    run_command(&pipeline, "Get-Date");

    let output = message_bytes(MessageType::PipelineOutput, Destination::Client, Some(PID), "<S>lost</S>");
    feed(&pipeline, &receive_response(&run_length_block(&fragment_blob(4, &output, 1000))));

    let entries = sink.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, TraceKind::Command);
}

#[test]
fn test_shell_delete_and_fault() {
    let (sink, pipeline) = pipeline(None);
    open_shell(&pipeline);
    feed(
        &pipeline,
        &envelope(Action::Delete.uri(), &ps_header("uuid:D1", Some("SHELL-1")), ""),
    );
    feed(
        &pipeline,
        &envelope(
            Action::Fault.uri(),
            &relates_to("uuid:D1"),
            r#"<s:Fault><s:Code><s:Value>s:Receiver</s:Value></s:Code><s:Reason><s:Text xml:lang="en-US">The request is not valid.</s:Text></s:Reason></s:Fault>"#,
        ),
    );
    feed(&pipeline, &envelope(Action::DeleteResponse.uri(), &relates_to("uuid:D1"), ""));
    assert!(sink.is_empty());
    assert_eq!(pipeline.stats().messages, 2);
}
