//! WS-Management envelope vocabulary and lookup helpers.

use base64::Engine;
use roxmltree::Node;

use crate::error::SoapError;

/// XML namespaces used by the PowerShell WS-Man plugin.
pub mod ns {
    pub const SOAP: &str = "http://www.w3.org/2003/05/soap-envelope";
    pub const ADDRESSING: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
    pub const TRANSFER: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer";
    pub const WSMAN: &str = "http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd";
    pub const SHELL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell";
    pub const POWERSHELL: &str = "http://schemas.microsoft.com/powershell";
    pub const FAULT: &str = "http://schemas.microsoft.com/wbem/wsman/1/wsmanfault";
}

pub const PS_RESOURCE_URI: &str = "http://schemas.microsoft.com/powershell/Microsoft.PowerShell";
pub const COMMAND_STATE_DONE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done";

/// The WS-Man actions that can carry remoting traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Create,
    CreateResponse,
    Delete,
    DeleteResponse,
    Fault,
    Command,
    CommandResponse,
    Send,
    Receive,
    ReceiveResponse,
    Signal,
}

impl Action {
    pub const ALL: [Action; 11] = [
        Action::Create,
        Action::CreateResponse,
        Action::Delete,
        Action::DeleteResponse,
        Action::Fault,
        Action::Command,
        Action::CommandResponse,
        Action::Send,
        Action::Receive,
        Action::ReceiveResponse,
        Action::Signal,
    ];

    pub fn uri(self) -> &'static str {
        match self {
            Action::Create => "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create",
            Action::CreateResponse => "http://schemas.xmlsoap.org/ws/2004/09/transfer/CreateResponse",
            Action::Delete => "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete",
            Action::DeleteResponse => "http://schemas.xmlsoap.org/ws/2004/09/transfer/DeleteResponse",
            Action::Fault => "http://schemas.dmtf.org/wbem/wsman/1/wsman/fault",
            Action::Command => "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command",
            Action::CommandResponse => {
                "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandResponse"
            }
            Action::Send => "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Send",
            Action::Receive => "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive",
            Action::ReceiveResponse => {
                "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/ReceiveResponse"
            }
            Action::Signal => "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal",
        }
    }

    pub fn from_uri(uri: &str) -> Option<Action> {
        Action::ALL.into_iter().find(|a| a.uri() == uri)
    }
}

/// The addressing fields of an envelope header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub action: String,
    pub resource_uri: Option<String>,
    pub message_id: Option<String>,
    pub relates_to: Option<String>,
    pub shell_id: Option<String>,
}

impl EnvelopeHeader {
    pub fn read(envelope: Node<'_, '_>) -> Result<Self, SoapError> {
        let header = child(envelope, ns::SOAP, "Header").ok_or(SoapError::MissingElement("s:Header"))?;
        let action = child(header, ns::ADDRESSING, "Action")
            .and_then(text)
            .ok_or(SoapError::MissingElement("a:Action"))?;
        Ok(Self {
            action: action.to_string(),
            resource_uri: child_text(header, ns::WSMAN, "ResourceURI"),
            message_id: child_text(header, ns::ADDRESSING, "MessageID"),
            relates_to: child_text(header, ns::ADDRESSING, "RelatesTo"),
            shell_id: child(header, ns::WSMAN, "SelectorSet").and_then(|set| selector(set, "ShellId")),
        })
    }

    /// True unless the header names a resource other than the PowerShell plugin.
    pub fn may_be_powershell(&self) -> bool {
        self.resource_uri.as_deref().map_or(true, |uri| uri == PS_RESOURCE_URI)
    }

    pub fn is_powershell(&self) -> bool {
        self.resource_uri.as_deref() == Some(PS_RESOURCE_URI)
    }
}

pub fn child<'a, 'input>(node: Node<'a, 'input>, namespace: &str, name: &str) -> Option<Node<'a, 'input>> {
    node.children().find(|c| c.has_tag_name((namespace, name)))
}

pub fn children<'a, 'input: 'a>(
    node: Node<'a, 'input>,
    namespace: &'a str,
    name: &'a str,
) -> impl Iterator<Item = Node<'a, 'input>> + 'a {
    node.children().filter(move |c| c.has_tag_name((namespace, name)))
}

/// Follow a path of `(namespace, local name)` steps from `node`.
pub fn path<'a, 'input>(node: Node<'a, 'input>, steps: &[(&str, &str)]) -> Option<Node<'a, 'input>> {
    steps
        .iter()
        .try_fold(node, |current, (namespace, name)| child(current, namespace, name))
}

/// Trimmed text content; `None` when empty.
pub fn text<'a>(node: Node<'a, '_>) -> Option<&'a str> {
    node.text().map(str::trim).filter(|t| !t.is_empty())
}

fn child_text(node: Node<'_, '_>, namespace: &str, name: &str) -> Option<String> {
    child(node, namespace, name).and_then(text).map(str::to_string)
}

/// Value of `w:Selector[@Name=name]` within a selector set.
pub fn selector(selector_set: Node<'_, '_>, name: &str) -> Option<String> {
    children(selector_set, ns::WSMAN, "Selector")
        .find(|s| s.attribute("Name") == Some(name))
        .and_then(text)
        .map(str::to_string)
}

/// Base64 element content, tolerating line breaks.
pub fn decode_base64(encoded: &str, element: &'static str) -> Result<Vec<u8>, SoapError> {
    let compact: String = encoded.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(compact)
        .map_err(|source| SoapError::Base64 { element, source })
}
