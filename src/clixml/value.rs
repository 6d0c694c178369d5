//! Partial CLIXML deserializer.
//!
//! Decodes the primitive and object shapes commonly carried by remoting
//! messages into [`PsValue`]. Anything the decoder does not understand is
//! kept as [`PsValue::Unsupported`] with its raw XML, so callers can render
//! a placeholder instead of failing the whole document.

use std::collections::HashMap;
use std::fmt;

use base64::Engine;
use roxmltree::{Document, Node};
use serde::Serialize;

use crate::clixml::string::{decode_entities, decode_escapes};
use crate::error::ClixmlError;

/// Numeric primitive kinds, by their serialized tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NumberKind {
    Byte,
    SByte,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Single,
    Double,
    Decimal,
}

impl NumberKind {
    fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "By" => NumberKind::Byte,
            "SB" => NumberKind::SByte,
            "I16" => NumberKind::Int16,
            "U16" => NumberKind::UInt16,
            "I32" => NumberKind::Int32,
            "U32" => NumberKind::UInt32,
            "I64" => NumberKind::Int64,
            "U64" => NumberKind::UInt64,
            "Sg" => NumberKind::Single,
            "Db" | "Dd" => NumberKind::Double,
            "D" => NumberKind::Decimal,
            _ => return None,
        })
    }
}

/// A decoded serialized value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PsValue {
    Nil,
    String(String),
    Bool(bool),
    Char(char),
    /// The textual form is kept; rendering never needs arithmetic.
    Number { kind: NumberKind, text: String },
    DateTime(String),
    Duration(String),
    Guid(String),
    Bytes(Vec<u8>),
    /// Encrypted with the session key; never decoded.
    SecureString,
    Object(PsObject),
    Unsupported { tag: String, raw: String },
}

impl PsValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PsValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&PsObject> {
        match self {
            PsValue::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PsValue::Number { text, .. } => text.trim().parse().ok(),
            PsValue::Object(obj) => match &obj.content {
                ObjectContent::Primitive(inner) => inner.as_i64(),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, PsValue::Nil)
    }

    /// Items of a list-like value.
    pub fn list(&self) -> Option<&[PsValue]> {
        match self {
            PsValue::Object(PsObject {
                content: ObjectContent::List(items),
                ..
            }) => Some(items),
            _ => None,
        }
    }

    /// Property lookup through an object value.
    pub fn property(&self, name: &str) -> Option<&PsValue> {
        self.as_object().and_then(|obj| obj.property(name))
    }
}

/// A serialized complex object (`<Obj>`).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PsObject {
    /// Most derived type first.
    pub type_names: Vec<String>,
    pub to_string: Option<String>,
    /// Adapted (`Props`) and extended (`MS`) properties in document order.
    pub properties: Vec<PsProperty>,
    pub content: ObjectContent,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PsProperty {
    pub name: String,
    pub value: PsValue,
}

/// What an object carries besides its properties.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(tag = "kind", content = "items", rename_all = "snake_case")]
pub enum ObjectContent {
    #[default]
    Standard,
    /// `LST`, `IE`, `STK` and `QUE` containers.
    List(Vec<PsValue>),
    /// `DCT` entries as key/value pairs.
    Dictionary(Vec<(PsValue, PsValue)>),
    /// An enum or other primitive wrapped in type information.
    Primitive(Box<PsValue>),
}

impl PsObject {
    pub fn property(&self, name: &str) -> Option<&PsValue> {
        self.properties
            .iter()
            .find(|p| p.name == name)
            .map(|p| &p.value)
    }

    pub fn type_name(&self) -> Option<&str> {
        self.type_names.first().map(String::as_str)
    }
}

impl fmt::Display for PsValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PsValue::Nil => Ok(()),
            PsValue::String(s) | PsValue::DateTime(s) | PsValue::Duration(s) => f.write_str(s),
            PsValue::Bool(true) => f.write_str("True"),
            PsValue::Bool(false) => f.write_str("False"),
            PsValue::Char(c) => write!(f, "{}", c),
            PsValue::Number { text, .. } => f.write_str(text),
            PsValue::Guid(g) => write!(f, "{{{}}}", g),
            PsValue::Bytes(bytes) => {
                let rendered: Vec<String> = bytes.iter().map(|b| b.to_string()).collect();
                f.write_str(&rendered.join(" "))
            }
            PsValue::SecureString => f.write_str("[SecureString]"),
            PsValue::Object(obj) => match (&obj.to_string, &obj.content) {
                (Some(s), _) => f.write_str(s),
                (None, ObjectContent::Primitive(inner)) => write!(f, "{}", inner),
                (None, ObjectContent::List(items)) => {
                    let rendered: Vec<String> = items.iter().map(|i| i.to_string()).collect();
                    f.write_str(&rendered.join(","))
                }
                _ => write!(f, "[{}]", obj.type_name().unwrap_or("object")),
            },
            PsValue::Unsupported { tag, raw } => write!(f, "[unsupported-{}-type]{}", tag, raw),
        }
    }
}

/// Parse a serialized document holding one value.
pub fn parse(xml: &str) -> Result<PsValue, ClixmlError> {
    let mut values = parse_all(xml)?;
    if values.is_empty() {
        return Err(ClixmlError::MissingElement("value"));
    }
    Ok(values.swap_remove(0))
}

/// Parse a serialized document; an `<Objs>` root yields each of its
/// children, any other root yields itself.
pub fn parse_all(xml: &str) -> Result<Vec<PsValue>, ClixmlError> {
    let xml = xml.trim_start_matches('\u{feff}').trim();
    if xml.is_empty() {
        return Err(ClixmlError::Empty);
    }
    let doc = Document::parse(xml)?;
    let root = doc.root_element();
    let mut decoder = Decoder::new(xml);
    if root.tag_name().name() == "Objs" {
        Ok(root
            .children()
            .filter(Node::is_element)
            .map(|child| decoder.decode(child))
            .collect())
    } else {
        Ok(vec![decoder.decode(root)])
    }
}

/// Values a document may copy in through `Ref` elements. Past this, further
/// references decode as [`PsValue::Unsupported`].
pub const MAX_REF_EXPANSION: usize = 100_000;

/// Element decoder holding the document's reference tables.
///
/// Type name lists (`TN RefId` / `TNRef`) and objects (`Obj RefId` / `Ref`)
/// are shared within a document, so one decoder is used per document.
pub struct Decoder<'s> {
    source: &'s str,
    type_names: HashMap<String, Vec<String>>,
    /// Referenceable objects with their [`weight`].
    objects: HashMap<String, (PsValue, usize)>,
    expanded: usize,
}

impl<'s> Decoder<'s> {
    pub fn new(source: &'s str) -> Self {
        Self {
            source,
            type_names: HashMap::new(),
            objects: HashMap::new(),
            expanded: 0,
        }
    }

    pub fn decode(&mut self, node: Node<'_, '_>) -> PsValue {
        let tag = node.tag_name().name();
        match tag {
            "Obj" => self.decode_object(node),
            "Ref" => self.resolve_ref(node),
            _ => self.decode_primitive(node),
        }
    }

    fn resolve_ref(&mut self, node: Node<'_, '_>) -> PsValue {
        let resolved = node
            .attribute("RefId")
            .and_then(|id| self.objects.get(id))
            .filter(|(_, weight)| self.expanded.saturating_add(*weight) <= MAX_REF_EXPANSION)
            .map(|(value, weight)| (value.clone(), *weight));
        match resolved {
            Some((value, weight)) => {
                self.expanded += weight;
                value
            }
            None => self.unsupported(node),
        }
    }

    fn decode_primitive(&self, node: Node<'_, '_>) -> PsValue {
        let tag = node.tag_name().name();
        let text = node.text().unwrap_or("");
        if let Some(kind) = NumberKind::from_tag(tag) {
            return PsValue::Number {
                kind,
                text: text.trim().to_string(),
            };
        }
        match tag {
            "Nil" => PsValue::Nil,
            "S" | "SBK" | "Version" | "URI" => PsValue::String(decode_escapes(text).into_owned()),
            "XD" => PsValue::String(decode_entities(&decode_escapes(text)).into_owned()),
            "B" => match text.trim() {
                "true" => PsValue::Bool(true),
                "false" => PsValue::Bool(false),
                _ => self.unsupported(node),
            },
            "C" => match text.trim().parse::<u32>().ok().and_then(char::from_u32) {
                Some(c) => PsValue::Char(c),
                None => self.unsupported(node),
            },
            "DT" => PsValue::DateTime(text.trim().to_string()),
            "TS" => PsValue::Duration(text.trim().to_string()),
            "G" | "GUID" => PsValue::Guid(text.trim().to_string()),
            "BA" => match base64::engine::general_purpose::STANDARD.decode(text.trim()) {
                Ok(bytes) => PsValue::Bytes(bytes),
                Err(_) => self.unsupported(node),
            },
            "SS" | "SecureString" => PsValue::SecureString,
            _ => self.unsupported(node),
        }
    }

    fn decode_object(&mut self, node: Node<'_, '_>) -> PsValue {
        let mut obj = PsObject::default();

        for child in node.children().filter(Node::is_element) {
            match child.tag_name().name() {
                "TN" => {
                    let names: Vec<String> = child
                        .children()
                        .filter(|t| t.has_tag_name("T"))
                        .map(|t| decode_escapes(t.text().unwrap_or("")).into_owned())
                        .collect();
                    if let Some(id) = child.attribute("RefId") {
                        self.type_names.insert(id.to_string(), names.clone());
                    }
                    obj.type_names = names;
                }
                "TNRef" => {
                    if let Some(names) = child.attribute("RefId").and_then(|id| self.type_names.get(id)) {
                        obj.type_names = names.clone();
                    }
                }
                "ToString" => {
                    obj.to_string = Some(decode_escapes(child.text().unwrap_or("")).into_owned());
                }
                "Props" | "MS" => {
                    for prop in child.children().filter(Node::is_element) {
                        let name = decode_escapes(prop.attribute("N").unwrap_or("")).into_owned();
                        let value = self.decode(prop);
                        obj.properties.push(PsProperty { name, value });
                    }
                }
                "LST" | "IE" | "STK" | "QUE" => {
                    let items = child
                        .children()
                        .filter(Node::is_element)
                        .map(|item| self.decode(item))
                        .collect();
                    obj.content = ObjectContent::List(items);
                }
                "DCT" => {
                    let mut entries = Vec::new();
                    for entry in child.children().filter(|e| e.has_tag_name("En")) {
                        let mut key = PsValue::Nil;
                        let mut value = PsValue::Nil;
                        for part in entry.children().filter(Node::is_element) {
                            match part.attribute("N") {
                                Some("Key") => key = self.decode(part),
                                Some("Value") => value = self.decode(part),
                                _ => {}
                            }
                        }
                        entries.push((key, value));
                    }
                    obj.content = ObjectContent::Dictionary(entries);
                }
                _ => {
                    obj.content = ObjectContent::Primitive(Box::new(self.decode(child)));
                }
            }
        }

        let value = PsValue::Object(obj);
        if let Some(id) = node.attribute("RefId") {
            self.objects.insert(id.to_string(), (value.clone(), weight(&value)));
        }
        value
    }

    fn unsupported(&self, node: Node<'_, '_>) -> PsValue {
        let raw = self
            .source
            .get(node.range())
            .unwrap_or_default()
            .to_string();
        PsValue::Unsupported {
            tag: node.tag_name().name().to_string(),
            raw,
        }
    }
}

/// Number of values in `value`, itself included.
pub fn weight(value: &PsValue) -> usize {
    let PsValue::Object(obj) = value else {
        return 1;
    };
    let properties: usize = obj.properties.iter().map(|p| weight(&p.value)).sum();
    let content: usize = match &obj.content {
        ObjectContent::Standard => 0,
        ObjectContent::List(items) => items.iter().map(weight).sum(),
        ObjectContent::Dictionary(entries) => entries.iter().map(|(k, v)| weight(k) + weight(v)).sum(),
        ObjectContent::Primitive(inner) => weight(inner),
    };
    1 + properties + content
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitives() {
        assert_eq!(parse("<S>Get-Process</S>").unwrap(), PsValue::String("Get-Process".into()));
        assert_eq!(parse("<S />").unwrap(), PsValue::String(String::new()));
        assert_eq!(parse("<B>true</B>").unwrap(), PsValue::Bool(true));
        assert_eq!(parse("<C>65</C>").unwrap(), PsValue::Char('A'));
        assert_eq!(parse("<Nil />").unwrap(), PsValue::Nil);
        assert_eq!(parse("<BA>AQID</BA>").unwrap(), PsValue::Bytes(vec![1, 2, 3]));
        assert_eq!(parse("<SS>abcd</SS>").unwrap(), PsValue::SecureString);
        assert_eq!(parse("<I32>42</I32>").unwrap().as_i64(), Some(42));
    }

    #[test]
    fn test_string_escapes_decoded() {
        assert_eq!(
            parse("<S>line_x000A_next</S>").unwrap(),
            PsValue::String("line\nnext".into())
        );
    }

    #[test]
    fn test_unknown_tag_is_unsupported() {
        let value = parse("<Weird>x</Weird>").unwrap();
        assert_eq!(
            value,
            PsValue::Unsupported {
                tag: "Weird".into(),
                raw: "<Weird>x</Weird>".into()
            }
        );
        assert_eq!(value.to_string(), "[unsupported-Weird-type]<Weird>x</Weird>");
    }

    #[test]
    fn test_object_with_type_names_and_properties() {
        let xml = r#"<Obj RefId="0"><TN RefId="0"><T>System.Diagnostics.Process</T><T>System.Object</T></TN><ToString>System.Diagnostics.Process (pwsh)</ToString><Props><S N="Name">pwsh</S><I32 N="Id">1234</I32></Props></Obj>"#;
        let value = parse(xml).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.type_name(), Some("System.Diagnostics.Process"));
        assert_eq!(obj.type_names.len(), 2);
        assert_eq!(obj.property("Name").and_then(PsValue::as_str), Some("pwsh"));
        assert_eq!(obj.property("Id").and_then(PsValue::as_i64), Some(1234));
        assert_eq!(value.to_string(), "System.Diagnostics.Process (pwsh)");
    }

    #[test]
    fn test_type_name_and_object_refs() {
        let xml = r#"<Objs><Obj RefId="0"><TN RefId="0"><T>Foo</T></TN><MS><S N="A">1</S></MS></Obj><Obj RefId="1"><TNRef RefId="0" /><MS><Ref N="Same" RefId="0" /></MS></Obj></Objs>"#;
        let values = parse_all(xml).unwrap();
        assert_eq!(values.len(), 2);
        let second = values[1].as_object().unwrap();
        assert_eq!(second.type_name(), Some("Foo"));
        let same = second.property("Same").unwrap();
        assert_eq!(same.property("A").and_then(PsValue::as_str), Some("1"));
    }

    #[test]
    fn test_nested_refs_expansion_is_capped() {
        // Each object references the previous one twice.
        let mut xml = String::from(r#"<Obj RefId="0"><MS><S N="A">x</S></MS></Obj>"#);
        for id in 1..48 {
            xml.push_str(&format!(
                r#"<Obj RefId="{id}"><MS><Ref N="L" RefId="{prev}" /><Ref N="R" RefId="{prev}" /></MS></Obj>"#,
                id = id,
                prev = id - 1
            ));
        }
        let values = parse_all(&format!("<Objs>{}</Objs>", xml)).unwrap();
        assert_eq!(values.len(), 48);

        let total: usize = values.iter().map(weight).sum();
        assert!(total <= MAX_REF_EXPANSION + 4 * 48);

        let last = values.last().unwrap().as_object().unwrap();
        assert!(matches!(
            last.property("R"),
            Some(PsValue::Unsupported { tag, .. }) if tag == "Ref"
        ));
        assert_eq!(weight(&values[3]), 1 + 2 * (1 + 2 * (1 + 2 * 2)));
    }

    #[test]
    fn test_list_and_dictionary() {
        let xml = r#"<Obj><TN><T>System.Collections.Hashtable</T></TN><DCT><En><S N="Key">k</S><I32 N="Value">7</I32></En></DCT></Obj>"#;
        let value = parse(xml).unwrap();
        match &value.as_object().unwrap().content {
            ObjectContent::Dictionary(entries) => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].0, PsValue::String("k".into()));
                assert_eq!(entries[0].1.as_i64(), Some(7));
            }
            other => panic!("unexpected content {:?}", other),
        }

        let list = parse("<Obj><LST><S>a</S><S>b</S></LST></Obj>").unwrap();
        assert_eq!(list.list().map(<[PsValue]>::len), Some(2));
        assert_eq!(list.to_string(), "a,b");
    }

    #[test]
    fn test_enum_wraps_primitive() {
        let xml = r#"<Obj><TN><T>System.Management.Automation.PSInvocationState</T></TN><ToString>Completed</ToString><I32>4</I32></Obj>"#;
        let value = parse(xml).unwrap();
        assert_eq!(value.as_i64(), Some(4));
        assert_eq!(value.to_string(), "Completed");
    }

    #[test]
    fn test_empty_and_malformed() {
        assert!(matches!(parse("  "), Err(ClixmlError::Empty)));
        assert!(matches!(parse("<S>open"), Err(ClixmlError::Xml(_))));
        assert!(matches!(parse("<Objs></Objs>"), Err(ClixmlError::MissingElement(_))));
    }

    #[test]
    fn test_bom_is_ignored() {
        assert_eq!(parse("\u{feff}<S>x</S>").unwrap(), PsValue::String("x".into()));
    }
}
