//! Console-style rendering of decoded values.
//!
//! Complex objects are rendered according to a [`ShapeRegistry`], a table
//! keyed by type name that can be extended at run time. Objects whose type
//! has no entry fall back to a generic rendering and are reported as
//! unshaped so the caller can log them.

use std::collections::HashMap;

use crate::clixml::value::{ObjectContent, PsObject, PsValue};

/// How an object of a given type is shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeAction {
    /// Not relevant to a command trace.
    Ignore,
    /// One `Name: value` line per property.
    PropertyList,
    /// The object's `ToString` text.
    ToString,
}

/// The result of rendering an output value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rendering {
    /// Nothing to show (`Nil`, or a type registered as ignored).
    Hidden,
    Text(String),
    /// An object with no registered shape, shown as best as possible.
    Unshaped { type_name: String, text: String },
}

#[derive(Debug, Clone)]
pub struct ShapeRegistry {
    shapes: HashMap<String, ShapeAction>,
}

impl Default for ShapeRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(
            "Selected.Microsoft.PowerShell.Commands.GenericMeasureInfo",
            ShapeAction::Ignore,
        );
        registry.register(
            "Selected.System.Management.Automation.CmdletInfo",
            ShapeAction::Ignore,
        );
        registry.register(
            "Selected.System.Management.ManagementObject",
            ShapeAction::PropertyList,
        );
        registry.register(
            "Deserialized.System.Management.Automation.PSCustomObject",
            ShapeAction::PropertyList,
        );
        registry.register("System.Management.Automation.PSCustomObject", ShapeAction::PropertyList);
        registry
    }
}

impl ShapeRegistry {
    pub fn empty() -> Self {
        Self {
            shapes: HashMap::new(),
        }
    }

    /// Add or replace the shape for a type name.
    pub fn register(&mut self, type_name: impl Into<String>, action: ShapeAction) {
        self.shapes.insert(type_name.into(), action);
    }

    /// The shape of the most derived registered type of `obj`.
    pub fn lookup(&self, obj: &PsObject) -> Option<ShapeAction> {
        obj.type_names
            .iter()
            .find_map(|name| self.shapes.get(name).copied())
    }

    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    /// Render a pipeline output value as the interactive console would.
    pub fn render(&self, value: &PsValue) -> Rendering {
        match value {
            PsValue::Nil => Rendering::Hidden,
            PsValue::Object(obj) => self.render_object(obj),
            PsValue::Unsupported { tag, .. } => Rendering::Unshaped {
                type_name: tag.clone(),
                text: value.to_string(),
            },
            other => Rendering::Text(other.to_string()),
        }
    }

    fn render_object(&self, obj: &PsObject) -> Rendering {
        match self.lookup(obj) {
            Some(ShapeAction::Ignore) => Rendering::Hidden,
            Some(ShapeAction::PropertyList) => Rendering::Text(property_list(obj)),
            Some(ShapeAction::ToString) => Rendering::Text(obj.to_string.clone().unwrap_or_default()),
            None => match &obj.content {
                ObjectContent::Primitive(inner) => match &obj.to_string {
                    Some(s) => Rendering::Text(s.clone()),
                    None => self.render(inner),
                },
                ObjectContent::List(items) => {
                    let mut unshaped = None;
                    let lines: Vec<String> = items
                        .iter()
                        .filter_map(|item| match self.render(item) {
                            Rendering::Hidden => None,
                            Rendering::Text(text) => Some(text),
                            Rendering::Unshaped { type_name, text } => {
                                unshaped.get_or_insert(type_name);
                                Some(text)
                            }
                        })
                        .collect();
                    let text = lines.join("\n");
                    match unshaped {
                        // The first unshaped item names the list.
                        Some(type_name) => Rendering::Unshaped { type_name, text },
                        None => Rendering::Text(text),
                    }
                }
                _ => Rendering::Unshaped {
                    type_name: obj.type_name().unwrap_or("").to_string(),
                    text: obj
                        .to_string
                        .clone()
                        .unwrap_or_else(|| property_list(obj)),
                },
            },
        }
    }
}

fn property_list(obj: &PsObject) -> String {
    let lines: Vec<String> = obj
        .properties
        .iter()
        .map(|p| {
            if p.name.is_empty() {
                p.value.to_string()
            } else {
                format!("{}: {}", p.name, p.value)
            }
        })
        .collect();
    lines.join("\n")
}
