//! Partial deserialization of serialized PowerShell objects (CLIXML).

pub mod render;
pub mod string;
pub mod value;

pub use render::{Rendering, ShapeAction, ShapeRegistry};
pub use string::{decode_entities, decode_escapes, decode_string};
pub use value::{parse, parse_all, Decoder, NumberKind, ObjectContent, PsObject, PsProperty, PsValue};
