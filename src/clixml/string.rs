//! Serialized string escapes.
//!
//! Characters that XML cannot carry are written as `_xHHHH_`, where `HHHH`
//! is a UTF-16 code unit in hex. Characters outside the BMP appear as two
//! consecutive escapes forming a surrogate pair.

use std::borrow::Cow;

use lazy_static::lazy_static;
use regex::{Captures, Regex};

lazy_static! {
    static ref ESCAPE: Regex = Regex::new(r"_x([0-9A-Fa-f]{4})_").unwrap();

    /// Named and numeric character references left in already-parsed text.
    static ref ENTITY: Regex = Regex::new(r"&(#[0-9]{1,7}|#[xX][0-9A-Fa-f]{1,6}|[a-zA-Z]{2,8});").unwrap();
}

/// Decode `_xHHHH_` escapes.
pub fn decode_escapes(input: &str) -> Cow<'_, str> {
    if !input.contains("_x") {
        return Cow::Borrowed(input);
    }

    let mut out = String::with_capacity(input.len());
    let mut units: Vec<u16> = Vec::new();
    let mut last = 0;
    for caps in ESCAPE.captures_iter(input) {
        let (Some(whole), Some(hex)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        if whole.start() != last {
            flush_units(&mut units, &mut out);
            out.push_str(&input[last..whole.start()]);
        }
        match u16::from_str_radix(hex.as_str(), 16) {
            Ok(unit) => units.push(unit),
            Err(_) => {
                flush_units(&mut units, &mut out);
                out.push_str(whole.as_str());
            }
        }
        last = whole.end();
    }
    flush_units(&mut units, &mut out);
    out.push_str(&input[last..]);
    Cow::Owned(out)
}

fn flush_units(units: &mut Vec<u16>, out: &mut String) {
    if units.is_empty() {
        return;
    }
    out.extend(
        char::decode_utf16(units.drain(..)).map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER)),
    );
}

/// Decode character references such as `&gt;` or `&#10;`.
///
/// Prompt strings and `XD` documents arrive entity-encoded a second time,
/// so the XML parser's own unescaping leaves these behind.
pub fn decode_entities(input: &str) -> Cow<'_, str> {
    if !input.contains('&') {
        return Cow::Borrowed(input);
    }
    ENTITY.replace_all(input, |caps: &Captures<'_>| {
        let body = &caps[1];
        let decoded = if let Some(num) = body.strip_prefix("#x").or_else(|| body.strip_prefix("#X")) {
            u32::from_str_radix(num, 16).ok().and_then(char::from_u32)
        } else if let Some(num) = body.strip_prefix('#') {
            num.parse::<u32>().ok().and_then(char::from_u32)
        } else {
            match body {
                "lt" => Some('<'),
                "gt" => Some('>'),
                "amp" => Some('&'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "nbsp" => Some('\u{a0}'),
                _ => None,
            }
        };
        match decoded {
            Some(c) => c.to_string(),
            None => caps[0].to_string(),
        }
    })
}

/// Decode a serialized string, optionally with a second round of entity
/// decoding.
pub fn decode_string(input: &str, entities: bool) -> String {
    let unescaped = decode_escapes(input);
    if entities {
        decode_entities(&unescaped).into_owned()
    } else {
        unescaped.into_owned()
    }
}
