//! Host method calls (`PIPELINE_HOST_CALL`, `RUNSPACEPOOL_HOST_CALL`).
//!
//! The remote side asks the client's host to perform console operations.
//! The method identifier is `mi` (an enum, read through its `ToString`) and
//! the arguments are the `mp` list.

use crate::clixml::{decode_entities, PsValue};

/// Host methods the tracer renders. Everything else is reported as
/// unsupported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostMethod {
    Write1,
    Write2,
    WriteLine1,
    WriteLine2,
    WriteLine3,
    WriteErrorLine,
    WriteWarningLine,
    WriteVerboseLine,
    WriteDebugLine,
    SetShouldExit,
    Other(String),
}

impl HostMethod {
    pub fn from_name(name: &str) -> Self {
        match name {
            "Write1" => HostMethod::Write1,
            "Write2" => HostMethod::Write2,
            "WriteLine1" => HostMethod::WriteLine1,
            "WriteLine2" => HostMethod::WriteLine2,
            "WriteLine3" => HostMethod::WriteLine3,
            "WriteErrorLine" => HostMethod::WriteErrorLine,
            "WriteWarningLine" => HostMethod::WriteWarningLine,
            "WriteVerboseLine" => HostMethod::WriteVerboseLine,
            "WriteDebugLine" => HostMethod::WriteDebugLine,
            "SetShouldExit" => HostMethod::SetShouldExit,
            other => HostMethod::Other(other.to_string()),
        }
    }

    /// Index of the text argument; the colour variants take foreground and
    /// background colours first.
    fn text_arg(&self) -> usize {
        match self {
            HostMethod::Write2 | HostMethod::WriteLine3 => 2,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HostCall {
    pub name: String,
    pub method: HostMethod,
    /// `None` when the call carries no argument list at all.
    pub args: Option<Vec<PsValue>>,
}

impl HostCall {
    /// Extract the call from a decoded host call message. `None` if the
    /// method identifier is missing.
    pub fn from_value(doc: &PsValue) -> Option<HostCall> {
        let name = doc
            .property("mi")
            .and_then(|mi| match mi {
                PsValue::Object(obj) => obj.to_string.clone(),
                PsValue::String(s) => Some(s.clone()),
                _ => None,
            })?;
        let args = doc
            .property("mp")
            .and_then(PsValue::list)
            .map(|items| items.to_vec());
        Some(HostCall {
            method: HostMethod::from_name(&name),
            name,
            args,
        })
    }
}

/// What a host call amounts to on the user's console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEffect {
    /// Text written to the console.
    Write {
        text: String,
        newline: bool,
        level: log::Level,
    },
    /// The remote session asked the host to exit.
    Exit(i64),
    NoArguments,
    MissingArgument { index: usize, count: usize },
    Unsupported(String),
}

pub fn interpret(call: &HostCall) -> HostEffect {
    if let HostMethod::Other(name) = &call.method {
        return HostEffect::Unsupported(name.clone());
    }
    let args = match &call.args {
        Some(args) if !args.is_empty() => args,
        _ => return HostEffect::NoArguments,
    };

    if call.method == HostMethod::SetShouldExit {
        return HostEffect::Exit(args[0].as_i64().unwrap_or_default());
    }

    let index = call.method.text_arg();
    let Some(arg) = args.get(index) else {
        return HostEffect::MissingArgument {
            index,
            count: args.len(),
        };
    };
    let text = match arg {
        PsValue::String(s) => decode_entities(s).into_owned(),
        other => other.to_string(),
    };

    let (prefix, newline, level) = match call.method {
        HostMethod::Write1 | HostMethod::Write2 => ("", false, log::Level::Info),
        HostMethod::WriteErrorLine => ("", true, log::Level::Warn),
        HostMethod::WriteWarningLine => ("WARNING: ", true, log::Level::Warn),
        HostMethod::WriteVerboseLine => ("VERBOSE: ", true, log::Level::Info),
        HostMethod::WriteDebugLine => ("DEBUG: ", true, log::Level::Debug),
        _ => ("", true, log::Level::Info),
    };
    HostEffect::Write {
        text: format!("{}{}", prefix, text),
        newline,
        level,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clixml::parse;

    fn call(method: &str, args: &str) -> HostCall {
        let xml = format!(
            r#"<Obj RefId="0"><MS><I64 N="ci">-100</I64><Obj N="mi" RefId="1"><TN RefId="0"><T>System.Management.Automation.Remoting.RemoteHostMethodId</T></TN><ToString>{}</ToString><I32>15</I32></Obj>{}</MS></Obj>"#,
            method, args
        );
        HostCall::from_value(&parse(&xml).unwrap()).unwrap()
    }

    fn mp(items: &str) -> String {
        format!(r#"<Obj N="mp" RefId="2"><TN RefId="1"><T>System.Collections.ArrayList</T></TN><LST>{}</LST></Obj>"#, items)
    }

    #[test]
    fn test_write_line2() {
        let c = call("WriteLine2", &mp("<S>hello</S>"));
        assert_eq!(c.method, HostMethod::WriteLine2);
        assert_eq!(
            interpret(&c),
            HostEffect::Write {
                text: "hello".into(),
                newline: true,
                level: log::Level::Info
            }
        );
    }

    #[test]
    fn test_coloured_write_uses_third_argument() {
        let c = call("Write2", &mp("<I32>15</I32><I32>0</I32><S>PS&gt; </S>"));
        assert_eq!(
            interpret(&c),
            HostEffect::Write {
                text: "PS> ".into(),
                newline: false,
                level: log::Level::Info
            }
        );
        let short = call("WriteLine3", &mp("<I32>15</I32>"));
        assert_eq!(interpret(&short), HostEffect::MissingArgument { index: 2, count: 1 });
    }

    #[test]
    fn test_stream_prefixes() {
        let c = call("WriteWarningLine", &mp("<S>careful</S>"));
        assert!(matches!(
            interpret(&c),
            HostEffect::Write { text, level: log::Level::Warn, .. } if text == "WARNING: careful"
        ));
    }

    #[test]
    fn test_no_arguments() {
        assert_eq!(interpret(&call("WriteLine1", "")), HostEffect::NoArguments);
        assert_eq!(interpret(&call("WriteLine2", &mp(""))), HostEffect::NoArguments);
    }

    #[test]
    fn test_set_should_exit() {
        assert_eq!(interpret(&call("SetShouldExit", &mp("<I32>3</I32>"))), HostEffect::Exit(3));
    }

    #[test]
    fn test_unsupported_method() {
        assert_eq!(
            interpret(&call("ReadLine", "")),
            HostEffect::Unsupported("ReadLine".into())
        );
    }

    #[test]
    fn test_missing_method_id() {
        let doc = parse(r#"<Obj><MS><I64 N="ci">1</I64></MS></Obj>"#).unwrap();
        assert!(HostCall::from_value(&doc).is_none());
    }
}
