//! Structured logging utilities.
//!
//! Every pipeline component logs under its own target (`<namespace>::<component>`)
//! so that an operator can raise or lower the detail of one layer with an
//! `env_logger` directive such as `remoteps::defrag=debug`. Log lines carry a
//! [`LogContext`] prefix naming the shell, command and fragment stream they
//! relate to.

use std::fmt;

use uuid::Uuid;

/// Default root of the log target hierarchy.
pub const DEFAULT_NAMESPACE: &str = "remoteps";

/// Component names, one per pipeline stage.
pub mod component {
    pub const CAPTURE: &str = "capture";
    pub const SOAP: &str = "soap";
    pub const WSMAN: &str = "wsman";
    pub const PROVIDER: &str = "provider";
    pub const DEFRAG: &str = "defrag";
    pub const PARSER: &str = "parser";
    pub const TRACER: &str = "tracer";

    pub const ALL: [&str; 7] = [CAPTURE, SOAP, WSMAN, PROVIDER, DEFRAG, PARSER, TRACER];
}

/// A component-scoped log target, handed to each stage at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogScope {
    target: String,
}

impl LogScope {
    pub fn new(namespace: &str, component: &str) -> Self {
        let target = if namespace.is_empty() {
            component.to_string()
        } else {
            format!("{}::{}", namespace, component)
        };
        Self { target }
    }

    /// Scope under the default namespace.
    pub fn component(component: &str) -> Self {
        Self::new(DEFAULT_NAMESPACE, component)
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn enabled(&self, level: log::Level) -> bool {
        log::log_enabled!(target: self.target(), level)
    }
}

/// Correlation fields prefixed to log lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogContext {
    pub shell_id: Option<String>,
    pub command_id: Option<String>,
    pub object_id: Option<u64>,
    pub rpid: Option<Uuid>,
    pub pid: Option<Uuid>,
}

impl LogContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_shell(shell_id: &str) -> Self {
        Self {
            shell_id: Some(shell_id.to_string()),
            ..Self::default()
        }
    }

    pub fn with_command(mut self, command_id: Option<&str>) -> Self {
        self.command_id = command_id.map(|c| c.to_string());
        self
    }

    pub fn with_object(mut self, object_id: u64) -> Self {
        self.object_id = Some(object_id);
        self
    }

    pub fn with_runspace(mut self, rpid: Uuid, pid: Option<Uuid>) -> Self {
        self.rpid = Some(rpid);
        self.pid = pid;
        self
    }
}

impl fmt::Display for LogContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut sep = |f: &mut fmt::Formatter<'_>| -> fmt::Result {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            Ok(())
        };

        if let Some(shell) = &self.shell_id {
            sep(f)?;
            write!(f, "[shell={}]", shell)?;
        }
        if let Some(command) = &self.command_id {
            sep(f)?;
            write!(f, "[command={}]", command)?;
        }
        if let Some(object) = self.object_id {
            sep(f)?;
            write!(f, "[object={}]", object)?;
        }
        if let Some(rpid) = &self.rpid {
            sep(f)?;
            write!(f, "[rpid={}]", rpid)?;
        }
        if let Some(pid) = &self.pid {
            sep(f)?;
            write!(f, "[pid={}]", pid)?;
        }
        if first {
            f.write_str("[-]")?;
        }
        Ok(())
    }
}

/// Log an info event under a scope with context.
#[macro_export]
macro_rules! log_info {
    ($scope:expr, $ctx:expr, $event:expr $(, $key:ident = $value:expr)* $(,)?) => {
        log::info!(
            target: $scope.target(),
            "{} {} {}",
            $ctx,
            $event,
            format_args!(concat!($(stringify!($key), "={:?} "),*), $($value),*)
        );
    };
}

/// Log a warning event under a scope with context.
#[macro_export]
macro_rules! log_warn {
    ($scope:expr, $ctx:expr, $event:expr $(, $key:ident = $value:expr)* $(,)?) => {
        log::warn!(
            target: $scope.target(),
            "{} {} {}",
            $ctx,
            $event,
            format_args!(concat!($(stringify!($key), "={:?} "),*), $($value),*)
        );
    };
}

/// Log an error event under a scope with context.
#[macro_export]
macro_rules! log_error {
    ($scope:expr, $ctx:expr, $event:expr $(, $key:ident = $value:expr)* $(,)?) => {
        log::error!(
            target: $scope.target(),
            "{} {} {}",
            $ctx,
            $event,
            format_args!(concat!($(stringify!($key), "={:?} "),*), $($value),*)
        );
    };
}

/// Log a debug event under a scope with context.
#[macro_export]
macro_rules! log_debug {
    ($scope:expr, $ctx:expr, $event:expr $(, $key:ident = $value:expr)* $(,)?) => {
        log::debug!(
            target: $scope.target(),
            "{} {} {}",
            $ctx,
            $event,
            format_args!(concat!($(stringify!($key), "={:?} "),*), $($value),*)
        );
    };
}
