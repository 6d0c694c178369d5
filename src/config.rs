//! Tracer configuration.
//!
//! Loaded from JSON (string or file). Every field has a default so an empty
//! object `{}` is a valid configuration.

use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::logging::{component, DEFAULT_NAMESPACE};

/// Top-level configuration for a trace pipeline.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TracerConfig {
    pub log: LogConfig,
    /// WinRM stream data is framed in compression blocks.
    pub compressed_streams: bool,
    /// Attach a console sink rendering what the remote user would see.
    pub interactive: bool,
    /// Events emitted by these processes are dropped before decoding.
    pub exclude_process_ids: Vec<u32>,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            compressed_streams: true,
            interactive: true,
            exclude_process_ids: Vec::new(),
        }
    }
}

impl TracerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn excludes(&self, process_id: u32) -> bool {
        self.exclude_process_ids.contains(&process_id)
    }
}

/// Logger settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    /// Root of the log target hierarchy.
    pub namespace: String,
    /// Level for targets without a directive (error, warn, info, debug, trace, off).
    pub level: String,
    /// `env_logger` directives, e.g. `remoteps::defrag=debug,remoteps::soap=warn`.
    /// When absent, per-component defaults apply.
    pub directives: Option<String>,
    pub timestamps: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            level: "info".to_string(),
            directives: None,
            timestamps: true,
        }
    }
}

impl LogConfig {
    /// Parsed default level.
    pub fn level_filter(&self) -> Result<log::LevelFilter, ConfigError> {
        self.level
            .parse()
            .map_err(|_| ConfigError::InvalidLevel(self.level.clone()))
    }

    /// Directives to hand to the logger: the configured ones, or the quiet
    /// per-component defaults with the command trace at debug.
    pub fn effective_directives(&self) -> String {
        match &self.directives {
            Some(d) => d.clone(),
            None => self.default_directives(),
        }
    }

    fn default_directives(&self) -> String {
        let level_for = |name: &str| match name {
            component::WSMAN | component::DEFRAG => "error",
            component::TRACER => "debug",
            _ => "warn",
        };
        component::ALL
            .iter()
            .map(|name| format!("{}::{}={}", self.namespace, name, level_for(name)))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_gives_defaults() {
        let config = TracerConfig::from_json_str("{}").unwrap();
        assert_eq!(config, TracerConfig::default());
        assert!(config.compressed_streams);
    }

    #[test]
    fn test_partial_json() {
        let config = TracerConfig::from_json_str(
            r#"{"compressed_streams": false, "log": {"level": "debug", "directives": "remoteps::soap=trace"}}"#,
        )
        .unwrap();
        assert!(!config.compressed_streams);
        assert_eq!(config.log.namespace, "remoteps");
        assert_eq!(config.log.level_filter().unwrap(), log::LevelFilter::Debug);
        assert_eq!(config.log.effective_directives(), "remoteps::soap=trace");
    }

    #[test]
    fn test_excluded_processes() {
        let config = TracerConfig::from_json_str(r#"{"exclude_process_ids": [4, 812]}"#).unwrap();
        assert!(config.excludes(812));
        assert!(!config.excludes(813));
        assert!(!TracerConfig::default().excludes(4));
    }

    #[test]
    fn test_default_directives_per_component() {
        let directives = LogConfig::default().effective_directives();
        assert!(directives.contains("remoteps::defrag=error"));
        assert!(directives.contains("remoteps::tracer=debug"));
        assert!(directives.contains("remoteps::soap=warn"));
        assert_eq!(directives.split(',').count(), component::ALL.len());
    }

    #[test]
    fn test_invalid_level() {
        let config = LogConfig {
            level: "loud".to_string(),
            ..LogConfig::default()
        };
        assert!(matches!(
            config.level_filter(),
            Err(ConfigError::InvalidLevel(_))
        ));
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            TracerConfig::from_json_str("{not json"),
            Err(ConfigError::Json(_))
        ));
    }
}
