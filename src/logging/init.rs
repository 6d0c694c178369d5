//! Logger initialisation.

use crate::config::LogConfig;

/// Install the global `env_logger` according to `config`.
///
/// Configured directives are applied first and `RUST_LOG` last, so the
/// environment can still override a single component at run time. Calling
/// this more than once is harmless.
pub fn init_logger(config: &LogConfig) {
    let level = config.level_filter().unwrap_or_else(|e| {
        eprintln!("{}; falling back to info", e);
        log::LevelFilter::Info
    });

    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(level)
        .parse_filters(&config.effective_directives())
        .parse_env("RUST_LOG");

    if config.timestamps {
        builder.format_timestamp_millis();
    } else {
        builder.format_timestamp(None);
    }

    let _ = builder.try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        let config = LogConfig::default();
        init_logger(&config);
        init_logger(&config);
        log::info!(target: "remoteps::tracer", "LOGGER_READY");
    }
}
