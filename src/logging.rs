//! Tracing setup for the station binary.
//!
//! The `[logging]` section picks a level and a format. `RUST_LOG`, when set, replaces
//! the configured level. A second [`init`] is a no-op, so tests may call it freely.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{
    filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
    Registry,
};

use crate::config::LoggingSection;

/// Console output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, coloured
    Pretty,
    /// One line per event, no colours
    Compact,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(format: &str) -> Result<Self, Self::Err> {
        match format.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Invalid log format '{}'. Must be one of: pretty, compact, json",
                format
            )),
        }
    }
}

/// Install the global subscriber described by `section`.
pub fn init(section: &LoggingSection) -> Result<(), String> {
    let level: Level = section
        .level
        .parse()
        .map_err(|_| format!("Invalid log level '{}'", section.level))?;
    let format: LogFormat = section.format.parse()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::default().add_directive(LevelFilter::from_level(level).into())
    });

    let layer = fmt::layer().with_thread_names(true);
    let layer: Box<dyn Layer<Registry> + Send + Sync> = match format {
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Compact => layer.compact().with_ansi(false).boxed(),
        LogFormat::Json => layer.json().boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .or_else(|e| {
            if tracing::dispatcher::has_been_set() {
                Ok(())
            } else {
                Err(format!("Failed to initialize tracing: {}", e))
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn section(level: &str, format: &str) -> LoggingSection {
        LoggingSection {
            level: level.into(),
            format: format.into(),
        }
    }

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!("compact".parse::<LogFormat>(), Ok(LogFormat::Compact));
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    #[serial]
    fn test_init_rejects_bad_section() {
        assert!(init(&section("chatty", "pretty")).is_err());
        assert!(init(&section("info", "xml")).is_err());
    }

    #[test]
    #[serial]
    fn test_init_is_idempotent() {
        assert!(init(&section("debug", "compact")).is_ok());
        assert!(init(&section("info", "json")).is_ok());
    }
}
