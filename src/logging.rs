//! Tracing setup.
//!
//! Builds a `tracing-subscriber` registry with an [`EnvFilter`] and one of
//! three formatters. `RUST_LOG` overrides the configured level.
//!
//! ```no_run
//! use autolab::logging::{self, LoggingSettings, OutputFormat};
//!
//! # fn main() -> Result<(), autolab::error::LabError> {
//! logging::init(&LoggingSettings {
//!     format: OutputFormat::Json,
//!     ..Default::default()
//! })?;
//! tracing::info!(device = "pump1", "Connected");
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::error::{LabError, LabResult};

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Multi-line, coloured (development).
    #[default]
    Pretty,
    /// One line per event, no colours.
    Compact,
    /// Structured JSON for log aggregation.
    Json,
}

/// Logging section of the lab configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// trace, debug, info, warn or error.
    pub level: String,
    /// Formatter.
    pub format: OutputFormat,
    /// Emit span open/close events.
    pub with_span_events: bool,
    /// Include source file and line.
    pub with_file_and_line: bool,
    /// Colours for the pretty format.
    pub with_ansi: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: OutputFormat::Pretty,
            with_span_events: false,
            with_file_and_line: false,
            with_ansi: true,
        }
    }
}

impl LoggingSettings {
    /// Parsed level.
    pub fn level(&self) -> LabResult<Level> {
        parse_log_level(&self.level)
    }
}

/// Install the global subscriber.
///
/// Calling it again after a subscriber is installed is not an error, so
/// tests and embedding applications may call it freely.
pub fn init(settings: &LoggingSettings) -> LabResult<()> {
    let level = settings.level()?;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let span_events = if settings.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = match settings.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_span_events(span_events)
            .with_file(settings.with_file_and_line)
            .with_line_number(settings.with_file_and_line)
            .with_ansi(settings.with_ansi)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_span_events(span_events)
            .with_file(settings.with_file_and_line)
            .with_line_number(settings.with_file_and_line)
            .with_ansi(false)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_span_events(span_events)
            .with_file(settings.with_file_and_line)
            .with_line_number(settings.with_file_and_line)
            .with_filter(env_filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .or_else(|e| {
            // Expected in tests and when an embedding application already
            // installed its own subscriber.
            let message = e.to_string();
            if message.contains("a global default trace dispatcher has already been set")
                || message.contains("logging system was already initialized")
            {
                Ok(())
            } else {
                Err(LabError::Configuration(format!(
                    "failed to initialize tracing: {e}"
                )))
            }
        })
}

fn parse_log_level(level: &str) -> LabResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(LabError::Configuration(format!(
            "invalid log level '{level}'; expected trace, debug, info, warn or error"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_levels_case_insensitively() {
        assert_eq!(parse_log_level("DEBUG").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("warn").unwrap(), Level::WARN);
        assert!(matches!(
            parse_log_level("loud"),
            Err(LabError::Configuration(_))
        ));
    }

    // `init` installs the process-wide subscriber; see tests/logging_init.rs.
}
