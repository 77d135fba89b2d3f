//! Tracing integration for structured logging.

use std::path::Path;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::Result;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// Structured JSON output.
    Json,
}

fn level_for(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    }
}

/// Initialize the logging system.
///
/// `verbosity` maps 0..=4 onto error..trace; `RUST_LOG` overrides it.
/// With `log_file` set, output is appended to the file without ANSI codes.
pub fn init_logging(verbosity: u8, log_file: Option<&Path>, format: LogFormat) -> Result<()> {
    let level = level_for(verbosity);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "mqtt_shell={level},mshell_core={level},mshell_client={level},mshell_server={level}"
        ))
    });

    let registry = tracing_subscriber::registry().with(filter);
    let init_err = |e: tracing_subscriber::util::TryInitError| {
        crate::Error::Io(std::io::Error::other(e.to_string()))
    };

    match (log_file, format) {
        (None, LogFormat::Text) => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_file(verbosity >= 3)
                    .with_line_number(verbosity >= 3),
            )
            .try_init()
            .map_err(init_err)?,
        (None, LogFormat::Json) => registry
            .with(fmt::layer().json())
            .try_init()
            .map_err(init_err)?,
        (Some(path), fmt_kind) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            match fmt_kind {
                LogFormat::Text => registry
                    .with(fmt::layer().with_writer(file).with_ansi(false))
                    .try_init()
                    .map_err(init_err)?,
                LogFormat::Json => registry
                    .with(fmt::layer().json().with_writer(file))
                    .try_init()
                    .map_err(init_err)?,
            }
        }
    }

    Ok(())
}

/// Initialize logging with defaults for testing; ignores re-init errors.
pub fn init_test_logging() {
    let _ = init_logging(2, None, LogFormat::Text);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_default_is_text() {
        assert_eq!(LogFormat::default(), LogFormat::Text);
    }

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(level_for(0), "error");
        assert_eq!(level_for(2), "info");
        assert_eq!(level_for(9), "trace");
    }
}
