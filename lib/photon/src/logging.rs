//! Structured logging plumbing shared by every crate in the workspace.
//!
//! Re-exports the `slog` surface so downstream modules can depend on a single
//! `photon::logging` path, and provides builders for the two supported setups:
//! a terminal logger with sane defaults and a TOML-configured logger.

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::{Build, Config, LoggerConfig};

/// Builds the default terminal logger (debug level, stderr).
pub fn init() -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(Severity::Debug);
    builder.destination(Destination::Stderr);
    builder.build().expect("Error building terminal logger")
}

/// Builds a logger from a TOML configuration snippet, e.g.
///
/// ```toml
/// type = "terminal"
/// level = "debug"
/// destination = "stderr"
/// ```
pub fn from_toml(toml: &str) -> Result<Logger, String> {
    let config: LoggerConfig = serdeconv::from_toml_str(toml).map_err(|err| err.to_string())?;
    config.build_logger().map_err(|err| err.to_string())
}

/// A logger that drops everything. Used wherever a component is constructed
/// without a parent logger.
#[inline]
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

/// Resolves an optional parent logger into a child logger for a component.
#[inline]
pub fn child<'a, L: Into<Option<&'a Logger>>>(parent: L, values: slog::OwnedKV<impl slog::SendSyncRefUnwindSafeKV + 'static>) -> Logger {
    match parent.into() {
        Some(log) => log.new(values),
        None => Logger::root(Discard, values),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_toml() {
        let log = from_toml(
            r#"
type = "terminal"
level = "info"
destination = "stderr"
"#,
        )
        .unwrap();

        info!(log, "logger built"; "source" => "toml");
    }

    #[test]
    fn test_from_toml_invalid() {
        assert!(from_toml("type = \"no-such-sink\"").is_err());
    }

    #[test]
    fn test_child_of_none() {
        let log = child(None, o!("component" => "test"));
        debug!(log, "dropped on the floor");
    }
}
