//! Log output for the command-line front end.
//!
//! Console messages go to stderr at the level the user asks for. When a logs
//! directory is given, every event is also kept in `session.log` there,
//! replaced on each run.

use std::fs::{self, File};
use std::path::Path;

use tracing::Level;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Installs the global subscriber.
///
/// `RUST_LOG` takes precedence over `console_level` for the console.
///
/// # Errors
///
/// - `Box<dyn std::error::Error>` - Log file could not be created or a
///   subscriber is already installed
pub fn init_tracing(
    console_level: Level,
    logs_dir: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let console_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(console_level).into())
        .from_env_lossy();
    let console = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    let session_log = match logs_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let file = File::create(dir.join("session.log"))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_line_number(true)
                    .with_writer(file)
                    .with_filter(LevelFilter::TRACE),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(session_log)
        .try_init()?;
    Ok(())
}

/// `--log-level` choices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliLogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl CliLogLevel {
    pub fn as_tracing_level(self) -> Level {
        match self {
            Self::Error => Level::ERROR,
            Self::Warn => Level::WARN,
            Self::Info => Level::INFO,
            Self::Debug => Level::DEBUG,
            Self::Trace => Level::TRACE,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::ValueEnum;

    use super::*;

    #[test]
    fn test_levels_parse_from_flag_values() {
        let parsed = CliLogLevel::from_str("debug", true).unwrap();
        assert_eq!(parsed.as_tracing_level(), Level::DEBUG);
        assert_eq!(
            CliLogLevel::from_str("WARN", true).unwrap().as_tracing_level(),
            Level::WARN
        );
        assert!(CliLogLevel::from_str("verbose", true).is_err());
    }
}
