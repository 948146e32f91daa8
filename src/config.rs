//! Command line arguments.
//!
//! The runtime itself exposes only logging switches; everything else (queen
//! address, key, mount) is provided by the embedding application through
//! [`CellConfig`](crate::cell::CellConfig).

use std::path::PathBuf;

use clap::Parser;

use crate::logging::LogLevel;

/// Command line arguments understood by every cell binary.
#[derive(Parser, Debug, Clone)]
#[command(name = "cell")]
pub struct Args {
    /// The amount of logs to produce. Debug prints everything, and none
    /// prints nothing
    #[arg(
        short = 'l',
        long = "log-level",
        env = "CELL_LOG_LEVEL",
        value_enum,
        default_value = "normal"
    )]
    pub log_level: LogLevel,

    /// The directory in which to store log files. If unspecified, logs will
    /// be written to stdout
    #[arg(short = 'L', long = "log-directory", env = "CELL_LOG_DIRECTORY")]
    pub log_directory: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = Args::parse_from(["cell"]);
        assert_eq!(args.log_level, LogLevel::Normal);
        assert!(args.log_directory.is_none());
    }

    #[test]
    fn log_level_choices() {
        let args = Args::parse_from(["cell", "--log-level", "debug"]);
        assert_eq!(args.log_level, LogLevel::Debug);

        let args = Args::parse_from(["cell", "-l", "none"]);
        assert_eq!(args.log_level, LogLevel::None);
    }

    #[test]
    fn log_directory() {
        let args = Args::parse_from(["cell", "--log-directory", "/var/log/cell"]);
        assert_eq!(args.log_directory, Some(PathBuf::from("/var/log/cell")));
    }
}
