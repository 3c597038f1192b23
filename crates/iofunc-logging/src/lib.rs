// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Logging initialization for resource managers built on `iofunc-core`
//!
//! The core crate only emits `tracing` events. Binaries pick a subscriber
//! here: console or file, plaintext or JSON, with `RUST_LOG` taking
//! precedence over the command-line level.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use tracing::Level;

/// Output format for log messages
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plaintext,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Plaintext => write!(f, "plaintext"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "plaintext" => Ok(LogFormat::Plaintext),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("Invalid log format: {}. Use 'plaintext' or 'json'", s)),
        }
    }
}

/// Log level accepted on the command line
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CliLogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    /// Includes every deferred reply and delivered event
    Trace,
}

impl From<CliLogLevel> for Level {
    fn from(level: CliLogLevel) -> Self {
        match level {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

/// Logging flags for `#[command(flatten)]`.
///
/// Logs go to stderr unless `--log-file` or `--log-dir` is given, so that
/// stdout stays free for command output.
#[derive(Clone, Debug, Default, clap::Args, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CliLoggingArgs {
    #[arg(long, value_enum, help = "Log verbosity level (default: info)")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<CliLogLevel>,

    #[arg(long, value_enum, help = "Log output format (default: plaintext)")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_format: Option<LogFormat>,

    #[arg(long, help = "Directory for log files")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,

    #[arg(long, help = "Log filename, relative to --log-dir when one is given")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl CliLoggingArgs {
    pub fn init(self, component: &str) -> anyhow::Result<()> {
        let level = self.log_level.unwrap_or_default().into();
        let format = self.log_format.unwrap_or_default();
        match self.resolve_log_path(component) {
            Some(path) => init_to_file(component, level, format, &path),
            None => init(component, level, format),
        }
    }

    /// Where file logging should go, or `None` for the console.
    pub fn resolve_log_path(&self, component: &str) -> Option<PathBuf> {
        match (&self.log_dir, &self.log_file) {
            (_, Some(file)) if file.is_absolute() => Some(file.clone()),
            (Some(dir), Some(file)) => Some(dir.join(file)),
            (None, Some(file)) => Some(file.clone()),
            (Some(dir), None) => Some(dir.join(format!("{}.log", component))),
            (None, None) => None,
        }
    }
}

/// Platform log location for `component`.
///
/// Linux and other Unix systems use the XDG data directory; macOS uses
/// `~/Library/Logs`.
pub fn standard_log_path(component: &str) -> PathBuf {
    let filename = format!("{}.log", component);

    #[cfg(target_os = "macos")]
    {
        let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
        path.push("Library");
        path.push("Logs");
        path.push(filename);
        path
    }

    #[cfg(not(target_os = "macos"))]
    {
        let mut path = dirs::data_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("/tmp"));
        path.push("iofunc");
        path.push(filename);
        path
    }
}

/// Console logging on stderr.
pub fn init(component: &str, default_level: Level, format: LogFormat) -> anyhow::Result<()> {
    init_with_writer(component, default_level, format, io::stderr)
}

/// Append to `log_path`, creating parent directories.
pub fn init_to_file(
    component: &str,
    default_level: Level,
    format: LogFormat,
    log_path: &Path,
) -> anyhow::Result<()> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let log_file = std::fs::OpenOptions::new().create(true).append(true).open(log_path)?;
    init_with_writer(component, default_level, format, log_file)
}

/// The filter used when `RUST_LOG` is unset.
pub fn default_filter(component: &str, default_level: Level) -> String {
    let target = component.replace('-', "_");
    let floor = Level::WARN.min(default_level);
    format!("{floor},{target}={default_level},iofunc_core={default_level}")
}

pub fn init_with_writer<W>(
    component: &str,
    default_level: Level,
    format: LogFormat,
    writer: W,
) -> anyhow::Result<()>
where
    W: for<'writer> tracing_subscriber::fmt::MakeWriter<'writer> + Send + Sync + 'static,
{
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(component, default_level)));

    match format {
        LogFormat::Json => {
            let layer = tracing_subscriber::fmt::layer().with_writer(writer).json();
            #[cfg(debug_assertions)]
            let layer = layer.with_file(true).with_line_number(true);
            tracing_subscriber::registry().with(filter).with(layer).try_init()?;
        }
        LogFormat::Plaintext => {
            let layer = tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false);
            #[cfg(debug_assertions)]
            let layer = layer.with_file(true).with_line_number(true);
            tracing_subscriber::registry().with(filter).with(layer).try_init()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_formats_case_insensitively() {
        assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!("plaintext".parse::<LogFormat>(), Ok(LogFormat::Plaintext));
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::Json.to_string(), "json");
    }

    #[test]
    fn console_unless_a_file_option_is_given() {
        let args = CliLoggingArgs::default();
        assert_eq!(args.resolve_log_path("iofunc-replay"), None);

        let args = CliLoggingArgs {
            log_dir: Some(PathBuf::from("/var/log/rm")),
            ..Default::default()
        };
        assert_eq!(
            args.resolve_log_path("iofunc-replay"),
            Some(PathBuf::from("/var/log/rm/iofunc-replay.log"))
        );

        let args = CliLoggingArgs {
            log_dir: Some(PathBuf::from("/var/log/rm")),
            log_file: Some(PathBuf::from("/tmp/abs.log")),
            ..Default::default()
        };
        assert_eq!(args.resolve_log_path("x"), Some(PathBuf::from("/tmp/abs.log")));

        let args = CliLoggingArgs {
            log_dir: Some(PathBuf::from("logs")),
            log_file: Some(PathBuf::from("run.log")),
            ..Default::default()
        };
        assert_eq!(args.resolve_log_path("x"), Some(PathBuf::from("logs/run.log")));
    }

    #[test]
    fn default_filter_names_component_and_core() {
        let filter = default_filter("iofunc-replay", Level::DEBUG);
        assert_eq!(filter, "WARN,iofunc_replay=DEBUG,iofunc_core=DEBUG");
        let filter = default_filter("rm", Level::ERROR);
        assert!(filter.starts_with("ERROR,"));
    }

    #[test]
    fn standard_path_ends_with_component() {
        let path = standard_log_path("iofunc-replay");
        assert_eq!(path.file_name().and_then(|n| n.to_str()), Some("iofunc-replay.log"));
    }

    #[test]
    fn file_logging_creates_parent_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("rm.log");
        // another test binary may already own the global subscriber
        let _ = init_to_file("rm", Level::INFO, LogFormat::Json, &path);
        assert!(path.exists());
    }
}
