//! Logging bootstrap shared by netdisp binaries.
//!
//! Console output always goes to stderr or stdout as configured; an optional
//! log file is written through a non-blocking `tracing-appender` worker whose
//! guard must be held for the lifetime of the process.

use crate::config::EnvParser;
use std::path::PathBuf;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Errors raised while installing the global subscriber.
#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("invalid log filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("log file path has no file name: {0}")]
    InvalidFile(PathBuf),

    #[error("failed to install tracing subscriber: {0}")]
    Install(String),
}

/// Console output style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl LogFormat {
    fn parse(raw: &str) -> Self {
        match raw {
            "json" => Self::Json,
            "compact" => Self::Compact,
            _ => Self::Pretty,
        }
    }
}

/// Logging configuration assembled from `NETDISP_LOG_*` variables and flags.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
    pub stderr: bool,
    /// Problems found while reading the environment, reported once the
    /// subscriber is up.
    pub warnings: Vec<String>,
}

impl LogConfig {
    /// Read `NETDISP_LOG_LEVEL`, `NETDISP_LOG_FORMAT` and `NETDISP_LOG_FILE`.
    pub fn from_env(default_level: &str) -> Self {
        let mut parser = EnvParser::new();
        let level = parser.get_log_level("LOG_LEVEL", default_level).into_value();
        let format = parser
            .get_choice("LOG_FORMAT", "pretty", &["pretty", "compact", "json"])
            .into_value();
        let file = parser
            .get_optional_string("LOG_FILE")
            .into_value()
            .map(PathBuf::from);
        let warnings = parser
            .take_errors()
            .into_iter()
            .map(|e| e.to_string())
            .collect();

        Self {
            level,
            format: LogFormat::parse(&format),
            file,
            stderr: false,
            warnings,
        }
    }

    pub fn with_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    pub fn with_level(mut self, level: &str) -> Self {
        self.level = level.to_string();
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
            file: None,
            stderr: true,
            warnings: Vec::new(),
        }
    }
}

/// Keeps background log writers alive. Drop flushes them.
#[derive(Default)]
pub struct LoggingGuards {
    _file: Option<WorkerGuard>,
}

fn console_layer(format: LogFormat, stderr: bool) -> BoxedLayer {
    match (format, stderr) {
        (LogFormat::Json, true) => fmt::layer().json().with_writer(std::io::stderr).boxed(),
        (LogFormat::Json, false) => fmt::layer().json().with_writer(std::io::stdout).boxed(),
        (LogFormat::Compact, true) => fmt::layer().compact().with_writer(std::io::stderr).boxed(),
        (LogFormat::Compact, false) => fmt::layer().compact().with_writer(std::io::stdout).boxed(),
        (LogFormat::Pretty, true) => fmt::layer().with_writer(std::io::stderr).boxed(),
        (LogFormat::Pretty, false) => fmt::layer().with_writer(std::io::stdout).boxed(),
    }
}

/// Install the global subscriber described by `config`.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuards, LoggingError> {
    let filter = EnvFilter::try_new(&config.level).map_err(|e| LoggingError::InvalidFilter {
        filter: config.level.clone(),
        reason: e.to_string(),
    })?;

    let mut layers: Vec<BoxedLayer> = vec![console_layer(config.format, config.stderr)];
    let mut guards = LoggingGuards::default();

    if let Some(path) = &config.file {
        let file_name = path
            .file_name()
            .ok_or_else(|| LoggingError::InvalidFile(path.clone()))?;
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let appender = tracing_appender::rolling::never(dir, file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        layers.push(
            fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed(),
        );
        guards._file = Some(guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| LoggingError::Install(e.to_string()))?;

    for warning in &config.warnings {
        tracing::warn!(warning = %warning, "Ignoring invalid logging environment");
    }

    Ok(guards)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_overrides() {
        let config = LogConfig::default()
            .with_level("debug")
            .with_format(LogFormat::Json)
            .with_file("/tmp/netdisp.log");
        assert_eq!(config.level, "debug");
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.file, Some(PathBuf::from("/tmp/netdisp.log")));
        assert!(config.stderr);
    }

    #[test]
    fn test_format_parse_falls_back_to_pretty() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("compact"), LogFormat::Compact);
        assert_eq!(LogFormat::parse("fancy"), LogFormat::Pretty);
    }

    #[test]
    fn test_log_file_without_name_is_rejected() {
        let config = LogConfig::default().with_file("/");
        assert!(matches!(
            init_logging(&config),
            Err(LoggingError::InvalidFile(_))
        ));
    }
}
