//! Logging configuration and global subscriber installation.

use std::path::PathBuf;
use std::str::FromStr;

use tracing_subscriber::filter::ParseError;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::error::{TelemetryError, TelemetryResult};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Multi-line, human-friendly output.
    Pretty,
    /// One line per event.
    #[default]
    Compact,
    /// Structured JSON, one object per line.
    Json,
    /// The default `tracing-subscriber` format with all fields.
    Full,
}

impl FromStr for LogFormat {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            "full" => Ok(Self::Full),
            other => Err(TelemetryError::UnknownFormat(other.to_owned())),
        }
    }
}

/// Where log lines are written.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogTarget {
    /// Standard output.
    Stdout,
    /// Standard error.
    #[default]
    Stderr,
    /// Append to a file (parent directories are created).
    File(PathBuf),
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Global level filter (`"info"`, `"debug"`, ...).
    pub level: String,
    /// Output format.
    pub format: LogFormat,
    /// Extra per-target directives (`"hotplug_plugins=trace"`).
    pub directives: Vec<String>,
    /// Output destination.
    pub target: LogTarget,
}

impl LogConfig {
    /// Create a config with the given level and default format/target.
    #[must_use]
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            format: LogFormat::default(),
            directives: Vec::new(),
            target: LogTarget::default(),
        }
    }

    /// Set the output format.
    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Add a per-target directive.
    #[must_use]
    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    /// Set the output destination.
    #[must_use]
    pub fn with_target(mut self, target: LogTarget) -> Self {
        self.target = target;
        self
    }

    /// Build the level filter. `RUST_LOG` wins when it is set and valid.
    fn build_filter(&self) -> TelemetryResult<EnvFilter> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        let mut filter =
            EnvFilter::try_new(&self.level).map_err(|e| TelemetryError::InvalidFilter {
                filter: self.level.clone(),
                message: e.to_string(),
            })?;
        for directive in &self.directives {
            let parsed = directive
                .parse()
                .map_err(|e: ParseError| TelemetryError::InvalidFilter {
                    filter: directive.clone(),
                    message: e.to_string(),
                })?;
            filter = filter.add_directive(parsed);
        }
        Ok(filter)
    }

    fn build_writer(&self) -> TelemetryResult<BoxMakeWriter> {
        Ok(match &self.target {
            LogTarget::Stdout => BoxMakeWriter::new(std::io::stdout),
            LogTarget::Stderr => BoxMakeWriter::new(std::io::stderr),
            LogTarget::File(path) => {
                let dir = path
                    .parent()
                    .map_or_else(|| PathBuf::from("."), std::path::Path::to_path_buf);
                let file_name = path
                    .file_name()
                    .ok_or_else(|| TelemetryError::InvalidLogPath(path.clone()))?;
                std::fs::create_dir_all(&dir).map_err(|source| TelemetryError::LogDirectory {
                    path: dir.clone(),
                    source,
                })?;
                BoxMakeWriter::new(tracing_appender::rolling::never(dir, file_name))
            },
        })
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new("info")
    }
}

#[cfg(feature = "config")]
impl TryFrom<&hotplug_config::LoggingSection> for LogConfig {
    type Error = TelemetryError;

    fn try_from(section: &hotplug_config::LoggingSection) -> Result<Self, Self::Error> {
        let mut config = Self::new(section.level.clone()).with_format(section.format.parse()?);
        config.directives.clone_from(&section.directives);
        Ok(config)
    }
}

/// Install the global `tracing` subscriber described by `config`.
///
/// # Errors
///
/// - [`TelemetryError::InvalidFilter`] for a bad level or directive
/// - [`TelemetryError::InvalidLogPath`] or [`TelemetryError::LogDirectory`]
///   for an unusable file target
/// - [`TelemetryError::AlreadyInitialized`] if a global subscriber is
///   already installed
pub fn setup_logging(config: &LogConfig) -> TelemetryResult<()> {
    let filter = config.build_filter()?;
    let writer = config.build_writer()?;

    let base = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_target(true);
    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Pretty => base.pretty().boxed(),
        LogFormat::Compact => base.compact().boxed(),
        LogFormat::Json => base.json().boxed(),
        LogFormat::Full => base.boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()
        .map_err(|e| TelemetryError::AlreadyInitialized(e.to_string()))
}

/// Install an info-level compact subscriber writing to stderr.
///
/// # Errors
///
/// Returns [`TelemetryError::AlreadyInitialized`] if a global subscriber is
/// already installed.
pub fn setup_default_logging() -> TelemetryResult<()> {
    setup_logging(&LogConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_parses_case_insensitively() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn builder_accumulates_directives() {
        let config = LogConfig::new("debug")
            .with_format(LogFormat::Json)
            .with_directive("hotplug_plugins=trace")
            .with_directive("reqwest=warn");
        assert_eq!(config.level, "debug");
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.directives.len(), 2);
        assert_eq!(config.target, LogTarget::Stderr);
    }

    #[test]
    fn invalid_directive_is_reported_by_name() {
        // Only meaningful when RUST_LOG does not short-circuit the filter.
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LogConfig::new("info").with_directive("hotplug_plugins=verbose");
        assert!(matches!(
            config.build_filter(),
            Err(TelemetryError::InvalidFilter { filter, .. }) if filter == "hotplug_plugins=verbose"
        ));
    }

    #[test]
    fn unknown_format_is_named() {
        assert!(matches!(
            "xml".parse::<LogFormat>(),
            Err(TelemetryError::UnknownFormat(name)) if name == "xml"
        ));
    }

    #[test]
    fn file_target_without_name_is_rejected() {
        let config = LogConfig::new("info").with_target(LogTarget::File(PathBuf::from("/")));
        assert!(matches!(
            config.build_writer(),
            Err(TelemetryError::InvalidLogPath(_))
        ));
    }

    #[test]
    fn file_target_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("hotplug.log");
        let config = LogConfig::new("info").with_target(LogTarget::File(path));
        assert!(config.build_writer().is_ok());
        assert!(dir.path().join("logs").is_dir());
    }

    #[test]
    fn second_install_fails() {
        // Whichever call runs first wins; the second must fail.
        let _ = setup_default_logging();
        assert!(matches!(
            setup_default_logging(),
            Err(TelemetryError::AlreadyInitialized(_))
        ));
    }
}
