//! Logging sub-reporter.
//!
//! Installs a `tracing-subscriber` pipeline built from configuration:
//! level filter, text or JSON formatting, stderr or file destination.
//! The file destination writes through a non-blocking appender whose
//! worker guard is held until `stop`, so buffered lines are flushed on
//! shutdown.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::ConfigError;

fn default_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level or filter directive, e.g. `info` or `beacon=debug,warn`.
    pub level: String,
    pub format: LogFormat,
    /// Either the plain string `stderr` or a `file: {path}` map.
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub destination: LogDestination,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::Text,
            destination: LogDestination::Stderr,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogDestination {
    #[default]
    Stderr,
    File {
        path: PathBuf,
    },
}

pub struct LoggingReporter {
    config: LoggingConfig,
    guard: Option<WorkerGuard>,
}

impl std::fmt::Debug for LoggingReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoggingReporter")
            .field("config", &self.config)
            .field("running", &self.guard.is_some())
            .finish()
    }
}

impl LoggingReporter {
    /// Validates the filter directive; the subscriber itself is only
    /// installed by [`start`](Self::start).
    pub fn new(config: LoggingConfig) -> Result<Self, ConfigError> {
        build_filter(&config.level)?;
        if let LogDestination::File { path } = &config.destination {
            if path.file_name().is_none() {
                return Err(ConfigError::MissingField {
                    section: "logging",
                    field: "destination.file.path",
                });
            }
        }
        Ok(Self { config, guard: None })
    }

    /// Install the configured subscriber as the global default.
    ///
    /// A subscriber may already be installed (another library, a test
    /// harness); that is reported at debug level and otherwise ignored,
    /// so embedding applications keep their own pipeline.
    pub fn start(&mut self) -> Result<(), ConfigError> {
        let filter = build_filter(&self.config.level)?;
        let installed = match &self.config.destination {
            LogDestination::Stderr => install(filter, self.config.format, std::io::stderr),
            LogDestination::File { path } => {
                let (writer, guard) = file_writer(path)?;
                self.guard = Some(guard);
                install(filter, self.config.format, writer)
            }
        };
        if !installed {
            debug!("a global subscriber is already installed; keeping it");
        }
        Ok(())
    }

    /// Release the appender guard, flushing any buffered log lines.
    pub fn stop(&mut self) {
        self.guard.take();
    }
}

fn build_filter(level: &str) -> Result<EnvFilter, ConfigError> {
    EnvFilter::try_new(level).map_err(|error| ConfigError::InvalidLevel {
        value: level.to_string(),
        message: error.to_string(),
    })
}

fn file_writer(
    path: &Path,
) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard), ConfigError> {
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let file_name = path.file_name().ok_or(ConfigError::MissingField {
        section: "logging",
        field: "destination.file.path",
    })?;
    let appender = tracing_appender::rolling::never(directory, file_name);
    Ok(tracing_appender::non_blocking(appender))
}

/// Returns false when a global subscriber was already installed.
fn install<W>(filter: EnvFilter, format: LogFormat, writer: W) -> bool
where
    W: for<'a> tracing_subscriber::fmt::MakeWriter<'a> + Send + Sync + 'static,
{
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    match format {
        LogFormat::Text => builder.try_init().is_ok(),
        LogFormat::Json => builder.json().try_init().is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_info_text_stderr() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, LogFormat::Text);
        assert!(matches!(config.destination, LogDestination::Stderr));
    }

    #[test]
    fn bad_level_fails_construction() {
        let config = LoggingConfig { level: "verbose[".to_string(), ..LoggingConfig::default() };
        let err = LoggingReporter::new(config).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidLevel { .. }));
    }

    #[test]
    fn file_destination_decodes_from_yaml() {
        let yaml = r#"
level: debug
format: json
destination:
  file:
    path: /var/log/beacon.log
"#;
        let config: LoggingConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.format, LogFormat::Json);
        match config.destination {
            LogDestination::File { path } => {
                assert_eq!(path, PathBuf::from("/var/log/beacon.log"));
            }
            other => panic!("expected file destination, got {other:?}"),
        }
    }

    #[test]
    fn stderr_destination_decodes_from_plain_string() {
        let yaml = "destination: stderr";
        let config: LoggingConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(config.destination, LogDestination::Stderr));
    }

    #[test]
    fn start_tolerates_installed_subscriber() {
        // Installing twice must not fail: the second install is a no-op.
        let mut first = LoggingReporter::new(LoggingConfig::default()).unwrap();
        let mut second = LoggingReporter::new(LoggingConfig::default()).unwrap();
        first.start().unwrap();
        second.start().unwrap();
        first.stop();
        second.stop();
    }
}
