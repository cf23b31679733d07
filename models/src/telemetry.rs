//! Log output for the agent binary.
//!
//! Events go to standard output through a single `fmt` layer. Three environment variables shape it:
//! `TRACING_FILTER_DIRECTIVE` picks which events are kept (an `EnvFilter` directive, `info` when unset),
//! `LOGGING_FORMATTER` picks the line format and `LOGGING_ANSI_ENABLED` turns terminal colors on.
use serde::Deserialize;
use snafu::ResultExt;
use std::env;
use tracing::Subscriber;
use tracing_subscriber::{
    filter::LevelFilter, fmt, layer::SubscriberExt, registry::LookupSpan, EnvFilter, Layer,
    Registry,
};

const DEFAULT_LEVEL: LevelFilter = LevelFilter::INFO;

const FILTER_ENV_VAR: &str = "TRACING_FILTER_DIRECTIVE";
const FORMAT_ENV_VAR: &str = "LOGGING_FORMATTER";
const ANSI_ENV_VAR: &str = "LOGGING_ANSI_ENABLED";

/// Shape of each log line.
///
/// Names follow the `tracing-subscriber` formatters of the same name.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Full,
    Compact,
    /// Multi-line; meant for a terminal, not a log collector.
    Pretty,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Result<Self> {
        serde_plain::from_str(value).context(error::ParseLogFormatSnafu { value })
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct LogSettings {
    format: LogFormat,
    ansi: bool,
}

impl LogSettings {
    pub fn from_env() -> Result<Self> {
        Self::from_values(
            env::var(FORMAT_ENV_VAR).ok().as_deref(),
            env::var(ANSI_ENV_VAR).ok().as_deref(),
        )
    }

    /// Unset values fall back to full, uncolored lines.
    pub fn from_values(format: Option<&str>, ansi: Option<&str>) -> Result<Self> {
        let format = format.map(LogFormat::parse).transpose()?.unwrap_or_default();
        let ansi = match ansi {
            Some(value) => value
                .to_lowercase()
                .parse()
                .context(error::ParseLogAnsiSnafu { value })?,
            None => false,
        };

        Ok(LogSettings { format, ansi })
    }

    pub fn format(&self) -> LogFormat {
        self.format
    }

    pub fn ansi(&self) -> bool {
        self.ansi
    }

    fn layer<S>(&self) -> Box<dyn Layer<S> + Send + Sync>
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        let layer = fmt::layer().with_ansi(self.ansi);
        match self.format {
            LogFormat::Full => layer.boxed(),
            LogFormat::Compact => layer.compact().boxed(),
            LogFormat::Pretty => layer.pretty().boxed(),
            LogFormat::Json => layer.json().boxed(),
        }
    }
}

/// Installs the process-wide subscriber. Fails if the logging variables are malformed or a subscriber is
/// already installed.
pub fn init_logging_from_env() -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(DEFAULT_LEVEL.into())
        .with_env_var(FILTER_ENV_VAR)
        .from_env_lossy();
    let settings = LogSettings::from_env()?;

    let subscriber = Registry::default().with(filter).with(settings.layer());
    tracing::subscriber::set_global_default(subscriber).context(error::InstallSubscriberSnafu)
}

pub mod error {
    use super::{ANSI_ENV_VAR, FORMAT_ENV_VAR};
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum LoggingError {
        #[snafu(display("Unable to install log subscriber: '{}'", source))]
        InstallSubscriber {
            source: tracing::subscriber::SetGlobalDefaultError,
        },

        #[snafu(display("Unknown log format '{}={}': '{}'", FORMAT_ENV_VAR, value, source))]
        ParseLogFormat {
            value: String,
            source: serde_plain::Error,
        },

        #[snafu(display("Expected true or false for '{}={}': '{}'", ANSI_ENV_VAR, value, source))]
        ParseLogAnsi {
            value: String,
            source: std::str::ParseBoolError,
        },
    }
}

pub use error::LoggingError;
type Result<T> = std::result::Result<T, LoggingError>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_log_settings_defaults() {
        let settings = LogSettings::from_values(None, None).unwrap();
        assert_eq!(settings, LogSettings::default());
        assert_eq!(settings.format(), LogFormat::Full);
        assert!(!settings.ansi());
    }

    #[test]
    fn test_log_settings_from_values() {
        for (format, ansi, expected_format, expected_ansi) in [
            ("full", "false", LogFormat::Full, false),
            ("compact", "TRUE", LogFormat::Compact, true),
            ("pretty", "False", LogFormat::Pretty, false),
            ("json", "true", LogFormat::Json, true),
        ] {
            let settings = LogSettings::from_values(Some(format), Some(ansi)).unwrap();
            assert_eq!(settings.format(), expected_format);
            assert_eq!(settings.ansi(), expected_ansi);
        }
    }

    #[test]
    fn test_log_settings_reject_bad_values() {
        match LogSettings::from_values(Some("yaml"), None) {
            Err(LoggingError::ParseLogFormat { value, .. }) => assert_eq!(value, "yaml"),
            other => panic!("unexpected settings: {:?}", other),
        }
        match LogSettings::from_values(None, Some("yes")) {
            Err(LoggingError::ParseLogAnsi { value, .. }) => assert_eq!(value, "yes"),
            other => panic!("unexpected settings: {:?}", other),
        }
    }
}
