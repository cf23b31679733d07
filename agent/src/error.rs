use crate::config::ConfigError;
use crate::notice::notice_error;
use models::telemetry::LoggingError;
use snafu::Snafu;

/// The crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// The crate-wide error type.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    // The assertion type lets us return a Result in cases where we would otherwise use `unwrap()` on results that
    // we know cannot be Err. This lets us bubble up to our error handler which writes to the termination log.
    #[snafu(display("Agent failed due to internal assertion issue: '{}'", message))]
    Assertion { message: String },

    #[snafu(display("Unable to create client: '{}'", source))]
    ClientCreate { source: kube::Error },

    #[snafu(display("Invalid agent configuration: '{}'", source))]
    Config { source: ConfigError },

    #[snafu(display("Unable to drain node '{}': '{}'", node_name, cause))]
    DrainFailed { node_name: String, cause: String },

    #[snafu(display("Unable to create termination notice source: '{}'", source))]
    NoticeSourceCreate { source: notice_error::Error },

    #[snafu(display("Error configuring logging: '{}'", source))]
    TelemetryInit { source: LoggingError },
}
